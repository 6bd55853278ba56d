//! Stripe webhook endpoint
//!
//! The body must reach verification byte-for-byte as Stripe sent it, so the
//! handler takes the raw string rather than a typed JSON extractor.

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    Json,
};
use serde_json::{json, Value};

use crate::error::ApiResult;
use crate::state::AppState;

pub async fn receive_stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let signature = headers
        .get("Stripe-Signature")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");

    let event = state.webhooks.receive(&body, signature).await?;

    tracing::info!(
        event_id = %event.id,
        parsed_clean = event.parse_error.is_empty(),
        "webhook accepted"
    );
    Ok((
        StatusCode::CREATED,
        Json(json!({ "id": event.id, "raw_data": event.raw_data })),
    ))
}
