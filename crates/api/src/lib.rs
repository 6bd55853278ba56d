//! Payledger API server components

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

pub mod error;
pub mod routes;
pub mod state;

pub use error::{ApiError, ApiResult};
pub use state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(routes::health::health))
        .route(
            "/stripe/webhooks",
            post(routes::webhooks::receive_stripe_webhook),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
