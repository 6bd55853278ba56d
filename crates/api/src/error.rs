//! API error types and handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use payledger_billing::webhook::ReceiveError;
use payledger_billing::{BillingError, WebhookRejection};

/// Application error type
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Delivery turned away at the door; the sender gets told why
    #[error("{0}")]
    Rejected(#[from] WebhookRejection),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal server error")]
    Internal,
}

impl From<BillingError> for ApiError {
    fn from(error: BillingError) -> Self {
        match error {
            BillingError::Database(e) => ApiError::Database(e.to_string()),
            other => {
                tracing::error!(error = %other, "billing operation failed");
                ApiError::Internal
            }
        }
    }
}

impl From<ReceiveError> for ApiError {
    fn from(error: ReceiveError) -> Self {
        match error {
            ReceiveError::Rejected(rejection) => ApiError::Rejected(rejection),
            ReceiveError::Internal(billing) => billing.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::Rejected(rejection) => (StatusCode::BAD_REQUEST, rejection.to_string()),
            ApiError::Database(detail) => {
                tracing::error!(detail = %detail, "database error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_string(),
                )
            }
            ApiError::Internal => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal server error".to_string(),
            ),
        };

        (status, Json(json!({ "message": message }))).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
