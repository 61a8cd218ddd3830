use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::gateways::GatewayError;
use crate::ports::RepositoryError;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal server error: {0}")]
    Internal(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    /// The gateway's data could not be authenticated.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// The gateway was unreachable or did not confirm the payment.
    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Payload too large: {0}")]
    PayloadTooLarge(String),
}

pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::Upstream(_) => StatusCode::BAD_GATEWAY,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
        }
    }

    /// Message shown to the client. Database and internal details stay in the logs.
    fn public_message(&self) -> String {
        match self {
            AppError::Database(_) => "Database error".to_string(),
            AppError::Internal(_) => "Internal server error".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<RepositoryError> for AppError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::NotFound(what) => AppError::NotFound(what),
            RepositoryError::Conflict(what) => AppError::Conflict(what),
            RepositoryError::Database(e) => AppError::Database(e),
        }
    }
}

impl From<GatewayError> for AppError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::MalformedPayload(msg) => AppError::BadRequest(msg),
            GatewayError::SignatureMismatch(msg) => AppError::Unauthorized(msg),
            GatewayError::Mismatch(msg) => AppError::Unauthorized(msg),
            GatewayError::Request(e) if e.is_timeout() => {
                AppError::Upstream("Payment gateway timed out".to_string())
            }
            GatewayError::Request(_) => AppError::Upstream("Payment gateway is unreachable".to_string()),
            GatewayError::UnexpectedStatus { gateway, status, .. } => {
                AppError::Upstream(format!("{} responded with HTTP {}", gateway, status))
            }
            GatewayError::InvalidResponse(msg) => AppError::Upstream(msg),
            GatewayError::NotConfirmed(msg) => AppError::Upstream(msg),
            GatewayError::Declined { gateway, status } => {
                AppError::Upstream(format!("{} reported the payment as {}", gateway, status))
            }
            GatewayError::CircuitOpen(gateway) => {
                AppError::Upstream(format!("{} is temporarily unavailable", gateway))
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        } else {
            tracing::warn!(error = %self, "Request rejected");
        }

        let body = Json(json!({
            "statusCode": status.as_u16(),
            "data": null,
            "message": self.public_message(),
        }));

        (status, body).into_response()
    }
}
