pub mod esewa;
pub mod khalti;
pub mod products;

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::health::{check_health, StoreChecker};
use crate::AppState;

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let report = check_health(
        StoreChecker::new(state.store.clone()),
        &state.checkout.gateway_circuits(),
        state.start_time,
    )
    .await;

    let status_code = if report.status == "unhealthy" {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    (status_code, Json(report))
}

/// Unwraps a JSON body, turning axum's rejection into the error envelope.
pub(crate) fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> AppResult<T> {
    payload.map(|Json(body)| body).map_err(|rejection| {
        if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
            AppError::PayloadTooLarge(rejection.body_text())
        } else {
            AppError::BadRequest(rejection.body_text())
        }
    })
}

pub(crate) fn parse_id(raw: &str, what: &str) -> AppResult<Uuid> {
    Uuid::parse_str(raw.trim()).map_err(|_| AppError::BadRequest(format!("{} must be a UUID", what)))
}
