use axum::{
    extract::{rejection::JsonRejection, Query, State},
    Json,
};
use bigdecimal::BigDecimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::{json_body, parse_id};
use crate::domain::PaymentRecord;
use crate::error::{AppError, AppResult};
use crate::gateways::esewa::EsewaInitiation;
use crate::ports::Completion;
use crate::response::ApiResponse;
use crate::services::checkout::Initialized;
use crate::AppState;

/// Query names the base64 callback payload may arrive under.
const PAYLOAD_FIELDS: [&str; 2] = ["data", "requestedPaymentData"];

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializePayment {
    pub product_id: String,
    pub total_price: BigDecimal,
}

pub async fn initialize(
    State(state): State<AppState>,
    payload: Result<Json<InitializePayment>, JsonRejection>,
) -> AppResult<ApiResponse<Initialized<EsewaInitiation>>> {
    let body = json_body(payload)?;
    let product_id = parse_id(&body.product_id, "productId")?;

    let initialized = state
        .checkout
        .initialize_esewa(product_id, &body.total_price)
        .await?;

    Ok(ApiResponse::ok(
        initialized,
        "Esewa payment initialized successfully.",
    ))
}

pub async fn complete(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
) -> AppResult<ApiResponse<PaymentRecord>> {
    let encoded = PAYLOAD_FIELDS
        .iter()
        .find_map(|name| query.get(*name))
        .filter(|value| !value.trim().is_empty())
        .ok_or_else(|| AppError::BadRequest("Payment data is required".to_string()))?;

    let raw_query = serde_json::to_value(&query).unwrap_or_default();
    let completion = state.checkout.complete_esewa(encoded, raw_query).await?;

    Ok(completion_response(completion))
}

pub(crate) fn completion_response(completion: Completion) -> ApiResponse<PaymentRecord> {
    match completion {
        Completion::Recorded(record) => {
            ApiResponse::ok(record, "Payment completed successfully.")
        }
        Completion::AlreadyRecorded(record) => {
            ApiResponse::ok(record, "Payment was already recorded.")
        }
    }
}
