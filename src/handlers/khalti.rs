use axum::{
    extract::{rejection::JsonRejection, Query, State},
    Json,
};
use bigdecimal::BigDecimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::esewa::completion_response;
use super::{json_body, parse_id};
use crate::domain::PaymentRecord;
use crate::error::AppResult;
use crate::gateways::khalti::{KhaltiCallback, KhaltiInitiation};
use crate::response::ApiResponse;
use crate::services::checkout::Initialized;
use crate::AppState;

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializePayment {
    pub product_id: String,
    pub total_price: BigDecimal,
    #[serde(alias = "website_url")]
    pub website_url: String,
}

pub async fn initialize(
    State(state): State<AppState>,
    payload: Result<Json<InitializePayment>, JsonRejection>,
) -> AppResult<ApiResponse<Initialized<KhaltiInitiation>>> {
    let body = json_body(payload)?;
    let product_id = parse_id(&body.product_id, "productId")?;

    let initialized = state
        .checkout
        .initialize_khalti(product_id, &body.total_price, &body.website_url)
        .await?;

    Ok(ApiResponse::ok(
        initialized,
        "Khalti payment initiated successfully.",
    ))
}

pub async fn complete(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
) -> AppResult<ApiResponse<PaymentRecord>> {
    let callback = KhaltiCallback::from_query(&query)?;
    let completion = state.checkout.complete_khalti(callback).await?;
    Ok(completion_response(completion))
}
