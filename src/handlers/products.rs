use axum::{
    extract::{rejection::JsonRejection, Path, State},
    Json,
};
use bigdecimal::BigDecimal;
use serde::{Deserialize, Serialize};

use super::{json_body, parse_id};
use crate::domain::Product;
use crate::error::AppResult;
use crate::response::ApiResponse;
use crate::services::checkout::{NewProduct, PurchaseDetails};
use crate::AppState;

#[derive(Debug, Deserialize, Serialize)]
pub struct CreateProduct {
    pub name: String,
    pub price: BigDecimal,
    pub category: String,
}

pub async fn create_product(
    State(state): State<AppState>,
    payload: Result<Json<CreateProduct>, JsonRejection>,
) -> AppResult<ApiResponse<Product>> {
    let body = json_body(payload)?;
    let product = state
        .checkout
        .create_product(NewProduct {
            name: body.name,
            price: body.price,
            category: body.category,
        })
        .await?;

    Ok(ApiResponse::created(product, "Product created successfully."))
}

pub async fn get_product(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<ApiResponse<Product>> {
    let product = state.checkout.get_product(parse_id(&id, "id")?).await?;
    Ok(ApiResponse::ok(product, "Product fetched successfully."))
}

pub async fn get_purchase(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<ApiResponse<PurchaseDetails>> {
    let purchase = state.checkout.get_purchase(parse_id(&id, "id")?).await?;
    Ok(ApiResponse::ok(purchase, "Purchase fetched successfully."))
}
