use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Catalog item. Never mutated once a purchase references it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Product {
    pub id: Uuid,
    pub name: String,
    /// Major currency units (NPR).
    pub price: BigDecimal,
    pub category: String,
    pub created_at: DateTime<Utc>,
}

impl Product {
    pub fn new(name: String, price: BigDecimal, category: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            name,
            price,
            category,
            created_at: Utc::now(),
        }
    }
}
