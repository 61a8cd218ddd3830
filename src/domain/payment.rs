//! Payment record entity.

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::UnknownVariant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentGateway {
    Esewa,
    Khalti,
}

impl PaymentGateway {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentGateway::Esewa => "esewa",
            PaymentGateway::Khalti => "khalti",
        }
    }
}

impl fmt::Display for PaymentGateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentGateway {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "esewa" => Ok(PaymentGateway::Esewa),
            "khalti" => Ok(PaymentGateway::Khalti),
            other => Err(UnknownVariant {
                kind: "payment gateway",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Success,
    Pending,
    Failed,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Success => "success",
            PaymentStatus::Pending => "pending",
            PaymentStatus::Failed => "failed",
        }
    }
}

impl FromStr for PaymentStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(PaymentStatus::Success),
            "pending" => Ok(PaymentStatus::Pending),
            "failed" => Ok(PaymentStatus::Failed),
            other => Err(UnknownVariant {
                kind: "payment status",
                value: other.to_string(),
            }),
        }
    }
}

/// Immutable audit entry for one verified transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRecord {
    pub id: Uuid,
    /// eSewa `transaction_code` or Khalti `pidx`.
    pub transaction_code: String,
    /// eSewa `transaction_uuid` or Khalti `transaction_id`. Unique.
    pub transaction_id: String,
    pub purchase_id: Uuid,
    /// Major currency units.
    pub amount: BigDecimal,
    pub verification_response: serde_json::Value,
    pub callback_payload: serde_json::Value,
    pub payment_gateway: PaymentGateway,
    pub status: PaymentStatus,
    pub created_at: DateTime<Utc>,
}

impl PaymentRecord {
    pub fn success(
        gateway: PaymentGateway,
        purchase_id: Uuid,
        transaction_code: String,
        transaction_id: String,
        amount: BigDecimal,
        verification_response: serde_json::Value,
        callback_payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            transaction_code,
            transaction_id,
            purchase_id,
            amount,
            verification_response,
            callback_payload,
            payment_gateway: gateway,
            status: PaymentStatus::Success,
            created_at: Utc::now(),
        }
    }
}
