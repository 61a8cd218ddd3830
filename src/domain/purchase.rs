//! Purchase intent entity and its lifecycle.

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::{PaymentGateway, UnknownVariant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PurchaseStatus {
    Pending,
    Completed,
    Failed,
}

impl PurchaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PurchaseStatus::Pending => "pending",
            PurchaseStatus::Completed => "completed",
            PurchaseStatus::Failed => "failed",
        }
    }

    /// Only `pending` may move, and only once.
    pub fn can_transition_to(&self, next: PurchaseStatus) -> bool {
        matches!(
            (self, next),
            (PurchaseStatus::Pending, PurchaseStatus::Completed)
                | (PurchaseStatus::Pending, PurchaseStatus::Failed)
        )
    }
}

impl fmt::Display for PurchaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PurchaseStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PurchaseStatus::Pending),
            "completed" => Ok(PurchaseStatus::Completed),
            "failed" => Ok(PurchaseStatus::Failed),
            other => Err(UnknownVariant {
                kind: "purchase status",
                value: other.to_string(),
            }),
        }
    }
}

/// One attempt to buy one product through one gateway.
///
/// `id` doubles as the correlation id sent to the gateway
/// (eSewa `transaction_uuid`, Khalti `purchase_order_id`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseIntent {
    pub id: Uuid,
    pub product_id: Uuid,
    pub payment_method: PaymentGateway,
    /// Major currency units; equals the product price at creation.
    pub total_price: BigDecimal,
    pub status: PurchaseStatus,
    /// Reference the gateway issued at initiation (Khalti `pidx`). A
    /// callback must present the same value to act on this intent.
    pub gateway_reference: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PurchaseIntent {
    pub fn new(product_id: Uuid, payment_method: PaymentGateway, total_price: BigDecimal) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            product_id,
            payment_method,
            total_price,
            status: PurchaseStatus::Pending,
            gateway_reference: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn correlation_id(&self) -> String {
        self.id.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_intent_is_pending() {
        let intent = PurchaseIntent::new(Uuid::new_v4(), PaymentGateway::Esewa, BigDecimal::from(500));
        assert_eq!(intent.status, PurchaseStatus::Pending);
        assert_eq!(intent.correlation_id(), intent.id.to_string());
    }

    #[test]
    fn test_transitions_never_go_backward() {
        use PurchaseStatus::*;
        assert!(Pending.can_transition_to(Completed));
        assert!(Pending.can_transition_to(Failed));
        assert!(!Completed.can_transition_to(Pending));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Completed));
        assert!(!Pending.can_transition_to(Pending));
    }

    #[test]
    fn test_status_round_trips_through_text() {
        for status in [PurchaseStatus::Pending, PurchaseStatus::Completed, PurchaseStatus::Failed] {
            assert_eq!(status.as_str().parse::<PurchaseStatus>().unwrap(), status);
        }
        assert!("success".parse::<PurchaseStatus>().is_err());
    }
}
