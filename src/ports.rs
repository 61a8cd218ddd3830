//! Storage ports used by the checkout service.
//! Implemented by `adapters::postgres` and `adapters::memory`.

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::{PaymentRecord, Product, PurchaseIntent, PurchaseStatus};

#[derive(Error, Debug)]
pub enum RepositoryError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub type RepositoryResult<T> = Result<T, RepositoryError>;

/// Outcome of recording a verified payment.
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    /// The record was inserted and the purchase moved to `completed`.
    Recorded(PaymentRecord),
    /// The same gateway transaction was already recorded for this purchase.
    AlreadyRecorded(PaymentRecord),
}

impl Completion {
    pub fn record(&self) -> &PaymentRecord {
        match self {
            Completion::Recorded(record) | Completion::AlreadyRecorded(record) => record,
        }
    }

    pub fn into_record(self) -> PaymentRecord {
        match self {
            Completion::Recorded(record) | Completion::AlreadyRecorded(record) => record,
        }
    }
}

#[async_trait]
pub trait ProductRepository: Send + Sync {
    async fn insert_product(&self, product: &Product) -> RepositoryResult<Product>;

    async fn get_product(&self, id: Uuid) -> RepositoryResult<Product>;
}

/// Purchase intents plus the payment records that complete them.
#[async_trait]
pub trait PurchaseLedger: Send + Sync {
    async fn create_intent(&self, intent: &PurchaseIntent) -> RepositoryResult<PurchaseIntent>;

    async fn get_intent(&self, id: Uuid) -> RepositoryResult<PurchaseIntent>;

    /// Binds the gateway's payment reference to a pending intent. The
    /// reference can be set once; a second attempt is a `Conflict`.
    async fn attach_gateway_reference(
        &self,
        id: Uuid,
        reference: &str,
    ) -> RepositoryResult<PurchaseIntent>;

    async fn find_payment_for_purchase(
        &self,
        purchase_id: Uuid,
    ) -> RepositoryResult<Option<PaymentRecord>>;

    /// Inserts `record` and moves its purchase `pending -> completed` in one
    /// atomic step.
    ///
    /// A repeat of the same transaction for the same purchase yields
    /// [`Completion::AlreadyRecorded`]. Any other collision on the record's
    /// unique keys, or a purchase that is no longer pending, is a `Conflict`.
    async fn complete_purchase(&self, record: &PaymentRecord) -> RepositoryResult<Completion>;

    /// Moves a pending purchase to `failed`. Returns the status the purchase
    /// holds afterwards; non-pending purchases are left untouched.
    async fn fail_purchase(&self, id: Uuid) -> RepositoryResult<PurchaseStatus>;

    async fn ping(&self) -> RepositoryResult<()>;
}

/// Everything the service needs from storage.
pub trait Store: ProductRepository + PurchaseLedger {}

impl<T: ProductRepository + PurchaseLedger> Store for T {}

/// Decides what an existing payment means for an incoming one that shares a
/// unique key: the same transaction for the same purchase is a replay, anything
/// else conflicts.
pub fn resolve_collision(
    existing: PaymentRecord,
    incoming: &PaymentRecord,
) -> RepositoryResult<Completion> {
    if existing.transaction_id == incoming.transaction_id
        && existing.purchase_id == incoming.purchase_id
        && existing.payment_gateway == incoming.payment_gateway
    {
        tracing::debug!(transaction_id = %existing.transaction_id, "Payment already recorded");
        return Ok(Completion::AlreadyRecorded(existing));
    }

    Err(RepositoryError::Conflict(format!(
        "Purchased product {} already has a different payment recorded",
        incoming.purchase_id
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::PaymentGateway;
    use bigdecimal::BigDecimal;
    use serde_json::json;

    fn record(purchase_id: Uuid, transaction_id: &str) -> PaymentRecord {
        PaymentRecord::success(
            PaymentGateway::Khalti,
            purchase_id,
            "pidx-1".to_string(),
            transaction_id.to_string(),
            BigDecimal::from(500),
            json!({}),
            json!({}),
        )
    }

    #[test]
    fn test_same_transaction_same_purchase_is_replay() {
        let purchase_id = Uuid::new_v4();
        let existing = record(purchase_id, "txn-1");
        let outcome = resolve_collision(existing.clone(), &record(purchase_id, "txn-1")).unwrap();
        assert_eq!(outcome, Completion::AlreadyRecorded(existing));
    }

    #[test]
    fn test_different_transaction_same_purchase_conflicts() {
        let purchase_id = Uuid::new_v4();
        let result = resolve_collision(record(purchase_id, "txn-1"), &record(purchase_id, "txn-2"));
        assert!(matches!(result, Err(RepositoryError::Conflict(_))));
    }

    #[test]
    fn test_same_transaction_other_purchase_conflicts() {
        let result = resolve_collision(
            record(Uuid::new_v4(), "txn-1"),
            &record(Uuid::new_v4(), "txn-1"),
        );
        assert!(matches!(result, Err(RepositoryError::Conflict(_))));
    }
}
