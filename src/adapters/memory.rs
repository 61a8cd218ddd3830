//! In-process store used by tests and by `serve --in-memory` for local runs.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::domain::{PaymentRecord, Product, PurchaseIntent, PurchaseStatus};
use crate::ports::{
    resolve_collision, Completion, ProductRepository, PurchaseLedger, RepositoryError,
    RepositoryResult,
};

#[derive(Default)]
struct Tables {
    products: HashMap<Uuid, Product>,
    intents: HashMap<Uuid, PurchaseIntent>,
    payments: Vec<PaymentRecord>,
}

/// Single lock over all tables, so `complete_purchase` is atomic.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn payment_count(&self) -> usize {
        self.tables.lock().await.payments.len()
    }
}

#[async_trait]
impl ProductRepository for MemoryStore {
    async fn insert_product(&self, product: &Product) -> RepositoryResult<Product> {
        let mut tables = self.tables.lock().await;
        if tables.products.contains_key(&product.id) {
            return Err(RepositoryError::Conflict(format!(
                "Product {} already exists",
                product.id
            )));
        }
        tables.products.insert(product.id, product.clone());
        Ok(product.clone())
    }

    async fn get_product(&self, id: Uuid) -> RepositoryResult<Product> {
        self.tables
            .lock()
            .await
            .products
            .get(&id)
            .cloned()
            .ok_or_else(|| RepositoryError::NotFound(format!("Product {}", id)))
    }
}

#[async_trait]
impl PurchaseLedger for MemoryStore {
    async fn create_intent(&self, intent: &PurchaseIntent) -> RepositoryResult<PurchaseIntent> {
        let mut tables = self.tables.lock().await;
        if !tables.products.contains_key(&intent.product_id) {
            return Err(RepositoryError::NotFound(format!(
                "Product {}",
                intent.product_id
            )));
        }
        tables.intents.insert(intent.id, intent.clone());
        Ok(intent.clone())
    }

    async fn get_intent(&self, id: Uuid) -> RepositoryResult<PurchaseIntent> {
        self.tables
            .lock()
            .await
            .intents
            .get(&id)
            .cloned()
            .ok_or_else(|| RepositoryError::NotFound(format!("Purchased product {}", id)))
    }

    async fn attach_gateway_reference(
        &self,
        id: Uuid,
        reference: &str,
    ) -> RepositoryResult<PurchaseIntent> {
        let mut tables = self.tables.lock().await;
        if tables
            .intents
            .values()
            .any(|i| i.id != id && i.gateway_reference.as_deref() == Some(reference))
        {
            return Err(RepositoryError::Conflict(format!(
                "Gateway reference {} is already in use",
                reference
            )));
        }

        let intent = tables
            .intents
            .get_mut(&id)
            .ok_or_else(|| RepositoryError::NotFound(format!("Purchased product {}", id)))?;
        if intent.gateway_reference.is_some() || intent.status != PurchaseStatus::Pending {
            return Err(RepositoryError::Conflict(format!(
                "Purchased product {} cannot take a new gateway reference",
                id
            )));
        }

        intent.gateway_reference = Some(reference.to_string());
        intent.updated_at = Utc::now();
        Ok(intent.clone())
    }

    async fn find_payment_for_purchase(
        &self,
        purchase_id: Uuid,
    ) -> RepositoryResult<Option<PaymentRecord>> {
        Ok(self
            .tables
            .lock()
            .await
            .payments
            .iter()
            .find(|p| p.purchase_id == purchase_id)
            .cloned())
    }

    async fn complete_purchase(&self, record: &PaymentRecord) -> RepositoryResult<Completion> {
        let mut tables = self.tables.lock().await;

        let status = tables
            .intents
            .get(&record.purchase_id)
            .map(|intent| intent.status)
            .ok_or_else(|| {
                RepositoryError::NotFound(format!("Purchased product {}", record.purchase_id))
            })?;

        let colliding = tables.payments.iter().find(|p| {
            p.transaction_id == record.transaction_id
                || p.transaction_code == record.transaction_code
                || p.purchase_id == record.purchase_id
        });
        if let Some(existing) = colliding {
            return resolve_collision(existing.clone(), record);
        }

        if !status.can_transition_to(PurchaseStatus::Completed) {
            return Err(RepositoryError::Conflict(format!(
                "Purchased product {} is already {}",
                record.purchase_id, status
            )));
        }

        tables.payments.push(record.clone());
        if let Some(intent) = tables.intents.get_mut(&record.purchase_id) {
            intent.status = PurchaseStatus::Completed;
            intent.updated_at = Utc::now();
        }

        Ok(Completion::Recorded(record.clone()))
    }

    async fn fail_purchase(&self, id: Uuid) -> RepositoryResult<PurchaseStatus> {
        let mut tables = self.tables.lock().await;
        let intent = tables
            .intents
            .get_mut(&id)
            .ok_or_else(|| RepositoryError::NotFound(format!("Purchased product {}", id)))?;

        if intent.status.can_transition_to(PurchaseStatus::Failed) {
            intent.status = PurchaseStatus::Failed;
            intent.updated_at = Utc::now();
        }
        Ok(intent.status)
    }

    async fn ping(&self) -> RepositoryResult<()> {
        Ok(())
    }
}
