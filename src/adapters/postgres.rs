//! Postgres implementation of the storage ports.

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction as SqlxTransaction};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::{
    PaymentGateway, PaymentRecord, PaymentStatus, Product, PurchaseIntent, PurchaseStatus,
    UnknownVariant,
};
use crate::ports::{
    resolve_collision, Completion, ProductRepository, PurchaseLedger, RepositoryError,
    RepositoryResult,
};

const INTENT_COLUMNS: &str = "id, product_id, payment_method, total_price, status, \
     gateway_reference, created_at, updated_at";

const PAYMENT_COLUMNS: &str = "id, transaction_code, transaction_id, purchase_id, amount, \
     verification_response, callback_payload, payment_gateway, status, created_at";

/// Postgres-backed product catalog and purchase ledger.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl ProductRepository for PostgresStore {
    async fn insert_product(&self, product: &Product) -> RepositoryResult<Product> {
        let row = sqlx::query_as::<_, ProductRow>(
            r#"
            INSERT INTO products (id, name, price, category, created_at)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, name, price, category, created_at
            "#,
        )
        .bind(product.id)
        .bind(&product.name)
        .bind(&product.price)
        .bind(&product.category)
        .bind(product.created_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.into_domain())
    }

    async fn get_product(&self, id: Uuid) -> RepositoryResult<Product> {
        let row = sqlx::query_as::<_, ProductRow>(
            "SELECT id, name, price, category, created_at FROM products WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(ProductRow::into_domain)
            .ok_or_else(|| RepositoryError::NotFound(format!("Product {}", id)))
    }
}

#[async_trait]
impl PurchaseLedger for PostgresStore {
    async fn create_intent(&self, intent: &PurchaseIntent) -> RepositoryResult<PurchaseIntent> {
        let row = sqlx::query_as::<_, IntentRow>(&format!(
            r#"
            INSERT INTO purchased_products ({columns})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING {columns}
            "#,
            columns = INTENT_COLUMNS
        ))
        .bind(intent.id)
        .bind(intent.product_id)
        .bind(intent.payment_method.as_str())
        .bind(&intent.total_price)
        .bind(intent.status.as_str())
        .bind(&intent.gateway_reference)
        .bind(intent.created_at)
        .bind(intent.updated_at)
        .fetch_one(&self.pool)
        .await?;

        row.into_domain()
    }

    async fn get_intent(&self, id: Uuid) -> RepositoryResult<PurchaseIntent> {
        let row = sqlx::query_as::<_, IntentRow>(&format!(
            "SELECT {} FROM purchased_products WHERE id = $1",
            INTENT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.ok_or_else(|| RepositoryError::NotFound(format!("Purchased product {}", id)))?
            .into_domain()
    }

    async fn attach_gateway_reference(
        &self,
        id: Uuid,
        reference: &str,
    ) -> RepositoryResult<PurchaseIntent> {
        let row = sqlx::query_as::<_, IntentRow>(&format!(
            r#"
            UPDATE purchased_products
            SET gateway_reference = $2, updated_at = NOW()
            WHERE id = $1 AND status = 'pending' AND gateway_reference IS NULL
            RETURNING {}
            "#,
            INTENT_COLUMNS
        ))
        .bind(id)
        .bind(reference)
        .fetch_optional(&self.pool)
        .await;

        match row {
            Ok(Some(row)) => row.into_domain(),
            Ok(None) => {
                // Distinguish a missing intent from one that is not eligible.
                self.get_intent(id).await?;
                Err(RepositoryError::Conflict(format!(
                    "Purchased product {} cannot take a new gateway reference",
                    id
                )))
            }
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(RepositoryError::Conflict(format!(
                    "Gateway reference {} is already in use",
                    reference
                )))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn find_payment_for_purchase(
        &self,
        purchase_id: Uuid,
    ) -> RepositoryResult<Option<PaymentRecord>> {
        let row = sqlx::query_as::<_, PaymentRow>(&format!(
            "SELECT {} FROM payments WHERE purchase_id = $1",
            PAYMENT_COLUMNS
        ))
        .bind(purchase_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(PaymentRow::into_domain).transpose()
    }

    async fn complete_purchase(&self, record: &PaymentRecord) -> RepositoryResult<Completion> {
        let mut tx = self.pool.begin().await?;

        // Serializes concurrent callbacks for the same purchase.
        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM purchased_products WHERE id = $1 FOR UPDATE")
                .bind(record.purchase_id)
                .fetch_optional(&mut *tx)
                .await?;
        let status: PurchaseStatus = status
            .ok_or_else(|| {
                RepositoryError::NotFound(format!("Purchased product {}", record.purchase_id))
            })?
            .parse()
            .map_err(decode_error)?;

        if let Some(existing) = find_colliding_payment(&mut tx, record).await? {
            return resolve_collision(existing, record);
        }

        if !status.can_transition_to(PurchaseStatus::Completed) {
            return Err(RepositoryError::Conflict(format!(
                "Purchased product {} is already {}",
                record.purchase_id, status
            )));
        }

        let inserted = sqlx::query_as::<_, PaymentRow>(&format!(
            r#"
            INSERT INTO payments ({columns})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT DO NOTHING
            RETURNING {columns}
            "#,
            columns = PAYMENT_COLUMNS
        ))
        .bind(record.id)
        .bind(&record.transaction_code)
        .bind(&record.transaction_id)
        .bind(record.purchase_id)
        .bind(&record.amount)
        .bind(&record.verification_response)
        .bind(&record.callback_payload)
        .bind(record.payment_gateway.as_str())
        .bind(record.status.as_str())
        .bind(record.created_at)
        .fetch_optional(&mut *tx)
        .await?;

        let inserted = match inserted {
            Some(row) => row.into_domain()?,
            None => {
                // Another purchase's callback claimed one of the unique keys first.
                warn!(
                    transaction_id = %record.transaction_id,
                    "Payment insert lost a uniqueness race"
                );
                return match find_colliding_payment(&mut tx, record).await? {
                    Some(existing) => resolve_collision(existing, record),
                    None => Err(RepositoryError::Conflict(format!(
                        "Payment {} could not be recorded",
                        record.transaction_id
                    ))),
                };
            }
        };

        sqlx::query(
            "UPDATE purchased_products SET status = $1, updated_at = NOW() WHERE id = $2",
        )
        .bind(PurchaseStatus::Completed.as_str())
        .bind(record.purchase_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        info!(
            purchase_id = %record.purchase_id,
            transaction_id = %record.transaction_id,
            gateway = %record.payment_gateway,
            "Payment recorded and purchase completed"
        );
        Ok(Completion::Recorded(inserted))
    }

    async fn fail_purchase(&self, id: Uuid) -> RepositoryResult<PurchaseStatus> {
        let status: Option<String> = sqlx::query_scalar(
            r#"
            UPDATE purchased_products
            SET status = CASE WHEN status = 'pending' THEN 'failed' ELSE status END,
                updated_at = CASE WHEN status = 'pending' THEN NOW() ELSE updated_at END
            WHERE id = $1
            RETURNING status
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        let status = status
            .ok_or_else(|| RepositoryError::NotFound(format!("Purchased product {}", id)))?;
        debug!(purchase_id = %id, status = %status, "Purchase failure applied");
        status.parse().map_err(decode_error)
    }

    async fn ping(&self) -> RepositoryResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

async fn find_colliding_payment(
    tx: &mut SqlxTransaction<'_, Postgres>,
    record: &PaymentRecord,
) -> RepositoryResult<Option<PaymentRecord>> {
    let row = sqlx::query_as::<_, PaymentRow>(&format!(
        r#"
        SELECT {} FROM payments
        WHERE transaction_id = $1 OR transaction_code = $2 OR purchase_id = $3
        LIMIT 1
        "#,
        PAYMENT_COLUMNS
    ))
    .bind(&record.transaction_id)
    .bind(&record.transaction_code)
    .bind(record.purchase_id)
    .fetch_optional(&mut **tx)
    .await?;

    row.map(PaymentRow::into_domain).transpose()
}

fn decode_error(err: UnknownVariant) -> RepositoryError {
    RepositoryError::Database(sqlx::Error::Decode(Box::new(err)))
}

/// Internal row types for SQLx. Not exposed outside the adapter.
#[derive(Debug, sqlx::FromRow)]
struct ProductRow {
    id: Uuid,
    name: String,
    price: BigDecimal,
    category: String,
    created_at: DateTime<Utc>,
}

impl ProductRow {
    fn into_domain(self) -> Product {
        Product {
            id: self.id,
            name: self.name,
            price: self.price,
            category: self.category,
            created_at: self.created_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct IntentRow {
    id: Uuid,
    product_id: Uuid,
    payment_method: String,
    total_price: BigDecimal,
    status: String,
    gateway_reference: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl IntentRow {
    fn into_domain(self) -> RepositoryResult<PurchaseIntent> {
        Ok(PurchaseIntent {
            id: self.id,
            product_id: self.product_id,
            payment_method: self.payment_method.parse::<PaymentGateway>().map_err(decode_error)?,
            total_price: self.total_price,
            status: self.status.parse::<PurchaseStatus>().map_err(decode_error)?,
            gateway_reference: self.gateway_reference,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct PaymentRow {
    id: Uuid,
    transaction_code: String,
    transaction_id: String,
    purchase_id: Uuid,
    amount: BigDecimal,
    verification_response: serde_json::Value,
    callback_payload: serde_json::Value,
    payment_gateway: String,
    status: String,
    created_at: DateTime<Utc>,
}

impl PaymentRow {
    fn into_domain(self) -> RepositoryResult<PaymentRecord> {
        Ok(PaymentRecord {
            id: self.id,
            transaction_code: self.transaction_code,
            transaction_id: self.transaction_id,
            purchase_id: self.purchase_id,
            amount: self.amount,
            verification_response: self.verification_response,
            callback_payload: self.callback_payload,
            payment_gateway: self.payment_gateway.parse::<PaymentGateway>().map_err(decode_error)?,
            status: self.status.parse::<PaymentStatus>().map_err(decode_error)?,
            created_at: self.created_at,
        })
    }
}
