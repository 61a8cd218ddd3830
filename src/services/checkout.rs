//! Purchase lifecycle across both gateways.
//!
//! `initialize_*` prices the product server-side, records a pending intent and
//! hands the gateway payload back to the storefront. `complete_*` authenticates
//! the gateway's callback, cross-checks it against the intent and settles the
//! intent with exactly one payment record.

use bigdecimal::BigDecimal;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::domain::money::{from_minor_units, to_minor_units, validate_price};
use crate::domain::{PaymentGateway, PaymentRecord, Product, PurchaseIntent};
use crate::error::{AppError, AppResult};
use crate::gateways::esewa::EsewaInitiation;
use crate::gateways::khalti::{KhaltiCallback, KhaltiInitiateRequest, KhaltiInitiation};
use crate::gateways::{EsewaGateway, GatewayError, KhaltiGateway};
use crate::ports::{Completion, Store};

pub const ESEWA_COMPLETE_PATH: &str = "/payment-esewa/complete";
pub const KHALTI_COMPLETE_PATH: &str = "/payment-khalti/complete";

/// Where gateways send the buyer back to.
#[derive(Debug, Clone)]
pub struct RedirectUrls {
    pub esewa_success: String,
    pub esewa_failure: String,
    pub khalti_return: String,
}

impl RedirectUrls {
    pub fn from_config(config: &Config) -> Self {
        Self {
            esewa_success: config.callback_url(ESEWA_COMPLETE_PATH),
            esewa_failure: config.storefront_url.clone(),
            khalti_return: config.callback_url(KHALTI_COMPLETE_PATH),
        }
    }
}

#[derive(Debug)]
pub struct NewProduct {
    pub name: String,
    pub price: BigDecimal,
    pub category: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Initialized<P> {
    pub payment: P,
    pub purchased_product: PurchaseIntent,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseDetails {
    pub purchased_product: PurchaseIntent,
    pub payment: Option<PaymentRecord>,
}

pub struct CheckoutService {
    store: Arc<dyn Store>,
    esewa: EsewaGateway,
    khalti: KhaltiGateway,
    urls: RedirectUrls,
}

impl CheckoutService {
    pub fn new(
        store: Arc<dyn Store>,
        esewa: EsewaGateway,
        khalti: KhaltiGateway,
        urls: RedirectUrls,
    ) -> Self {
        Self {
            store,
            esewa,
            khalti,
            urls,
        }
    }

    pub fn gateway_circuits(&self) -> [(&'static str, &'static str); 2] {
        [
            ("esewa", self.esewa.circuit_state()),
            ("khalti", self.khalti.circuit_state()),
        ]
    }

    pub async fn create_product(&self, input: NewProduct) -> AppResult<Product> {
        let name = input.name.trim();
        let category = input.category.trim();
        if name.is_empty() || category.is_empty() {
            return Err(AppError::Validation(
                "name, price and category are required".to_string(),
            ));
        }
        validate_price(&input.price).map_err(|e| AppError::Validation(format!("price {}", e)))?;

        let product = Product::new(name.to_string(), input.price, category.to_string());
        let product = self.store.insert_product(&product).await?;
        info!(product_id = %product.id, "Product created");
        Ok(product)
    }

    pub async fn get_product(&self, id: Uuid) -> AppResult<Product> {
        Ok(self.store.get_product(id).await?)
    }

    pub async fn get_purchase(&self, id: Uuid) -> AppResult<PurchaseDetails> {
        let purchased_product = self.store.get_intent(id).await?;
        let payment = self.store.find_payment_for_purchase(id).await?;
        Ok(PurchaseDetails {
            purchased_product,
            payment,
        })
    }

    pub async fn initialize_esewa(
        &self,
        product_id: Uuid,
        total_price: &BigDecimal,
    ) -> AppResult<Initialized<EsewaInitiation>> {
        let intent = self
            .open_intent(product_id, total_price, PaymentGateway::Esewa)
            .await?;

        let payment = self.esewa.initialize(
            &intent.total_price,
            &intent.correlation_id(),
            &self.urls.esewa_success,
            &self.urls.esewa_failure,
        );

        Ok(Initialized {
            payment,
            purchased_product: intent,
        })
    }

    pub async fn initialize_khalti(
        &self,
        product_id: Uuid,
        total_price: &BigDecimal,
        website_url: &str,
    ) -> AppResult<Initialized<KhaltiInitiation>> {
        url::Url::parse(website_url)
            .map_err(|_| AppError::Validation("websiteUrl must be a valid URL".to_string()))?;

        let product = self.priced_product(product_id, total_price).await?;
        let amount = to_minor_units(&product.price).ok_or_else(|| {
            AppError::Validation("price cannot be expressed in paisa".to_string())
        })?;

        let intent = self
            .store
            .create_intent(&PurchaseIntent::new(
                product.id,
                PaymentGateway::Khalti,
                product.price.clone(),
            ))
            .await?;

        let request = KhaltiInitiateRequest {
            return_url: self.urls.khalti_return.clone(),
            website_url: website_url.to_string(),
            amount,
            purchase_order_id: intent.correlation_id(),
            purchase_order_name: product.name.clone(),
        };

        // A failed initiation leaves the intent pending.
        let payment = self.khalti.initialize(&request).await.map_err(|e| {
            warn!(purchase_id = %intent.id, error = %e, "Khalti initiation failed");
            AppError::from(e)
        })?;
        let intent = self
            .store
            .attach_gateway_reference(intent.id, &payment.pidx)
            .await?;
        info!(purchase_id = %intent.id, pidx = %payment.pidx, "Khalti payment initiated");

        Ok(Initialized {
            payment,
            purchased_product: intent,
        })
    }

    /// Settles an eSewa purchase from the base64 `data` the gateway redirected with.
    pub async fn complete_esewa(&self, encoded: &str, query: Value) -> AppResult<Completion> {
        let callback = self.esewa.authenticate(encoded)?;
        let purchase_id = parse_correlation_id(&callback.transaction_uuid)?;

        let verification = match self.esewa.confirm(callback).await {
            Ok(v) => v,
            Err(e) => return Err(self.reject(purchase_id, PaymentGateway::Esewa, e).await),
        };

        let intent = self.store.get_intent(purchase_id).await?;
        ensure_gateway(&intent, PaymentGateway::Esewa)?;
        if verification.callback.total_amount != intent.total_price {
            return Err(AppError::Upstream(
                "Confirmed amount does not match the purchase".to_string(),
            ));
        }

        let callback = verification.callback;
        let record = PaymentRecord::success(
            PaymentGateway::Esewa,
            purchase_id,
            callback.transaction_code,
            callback.transaction_uuid,
            intent.total_price,
            verification.status_raw,
            json!({ "query": query, "decoded": callback.raw }),
        );

        self.settle(record).await
    }

    /// Settles a Khalti purchase from the return-URL query.
    ///
    /// The query's `purchase_order_id` is untrusted: the intent it names must
    /// carry the `pidx` issued for it at initiation before anything else happens.
    pub async fn complete_khalti(&self, callback: KhaltiCallback) -> AppResult<Completion> {
        let purchase_id = parse_correlation_id(&callback.purchase_order_id)?;
        let intent = self.store.get_intent(purchase_id).await?;
        ensure_gateway(&intent, PaymentGateway::Khalti)?;
        if intent.gateway_reference.as_deref() != Some(callback.pidx.as_str()) {
            warn!(
                purchase_id = %purchase_id,
                pidx = %callback.pidx,
                "Khalti pidx was not issued for this purchase"
            );
            return Err(AppError::Unauthorized(
                "Payment reference does not belong to this purchase".to_string(),
            ));
        }

        let verification = match self
            .khalti
            .verify(&callback.pidx, &callback.transaction_id)
            .await
        {
            Ok(v) => v,
            Err(e) => return Err(self.reject(purchase_id, PaymentGateway::Khalti, e).await),
        };

        let expected = to_minor_units(&intent.total_price).ok_or_else(|| {
            AppError::Internal(format!("purchase {} has a sub-paisa price", intent.id))
        })?;
        if verification.lookup.total_amount != expected
            || callback.amount.map_or(false, |claimed| claimed != expected)
        {
            return Err(AppError::Upstream(
                "Confirmed amount does not match the purchase".to_string(),
            ));
        }

        let record = PaymentRecord::success(
            PaymentGateway::Khalti,
            purchase_id,
            callback.pidx,
            callback.transaction_id,
            from_minor_units(verification.lookup.total_amount),
            verification.lookup_raw,
            callback.raw,
        );

        self.settle(record).await
    }

    async fn priced_product(&self, product_id: Uuid, total_price: &BigDecimal) -> AppResult<Product> {
        let product = self
            .store
            .get_product(product_id)
            .await
            .map_err(AppError::from)?;
        if &product.price != total_price {
            warn!(product_id = %product_id, "Checkout price does not match product price");
            return Err(AppError::NotFound("Product not found".to_string()));
        }
        Ok(product)
    }

    async fn open_intent(
        &self,
        product_id: Uuid,
        total_price: &BigDecimal,
        gateway: PaymentGateway,
    ) -> AppResult<PurchaseIntent> {
        let product = self.priced_product(product_id, total_price).await?;
        let intent = self
            .store
            .create_intent(&PurchaseIntent::new(product.id, gateway, product.price))
            .await?;
        info!(purchase_id = %intent.id, gateway = %gateway, "Purchase intent created");
        Ok(intent)
    }

    async fn settle(&self, record: PaymentRecord) -> AppResult<Completion> {
        let completion = self.store.complete_purchase(&record).await?;
        if let Completion::AlreadyRecorded(existing) = &completion {
            info!(
                purchase_id = %existing.purchase_id,
                transaction_id = %existing.transaction_id,
                "Duplicate callback resolved to existing payment"
            );
        }
        Ok(completion)
    }

    /// Maps a verification failure, first failing the intent when the gateway
    /// reports a terminal decline.
    async fn reject(&self, purchase_id: Uuid, gateway: PaymentGateway, err: GatewayError) -> AppError {
        if err.is_declined() {
            match self.store.get_intent(purchase_id).await {
                Ok(intent) if intent.payment_method == gateway => {
                    match self.store.fail_purchase(purchase_id).await {
                        Ok(status) => {
                            info!(purchase_id = %purchase_id, status = %status, "Declined purchase marked")
                        }
                        Err(e) => warn!(purchase_id = %purchase_id, error = %e, "Could not fail purchase"),
                    }
                }
                Ok(_) => warn!(purchase_id = %purchase_id, "Decline names a purchase on another gateway"),
                Err(e) => warn!(purchase_id = %purchase_id, error = %e, "Declined purchase not found"),
            }
        }
        AppError::from(err)
    }
}

fn parse_correlation_id(raw: &str) -> AppResult<Uuid> {
    Uuid::parse_str(raw)
        .map_err(|_| AppError::BadRequest(format!("Unknown purchase reference {}", raw)))
}

fn ensure_gateway(intent: &PurchaseIntent, gateway: PaymentGateway) -> AppResult<()> {
    if intent.payment_method != gateway {
        return Err(AppError::Upstream(format!(
            "Purchase was started with {}, not {}",
            intent.payment_method, gateway
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MemoryStore;
    use crate::config::{EsewaConfig, KhaltiConfig};
    use crate::ports::{ProductRepository, PurchaseLedger};
    use crate::domain::PurchaseStatus;
    use crate::gateways::esewa::tests::{encode, signed_callback, SECRET};
    use mockito::{Matcher, Server};
    use std::collections::HashMap;
    use std::time::Duration;

    struct Harness {
        service: CheckoutService,
        store: Arc<MemoryStore>,
        product: Product,
    }

    async fn harness(esewa_url: &str, khalti_url: &str) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let product = Product::new("Notebook".into(), BigDecimal::from(500), "stationery".into());
        store.insert_product(&product).await.unwrap();

        let esewa = EsewaGateway::new(
            EsewaConfig {
                gateway_url: esewa_url.to_string(),
                status_url: esewa_url.to_string(),
                product_code: "EPAYTEST".to_string(),
                secret_key: SECRET.to_string(),
            },
            Duration::from_secs(5),
        )
        .unwrap();
        let khalti = KhaltiGateway::new(
            KhaltiConfig {
                gateway_url: khalti_url.to_string(),
                secret_key: "test_secret_key".to_string(),
            },
            Duration::from_secs(5),
        )
        .unwrap();

        let service = CheckoutService::new(
            store.clone(),
            esewa,
            khalti,
            RedirectUrls {
                esewa_success: "http://localhost:8000/payment-esewa/complete".to_string(),
                esewa_failure: "http://localhost:3000".to_string(),
                khalti_return: "http://localhost:8000/payment-khalti/complete".to_string(),
            },
        );

        Harness {
            service,
            store,
            product,
        }
    }

    async fn mock_esewa_status(server: &mut Server, uuid: &str, amount: &str, status: &str) -> mockito::Mock {
        server
            .mock("GET", "/api/epay/transaction/status/")
            .match_query(Matcher::UrlEncoded("transaction_uuid".into(), uuid.into()))
            .with_status(200)
            .with_body(format!(
                r#"{{"product_code":"EPAYTEST","transaction_uuid":"{}","total_amount":{},"status":"{}","ref_id":"0001TS9"}}"#,
                uuid, amount, status
            ))
            .create_async()
            .await
    }

    fn khalti_query(pidx: &str, transaction_id: &str, order: &str, amount: &str) -> KhaltiCallback {
        let query: HashMap<String, String> = [
            ("pidx", pidx),
            ("transaction_id", transaction_id),
            ("amount", amount),
            ("purchase_order_id", order),
            ("purchase_order_name", "Notebook"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        KhaltiCallback::from_query(&query).unwrap()
    }

    #[tokio::test]
    async fn test_initialize_rejects_tampered_price() {
        let h = harness("http://unused", "http://unused").await;
        let result = h
            .service
            .initialize_esewa(h.product.id, &BigDecimal::from(1))
            .await;
        assert!(matches!(result, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_initialize_unknown_product() {
        let h = harness("http://unused", "http://unused").await;
        let result = h
            .service
            .initialize_esewa(Uuid::new_v4(), &BigDecimal::from(500))
            .await;
        assert!(matches!(result, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_esewa_happy_path_completes_once() {
        let mut server = Server::new_async().await;
        let h = harness(&server.url(), "http://unused").await;

        let init = h
            .service
            .initialize_esewa(h.product.id, &BigDecimal::from(500))
            .await
            .unwrap();
        assert_eq!(init.purchased_product.status, PurchaseStatus::Pending);
        assert!(!init.payment.signature.is_empty());

        let uuid = init.purchased_product.correlation_id();
        let _status = mock_esewa_status(&mut server, &uuid, "500.0", "COMPLETE").await;
        let data = encode(&signed_callback(SECRET, &uuid, "500.0", "000AWEO"));

        let first = h.service.complete_esewa(&data, json!({})).await.unwrap();
        assert!(matches!(first, Completion::Recorded(_)));
        assert_eq!(first.record().transaction_code, "000AWEO");

        let second = h.service.complete_esewa(&data, json!({})).await.unwrap();
        assert!(matches!(second, Completion::AlreadyRecorded(_)));
        assert_eq!(second.record().id, first.record().id);
        assert_eq!(h.store.payment_count().await, 1);

        let purchase = h.service.get_purchase(init.purchased_product.id).await.unwrap();
        assert_eq!(purchase.purchased_product.status, PurchaseStatus::Completed);
    }

    #[tokio::test]
    async fn test_esewa_lookup_mismatch_leaves_intent_pending() {
        let mut server = Server::new_async().await;
        let h = harness(&server.url(), "http://unused").await;
        let init = h
            .service
            .initialize_esewa(h.product.id, &BigDecimal::from(500))
            .await
            .unwrap();
        let uuid = init.purchased_product.correlation_id();

        let _status = server
            .mock("GET", "/api/epay/transaction/status/")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"transaction_uuid":"another","total_amount":500.0,"status":"COMPLETE"}"#)
            .create_async()
            .await;
        let data = encode(&signed_callback(SECRET, &uuid, "500.0", "000AWEO"));

        let result = h.service.complete_esewa(&data, json!({})).await;
        assert!(matches!(result, Err(AppError::Upstream(_))));

        let intent = h.store.get_intent(init.purchased_product.id).await.unwrap();
        assert_eq!(intent.status, PurchaseStatus::Pending);
        assert_eq!(h.store.payment_count().await, 0);
    }

    #[tokio::test]
    async fn test_esewa_signed_amount_must_match_intent() {
        let mut server = Server::new_async().await;
        let h = harness(&server.url(), "http://unused").await;
        let init = h
            .service
            .initialize_esewa(h.product.id, &BigDecimal::from(500))
            .await
            .unwrap();
        let uuid = init.purchased_product.correlation_id();

        // Correctly signed and confirmed, but for a different amount than the intent.
        let _status = mock_esewa_status(&mut server, &uuid, "5.0", "COMPLETE").await;
        let data = encode(&signed_callback(SECRET, &uuid, "5.0", "000AWEO"));

        let result = h.service.complete_esewa(&data, json!({})).await;
        assert!(matches!(result, Err(AppError::Upstream(_))));
        assert_eq!(h.store.payment_count().await, 0);
    }

    #[tokio::test]
    async fn test_esewa_cancellation_fails_intent() {
        let mut server = Server::new_async().await;
        let h = harness(&server.url(), "http://unused").await;
        let init = h
            .service
            .initialize_esewa(h.product.id, &BigDecimal::from(500))
            .await
            .unwrap();
        let uuid = init.purchased_product.correlation_id();

        let _status = mock_esewa_status(&mut server, &uuid, "500.0", "CANCELED").await;
        let data = encode(&signed_callback(SECRET, &uuid, "500.0", "000AWEO"));

        let result = h.service.complete_esewa(&data, json!({})).await;
        assert!(matches!(result, Err(AppError::Upstream(_))));

        let intent = h.store.get_intent(init.purchased_product.id).await.unwrap();
        assert_eq!(intent.status, PurchaseStatus::Failed);
    }

    #[tokio::test]
    async fn test_khalti_converts_to_paisa_once() {
        let mut server = Server::new_async().await;
        let h = harness("http://unused", &server.url()).await;

        let initiate = server
            .mock("POST", "/initiate/")
            .match_body(Matcher::PartialJson(json!({
                "amount": 50000,
                "purchase_order_name": "Notebook",
                "return_url": "http://localhost:8000/payment-khalti/complete",
                "website_url": "http://localhost:3000"
            })))
            .with_status(200)
            .with_body(r#"{"pidx":"HT6o6PEZRWFJ5ygavzHWd5","payment_url":"https://pay.khalti.com/?pidx=HT6o6PEZRWFJ5ygavzHWd5"}"#)
            .create_async()
            .await;

        let init = h
            .service
            .initialize_khalti(h.product.id, &BigDecimal::from(500), "http://localhost:3000")
            .await
            .unwrap();

        initiate.assert_async().await;
        assert_eq!(init.purchased_product.total_price, BigDecimal::from(500));
        assert_eq!(init.payment.pidx, "HT6o6PEZRWFJ5ygavzHWd5");
    }

    #[tokio::test]
    async fn test_khalti_happy_path_records_major_units() {
        let mut server = Server::new_async().await;
        let h = harness("http://unused", &server.url()).await;
        let _initiate = server
            .mock("POST", "/initiate/")
            .with_status(200)
            .with_body(r#"{"pidx":"HT6o6PEZRWFJ5ygavzHWd5","payment_url":"https://pay.khalti.com/"}"#)
            .create_async()
            .await;
        let _lookup = server
            .mock("POST", "/lookup/")
            .with_status(200)
            .with_body(
                r#"{"pidx":"HT6o6PEZRWFJ5ygavzHWd5","total_amount":50000,"status":"Completed","transaction_id":"GFq9PFS7b2iYvL8Lir9oXe","fee":0,"refunded":false}"#,
            )
            .create_async()
            .await;

        let init = h
            .service
            .initialize_khalti(h.product.id, &BigDecimal::from(500), "http://localhost:3000")
            .await
            .unwrap();
        let order = init.purchased_product.correlation_id();

        let completion = h
            .service
            .complete_khalti(khalti_query("HT6o6PEZRWFJ5ygavzHWd5", "GFq9PFS7b2iYvL8Lir9oXe", &order, "50000"))
            .await
            .unwrap();

        let record = completion.into_record();
        assert_eq!(record.amount, BigDecimal::from(500));
        assert_eq!(record.transaction_code, "HT6o6PEZRWFJ5ygavzHWd5");
        assert_eq!(record.transaction_id, "GFq9PFS7b2iYvL8Lir9oXe");
    }

    #[tokio::test]
    async fn test_khalti_forged_transaction_is_unauthorized() {
        let mut server = Server::new_async().await;
        let h = harness("http://unused", &server.url()).await;
        let _initiate = server
            .mock("POST", "/initiate/")
            .with_status(200)
            .with_body(r#"{"pidx":"HT6o6PEZRWFJ5ygavzHWd5","payment_url":"https://pay.khalti.com/"}"#)
            .create_async()
            .await;
        let _lookup = server
            .mock("POST", "/lookup/")
            .with_status(200)
            .with_body(
                r#"{"pidx":"HT6o6PEZRWFJ5ygavzHWd5","total_amount":50000,"status":"Completed","transaction_id":"GFq9PFS7b2iYvL8Lir9oXe"}"#,
            )
            .create_async()
            .await;

        let init = h
            .service
            .initialize_khalti(h.product.id, &BigDecimal::from(500), "http://localhost:3000")
            .await
            .unwrap();
        let order = init.purchased_product.correlation_id();

        let result = h
            .service
            .complete_khalti(khalti_query("HT6o6PEZRWFJ5ygavzHWd5", "forged", &order, "50000"))
            .await;
        assert!(matches!(result, Err(AppError::Unauthorized(_))));
        assert_eq!(h.store.payment_count().await, 0);
    }

    #[tokio::test]
    async fn test_khalti_initiation_failure_leaves_pending_intent() {
        let mut server = Server::new_async().await;
        let h = harness("http://unused", &server.url()).await;
        let _initiate = server
            .mock("POST", "/initiate/")
            .with_status(401)
            .with_body(r#"{"detail":"Invalid token."}"#)
            .create_async()
            .await;

        let result = h
            .service
            .initialize_khalti(h.product.id, &BigDecimal::from(500), "http://localhost:3000")
            .await;
        assert!(matches!(result, Err(AppError::Upstream(_))));
    }

    #[tokio::test]
    async fn test_khalti_rejects_bad_website_url() {
        let h = harness("http://unused", "http://unused").await;
        let result = h
            .service
            .initialize_khalti(h.product.id, &BigDecimal::from(500), "not a url")
            .await;
        assert!(matches!(result, Err(AppError::Validation(_))));
    }

    #[tokio::test]
    async fn test_create_product_validates_input() {
        let h = harness("http://unused", "http://unused").await;

        let result = h
            .service
            .create_product(NewProduct {
                name: " ".to_string(),
                price: BigDecimal::from(10),
                category: "books".to_string(),
            })
            .await;
        assert!(matches!(result, Err(AppError::Validation(_))));

        let result = h
            .service
            .create_product(NewProduct {
                name: "Pen".to_string(),
                price: BigDecimal::from(0),
                category: "stationery".to_string(),
            })
            .await;
        assert!(matches!(result, Err(AppError::Validation(_))));

        let product = h
            .service
            .create_product(NewProduct {
                name: "Pen".to_string(),
                price: BigDecimal::from(25),
                category: "stationery".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(h.service.get_product(product.id).await.unwrap().name, "Pen");
    }

    async fn initiate_khalti(h: &Harness, server: &mut Server, pidx: &str) -> PurchaseIntent {
        let initiate = server
            .mock("POST", "/initiate/")
            .with_status(200)
            .with_body(format!(r#"{{"pidx":"{}","payment_url":"https://pay.khalti.com/"}}"#, pidx))
            .create_async()
            .await;
        let init = h
            .service
            .initialize_khalti(h.product.id, &BigDecimal::from(500), "http://localhost:3000")
            .await
            .unwrap();
        initiate.remove_async().await;
        init.purchased_product
    }

    #[tokio::test]
    async fn test_khalti_initialize_binds_pidx_to_intent() {
        let mut server = Server::new_async().await;
        let h = harness("http://unused", &server.url()).await;

        let intent = initiate_khalti(&h, &mut server, "PIDXA").await;
        assert_eq!(intent.gateway_reference.as_deref(), Some("PIDXA"));

        let stored = h.store.get_intent(intent.id).await.unwrap();
        assert_eq!(stored.gateway_reference.as_deref(), Some("PIDXA"));
    }

    #[tokio::test]
    async fn test_khalti_decline_of_foreign_pidx_leaves_purchase_pending() {
        let mut server = Server::new_async().await;
        let h = harness("http://unused", &server.url()).await;
        let victim = initiate_khalti(&h, &mut server, "VICTIMPIDX").await;

        let lookup = server
            .mock("POST", "/lookup/")
            .with_status(200)
            .with_body(r#"{"pidx":"OTHERPIDX","total_amount":50000,"status":"User canceled","transaction_id":null}"#)
            .expect(0)
            .create_async()
            .await;

        let result = h
            .service
            .complete_khalti(khalti_query("OTHERPIDX", "", &victim.correlation_id(), "50000"))
            .await;

        assert!(matches!(result, Err(AppError::Unauthorized(_))));
        lookup.assert_async().await;
        let stored = h.store.get_intent(victim.id).await.unwrap();
        assert_eq!(stored.status, PurchaseStatus::Pending);
    }

    #[tokio::test]
    async fn test_khalti_pidx_cannot_complete_another_purchase() {
        let mut server = Server::new_async().await;
        let h = harness("http://unused", &server.url()).await;
        let first = initiate_khalti(&h, &mut server, "PIDXA").await;
        let second = initiate_khalti(&h, &mut server, "PIDXB").await;

        let _lookup = server
            .mock("POST", "/lookup/")
            .match_body(Matcher::Json(json!({"pidx": "PIDXA"})))
            .with_status(200)
            .with_body(r#"{"pidx":"PIDXA","total_amount":50000,"status":"Completed","transaction_id":"TXA"}"#)
            .create_async()
            .await;

        let result = h
            .service
            .complete_khalti(khalti_query("PIDXA", "TXA", &second.correlation_id(), "50000"))
            .await;
        assert!(matches!(result, Err(AppError::Unauthorized(_))));
        assert_eq!(h.store.payment_count().await, 0);
        assert_eq!(
            h.store.get_intent(second.id).await.unwrap().status,
            PurchaseStatus::Pending
        );

        // The rightful purchase still completes with its own pidx.
        let completion = h
            .service
            .complete_khalti(khalti_query("PIDXA", "TXA", &first.correlation_id(), "50000"))
            .await
            .unwrap();
        assert_eq!(completion.record().purchase_id, first.id);
    }
}
