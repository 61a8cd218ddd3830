//! Khalti ePayment v2: server-side initiate plus a lookup API keyed by `pidx`.

use reqwest::header::AUTHORIZATION;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{GatewayError, GatewayHttp};
use crate::config::KhaltiConfig;

const GATEWAY: &str = "khalti";

const STATUS_COMPLETED: &str = "Completed";
const DECLINED_STATUSES: [&str; 2] = ["Expired", "User canceled"];

/// Body of `POST /initiate/`. `amount` is in paisa.
#[derive(Debug, Clone, Serialize)]
pub struct KhaltiInitiateRequest {
    pub return_url: String,
    pub website_url: String,
    pub amount: i64,
    pub purchase_order_id: String,
    pub purchase_order_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KhaltiInitiation {
    pub pidx: String,
    pub payment_url: String,
    #[serde(default)]
    pub expires_at: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
}

/// Reply of `POST /lookup/`. Amounts are in paisa.
#[derive(Debug, Clone, Deserialize)]
pub struct KhaltiLookup {
    pub pidx: String,
    pub total_amount: i64,
    pub status: String,
    #[serde(default)]
    pub transaction_id: Option<String>,
    #[serde(default)]
    pub fee: Option<i64>,
    #[serde(default)]
    pub refunded: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct KhaltiVerification {
    pub lookup: KhaltiLookup,
    pub lookup_raw: Value,
}

/// Query parameters Khalti appends to the return URL.
///
/// The query is untrusted; only `pidx` and `transaction_id` are used, and both
/// are checked against the lookup API.
#[derive(Debug, Clone, PartialEq)]
pub struct KhaltiCallback {
    pub pidx: String,
    /// Empty when the buyer cancelled.
    pub transaction_id: String,
    /// Paisa, as claimed by the redirect.
    pub amount: Option<i64>,
    pub purchase_order_id: String,
    pub purchase_order_name: Option<String>,
    pub status: Option<String>,
    pub raw: Value,
}

impl KhaltiCallback {
    pub fn from_query(query: &HashMap<String, String>) -> Result<Self, GatewayError> {
        let get = |names: &[&str]| {
            names
                .iter()
                .find_map(|name| query.get(*name))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let required = |names: &[&str]| {
            get(names).ok_or_else(|| {
                GatewayError::MalformedPayload(format!("{} is required", names[0]))
            })
        };

        let amount = match get(&["amount", "total_amount"]) {
            Some(raw) => Some(raw.parse::<i64>().map_err(|_| {
                GatewayError::MalformedPayload("amount must be an integer".to_string())
            })?),
            None => None,
        };

        Ok(Self {
            pidx: required(&["pidx"])?,
            transaction_id: get(&["transaction_id", "transactionId", "tidx", "txnId"])
                .unwrap_or_default(),
            amount,
            purchase_order_id: required(&["purchase_order_id", "purchaseOrderId"])?,
            purchase_order_name: get(&["purchase_order_name", "purchaseOrderName"]),
            status: get(&["status"]),
            raw: serde_json::to_value(query).unwrap_or(Value::Null),
        })
    }
}

#[derive(Clone)]
pub struct KhaltiGateway {
    config: KhaltiConfig,
    http: GatewayHttp,
}

impl KhaltiGateway {
    pub fn new(config: KhaltiConfig, timeout: Duration) -> Result<Self, GatewayError> {
        Ok(Self {
            config,
            http: GatewayHttp::new(GATEWAY, timeout)?,
        })
    }

    pub fn circuit_state(&self) -> &'static str {
        self.http.circuit_state()
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}/", self.config.gateway_url.trim_end_matches('/'), path)
    }

    fn authorization(&self) -> String {
        format!("Key {}", self.config.secret_key)
    }

    pub async fn initialize(
        &self,
        request: &KhaltiInitiateRequest,
    ) -> Result<KhaltiInitiation, GatewayError> {
        let builder = self
            .http
            .client()
            .post(self.endpoint("initiate"))
            .header(AUTHORIZATION, self.authorization())
            .json(request);

        let (initiation, _): (KhaltiInitiation, Value) = self.http.send_json(builder).await?;
        if initiation.pidx.is_empty() || initiation.payment_url.is_empty() {
            return Err(GatewayError::InvalidResponse(
                "Khalti returned an empty pidx or payment_url".to_string(),
            ));
        }

        info!(
            purchase_order_id = %request.purchase_order_id,
            pidx = %initiation.pidx,
            "Khalti payment initiated"
        );
        Ok(initiation)
    }

    pub async fn lookup(&self, pidx: &str) -> Result<(KhaltiLookup, Value), GatewayError> {
        let builder = self
            .http
            .client()
            .post(self.endpoint("lookup"))
            .header(AUTHORIZATION, self.authorization())
            .json(&json!({ "pidx": pidx }));

        let (lookup, raw): (KhaltiLookup, Value) = self.http.send_json(builder).await?;
        debug!(pidx, status = %lookup.status, "Khalti lookup returned");
        Ok((lookup, raw))
    }

    /// Looks the payment up and checks it confirms the transaction the callback named.
    pub async fn verify(
        &self,
        pidx: &str,
        expected_transaction_id: &str,
    ) -> Result<KhaltiVerification, GatewayError> {
        let (lookup, lookup_raw) = self.lookup(pidx).await?;

        if DECLINED_STATUSES.contains(&lookup.status.as_str()) {
            return Err(GatewayError::Declined {
                gateway: GATEWAY,
                status: lookup.status,
            });
        }
        if lookup.status != STATUS_COMPLETED {
            return Err(GatewayError::NotConfirmed(format!(
                "Khalti reports status {}",
                lookup.status
            )));
        }
        if lookup.pidx != pidx
            || lookup.transaction_id.as_deref() != Some(expected_transaction_id)
        {
            warn!(
                pidx,
                expected_transaction_id, "Khalti lookup confirms a different transaction"
            );
            return Err(GatewayError::Mismatch(
                "Transaction does not match the confirmed payment".to_string(),
            ));
        }

        info!(pidx, transaction_id = expected_transaction_id, "Khalti payment confirmed");
        Ok(KhaltiVerification { lookup, lookup_raw })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn gateway(base: &str) -> KhaltiGateway {
        KhaltiGateway::new(
            KhaltiConfig {
                gateway_url: base.to_string(),
                secret_key: "test_secret_key".to_string(),
            },
            Duration::from_secs(5),
        )
        .unwrap()
    }

    fn lookup_body(status: &str, transaction_id: &str) -> String {
        json!({
            "pidx": "HT6o6PEZRWFJ5ygavzHWd5",
            "total_amount": 50000,
            "status": status,
            "transaction_id": transaction_id,
            "fee": 0,
            "refunded": false
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_initialize_posts_paisa_with_key_header() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/initiate/")
            .match_header("authorization", "Key test_secret_key")
            .match_body(Matcher::PartialJson(json!({
                "amount": 50000,
                "purchase_order_id": "order-1",
                "purchase_order_name": "Notebook"
            })))
            .with_status(200)
            .with_body(
                r#"{"pidx":"HT6o6PEZRWFJ5ygavzHWd5","payment_url":"https://pay.khalti.com/?pidx=HT6o6PEZRWFJ5ygavzHWd5","expires_at":"2024-06-01T12:00:00+05:45","expires_in":1800}"#,
            )
            .create_async()
            .await;

        let initiation = gateway(&server.url())
            .initialize(&KhaltiInitiateRequest {
                return_url: "http://localhost:8000/payment-khalti/complete".to_string(),
                website_url: "http://localhost:3000".to_string(),
                amount: 50000,
                purchase_order_id: "order-1".to_string(),
                purchase_order_name: "Notebook".to_string(),
            })
            .await
            .unwrap();

        assert_eq!(initiation.pidx, "HT6o6PEZRWFJ5ygavzHWd5");
        assert_eq!(initiation.expires_in, Some(1800));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_initialize_rejection_is_unexpected_status() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/initiate/")
            .with_status(400)
            .with_body(r#"{"amount":["Amount should be greater than Rs. 10"]}"#)
            .create_async()
            .await;

        let result = gateway(&server.url())
            .initialize(&KhaltiInitiateRequest {
                return_url: "http://localhost:8000/payment-khalti/complete".to_string(),
                website_url: "http://localhost:3000".to_string(),
                amount: 100,
                purchase_order_id: "order-1".to_string(),
                purchase_order_name: "Notebook".to_string(),
            })
            .await;

        assert!(matches!(
            result,
            Err(GatewayError::UnexpectedStatus { status: 400, .. })
        ));
    }

    #[tokio::test]
    async fn test_verify_completed_matching_transaction() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/lookup/")
            .match_body(Matcher::Json(json!({"pidx": "HT6o6PEZRWFJ5ygavzHWd5"})))
            .with_status(200)
            .with_body(lookup_body("Completed", "GFq9PFS7b2iYvL8Lir9oXe"))
            .create_async()
            .await;

        let verification = gateway(&server.url())
            .verify("HT6o6PEZRWFJ5ygavzHWd5", "GFq9PFS7b2iYvL8Lir9oXe")
            .await
            .unwrap();
        assert_eq!(verification.lookup.total_amount, 50000);
        assert_eq!(verification.lookup_raw["status"], "Completed");
    }

    #[tokio::test]
    async fn test_verify_rejects_forged_transaction_id() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/lookup/")
            .with_status(200)
            .with_body(lookup_body("Completed", "GFq9PFS7b2iYvL8Lir9oXe"))
            .create_async()
            .await;

        let result = gateway(&server.url())
            .verify("HT6o6PEZRWFJ5ygavzHWd5", "someone-elses-transaction")
            .await;
        assert!(matches!(result, Err(GatewayError::Mismatch(_))));
    }

    #[tokio::test]
    async fn test_verify_pending_is_not_confirmed() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/lookup/")
            .with_status(200)
            .with_body(lookup_body("Pending", "GFq9PFS7b2iYvL8Lir9oXe"))
            .create_async()
            .await;

        let result = gateway(&server.url())
            .verify("HT6o6PEZRWFJ5ygavzHWd5", "GFq9PFS7b2iYvL8Lir9oXe")
            .await;
        assert!(matches!(result, Err(GatewayError::NotConfirmed(_))));
    }

    #[tokio::test]
    async fn test_verify_user_canceled_is_declined() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/lookup/")
            .with_status(200)
            .with_body(lookup_body("User canceled", ""))
            .create_async()
            .await;

        let result = gateway(&server.url())
            .verify("HT6o6PEZRWFJ5ygavzHWd5", "GFq9PFS7b2iYvL8Lir9oXe")
            .await;
        assert!(matches!(result, Err(ref e) if e.is_declined()));
    }

    fn query(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_callback_accepts_snake_and_camel_case() {
        let snake = KhaltiCallback::from_query(&query(&[
            ("pidx", "HT6o6PEZRWFJ5ygavzHWd5"),
            ("transaction_id", "GFq9PFS7b2iYvL8Lir9oXe"),
            ("amount", "50000"),
            ("purchase_order_id", "order-1"),
            ("purchase_order_name", "Notebook"),
            ("status", "Completed"),
        ]))
        .unwrap();
        let camel = KhaltiCallback::from_query(&query(&[
            ("pidx", "HT6o6PEZRWFJ5ygavzHWd5"),
            ("transactionId", "GFq9PFS7b2iYvL8Lir9oXe"),
            ("amount", "50000"),
            ("purchaseOrderId", "order-1"),
            ("purchaseOrderName", "Notebook"),
            ("status", "Completed"),
        ]))
        .unwrap();

        assert_eq!(snake.transaction_id, camel.transaction_id);
        assert_eq!(snake.purchase_order_id, "order-1");
        assert_eq!(camel.amount, Some(50000));
        assert_eq!(snake.raw["pidx"], "HT6o6PEZRWFJ5ygavzHWd5");
    }

    #[test]
    fn test_callback_requires_pidx_and_order() {
        let result = KhaltiCallback::from_query(&query(&[("transaction_id", "x")]));
        assert!(matches!(result, Err(GatewayError::MalformedPayload(_))));

        let result = KhaltiCallback::from_query(&query(&[("pidx", "p")]));
        assert!(matches!(result, Err(GatewayError::MalformedPayload(_))));
    }

    #[test]
    fn test_callback_rejects_non_integer_amount() {
        let result = KhaltiCallback::from_query(&query(&[
            ("pidx", "p"),
            ("purchase_order_id", "order-1"),
            ("amount", "500.5"),
        ]));
        assert!(matches!(result, Err(GatewayError::MalformedPayload(_))));
    }

    #[test]
    fn test_cancelled_callback_has_empty_transaction_id() {
        let callback = KhaltiCallback::from_query(&query(&[
            ("pidx", "p"),
            ("purchase_order_id", "order-1"),
            ("transaction_id", ""),
            ("status", "User canceled"),
        ]))
        .unwrap();
        assert_eq!(callback.transaction_id, "");
        assert_eq!(callback.status.as_deref(), Some("User canceled"));
    }

    #[tokio::test]
    async fn test_unreachable_gateway_is_request_error() {
        // Nothing listens on the discard port.
        let result = gateway("http://127.0.0.1:9")
            .verify("HT6o6PEZRWFJ5ygavzHWd5", "GFq9PFS7b2iYvL8Lir9oXe")
            .await;
        assert!(matches!(result, Err(GatewayError::Request(_))));
    }
}
