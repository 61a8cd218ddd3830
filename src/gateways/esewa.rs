//! eSewa ePay v2: signed hosted-form checkout plus a status-check API.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use bigdecimal::BigDecimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{GatewayError, GatewayHttp};
use crate::config::EsewaConfig;
use crate::domain::money::format_major;
use crate::signature;

const GATEWAY: &str = "esewa";

/// Fields signed on the outgoing form, in signing order.
pub const INITIATION_SIGNED_FIELDS: [&str; 3] = ["total_amount", "transaction_uuid", "product_code"];

/// Fields every callback signature has to cover.
pub const CALLBACK_REQUIRED_FIELDS: [&str; 5] = [
    "transaction_code",
    "status",
    "total_amount",
    "transaction_uuid",
    "product_code",
];

const STATUS_COMPLETE: &str = "COMPLETE";
const DECLINED_STATUSES: [&str; 2] = ["CANCELED", "NOT_FOUND"];

/// Everything the storefront posts to the hosted eSewa form.
#[derive(Debug, Clone, Serialize)]
pub struct EsewaInitiation {
    pub amount: String,
    pub tax_amount: String,
    pub total_amount: String,
    pub transaction_uuid: String,
    pub product_code: String,
    pub product_service_charge: String,
    pub product_delivery_charge: String,
    pub success_url: String,
    pub failure_url: String,
    pub signed_field_names: String,
    pub signature: String,
    pub form_action: String,
}

/// Authenticated contents of the callback's base64 `data` field.
#[derive(Debug, Clone, PartialEq)]
pub struct EsewaCallback {
    pub transaction_code: String,
    pub status: String,
    pub total_amount: BigDecimal,
    pub transaction_uuid: String,
    pub product_code: String,
    /// The decoded JSON exactly as received.
    pub raw: Value,
}

/// Reply of `/api/epay/transaction/status/`.
#[derive(Debug, Clone, Deserialize)]
pub struct EsewaStatus {
    pub status: String,
    #[serde(default)]
    pub transaction_uuid: Option<String>,
    #[serde(default)]
    pub total_amount: Option<Value>,
    #[serde(default)]
    pub ref_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct EsewaVerification {
    pub callback: EsewaCallback,
    pub status: EsewaStatus,
    pub status_raw: Value,
}

#[derive(Clone)]
pub struct EsewaGateway {
    config: EsewaConfig,
    http: GatewayHttp,
}

impl EsewaGateway {
    pub fn new(config: EsewaConfig, timeout: Duration) -> Result<Self, GatewayError> {
        Ok(Self {
            config,
            http: GatewayHttp::new(GATEWAY, timeout)?,
        })
    }

    pub fn circuit_state(&self) -> &'static str {
        self.http.circuit_state()
    }

    /// Builds and signs the hosted-form payload. No network call is made.
    pub fn initialize(
        &self,
        total_amount: &BigDecimal,
        transaction_uuid: &str,
        success_url: &str,
        failure_url: &str,
    ) -> EsewaInitiation {
        let total = format_major(total_amount);
        let message = signature::signed_message(&[
            (INITIATION_SIGNED_FIELDS[0], total.as_str()),
            (INITIATION_SIGNED_FIELDS[1], transaction_uuid),
            (INITIATION_SIGNED_FIELDS[2], self.config.product_code.as_str()),
        ]);
        let signature = signature::sign(&self.config.secret_key, &message);

        debug!(transaction_uuid, total_amount = %total, "eSewa form signed");

        EsewaInitiation {
            amount: total.clone(),
            tax_amount: "0".to_string(),
            total_amount: total,
            transaction_uuid: transaction_uuid.to_string(),
            product_code: self.config.product_code.clone(),
            product_service_charge: "0".to_string(),
            product_delivery_charge: "0".to_string(),
            success_url: success_url.to_string(),
            failure_url: failure_url.to_string(),
            signed_field_names: INITIATION_SIGNED_FIELDS.join(","),
            signature,
            form_action: format!(
                "{}/api/epay/main/v2/form",
                self.config.gateway_url.trim_end_matches('/')
            ),
        }
    }

    /// Decodes the callback and checks its signature. Makes no network call.
    pub fn authenticate(&self, encoded: &str) -> Result<EsewaCallback, GatewayError> {
        let fields = decode_payload(encoded)?;

        let provided = text_field(&fields, "signature")
            .ok_or_else(|| GatewayError::SignatureMismatch("signature is missing".to_string()))?;
        let field_list = text_field(&fields, "signed_field_names").ok_or_else(|| {
            GatewayError::SignatureMismatch("signed_field_names is missing".to_string())
        })?;
        let names = signature::parse_field_names(&field_list).ok_or_else(|| {
            GatewayError::SignatureMismatch("signed_field_names is empty".to_string())
        })?;

        if let Some(missing) = CALLBACK_REQUIRED_FIELDS
            .iter()
            .find(|required| !names.contains(*required))
        {
            return Err(GatewayError::SignatureMismatch(format!(
                "{} is not covered by the signature",
                missing
            )));
        }

        let mut signed = Vec::with_capacity(names.len());
        for name in &names {
            let value = text_field(&fields, name).ok_or_else(|| {
                GatewayError::SignatureMismatch(format!("signed field {} is missing", name))
            })?;
            signed.push((*name, value));
        }

        let message = signature::signed_message(&signed);
        if !signature::verify(&self.config.secret_key, &message, &provided) {
            warn!("eSewa callback signature mismatch");
            return Err(GatewayError::SignatureMismatch(
                "Invalid payment signature".to_string(),
            ));
        }

        // Every required field is present, having just been signed.
        let value_of = |name: &str| {
            signed
                .iter()
                .find(|(n, _)| *n == name)
                .map(|(_, v)| v.clone())
                .unwrap_or_default()
        };

        let product_code = value_of("product_code");
        if product_code != self.config.product_code {
            return Err(GatewayError::SignatureMismatch(format!(
                "unexpected product code {}",
                product_code
            )));
        }

        let total_amount = BigDecimal::from_str(&value_of("total_amount")).map_err(|_| {
            GatewayError::MalformedPayload("total_amount is not a number".to_string())
        })?;

        Ok(EsewaCallback {
            transaction_code: value_of("transaction_code"),
            status: value_of("status"),
            total_amount,
            transaction_uuid: value_of("transaction_uuid"),
            product_code,
            raw: Value::Object(fields),
        })
    }

    /// Checks an authenticated callback against the status API.
    pub async fn confirm(&self, callback: EsewaCallback) -> Result<EsewaVerification, GatewayError> {
        let total = callback.total_amount.to_string();

        let url = format!(
            "{}/api/epay/transaction/status/",
            self.config.status_url.trim_end_matches('/')
        );
        let request = self.http.client().get(&url).query(&[
            ("product_code", self.config.product_code.as_str()),
            ("total_amount", total.as_str()),
            ("transaction_uuid", callback.transaction_uuid.as_str()),
        ]);

        let (status, status_raw): (EsewaStatus, Value) = self.http.send_json(request).await?;
        debug!(
            transaction_uuid = %callback.transaction_uuid,
            status = %status.status,
            "eSewa status check returned"
        );

        if DECLINED_STATUSES.contains(&status.status.as_str()) {
            return Err(GatewayError::Declined {
                gateway: GATEWAY,
                status: status.status,
            });
        }
        if status.status != STATUS_COMPLETE {
            return Err(GatewayError::NotConfirmed(format!(
                "eSewa reports status {}",
                status.status
            )));
        }
        if status.transaction_uuid.as_deref() != Some(callback.transaction_uuid.as_str()) {
            return Err(GatewayError::NotConfirmed(
                "eSewa confirmed a different transaction".to_string(),
            ));
        }
        let confirmed_amount = status.total_amount.as_ref().and_then(decimal_of);
        if confirmed_amount.as_ref() != Some(&callback.total_amount) {
            return Err(GatewayError::NotConfirmed(
                "eSewa confirmed a different amount".to_string(),
            ));
        }

        info!(
            transaction_uuid = %callback.transaction_uuid,
            transaction_code = %callback.transaction_code,
            "eSewa payment confirmed"
        );

        Ok(EsewaVerification {
            callback,
            status,
            status_raw,
        })
    }
}

/// Base64 -> JSON object. Query decoding turns `+` into a space, so that is undone first.
fn decode_payload(encoded: &str) -> Result<Map<String, Value>, GatewayError> {
    let cleaned = encoded.trim().replace(' ', "+");
    if cleaned.is_empty() {
        return Err(GatewayError::MalformedPayload(
            "payment data is empty".to_string(),
        ));
    }

    let bytes = STANDARD
        .decode(cleaned.as_bytes())
        .map_err(|_| GatewayError::MalformedPayload("payment data is not base64".to_string()))?;

    match serde_json::from_slice::<Value>(&bytes) {
        Ok(Value::Object(fields)) => Ok(fields),
        _ => Err(GatewayError::MalformedPayload(
            "payment data is not a JSON object".to_string(),
        )),
    }
}

/// Signed values are taken as text; eSewa sends numbers as strings but a bare
/// JSON number is accepted as its literal.
fn text_field(fields: &Map<String, Value>, name: &str) -> Option<String> {
    match fields.get(name)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn decimal_of(value: &Value) -> Option<BigDecimal> {
    match value {
        Value::String(s) => BigDecimal::from_str(s).ok(),
        Value::Number(n) => BigDecimal::from_str(&n.to_string()).ok(),
        _ => None,
    }
}
