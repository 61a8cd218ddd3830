//! Clients for the two hosted payment gateways.

pub mod esewa;
pub mod khalti;

pub use esewa::EsewaGateway;
pub use khalti::KhaltiGateway;

use failsafe::futures::CircuitBreaker as FuturesCircuitBreaker;
use failsafe::{backoff, failure_policy, Config, Error as FailsafeError, StateMachine};
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use std::time::Duration;
use thiserror::Error;

const BREAKER_FAILURE_THRESHOLD: u32 = 5;
const BREAKER_RESET_SECS: u64 = 30;

#[derive(Error, Debug)]
pub enum GatewayError {
    /// Callback data could not be decoded.
    #[error("Malformed payment data: {0}")]
    MalformedPayload(String),

    #[error("Signature verification failed: {0}")]
    SignatureMismatch(String),

    /// The gateway confirmed a different transaction than the callback claimed.
    #[error("Transaction mismatch: {0}")]
    Mismatch(String),

    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("{gateway} responded with HTTP {status}")]
    UnexpectedStatus {
        gateway: &'static str,
        status: u16,
        body: String,
    },

    #[error("Invalid response from gateway: {0}")]
    InvalidResponse(String),

    #[error("Payment not confirmed: {0}")]
    NotConfirmed(String),

    /// The gateway reports the payment as terminally unsuccessful.
    #[error("{gateway} reported the payment as {status}")]
    Declined {
        gateway: &'static str,
        status: String,
    },

    #[error("Circuit breaker open for {0}")]
    CircuitOpen(&'static str),
}

impl GatewayError {
    pub fn is_declined(&self) -> bool {
        matches!(self, GatewayError::Declined { .. })
    }
}

type Breaker = StateMachine<failure_policy::ConsecutiveFailures<backoff::EqualJittered>, ()>;

/// HTTP client plus circuit breaker shared by both gateway adapters.
///
/// Only transport failures and 5xx responses count against the breaker;
/// 4xx answers are returned to the caller to interpret.
#[derive(Clone)]
pub(crate) struct GatewayHttp {
    gateway: &'static str,
    client: Client,
    breaker: Breaker,
}

impl GatewayHttp {
    pub(crate) fn new(gateway: &'static str, timeout: Duration) -> Result<Self, GatewayError> {
        let client = Client::builder().timeout(timeout).build()?;

        let backoff = backoff::equal_jittered(
            Duration::from_secs(BREAKER_RESET_SECS),
            Duration::from_secs(BREAKER_RESET_SECS * 2),
        );
        let policy = failure_policy::consecutive_failures(BREAKER_FAILURE_THRESHOLD, backoff);
        let breaker = Config::new().failure_policy(policy).build();

        Ok(Self {
            gateway,
            client,
            breaker,
        })
    }

    pub(crate) fn client(&self) -> &Client {
        &self.client
    }

    pub(crate) fn circuit_state(&self) -> &'static str {
        if self.breaker.is_call_permitted() {
            "closed"
        } else {
            "open"
        }
    }

    /// Sends the request and returns the status and body text.
    pub(crate) async fn send(&self, request: RequestBuilder) -> Result<(u16, String), GatewayError> {
        let gateway = self.gateway;

        let result = self
            .breaker
            .call(async move {
                let response = request.send().await?;
                let status = response.status();
                let body = response.text().await?;

                if status.is_server_error() {
                    return Err(GatewayError::UnexpectedStatus {
                        gateway,
                        status: status.as_u16(),
                        body,
                    });
                }
                Ok::<_, GatewayError>((status.as_u16(), body))
            })
            .await;

        match result {
            Ok(reply) => Ok(reply),
            Err(FailsafeError::Rejected) => {
                tracing::warn!(gateway, "Gateway call rejected by open circuit breaker");
                Err(GatewayError::CircuitOpen(gateway))
            }
            Err(FailsafeError::Inner(e)) => Err(e),
        }
    }

    /// Sends the request and decodes a successful JSON body as both `T` and raw JSON.
    pub(crate) async fn send_json<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
    ) -> Result<(T, serde_json::Value), GatewayError> {
        let (status, body) = self.send(request).await?;

        if !(200..300).contains(&status) {
            tracing::warn!(gateway = self.gateway, status, "Gateway rejected request");
            return Err(GatewayError::UnexpectedStatus {
                gateway: self.gateway,
                status,
                body,
            });
        }

        let raw: serde_json::Value = serde_json::from_str(&body).map_err(|e| {
            GatewayError::InvalidResponse(format!("{} returned non-JSON body: {}", self.gateway, e))
        })?;
        let parsed = serde_json::from_value(raw.clone()).map_err(|e| {
            GatewayError::InvalidResponse(format!("{} returned unexpected JSON: {}", self.gateway, e))
        })?;

        Ok((parsed, raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_server_errors_trip_breaker() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/")
            .with_status(503)
            .expect_at_least(BREAKER_FAILURE_THRESHOLD as usize)
            .create_async()
            .await;

        let http = GatewayHttp::new("test", Duration::from_secs(5)).unwrap();
        for _ in 0..BREAKER_FAILURE_THRESHOLD {
            let result = http.send(http.client().get(server.url())).await;
            assert!(matches!(
                result,
                Err(GatewayError::UnexpectedStatus { status: 503, .. })
            ));
        }

        assert_eq!(http.circuit_state(), "open");
        let result = http.send(http.client().get(server.url())).await;
        assert!(matches!(result, Err(GatewayError::CircuitOpen("test"))));
    }

    #[tokio::test]
    async fn test_client_errors_do_not_trip_breaker() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/")
            .with_status(400)
            .with_body(r#"{"detail":"Not found."}"#)
            .create_async()
            .await;

        let http = GatewayHttp::new("test", Duration::from_secs(5)).unwrap();
        for _ in 0..(BREAKER_FAILURE_THRESHOLD + 2) {
            let (status, _) = http.send(http.client().get(server.url())).await.unwrap();
            assert_eq!(status, 400);
        }
        assert_eq!(http.circuit_state(), "closed");
    }

    #[tokio::test]
    async fn test_send_json_rejects_non_json() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/")
            .with_status(200)
            .with_body("<html>maintenance</html>")
            .create_async()
            .await;

        let http = GatewayHttp::new("test", Duration::from_secs(5)).unwrap();
        let result = http
            .send_json::<serde_json::Value>(http.client().get(server.url()))
            .await;
        assert!(matches!(result, Err(GatewayError::InvalidResponse(_))));
    }
}
