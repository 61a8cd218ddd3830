pub mod adapters;
pub mod cli;
pub mod config;
pub mod db;
pub mod domain;
pub mod error;
pub mod gateways;
pub mod handlers;
pub mod health;
pub mod middleware;
pub mod ports;
pub mod response;
pub mod secrets;
pub mod services;
pub mod signature;
pub mod utils;

use axum::{
    extract::DefaultBodyLimit,
    http::{header, HeaderValue, Method},
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::cors::{AllowOrigin, CorsLayer};

use crate::config::Config;
use crate::gateways::{EsewaGateway, KhaltiGateway};
use crate::middleware::request_logger::{request_logger_middleware, RequestLogSettings};
use crate::ports::Store;
use crate::services::checkout::{CheckoutService, RedirectUrls};

/// Request bodies above this are rejected with 413.
pub const MAX_BODY_BYTES: usize = 20 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub checkout: Arc<CheckoutService>,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(store: Arc<dyn Store>, checkout: CheckoutService) -> Self {
        Self {
            store,
            checkout: Arc::new(checkout),
            start_time: Instant::now(),
        }
    }

    /// Wires both gateway clients from configuration around `store`.
    pub fn from_config(config: &Config, store: Arc<dyn Store>) -> anyhow::Result<Self> {
        let timeout = Duration::from_secs(config.gateway_timeout_secs);
        let esewa = EsewaGateway::new(config.esewa.clone(), timeout)?;
        let khalti = KhaltiGateway::new(config.khalti.clone(), timeout)?;

        let checkout = CheckoutService::new(
            store.clone(),
            esewa,
            khalti,
            RedirectUrls::from_config(config),
        );
        Ok(Self::new(store, checkout))
    }
}

/// Cross-cutting HTTP settings that are not part of the handlers' state.
#[derive(Debug, Clone, Default)]
pub struct RouterSettings {
    pub allowed_origin: Option<HeaderValue>,
    pub request_log: RequestLogSettings,
}

impl RouterSettings {
    pub fn from_config(config: &Config) -> Self {
        let allowed_origin = HeaderValue::from_str(config.storefront_url.trim_end_matches('/')).ok();
        if allowed_origin.is_none() {
            tracing::warn!("STOREFRONT_URL is not a valid origin; CORS is disabled");
        }
        Self {
            allowed_origin,
            request_log: RequestLogSettings {
                log_body: config.log_request_body,
            },
        }
    }
}

pub fn create_app(state: AppState, settings: RouterSettings) -> Router {
    let mut router = Router::new()
        .route("/health", get(handlers::health))
        .route("/products", post(handlers::products::create_product))
        .route("/products/:id", get(handlers::products::get_product))
        .route("/purchases/:id", get(handlers::products::get_purchase))
        .route("/payment-esewa/initialize", post(handlers::esewa::initialize))
        .route("/payment-esewa/complete", get(handlers::esewa::complete))
        .route("/payment-khalti/initialize", post(handlers::khalti::initialize))
        .route("/payment-khalti/complete", get(handlers::khalti::complete))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(axum::middleware::from_fn_with_state(
            settings.request_log,
            request_logger_middleware,
        ))
        .with_state(state);

    if let Some(origin) = settings.allowed_origin {
        router = router.layer(
            CorsLayer::new()
                .allow_origin(AllowOrigin::exact(origin))
                .allow_methods([Method::GET, Method::POST])
                .allow_headers([header::CONTENT_TYPE]),
        );
    }

    router
}
