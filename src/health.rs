use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;

use crate::ports::Store;

const CRITICAL_DEPENDENCIES: [&str; 1] = ["store"];

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub dependencies: HashMap<String, DependencyStatus>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DependencyStatus {
    Healthy { status: String, latency_ms: u64 },
    Unhealthy { status: String, error: String },
}

impl DependencyStatus {
    fn unhealthy(error: impl Into<String>) -> Self {
        DependencyStatus::Unhealthy {
            status: "unhealthy".to_string(),
            error: error.into(),
        }
    }
}

#[async_trait]
pub trait DependencyChecker: Send + Sync {
    async fn check(&self) -> DependencyStatus;
}

pub struct StoreChecker {
    store: Arc<dyn Store>,
}

impl StoreChecker {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl DependencyChecker for StoreChecker {
    async fn check(&self) -> DependencyStatus {
        let start = Instant::now();
        match self.store.ping().await {
            Ok(()) => DependencyStatus::Healthy {
                status: "healthy".to_string(),
                latency_ms: start.elapsed().as_millis() as u64,
            },
            Err(e) => DependencyStatus::unhealthy(e.to_string()),
        }
    }
}

/// Reports a gateway as unhealthy while its circuit breaker is open.
/// Never calls the gateway itself.
pub struct CircuitChecker {
    state: &'static str,
}

impl CircuitChecker {
    pub fn new(state: &'static str) -> Self {
        Self { state }
    }
}

#[async_trait]
impl DependencyChecker for CircuitChecker {
    async fn check(&self) -> DependencyStatus {
        if self.state == "closed" {
            DependencyStatus::Healthy {
                status: "healthy".to_string(),
                latency_ms: 0,
            }
        } else {
            DependencyStatus::unhealthy(format!("circuit {}", self.state))
        }
    }
}

/// Checks the store plus each gateway's circuit, given as `(name, state)`.
pub async fn check_health(
    store: StoreChecker,
    circuits: &[(&'static str, &'static str)],
    start_time: Instant,
) -> HealthResponse {
    let timeout_duration = Duration::from_secs(5);

    let mut dependencies = HashMap::new();
    dependencies.insert(
        "store".to_string(),
        timeout(timeout_duration, store.check())
            .await
            .unwrap_or_else(|_| DependencyStatus::unhealthy("timeout")),
    );
    for &(name, state) in circuits {
        dependencies.insert(name.to_string(), CircuitChecker::new(state).check().await);
    }

    HealthResponse {
        status: determine_overall_status(&dependencies),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: start_time.elapsed().as_secs(),
        dependencies,
    }
}

fn determine_overall_status(dependencies: &HashMap<String, DependencyStatus>) -> String {
    let mut has_critical_failure = false;
    let mut has_non_critical_failure = false;

    for (name, status) in dependencies {
        if matches!(status, DependencyStatus::Unhealthy { .. }) {
            if CRITICAL_DEPENDENCIES.contains(&name.as_str()) {
                has_critical_failure = true;
            } else {
                has_non_critical_failure = true;
            }
        }
    }

    if has_critical_failure {
        "unhealthy".to_string()
    } else if has_non_critical_failure {
        "degraded".to_string()
    } else {
        "healthy".to_string()
    }
}
