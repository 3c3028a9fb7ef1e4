//! Health check module
//! Reports reachability of the OTP store and the commerce backend

use serde::Serialize;
use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{error, info};

use crate::commerce::CommerceBackend;
use crate::otp::OtpService;

const CHECK_TIMEOUT: Duration = Duration::from_secs(5);
/// Checks slower than this are reported as a warning
const SLOW_CHECK_MS: u128 = 1000;

/// Health status response
#[derive(Debug, Serialize, Clone)]
pub struct HealthStatus {
    pub status: HealthState,
    pub checks: HashMap<String, ComponentHealth>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Overall health state
#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Individual component health status
#[derive(Debug, Serialize, Clone)]
pub struct ComponentHealth {
    pub status: ComponentState,
    pub response_time_ms: Option<u128>,
    pub details: Option<String>,
}

/// Component state
#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub enum ComponentState {
    Up,
    Down,
    Warning,
}

impl HealthStatus {
    pub fn new() -> Self {
        Self {
            status: HealthState::Healthy,
            checks: HashMap::new(),
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self.status, HealthState::Healthy)
    }

    fn record(&mut self, component: &str, health: ComponentHealth) {
        let state = match health.status {
            ComponentState::Up => HealthState::Healthy,
            ComponentState::Warning => HealthState::Degraded,
            ComponentState::Down => HealthState::Unhealthy,
        };
        self.status = match (&self.status, state) {
            (HealthState::Unhealthy, _) | (_, HealthState::Unhealthy) => HealthState::Unhealthy,
            (HealthState::Degraded, _) | (_, HealthState::Degraded) => HealthState::Degraded,
            _ => HealthState::Healthy,
        };
        self.checks.insert(component.to_string(), health);
    }
}

impl Default for HealthStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl ComponentHealth {
    pub fn up(response_time_ms: Option<u128>) -> Self {
        Self {
            status: ComponentState::Up,
            response_time_ms,
            details: None,
        }
    }

    pub fn down(details: Option<String>) -> Self {
        Self {
            status: ComponentState::Down,
            response_time_ms: None,
            details,
        }
    }

    pub fn warning(response_time_ms: Option<u128>, details: Option<String>) -> Self {
        Self {
            status: ComponentState::Warning,
            response_time_ms,
            details,
        }
    }
}

/// Health checker for the application
#[derive(Clone)]
pub struct HealthChecker {
    otp: Arc<OtpService>,
    backend: Arc<dyn CommerceBackend>,
}

impl HealthChecker {
    pub fn new(otp: Arc<OtpService>, backend: Arc<dyn CommerceBackend>) -> Self {
        Self { otp, backend }
    }

    /// Probe every dependency. The OTP store is mandatory for the OTP flow,
    /// the commerce backend for payments; either being down is unhealthy.
    pub async fn check_health(&self) -> HealthStatus {
        let mut health_status = HealthStatus::new();

        health_status.record("otp_store", probe("otp_store", self.otp.ping()).await);
        health_status.record(
            "commerce_backend",
            probe("commerce_backend", self.backend.ping()).await,
        );

        health_status
    }
}

async fn probe<E: Display>(
    component: &str,
    check: impl Future<Output = Result<(), E>>,
) -> ComponentHealth {
    let start = Instant::now();
    match timeout(CHECK_TIMEOUT, check).await {
        Ok(Ok(())) => {
            let elapsed = start.elapsed().as_millis();
            info!(component, response_time_ms = elapsed as u64, "health check ok");
            if elapsed > SLOW_CHECK_MS {
                ComponentHealth::warning(Some(elapsed), Some("Slow response".to_string()))
            } else {
                ComponentHealth::up(Some(elapsed))
            }
        }
        Ok(Err(e)) => {
            error!(component, error = %e, "health check failed");
            ComponentHealth::down(Some(e.to_string()))
        }
        Err(_) => {
            error!(component, "health check timed out");
            ComponentHealth::down(Some("Timeout".to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commerce::InMemoryCommerceBackend;
    use crate::otp::{LogOnlySender, MemoryOtpStore, OtpConfig};

    #[tokio::test]
    async fn test_health_status_creation() {
        let health_status = HealthStatus::new();
        assert!(matches!(health_status.status, HealthState::Healthy));
        assert!(health_status.checks.is_empty());
        assert!(health_status.timestamp <= chrono::Utc::now());
    }

    #[test]
    fn test_component_health_states() {
        let up_health = ComponentHealth::up(Some(100));
        assert!(matches!(up_health.status, ComponentState::Up));
        assert_eq!(up_health.response_time_ms, Some(100));

        let down_health = ComponentHealth::down(Some("Test error".to_string()));
        assert!(matches!(down_health.status, ComponentState::Down));
        assert_eq!(down_health.details, Some("Test error".to_string()));

        let warning_health = ComponentHealth::warning(Some(1500), Some("Slow response".to_string()));
        assert!(matches!(warning_health.status, ComponentState::Warning));
        assert_eq!(warning_health.response_time_ms, Some(1500));
    }

    #[test]
    fn worst_component_wins() {
        let mut status = HealthStatus::new();
        status.record("a", ComponentHealth::up(Some(1)));
        status.record("b", ComponentHealth::warning(Some(1500), None));
        assert_eq!(status.status, HealthState::Degraded);
        status.record("c", ComponentHealth::down(None));
        status.record("d", ComponentHealth::up(Some(1)));
        assert_eq!(status.status, HealthState::Unhealthy);
    }

    #[tokio::test]
    async fn in_memory_dependencies_are_healthy() {
        let otp = OtpService::new(
            Arc::new(MemoryOtpStore::new()),
            Arc::new(LogOnlySender),
            OtpConfig::default(),
        );
        let checker = HealthChecker::new(Arc::new(otp), Arc::new(InMemoryCommerceBackend::new()));
        let status = checker.check_health().await;
        assert!(status.is_healthy());
        assert_eq!(status.checks.len(), 2);
    }
}
