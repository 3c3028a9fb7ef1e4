use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::{env_parse, ConfigError};
use crate::payments::completion::{OrderCompleter, ReconcileReport, DEFAULT_MAX_ATTEMPTS};
use crate::payments::locks::SessionLocks;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ReconciliationConfig {
    /// How often the worker wakes up to look for captured-but-unplaced orders.
    pub interval: Duration,
    /// Maximum number of sessions examined per cycle.
    pub batch_size: u32,
    /// Failed placements after which a session is left for manual handling.
    pub max_attempts: u32,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(120),
            batch_size: 50,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl ReconciliationConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            interval: Duration::from_secs(env_parse(
                "ORDER_RECONCILE_INTERVAL_SECS",
                defaults.interval.as_secs(),
            )?),
            batch_size: env_parse("ORDER_RECONCILE_BATCH", defaults.batch_size)?,
            max_attempts: env_parse("ORDER_RECONCILE_MAX_ATTEMPTS", defaults.max_attempts)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

/// Places orders for sessions whose payment was captured while cart
/// completion failed or timed out.
pub struct OrderReconciliationWorker {
    completer: OrderCompleter,
    locks: SessionLocks,
    config: ReconciliationConfig,
}

impl OrderReconciliationWorker {
    pub fn new(completer: OrderCompleter, locks: SessionLocks, config: ReconciliationConfig) -> Self {
        Self {
            completer,
            locks,
            config,
        }
    }

    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            batch_size = self.config.batch_size,
            max_attempts = self.completer.max_attempts(),
            "order reconciliation worker started"
        );

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("order reconciliation worker stopping");
                        break;
                    }
                }
                _ = tokio::time::sleep(self.config.interval) => {
                    self.run_cycle().await;
                }
            }
        }

        info!("order reconciliation worker stopped");
    }

    pub async fn run_cycle(&self) -> Option<ReconcileReport> {
        match self
            .completer
            .reconcile_pending(&self.locks, self.config.batch_size)
            .await
        {
            Ok(report) => {
                if report.examined > 0 {
                    info!(
                        examined = report.examined,
                        completed = report.completed,
                        failed = report.failed,
                        deferred = report.deferred,
                        "order reconciliation cycle finished"
                    );
                }
                Some(report)
            }
            Err(e) => {
                warn!(error = %e, "order reconciliation cycle failed");
                None
            }
        }
    }
}
