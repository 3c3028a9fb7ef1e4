//! Turning captured payments into placed orders.
//!
//! Completion is best effort: the gateway has already been told the payment
//! succeeded, so failures here are logged, counted on the session and left
//! for the reconciliation worker. Whoever places the order also triggers
//! the post-payment OFD submission for Click.

use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use super::clock::{Clock, SystemClock};
use super::fiscal::{build_fiscal_items, FiscalPolicy, FiscalSubmitter};
use super::locks::SessionLocks;
use super::types::{
    Gateway, PaymentSession, SessionData, COMPLETION_ATTEMPTS_KEY, COMPLETION_LAST_ATTEMPT_KEY,
};
use crate::commerce::{CommerceBackend, CommerceError, CommerceResult};

const SESSION_WRITE_ATTEMPTS: usize = 3;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;
/// First retry waits this long; each further failure doubles it.
const RETRY_BASE_MS: i64 = 60_000;
const RETRY_CAP_MS: i64 = 3_600_000;

#[derive(Clone)]
struct FiscalHook {
    submitter: Arc<dyn FiscalSubmitter>,
    policy: FiscalPolicy,
}

#[derive(Clone)]
pub struct OrderCompleter {
    backend: Arc<dyn CommerceBackend>,
    timeout: Duration,
    max_attempts: u32,
    clock: Arc<dyn Clock>,
    fiscal: Option<FiscalHook>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub examined: usize,
    pub completed: usize,
    pub failed: usize,
    /// Still inside their retry delay
    pub deferred: usize,
}

/// Delay before the next attempt after `attempts` failures.
pub fn retry_delay_ms(attempts: u32) -> i64 {
    if attempts == 0 {
        return 0;
    }
    let shift = (attempts - 1).min(16);
    RETRY_BASE_MS.saturating_mul(1 << shift).min(RETRY_CAP_MS)
}

impl OrderCompleter {
    pub fn new(backend: Arc<dyn CommerceBackend>, timeout: Duration) -> Self {
        Self {
            backend,
            timeout,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            clock: Arc::new(SystemClock),
            fiscal: None,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Submit receipt items to OFD after a Click order is placed.
    pub fn with_fiscal_submitter(
        mut self,
        submitter: Arc<dyn FiscalSubmitter>,
        policy: FiscalPolicy,
    ) -> Self {
        self.fiscal = Some(FiscalHook { submitter, policy });
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Complete the cart and record the order id on the session. The caller
    /// must hold the session lock. Never fails; returns the order id when
    /// one was placed.
    pub async fn complete_best_effort(
        &self,
        session_id: &str,
        cart_id: &str,
        gateway: Gateway,
    ) -> Option<String> {
        let outcome = tokio::time::timeout(self.timeout, self.backend.complete_cart(cart_id)).await;

        let order_id = match outcome {
            Ok(Ok(order_id)) => order_id,
            Ok(Err(e)) => {
                error!(
                    gateway = %gateway,
                    session_id = %session_id,
                    cart_id = %cart_id,
                    error = %e,
                    "Payment captured but cart completion failed; left for reconciliation"
                );
                self.record_failed_attempt(session_id, gateway).await;
                return None;
            }
            Err(_) => {
                error!(
                    gateway = %gateway,
                    session_id = %session_id,
                    cart_id = %cart_id,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Payment captured but cart completion timed out; left for reconciliation"
                );
                self.record_failed_attempt(session_id, gateway).await;
                return None;
            }
        };

        info!(
            gateway = %gateway,
            session_id = %session_id,
            cart_id = %cart_id,
            order_id = %order_id,
            "Order placed"
        );

        let mut patch = SessionData::new();
        patch.insert(
            gateway.order_id_key().to_string(),
            JsonValue::String(order_id.clone()),
        );
        match self.write_with_refetch(session_id, |_| patch.clone()).await {
            Ok(session) => {
                if gateway == Gateway::Click {
                    self.spawn_fiscal_submission(&session, cart_id.to_string());
                }
            }
            Err(e) => warn!(
                session_id = %session_id,
                order_id = %order_id,
                error = %e,
                "Order placed but order id not written to session"
            ),
        }
        Some(order_id)
    }

    async fn record_failed_attempt(&self, session_id: &str, gateway: Gateway) {
        let now = self.clock.now_ms();
        let written = self
            .write_with_refetch(session_id, |session| {
                let mut patch = SessionData::new();
                patch.insert(
                    COMPLETION_ATTEMPTS_KEY.to_string(),
                    JsonValue::from(session.completion_attempts().saturating_add(1)),
                );
                patch.insert(COMPLETION_LAST_ATTEMPT_KEY.to_string(), JsonValue::from(now));
                patch
            })
            .await;

        match written {
            Ok(session) if session.completion_attempts() >= self.max_attempts => error!(
                gateway = %gateway,
                session_id = %session_id,
                attempts = session.completion_attempts(),
                "Order completion gave up after repeated failures; manual reconciliation required"
            ),
            Ok(_) => {}
            Err(e) => warn!(
                session_id = %session_id,
                error = %e,
                "Could not record failed completion attempt"
            ),
        }
    }

    /// Completion may itself touch the session row, so re-read before each
    /// versioned write.
    async fn write_with_refetch<F>(
        &self,
        session_id: &str,
        build_patch: F,
    ) -> CommerceResult<PaymentSession>
    where
        F: Fn(&PaymentSession) -> SessionData,
    {
        let mut last_err = None;
        for _ in 0..SESSION_WRITE_ATTEMPTS {
            let session = self
                .backend
                .find_session_by_id(session_id)
                .await?
                .ok_or_else(|| CommerceError::NotFound {
                    entity: "payment session",
                    id: session_id.to_string(),
                })?;
            match self
                .backend
                .update_session_data(session_id, session.version, build_patch(&session))
                .await
            {
                Ok(updated) => return Ok(updated),
                Err(e @ CommerceError::VersionConflict { .. }) => last_err = Some(e),
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or(CommerceError::VersionConflict {
            id: session_id.to_string(),
            expected_version: -1,
        }))
    }

    /// Fire and forget; gateway responses never wait on OFD.
    fn spawn_fiscal_submission(&self, session: &PaymentSession, cart_id: String) {
        let Some(hook) = self.fiscal.clone() else {
            return;
        };
        let Some(expected) = session.amount_minor() else {
            return;
        };
        let payment_id = match session.click() {
            Ok(data) => data.click_paydoc_id,
            Err(_) => None,
        };
        let Some(payment_id) = payment_id else {
            warn!(session_id = %session.id, "Click session has no paydoc id; OFD submission skipped");
            return;
        };
        let backend = self.backend.clone();
        let session_id = session.id.clone();

        tokio::spawn(async move {
            let cart = match backend.retrieve_cart(&cart_id).await {
                Ok(cart) => cart,
                Err(e) => {
                    error!(session_id = %session_id, cart_id = %cart_id, error = %e, "Cart unavailable for OFD submission");
                    return;
                }
            };
            let items = match build_fiscal_items(&cart, expected, &hook.policy) {
                Ok(items) => items,
                Err(e) => {
                    error!(session_id = %session_id, cart_id = %cart_id, error = %e, "Cart could not be fiscalized after payment");
                    return;
                }
            };
            match hook.submitter.submit_items(&payment_id, &items, expected).await {
                Ok(()) => info!(session_id = %session_id, payment_id = %payment_id, "OFD items submitted"),
                Err(e) => error!(session_id = %session_id, payment_id = %payment_id, error = %e, "OFD submission failed"),
            }
        });
    }

    /// Retry completion for captured sessions whose order never got placed.
    /// Sessions at the attempt cap are left alone; those still inside their
    /// retry delay are deferred to a later cycle.
    pub async fn reconcile_pending(
        &self,
        locks: &SessionLocks,
        limit: u32,
    ) -> CommerceResult<ReconcileReport> {
        let pending = self
            .backend
            .list_sessions_pending_completion(limit, self.max_attempts)
            .await?;
        let mut report = ReconcileReport::default();
        let now = self.clock.now_ms();

        for candidate in pending {
            report.examined += 1;
            let _guard = locks.lock(&candidate.id).await;

            // A handler may have finished it while we waited for the lock
            let Some(session) = self.backend.find_session_by_id(&candidate.id).await? else {
                continue;
            };
            if session.is_completed() {
                continue;
            }
            let Some(gateway) = session.captured_by() else {
                continue;
            };
            let attempts = session.completion_attempts();
            if attempts >= self.max_attempts {
                continue;
            }
            if let Some(last) = session.completion_last_attempt_at() {
                if now.saturating_sub(last) < retry_delay_ms(attempts) {
                    report.deferred += 1;
                    continue;
                }
            }
            let cart_id = session
                .data
                .get("cart_id")
                .and_then(|v| v.as_str())
                .unwrap_or(&session.cart_id)
                .to_string();

            match self
                .complete_best_effort(&session.id, &cart_id, gateway)
                .await
            {
                Some(_) => report.completed += 1,
                None => report.failed += 1,
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commerce::{Cart, InMemoryCommerceBackend};
    use crate::payments::clock::ManualClock;
    use crate::payments::types::PaymentSession;
    use bigdecimal::BigDecimal;
    use chrono::Utc;
    use serde_json::json;

    async fn backend_with_performed_session() -> Arc<InMemoryCommerceBackend> {
        let backend = Arc::new(InMemoryCommerceBackend::new());
        let mut data = SessionData::new();
        data.insert("payme_state".to_string(), json!(2));
        data.insert("payme_transaction_id".to_string(), json!("pm-1"));
        backend
            .insert_session(PaymentSession {
                id: "ps_1".to_string(),
                cart_id: "cart_1".to_string(),
                amount: BigDecimal::from(10),
                currency_code: "uzs".to_string(),
                data,
                version: 4,
                created_at: Utc::now(),
                completed_at: None,
            })
            .await;
        backend
            .insert_cart(Cart {
                id: "cart_1".to_string(),
                currency_code: "uzs".to_string(),
                items: vec![],
                shipping_total_minor: 0,
                total_minor: 1_000,
                completed_at: None,
            })
            .await;
        backend
    }

    fn completer(backend: &Arc<InMemoryCommerceBackend>, clock: &Arc<ManualClock>) -> OrderCompleter {
        OrderCompleter::new(backend.clone(), Duration::from_secs(5))
            .with_max_attempts(3)
            .with_clock(clock.clone())
    }

    #[test]
    fn retry_delay_doubles_up_to_an_hour() {
        assert_eq!(retry_delay_ms(0), 0);
        assert_eq!(retry_delay_ms(1), 60_000);
        assert_eq!(retry_delay_ms(2), 120_000);
        assert_eq!(retry_delay_ms(3), 240_000);
        assert_eq!(retry_delay_ms(7), RETRY_CAP_MS);
        assert_eq!(retry_delay_ms(u32::MAX), RETRY_CAP_MS);
    }

    #[tokio::test]
    async fn failed_completion_is_swallowed_then_reconciled() {
        let backend = backend_with_performed_session().await;
        let clock = Arc::new(ManualClock::new(1_000_000));
        let completer = completer(&backend, &clock);
        let locks = SessionLocks::new();

        backend.set_fail_completion(true);
        assert_eq!(
            completer
                .complete_best_effort("ps_1", "cart_1", Gateway::Payme)
                .await,
            None
        );
        let session = backend.session("ps_1").await.unwrap();
        assert_eq!(session.completion_attempts(), 1);
        assert_eq!(session.completion_last_attempt_at(), Some(1_000_000));

        backend.set_fail_completion(false);
        let early = completer.reconcile_pending(&locks, 10).await.unwrap();
        assert_eq!(early.deferred, 1);
        assert_eq!(backend.completion_calls(), 1);

        clock.advance_ms(60_000);
        let report = completer.reconcile_pending(&locks, 10).await.unwrap();
        assert_eq!(
            report,
            ReconcileReport {
                examined: 1,
                completed: 1,
                failed: 0,
                deferred: 0,
            }
        );

        let session = backend.session("ps_1").await.unwrap();
        assert!(session.is_completed());
        assert!(session.data["medusa_order_id"].is_string());

        let again = completer.reconcile_pending(&locks, 10).await.unwrap();
        assert_eq!(again.examined, 0);
    }

    #[tokio::test]
    async fn reconciliation_stops_at_the_attempt_cap() {
        let backend = backend_with_performed_session().await;
        let clock = Arc::new(ManualClock::new(1_000_000));
        let completer = completer(&backend, &clock);
        let locks = SessionLocks::new();
        backend.set_fail_completion(true);

        completer
            .complete_best_effort("ps_1", "cart_1", Gateway::Payme)
            .await;
        for _ in 0..5 {
            clock.advance_ms(RETRY_CAP_MS);
            completer.reconcile_pending(&locks, 10).await.unwrap();
        }

        let session = backend.session("ps_1").await.unwrap();
        assert_eq!(session.completion_attempts(), 3);
        assert_eq!(backend.completion_calls(), 3);

        backend.set_fail_completion(false);
        clock.advance_ms(RETRY_CAP_MS);
        let report = completer.reconcile_pending(&locks, 10).await.unwrap();
        assert_eq!(report.examined, 0);
        assert!(!backend.session("ps_1").await.unwrap().is_completed());
    }

    #[tokio::test]
    async fn least_attempted_sessions_are_retried_first() {
        let backend = backend_with_performed_session().await;
        let mut fresh = backend.session("ps_1").await.unwrap();
        fresh.id = "ps_2".to_string();
        fresh.cart_id = "cart_2".to_string();
        fresh.created_at = fresh.created_at + chrono::Duration::seconds(1);
        backend.insert_session(fresh).await;

        let mut patch = SessionData::new();
        patch.insert(COMPLETION_ATTEMPTS_KEY.to_string(), json!(2));
        patch.insert(COMPLETION_LAST_ATTEMPT_KEY.to_string(), json!(0));
        backend.update_session_data("ps_1", 4, patch).await.unwrap();

        let pending = backend.list_sessions_pending_completion(1, 10).await.unwrap();
        assert_eq!(pending[0].id, "ps_2");
        let capped = backend.list_sessions_pending_completion(10, 2).await.unwrap();
        assert_eq!(capped.len(), 1);
        assert_eq!(capped[0].id, "ps_2");
    }
}
