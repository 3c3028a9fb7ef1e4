//! In-process commerce backend for tests and `SKIP_EXTERNALS` runs.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::Mutex;

use super::{Cart, CommerceBackend, CommerceError, CommerceResult};
use crate::payments::types::{merge_data, PaymentSession, SessionData};

#[derive(Default)]
struct State {
    sessions: HashMap<String, PaymentSession>,
    carts: HashMap<String, Cart>,
    /// cart id -> order id
    orders: HashMap<String, String>,
}

#[derive(Default)]
pub struct InMemoryCommerceBackend {
    state: Mutex<State>,
    completion_calls: AtomicUsize,
    fail_completion: AtomicBool,
}

impl InMemoryCommerceBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_session(&self, session: PaymentSession) {
        self.state
            .lock()
            .await
            .sessions
            .insert(session.id.clone(), session);
    }

    pub async fn insert_cart(&self, cart: Cart) {
        self.state.lock().await.carts.insert(cart.id.clone(), cart);
    }

    pub async fn session(&self, id: &str) -> Option<PaymentSession> {
        self.state.lock().await.sessions.get(id).cloned()
    }

    /// Number of `complete_cart` calls, failed ones included.
    pub fn completion_calls(&self) -> usize {
        self.completion_calls.load(Ordering::SeqCst)
    }

    pub fn set_fail_completion(&self, fail: bool) {
        self.fail_completion.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl CommerceBackend for InMemoryCommerceBackend {
    async fn find_session_by_id(&self, id: &str) -> CommerceResult<Option<PaymentSession>> {
        Ok(self.state.lock().await.sessions.get(id).cloned())
    }

    async fn find_session_by_cart_id(
        &self,
        cart_id: &str,
    ) -> CommerceResult<Option<PaymentSession>> {
        let state = self.state.lock().await;
        Ok(state
            .sessions
            .values()
            .filter(|s| s.cart_id == cart_id)
            .max_by_key(|s| s.created_at)
            .cloned())
    }

    async fn find_session_by_payme_transaction_id(
        &self,
        transaction_id: &str,
    ) -> CommerceResult<Option<PaymentSession>> {
        let state = self.state.lock().await;
        Ok(state
            .sessions
            .values()
            .find(|s| {
                s.data
                    .get("payme_transaction_id")
                    .and_then(|v| v.as_str())
                    .is_some_and(|v| v == transaction_id)
            })
            .cloned())
    }

    async fn update_session_data(
        &self,
        id: &str,
        expected_version: i64,
        patch: SessionData,
    ) -> CommerceResult<PaymentSession> {
        let mut state = self.state.lock().await;
        let session = state
            .sessions
            .get_mut(id)
            .ok_or_else(|| CommerceError::NotFound {
                entity: "payment session",
                id: id.to_string(),
            })?;
        if session.version != expected_version {
            return Err(CommerceError::VersionConflict {
                id: id.to_string(),
                expected_version,
            });
        }
        merge_data(&mut session.data, &patch);
        session.version += 1;
        Ok(session.clone())
    }

    async fn list_payme_sessions(&self, from: i64, to: i64) -> CommerceResult<Vec<PaymentSession>> {
        let state = self.state.lock().await;
        let mut found: Vec<(i64, PaymentSession)> = state
            .sessions
            .values()
            .filter_map(|s| {
                let data = s.payme().ok()?;
                data.payme_transaction_id.as_ref()?;
                let created = data.payme_create_time?;
                (from..=to).contains(&created).then(|| (created, s.clone()))
            })
            .collect();
        found.sort_by_key(|(created, _)| *created);
        Ok(found.into_iter().map(|(_, s)| s).collect())
    }

    async fn list_sessions_pending_completion(
        &self,
        limit: u32,
        max_attempts: u32,
    ) -> CommerceResult<Vec<PaymentSession>> {
        let state = self.state.lock().await;
        let mut pending: Vec<PaymentSession> = state
            .sessions
            .values()
            .filter(|s| {
                !s.is_completed()
                    && s.captured_by().is_some()
                    && s.completion_attempts() < max_attempts
            })
            .cloned()
            .collect();
        pending.sort_by_key(|s| {
            (
                s.completion_attempts(),
                s.completion_last_attempt_at().unwrap_or(i64::MIN),
                s.created_at,
            )
        });
        pending.truncate(limit as usize);
        Ok(pending)
    }

    async fn retrieve_cart(&self, cart_id: &str) -> CommerceResult<Cart> {
        self.state
            .lock()
            .await
            .carts
            .get(cart_id)
            .cloned()
            .ok_or_else(|| CommerceError::NotFound {
                entity: "cart",
                id: cart_id.to_string(),
            })
    }

    async fn complete_cart(&self, cart_id: &str) -> CommerceResult<String> {
        let call = self.completion_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_completion.load(Ordering::SeqCst) {
            return Err(CommerceError::CompletionFailed(
                "simulated completion failure".to_string(),
            ));
        }

        let mut state = self.state.lock().await;
        if let Some(order_id) = state.orders.get(cart_id) {
            return Ok(order_id.clone());
        }

        let now = Utc::now();
        let cart = state
            .carts
            .get_mut(cart_id)
            .ok_or_else(|| CommerceError::NotFound {
                entity: "cart",
                id: cart_id.to_string(),
            })?;
        cart.completed_at = Some(now);

        let order_id = format!("order_{:04}", call);
        state.orders.insert(cart_id.to_string(), order_id.clone());
        for session in state.sessions.values_mut().filter(|s| s.cart_id == cart_id) {
            session.completed_at = Some(now);
            session.version += 1;
        }
        Ok(order_id)
    }

    async fn ping(&self) -> CommerceResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bigdecimal::BigDecimal;
    use serde_json::json;

    fn session(id: &str, cart_id: &str) -> PaymentSession {
        PaymentSession {
            id: id.to_string(),
            cart_id: cart_id.to_string(),
            amount: BigDecimal::from(1500),
            currency_code: "uzs".to_string(),
            data: SessionData::new(),
            version: 0,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    #[tokio::test]
    async fn stale_version_is_a_conflict() {
        let backend = InMemoryCommerceBackend::new();
        backend.insert_session(session("ps_1", "cart_1")).await;

        let mut patch = SessionData::new();
        patch.insert("note".to_string(), json!("a"));
        let updated = backend
            .update_session_data("ps_1", 0, patch.clone())
            .await
            .unwrap();
        assert_eq!(updated.version, 1);

        let err = backend
            .update_session_data("ps_1", 0, patch)
            .await
            .unwrap_err();
        assert!(matches!(err, CommerceError::VersionConflict { .. }));
    }

    #[tokio::test]
    async fn lookup_by_payme_transaction_id() {
        let backend = InMemoryCommerceBackend::new();
        let mut s = session("ps_1", "cart_1");
        s.data
            .insert("payme_transaction_id".to_string(), json!("pm-77"));
        backend.insert_session(s).await;

        let found = backend
            .find_session_by_payme_transaction_id("pm-77")
            .await
            .unwrap();
        assert_eq!(found.map(|s| s.id), Some("ps_1".to_string()));
        assert!(backend
            .find_session_by_payme_transaction_id("pm-78")
            .await
            .unwrap()
            .is_none());
    }
}
