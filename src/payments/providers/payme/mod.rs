//! Payme Merchant API (JSON-RPC over HTTP).
//!
//! Transaction state lives in the payment session's `data` under `payme_*`
//! keys. Every mutating method holds the session lock across re-fetch,
//! decision, versioned write and (for Perform) order completion.

pub mod types;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use self::types::*;
use crate::commerce::{CommerceBackend, CommerceError};
use crate::config::{env_opt, env_parse, ConfigError};
use crate::payments::clock::{Clock, SystemClock};
use crate::payments::completion::OrderCompleter;
use crate::payments::fiscal::{build_fiscal_items, FiscalPolicy};
use crate::payments::locks::SessionLocks;
use crate::payments::types::{Gateway, PaymeSessionData, PaymeState, PaymentSession, SessionData};
use crate::payments::utils::secure_eq;

const BASIC_AUTH_LOGIN: &str = "Paycom";

#[derive(Debug, Clone)]
pub struct PaymeConfig {
    pub merchant_id: String,
    pub key: String,
    pub test_key: Option<String>,
    pub checkout_url: String,
    pub transaction_timeout: Duration,
    /// Rounding guard when comparing amounts, tiyin
    pub amount_tolerance_minor: i64,
}

impl Default for PaymeConfig {
    fn default() -> Self {
        Self {
            merchant_id: String::new(),
            key: String::new(),
            test_key: None,
            checkout_url: "https://checkout.paycom.uz".to_string(),
            transaction_timeout: Duration::from_secs(43_200),
            amount_tolerance_minor: 100,
        }
    }
}

impl PaymeConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            merchant_id: env_opt("PAYME_MERCHANT_ID").unwrap_or_default(),
            key: env_opt("PAYME_KEY").unwrap_or_default(),
            test_key: env_opt("PAYME_TEST_KEY"),
            checkout_url: env_opt("PAYME_CHECKOUT_URL")
                .unwrap_or(defaults.checkout_url)
                .trim_end_matches('/')
                .to_string(),
            transaction_timeout: Duration::from_secs(env_parse(
                "PAYME_TRANSACTION_TIMEOUT_SECS",
                defaults.transaction_timeout.as_secs(),
            )?),
            amount_tolerance_minor: env_parse(
                "PAYME_AMOUNT_TOLERANCE_MINOR",
                defaults.amount_tolerance_minor,
            )?,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.merchant_id.is_empty() {
            return Err(ConfigError::MissingVariable("PAYME_MERCHANT_ID".to_string()));
        }
        if self.key.is_empty() {
            return Err(ConfigError::MissingVariable("PAYME_KEY".to_string()));
        }
        if self.amount_tolerance_minor < 0 {
            return Err(ConfigError::InvalidValue(
                "PAYME_AMOUNT_TOLERANCE_MINOR".to_string(),
            ));
        }
        Ok(())
    }

    fn timeout_ms(&self) -> i64 {
        i64::try_from(self.transaction_timeout.as_millis()).unwrap_or(i64::MAX)
    }
}

/// Which id space to try first when a method receives a bare `id`.
///
/// Payme sends its own transaction id, but some integrations echo the
/// session id we returned as `transaction`; both are accepted.
#[derive(Debug, Clone, Copy)]
enum Lookup {
    LocalFirst,
    GatewayFirst,
}

pub struct PaymeHandler {
    config: PaymeConfig,
    backend: Arc<dyn CommerceBackend>,
    locks: SessionLocks,
    completer: OrderCompleter,
    fiscal: FiscalPolicy,
    clock: Arc<dyn Clock>,
}

impl PaymeHandler {
    pub fn new(
        config: PaymeConfig,
        backend: Arc<dyn CommerceBackend>,
        locks: SessionLocks,
        completer: OrderCompleter,
        fiscal: FiscalPolicy,
    ) -> Self {
        Self {
            config,
            backend,
            locks,
            completer,
            fiscal,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// `Authorization: Basic base64("Paycom:<key>")`, production or test key.
    pub fn authorize(&self, header: Option<&str>) -> bool {
        let Some(encoded) = header.and_then(|h| h.trim().strip_prefix("Basic ")) else {
            return false;
        };
        let Ok(decoded) = STANDARD.decode(encoded.trim()) else {
            return false;
        };
        let Ok(credentials) = String::from_utf8(decoded) else {
            return false;
        };
        let Some((login, password)) = credentials.split_once(':') else {
            return false;
        };
        if login != BASIC_AUTH_LOGIN {
            return false;
        }

        let key_matches = |key: &str| !key.is_empty() && secure_eq(key.as_bytes(), password.as_bytes());
        key_matches(&self.config.key) || self.config.test_key.as_deref().is_some_and(key_matches)
    }

    /// Full request cycle: parse, authorize, dispatch, render. Always yields
    /// a JSON-RPC response body.
    pub async fn handle_raw(&self, authorization: Option<&str>, body: &[u8]) -> JsonValue {
        let request: RpcRequest = match serde_json::from_slice(body) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "Payme request is not valid JSON-RPC");
                return rpc_error(&JsonValue::Null, &PaymeError::parse_error());
            }
        };

        if !self.authorize(authorization) {
            warn!("Payme request rejected: bad credentials");
            return rpc_error(&request.id, &PaymeError::insufficient_privilege());
        }

        let (Some(method), Some(params)) = (request.method.as_deref(), request.params) else {
            return rpc_error(
                &request.id,
                &PaymeError::invalid_request("method and params are required"),
            );
        };

        match self.dispatch(method, params).await {
            Ok(result) => rpc_result(&request.id, result),
            Err(e) => {
                info!(method, code = e.code, data = ?e.data, "Payme method rejected");
                rpc_error(&request.id, &e)
            }
        }
    }

    pub async fn dispatch(&self, method: &str, params: JsonValue) -> Result<JsonValue, PaymeError> {
        match method {
            "CheckPerformTransaction" => {
                render(self.check_perform_transaction(parse(params)?).await?)
            }
            "CreateTransaction" => render(self.create_transaction(parse(params)?).await?),
            "PerformTransaction" => render(self.perform_transaction(parse(params)?).await?),
            "CancelTransaction" => render(self.cancel_transaction(parse(params)?).await?),
            "CheckTransaction" => render(self.check_transaction(parse(params)?).await?),
            "GetStatement" => render(self.get_statement(parse(params)?).await?),
            other => Err(PaymeError::method_not_found(other)),
        }
    }

    pub async fn check_perform_transaction(
        &self,
        params: CheckPerformParams,
    ) -> Result<CheckPerformResult, PaymeError> {
        let amount = amount_tiyin(&params.amount).ok_or_else(PaymeError::invalid_amount)?;
        let session = self
            .find_by_cart(&params.account.order_id)
            .await?
            .ok_or_else(PaymeError::invalid_account)?;
        payme_view(&session)?;

        if session.is_completed() || session.captured_by().is_some() {
            return Err(PaymeError::already_paid());
        }
        if session.active_gateway() == Some(Gateway::Click) {
            return Err(PaymeError::another_transaction_in_progress());
        }
        let expected = self.check_amount(&session, amount)?;

        let cart = self.backend.retrieve_cart(&session.cart_id).await.map_err(|e| {
            error!(cart_id = %session.cart_id, error = %e, "Cart lookup failed during CheckPerformTransaction");
            PaymeError::could_not_perform("cart_unavailable")
        })?;
        let items = build_fiscal_items(&cart, expected, &self.fiscal).map_err(|e| {
            warn!(cart_id = %session.cart_id, error = %e, "Cart cannot be fiscalized");
            PaymeError::could_not_perform("fiscalization_failed")
        })?;

        Ok(CheckPerformResult {
            allow: true,
            detail: ReceiptDetail {
                receipt_type: 0,
                items: items.iter().map(ReceiptItem::from).collect(),
            },
        })
    }

    pub async fn create_transaction(
        &self,
        params: CreateParams,
    ) -> Result<CreateResult, PaymeError> {
        let now = self.clock.now_ms();
        if !within_window(now, params.time, self.config.timeout_ms()) {
            return Err(PaymeError::could_not_perform("transaction_timeout"));
        }
        let amount = amount_tiyin(&params.amount).ok_or_else(PaymeError::invalid_amount)?;

        let located = self
            .find_by_cart(&params.account.order_id)
            .await?
            .ok_or_else(PaymeError::invalid_account)?;
        let _guard = self.locks.lock(&located.id).await;
        let session = self.refetch(&located.id).await?;
        let data = payme_view(&session)?;

        if data.payme_transaction_id.as_deref() == Some(params.id.as_str()) {
            return Ok(CreateResult {
                create_time: data.payme_create_time.unwrap_or(0),
                transaction: session.id.clone(),
                state: data.state().code(),
            });
        }

        match data.state() {
            PaymeState::Performed => return Err(PaymeError::already_paid()),
            PaymeState::Created => {
                warn!(
                    session_id = %session.id,
                    active = ?data.payme_transaction_id,
                    incoming = %params.id,
                    "Second Payme transaction attempted on a session"
                );
                return Err(PaymeError::another_transaction_in_progress());
            }
            _ => {}
        }
        if session.is_completed() || session.captured_by().is_some() {
            return Err(PaymeError::already_paid());
        }
        if session.active_gateway() == Some(Gateway::Click) {
            warn!(
                session_id = %session.id,
                incoming = %params.id,
                "Payme transaction attempted on a session prepared by Click"
            );
            return Err(PaymeError::another_transaction_in_progress());
        }
        self.check_amount(&session, amount)?;

        let patch = PaymeSessionData {
            payme_transaction_id: Some(params.id.clone()),
            payme_create_time: Some(now),
            payme_state: Some(PaymeState::Created),
            payme_amount: Some(amount),
            cart_id: Some(session.cart_id.clone()),
            ..Default::default()
        }
        .to_replacing_patch();
        let updated = self.write(&session, patch).await?;

        info!(
            session_id = %updated.id,
            payme_transaction_id = %params.id,
            amount,
            "Payme transaction created"
        );
        Ok(CreateResult {
            create_time: now,
            transaction: updated.id,
            state: PaymeState::Created.code(),
        })
    }

    pub async fn perform_transaction(&self, params: IdParams) -> Result<PerformResult, PaymeError> {
        let located = self
            .resolve(&params.id, Lookup::LocalFirst)
            .await?
            .ok_or_else(PaymeError::transaction_not_found)?;
        let _guard = self.locks.lock(&located.id).await;
        let session = self.refetch(&located.id).await?;
        let data = payme_view(&session)?;

        match data.state() {
            PaymeState::Performed => {
                return Ok(PerformResult {
                    transaction: session.id.clone(),
                    perform_time: data.payme_perform_time.unwrap_or(0),
                    state: PaymeState::Performed.code(),
                })
            }
            PaymeState::Created => {}
            _ => return Err(PaymeError::could_not_perform("invalid_state")),
        }

        let now = self.clock.now_ms();
        let created = data.payme_create_time.unwrap_or(now);
        if !within_window(now, created, self.config.timeout_ms()) {
            let patch = PaymeSessionData {
                payme_state: Some(PaymeState::CancelledBeforePerform),
                payme_cancel_time: Some(now),
                payme_cancel_reason: Some(CANCEL_REASON_TIMEOUT),
                ..Default::default()
            }
            .to_patch();
            self.write(&session, patch).await?;
            warn!(session_id = %session.id, "Payme transaction expired before perform");
            return Err(PaymeError::could_not_perform("transaction_timeout"));
        }

        let patch = PaymeSessionData {
            payme_state: Some(PaymeState::Performed),
            payme_perform_time: Some(now),
            ..Default::default()
        }
        .to_patch();
        let updated = self.write(&session, patch).await?;
        info!(
            session_id = %updated.id,
            payme_transaction_id = ?data.payme_transaction_id,
            "Payme transaction performed"
        );

        if !updated.is_completed() {
            let cart_id = data.cart_id.as_deref().unwrap_or(&updated.cart_id);
            self.completer
                .complete_best_effort(&updated.id, cart_id, Gateway::Payme)
                .await;
        }

        Ok(PerformResult {
            transaction: updated.id,
            perform_time: now,
            state: PaymeState::Performed.code(),
        })
    }

    pub async fn cancel_transaction(&self, params: CancelParams) -> Result<CancelResult, PaymeError> {
        let located = self
            .resolve(&params.id, Lookup::GatewayFirst)
            .await?
            .ok_or_else(PaymeError::transaction_not_found)?;
        let _guard = self.locks.lock(&located.id).await;
        let session = self.refetch(&located.id).await?;
        let data = payme_view(&session)?;

        let next = match data.state() {
            state if state.is_cancelled() => {
                return Ok(CancelResult {
                    transaction: session.id.clone(),
                    cancel_time: data.payme_cancel_time.unwrap_or(0),
                    state: state.code(),
                })
            }
            PaymeState::Created => PaymeState::CancelledBeforePerform,
            PaymeState::Performed => PaymeState::CancelledAfterPerform,
            _ => return Err(PaymeError::transaction_not_found()),
        };

        let now = self.clock.now_ms();
        let patch = PaymeSessionData {
            payme_state: Some(next),
            payme_cancel_time: Some(now),
            payme_cancel_reason: params.reason,
            ..Default::default()
        }
        .to_patch();
        let updated = self.write(&session, patch).await?;

        if next == PaymeState::CancelledAfterPerform {
            warn!(
                session_id = %updated.id,
                reason = ?params.reason,
                "Performed Payme transaction cancelled; refund handling required"
            );
        } else {
            info!(session_id = %updated.id, reason = ?params.reason, "Payme transaction cancelled");
        }

        Ok(CancelResult {
            transaction: updated.id,
            cancel_time: now,
            state: next.code(),
        })
    }

    pub async fn check_transaction(&self, params: IdParams) -> Result<CheckResult, PaymeError> {
        let session = self
            .resolve(&params.id, Lookup::GatewayFirst)
            .await?
            .ok_or_else(PaymeError::transaction_not_found)?;
        let data = payme_view(&session)?;
        if data.payme_transaction_id.is_none() {
            return Err(PaymeError::transaction_not_found());
        }

        Ok(CheckResult {
            create_time: data.payme_create_time.unwrap_or(0),
            perform_time: data.payme_perform_time.unwrap_or(0),
            cancel_time: data.payme_cancel_time.unwrap_or(0),
            transaction: session.id.clone(),
            state: data.state().code(),
            reason: data.payme_cancel_reason,
        })
    }

    pub async fn get_statement(&self, params: StatementParams) -> Result<StatementResult, PaymeError> {
        let sessions = self
            .backend
            .list_payme_sessions(params.from, params.to)
            .await
            .map_err(|e| {
                error!(error = %e, "Payme statement query failed");
                PaymeError::system_error()
            })?;

        let mut transactions = Vec::with_capacity(sessions.len());
        for session in sessions {
            let data = payme_view(&session)?;
            let (Some(id), Some(created)) = (data.payme_transaction_id.clone(), data.payme_create_time)
            else {
                continue;
            };
            transactions.push(StatementEntry {
                id,
                time: created,
                amount: data
                    .payme_amount
                    .or_else(|| session.amount_minor())
                    .unwrap_or(0),
                account: StatementAccount {
                    order_id: data.cart_id.clone().unwrap_or_else(|| session.cart_id.clone()),
                },
                create_time: created,
                perform_time: data.payme_perform_time.unwrap_or(0),
                cancel_time: data.payme_cancel_time.unwrap_or(0),
                transaction: session.id.clone(),
                state: data.state().code(),
                reason: data.payme_cancel_reason,
            });
        }
        transactions.sort_by_key(|t| t.create_time);

        Ok(StatementResult { transactions })
    }

    /// Hosted checkout link: `{checkout_url}/{base64("m=..;ac.order_id=..;a=..")}`.
    pub fn checkout_url(&self, cart_id: &str, amount_minor: i64) -> String {
        let params = format!(
            "m={};ac.order_id={};a={}",
            self.config.merchant_id, cart_id, amount_minor
        );
        format!("{}/{}", self.config.checkout_url, STANDARD.encode(params))
    }

    fn check_amount(&self, session: &PaymentSession, amount: i64) -> Result<i64, PaymeError> {
        let expected = session.amount_minor().ok_or_else(|| {
            error!(session_id = %session.id, amount = %session.amount, "Session amount is not representable");
            PaymeError::could_not_perform("invalid_session_amount")
        })?;
        if (amount - expected).abs() > self.config.amount_tolerance_minor {
            info!(session_id = %session.id, expected, received = amount, "Payme amount mismatch");
            return Err(PaymeError::invalid_amount());
        }
        Ok(expected)
    }

    async fn find_by_cart(&self, cart_id: &str) -> Result<Option<PaymentSession>, PaymeError> {
        self.backend
            .find_session_by_cart_id(cart_id)
            .await
            .map_err(backend_failure)
    }

    async fn resolve(&self, id: &str, order: Lookup) -> Result<Option<PaymentSession>, PaymeError> {
        let by_local = || self.backend.find_session_by_id(id);
        let by_gateway = || self.backend.find_session_by_payme_transaction_id(id);

        let found = match order {
            Lookup::LocalFirst => match by_local().await.map_err(backend_failure)? {
                Some(session) => Some(session),
                None => by_gateway().await.map_err(backend_failure)?,
            },
            Lookup::GatewayFirst => match by_gateway().await.map_err(backend_failure)? {
                Some(session) => Some(session),
                None => by_local().await.map_err(backend_failure)?,
            },
        };
        Ok(found)
    }

    async fn refetch(&self, id: &str) -> Result<PaymentSession, PaymeError> {
        self.backend
            .find_session_by_id(id)
            .await
            .map_err(backend_failure)?
            .ok_or_else(PaymeError::transaction_not_found)
    }

    async fn write(
        &self,
        session: &PaymentSession,
        patch: SessionData,
    ) -> Result<PaymentSession, PaymeError> {
        self.backend
            .update_session_data(&session.id, session.version, patch)
            .await
            .map_err(|e| match e {
                CommerceError::VersionConflict { .. } => {
                    warn!(session_id = %session.id, "Payme write lost a version race");
                    PaymeError::could_not_perform("concurrent_update")
                }
                other => backend_failure(other),
            })
    }
}

/// `since` is no more than `window_ms` in the past. A gap that does not fit
/// in an i64 counts as stale.
fn within_window(now: i64, since: i64, window_ms: i64) -> bool {
    now.checked_sub(since).is_some_and(|age| age <= window_ms)
}

fn backend_failure(err: CommerceError) -> PaymeError {
    error!(error = %err, "Commerce backend failure during Payme call");
    PaymeError::could_not_perform("backend_unavailable")
}

fn payme_view(session: &PaymentSession) -> Result<PaymeSessionData, PaymeError> {
    session.payme().map_err(|e| {
        error!(session_id = %session.id, error = %e, "Unreadable Payme session data");
        PaymeError::system_error()
    })
}

fn parse<T: DeserializeOwned>(params: JsonValue) -> Result<T, PaymeError> {
    serde_json::from_value(params).map_err(|e| PaymeError::invalid_request(&e.to_string()))
}

fn render<T: Serialize>(result: T) -> Result<JsonValue, PaymeError> {
    serde_json::to_value(result).map_err(|_| PaymeError::system_error())
}
