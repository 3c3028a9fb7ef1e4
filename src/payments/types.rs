//! Payment session and the typed per-gateway views of its `data` bag.
//!
//! `data` is an open JSON object shared by both gateways and by the commerce
//! backend. Handlers read it into a typed view, decide, and write back only
//! the keys they own as a merge patch; unknown keys are never touched.

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::fmt;

use super::amount::decimal_to_minor_units;

pub type SessionData = Map<String, JsonValue>;

pub const COMPLETION_ATTEMPTS_KEY: &str = "completion_attempts";
pub const COMPLETION_LAST_ATTEMPT_KEY: &str = "completion_last_attempt_at";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentSession {
    pub id: String,
    pub cart_id: String,
    /// Authoritative expected amount in major units
    pub amount: BigDecimal,
    pub currency_code: String,
    pub data: SessionData,
    /// Bumped on every data write; the compare-and-swap token
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl PaymentSession {
    pub fn amount_minor(&self) -> Option<i64> {
        decimal_to_minor_units(&self.amount)
    }

    pub fn is_completed(&self) -> bool {
        self.completed_at.is_some()
    }

    pub fn payme(&self) -> Result<PaymeSessionData, serde_json::Error> {
        PaymeSessionData::from_data(&self.data)
    }

    pub fn click(&self) -> Result<ClickSessionData, serde_json::Error> {
        ClickSessionData::from_data(&self.data)
    }

    /// Failed order placements recorded against a captured session.
    pub fn completion_attempts(&self) -> u32 {
        self.data
            .get(COMPLETION_ATTEMPTS_KEY)
            .and_then(JsonValue::as_u64)
            .and_then(|n| u32::try_from(n).ok())
            .unwrap_or(0)
    }

    /// Epoch ms of the last failed order placement.
    pub fn completion_last_attempt_at(&self) -> Option<i64> {
        self.data
            .get(COMPLETION_LAST_ATTEMPT_KEY)
            .and_then(JsonValue::as_i64)
    }

    /// The gateway that captured payment for this session, if any.
    pub fn captured_by(&self) -> Option<Gateway> {
        if self
            .payme()
            .is_ok_and(|d| d.state() == PaymeState::Performed)
        {
            return Some(Gateway::Payme);
        }
        if self
            .click()
            .is_ok_and(|d| d.state() == ClickState::Completed && d.click_error.unwrap_or(0) == 0)
        {
            return Some(Gateway::Click);
        }
        None
    }

    /// The gateway holding a live transaction (created/prepared or
    /// captured). At most one gateway may hold a session at a time.
    pub fn active_gateway(&self) -> Option<Gateway> {
        if let Some(gateway) = self.captured_by() {
            return Some(gateway);
        }
        if self.payme().is_ok_and(|d| d.state() == PaymeState::Created) {
            return Some(Gateway::Payme);
        }
        if self.click().is_ok_and(|d| d.state() == ClickState::Prepared) {
            return Some(Gateway::Click);
        }
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gateway {
    Payme,
    Click,
}

impl Gateway {
    pub fn as_str(self) -> &'static str {
        match self {
            Gateway::Payme => "payme",
            Gateway::Click => "click",
        }
    }

    /// Session data key the placed order id is written to.
    pub fn order_id_key(self) -> &'static str {
        match self {
            Gateway::Payme => "medusa_order_id",
            Gateway::Click => "transaction_id",
        }
    }
}

impl fmt::Display for Gateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payme transaction state as stored in `payme_state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "i8", into = "i8")]
pub enum PaymeState {
    None,
    Created,
    Performed,
    CancelledBeforePerform,
    CancelledAfterPerform,
}

impl PaymeState {
    pub fn code(self) -> i8 {
        match self {
            PaymeState::None => 0,
            PaymeState::Created => 1,
            PaymeState::Performed => 2,
            PaymeState::CancelledBeforePerform => -1,
            PaymeState::CancelledAfterPerform => -2,
        }
    }

    pub fn is_cancelled(self) -> bool {
        matches!(
            self,
            PaymeState::CancelledBeforePerform | PaymeState::CancelledAfterPerform
        )
    }

    /// Created or performed: the transaction id owns the session.
    pub fn is_active(self) -> bool {
        matches!(self, PaymeState::Created | PaymeState::Performed)
    }
}

impl TryFrom<i8> for PaymeState {
    type Error = String;

    fn try_from(code: i8) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(PaymeState::None),
            1 => Ok(PaymeState::Created),
            2 => Ok(PaymeState::Performed),
            -1 => Ok(PaymeState::CancelledBeforePerform),
            -2 => Ok(PaymeState::CancelledAfterPerform),
            other => Err(format!("unknown payme_state {}", other)),
        }
    }
}

impl From<PaymeState> for i8 {
    fn from(state: PaymeState) -> Self {
        state.code()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PaymeSessionData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payme_transaction_id: Option<String>,
    /// Milliseconds since epoch, our clock
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payme_create_time: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payme_state: Option<PaymeState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payme_perform_time: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payme_cancel_time: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payme_cancel_reason: Option<i32>,
    /// Amount Payme announced at Create, in tiyin
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payme_amount: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cart_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub medusa_order_id: Option<String>,
}

/// Keys cleared when a new Payme transaction replaces a cancelled one.
const PAYME_TRANSIENT_KEYS: [&str; 3] = [
    "payme_perform_time",
    "payme_cancel_time",
    "payme_cancel_reason",
];

impl PaymeSessionData {
    pub fn from_data(data: &SessionData) -> Result<Self, serde_json::Error> {
        serde_json::from_value(JsonValue::Object(data.clone()))
    }

    /// Only the populated fields, for a merge write.
    pub fn to_patch(&self) -> SessionData {
        to_patch(self)
    }

    /// Like [`to_patch`](Self::to_patch) but explicitly nulls the
    /// perform/cancel fields left over from a previous transaction.
    pub fn to_replacing_patch(&self) -> SessionData {
        let mut patch = self.to_patch();
        for key in PAYME_TRANSIENT_KEYS {
            patch.entry(key).or_insert(JsonValue::Null);
        }
        patch
    }

    pub fn state(&self) -> PaymeState {
        self.payme_state.unwrap_or(PaymeState::None)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClickState {
    Pending,
    Prepared,
    Completed,
    Cancelled,
    Error,
}

impl fmt::Display for ClickState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ClickState::Pending => "pending",
            ClickState::Prepared => "prepared",
            ClickState::Completed => "completed",
            ClickState::Cancelled => "cancelled",
            ClickState::Error => "error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClickSessionData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub click_trans_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub click_paydoc_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merchant_prepare_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub click_state: Option<ClickState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub click_error: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub click_error_note: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sign_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cart_id: Option<String>,
    /// Order id produced by cart completion
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
}

impl ClickSessionData {
    pub fn from_data(data: &SessionData) -> Result<Self, serde_json::Error> {
        serde_json::from_value(JsonValue::Object(data.clone()))
    }

    pub fn to_patch(&self) -> SessionData {
        to_patch(self)
    }

    pub fn state(&self) -> ClickState {
        self.click_state.unwrap_or(ClickState::Pending)
    }
}

fn to_patch<T: Serialize>(value: &T) -> SessionData {
    match serde_json::to_value(value) {
        Ok(JsonValue::Object(map)) => map,
        _ => SessionData::new(),
    }
}

/// Merge `patch` over `data` key by key (top level only), the same
/// semantics as Postgres `jsonb || jsonb`.
pub fn merge_data(data: &mut SessionData, patch: &SessionData) {
    for (key, value) in patch {
        data.insert(key.clone(), value.clone());
    }
}
