//! The commerce backend: owner of payment sessions, carts and orders.
//!
//! Gateway handlers never own persistence. They read sessions, write merge
//! patches guarded by the session version, and ask the backend to turn a
//! paid cart into an order.

pub mod memory;
#[cfg(feature = "database")]
pub mod medusa;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::{env_parse, ConfigError};
use crate::payments::error::PaymentError;
use crate::payments::types::{PaymentSession, SessionData};

pub use memory::InMemoryCommerceBackend;
#[cfg(feature = "database")]
pub use medusa::MedusaCommerceBackend;

pub type CommerceResult<T> = Result<T, CommerceError>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum CommerceError {
    #[error("{entity} '{id}' not found")]
    NotFound { entity: &'static str, id: String },

    #[error("payment session '{id}' changed since version {expected_version}")]
    VersionConflict { id: String, expected_version: i64 },

    #[error("commerce backend returned HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("commerce backend unreachable: {0}")]
    Network(String),

    #[error("session store error: {message}")]
    Database { message: String, retryable: bool },

    #[error("unexpected data from commerce backend: {0}")]
    InvalidData(String),

    #[error("cart could not be completed: {0}")]
    CompletionFailed(String),
}

impl CommerceError {
    pub fn is_retryable(&self) -> bool {
        match self {
            CommerceError::NotFound { .. } => false,
            CommerceError::VersionConflict { .. } => true,
            CommerceError::Http { status, .. } => *status >= 500 || *status == 429,
            CommerceError::Network(_) => true,
            CommerceError::Database { retryable, .. } => *retryable,
            CommerceError::InvalidData(_) => false,
            CommerceError::CompletionFailed(_) => true,
        }
    }
}

impl From<PaymentError> for CommerceError {
    fn from(err: PaymentError) -> Self {
        match err {
            PaymentError::NetworkError { message } => CommerceError::Network(message),
            PaymentError::RateLimitError { message, .. } => CommerceError::Http {
                status: 429,
                message,
            },
            PaymentError::ProviderError {
                message,
                provider_code,
                ..
            } => CommerceError::Http {
                status: provider_code
                    .as_deref()
                    .and_then(|c| c.parse().ok())
                    .unwrap_or(502),
                message,
            },
            PaymentError::ValidationError { message, .. } => CommerceError::InvalidData(message),
        }
    }
}

#[cfg(feature = "database")]
impl From<crate::database::error::DatabaseError> for CommerceError {
    fn from(err: crate::database::error::DatabaseError) -> Self {
        CommerceError::Database {
            retryable: err.is_retryable(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cart {
    pub id: String,
    pub currency_code: String,
    pub items: Vec<CartLineItem>,
    pub shipping_total_minor: i64,
    pub total_minor: i64,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CartLineItem {
    pub id: String,
    pub title: String,
    pub quantity: u32,
    /// Line total after discounts, minor units
    pub total_minor: i64,
    /// Product metadata merged with line-item metadata (line item wins)
    pub metadata: SessionData,
}

#[async_trait]
pub trait CommerceBackend: Send + Sync {
    async fn find_session_by_id(&self, id: &str) -> CommerceResult<Option<PaymentSession>>;

    /// Indexed lookup by cart id; newest session wins when several exist.
    async fn find_session_by_cart_id(&self, cart_id: &str)
        -> CommerceResult<Option<PaymentSession>>;

    async fn find_session_by_payme_transaction_id(
        &self,
        transaction_id: &str,
    ) -> CommerceResult<Option<PaymentSession>>;

    /// Merge `patch` into `data` if the stored version still equals
    /// `expected_version`. Fails with `VersionConflict` otherwise.
    async fn update_session_data(
        &self,
        id: &str,
        expected_version: i64,
        patch: SessionData,
    ) -> CommerceResult<PaymentSession>;

    /// Sessions whose `payme_create_time` (ms) lies in `[from, to]`,
    /// ascending by that time.
    async fn list_payme_sessions(&self, from: i64, to: i64) -> CommerceResult<Vec<PaymentSession>>;

    /// Captured by a gateway but with no order placed yet, and fewer than
    /// `max_attempts` failed placements. Least attempted first, then least
    /// recently attempted, then oldest.
    async fn list_sessions_pending_completion(
        &self,
        limit: u32,
        max_attempts: u32,
    ) -> CommerceResult<Vec<PaymentSession>>;

    async fn retrieve_cart(&self, cart_id: &str) -> CommerceResult<Cart>;

    /// Place the order for a cart and return its id. Marks sessions for the
    /// cart completed.
    async fn complete_cart(&self, cart_id: &str) -> CommerceResult<String>;

    async fn ping(&self) -> CommerceResult<()>;
}

/// Store API connection settings
#[derive(Debug, Clone)]
pub struct CommerceConfig {
    pub api_url: String,
    pub publishable_key: Option<String>,
    pub timeout: Duration,
    pub max_retries: u32,
}

impl Default for CommerceConfig {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:9000".to_string(),
            publishable_key: None,
            timeout: Duration::from_secs(5),
            max_retries: 2,
        }
    }
}

impl CommerceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            api_url: std::env::var("COMMERCE_API_URL")
                .unwrap_or(defaults.api_url)
                .trim_end_matches('/')
                .to_string(),
            publishable_key: crate::config::env_opt("COMMERCE_PUBLISHABLE_KEY"),
            timeout: Duration::from_secs(env_parse(
                "COMMERCE_TIMEOUT_SECS",
                defaults.timeout.as_secs(),
            )?),
            max_retries: env_parse("COMMERCE_MAX_RETRIES", defaults.max_retries)?,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.api_url.starts_with("http://") && !self.api_url.starts_with("https://") {
            return Err(ConfigError::InvalidValue(
                "COMMERCE_API_URL must be a valid URL".to_string(),
            ));
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::InvalidValue(
                "COMMERCE_TIMEOUT_SECS".to_string(),
            ));
        }
        Ok(())
    }
}
