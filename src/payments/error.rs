//! Errors from outbound gateway calls (fiscal submission and the like).
//!
//! Inbound protocol rejections are not errors in this sense; they are the
//! gateway wire codes in `providers::payme::PaymeError` and
//! `providers::click::ClickError`.

use thiserror::Error;

pub type PaymentResult<T> = Result<T, PaymentError>;

#[derive(Debug, Clone, Error)]
pub enum PaymentError {
    #[error("Validation error: {message}")]
    ValidationError {
        message: String,
        field: Option<String>,
    },

    #[error("Network error: {message}")]
    NetworkError { message: String },

    #[error("Rate limit exceeded: {message}")]
    RateLimitError {
        message: String,
        retry_after_seconds: Option<u64>,
    },

    #[error("Provider error: provider={provider}, message={message}")]
    ProviderError {
        provider: String,
        message: String,
        provider_code: Option<String>,
        retryable: bool,
    },
}

impl PaymentError {
    pub fn is_retryable(&self) -> bool {
        match self {
            PaymentError::ValidationError { .. } => false,
            PaymentError::NetworkError { .. } => true,
            PaymentError::RateLimitError { .. } => true,
            PaymentError::ProviderError { retryable, .. } => *retryable,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_flags_are_set() {
        assert!(PaymentError::NetworkError {
            message: "timeout".to_string()
        }
        .is_retryable());
        assert!(!PaymentError::ValidationError {
            message: "bad".to_string(),
            field: None
        }
        .is_retryable());
        assert!(PaymentError::ProviderError {
            provider: "click".to_string(),
            message: "HTTP 502".to_string(),
            provider_code: Some("502".to_string()),
            retryable: true,
        }
        .is_retryable());
    }
}
