//! Application error handling
//!
//! Unified error type for the OTP flow and the HTTP surface, with HTTP status
//! mapping, user-facing messages and machine-readable codes. The payment
//! gateway handlers do not use this type: their error codes are part of the
//! gateway wire contract and are rendered by the handlers themselves.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::cache::CacheError;

/// Machine-readable error codes. The lower-case ones are the exact strings
/// storefront callers branch on.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorCode {
    #[serde(rename = "invalid_phone")]
    InvalidPhone,
    #[serde(rename = "otp_cooldown")]
    OtpCooldown,
    #[serde(rename = "too_many_requests")]
    TooManyRequests,
    #[serde(rename = "invalid_code")]
    InvalidCode,
    #[serde(rename = "invalid_code_or_expired")]
    InvalidCodeOrExpired,
    #[serde(rename = "verification_required")]
    VerificationRequired,
    #[serde(rename = "SESSION_NOT_FOUND")]
    SessionNotFound,

    #[serde(rename = "DATABASE_ERROR")]
    DatabaseError,
    #[serde(rename = "CACHE_ERROR")]
    CacheError,
    #[serde(rename = "CONFIGURATION_ERROR")]
    ConfigurationError,

    #[serde(rename = "COMMERCE_BACKEND_ERROR")]
    CommerceBackendError,
    #[serde(rename = "DELIVERY_ERROR")]
    DeliveryError,
    #[serde(rename = "EXTERNAL_SERVICE_TIMEOUT")]
    ExternalServiceTimeout,

    #[serde(rename = "INTERNAL_ERROR")]
    InternalError,
    #[serde(rename = "VALIDATION_ERROR")]
    ValidationError,
}

/// Expected, routine outcomes of the OTP and checkout flows.
#[derive(Debug, Clone)]
pub enum DomainError {
    /// A code was sent for this phone and purpose less than a cooldown ago
    OtpCooldown,
    /// Hourly send ceiling reached for this phone
    TooManyRequests { limit: u32 },
    /// Code did not match, attempts remain
    InvalidCode,
    /// No live code (expired, never sent, or purged after too many attempts)
    InvalidCodeOrExpired,
    /// A guarded action ran without a prior successful verification
    VerificationRequired { purpose: String },
    /// Payment session for a cart does not exist
    SessionNotFound { cart_id: String },
}

/// Infrastructure-level errors (database, cache, configuration)
#[derive(Debug, Clone)]
pub enum InfrastructureError {
    Database { message: String, is_retryable: bool },
    /// Key-value store unavailable. Fatal to OTP operations.
    Cache { message: String },
    Configuration { message: String },
}

/// External service errors
#[derive(Debug, Clone)]
pub enum ExternalError {
    CommerceBackend { message: String, is_retryable: bool },
    /// SMS or other OTP delivery channel failed
    Delivery { message: String },
    Timeout { service: String, timeout_ms: u64 },
}

/// Input validation errors
#[derive(Debug, Clone)]
pub enum ValidationError {
    InvalidPhone { phone: String },
    InvalidPurpose { purpose: String },
    MissingField { field: String },
    InvalidField { field: String, reason: String },
}

/// Unified application error type
#[derive(Debug, Clone)]
pub struct AppError {
    pub kind: AppErrorKind,
    pub request_id: Option<String>,
    pub context: Option<String>,
}

#[derive(Debug, Clone)]
pub enum AppErrorKind {
    Domain(DomainError),
    Infrastructure(InfrastructureError),
    External(ExternalError),
    Validation(ValidationError),
}

impl AppError {
    pub fn new(kind: AppErrorKind) -> Self {
        Self {
            kind,
            request_id: None,
            context: None,
        }
    }

    pub fn domain(err: DomainError) -> Self {
        Self::new(AppErrorKind::Domain(err))
    }

    pub fn validation(err: ValidationError) -> Self {
        Self::new(AppErrorKind::Validation(err))
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Map error to HTTP status code
    pub fn status_code(&self) -> u16 {
        match &self.kind {
            AppErrorKind::Domain(err) => match err {
                DomainError::OtpCooldown => 429,
                DomainError::TooManyRequests { .. } => 429,
                DomainError::InvalidCode => 400,
                DomainError::InvalidCodeOrExpired => 400,
                DomainError::VerificationRequired { .. } => 403,
                DomainError::SessionNotFound { .. } => 404,
            },
            AppErrorKind::Infrastructure(_) => 503,
            AppErrorKind::External(err) => match err {
                ExternalError::CommerceBackend { .. } => 502,
                ExternalError::Delivery { .. } => 502,
                ExternalError::Timeout { .. } => 504,
            },
            AppErrorKind::Validation(_) => 400,
        }
    }

    /// Get error code for client handling
    pub fn error_code(&self) -> ErrorCode {
        match &self.kind {
            AppErrorKind::Domain(err) => match err {
                DomainError::OtpCooldown => ErrorCode::OtpCooldown,
                DomainError::TooManyRequests { .. } => ErrorCode::TooManyRequests,
                DomainError::InvalidCode => ErrorCode::InvalidCode,
                DomainError::InvalidCodeOrExpired => ErrorCode::InvalidCodeOrExpired,
                DomainError::VerificationRequired { .. } => ErrorCode::VerificationRequired,
                DomainError::SessionNotFound { .. } => ErrorCode::SessionNotFound,
            },
            AppErrorKind::Infrastructure(err) => match err {
                InfrastructureError::Database { .. } => ErrorCode::DatabaseError,
                InfrastructureError::Cache { .. } => ErrorCode::CacheError,
                InfrastructureError::Configuration { .. } => ErrorCode::ConfigurationError,
            },
            AppErrorKind::External(err) => match err {
                ExternalError::CommerceBackend { .. } => ErrorCode::CommerceBackendError,
                ExternalError::Delivery { .. } => ErrorCode::DeliveryError,
                ExternalError::Timeout { .. } => ErrorCode::ExternalServiceTimeout,
            },
            AppErrorKind::Validation(err) => match err {
                ValidationError::InvalidPhone { .. } => ErrorCode::InvalidPhone,
                _ => ErrorCode::ValidationError,
            },
        }
    }

    /// Get user-friendly error message
    pub fn user_message(&self) -> String {
        match &self.kind {
            AppErrorKind::Domain(err) => match err {
                DomainError::OtpCooldown => {
                    "A code was sent recently. Please wait before requesting another".to_string()
                }
                DomainError::TooManyRequests { limit } => format!(
                    "Too many codes requested. At most {} per hour are allowed",
                    limit
                ),
                DomainError::InvalidCode => "The code is incorrect".to_string(),
                DomainError::InvalidCodeOrExpired => {
                    "The code is incorrect or has expired. Please request a new one".to_string()
                }
                DomainError::VerificationRequired { purpose } => {
                    format!("Phone verification for '{}' is required", purpose)
                }
                DomainError::SessionNotFound { cart_id } => {
                    format!("No payment session for cart '{}'", cart_id)
                }
            },
            AppErrorKind::Infrastructure(_) => {
                "Service temporarily unavailable. Please try again later".to_string()
            }
            AppErrorKind::External(err) => match err {
                ExternalError::CommerceBackend { is_retryable, .. } => {
                    if *is_retryable {
                        "Store backend is temporarily unavailable. Please try again".to_string()
                    } else {
                        "Store backend rejected the request".to_string()
                    }
                }
                ExternalError::Delivery { .. } => {
                    "Could not deliver the code. Please try again".to_string()
                }
                ExternalError::Timeout {
                    service,
                    timeout_ms,
                } => format!(
                    "{} did not respond within {}ms. Please try again",
                    service, timeout_ms
                ),
            },
            AppErrorKind::Validation(err) => match err {
                ValidationError::InvalidPhone { .. } => "Invalid phone number".to_string(),
                ValidationError::InvalidPurpose { purpose } => {
                    format!("Unsupported verification purpose '{}'", purpose)
                }
                ValidationError::MissingField { field } => {
                    format!("Required field '{}' is missing", field)
                }
                ValidationError::InvalidField { field, reason } => {
                    format!("Invalid value for '{}': {}", field, reason)
                }
            },
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        match &self.kind {
            AppErrorKind::Domain(err) => matches!(
                err,
                DomainError::OtpCooldown | DomainError::TooManyRequests { .. }
            ),
            AppErrorKind::Infrastructure(err) => match err {
                InfrastructureError::Database { is_retryable, .. } => *is_retryable,
                InfrastructureError::Cache { .. } => true,
                InfrastructureError::Configuration { .. } => false,
            },
            AppErrorKind::External(err) => match err {
                ExternalError::CommerceBackend { is_retryable, .. } => *is_retryable,
                ExternalError::Delivery { .. } => true,
                ExternalError::Timeout { .. } => true,
            },
            AppErrorKind::Validation(_) => false,
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.user_message())
    }
}

impl std::error::Error for AppError {}

impl From<CacheError> for AppError {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::Timeout(timeout_ms) => {
                AppError::new(AppErrorKind::External(ExternalError::Timeout {
                    service: "otp store".to_string(),
                    timeout_ms,
                }))
            }
            other => AppError::new(AppErrorKind::Infrastructure(InfrastructureError::Cache {
                message: other.to_string(),
            })),
        }
    }
}

impl From<crate::commerce::CommerceError> for AppError {
    fn from(err: crate::commerce::CommerceError) -> Self {
        AppError::new(AppErrorKind::External(ExternalError::CommerceBackend {
            is_retryable: err.is_retryable(),
            message: err.to_string(),
        }))
    }
}

/// Result type for operations that can fail with AppError
pub type AppResult<T> = Result<T, AppError>;
