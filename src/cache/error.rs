//! Cache-specific error types

use std::fmt;

/// Cache operation errors
#[derive(Debug)]
pub enum CacheError {
    /// Connection-related errors (Redis unavailable, network issues, etc.)
    ConnectionError(String),
    /// A script or command returned something we did not expect
    UnexpectedReply(String),
    /// Operation-specific errors
    OperationError(String),
    /// The store did not answer within the configured deadline
    Timeout(u64),
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheError::ConnectionError(msg) => write!(f, "Cache connection error: {}", msg),
            CacheError::UnexpectedReply(msg) => write!(f, "Cache unexpected reply: {}", msg),
            CacheError::OperationError(msg) => write!(f, "Cache operation error: {}", msg),
            CacheError::Timeout(ms) => write!(f, "Cache operation timed out after {}ms", ms),
        }
    }
}

impl std::error::Error for CacheError {}

#[cfg(feature = "cache")]
impl From<redis::RedisError> for CacheError {
    fn from(err: redis::RedisError) -> Self {
        CacheError::ConnectionError(err.to_string())
    }
}

#[cfg(feature = "cache")]
impl From<bb8::RunError<redis::RedisError>> for CacheError {
    fn from(err: bb8::RunError<redis::RedisError>) -> Self {
        CacheError::ConnectionError(format!("Pool error: {}", err))
    }
}

/// Result type alias for cache operations
pub type CacheResult<T> = Result<T, CacheError>;
