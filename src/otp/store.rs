use async_trait::async_trait;
use std::time::Duration;

use crate::cache::CacheResult;

/// Code write performed as one batch: code, cooldown flag, and a reset of
/// the wrong-attempt counter for the new code.
#[derive(Debug, Clone)]
pub struct CodeWrite {
    pub code_key: String,
    pub code: String,
    pub code_ttl: Duration,
    pub cooldown_key: String,
    pub cooldown_ttl: Duration,
    pub attempts_key: String,
}

#[derive(Debug, Clone)]
pub struct CodeCheck {
    pub code_key: String,
    pub attempts_key: String,
    pub verified_key: String,
    pub code: String,
    pub max_attempts: u32,
    pub attempts_ttl: Duration,
    pub verified_ttl: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyOutcome {
    /// Code matched; it is gone and the verified flag is set.
    Verified,
    /// Wrong code, the code is still live.
    Mismatch { attempts: u32 },
    /// Wrong code and the attempt ceiling was reached; the code was purged.
    LockedOut,
    /// No live code for this phone and purpose.
    Missing,
}

/// Atomic primitives the OTP flow needs from the shared key-value store.
///
/// Every method is a single round trip and atomic with respect to itself.
#[async_trait]
pub trait OtpStore: Send + Sync {
    async fn exists(&self, key: &str) -> CacheResult<bool>;

    async fn store_code(&self, write: CodeWrite) -> CacheResult<()>;

    async fn verify_code(&self, check: CodeCheck) -> CacheResult<VerifyOutcome>;

    /// Increment a counter, starting its expiry window on the first hit only.
    /// Returns the post-increment value.
    async fn increment_in_window(&self, key: &str, window: Duration) -> CacheResult<u64>;

    /// Delete a key, reporting whether it existed.
    async fn take(&self, key: &str) -> CacheResult<bool>;

    async fn ping(&self) -> CacheResult<()>;
}

pub(crate) fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}
