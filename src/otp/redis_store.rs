//! Redis-backed OTP store.
//!
//! Verify and windowed increment are Lua scripts so that two concurrent
//! callers can never both observe the same code or counter state.

use async_trait::async_trait;
use redis::Script;
use std::time::Duration;
use tracing::error;

use super::store::{ttl_secs, CodeCheck, CodeWrite, OtpStore, VerifyOutcome};
use crate::cache::{health_check, CacheError, CacheResult, RedisPool};

/// KEYS: code, attempts, verified
/// ARGV: submitted code, verified ttl, attempts ttl, max attempts
///
/// Returns 1 verified, 0 mismatch (then the attempt count as second
/// element), -1 no code, -2 mismatch that hit the ceiling.
const VERIFY_SCRIPT: &str = r#"
    local stored = redis.call('GET', KEYS[1])
    if not stored then
        return {-1, 0}
    end
    if stored == ARGV[1] then
        redis.call('DEL', KEYS[1], KEYS[2])
        redis.call('SET', KEYS[3], '1', 'EX', tonumber(ARGV[2]))
        return {1, 0}
    end
    local attempts = redis.call('INCR', KEYS[2])
    if attempts == 1 then
        redis.call('EXPIRE', KEYS[2], tonumber(ARGV[3]))
    end
    if attempts >= tonumber(ARGV[4]) then
        redis.call('DEL', KEYS[1], KEYS[2])
        return {-2, attempts}
    end
    return {0, attempts}
"#;

/// INCR + EXPIRE on first hit, so a crash between the two never leaves a
/// counter without expiry.
const INCREMENT_SCRIPT: &str = r#"
    local count = redis.call('INCR', KEYS[1])
    if count == 1 then
        redis.call('EXPIRE', KEYS[1], tonumber(ARGV[1]))
    end
    return count
"#;

#[derive(Clone)]
pub struct RedisOtpStore {
    pool: RedisPool,
}

impl RedisOtpStore {
    pub fn new(pool: RedisPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OtpStore for RedisOtpStore {
    async fn exists(&self, key: &str) -> CacheResult<bool> {
        let mut conn = self.pool.get().await?;
        let present: bool = redis::cmd("EXISTS")
            .arg(key)
            .query_async(&mut *conn)
            .await?;
        Ok(present)
    }

    async fn store_code(&self, write: CodeWrite) -> CacheResult<()> {
        let mut conn = self.pool.get().await?;
        redis::pipe()
            .atomic()
            .cmd("SET")
            .arg(&write.code_key)
            .arg(&write.code)
            .arg("EX")
            .arg(ttl_secs(write.code_ttl))
            .ignore()
            .cmd("SET")
            .arg(&write.cooldown_key)
            .arg("1")
            .arg("EX")
            .arg(ttl_secs(write.cooldown_ttl))
            .ignore()
            .cmd("DEL")
            .arg(&write.attempts_key)
            .ignore()
            .query_async::<()>(&mut *conn)
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to store OTP code");
                CacheError::from(e)
            })
    }

    async fn verify_code(&self, check: CodeCheck) -> CacheResult<VerifyOutcome> {
        let mut conn = self.pool.get().await?;
        let (status, attempts): (i64, i64) = Script::new(VERIFY_SCRIPT)
            .key(&check.code_key)
            .key(&check.attempts_key)
            .key(&check.verified_key)
            .arg(&check.code)
            .arg(ttl_secs(check.verified_ttl))
            .arg(ttl_secs(check.attempts_ttl))
            .arg(check.max_attempts.max(1))
            .invoke_async(&mut *conn)
            .await?;

        match status {
            1 => Ok(VerifyOutcome::Verified),
            0 => Ok(VerifyOutcome::Mismatch {
                attempts: u32::try_from(attempts).unwrap_or(u32::MAX),
            }),
            -1 => Ok(VerifyOutcome::Missing),
            -2 => Ok(VerifyOutcome::LockedOut),
            other => Err(CacheError::UnexpectedReply(format!(
                "verify script returned {}",
                other
            ))),
        }
    }

    async fn increment_in_window(&self, key: &str, window: Duration) -> CacheResult<u64> {
        let mut conn = self.pool.get().await?;
        let count: u64 = Script::new(INCREMENT_SCRIPT)
            .key(key)
            .arg(ttl_secs(window))
            .invoke_async(&mut *conn)
            .await?;
        Ok(count)
    }

    async fn take(&self, key: &str) -> CacheResult<bool> {
        let mut conn = self.pool.get().await?;
        let removed: i64 = redis::cmd("DEL").arg(key).query_async(&mut *conn).await?;
        Ok(removed > 0)
    }

    async fn ping(&self) -> CacheResult<()> {
        health_check(&self.pool).await
    }
}
