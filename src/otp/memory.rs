//! In-process OTP store.
//!
//! Used when the service runs without Redis (`SKIP_EXTERNALS`) and in tests.
//! One mutex guards the whole map, which makes each trait method atomic.
//! Expiry is driven by `tokio::time::Instant`, so paused test clocks apply.

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::store::{CodeCheck, CodeWrite, OtpStore, VerifyOutcome};
use crate::cache::CacheResult;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn expiring(value: impl Into<String>, ttl: Duration) -> Self {
        Self {
            value: value.into(),
            expires_at: Some(Instant::now() + ttl),
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// Map size above which expired entries are swept on the next write.
const SWEEP_THRESHOLD: usize = 4096;

#[derive(Default)]
pub struct MemoryOtpStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryOtpStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Entries held, expired ones included until swept or read.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

fn sweep_if_large(map: &mut HashMap<String, Entry>) {
    if map.len() > SWEEP_THRESHOLD {
        let now = Instant::now();
        map.retain(|_, entry| entry.is_live(now));
    }
}

fn live<'a>(map: &'a mut HashMap<String, Entry>, key: &str) -> Option<&'a mut Entry> {
    let now = Instant::now();
    if map.get(key).is_some_and(|e| !e.is_live(now)) {
        map.remove(key);
    }
    map.get_mut(key)
}

#[async_trait]
impl OtpStore for MemoryOtpStore {
    async fn exists(&self, key: &str) -> CacheResult<bool> {
        let mut map = self.entries.lock().await;
        Ok(live(&mut map, key).is_some())
    }

    async fn store_code(&self, write: CodeWrite) -> CacheResult<()> {
        let mut map = self.entries.lock().await;
        sweep_if_large(&mut map);
        map.insert(write.code_key, Entry::expiring(write.code, write.code_ttl));
        map.insert(
            write.cooldown_key,
            Entry::expiring("1", write.cooldown_ttl),
        );
        map.remove(&write.attempts_key);
        Ok(())
    }

    async fn verify_code(&self, check: CodeCheck) -> CacheResult<VerifyOutcome> {
        let mut map = self.entries.lock().await;

        let matches = match live(&mut map, &check.code_key) {
            None => return Ok(VerifyOutcome::Missing),
            Some(entry) => entry.value == check.code,
        };

        if matches {
            map.remove(&check.code_key);
            map.remove(&check.attempts_key);
            map.insert(
                check.verified_key,
                Entry::expiring("1", check.verified_ttl),
            );
            return Ok(VerifyOutcome::Verified);
        }

        let attempts = match live(&mut map, &check.attempts_key) {
            Some(entry) => {
                let next = entry.value.parse::<u32>().unwrap_or(0).saturating_add(1);
                entry.value = next.to_string();
                next
            }
            None => {
                map.insert(
                    check.attempts_key.clone(),
                    Entry::expiring("1", check.attempts_ttl),
                );
                1
            }
        };

        if attempts >= check.max_attempts.max(1) {
            map.remove(&check.code_key);
            map.remove(&check.attempts_key);
            return Ok(VerifyOutcome::LockedOut);
        }
        Ok(VerifyOutcome::Mismatch { attempts })
    }

    async fn increment_in_window(&self, key: &str, window: Duration) -> CacheResult<u64> {
        let mut map = self.entries.lock().await;
        sweep_if_large(&mut map);
        match live(&mut map, key) {
            Some(entry) => {
                let next = entry.value.parse::<u64>().unwrap_or(0).saturating_add(1);
                entry.value = next.to_string();
                Ok(next)
            }
            None => {
                map.insert(key.to_string(), Entry::expiring("1", window));
                Ok(1)
            }
        }
    }

    async fn take(&self, key: &str) -> CacheResult<bool> {
        let mut map = self.entries.lock().await;
        let was_live = live(&mut map, key).is_some();
        map.remove(key);
        Ok(was_live)
    }

    async fn ping(&self) -> CacheResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(code: &str) -> CodeWrite {
        CodeWrite {
            code_key: "code".to_string(),
            code: code.to_string(),
            code_ttl: Duration::from_secs(300),
            cooldown_key: "cooldown".to_string(),
            cooldown_ttl: Duration::from_secs(60),
            attempts_key: "attempts".to_string(),
        }
    }

    fn check(code: &str) -> CodeCheck {
        CodeCheck {
            code_key: "code".to_string(),
            attempts_key: "attempts".to_string(),
            verified_key: "verified".to_string(),
            code: code.to_string(),
            max_attempts: 3,
            attempts_ttl: Duration::from_secs(600),
            verified_ttl: Duration::from_secs(1800),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_with_the_clock() {
        let store = MemoryOtpStore::new();
        store.store_code(write("111111")).await.unwrap();
        assert!(store.exists("cooldown").await.unwrap());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(!store.exists("cooldown").await.unwrap());
        assert!(store.exists("code").await.unwrap());

        tokio::time::advance(Duration::from_secs(240)).await;
        assert_eq!(
            store.verify_code(check("111111")).await.unwrap(),
            VerifyOutcome::Missing
        );
    }

    #[tokio::test]
    async fn wrong_attempts_lock_out_at_ceiling() {
        let store = MemoryOtpStore::new();
        store.store_code(write("111111")).await.unwrap();

        assert_eq!(
            store.verify_code(check("000000")).await.unwrap(),
            VerifyOutcome::Mismatch { attempts: 1 }
        );
        assert_eq!(
            store.verify_code(check("000000")).await.unwrap(),
            VerifyOutcome::Mismatch { attempts: 2 }
        );
        assert_eq!(
            store.verify_code(check("000000")).await.unwrap(),
            VerifyOutcome::LockedOut
        );
        // Right code after lockout no longer works
        assert_eq!(
            store.verify_code(check("111111")).await.unwrap(),
            VerifyOutcome::Missing
        );
    }

    #[tokio::test(start_paused = true)]
    async fn increment_window_starts_on_first_hit() {
        let store = MemoryOtpStore::new();
        let window = Duration::from_secs(3600);
        assert_eq!(store.increment_in_window("rate", window).await.unwrap(), 1);
        tokio::time::advance(Duration::from_secs(1800)).await;
        assert_eq!(store.increment_in_window("rate", window).await.unwrap(), 2);
        tokio::time::advance(Duration::from_secs(1801)).await;
        assert_eq!(store.increment_in_window("rate", window).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn take_reports_presence_once() {
        let store = MemoryOtpStore::new();
        store.store_code(write("111111")).await.unwrap();
        assert_eq!(
            store.verify_code(check("111111")).await.unwrap(),
            VerifyOutcome::Verified
        );
        assert!(store.take("verified").await.unwrap());
        assert!(!store.take("verified").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn expired_keys_are_swept_once_the_map_grows() {
        let store = MemoryOtpStore::new();
        let window = Duration::from_secs(60);
        for i in 0..=SWEEP_THRESHOLD {
            store
                .increment_in_window(&format!("rate:{}", i), window)
                .await
                .unwrap();
        }
        assert_eq!(store.len().await, SWEEP_THRESHOLD + 1);

        tokio::time::advance(Duration::from_secs(61)).await;
        store.increment_in_window("rate:fresh", window).await.unwrap();
        assert_eq!(store.len().await, 1);
    }
}
