//! OTP policy: code generation, cooldown, hourly ceiling, verify-and-consume.
//!
//! Granularity: code, verified flag, wrong-attempt counter and cooldown are
//! keyed by (purpose, phone). The hourly send ceiling is per phone across
//! all purposes.
//!
//! Every store call carries a timeout. Store failures propagate: there is no
//! OTP decision without the store.

use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::phone::{OtpPurpose, PhoneNumber};
use super::sender::OtpSender;
use super::store::{CodeCheck, CodeWrite, OtpStore, VerifyOutcome};
use crate::cache::{keys, CacheError, CacheResult};
use crate::config::{env_parse, ConfigError};
use crate::error::{AppError, AppResult, DomainError, ValidationError};
use crate::logging::mask_phone;

pub const CODE_LENGTH: usize = 6;

#[derive(Debug, Clone)]
pub struct OtpConfig {
    pub code_ttl: Duration,
    pub cooldown: Duration,
    pub verified_ttl: Duration,
    pub attempts_ttl: Duration,
    pub max_attempts: u32,
    pub hourly_limit: u32,
    pub rate_window: Duration,
    pub store_timeout: Duration,
}

impl Default for OtpConfig {
    fn default() -> Self {
        Self {
            code_ttl: Duration::from_secs(300),
            cooldown: Duration::from_secs(60),
            verified_ttl: Duration::from_secs(1800),
            attempts_ttl: Duration::from_secs(600),
            max_attempts: 5,
            hourly_limit: 5,
            rate_window: Duration::from_secs(3600),
            store_timeout: Duration::from_millis(3000),
        }
    }
}

impl OtpConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            code_ttl: Duration::from_secs(env_parse(
                "OTP_CODE_TTL_SECS",
                defaults.code_ttl.as_secs(),
            )?),
            cooldown: Duration::from_secs(env_parse(
                "OTP_COOLDOWN_SECS",
                defaults.cooldown.as_secs(),
            )?),
            verified_ttl: Duration::from_secs(env_parse(
                "OTP_VERIFIED_TTL_SECS",
                defaults.verified_ttl.as_secs(),
            )?),
            attempts_ttl: Duration::from_secs(env_parse(
                "OTP_ATTEMPTS_TTL_SECS",
                defaults.attempts_ttl.as_secs(),
            )?),
            max_attempts: env_parse("OTP_MAX_ATTEMPTS", defaults.max_attempts)?,
            hourly_limit: env_parse("OTP_HOURLY_LIMIT", defaults.hourly_limit)?,
            rate_window: defaults.rate_window,
            store_timeout: Duration::from_millis(env_parse(
                "OTP_STORE_TIMEOUT_MS",
                defaults.store_timeout.as_millis() as u64,
            )?),
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.code_ttl.is_zero() || self.verified_ttl.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "OTP TTLs must be positive".to_string(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::InvalidValue("OTP_MAX_ATTEMPTS".to_string()));
        }
        if self.hourly_limit == 0 {
            return Err(ConfigError::InvalidValue("OTP_HOURLY_LIMIT".to_string()));
        }
        if self.store_timeout.is_zero() {
            return Err(ConfigError::InvalidValue("OTP_STORE_TIMEOUT_MS".to_string()));
        }
        Ok(())
    }
}

/// What a successful request reports back. The code itself only goes to
/// the sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedOtp {
    pub phone: PhoneNumber,
    pub purpose: OtpPurpose,
    pub expires_in: Duration,
}

#[derive(Clone)]
pub struct OtpService {
    store: Arc<dyn OtpStore>,
    sender: Arc<dyn OtpSender>,
    config: OtpConfig,
}

impl OtpService {
    pub fn new(store: Arc<dyn OtpStore>, sender: Arc<dyn OtpSender>, config: OtpConfig) -> Self {
        Self {
            store,
            sender,
            config,
        }
    }

    pub fn config(&self) -> &OtpConfig {
        &self.config
    }

    /// Six digits, zero-padded, from the thread-local CSPRNG.
    pub fn generate_code() -> String {
        let n: u32 = rand::rng().random_range(0..1_000_000);
        format!("{:0width$}", n, width = CODE_LENGTH)
    }

    /// True iff no cooldown flag is present. Never sets one.
    pub async fn cooldown_check(
        &self,
        phone: &PhoneNumber,
        purpose: &OtpPurpose,
    ) -> AppResult<bool> {
        let key = keys::otp::CooldownKey::new(phone.as_str(), purpose.as_str()).to_string();
        let active = self.guarded(self.store.exists(&key)).await?;
        Ok(!active)
    }

    /// Writes the code and the cooldown flag in one batch, resetting the
    /// wrong-attempt counter so the new code gets a full allowance.
    pub async fn store_set(
        &self,
        phone: &PhoneNumber,
        code: &str,
        purpose: &OtpPurpose,
    ) -> AppResult<()> {
        let (p, s) = (phone.as_str(), purpose.as_str());
        let write = CodeWrite {
            code_key: keys::otp::CodeKey::new(p, s).to_string(),
            code: code.to_string(),
            code_ttl: self.config.code_ttl,
            cooldown_key: keys::otp::CooldownKey::new(p, s).to_string(),
            cooldown_ttl: self.config.cooldown,
            attempts_key: keys::otp::AttemptsKey::new(p, s).to_string(),
        };
        self.guarded(self.store.store_code(write)).await
    }

    pub async fn verify(
        &self,
        phone: &PhoneNumber,
        code: &str,
        purpose: &OtpPurpose,
    ) -> AppResult<bool> {
        Ok(self.verify_outcome(phone, code, purpose).await? == VerifyOutcome::Verified)
    }

    /// Single atomic compare-and-consume against the store.
    pub async fn verify_outcome(
        &self,
        phone: &PhoneNumber,
        code: &str,
        purpose: &OtpPurpose,
    ) -> AppResult<VerifyOutcome> {
        let (p, s) = (phone.as_str(), purpose.as_str());
        let check = CodeCheck {
            code_key: keys::otp::CodeKey::new(p, s).to_string(),
            attempts_key: keys::otp::AttemptsKey::new(p, s).to_string(),
            verified_key: keys::otp::VerifiedKey::new(p, s).to_string(),
            code: code.to_string(),
            max_attempts: self.config.max_attempts,
            attempts_ttl: self.config.attempts_ttl,
            verified_ttl: self.config.verified_ttl,
        };
        self.guarded(self.store.verify_code(check)).await
    }

    /// Always increments, then reports whether the new count is within the
    /// hourly ceiling. Rejected attempts keep counting.
    pub async fn rate_limit_check(&self, phone: &PhoneNumber) -> AppResult<bool> {
        let key = keys::otp::RateLimitKey::new(phone.as_str()).to_string();
        let count = self
            .guarded(self.store.increment_in_window(&key, self.config.rate_window))
            .await?;
        Ok(count <= u64::from(self.config.hourly_limit))
    }

    /// One-shot: true only for the call that removed the verified flag.
    pub async fn consume_verified(
        &self,
        phone: &PhoneNumber,
        purpose: &OtpPurpose,
    ) -> AppResult<bool> {
        let key = keys::otp::VerifiedKey::new(phone.as_str(), purpose.as_str()).to_string();
        self.guarded(self.store.take(&key)).await
    }

    /// Full request flow: normalize, cooldown, hourly ceiling, generate,
    /// store, deliver.
    pub async fn request_otp(&self, raw_phone: &str, raw_purpose: &str) -> AppResult<IssuedOtp> {
        let phone = PhoneNumber::parse(raw_phone)?;
        let purpose = OtpPurpose::parse(raw_purpose)?;
        let masked = mask_phone(phone.as_str());

        if !self.cooldown_check(&phone, &purpose).await? {
            info!(phone = %masked, purpose = %purpose, "OTP request inside cooldown");
            return Err(AppError::domain(DomainError::OtpCooldown));
        }

        if !self.rate_limit_check(&phone).await? {
            warn!(phone = %masked, limit = self.config.hourly_limit, "OTP hourly limit reached");
            return Err(AppError::domain(DomainError::TooManyRequests {
                limit: self.config.hourly_limit,
            }));
        }

        let code = Self::generate_code();
        self.store_set(&phone, &code, &purpose).await?;
        self.sender.send(&phone, &purpose, &code).await?;

        info!(phone = %masked, purpose = %purpose, "OTP issued");
        Ok(IssuedOtp {
            phone,
            purpose,
            expires_in: self.config.code_ttl,
        })
    }

    pub async fn verify_otp(&self, raw_phone: &str, code: &str, raw_purpose: &str) -> AppResult<()> {
        let phone = PhoneNumber::parse(raw_phone)?;
        let purpose = OtpPurpose::parse(raw_purpose)?;
        let code = code.trim();
        if code.is_empty() {
            return Err(AppError::validation(ValidationError::MissingField {
                field: "code".to_string(),
            }));
        }

        let masked = mask_phone(phone.as_str());
        match self.verify_outcome(&phone, code, &purpose).await? {
            VerifyOutcome::Verified => {
                info!(phone = %masked, purpose = %purpose, "OTP verified");
                Ok(())
            }
            VerifyOutcome::Mismatch { attempts } => {
                info!(phone = %masked, purpose = %purpose, attempts, "OTP mismatch");
                Err(AppError::domain(DomainError::InvalidCode))
            }
            VerifyOutcome::LockedOut => {
                warn!(phone = %masked, purpose = %purpose, "OTP purged after too many attempts");
                Err(AppError::domain(DomainError::InvalidCodeOrExpired))
            }
            VerifyOutcome::Missing => Err(AppError::domain(DomainError::InvalidCodeOrExpired)),
        }
    }

    /// Gate for sensitive actions: consumes a prior verification or fails.
    pub async fn require_verified(&self, phone: &PhoneNumber, purpose: &OtpPurpose) -> AppResult<()> {
        if self.consume_verified(phone, purpose).await? {
            Ok(())
        } else {
            Err(AppError::domain(DomainError::VerificationRequired {
                purpose: purpose.to_string(),
            }))
        }
    }

    pub async fn ping(&self) -> AppResult<()> {
        self.guarded(self.store.ping()).await
    }

    async fn guarded<T>(&self, op: impl Future<Output = CacheResult<T>>) -> AppResult<T> {
        let limit = self.config.store_timeout;
        match tokio::time::timeout(limit, op).await {
            Ok(result) => result.map_err(AppError::from),
            Err(_) => Err(CacheError::Timeout(limit.as_millis() as u64).into()),
        }
    }
}
