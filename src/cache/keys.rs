//! Type-safe cache key builders

use std::fmt;

pub const VERSION: &str = "v1";

pub mod otp {
    use super::*;

    pub const NAMESPACE: &str = "otp";

    /// The pending one-time code for a phone and purpose.
    #[derive(Debug, Clone)]
    pub struct CodeKey {
        pub phone: String,
        pub purpose: String,
    }

    impl CodeKey {
        pub fn new(phone: impl Into<String>, purpose: impl Into<String>) -> Self {
            Self {
                phone: phone.into(),
                purpose: purpose.into(),
            }
        }
    }

    impl fmt::Display for CodeKey {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(
                f,
                "{}:{}:code:{}:{}",
                VERSION, NAMESPACE, self.purpose, self.phone
            )
        }
    }

    /// Set after a successful verify, consumed once by the guarded action.
    #[derive(Debug, Clone)]
    pub struct VerifiedKey {
        pub phone: String,
        pub purpose: String,
    }

    impl VerifiedKey {
        pub fn new(phone: impl Into<String>, purpose: impl Into<String>) -> Self {
            Self {
                phone: phone.into(),
                purpose: purpose.into(),
            }
        }
    }

    impl fmt::Display for VerifiedKey {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(
                f,
                "{}:{}:verified:{}:{}",
                VERSION, NAMESPACE, self.purpose, self.phone
            )
        }
    }

    #[derive(Debug, Clone)]
    pub struct CooldownKey {
        pub phone: String,
        pub purpose: String,
    }

    impl CooldownKey {
        pub fn new(phone: impl Into<String>, purpose: impl Into<String>) -> Self {
            Self {
                phone: phone.into(),
                purpose: purpose.into(),
            }
        }
    }

    impl fmt::Display for CooldownKey {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(
                f,
                "{}:{}:cooldown:{}:{}",
                VERSION, NAMESPACE, self.purpose, self.phone
            )
        }
    }

    /// Wrong-code counter for a phone and purpose.
    #[derive(Debug, Clone)]
    pub struct AttemptsKey {
        pub phone: String,
        pub purpose: String,
    }

    impl AttemptsKey {
        pub fn new(phone: impl Into<String>, purpose: impl Into<String>) -> Self {
            Self {
                phone: phone.into(),
                purpose: purpose.into(),
            }
        }
    }

    impl fmt::Display for AttemptsKey {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(
                f,
                "{}:{}:attempts:{}:{}",
                VERSION, NAMESPACE, self.purpose, self.phone
            )
        }
    }

    /// Hourly send counter. Phone-global, not scoped by purpose.
    #[derive(Debug, Clone)]
    pub struct RateLimitKey {
        pub phone: String,
    }

    impl RateLimitKey {
        pub fn new(phone: impl Into<String>) -> Self {
            Self {
                phone: phone.into(),
            }
        }
    }

    impl fmt::Display for RateLimitKey {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}:{}:rate:{}", VERSION, NAMESPACE, self.phone)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_key() {
        let key = otp::CodeKey::new("998901234567", "login");
        assert_eq!(key.to_string(), "v1:otp:code:login:998901234567");
    }

    #[test]
    fn test_verified_key() {
        let key = otp::VerifiedKey::new("998901234567", "checkout");
        assert_eq!(key.to_string(), "v1:otp:verified:checkout:998901234567");
    }

    #[test]
    fn test_cooldown_and_attempts_keys() {
        let cooldown = otp::CooldownKey::new("998901234567", "login");
        let attempts = otp::AttemptsKey::new("998901234567", "login");
        assert_eq!(cooldown.to_string(), "v1:otp:cooldown:login:998901234567");
        assert_eq!(attempts.to_string(), "v1:otp:attempts:login:998901234567");
    }

    #[test]
    fn test_rate_limit_key_ignores_purpose() {
        let key = otp::RateLimitKey::new("998901234567");
        assert_eq!(key.to_string(), "v1:otp:rate:998901234567");
    }
}
