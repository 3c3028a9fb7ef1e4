//! Application configuration module
//! Handles environment variable loading, configuration validation, and application settings.
//!
//! Gateway, OTP and fiscal sections live beside the code that uses them and
//! are composed here.

use std::env;
use std::str::FromStr;

use crate::commerce::CommerceConfig;
use crate::otp::OtpConfig;
use crate::payments::fiscal::FiscalPolicy;
use crate::payments::providers::click::ClickConfig;
use crate::payments::providers::payme::PaymeConfig;
use crate::workers::order_reconciliation::ReconciliationConfig;

/// Main application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub cache: CacheConfig,
    pub logging: LoggingConfig,
    pub otp: OtpConfig,
    pub payme: PaymeConfig,
    pub click: ClickConfig,
    pub commerce: CommerceConfig,
    pub fiscal: FiscalPolicy,
    pub reconciliation: ReconciliationConfig,
    /// Run on in-memory stores without Postgres or Redis
    pub skip_externals: bool,
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connection_timeout: u64,   // seconds
    pub idle_timeout: Option<u64>, // seconds
}

/// Cache configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub redis_url: String,
    pub max_connections: u32,
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

/// Log format options
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Plain,
}

impl AppConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if it exists
        let _ = dotenv::dotenv().ok();

        let skip_externals = env_flag("SKIP_EXTERNALS");

        Ok(AppConfig {
            server: ServerConfig::from_env()?,
            database: if skip_externals {
                DatabaseConfig::unused()
            } else {
                DatabaseConfig::from_env()?
            },
            cache: CacheConfig::from_env()?,
            logging: LoggingConfig::from_env()?,
            otp: OtpConfig::from_env()?,
            payme: PaymeConfig::from_env()?,
            click: ClickConfig::from_env()?,
            commerce: CommerceConfig::from_env()?,
            fiscal: FiscalPolicy::from_env()?,
            reconciliation: ReconciliationConfig::from_env()?,
            skip_externals,
        })
    }

    /// Validate the entire configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.validate()?;
        if !self.skip_externals {
            self.database.validate()?;
            self.cache.validate()?;
            self.commerce.validate()?;
        }
        self.logging.validate()?;
        self.otp.validate()?;
        self.payme.validate()?;
        self.click.validate()?;
        self.fiscal.validate()?;

        Ok(())
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(ServerConfig {
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env_parse("PORT", 8000)?,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::InvalidValue("PORT cannot be 0".to_string()));
        }

        if self.host.is_empty() {
            return Err(ConfigError::InvalidValue("HOST cannot be empty".to_string()));
        }

        Ok(())
    }
}

impl DatabaseConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(DatabaseConfig {
            url: env::var("DATABASE_URL")
                .map_err(|_| ConfigError::MissingVariable("DATABASE_URL".to_string()))?,
            max_connections: env_parse("DB_MAX_CONNECTIONS", 20)?,
            min_connections: env_parse("DB_MIN_CONNECTIONS", 5)?,
            connection_timeout: env_parse("DB_CONNECTION_TIMEOUT", 30)?,
            idle_timeout: env::var("DB_IDLE_TIMEOUT")
                .ok()
                .and_then(|val| val.parse().ok()),
        })
    }

    fn unused() -> Self {
        DatabaseConfig {
            url: String::new(),
            max_connections: 0,
            min_connections: 0,
            connection_timeout: 0,
            idle_timeout: None,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.url.is_empty() {
            return Err(ConfigError::InvalidValue("DATABASE_URL".to_string()));
        }

        if self.max_connections == 0 {
            return Err(ConfigError::InvalidValue("DB_MAX_CONNECTIONS".to_string()));
        }

        if self.min_connections > self.max_connections {
            return Err(ConfigError::InvalidValue(
                "DB_MIN_CONNECTIONS must be <= DB_MAX_CONNECTIONS".to_string(),
            ));
        }

        Ok(())
    }
}

impl CacheConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(CacheConfig {
            redis_url: env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
            max_connections: env_parse("CACHE_MAX_CONNECTIONS", 10)?,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.redis_url.is_empty() {
            return Err(ConfigError::InvalidValue("REDIS_URL".to_string()));
        }

        if !self.redis_url.starts_with("redis://") && !self.redis_url.starts_with("rediss://") {
            return Err(ConfigError::InvalidValue(
                "REDIS_URL must start with redis:// or rediss://".to_string(),
            ));
        }

        Ok(())
    }
}

impl LoggingConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(LoggingConfig {
            level: env::var("LOG_LEVEL").unwrap_or_else(|_| "INFO".to_string()),
            format: match env::var("LOG_FORMAT")
                .unwrap_or_else(|_| "plain".to_string())
                .as_str()
            {
                "json" => LogFormat::Json,
                _ => LogFormat::Plain,
            },
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["TRACE", "DEBUG", "INFO", "WARN", "ERROR"];
        if !valid_levels.contains(&self.level.to_uppercase().as_str()) {
            return Err(ConfigError::InvalidValue("LOG_LEVEL".to_string()));
        }

        Ok(())
    }
}

/// Parse an optional variable, falling back to `default` when unset.
/// A set but unparsable value is an error rather than a silent default.
pub fn env_parse<T: FromStr>(name: &str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(name.to_string())),
        Err(_) => Ok(default),
    }
}

/// Read a variable that may be absent; empty strings count as absent.
pub fn env_opt(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

pub fn env_flag(name: &str) -> bool {
    env::var(name)
        .map(|v| matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVariable(String),

    #[error("Invalid value for configuration: {0}")]
    InvalidValue(String),

    #[error("Validation failed: {0}")]
    ValidationFailed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_validation() {
        let config = ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 8000,
        };

        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_port_validation() {
        let config = ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
        };

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_cache_url_scheme_validation() {
        let config = CacheConfig {
            redis_url: "http://localhost:6379".to_string(),
            max_connections: 10,
        };

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_parse_rejects_garbage() {
        std::env::set_var("UZPAY_TEST_PARSE", "abc");
        let parsed: Result<u64, _> = env_parse("UZPAY_TEST_PARSE", 5);
        assert!(matches!(parsed, Err(ConfigError::InvalidValue(_))));
        std::env::remove_var("UZPAY_TEST_PARSE");

        let fallback: u64 = env_parse("UZPAY_TEST_PARSE_UNSET", 5).unwrap();
        assert_eq!(fallback, 5);
    }
}
