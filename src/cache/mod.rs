//! Redis connection pool backing the OTP store
//!
//! The pool is shared by every OTP purpose. All mutating OTP operations are
//! single-key (or fixed small key set) atomic scripts, so no cross-key
//! locking happens here.

pub mod error;
pub mod keys;

pub use error::{CacheError, CacheResult};

#[cfg(feature = "cache")]
use bb8::Pool;
#[cfg(feature = "cache")]
use bb8_redis::RedisConnectionManager;
#[cfg(feature = "cache")]
use redis::Client;
use std::time::Duration;
#[cfg(feature = "cache")]
use tracing::{error, info, warn};

/// Redis connection pool type alias
#[cfg(feature = "cache")]
pub type RedisPool = Pool<RedisConnectionManager>;

/// Redis pool configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Redis connection URL
    pub redis_url: String,
    /// Maximum number of connections in the pool
    pub max_connections: u32,
    /// Minimum idle connections
    pub min_idle: u32,
    /// Connection timeout
    pub connection_timeout: Duration,
    /// Maximum lifetime of a connection
    pub max_lifetime: Duration,
    /// Idle timeout before closing connection
    pub idle_timeout: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            max_connections: 20,
            min_idle: 2,
            connection_timeout: Duration::from_secs(3),
            max_lifetime: Duration::from_secs(300),
            idle_timeout: Duration::from_secs(60),
        }
    }
}

/// Initialize the Redis connection pool.
///
/// Unlike a read-through cache, the OTP flow has no safe fallback without
/// the store, so a failed initial PING is an error.
#[cfg(feature = "cache")]
pub async fn init_cache_pool(config: CacheConfig) -> Result<RedisPool, CacheError> {
    info!(
        max_connections = config.max_connections,
        redis_host = %redis_host(&config.redis_url),
        "Initializing Redis pool"
    );

    let client = Client::open(config.redis_url.clone()).map_err(|e| {
        error!("Failed to create Redis client: {}", e);
        CacheError::ConnectionError(e.to_string())
    })?;

    let manager = RedisConnectionManager::new(client.get_connection_info().clone()).map_err(|e| {
        error!("Failed to create Redis connection manager: {}", e);
        CacheError::ConnectionError(e.to_string())
    })?;

    let pool = Pool::builder()
        .max_size(config.max_connections)
        .min_idle(config.min_idle)
        .connection_timeout(config.connection_timeout)
        .max_lifetime(config.max_lifetime)
        .idle_timeout(config.idle_timeout)
        .test_on_check_out(false)
        .build(manager)
        .await
        .map_err(|e| {
            error!("Failed to build Redis connection pool: {}", e);
            CacheError::ConnectionError(e.to_string())
        })?;

    if let Err(e) = health_check(&pool).await {
        warn!("Initial Redis connection test failed: {}", e);
        return Err(e);
    }

    info!("Redis pool initialized successfully");
    Ok(pool)
}

/// PING through the pool.
#[cfg(feature = "cache")]
pub async fn health_check(pool: &RedisPool) -> Result<(), CacheError> {
    let mut conn = pool.get().await.map_err(|e| {
        error!("Failed to get Redis connection for ping: {}", e);
        CacheError::ConnectionError(e.to_string())
    })?;

    let _: String = redis::cmd("PING")
        .query_async(&mut *conn)
        .await
        .map_err(|e| {
            error!("Redis PING failed: {}", e);
            CacheError::ConnectionError(e.to_string())
        })?;

    Ok(())
}

/// Host part of a Redis URL; credentials stay out of the logs.
fn redis_host(url: &str) -> &str {
    let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
    rest.rsplit_once('@').map_or(rest, |(_, host)| host)
}
