use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, time::Duration};

use catalog_cache::{CoordinatorOptions, KeySpace, RedisPoolOptions};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Redis connection and startup behavior
    #[serde(default)]
    pub redis: RedisConfig,
    /// Key layout, TTLs and lock tuning
    #[serde(default)]
    pub cache: CacheConfig,
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.server.port == 0 {
            return Err("server.port must be > 0".into());
        }
        if self.server.shutdown_timeout_ms == 0 {
            return Err("server.shutdown_timeout_ms must be > 0".into());
        }
        let lvl = self.logging.level.to_ascii_lowercase();
        let valid_levels = ["trace", "debug", "info", "warn", "error", "off"];
        if !valid_levels.contains(&lvl.as_str()) {
            return Err(format!("logging.level must be one of {valid_levels:?}"));
        }
        if self.redis.enabled {
            if self.redis.url.trim().is_empty() {
                return Err("redis.enabled=true requires redis.url".into());
            }
            if self.redis.pool_size == 0 {
                return Err("redis.pool_size must be > 0".into());
            }
            if self.redis.initial_backoff_ms > self.redis.max_backoff_ms {
                return Err("redis.initial_backoff_ms must be <= redis.max_backoff_ms".into());
            }
        }
        if self.cache.namespace.is_empty() || self.cache.namespace.contains(':') {
            return Err("cache.namespace must be non-empty and must not contain ':'".into());
        }
        if self.cache.version.is_empty() || self.cache.version.contains(':') {
            return Err("cache.version must be non-empty and must not contain ':'".into());
        }
        if self.cache.item_ttl_secs == 0
            || self.cache.list_ttl_secs == 0
            || self.cache.tags_ttl_secs == 0
        {
            return Err("cache TTLs must be > 0".into());
        }
        if self.cache.lock_ttl_secs == 0 {
            return Err("cache.lock_ttl_secs must be > 0".into());
        }
        if self.cache.scan_page_size == 0 {
            return Err("cache.scan_page_size must be > 0".into());
        }
        Ok(())
    }

    pub fn addr(&self) -> SocketAddr {
        use std::net::{IpAddr, Ipv4Addr};
        let host: IpAddr = self
            .server
            .host
            .parse()
            .unwrap_or(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)));
        SocketAddr::from((host, self.server.port))
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.server.shutdown_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// How long in-flight requests get to finish after a shutdown signal
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
    /// Seed the in-memory catalog with a few demo products at startup
    #[serde(default)]
    pub seed_demo_data: bool,
}

fn default_host() -> String {
    "0.0.0.0".into()
}
fn default_port() -> u16 {
    8080
}
fn default_shutdown_timeout_ms() -> u64 {
    10_000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            seed_demo_data: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}
fn default_log_level() -> String {
    "info".into()
}
impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Redis configuration for the shared cache.
///
/// With Redis disabled the service runs on the in-process cache, which is
/// correct for a single instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Enable Redis
    /// Default: false (single-instance deployments)
    #[serde(default)]
    pub enabled: bool,

    /// Redis connection URL (e.g., "redis://localhost:6379")
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Connection pool size
    #[serde(default = "default_redis_pool_size")]
    pub pool_size: usize,

    /// Connection and command timeout in milliseconds
    #[serde(default = "default_redis_timeout_ms")]
    pub timeout_ms: u64,

    /// Health round-trips attempted at startup before giving up
    #[serde(default = "default_redis_max_retries")]
    pub max_retries: u32,

    /// Delay before the first retry; doubles after each failure
    #[serde(default = "default_redis_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Upper bound for the retry delay
    #[serde(default = "default_redis_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Start on the in-process cache when Redis never becomes healthy.
    /// When false, startup fails instead.
    #[serde(default = "default_fallback_to_local")]
    pub fallback_to_local: bool,
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_redis_pool_size() -> usize {
    10
}

fn default_redis_timeout_ms() -> u64 {
    5000
}

fn default_redis_max_retries() -> u32 {
    10
}

fn default_redis_initial_backoff_ms() -> u64 {
    1000
}

fn default_redis_max_backoff_ms() -> u64 {
    10_000
}

fn default_fallback_to_local() -> bool {
    true
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: default_redis_url(),
            pool_size: default_redis_pool_size(),
            timeout_ms: default_redis_timeout_ms(),
            max_retries: default_redis_max_retries(),
            initial_backoff_ms: default_redis_initial_backoff_ms(),
            max_backoff_ms: default_redis_max_backoff_ms(),
            fallback_to_local: default_fallback_to_local(),
        }
    }
}

impl RedisConfig {
    pub fn pool_options(&self, scan_page_size: usize) -> RedisPoolOptions {
        RedisPoolOptions {
            pool_size: self.pool_size,
            timeout: Duration::from_millis(self.timeout_ms),
            scan_page_size,
        }
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

/// Cache key layout and lifetimes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// First key segment, the entity name
    #[serde(default = "default_cache_namespace")]
    pub namespace: String,

    /// Second key segment. Bump it to retire every cached entry at once.
    #[serde(default = "default_cache_version")]
    pub version: String,

    /// TTL for single-product entries in seconds
    #[serde(default = "default_item_ttl_secs")]
    pub item_ttl_secs: u64,

    /// TTL for product list pages in seconds
    #[serde(default = "default_list_ttl_secs")]
    pub list_ttl_secs: u64,

    /// TTL for product tag collections in seconds
    #[serde(default = "default_tags_ttl_secs")]
    pub tags_ttl_secs: u64,

    /// Lifetime of a fetch lock whose holder never released it
    #[serde(default = "default_lock_ttl_secs")]
    pub lock_ttl_secs: u64,

    /// How long to wait for another instance's write-back when its lock is
    /// held. 0 fetches immediately.
    #[serde(default)]
    pub lock_wait_ms: u64,

    /// Keys requested per SCAN page during list invalidation
    #[serde(default = "default_scan_page_size")]
    pub scan_page_size: usize,
}

fn default_cache_namespace() -> String {
    "products".to_string()
}

fn default_cache_version() -> String {
    "v1".to_string()
}

fn default_item_ttl_secs() -> u64 {
    600
}

fn default_list_ttl_secs() -> u64 {
    300
}

fn default_tags_ttl_secs() -> u64 {
    300
}

fn default_lock_ttl_secs() -> u64 {
    5
}

fn default_scan_page_size() -> usize {
    catalog_cache::backend::DEFAULT_SCAN_PAGE_SIZE
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            namespace: default_cache_namespace(),
            version: default_cache_version(),
            item_ttl_secs: default_item_ttl_secs(),
            list_ttl_secs: default_list_ttl_secs(),
            tags_ttl_secs: default_tags_ttl_secs(),
            lock_ttl_secs: default_lock_ttl_secs(),
            lock_wait_ms: 0,
            scan_page_size: default_scan_page_size(),
        }
    }
}

impl CacheConfig {
    pub fn key_space(&self) -> KeySpace {
        KeySpace::new(&self.namespace, &self.version)
    }

    pub fn coordinator_options(&self) -> CoordinatorOptions {
        CoordinatorOptions {
            lock_ttl: Duration::from_secs(self.lock_ttl_secs),
            lock_wait: Duration::from_millis(self.lock_wait_ms),
            ..CoordinatorOptions::default()
        }
    }

    pub fn item_ttl(&self) -> Duration {
        Duration::from_secs(self.item_ttl_secs)
    }

    pub fn list_ttl(&self) -> Duration {
        Duration::from_secs(self.list_ttl_secs)
    }

    pub fn tags_ttl(&self) -> Duration {
        Duration::from_secs(self.tags_ttl_secs)
    }
}

pub mod loader {
    use super::AppConfig;
    use config::{Config, Environment, File};
    use std::path::PathBuf;

    /// Default configuration file, looked up in the working directory.
    pub const DEFAULT_CONFIG_FILE: &str = "catalog.toml";

    pub fn load_config(path: Option<&str>) -> Result<AppConfig, String> {
        let mut builder = Config::builder();
        let path = path
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
        if path.exists() {
            builder = builder.add_source(File::from(path));
        }
        // Environment variable overrides, e.g., CATALOG__REDIS__ENABLED=true
        builder = builder.add_source(
            Environment::with_prefix("CATALOG")
                .prefix_separator("__")
                .try_parsing(true)
                .separator("__"),
        );
        let cfg = builder
            .build()
            .map_err(|e| format!("config build error: {e}"))?;
        let merged: AppConfig = cfg
            .try_deserialize()
            .map_err(|e| format!("config deserialize error: {e}"))?;
        merged.validate()?;
        Ok(merged)
    }
}
