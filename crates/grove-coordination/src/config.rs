//! Configuration for coordination primitives.
//!
//! Configuration is layered: built-in defaults, then an optional TOML file,
//! then `GROVE_*` environment variables. The result is validated before any
//! component is constructed so misconfiguration halts startup.
//!
//! ```toml
//! [store]
//! url = "redis://10.0.0.2:6379"
//!
//! [lock]
//! default_ttl_ms = 5000
//!
//! [pool]
//! pool_size = 4
//! ```

use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use snafu::ResultExt;
use snafu::Snafu;

use crate::constants::*;
use crate::error::CoordinationError;

/// Top-level configuration for every coordination component.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinationConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
}

/// Backing store connection parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store URL, e.g. `redis://127.0.0.1:6379`.
    #[serde(default = "default_store_url")]
    pub url: String,
    /// Per-command timeout in milliseconds.
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
}

/// Lock acquisition defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockConfig {
    #[serde(default = "default_lock_ttl_ms")]
    pub default_ttl_ms: u64,
    #[serde(default = "default_lock_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Retries after the first attempt; 0 means a single attempt.
    #[serde(default = "default_lock_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_lock_wait_timeout_ms")]
    pub wait_timeout_ms: u64,
}

/// Connection pool sizing and timeouts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    /// Longest a caller may wait in the queue before `PoolTimeout`.
    #[serde(default = "default_max_wait_ms")]
    pub max_wait_ms: u64,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_max_connection_errors")]
    pub max_connection_errors: u32,
    /// Recreate a connection in the background after each eviction.
    #[serde(default = "default_replenish_evicted")]
    pub replenish_evicted: bool,
}

/// Service registry timing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Records without a heartbeat for this long are stale.
    #[serde(default = "default_service_ttl_ms")]
    pub service_ttl_ms: u64,
}

/// Discovery cache settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default = "default_cache_ttl_ms")]
    pub cache_ttl_ms: u64,
}

impl CoordinationConfig {
    /// Load configuration from a TOML file.
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).context(ReadFileSnafu { path })?;
        toml::from_str(&content).context(ParseTomlSnafu { path })
    }

    /// Load defaults, then `path` if given, then environment overrides, and validate.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_toml_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from the process environment.
    ///
    /// Variables follow the pattern `GROVE_<SECTION>_<FIELD>` in uppercase,
    /// e.g. `GROVE_POOL_POOL_SIZE` or `GROVE_LOCK_DEFAULT_TTL_MS`.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Apply overrides using `lookup` to resolve variable names.
    pub fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        override_from(&lookup, "GROVE_STORE_URL", &mut self.store.url);
        override_from(&lookup, "GROVE_STORE_COMMAND_TIMEOUT_MS", &mut self.store.command_timeout_ms);

        override_from(&lookup, "GROVE_LOCK_DEFAULT_TTL_MS", &mut self.lock.default_ttl_ms);
        override_from(&lookup, "GROVE_LOCK_RETRY_DELAY_MS", &mut self.lock.retry_delay_ms);
        override_from(&lookup, "GROVE_LOCK_MAX_RETRIES", &mut self.lock.max_retries);
        override_from(&lookup, "GROVE_LOCK_WAIT_TIMEOUT_MS", &mut self.lock.wait_timeout_ms);

        override_from(&lookup, "GROVE_POOL_POOL_SIZE", &mut self.pool.pool_size);
        override_from(&lookup, "GROVE_POOL_CONNECT_TIMEOUT_MS", &mut self.pool.connect_timeout_ms);
        override_from(&lookup, "GROVE_POOL_IDLE_TIMEOUT_MS", &mut self.pool.idle_timeout_ms);
        override_from(&lookup, "GROVE_POOL_MAX_WAIT_MS", &mut self.pool.max_wait_ms);
        override_from(&lookup, "GROVE_POOL_RETRY_ATTEMPTS", &mut self.pool.retry_attempts);
        override_from(&lookup, "GROVE_POOL_RETRY_DELAY_MS", &mut self.pool.retry_delay_ms);
        override_from(&lookup, "GROVE_POOL_MAX_CONNECTION_ERRORS", &mut self.pool.max_connection_errors);
        override_from(&lookup, "GROVE_POOL_REPLENISH_EVICTED", &mut self.pool.replenish_evicted);

        override_from(&lookup, "GROVE_REGISTRY_HEARTBEAT_INTERVAL_MS", &mut self.registry.heartbeat_interval_ms);
        override_from(&lookup, "GROVE_REGISTRY_SERVICE_TTL_MS", &mut self.registry.service_ttl_ms);

        override_from(&lookup, "GROVE_DISCOVERY_CACHE_TTL_MS", &mut self.discovery.cache_ttl_ms);
    }

    /// Validate every section.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.store.validate()?;
        self.lock.validate()?;
        self.pool.validate()?;
        self.registry.validate()?;
        self.discovery.validate()?;
        Ok(())
    }
}

impl StoreConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.url.trim().is_empty() {
            return Err(validation("store.url must not be empty"));
        }
        if self.command_timeout_ms == 0 {
            return Err(validation("store.command_timeout_ms must be non-zero"));
        }
        Ok(())
    }

    /// Build a Redis connection factory for this store.
    #[cfg(feature = "redis")]
    pub fn redis_factory(&self) -> Result<grove_kv::RedisConnectionFactory, CoordinationError> {
        self.validate()?;
        Ok(grove_kv::RedisConnectionFactory::new(&self.url, self.command_timeout())?)
    }
}

impl LockConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_millis(self.default_ttl_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_ttl_ms == 0 {
            return Err(validation("lock.default_ttl_ms must be non-zero"));
        }
        if self.wait_timeout_ms == 0 {
            return Err(validation("lock.wait_timeout_ms must be non-zero"));
        }
        Ok(())
    }
}

impl PoolConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool_size == 0 {
            return Err(validation("pool.pool_size must be non-zero"));
        }
        if self.pool_size > MAX_POOL_SIZE {
            return Err(ConfigError::Validation {
                message: format!("pool.pool_size must be at most {MAX_POOL_SIZE}"),
            });
        }
        if self.connect_timeout_ms == 0 {
            return Err(validation("pool.connect_timeout_ms must be non-zero"));
        }
        if self.idle_timeout_ms == 0 {
            return Err(validation("pool.idle_timeout_ms must be non-zero"));
        }
        if self.max_wait_ms == 0 {
            return Err(validation("pool.max_wait_ms must be non-zero"));
        }
        if self.retry_attempts == 0 {
            return Err(validation("pool.retry_attempts must be at least 1"));
        }
        Ok(())
    }
}

impl RegistryConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn service_ttl(&self) -> Duration {
        Duration::from_millis(self.service_ttl_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_interval_ms == 0 {
            return Err(validation("registry.heartbeat_interval_ms must be non-zero"));
        }
        if self.service_ttl_ms == 0 {
            return Err(validation("registry.service_ttl_ms must be non-zero"));
        }
        if self.heartbeat_interval_ms >= self.service_ttl_ms {
            return Err(validation("registry.heartbeat_interval_ms must be less than registry.service_ttl_ms"));
        }
        Ok(())
    }
}

impl DiscoveryConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache_ttl_ms == 0 {
            return Err(validation("discovery.cache_ttl_ms must be non-zero"));
        }
        Ok(())
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: default_store_url(),
            command_timeout_ms: default_command_timeout_ms(),
        }
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            default_ttl_ms: default_lock_ttl_ms(),
            retry_delay_ms: default_lock_retry_delay_ms(),
            max_retries: default_lock_max_retries(),
            wait_timeout_ms: default_lock_wait_timeout_ms(),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            connect_timeout_ms: default_connect_timeout_ms(),
            idle_timeout_ms: default_idle_timeout_ms(),
            max_wait_ms: default_max_wait_ms(),
            retry_attempts: default_retry_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            max_connection_errors: default_max_connection_errors(),
            replenish_evicted: default_replenish_evicted(),
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            service_ttl_ms: default_service_ttl_ms(),
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            cache_ttl_ms: default_cache_ttl_ms(),
        }
    }
}

// Default value functions
fn default_store_url() -> String {
    "redis://127.0.0.1:6379".into()
}

fn default_command_timeout_ms() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_MS
}

fn default_lock_ttl_ms() -> u64 {
    DEFAULT_LOCK_TTL_MS
}

fn default_lock_retry_delay_ms() -> u64 {
    DEFAULT_LOCK_RETRY_DELAY_MS
}

fn default_lock_max_retries() -> u32 {
    DEFAULT_LOCK_MAX_RETRIES
}

fn default_lock_wait_timeout_ms() -> u64 {
    DEFAULT_LOCK_WAIT_TIMEOUT_MS
}

fn default_pool_size() -> u32 {
    DEFAULT_POOL_SIZE
}

fn default_connect_timeout_ms() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_MS
}

fn default_idle_timeout_ms() -> u64 {
    DEFAULT_IDLE_TIMEOUT_MS
}

fn default_max_wait_ms() -> u64 {
    DEFAULT_MAX_WAIT_MS
}

fn default_retry_attempts() -> u32 {
    DEFAULT_CONNECT_RETRY_ATTEMPTS
}

fn default_retry_delay_ms() -> u64 {
    DEFAULT_CONNECT_RETRY_DELAY_MS
}

fn default_max_connection_errors() -> u32 {
    DEFAULT_MAX_CONNECTION_ERRORS
}

fn default_replenish_evicted() -> bool {
    true
}

fn default_heartbeat_interval_ms() -> u64 {
    DEFAULT_HEARTBEAT_INTERVAL_MS
}

fn default_service_ttl_ms() -> u64 {
    DEFAULT_SERVICE_TTL_MS
}

fn default_cache_ttl_ms() -> u64 {
    DEFAULT_DISCOVERY_CACHE_TTL_MS
}

/// Overwrite `target` with the parsed value of `key`, if set and parseable.
fn override_from<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, target: &mut T) {
    if let Some(value) = lookup(key).and_then(|raw| raw.trim().parse().ok()) {
        *target = value;
    }
}

fn validation(message: &str) -> ConfigError {
    ConfigError::Validation {
        message: message.to_string(),
    }
}

/// Configuration loading and parsing errors.
#[derive(Debug, Snafu)]
pub enum ConfigError {
    #[snafu(display("failed to read config file {}: {source}", path.display()))]
    ReadFile { path: PathBuf, source: std::io::Error },

    #[snafu(display("failed to parse TOML config file {}: {source}", path.display()))]
    ParseToml { path: PathBuf, source: toml::de::Error },

    #[snafu(display("configuration validation failed: {message}"))]
    Validation { message: String },
}

impl From<ConfigError> for CoordinationError {
    fn from(err: ConfigError) -> Self {
        CoordinationError::InvalidArgument {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = CoordinationConfig::default();
        config.validate().unwrap();
        assert_eq!(config.pool.pool_size, DEFAULT_POOL_SIZE);
        assert_eq!(config.lock.default_ttl(), Duration::from_secs(30));
        assert!(config.pool.replenish_evicted);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: CoordinationConfig = toml::from_str(
            r#"
            [pool]
            pool_size = 4

            [lock]
            default_ttl_ms = 5000
            "#,
        )
        .unwrap();
        assert_eq!(config.pool.pool_size, 4);
        assert_eq!(config.pool.max_wait_ms, DEFAULT_MAX_WAIT_MS);
        assert_eq!(config.lock.default_ttl_ms, 5000);
        assert_eq!(config.registry, RegistryConfig::default());
    }

    #[test]
    fn env_overrides_replace_values() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("GROVE_POOL_POOL_SIZE", "2"),
            ("GROVE_STORE_URL", "redis://10.0.0.2:6379"),
            ("GROVE_POOL_REPLENISH_EVICTED", "false"),
            ("GROVE_LOCK_MAX_RETRIES", "not-a-number"),
        ]);
        let mut config = CoordinationConfig::default();
        config.apply_overrides_from(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.pool.pool_size, 2);
        assert_eq!(config.store.url, "redis://10.0.0.2:6379");
        assert!(!config.pool.replenish_evicted);
        // Unparseable values are ignored.
        assert_eq!(config.lock.max_retries, DEFAULT_LOCK_MAX_RETRIES);
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut config = CoordinationConfig::default();
        config.pool.pool_size = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Validation { .. })));

        let mut config = CoordinationConfig::default();
        config.registry.heartbeat_interval_ms = config.registry.service_ttl_ms;
        assert!(config.validate().is_err());

        let mut config = CoordinationConfig::default();
        config.store.url = "  ".into();
        assert!(config.validate().is_err());

        let mut config = CoordinationConfig::default();
        config.lock.wait_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_reads_toml_file() {
        let dir = std::env::temp_dir().join(format!("grove-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("grove.toml");
        std::fs::write(&path, "[discovery]\ncache_ttl_ms = 250\n").unwrap();

        let config = CoordinationConfig::from_toml_file(&path).unwrap();
        assert_eq!(config.discovery.cache_ttl(), Duration::from_millis(250));

        let missing = CoordinationConfig::from_toml_file(&dir.join("missing.toml"));
        assert!(matches!(missing, Err(ConfigError::ReadFile { .. })));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn config_error_maps_to_invalid_argument() {
        let err: CoordinationError = validation("bad").into();
        assert!(matches!(err, CoordinationError::InvalidArgument { .. }));
    }
}
