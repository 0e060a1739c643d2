use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{RelayError, Result};
use crate::types::RetryStrategy;

/// Top-level configuration for every resilience component
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub circuit: CircuitSettings,
    pub pool: PoolSettings,
    pub limiter: LimiterSettings,
    pub cache: CacheSettings,
    pub dispatcher: DispatcherSettings,
}

impl RelayConfig {
    /// Load configuration from environment variables
    pub fn load() -> std::result::Result<Self, ConfigError> {
        Self::load_from_env("RELAY")
    }

    /// Load configuration from environment with custom prefix.
    ///
    /// Nested keys use `__`, e.g. `RELAY__POOL__MAX_CONNECTIONS=20`.
    pub fn load_from_env(prefix: &str) -> std::result::Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(
                Environment::with_prefix(prefix)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        config.try_deserialize()
    }

    /// Load configuration from file with environment overrides
    pub fn load_from_file(path: impl AsRef<Path>) -> std::result::Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::from(path.as_ref()))
            .add_source(
                Environment::with_prefix("RELAY")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        config.try_deserialize()
    }

    /// Reject settings the components cannot honour
    pub fn validate(&self) -> Result<()> {
        if self.circuit.failure_threshold == 0 {
            return Err(RelayError::Configuration(
                "circuit.failure_threshold must be at least 1".to_string(),
            ));
        }
        if self.circuit.success_threshold == 0 {
            return Err(RelayError::Configuration(
                "circuit.success_threshold must be at least 1".to_string(),
            ));
        }
        if self.pool.max_connections == 0 {
            return Err(RelayError::Configuration(
                "pool.max_connections must be at least 1".to_string(),
            ));
        }
        if self.pool.min_connections > self.pool.max_connections {
            return Err(RelayError::Configuration(format!(
                "pool.min_connections ({}) exceeds pool.max_connections ({})",
                self.pool.min_connections, self.pool.max_connections
            )));
        }
        if self.pool.idle_timeout_ms == 0 {
            return Err(RelayError::Configuration(
                "pool.idle_timeout_ms must be non-zero".to_string(),
            ));
        }
        if self.limiter.max_requests == 0 || self.limiter.window_ms == 0 {
            return Err(RelayError::Configuration(
                "limiter.max_requests and limiter.window_ms must be non-zero".to_string(),
            ));
        }
        if self.cache.max_entries == 0 {
            return Err(RelayError::Configuration(
                "cache.max_entries must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Failure circuit settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitSettings {
    pub failure_threshold: u32,
    pub recovery_timeout_ms: u64,
    pub success_threshold: u32,
}

impl Default for CircuitSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_ms: 30_000,
            success_threshold: 3,
        }
    }
}

impl CircuitSettings {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }
}

/// Resource pool settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    pub min_connections: usize,
    pub max_connections: usize,
    pub idle_timeout_ms: u64,
    pub acquire_timeout_ms: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            min_connections: 2,
            max_connections: 10,
            idle_timeout_ms: 30_000,
            acquire_timeout_ms: 5_000,
        }
    }
}

impl PoolSettings {
    pub fn with_pool_size(mut self, min: usize, max: usize) -> Self {
        self.min_connections = min;
        self.max_connections = max;
        self
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

/// Sliding-window limiter settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimiterSettings {
    pub max_requests: usize,
    pub window_ms: u64,
    pub block_duration_ms: u64,
}

impl Default for LimiterSettings {
    fn default() -> Self {
        Self {
            max_requests: 100,
            window_ms: 60_000,
            block_duration_ms: 60_000,
        }
    }
}

impl LimiterSettings {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn block_duration(&self) -> Duration {
        Duration::from_millis(self.block_duration_ms)
    }
}

/// Timed cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Zero disables the default TTL (entries live until evicted)
    pub default_ttl_ms: u64,
    pub max_entries: usize,
    #[serde(default)]
    pub cleanup_interval_ms: Option<u64>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            default_ttl_ms: 300_000,
            max_entries: 1000,
            cleanup_interval_ms: None,
        }
    }
}

impl CacheSettings {
    pub fn default_ttl(&self) -> Option<Duration> {
        (self.default_ttl_ms > 0).then(|| Duration::from_millis(self.default_ttl_ms))
    }

    pub fn cleanup_interval(&self) -> Option<Duration> {
        self.cleanup_interval_ms.map(Duration::from_millis)
    }
}

/// Dispatcher retry settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherSettings {
    pub retries: u32,
    pub retry_strategy: RetryStrategy,
    pub base_delay_ms: u64,
    pub timeout_ms: u64,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            retries: 3,
            retry_strategy: RetryStrategy::Exponential,
            base_delay_ms: 1_000,
            timeout_ms: 30_000,
        }
    }
}

impl DispatcherSettings {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RelayConfig::default();

        assert_eq!(config.circuit.failure_threshold, 5);
        assert_eq!(config.circuit.recovery_timeout(), Duration::from_secs(30));
        assert_eq!(config.circuit.success_threshold, 3);
        assert_eq!(config.dispatcher.retry_strategy, RetryStrategy::Exponential);
        assert_eq!(config.cache.default_ttl(), Some(Duration::from_secs(300)));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_pool_size_validation() {
        let mut config = RelayConfig::default();
        config.pool = PoolSettings::default().with_pool_size(5, 2);

        let err = config.validate().unwrap_err();
        assert_eq!(err.error_code(), "CONFIGURATION_ERROR");
    }

    #[test]
    fn test_zero_threshold_rejected() {
        let mut config = RelayConfig::default();
        config.circuit.failure_threshold = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_ttl_disables_default_ttl() {
        let settings = CacheSettings {
            default_ttl_ms: 0,
            ..Default::default()
        };
        assert_eq!(settings.default_ttl(), None);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: RelayConfig = serde_json::from_str(
            r#"{"pool": {"max_connections": 4}, "dispatcher": {"retry_strategy": "linear"}}"#,
        )
        .unwrap();

        assert_eq!(config.pool.max_connections, 4);
        assert_eq!(config.pool.min_connections, 2);
        assert_eq!(config.dispatcher.retry_strategy, RetryStrategy::Linear);
        assert_eq!(config.limiter.max_requests, 100);
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join(format!("relay-config-{}.toml", uuid::Uuid::new_v4()));
        std::fs::write(
            &path,
            "[circuit]\nfailure_threshold = 3\n\n[limiter]\nmax_requests = 2\nwindow_ms = 1000\n",
        )
        .unwrap();

        let config = RelayConfig::load_from_file(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(config.circuit.failure_threshold, 3);
        assert_eq!(config.limiter.max_requests, 2);
        assert_eq!(config.limiter.window(), Duration::from_secs(1));
        assert_eq!(config.pool.max_connections, 10);
    }
}
