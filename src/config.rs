use crate::error::ConfigError;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Deserialize, Clone, Debug)]
pub struct Config {
    pub flood_control: FloodControlConfig,
    pub store: StoreConfig,
    #[serde(default)]
    pub sweeper: SweeperConfig,
    #[serde(default)]
    pub retry_strategy: RetryStrategyConfig,
}

/// Window parameters, fixed for the lifetime of an engine.
#[derive(Deserialize, Clone, Debug)]
pub struct FloodControlConfig {
    pub window_seconds: u64,
    pub max_requests: u64,
    #[serde(default = "default_sweep_on_check")]
    pub sweep_on_check: bool,
    #[serde(default = "default_store_timeout_millis")]
    pub store_timeout_millis: u64,
}

#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
    Redis,
}

#[derive(Deserialize, Clone, Debug)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub redis_url: Option<String>,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    #[serde(default = "default_pool_max_open")]
    pub pool_max_open: u64,
    #[serde(default = "default_pool_get_timeout_seconds")]
    pub pool_get_timeout_seconds: u64,
}

#[derive(Deserialize, Clone, Debug)]
pub struct SweeperConfig {
    #[serde(default = "default_sweeper_enabled")]
    pub enabled: bool,
    #[serde(default = "default_sweep_interval_millis")]
    pub interval_millis: u64,
    pub reconcile_every: Option<u32>,
}

#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum StrategyType {
    FixedDelay,
    ExponentialBackoff,
    LinearBackoff,
    RandomDelay,
    JitterBackoff,
}

#[derive(Deserialize, Clone, Debug)]
pub struct RetryStrategyConfig {
    pub strategy_type: StrategyType,
    pub max_attempts: usize,
    pub initial_delay_millis: u64,
    pub max_delay_secs: u64,
    pub increment_millis: Option<u64>,
    pub min_delay_millis: Option<u64>,
    pub multiplier: Option<f64>,
}

fn default_sweep_on_check() -> bool {
    true
}

fn default_store_timeout_millis() -> u64 {
    500
}

fn default_key_prefix() -> String {
    "floodcontrol".to_string()
}

fn default_pool_max_open() -> u64 {
    16
}

fn default_pool_get_timeout_seconds() -> u64 {
    5
}

fn default_sweeper_enabled() -> bool {
    true
}

fn default_sweep_interval_millis() -> u64 {
    1000
}

impl Default for SweeperConfig {
    fn default() -> Self {
        SweeperConfig {
            enabled: default_sweeper_enabled(),
            interval_millis: default_sweep_interval_millis(),
            reconcile_every: None,
        }
    }
}

impl Default for RetryStrategyConfig {
    fn default() -> Self {
        RetryStrategyConfig {
            strategy_type: StrategyType::ExponentialBackoff,
            max_attempts: 3,
            initial_delay_millis: 50,
            max_delay_secs: 2,
            increment_millis: None,
            min_delay_millis: None,
            multiplier: None,
        }
    }
}

impl FloodControlConfig {
    /// Window of `window_seconds` admitting `max_requests` per user, other knobs defaulted.
    pub fn new(window_seconds: u64, max_requests: u64) -> Self {
        FloodControlConfig {
            window_seconds,
            max_requests,
            sweep_on_check: default_sweep_on_check(),
            store_timeout_millis: default_store_timeout_millis(),
        }
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_millis)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.window_seconds == 0 {
            return Err("flood_control.window_seconds must be positive".into());
        }
        if self.window_seconds > i64::MAX as u64 {
            return Err("flood_control.window_seconds is out of range".into());
        }
        if self.max_requests == 0 {
            return Err("flood_control.max_requests must be positive".into());
        }
        if self.max_requests > i64::MAX as u64 {
            return Err("flood_control.max_requests is out of range".into());
        }
        if self.store_timeout_millis == 0 {
            return Err("flood_control.store_timeout_millis must be positive".into());
        }
        Ok(())
    }
}

impl SweeperConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_millis)
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.flood_control.validate().map_err(ConfigError::Invalid)?;

        if self.store.backend == StoreBackend::Redis && self.store.redis_url.is_none() {
            return Err(ConfigError::Invalid(
                "store.redis_url is required for the Redis backend".into(),
            ));
        }
        if self.store.pool_max_open == 0 {
            return Err(ConfigError::Invalid(
                "store.pool_max_open must be positive".into(),
            ));
        }
        if self.sweeper.enabled && self.sweeper.interval_millis == 0 {
            return Err(ConfigError::Invalid(
                "sweeper.interval_millis must be positive".into(),
            ));
        }
        if self.sweeper.reconcile_every == Some(0) {
            return Err(ConfigError::Invalid(
                "sweeper.reconcile_every must be positive when set".into(),
            ));
        }
        if self.retry_strategy.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry_strategy.max_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
        [flood_control]
        window_seconds = 60
        max_requests = 5
        sweep_on_check = false
        store_timeout_millis = 250

        [store]
        backend = "Redis"
        redis_url = "redis://127.0.0.1:6379/0"
        key_prefix = "bot"

        [sweeper]
        interval_millis = 500
        reconcile_every = 10

        [retry_strategy]
        strategy_type = "LinearBackoff"
        max_attempts = 4
        initial_delay_millis = 20
        max_delay_secs = 1
        increment_millis = 30
    "#;

    #[test]
    fn test_parses_full_config() {
        let config = Config::from_toml_str(FULL).unwrap();
        assert_eq!(config.flood_control.window_seconds, 60);
        assert_eq!(config.flood_control.max_requests, 5);
        assert!(!config.flood_control.sweep_on_check);
        assert_eq!(
            config.flood_control.store_timeout(),
            Duration::from_millis(250)
        );
        assert_eq!(config.store.backend, StoreBackend::Redis);
        assert_eq!(config.store.key_prefix, "bot");
        assert_eq!(config.store.pool_max_open, 16);
        assert_eq!(config.sweeper.interval(), Duration::from_millis(500));
        assert_eq!(config.sweeper.reconcile_every, Some(10));
        assert_eq!(
            config.retry_strategy.strategy_type,
            StrategyType::LinearBackoff
        );
        assert_eq!(config.retry_strategy.increment_millis, Some(30));
    }

    #[test]
    fn test_optional_sections_fall_back_to_defaults() {
        let config = Config::from_toml_str(
            r#"
            [flood_control]
            window_seconds = 10
            max_requests = 3

            [store]
            backend = "Memory"
            "#,
        )
        .unwrap();
        assert!(config.flood_control.sweep_on_check);
        assert_eq!(config.flood_control.store_timeout_millis, 500);
        assert!(config.sweeper.enabled);
        assert_eq!(config.sweeper.interval_millis, 1000);
        assert_eq!(config.retry_strategy.max_attempts, 3);
        assert_eq!(config.store.key_prefix, "floodcontrol");
    }

    #[test]
    fn test_rejects_zero_window_and_limit() {
        for (window, limit) in [(0, 3), (10, 0)] {
            let contents = format!(
                "[flood_control]\nwindow_seconds = {}\nmax_requests = {}\n\n[store]\nbackend = \"Memory\"\n",
                window, limit
            );
            assert!(matches!(
                Config::from_toml_str(&contents),
                Err(ConfigError::Invalid(_))
            ));
        }
    }

    #[test]
    fn test_redis_backend_requires_url() {
        let err = Config::from_toml_str(
            r#"
            [flood_control]
            window_seconds = 10
            max_requests = 3

            [store]
            backend = "Redis"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_unknown_backend_is_a_parse_error() {
        let err = Config::from_toml_str(
            r#"
            [flood_control]
            window_seconds = 10
            max_requests = 3

            [store]
            backend = "Etcd"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_missing_file_is_an_io_error() {
        assert!(matches!(
            Config::load("/nonexistent/flood-control/Config.toml"),
            Err(ConfigError::Io(_))
        ));
    }
}
