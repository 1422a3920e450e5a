//! Configuration management for Floodgate.
//!
//! Settings are layered: built-in defaults, then an optional YAML file, then
//! `FLOODGATE_*` environment variables (`FLOODGATE_STORE__URL`, ...).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use ::config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::breaker::{BreakerConfig, BreakerRegistry};
use crate::clock::Clock;
use crate::error::{FloodgateError, Result};
use crate::ratelimit::{LimiterSettings, DEFAULT_KEY_PREFIX};

/// Main configuration for the Floodgate service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FloodgateConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerSettings,

    #[serde(default)]
    pub rate_limiting: RateLimitingSettings,
}

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
        }
    }
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Where rate limit counters live.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process store; limits are per instance
    #[default]
    Memory,
    /// Redis, shared by every instance
    Redis,
}

/// Counter store configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis connection URL
    #[serde(default = "default_store_url")]
    pub url: String,

    /// Prefix of every key written to the store
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// How often the in-process store drops expired keys
    #[serde(default = "default_purge_interval")]
    pub purge_interval_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            url: default_store_url(),
            key_prefix: default_key_prefix(),
            purge_interval_secs: default_purge_interval(),
        }
    }
}

fn default_store_url() -> String {
    "redis://127.0.0.1/".to_string()
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

fn default_purge_interval() -> u64 {
    60
}

/// A circuit breaker as written in the configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_breaker_max_requests")]
    pub max_requests: u32,

    #[serde(default = "default_error_threshold")]
    pub error_threshold: f64,

    #[serde(default = "default_breaker_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_max_half_open_requests")]
    pub max_half_open_requests: u32,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_requests: default_breaker_max_requests(),
            error_threshold: default_error_threshold(),
            timeout_secs: default_breaker_timeout(),
            max_half_open_requests: default_max_half_open_requests(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_breaker_max_requests() -> u32 {
    crate::breaker::DEFAULT_MAX_REQUESTS
}

fn default_error_threshold() -> f64 {
    crate::breaker::DEFAULT_ERROR_THRESHOLD
}

fn default_breaker_timeout() -> u64 {
    crate::breaker::DEFAULT_TIMEOUT.as_secs()
}

fn default_max_half_open_requests() -> u32 {
    crate::breaker::DEFAULT_MAX_HALF_OPEN_REQUESTS
}

impl BreakerSettings {
    /// Validate and convert into a runtime configuration.
    pub fn to_config(&self) -> Result<BreakerConfig> {
        let config = BreakerConfig::new()
            .with_enabled(self.enabled)
            .with_max_requests(self.max_requests)
            .with_error_threshold(self.error_threshold)
            .with_timeout(Duration::from_secs(self.timeout_secs))
            .with_max_half_open_requests(self.max_half_open_requests);
        config.validate()?;
        Ok(config)
    }
}

/// Breaker defaults plus per-name overrides.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerSettings {
    #[serde(flatten)]
    pub defaults: BreakerSettings,

    #[serde(default)]
    pub overrides: HashMap<String, BreakerSettings>,
}

impl CircuitBreakerSettings {
    /// Build a registry holding these defaults and overrides.
    pub fn build_registry(&self, clock: std::sync::Arc<dyn Clock>) -> Result<BreakerRegistry> {
        let mut registry = BreakerRegistry::with_clock(self.defaults.to_config()?, clock)?;
        for (name, settings) in &self.overrides {
            registry = registry.with_override(name.clone(), settings.to_config()?)?;
        }
        Ok(registry)
    }
}

/// The composed rate limiters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitingSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Applied to every request
    #[serde(default)]
    pub global: Option<LimiterSettings>,

    /// Applied per authenticated user
    #[serde(default)]
    pub user: Option<LimiterSettings>,

    /// Applied per route
    #[serde(default)]
    pub api: Option<LimiterSettings>,
}

impl Default for RateLimitingSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            global: None,
            user: None,
            api: None,
        }
    }
}

/// `FLOODGATE_*` variables, with `__` between nested keys.
fn environment() -> Environment {
    Environment::with_prefix("FLOODGATE")
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
}

impl FloodgateConfig {
    /// Load configuration from defaults, an optional YAML file and the
    /// environment, in increasing priority.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with(path, environment())
    }

    fn load_with(path: Option<&Path>, environment: Environment) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).format(FileFormat::Yaml).required(true));
        }

        let config: FloodgateConfig = builder
            .add_source(environment)
            .build()
            .and_then(|config| config.try_deserialize::<FloodgateConfig>())
            .map_err(|e| FloodgateError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Parse a YAML document.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: FloodgateConfig =
            serde_yaml::from_str(yaml).map_err(|e| FloodgateError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check every section converts into a runtime configuration.
    pub fn validate(&self) -> Result<()> {
        self.circuit_breaker.defaults.to_config()?;
        for (name, settings) in &self.circuit_breaker.overrides {
            settings
                .to_config()
                .map_err(|e| in_section(&format!("circuit breaker override '{}'", name), e))?;
        }

        let limiters = [
            ("global", &self.rate_limiting.global),
            ("user", &self.rate_limiting.user),
            ("api", &self.rate_limiting.api),
        ];
        for (name, settings) in limiters {
            if let Some(settings) = settings {
                settings
                    .to_config()
                    .map_err(|e| in_section(&format!("rate limiter '{}'", name), e))?;
            }
        }

        if self.store.purge_interval_secs == 0 {
            return Err(FloodgateError::Config(
                "store.purge_interval_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn in_section(section: &str, err: FloodgateError) -> FloodgateError {
    match err {
        FloodgateError::Config(msg) => FloodgateError::Config(format!("{}: {}", section, msg)),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::ratelimit::{Algorithm, KeyStrategy};
    use std::sync::Arc;

    #[test]
    fn test_defaults() {
        let config = FloodgateConfig::default();
        assert_eq!(
            config.server.http_addr,
            "127.0.0.1:8080".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.store.key_prefix, "floodgate");
        assert_eq!(config.circuit_breaker.defaults.max_requests, 10);
        assert_eq!(config.circuit_breaker.defaults.timeout_secs, 30);
        assert!(config.rate_limiting.enabled);
        assert!(config.rate_limiting.global.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_yaml() {
        let yaml = r#"
server:
  http_addr: "0.0.0.0:9000"
logging:
  format: json
store:
  backend: redis
  url: "redis://cache:6379/"
circuit_breaker:
  max_requests: 20
  error_threshold: 0.25
  overrides:
    payments:
      timeout_secs: 5
rate_limiting:
  global:
    max_requests: 1000
    key: global
    distributed: true
  user:
    algorithm: sliding_window
    window_secs: 10
    max_requests: 50
    key: user
"#;
        let config = FloodgateConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.server.http_addr.port(), 9000);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.store.backend, StoreBackend::Redis);
        assert_eq!(config.circuit_breaker.defaults.max_requests, 20);
        assert_eq!(config.circuit_breaker.overrides["payments"].timeout_secs, 5);

        let global = config.rate_limiting.global.as_ref().unwrap();
        assert_eq!(global.key, KeyStrategy::Global);
        assert!(global.distributed);
        let user = config.rate_limiting.user.as_ref().unwrap();
        assert_eq!(user.algorithm, Algorithm::SlidingWindow);
        assert!(config.rate_limiting.api.is_none());
    }

    #[test]
    fn test_invalid_threshold_rejected() {
        let yaml = "circuit_breaker:\n  error_threshold: 1.5\n";
        assert!(matches!(
            FloodgateConfig::from_yaml(yaml),
            Err(FloodgateError::Config(_))
        ));
    }

    #[test]
    fn test_invalid_override_names_the_breaker() {
        let yaml = "circuit_breaker:\n  overrides:\n    search:\n      max_half_open_requests: 0\n";
        let err = FloodgateConfig::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("search"));
    }

    #[test]
    fn test_zero_limit_rejected() {
        let yaml = "rate_limiting:\n  api:\n    max_requests: 0\n";
        let err = FloodgateConfig::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("api"));
    }

    #[test]
    fn test_build_registry_applies_overrides() {
        let mut settings = CircuitBreakerSettings::default();
        settings.overrides.insert(
            "payments".to_string(),
            BreakerSettings {
                timeout_secs: 5,
                ..BreakerSettings::default()
            },
        );
        let clock = Arc::new(ManualClock::new(Duration::from_secs(1_000)));
        let registry = settings.build_registry(clock).unwrap();
        assert_eq!(registry.config_for("payments").timeout, Duration::from_secs(5));
        assert_eq!(registry.config_for("search").timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_load_layers_file_and_environment() {
        let path = std::env::temp_dir().join(format!("floodgate-{}.yaml", uuid::Uuid::new_v4()));
        std::fs::write(
            &path,
            "store:\n  key_prefix: from-file\n  purge_interval_secs: 5\n",
        )
        .unwrap();
        let variables = ::config::Map::from([(
            "FLOODGATE_SERVER__HTTP_ADDR".to_string(),
            "0.0.0.0:7070".to_string(),
        )]);

        let config =
            FloodgateConfig::load_with(Some(&path), environment().source(Some(variables))).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.store.key_prefix, "from-file");
        assert_eq!(config.store.purge_interval_secs, 5);
        assert_eq!(config.server.http_addr.port(), 7070);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_load_missing_file_fails() {
        let path = std::env::temp_dir().join("floodgate-does-not-exist.yaml");
        assert!(matches!(
            FloodgateConfig::load(Some(&path)),
            Err(FloodgateError::Config(_))
        ));
    }
}
