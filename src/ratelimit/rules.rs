//! Rate limiter configuration.
//!
//! [`LimiterSettings`] is the serializable form read from the configuration
//! file; [`RateLimiterConfig`] is the validated runtime form, which also
//! carries the key generator, an optional store and the rejection hook.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::key::{KeyGenerator, KeyStrategy, RequestInfo};
use super::limiter::RateLimitDecision;
use crate::error::{FloodgateError, Result};
use crate::store::CounterStore;

/// Counting strategy of a limiter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    /// Count per discrete bucket; up to twice the quota can pass around a
    /// bucket boundary
    #[default]
    FixedWindow,
    /// Count over the window ending now, using a log of admitted requests
    SlidingWindow,
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Algorithm::FixedWindow => write!(f, "fixed_window"),
            Algorithm::SlidingWindow => write!(f, "sliding_window"),
        }
    }
}

impl FromStr for Algorithm {
    type Err = FloodgateError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "fixed_window" => Ok(Algorithm::FixedWindow),
            "sliding_window" => Ok(Algorithm::SlidingWindow),
            other => Err(FloodgateError::Config(format!(
                "unknown rate limit algorithm '{}'",
                other
            ))),
        }
    }
}

/// Called with the limiter name, the key and the decision for every denied
/// request.
pub type RejectHook = Arc<dyn Fn(&str, &str, &RateLimitDecision) + Send + Sync>;

/// Runtime configuration of one rate limiter.
#[derive(Clone)]
pub struct RateLimiterConfig {
    pub key_generator: KeyGenerator,
    pub algorithm: Algorithm,
    pub window: Duration,
    /// Requests admitted per window
    pub max_requests: u64,
    /// Count in the store shared by all instances rather than in process
    pub distributed: bool,
    /// Store to use instead of the one the factory would pick
    pub store: Option<Arc<dyn CounterStore>>,
    pub on_rejected: Option<RejectHook>,
}

impl fmt::Debug for RateLimiterConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiterConfig")
            .field("algorithm", &self.algorithm)
            .field("window", &self.window)
            .field("max_requests", &self.max_requests)
            .field("distributed", &self.distributed)
            .field("store", &self.store.is_some())
            .field("on_rejected", &self.on_rejected.is_some())
            .finish_non_exhaustive()
    }
}

impl RateLimiterConfig {
    /// A limiter admitting `max_requests` per `window`, keyed by client address.
    pub fn new(algorithm: Algorithm, window: Duration, max_requests: u64) -> Self {
        Self {
            key_generator: KeyStrategy::ClientAddr.generator(),
            algorithm,
            window,
            max_requests,
            distributed: false,
            store: None,
            on_rejected: None,
        }
    }

    #[must_use]
    pub fn with_key_strategy(mut self, strategy: KeyStrategy) -> Self {
        self.key_generator = strategy.generator();
        self
    }

    #[must_use]
    pub fn with_key_generator(
        mut self,
        generator: impl Fn(&RequestInfo) -> String + Send + Sync + 'static,
    ) -> Self {
        self.key_generator = Arc::new(generator);
        self
    }

    #[must_use]
    pub fn with_distributed(mut self, distributed: bool) -> Self {
        self.distributed = distributed;
        self
    }

    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn CounterStore>) -> Self {
        self.store = Some(store);
        self
    }

    #[must_use]
    pub fn with_on_rejected(
        mut self,
        hook: impl Fn(&str, &str, &RateLimitDecision) + Send + Sync + 'static,
    ) -> Self {
        self.on_rejected = Some(Arc::new(hook));
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.window.is_zero() {
            return Err(FloodgateError::Config(
                "rate limit window must be positive".to_string(),
            ));
        }
        if self.max_requests == 0 {
            return Err(FloodgateError::Config(
                "rate limit max_requests must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// A limiter as written in the configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimiterSettings {
    #[serde(default)]
    pub algorithm: Algorithm,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    pub max_requests: u64,
    #[serde(default)]
    pub distributed: bool,
    #[serde(default)]
    pub key: KeyStrategy,
}

fn default_window_secs() -> u64 {
    60
}

impl LimiterSettings {
    /// Validate and convert into a runtime configuration.
    pub fn to_config(&self) -> Result<RateLimiterConfig> {
        let config = RateLimiterConfig::new(
            self.algorithm,
            Duration::from_secs(self.window_secs),
            self.max_requests,
        )
        .with_key_strategy(self.key)
        .with_distributed(self.distributed);
        config.validate()?;
        Ok(config)
    }
}
