//! Composition of named rate limiters over shared stores.
//!
//! The factory owns the stores: one optional shared store that every service
//! instance talks to, and one in-process store for limiters that are not
//! marked distributed.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use super::key::RequestInfo;
use super::limiter::{RateLimitDecision, RateLimiter, DEFAULT_KEY_PREFIX};
use super::rules::RateLimiterConfig;
use crate::clock::{self, Clock};
use crate::config::RateLimitingSettings;
use crate::error::{FloodgateError, Result};
use crate::store::{CounterStore, MemoryStore};

/// Name of the limiter applied to all traffic.
pub const GLOBAL_LIMITER: &str = "global";
/// Name of the per-user limiter.
pub const USER_LIMITER: &str = "user";
/// Name of the per-route limiter.
pub const API_LIMITER: &str = "api";

/// A request denied by one of the composed limiters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Denial {
    pub limiter: String,
    pub key: String,
    pub decision: RateLimitDecision,
}

/// Limiters by name, plus their creation order, which is also the
/// evaluation order for `check_all`. Kept under one lock.
#[derive(Default)]
struct Limiters {
    by_name: HashMap<String, Arc<RateLimiter>>,
    ordered: Vec<Arc<RateLimiter>>,
}

/// Named rate limiters sharing one store client.
pub struct RateLimiterFactory {
    shared_store: Option<Arc<dyn CounterStore>>,
    local_store: Arc<MemoryStore>,
    clock: Arc<dyn Clock>,
    key_prefix: String,
    limiters: RwLock<Limiters>,
}

impl RateLimiterFactory {
    /// Create an empty factory on the system clock.
    pub fn new(shared_store: Option<Arc<dyn CounterStore>>) -> Self {
        Self::with_clock(shared_store, clock::system())
    }

    /// Create an empty factory reading time from `clock`.
    pub fn with_clock(shared_store: Option<Arc<dyn CounterStore>>, clock: Arc<dyn Clock>) -> Self {
        Self {
            shared_store,
            local_store: Arc::new(MemoryStore::with_clock(clock.clone())),
            clock,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            limiters: RwLock::new(Limiters::default()),
        }
    }

    /// Namespace every limiter's store keys under `prefix`.
    #[must_use]
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Build the global, per-user and per-route limiters from settings.
    pub fn from_settings(
        settings: &RateLimitingSettings,
        shared_store: Option<Arc<dyn CounterStore>>,
        clock: Arc<dyn Clock>,
        key_prefix: &str,
    ) -> Result<Self> {
        let factory = Self::with_clock(shared_store, clock).with_key_prefix(key_prefix);
        if !settings.enabled {
            info!("Rate limiting disabled");
            return Ok(factory);
        }

        let configured = [
            (GLOBAL_LIMITER, &settings.global),
            (USER_LIMITER, &settings.user),
            (API_LIMITER, &settings.api),
        ];
        for (name, limiter_settings) in configured {
            if let Some(limiter_settings) = limiter_settings {
                let config = limiter_settings.to_config()?;
                factory.get_or_create(name, config)?;
                info!(
                    limiter = name,
                    algorithm = %limiter_settings.algorithm,
                    window_secs = limiter_settings.window_secs,
                    max_requests = limiter_settings.max_requests,
                    distributed = limiter_settings.distributed,
                    "Rate limiter configured"
                );
            }
        }

        Ok(factory)
    }

    /// The in-process store used by non-distributed limiters.
    pub fn local_store(&self) -> &Arc<MemoryStore> {
        &self.local_store
    }

    /// Get the limiter called `name`, creating it from `config` if it does
    /// not exist yet. An existing limiter keeps its original configuration.
    ///
    /// Fails if the configuration is invalid, or if it is distributed and no
    /// shared store was supplied.
    pub fn get_or_create(&self, name: &str, config: RateLimiterConfig) -> Result<Arc<RateLimiter>> {
        if let Some(limiter) = self.limiters.read().by_name.get(name) {
            return Ok(limiter.clone());
        }

        let mut limiters = self.limiters.write();
        if let Some(limiter) = limiters.by_name.get(name) {
            return Ok(limiter.clone());
        }

        let store = self.store_for(name, &config)?;
        let limiter = Arc::new(
            RateLimiter::new(name, config, store, self.clock.clone())?
                .with_key_prefix(self.key_prefix.clone()),
        );
        debug!(limiter = %name, config = ?limiter.config(), "Creating rate limiter");

        limiters.by_name.insert(name.to_string(), limiter.clone());
        limiters.ordered.push(limiter.clone());
        Ok(limiter)
    }

    fn store_for(&self, name: &str, config: &RateLimiterConfig) -> Result<Arc<dyn CounterStore>> {
        if let Some(store) = &config.store {
            return Ok(store.clone());
        }
        if config.distributed {
            return self.shared_store.clone().ok_or_else(|| {
                FloodgateError::Config(format!(
                    "rate limiter '{}' is distributed but no shared store is configured",
                    name
                ))
            });
        }
        Ok(self.local_store.clone())
    }

    pub fn get(&self, name: &str) -> Option<Arc<RateLimiter>> {
        self.limiters.read().by_name.get(name).cloned()
    }

    /// Limiter names in evaluation order.
    pub fn names(&self) -> Vec<String> {
        self.limiters
            .read()
            .ordered
            .iter()
            .map(|limiter| limiter.name().to_string())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.limiters.read().by_name.is_empty()
    }

    /// Check a request against every limiter in order, stopping at the first
    /// denial.
    pub async fn check_all(&self, request: &RequestInfo) -> std::result::Result<(), Denial> {
        let limiters = self.limiters.read().ordered.clone();

        for limiter in limiters {
            let key = limiter.key_for(request);
            let decision = limiter.check(&key).await;
            if !decision.allowed {
                return Err(Denial {
                    limiter: limiter.name().to_string(),
                    key,
                    decision,
                });
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for RateLimiterFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiterFactory")
            .field("limiters", &self.names())
            .field("shared_store", &self.shared_store.is_some())
            .field("key_prefix", &self.key_prefix)
            .finish()
    }
}
