//! Named, lazily created circuit breakers.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use super::circuit::{BreakerConfig, BreakerSnapshot, CircuitBreaker};
use crate::clock::{self, Clock};
use crate::error::Result;

/// One breaker per logical resource ("global", "auth-api", ...).
///
/// Built once at start-up and shared by `Arc` with whatever needs a breaker.
pub struct BreakerRegistry {
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    /// Template for names without an override
    defaults: BreakerConfig,
    overrides: HashMap<String, BreakerConfig>,
    clock: Arc<dyn Clock>,
}

impl BreakerRegistry {
    /// Create a registry whose breakers use `defaults` unless overridden.
    pub fn new(defaults: BreakerConfig) -> Result<Self> {
        Self::with_clock(defaults, clock::system())
    }

    /// Create a registry whose breakers read time from `clock`.
    pub fn with_clock(defaults: BreakerConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        defaults.validate()?;
        Ok(Self {
            breakers: RwLock::new(HashMap::new()),
            defaults,
            overrides: HashMap::new(),
            clock,
        })
    }

    /// Use `config` for the breaker called `name`.
    pub fn with_override(mut self, name: impl Into<String>, config: BreakerConfig) -> Result<Self> {
        config.validate()?;
        self.overrides.insert(name.into(), config);
        Ok(self)
    }

    /// The configuration a new breaker called `name` would get.
    pub fn config_for(&self, name: &str) -> BreakerConfig {
        self.overrides
            .get(name)
            .cloned()
            .unwrap_or_else(|| self.defaults.clone())
    }

    /// Get the breaker called `name`, creating it from the configured
    /// override or the defaults.
    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.get_existing(name) {
            return breaker;
        }
        self.get_or_create(name, self.config_for(name))
    }

    /// Get the breaker called `name`, creating it with `config` if it does not
    /// exist yet. An existing breaker keeps its original configuration.
    pub fn get_or_create(&self, name: &str, config: BreakerConfig) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().get(name) {
            return breaker.clone();
        }

        let mut breakers = self.breakers.write();
        // Another thread may have created it between the two locks.
        if let Some(breaker) = breakers.get(name) {
            return breaker.clone();
        }

        debug!(breaker = %name, config = ?config, "Creating circuit breaker");
        let breaker = Arc::new(CircuitBreaker::with_clock(name, config, self.clock.clone()));
        breakers.insert(name.to_string(), breaker.clone());
        breaker
    }

    /// Look up a breaker without creating it.
    pub fn get_existing(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.read().get(name).cloned()
    }

    /// Names of all breakers created so far, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.breakers.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Snapshots of all breakers, sorted by name.
    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        // Collect first so no breaker lock is taken under the map lock.
        let breakers: Vec<Arc<CircuitBreaker>> = self.breakers.read().values().cloned().collect();
        let mut snapshots: Vec<BreakerSnapshot> = breakers.iter().map(|b| b.snapshot()).collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }

    pub fn len(&self) -> usize {
        self.breakers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.read().is_empty()
    }
}

impl std::fmt::Debug for BreakerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BreakerRegistry")
            .field("breakers", &self.names())
            .field("defaults", &self.defaults)
            .field("overrides", &self.overrides.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::BreakerState;
    use std::time::Duration;

    #[test]
    fn test_get_or_create_returns_same_instance() {
        let registry = BreakerRegistry::new(BreakerConfig::default()).unwrap();
        let a = registry.get_or_create("auth-api", BreakerConfig::default());
        let b = registry.get_or_create("auth-api", BreakerConfig::default().with_max_requests(1));

        assert!(Arc::ptr_eq(&a, &b));
        // The first configuration wins
        assert_eq!(b.config().max_requests, 10);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_overrides_apply_by_name() {
        let registry = BreakerRegistry::new(BreakerConfig::default())
            .unwrap()
            .with_override("auth-api", BreakerConfig::new().with_max_requests(2))
            .unwrap();

        assert_eq!(registry.get("auth-api").config().max_requests, 2);
        assert_eq!(registry.get("global").config().max_requests, 10);
        assert_eq!(registry.names(), vec!["auth-api".to_string(), "global".to_string()]);
    }

    #[test]
    fn test_invalid_configs_rejected_at_construction() {
        assert!(BreakerRegistry::new(BreakerConfig::new().with_error_threshold(2.0)).is_err());

        let registry = BreakerRegistry::new(BreakerConfig::default()).unwrap();
        assert!(registry
            .with_override("x", BreakerConfig::new().with_timeout(Duration::ZERO))
            .is_err());
    }

    #[test]
    fn test_breakers_are_independent() {
        let registry = BreakerRegistry::new(BreakerConfig::new().with_max_requests(1)).unwrap();
        let a = registry.get("a");
        let generation = a.before_request().unwrap();
        a.after_request(generation, false);

        assert_eq!(a.state(), BreakerState::Open);
        assert_eq!(registry.get("b").state(), BreakerState::Closed);
        let snapshots = registry.snapshots();
        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots[0].state, BreakerState::Open);
    }

    #[test]
    fn test_concurrent_first_use_creates_one_breaker() {
        let registry = Arc::new(BreakerRegistry::new(BreakerConfig::default()).unwrap());
        let handles: Vec<_> = (0..32)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || registry.get("global"))
            })
            .collect();

        let breakers: Vec<Arc<CircuitBreaker>> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(breakers.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert_eq!(registry.len(), 1);
    }
}
