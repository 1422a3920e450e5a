//! Rate limiter engine.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use super::key::RequestInfo;
use super::rules::{Algorithm, RateLimiterConfig};
use super::window;
use crate::clock::Clock;
use crate::error::Result;
use crate::store::{CounterStore, StoreError};

/// Default prefix of every key a limiter writes to the store.
pub const DEFAULT_KEY_PREFIX: &str = "floodgate";

/// Outcome of one rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Requests admitted per window
    pub limit: u64,
    /// Requests left in the current window after this one
    pub remaining: u64,
    /// When the caller can expect quota to free up
    pub reset_after: Duration,
    /// The store could not be consulted and the request was let through
    pub fail_open: bool,
}

impl RateLimitDecision {
    fn fail_open(limit: u64) -> Self {
        Self {
            allowed: true,
            limit,
            remaining: limit,
            reset_after: Duration::ZERO,
            fail_open: true,
        }
    }
}

/// Admits or denies requests for a key under one quota.
///
/// The limiter holds no counting state of its own; everything lives in the
/// counter store, so any number of instances sharing a store enforce one
/// quota between them.
pub struct RateLimiter {
    name: String,
    config: RateLimiterConfig,
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    key_prefix: String,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("key_prefix", &self.key_prefix)
            .finish_non_exhaustive()
    }
}

impl RateLimiter {
    /// Create a limiter counting in `store`.
    ///
    /// Fails if the configuration is invalid.
    pub fn new(
        name: impl Into<String>,
        config: RateLimiterConfig,
        store: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            name: name.into(),
            config,
            store,
            clock,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
        })
    }

    /// Namespace store keys under `prefix` instead of the default.
    #[must_use]
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    /// Store key holding the state for `key`.
    pub fn store_key(&self, key: &str) -> String {
        format!("{}:{}:{}", self.key_prefix, self.name, key)
    }

    /// Quota key this limiter derives from a request.
    pub fn key_for(&self, request: &RequestInfo) -> String {
        (self.config.key_generator)(request)
    }

    /// Check and count one request against the quota for `key`.
    ///
    /// Never fails: if the store cannot be reached the request is admitted
    /// and the decision is marked `fail_open`.
    pub async fn check(&self, key: &str) -> RateLimitDecision {
        let store_key = self.store_key(key);

        trace!(
            limiter = %self.name,
            key = %key,
            algorithm = %self.config.algorithm,
            "Checking rate limit"
        );

        let result = match self.config.algorithm {
            Algorithm::FixedWindow => self.check_fixed_window(&store_key).await,
            Algorithm::SlidingWindow => self.check_sliding_window(&store_key).await,
        };

        let decision = match result {
            Ok(decision) => decision,
            Err(e) => {
                warn!(
                    limiter = %self.name,
                    key = %key,
                    error = %e,
                    "Counter store unavailable, allowing request"
                );
                RateLimitDecision::fail_open(self.config.max_requests)
            }
        };

        if !decision.allowed {
            debug!(
                limiter = %self.name,
                key = %key,
                limit = decision.limit,
                reset_after_ms = decision.reset_after.as_millis() as u64,
                "Rate limit exceeded"
            );
            if let Some(hook) = &self.config.on_rejected {
                hook(&self.name, key, &decision);
            }
        }

        decision
    }

    /// Whether one more request for `key` is admitted.
    pub async fn is_allowed(&self, key: &str) -> bool {
        self.check(key).await.allowed
    }

    /// Check a request under the key its configured generator derives.
    pub async fn check_request(&self, request: &RequestInfo) -> RateLimitDecision {
        let key = self.key_for(request);
        self.check(&key).await
    }

    async fn check_fixed_window(
        &self,
        store_key: &str,
    ) -> std::result::Result<RateLimitDecision, StoreError> {
        let limit = self.config.max_requests;
        let bucket = window::fixed_bucket(self.clock.now(), self.config.window);
        let bucket_key = format!("{}:{}", store_key, bucket.index);

        let count = self.store.incr(&bucket_key).await?;
        if count == 1 {
            self.store.expire(&bucket_key, self.config.window).await?;
        }

        let count = u64::try_from(count).unwrap_or(0);
        Ok(RateLimitDecision {
            allowed: count <= limit,
            limit,
            remaining: limit.saturating_sub(count),
            reset_after: bucket.reset_after,
            fail_open: false,
        })
    }

    async fn check_sliding_window(
        &self,
        store_key: &str,
    ) -> std::result::Result<RateLimitDecision, StoreError> {
        let limit = self.config.max_requests;
        let length = self.config.window;
        let now = self.clock.now();

        self.store
            .zrem_range_by_score(
                store_key,
                f64::NEG_INFINITY,
                window::stale_score_bound(now, length),
            )
            .await?;

        let count = self.store.zcard(store_key).await?;
        if count >= limit {
            return Ok(RateLimitDecision {
                allowed: false,
                limit,
                remaining: 0,
                reset_after: length,
                fail_open: false,
            });
        }

        let member = format!("{}-{}", now.as_millis(), Uuid::new_v4());
        self.store.zadd(store_key, window::score(now), &member).await?;
        self.store.expire(store_key, length).await?;

        Ok(RateLimitDecision {
            allowed: true,
            limit,
            remaining: limit - count - 1,
            reset_after: length,
            fail_open: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, SystemClock};
    use crate::store::{MemoryStore, MockCounterStore};
    use parking_lot::Mutex;

    fn limiter(
        algorithm: Algorithm,
        window: Duration,
        max: u64,
    ) -> (RateLimiter, ManualClock, Arc<MemoryStore>) {
        let clock = ManualClock::new(Duration::from_secs(1_700_000_000));
        let store = Arc::new(MemoryStore::with_clock(Arc::new(clock.clone())));
        let config = RateLimiterConfig::new(algorithm, window, max);
        let limiter =
            RateLimiter::new("test", config, store.clone(), Arc::new(clock.clone())).unwrap();
        (limiter, clock, store)
    }

    fn unavailable() -> StoreError {
        StoreError::Unavailable("connection refused".to_string())
    }

    #[tokio::test]
    async fn test_fixed_window_admits_exactly_max_per_bucket() {
        let (limiter, clock, _) = limiter(Algorithm::FixedWindow, Duration::from_secs(10), 5);

        // Spread arrivals unevenly across the bucket
        for offset_ms in [0, 10, 20, 4_000, 9_000] {
            clock.set(Duration::from_millis(1_700_000_000_000 + offset_ms));
            assert!(limiter.is_allowed("client").await, "offset {}", offset_ms);
        }
        clock.set(Duration::from_millis(1_700_000_009_999));
        let denied = limiter.check("client").await;
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        assert_eq!(denied.reset_after, Duration::from_millis(1));

        // Next bucket starts fresh
        clock.set(Duration::from_millis(1_700_000_010_000));
        let decision = limiter.check("client").await;
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 4);
    }

    #[tokio::test]
    async fn test_fixed_window_sets_ttl_on_new_bucket() {
        let (limiter, clock, store) = limiter(Algorithm::FixedWindow, Duration::from_secs(60), 5);
        limiter.check("client").await;

        let bucket = window::fixed_bucket(clock.now(), Duration::from_secs(60));
        let bucket_key = format!("floodgate:test:client:{}", bucket.index);
        assert_eq!(store.ttl(&bucket_key), Some(Duration::from_secs(60)));
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let (limiter, _, _) = limiter(Algorithm::FixedWindow, Duration::from_secs(60), 1);
        assert!(limiter.is_allowed("a").await);
        assert!(!limiter.is_allowed("a").await);
        assert!(limiter.is_allowed("b").await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_checks_never_exceed_limit() {
        let (limiter, _, _) = limiter(Algorithm::FixedWindow, Duration::from_secs(60), 10);
        let limiter = Arc::new(limiter);

        let handles = (0..50).map(|_| {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.is_allowed("shared").await })
        });
        let admitted = futures::future::join_all(handles)
            .await
            .into_iter()
            .filter(|result| *result.as_ref().unwrap())
            .count();
        assert_eq!(admitted, 10);
    }

    #[tokio::test]
    async fn test_sliding_window_prunes_stale_entries() {
        let (limiter, clock, store) = limiter(Algorithm::SlidingWindow, Duration::from_secs(1), 2);

        assert!(limiter.is_allowed("k").await);
        clock.advance(Duration::from_millis(10));
        assert!(limiter.is_allowed("k").await);
        clock.advance(Duration::from_millis(10));
        for _ in 0..5 {
            assert!(!limiter.is_allowed("k").await);
        }
        // Denials are not logged
        assert_eq!(store.zcard("floodgate:test:k").await.unwrap(), 2);

        clock.advance(Duration::from_millis(1_100));
        let decision = limiter.check("k").await;
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 1);
        assert_eq!(store.zcard("floodgate:test:k").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_sliding_window_has_no_boundary_burst() {
        let (limiter, clock, _) = limiter(Algorithm::SlidingWindow, Duration::from_secs(10), 3);
        clock.set(Duration::from_millis(1_700_000_009_000));
        for _ in 0..3 {
            assert!(limiter.is_allowed("k").await);
        }

        // A fixed window would reset here; the sliding window still counts
        // the three requests from one second ago.
        clock.set(Duration::from_millis(1_700_000_010_000));
        assert!(!limiter.is_allowed("k").await);

        clock.set(Duration::from_millis(1_700_000_019_001));
        assert!(limiter.is_allowed("k").await);
    }

    #[tokio::test]
    async fn test_sliding_window_with_real_time() {
        let store = Arc::new(MemoryStore::new());
        let config = RateLimiterConfig::new(Algorithm::SlidingWindow, Duration::from_secs(1), 2);
        let limiter = RateLimiter::new("wall", config, store, Arc::new(SystemClock::new())).unwrap();

        assert!(limiter.is_allowed("k").await);
        assert!(limiter.is_allowed("k").await);
        assert!(!limiter.is_allowed("k").await);

        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert!(limiter.is_allowed("k").await);
    }

    #[tokio::test]
    async fn test_fails_open_when_increment_fails() {
        let mut store = MockCounterStore::new();
        store.expect_incr().times(1).returning(|_| Err(unavailable()));
        store.expect_expire().never();

        let config = RateLimiterConfig::new(Algorithm::FixedWindow, Duration::from_secs(1), 1);
        let limiter = RateLimiter::new("global", config, Arc::new(store), Arc::new(SystemClock)).unwrap();

        let decision = limiter.check("client").await;
        assert!(decision.allowed);
        assert!(decision.fail_open);
    }

    #[tokio::test]
    async fn test_fails_open_when_sliding_count_fails() {
        let mut store = MockCounterStore::new();
        store.expect_zrem_range_by_score().returning(|_, _, _| Ok(0));
        store.expect_zcard().returning(|_| Err(unavailable()));
        store.expect_zadd().never();

        let config = RateLimiterConfig::new(Algorithm::SlidingWindow, Duration::from_secs(1), 1);
        let limiter = RateLimiter::new("global", config, Arc::new(store), Arc::new(SystemClock)).unwrap();

        assert!(limiter.is_allowed("client").await);
    }

    #[tokio::test]
    async fn test_rejection_hook_called_on_deny_only() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let clock = ManualClock::new(Duration::from_secs(1_000));
        let store = Arc::new(MemoryStore::with_clock(Arc::new(clock.clone())));
        let config = RateLimiterConfig::new(Algorithm::FixedWindow, Duration::from_secs(60), 1)
            .with_on_rejected(move |name, key, decision| {
                sink.lock().push((name.to_string(), key.to_string(), decision.allowed));
            });
        let limiter = RateLimiter::new("api", config, store, Arc::new(clock)).unwrap();

        limiter.check("k").await;
        limiter.check("k").await;

        assert_eq!(
            *seen.lock(),
            vec![("api".to_string(), "k".to_string(), false)]
        );
    }

    #[tokio::test]
    async fn test_check_request_uses_key_generator() {
        let clock = ManualClock::new(Duration::from_secs(1_000));
        let store = Arc::new(MemoryStore::with_clock(Arc::new(clock.clone())));
        let config = RateLimiterConfig::new(Algorithm::FixedWindow, Duration::from_secs(60), 1)
            .with_key_generator(|request| format!("tenant:{}", request.path));
        let limiter = RateLimiter::new("custom", config, store, Arc::new(clock)).unwrap();

        let request = RequestInfo::new("GET", "/a");
        assert_eq!(limiter.key_for(&request), "tenant:/a");
        assert!(limiter.check_request(&request).await.allowed);
        assert!(!limiter.check_request(&request).await.allowed);
        assert!(limiter.check_request(&RequestInfo::new("GET", "/b")).await.allowed);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = RateLimiterConfig::new(Algorithm::FixedWindow, Duration::ZERO, 10);
        let result = RateLimiter::new("bad", config, Arc::new(MemoryStore::new()), Arc::new(SystemClock));
        assert!(result.is_err());
    }
}
