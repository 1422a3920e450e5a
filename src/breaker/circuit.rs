//! Circuit breaker state machine.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::state::{BreakerState, Counts};
use crate::clock::{self, Clock};
use crate::error::{FloodgateError, Result};

/// Default number of requests a closed breaker must see before it may trip.
pub const DEFAULT_MAX_REQUESTS: u32 = 10;
/// Default failure ratio that trips a closed breaker.
pub const DEFAULT_ERROR_THRESHOLD: f64 = 0.5;
/// Default time a breaker stays open.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
/// Default number of half-open trial requests.
pub const DEFAULT_MAX_HALF_OPEN_REQUESTS: u32 = 3;

/// Called with the breaker name whenever it opens.
pub type OpenHook = Arc<dyn Fn(&str) + Send + Sync>;
/// Called with the breaker name and the old and new state on every transition.
pub type StateChangeHook = Arc<dyn Fn(&str, BreakerState, BreakerState) + Send + Sync>;

/// Configuration for a circuit breaker.
#[derive(Clone)]
pub struct BreakerConfig {
    /// Requests a closed breaker must admit before the failure ratio is judged
    pub max_requests: u32,
    /// Failure ratio (0, 1] at or above which a closed breaker opens
    pub error_threshold: f64,
    /// How long the breaker stays open before letting trial requests through
    pub timeout: Duration,
    /// Requests admitted while half-open, and successes needed to close again
    pub max_half_open_requests: u32,
    /// A disabled breaker admits everything and ignores outcomes
    pub enabled: bool,
    pub on_open: Option<OpenHook>,
    pub on_state_change: Option<StateChangeHook>,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            max_requests: DEFAULT_MAX_REQUESTS,
            error_threshold: DEFAULT_ERROR_THRESHOLD,
            timeout: DEFAULT_TIMEOUT,
            max_half_open_requests: DEFAULT_MAX_HALF_OPEN_REQUESTS,
            enabled: true,
            on_open: None,
            on_state_change: None,
        }
    }
}

impl std::fmt::Debug for BreakerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BreakerConfig")
            .field("max_requests", &self.max_requests)
            .field("error_threshold", &self.error_threshold)
            .field("timeout", &self.timeout)
            .field("max_half_open_requests", &self.max_half_open_requests)
            .field("enabled", &self.enabled)
            .field("on_open", &self.on_open.is_some())
            .field("on_state_change", &self.on_state_change.is_some())
            .finish()
    }
}

impl BreakerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_max_requests(mut self, max_requests: u32) -> Self {
        self.max_requests = max_requests;
        self
    }

    #[must_use]
    pub fn with_error_threshold(mut self, threshold: f64) -> Self {
        self.error_threshold = threshold;
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_max_half_open_requests(mut self, requests: u32) -> Self {
        self.max_half_open_requests = requests;
        self
    }

    #[must_use]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    #[must_use]
    pub fn with_on_open(mut self, hook: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_open = Some(Arc::new(hook));
        self
    }

    #[must_use]
    pub fn with_on_state_change(
        mut self,
        hook: impl Fn(&str, BreakerState, BreakerState) + Send + Sync + 'static,
    ) -> Self {
        self.on_state_change = Some(Arc::new(hook));
        self
    }

    /// Reject settings the state machine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if !(self.error_threshold > 0.0 && self.error_threshold <= 1.0) {
            return Err(FloodgateError::Config(format!(
                "error_threshold must be in (0, 1], got {}",
                self.error_threshold
            )));
        }
        if self.max_requests == 0 {
            return Err(FloodgateError::Config(
                "max_requests must be at least 1".to_string(),
            ));
        }
        if self.max_half_open_requests == 0 {
            return Err(FloodgateError::Config(
                "max_half_open_requests must be at least 1".to_string(),
            ));
        }
        if self.timeout.is_zero() {
            return Err(FloodgateError::Config(
                "timeout must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Error returned by [`CircuitBreaker::call`].
#[derive(Debug, Error)]
pub enum CallError<E> {
    /// The breaker refused the call; the operation never ran
    #[error(transparent)]
    Rejected(FloodgateError),
    /// The operation ran and failed
    #[error("{0}")]
    Inner(E),
}

/// Point-in-time view of a breaker, for status endpoints and logs.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: BreakerState,
    pub generation: u64,
    pub counts: Counts,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    generation: u64,
    counts: Counts,
    /// When an open breaker may let trial requests through; `None` unless open.
    expiry: Option<Duration>,
}

#[derive(Debug, Clone, Copy)]
struct Transition {
    from: BreakerState,
    to: BreakerState,
    generation: u64,
}

/// Per-resource circuit breaker.
///
/// Every transition bumps the generation and clears the counts. Outcomes are
/// reported against the generation handed out by [`before_request`], and an
/// outcome from an older generation is dropped.
///
/// [`before_request`]: CircuitBreaker::before_request
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("inner", &*self.inner.lock())
            .finish()
    }
}

impl CircuitBreaker {
    /// Create a closed breaker on the system clock.
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self::with_clock(name, config, clock::system())
    }

    /// Create a closed breaker reading time from `clock`.
    pub fn with_clock(name: impl Into<String>, config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                generation: 0,
                counts: Counts::default(),
                expiry: None,
            }),
            clock,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Ask to attempt one request.
    ///
    /// On admission the request is counted and the current generation is
    /// returned; pass it back to [`after_request`](Self::after_request).
    pub fn before_request(&self) -> Result<u64> {
        let (result, transition) = {
            let mut inner = self.inner.lock();
            if !self.config.enabled {
                return Ok(inner.generation);
            }

            let transition = self.refresh(&mut inner);
            let result = match inner.state {
                BreakerState::Open => Err(FloodgateError::BreakerOpen {
                    name: self.name.clone(),
                }),
                BreakerState::HalfOpen
                    if inner.counts.requests >= self.config.max_half_open_requests =>
                {
                    Err(FloodgateError::HalfOpenLimit {
                        name: self.name.clone(),
                    })
                }
                _ => {
                    inner.counts.on_request();
                    Ok(inner.generation)
                }
            };
            (result, transition)
        };

        self.notify(transition);
        result
    }

    /// Record the outcome of a request admitted under `generation`.
    pub fn after_request(&self, generation: u64, success: bool) {
        if !self.config.enabled {
            return;
        }

        let (expired, transition) = {
            let mut inner = self.inner.lock();
            let expired = self.refresh(&mut inner);

            if generation != inner.generation {
                debug!(
                    breaker = %self.name,
                    generation,
                    current = inner.generation,
                    "Discarding outcome from a previous generation"
                );
                (expired, None)
            } else if success {
                (expired, self.on_success(&mut inner))
            } else {
                (expired, self.on_failure(&mut inner))
            }
        };

        self.notify(expired);
        self.notify(transition);
    }

    /// Run `op` under the breaker, counting `Err` as a failure.
    pub async fn call<F, Fut, T, E>(&self, op: F) -> std::result::Result<T, CallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        let generation = self.before_request().map_err(CallError::Rejected)?;
        let result = op().await;
        self.after_request(generation, result.is_ok());
        result.map_err(CallError::Inner)
    }

    /// Current state.
    ///
    /// Applies the lazy open to half-open transition, so it takes the breaker
    /// lock exclusively like any other mutation.
    pub fn state(&self) -> BreakerState {
        let (state, transition) = {
            let mut inner = self.inner.lock();
            let transition = self.refresh(&mut inner);
            (inner.state, transition)
        };
        self.notify(transition);
        state
    }

    pub fn counts(&self) -> Counts {
        self.snapshot().counts
    }

    pub fn generation(&self) -> u64 {
        self.snapshot().generation
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let (snapshot, transition) = {
            let mut inner = self.inner.lock();
            let transition = self.refresh(&mut inner);
            (
                BreakerSnapshot {
                    name: self.name.clone(),
                    state: inner.state,
                    generation: inner.generation,
                    counts: inner.counts,
                },
                transition,
            )
        };
        self.notify(transition);
        snapshot
    }

    /// Force the breaker closed.
    pub fn reset(&self) {
        let transition = {
            let mut inner = self.inner.lock();
            self.transition(&mut inner, BreakerState::Closed)
        };
        self.notify(transition);
    }

    fn on_success(&self, inner: &mut Inner) -> Option<Transition> {
        match inner.state {
            BreakerState::Closed => {
                inner.counts.on_success();
                None
            }
            BreakerState::HalfOpen => {
                inner.counts.on_success();
                if inner.counts.consecutive_successes >= self.config.max_half_open_requests {
                    self.transition(inner, BreakerState::Closed)
                } else {
                    None
                }
            }
            BreakerState::Open => None,
        }
    }

    fn on_failure(&self, inner: &mut Inner) -> Option<Transition> {
        match inner.state {
            BreakerState::Closed => {
                inner.counts.on_failure();
                if inner.counts.requests >= self.config.max_requests
                    && inner.counts.failure_ratio() >= self.config.error_threshold
                {
                    self.transition(inner, BreakerState::Open)
                } else {
                    None
                }
            }
            BreakerState::HalfOpen => {
                inner.counts.on_failure();
                self.transition(inner, BreakerState::Open)
            }
            BreakerState::Open => None,
        }
    }

    /// Move an open breaker to half-open once its timeout has passed.
    fn refresh(&self, inner: &mut Inner) -> Option<Transition> {
        match (inner.state, inner.expiry) {
            (BreakerState::Open, Some(expiry)) if self.clock.now() >= expiry => {
                self.transition(inner, BreakerState::HalfOpen)
            }
            _ => None,
        }
    }

    fn transition(&self, inner: &mut Inner, to: BreakerState) -> Option<Transition> {
        if inner.state == to {
            return None;
        }

        let from = inner.state;
        inner.state = to;
        inner.generation += 1;
        inner.counts.clear();
        inner.expiry = match to {
            BreakerState::Open => Some(self.clock.now() + self.config.timeout),
            BreakerState::Closed | BreakerState::HalfOpen => None,
        };

        Some(Transition {
            from,
            to,
            generation: inner.generation,
        })
    }

    /// Log a transition and run the hooks. Called with the lock released.
    fn notify(&self, transition: Option<Transition>) {
        let Some(Transition {
            from,
            to,
            generation,
        }) = transition
        else {
            return;
        };

        if to == BreakerState::Open {
            warn!(
                breaker = %self.name,
                from = %from,
                to = %to,
                generation,
                timeout_ms = self.config.timeout.as_millis() as u64,
                "Circuit breaker opened"
            );
            if let Some(hook) = &self.config.on_open {
                hook(&self.name);
            }
        } else {
            info!(
                breaker = %self.name,
                from = %from,
                to = %to,
                generation,
                "Circuit breaker state changed"
            );
        }

        if let Some(hook) = &self.config.on_state_change {
            hook(&self.name, from, to);
        }
    }
}
