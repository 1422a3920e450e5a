//! Admission control: rate limiters first, then the circuit breaker.

mod layer;

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::breaker::{BreakerRegistry, CircuitBreaker};
use crate::error::FloodgateError;
use crate::ratelimit::{RateLimitDecision, RateLimiterFactory, RequestInfo};

pub(crate) use layer::retry_after_secs;
pub use layer::{AdmissionLayer, AdmissionService, AuthenticatedUser, RejectionHandler};

/// Why a request was not admitted.
#[derive(Debug)]
pub enum Rejection {
    /// A rate limiter denied the request; the breaker was not consulted
    RateLimited {
        limiter: String,
        decision: RateLimitDecision,
    },
    /// The breaker is open, or half-open with no half-open slots left
    CircuitOpen {
        breaker: String,
        error: FloodgateError,
    },
}

impl Rejection {
    /// How long the caller should wait before retrying, when known.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Rejection::RateLimited { decision, .. } => Some(decision.reset_after),
            Rejection::CircuitOpen { .. } => None,
        }
    }

    pub fn into_error(self) -> FloodgateError {
        match self {
            Rejection::RateLimited { limiter, decision } => FloodgateError::RateLimited {
                limiter,
                retry_after: decision.reset_after,
            },
            Rejection::CircuitOpen { error, .. } => error,
        }
    }
}

/// An admitted request.
///
/// Report how it went with [`record`](Self::record). A permit dropped without
/// a report, for example because the request future was cancelled, counts as
/// a failure so a half-open slot is never held forever.
#[derive(Debug)]
#[must_use = "report the outcome with Permit::record"]
pub struct Permit {
    breaker: Arc<CircuitBreaker>,
    generation: u64,
    settled: bool,
}

impl Permit {
    pub fn breaker(&self) -> &str {
        self.breaker.name()
    }

    /// Breaker generation the request was admitted under.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn record(mut self, success: bool) {
        self.settled = true;
        self.breaker.after_request(self.generation, success);
    }

    /// Hand the outcome report to someone else, who passes the returned
    /// generation to [`CircuitBreaker::after_request`].
    pub fn detach(mut self) -> u64 {
        self.settled = true;
        self.generation
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        if !self.settled {
            debug!(
                breaker = %self.breaker.name(),
                generation = self.generation,
                "Permit dropped without an outcome, recording failure"
            );
            self.breaker.after_request(self.generation, false);
        }
    }
}

/// The admission gate shared by the middleware and the sidecar API.
#[derive(Debug, Clone)]
pub struct Admission {
    limiters: Arc<RateLimiterFactory>,
    breakers: Arc<BreakerRegistry>,
}

impl Admission {
    pub fn new(limiters: Arc<RateLimiterFactory>, breakers: Arc<BreakerRegistry>) -> Self {
        Self { limiters, breakers }
    }

    pub fn limiters(&self) -> &Arc<RateLimiterFactory> {
        &self.limiters
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    /// Decide whether `request` may proceed to the resource guarded by the
    /// breaker called `breaker_name`.
    ///
    /// Requests denied by a limiter never reach the breaker, so they count
    /// neither as attempts nor as failures.
    pub async fn admit(
        &self,
        request: &RequestInfo,
        breaker_name: &str,
    ) -> std::result::Result<Permit, Rejection> {
        if let Err(denial) = self.limiters.check_all(request).await {
            info!(
                limiter = %denial.limiter,
                key = %denial.key,
                path = %request.path,
                "Request rate limited"
            );
            return Err(Rejection::RateLimited {
                limiter: denial.limiter,
                decision: denial.decision,
            });
        }

        let breaker = self.breakers.get(breaker_name);
        match breaker.before_request() {
            Ok(generation) => {
                debug!(breaker = %breaker_name, generation, "Request admitted");
                Ok(Permit {
                    breaker,
                    generation,
                    settled: false,
                })
            }
            Err(error) => {
                debug!(breaker = %breaker_name, error = %error, "Request rejected by circuit breaker");
                Err(Rejection::CircuitOpen {
                    breaker: breaker_name.to_string(),
                    error,
                })
            }
        }
    }
}
