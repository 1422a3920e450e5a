//! Fixed-window and sliding-window rate limiting over a counter store.

mod factory;
mod key;
mod limiter;
mod rules;
mod window;

pub use factory::{Denial, RateLimiterFactory, API_LIMITER, GLOBAL_LIMITER, USER_LIMITER};
pub use key::{KeyGenerator, KeyStrategy, RequestInfo};
pub use limiter::{RateLimitDecision, RateLimiter, DEFAULT_KEY_PREFIX};
pub use rules::{Algorithm, LimiterSettings, RateLimiterConfig, RejectHook};
