//! Per-resource circuit breakers.

mod circuit;
mod registry;
mod state;

pub use circuit::{
    BreakerConfig, BreakerSnapshot, CallError, CircuitBreaker, OpenHook, StateChangeHook,
    DEFAULT_ERROR_THRESHOLD, DEFAULT_MAX_HALF_OPEN_REQUESTS, DEFAULT_MAX_REQUESTS, DEFAULT_TIMEOUT,
};
pub use registry::BreakerRegistry;
pub use state::{BreakerState, Counts};
