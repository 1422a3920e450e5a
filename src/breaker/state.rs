//! Breaker states and per-generation request counts.

use serde::Serialize;

/// State of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    /// Requests pass through and outcomes are counted
    Closed,
    /// Requests are rejected until the timeout elapses
    Open,
    /// A limited number of trial requests pass through
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakerState::Closed => write!(f, "closed"),
            BreakerState::Open => write!(f, "open"),
            BreakerState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Request and outcome counters for the current generation.
///
/// Cleared on every state transition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Counts {
    pub requests: u32,
    pub total_successes: u32,
    pub total_failures: u32,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
}

impl Counts {
    pub(crate) fn on_request(&mut self) {
        self.requests = self.requests.saturating_add(1);
    }

    pub(crate) fn on_success(&mut self) {
        self.total_successes = self.total_successes.saturating_add(1);
        self.consecutive_successes = self.consecutive_successes.saturating_add(1);
        self.consecutive_failures = 0;
    }

    pub(crate) fn on_failure(&mut self) {
        self.total_failures = self.total_failures.saturating_add(1);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.consecutive_successes = 0;
    }

    pub(crate) fn clear(&mut self) {
        *self = Counts::default();
    }

    /// Share of admitted requests that failed, `0.0` when nothing was admitted.
    pub fn failure_ratio(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            f64::from(self.total_failures) / f64::from(self.requests)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consecutive_counters_reset_each_other() {
        let mut counts = Counts::default();
        counts.on_request();
        counts.on_failure();
        counts.on_request();
        counts.on_failure();
        assert_eq!(counts.consecutive_failures, 2);

        counts.on_request();
        counts.on_success();
        assert_eq!(counts.consecutive_failures, 0);
        assert_eq!(counts.consecutive_successes, 1);
        assert_eq!(counts.total_failures, 2);
        assert_eq!(counts.requests, 3);
    }

    #[test]
    fn test_failure_ratio() {
        let mut counts = Counts::default();
        assert_eq!(counts.failure_ratio(), 0.0);

        for _ in 0..4 {
            counts.on_request();
        }
        counts.on_failure();
        assert_eq!(counts.failure_ratio(), 0.25);

        counts.clear();
        assert_eq!(counts, Counts::default());
    }

    #[test]
    fn test_state_serializes_snake_case() {
        let json = serde_json::to_string(&BreakerState::HalfOpen).unwrap();
        assert_eq!(json, "\"half_open\"");
        assert_eq!(BreakerState::HalfOpen.to_string(), "half-open");
    }
}
