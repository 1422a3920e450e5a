//! Window arithmetic for the two limiting algorithms.
//!
//! Times are milliseconds since the UNIX epoch, so every instance sharing a
//! store agrees on bucket boundaries.

use std::time::Duration;

/// The fixed-window bucket containing a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedBucket {
    /// Bucket number, `floor(now / window)`
    pub index: u64,
    /// Time left until the next bucket starts
    pub reset_after: Duration,
}

fn window_millis(window: Duration) -> u64 {
    (window.as_millis() as u64).max(1)
}

/// Bucket for `now` under windows of length `window`.
pub fn fixed_bucket(now: Duration, window: Duration) -> FixedBucket {
    let window_ms = window_millis(window);
    let now_ms = now.as_millis() as u64;
    let index = now_ms / window_ms;
    let next_start = (index + 1) * window_ms;

    FixedBucket {
        index,
        reset_after: Duration::from_millis(next_start - now_ms),
    }
}

/// Sliding-window log score for a point in time.
pub fn score(now: Duration) -> f64 {
    now.as_millis() as f64
}

/// Highest score that has left the window ending at `now`.
///
/// Entries scored strictly before `now - window` are stale; scores are whole
/// milliseconds, so that is everything at or below `now - window - 1ms`.
pub fn stale_score_bound(now: Duration, window: Duration) -> f64 {
    let cutoff = (now.as_millis() as u64).saturating_sub(window_millis(window));
    cutoff as f64 - 1.0
}
