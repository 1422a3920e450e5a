//! Counter store abstraction shared by every rate limiter.
//!
//! The store holds two kinds of per-key state: integer counters (fixed
//! window buckets) and scored member sets (sliding window logs). Each
//! operation must be atomic at the store, since every service instance races
//! on the same keys.

mod memory;
mod redis_store;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use self::memory::MemoryStore;
pub use self::redis_store::RedisStore;

/// Errors surfaced by a counter store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store command failed: {0}")]
    Command(String),
    #[error("key '{0}' holds a value of the wrong type")]
    WrongType(String),
}

/// Atomic key/value and sorted-set operations with per-key TTL.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Increment the counter at `key`, creating it at zero first, and return
    /// the new value.
    async fn incr(&self, key: &str) -> Result<i64, StoreError>;

    /// Set the time to live of `key`. Missing keys are left alone.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Add `member` to the set at `key` with `score`, replacing its score if
    /// already present.
    async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<(), StoreError>;

    /// Remove members whose score lies in `min..=max` and return how many
    /// were removed.
    async fn zrem_range_by_score(&self, key: &str, min: f64, max: f64)
        -> Result<u64, StoreError>;

    /// Number of members in the set at `key`.
    async fn zcard(&self, key: &str) -> Result<u64, StoreError>;
}
