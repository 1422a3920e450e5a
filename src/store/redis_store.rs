//! Redis-backed counter store.
//!
//! All service instances pointing at the same Redis share counters. Every
//! operation maps onto a single Redis command, so atomicity per operation is
//! whatever Redis guarantees for that command.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, RedisError};
use tracing::info;

use super::{CounterStore, StoreError};

impl From<RedisError> for StoreError {
    fn from(e: RedisError) -> Self {
        if e.is_io_error() || e.is_connection_refusal() || e.is_connection_dropped() || e.is_timeout()
        {
            StoreError::Unavailable(e.to_string())
        } else {
            StoreError::Command(e.to_string())
        }
    }
}

/// Counter store on a Redis server.
///
/// Uses a `ConnectionManager`, which reconnects transparently after the server
/// goes away; calls made while it is down fail with `StoreError::Unavailable`.
#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
    url: String,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect to Redis.
    ///
    /// # Arguments
    /// * `url` - Redis connection URL (e.g., "redis://127.0.0.1/")
    ///
    /// # Errors
    /// Returns an error if the URL is invalid or the first connection fails.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = Client::open(url)?;
        let connection = ConnectionManager::new(client).await?;
        info!(url = %url, "Connected to Redis counter store");

        Ok(Self {
            connection,
            url: url.to_string(),
        })
    }

    /// Round-trip a PING to check the server is reachable.
    pub async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

/// Render a score bound the way Redis expects, including infinities.
fn score_arg(score: f64) -> String {
    if score == f64::INFINITY {
        "+inf".to_string()
    } else if score == f64::NEG_INFINITY {
        "-inf".to_string()
    } else {
        score.to_string()
    }
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        let mut conn = self.connection.clone();
        let value: i64 = redis::cmd("INCR").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        let millis = ttl.as_millis().max(1) as u64;
        let _: i64 = redis::cmd("PEXPIRE")
            .arg(key)
            .arg(millis)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        let _: i64 = redis::cmd("ZADD")
            .arg(key)
            .arg(score_arg(score))
            .arg(member)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn zrem_range_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<u64, StoreError> {
        let mut conn = self.connection.clone();
        let removed: u64 = redis::cmd("ZREMRANGEBYSCORE")
            .arg(key)
            .arg(score_arg(min))
            .arg(score_arg(max))
            .query_async(&mut conn)
            .await?;
        Ok(removed)
    }

    async fn zcard(&self, key: &str) -> Result<u64, StoreError> {
        let mut conn = self.connection.clone();
        let count: u64 = redis::cmd("ZCARD").arg(key).query_async(&mut conn).await?;
        Ok(count)
    }
}
