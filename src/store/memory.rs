//! In-process counter store.
//!
//! Backs limiters that are not marked distributed, and stands in for Redis in
//! tests. Each key lives in one `DashMap` shard, so every operation on a key is
//! atomic with respect to other operations on the same key.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use super::{CounterStore, StoreError};
use crate::clock::{self, Clock};

#[derive(Debug)]
enum Value {
    Counter(i64),
    Set(HashMap<String, f64>),
}

#[derive(Debug)]
struct Slot {
    value: Value,
    expires_at: Option<Duration>,
}

impl Slot {
    fn is_expired(&self, now: Duration) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Counter store kept in process memory.
pub struct MemoryStore {
    entries: DashMap<String, Slot>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    /// Create an empty store on the system clock.
    pub fn new() -> Self {
        Self::with_clock(clock::system())
    }

    /// Create an empty store that evaluates TTLs against `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    /// Drop every key whose TTL has passed. Returns the number removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries.retain(|_, slot| !slot.is_expired(now));
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!(removed, "Purged expired counter keys");
        }
        removed
    }

    /// Number of keys currently held, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remaining time to live of `key`, if it is live and has one.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = self.clock.now();
        let slot = self.entries.get(key)?;
        if slot.is_expired(now) {
            return None;
        }
        slot.expires_at.map(|at| at.saturating_sub(now))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("keys", &self.entries.len())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        let now = self.clock.now();
        let mut slot = self.entries.entry(key.to_string()).or_insert(Slot {
            value: Value::Counter(0),
            expires_at: None,
        });
        if slot.is_expired(now) {
            *slot = Slot {
                value: Value::Counter(0),
                expires_at: None,
            };
        }

        match &mut slot.value {
            Value::Counter(n) => {
                *n += 1;
                Ok(*n)
            }
            Value::Set(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        let now = self.clock.now();
        let expired = match self.entries.get_mut(key) {
            Some(mut slot) if !slot.is_expired(now) => {
                slot.expires_at = Some(now + ttl);
                false
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove_if(key, |_, slot| slot.is_expired(now));
        }
        Ok(())
    }

    async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<(), StoreError> {
        let now = self.clock.now();
        let mut slot = self.entries.entry(key.to_string()).or_insert(Slot {
            value: Value::Set(HashMap::new()),
            expires_at: None,
        });
        if slot.is_expired(now) {
            *slot = Slot {
                value: Value::Set(HashMap::new()),
                expires_at: None,
            };
        }

        match &mut slot.value {
            Value::Set(members) => {
                members.insert(member.to_string(), score);
                Ok(())
            }
            Value::Counter(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    async fn zrem_range_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<u64, StoreError> {
        let now = self.clock.now();
        let (removed, now_empty) = match self.entries.get_mut(key) {
            Some(mut slot) => {
                if slot.is_expired(now) {
                    (0, true)
                } else {
                    match &mut slot.value {
                        Value::Set(members) => {
                            let before = members.len();
                            members.retain(|_, score| *score < min || *score > max);
                            ((before - members.len()) as u64, members.is_empty())
                        }
                        Value::Counter(_) => {
                            return Err(StoreError::WrongType(key.to_string()));
                        }
                    }
                }
            }
            None => (0, false),
        };

        // Like Redis, an emptied set stops existing.
        if now_empty {
            self.entries.remove_if(key, |_, slot| {
                slot.is_expired(now) || matches!(&slot.value, Value::Set(m) if m.is_empty())
            });
        }
        Ok(removed)
    }

    async fn zcard(&self, key: &str) -> Result<u64, StoreError> {
        let now = self.clock.now();
        match self.entries.get(key) {
            Some(slot) if slot.is_expired(now) => Ok(0),
            Some(slot) => match &slot.value {
                Value::Set(members) => Ok(members.len() as u64),
                Value::Counter(_) => Err(StoreError::WrongType(key.to_string())),
            },
            None => Ok(0),
        }
    }
}
