//! Fixed-window counter storage.
//!
//! Counters are keyed by client, category, granularity and the bucket the
//! current time falls into. Once the clock moves past a bucket its counter is
//! no longer reachable and is swept away after it expires.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, trace};

use super::clock::Clock;

/// Errors reported by a counter store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Counter store unavailable: {0}")]
    Unavailable(String),
}

/// Window granularity for rate limiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    /// Per-minute window
    Minute,
    /// Per-hour window
    Hour,
}

impl Granularity {
    /// Get the duration of this window.
    pub fn duration(&self) -> Duration {
        match self {
            Granularity::Minute => Duration::from_secs(60),
            Granularity::Hour => Duration::from_secs(3600),
        }
    }

    /// Floor `now` to this granularity, rendered as a compact UTC timestamp.
    ///
    /// Minute buckets look like `202501171432`, hour buckets like `2025011714`.
    pub fn bucket(&self, now: DateTime<Utc>) -> String {
        match self {
            Granularity::Minute => now.format("%Y%m%d%H%M").to_string(),
            Granularity::Hour => now.format("%Y%m%d%H").to_string(),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::Minute => "minute",
            Granularity::Hour => "hour",
        }
    }
}

/// Key identifying one fixed-window counter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CounterKey {
    /// The resolved client identity (`user:`, `apikey:` or `ip:` prefixed).
    pub client_id: String,
    /// The operation category.
    pub category: String,
    /// Minute or hour window.
    pub granularity: Granularity,
    /// The bucket timestamp, floored to the granularity.
    pub bucket: String,
}

impl CounterKey {
    /// Create a counter key for the bucket containing `now`.
    pub fn at(client_id: &str, category: &str, granularity: Granularity, now: DateTime<Utc>) -> Self {
        Self {
            client_id: client_id.to_string(),
            category: category.to_string(),
            granularity,
            bucket: granularity.bucket(now),
        }
    }
}

impl std::fmt::Display for CounterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ratelimit:{}:{}:{}:{}",
            self.client_id,
            self.category,
            self.granularity.as_str(),
            self.bucket
        )
    }
}

/// A single counter value and the time it stops counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterEntry {
    pub count: u64,
    pub expires_at: DateTime<Utc>,
}

impl CounterEntry {
    fn fresh(granularity: Granularity, now: DateTime<Utc>) -> Self {
        Self {
            count: 1,
            expires_at: now + window_delta(granularity),
        }
    }

    /// Whether this entry should be treated as absent at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

fn window_delta(granularity: Granularity) -> chrono::Duration {
    match granularity {
        Granularity::Minute => chrono::Duration::minutes(1),
        Granularity::Hour => chrono::Duration::hours(1),
    }
}

/// Storage for fixed-window counters.
///
/// Implementations must make `increment` atomic per key: concurrent callers
/// never double-create an entry or lose an update.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Increment the counter for `key`, creating it if absent or expired.
    ///
    /// Returns the post-increment count.
    async fn increment(&self, key: &CounterKey) -> Result<u64, StoreError>;

    /// Get the current count for `key`, or 0 if absent or expired.
    async fn get(&self, key: &CounterKey) -> Result<u64, StoreError>;

    /// Undo one increment of `key`. Counts never go below zero.
    ///
    /// Returns the post-decrement count.
    async fn decrement(&self, key: &CounterKey) -> Result<u64, StoreError>;
}

/// An in-process counter store backed by a concurrent map.
///
/// Expired entries read as zero; `purge_expired` reclaims their memory.
#[derive(Debug)]
pub struct MemoryCounterStore {
    entries: DashMap<CounterKey, CounterEntry>,
    clock: Arc<dyn Clock>,
}

impl MemoryCounterStore {
    /// Create an empty store using the given clock for expiry.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    /// Remove all expired entries, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        let removed = before.saturating_sub(self.entries.len());

        if removed > 0 {
            debug!(removed, remaining = self.entries.len(), "Purged expired counters");
        }
        removed
    }

    /// Get the number of stored entries, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn increment(&self, key: &CounterKey) -> Result<u64, StoreError> {
        let now = self.clock.now();

        // The entry guard holds the shard lock, so create-or-bump is atomic.
        let mut entry = self
            .entries
            .entry(key.clone())
            .or_insert_with(|| CounterEntry {
                count: 0,
                expires_at: now + window_delta(key.granularity),
            });

        if entry.is_expired(now) {
            *entry = CounterEntry::fresh(key.granularity, now);
        } else {
            entry.count += 1;
        }

        trace!(key = %key, count = entry.count, "Incremented counter");
        Ok(entry.count)
    }

    async fn get(&self, key: &CounterKey) -> Result<u64, StoreError> {
        let now = self.clock.now();
        Ok(self
            .entries
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.count)
            .unwrap_or(0))
    }

    async fn decrement(&self, key: &CounterKey) -> Result<u64, StoreError> {
        let now = self.clock.now();
        let count = match self.entries.get_mut(key) {
            Some(mut entry) if !entry.is_expired(now) => {
                entry.count = entry.count.saturating_sub(1);
                entry.count
            }
            _ => 0,
        };

        trace!(key = %key, count, "Decremented counter");
        Ok(count)
    }
}
