//! In-process counter store.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, trace};

use super::counter::{window_millis, CounterOutcome, CounterSnapshot, CounterState};
use super::key::CounterKey;
use super::store::CounterStore;
use crate::error::Result;

/// Counter store backed by a sharded concurrent map.
///
/// The increment runs while the entry's shard write guard is held, which
/// makes the read-modify-write atomic per key. Limits are per process;
/// use the Redis store to share them across instances.
#[derive(Debug, Default)]
pub struct MemoryCounterStore {
    counters: DashMap<CounterKey, CounterState>,
}

impl MemoryCounterStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every counter whose current and previous windows are both stale.
    ///
    /// Returns the number of counters removed.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let now_ms = now.timestamp_millis();
        let before = self.counters.len();
        self.counters.retain(|_, state| !state.is_expired(now_ms));
        let removed = before.saturating_sub(self.counters.len());
        if removed > 0 {
            debug!(removed, remaining = self.counters.len(), "Purged expired counters");
        }
        removed
    }

    /// Get the number of live counters.
    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    /// Clear all counters.
    pub fn clear(&self) {
        self.counters.clear();
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn increment_and_check(
        &self,
        key: &CounterKey,
        limit: u64,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<CounterOutcome> {
        let window_ms = window_millis(window)?;
        let now_ms = now.timestamp_millis();

        let outcome = match self.counters.get_mut(key) {
            Some(mut state) => state.increment_and_check(limit, window_ms, now_ms),
            None => {
                let mut state = self.counters.entry(key.clone()).or_insert_with(|| {
                    debug!(key = %key, limit, window = ?window, "Creating new counter");
                    CounterState::new(window_ms, now_ms)
                });
                state.increment_and_check(limit, window_ms, now_ms)
            }
        };

        trace!(
            key = %key,
            count = outcome.count,
            over_limit = outcome.over_limit,
            "Counter incremented"
        );
        Ok(outcome)
    }

    async fn peek(
        &self,
        key: &CounterKey,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<CounterSnapshot>> {
        let window_ms = window_millis(window)?;
        let now_ms = now.timestamp_millis();
        Ok(self
            .counters
            .get(key)
            .filter(|state| !state.is_expired(now_ms))
            .map(|state| state.snapshot_at(window_ms, now_ms)))
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
