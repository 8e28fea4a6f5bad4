//! Counter store abstraction.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::counter::{CounterOutcome, CounterSnapshot};
use super::key::CounterKey;
use crate::error::Result;

/// Storage for per-key counters.
///
/// This trait abstracts over the in-process [`MemoryCounterStore`] and the
/// shared [`RedisCounterStore`] so the evaluator can work with either.
///
/// Implementations must run [`increment_and_check`] as one atomic step per
/// key: two concurrent callers can never observe the same pre-increment
/// state.
///
/// [`MemoryCounterStore`]: super::MemoryCounterStore
/// [`RedisCounterStore`]: super::RedisCounterStore
/// [`increment_and_check`]: CounterStore::increment_and_check
#[async_trait]
pub trait CounterStore: Send + Sync + std::fmt::Debug {
    /// Record one event for `key` at `now` and compare against `limit`.
    async fn increment_and_check(
        &self,
        key: &CounterKey,
        limit: u64,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<CounterOutcome>;

    /// Read a counter without recording an event.
    ///
    /// Returns `None` if the key has never been counted or has expired.
    async fn peek(
        &self,
        key: &CounterKey,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<CounterSnapshot>>;

    /// Short backend name for logs and health output.
    fn backend_name(&self) -> &'static str;
}
