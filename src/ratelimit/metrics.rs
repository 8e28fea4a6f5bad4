//! Operational counters for the limiter.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

/// Limiter statistics.
///
/// Cheap to clone; all clones share the same counters.
#[derive(Debug, Clone, Default)]
pub struct LimiterMetrics {
    inner: Arc<MetricsInner>,
}

#[derive(Debug, Default)]
struct MetricsInner {
    allowed: AtomicU64,
    denied: AtomicU64,
    store_failures: AtomicU64,
    invalid_keys: AtomicU64,
}

impl LimiterMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_allowed(&self) {
        self.inner.allowed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_denied(&self) {
        self.inner.denied.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_store_failure(&self) {
        self.inner.store_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_invalid_key(&self) {
        self.inner.invalid_keys.fetch_add(1, Ordering::Relaxed);
    }

    /// Get a point-in-time copy of all counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            allowed: self.inner.allowed.load(Ordering::Relaxed),
            denied: self.inner.denied.load(Ordering::Relaxed),
            store_failures: self.inner.store_failures.load(Ordering::Relaxed),
            invalid_keys: self.inner.invalid_keys.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time snapshot of [`LimiterMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    /// Requests let through
    pub allowed: u64,
    /// Requests rejected as over limit
    pub denied: u64,
    /// Store errors and timeouts, fail-open or fail-closed
    pub store_failures: u64,
    /// Requests whose identity could not be turned into a key
    pub invalid_keys: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_counters() {
        let metrics = LimiterMetrics::new();
        let clone = metrics.clone();

        metrics.record_allowed();
        clone.record_denied();
        clone.record_store_failure();
        metrics.record_invalid_key();

        assert_eq!(
            metrics.snapshot(),
            MetricsSnapshot {
                allowed: 1,
                denied: 1,
                store_failures: 1,
                invalid_keys: 1,
            }
        );
    }
}
