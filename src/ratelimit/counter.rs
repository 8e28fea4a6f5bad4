//! Weighted fixed-window counter state.
//!
//! Each counter keeps two integers: the events in the current fixed window
//! and the events in the window right before it. The previous window is
//! prorated by how much of the current window is still left, which gives a
//! close approximation of a true sliding window without storing per-event
//! timestamps.

use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};

use crate::error::{LimiterError, Result};

/// Result of a single atomic increment-and-check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CounterOutcome {
    /// Effective count after this increment, rounded to the nearest integer
    pub count: u64,
    /// Start of the fixed window the increment landed in
    pub window_start: DateTime<Utc>,
    /// Whether the effective count exceeds the limit
    pub over_limit: bool,
}

/// Read-only view of a counter at a point in time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CounterSnapshot {
    /// Events counted in the current window
    pub current: u64,
    /// Events counted in the previous window
    pub previous: u64,
    /// `current + previous * (1 - elapsed_fraction)`
    pub effective: f64,
    /// Start of the current window
    pub window_start: DateTime<Utc>,
}

/// Mutable per-key counter record.
///
/// Stores never hand this out; it is only touched inside their atomic
/// increment operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterState {
    window_start_ms: i64,
    window_ms: i64,
    current: u64,
    previous: u64,
}

impl CounterState {
    /// Create an empty counter aligned to the window containing `now_ms`.
    pub fn new(window_ms: i64, now_ms: i64) -> Self {
        Self {
            window_start_ms: align_window(now_ms, window_ms),
            window_ms,
            current: 0,
            previous: 0,
        }
    }

    /// Rebuild a counter from persisted fields.
    pub fn from_parts(window_start_ms: i64, window_ms: i64, current: u64, previous: u64) -> Self {
        Self {
            window_start_ms,
            window_ms,
            current,
            previous,
        }
    }

    /// Count one event at `now_ms` and compare the result against `limit`.
    pub fn increment_and_check(&mut self, limit: u64, window_ms: i64, now_ms: i64) -> CounterOutcome {
        let now_ms = self.roll_to(now_ms, window_ms);
        self.current = self.current.saturating_add(1);

        let effective = self.effective_count(now_ms);
        CounterOutcome {
            count: effective.round() as u64,
            window_start: millis_to_datetime(self.window_start_ms),
            over_limit: effective > limit as f64,
        }
    }

    /// The counter as it would look at `now_ms`, without recording an event.
    pub fn snapshot_at(&self, window_ms: i64, now_ms: i64) -> CounterSnapshot {
        let mut rolled = *self;
        let now_ms = rolled.roll_to(now_ms, window_ms);
        CounterSnapshot {
            current: rolled.current,
            previous: rolled.previous,
            effective: rolled.effective_count(now_ms),
            window_start: millis_to_datetime(rolled.window_start_ms),
        }
    }

    /// Whether both the current and the previous window are stale.
    pub fn is_expired(&self, now_ms: i64) -> bool {
        now_ms.saturating_sub(self.window_start_ms) > self.window_ms.saturating_mul(2)
    }

    /// Events counted in the current window.
    pub fn current(&self) -> u64 {
        self.current
    }

    /// Events counted in the previous window.
    pub fn previous(&self) -> u64 {
        self.previous
    }

    /// Start of the current window in Unix milliseconds.
    pub fn window_start_ms(&self) -> i64 {
        self.window_start_ms
    }

    /// Move the state into the window containing `now_ms`.
    ///
    /// Exactly one elapsed window shifts current into previous. A longer gap
    /// or a changed window length resets both counts. A stored window ahead
    /// of `now_ms` was opened by a caller with a faster clock; it is kept and
    /// counted against as if at its start.
    ///
    /// Returns the time the effective count should be computed at.
    fn roll_to(&mut self, now_ms: i64, window_ms: i64) -> i64 {
        let window_start = align_window(now_ms, window_ms);
        if self.window_ms == window_ms {
            if self.window_start_ms == window_start {
                return now_ms;
            }
            if self.window_start_ms > window_start {
                return self.window_start_ms;
            }
        }

        if self.window_ms == window_ms
            && self.window_start_ms.saturating_add(window_ms) == window_start
        {
            self.previous = self.current;
        } else {
            self.previous = 0;
        }
        self.current = 0;
        self.window_start_ms = window_start;
        self.window_ms = window_ms;
        now_ms
    }

    fn effective_count(&self, now_ms: i64) -> f64 {
        let elapsed = now_ms.saturating_sub(self.window_start_ms) as f64 / self.window_ms as f64;
        let elapsed = elapsed.clamp(0.0, 1.0);
        self.current as f64 + self.previous as f64 * (1.0 - elapsed)
    }
}

/// Floor `now_ms` to the start of its fixed window.
pub fn align_window(now_ms: i64, window_ms: i64) -> i64 {
    now_ms.div_euclid(window_ms) * window_ms
}

/// Convert a window length to whole milliseconds, rejecting zero.
pub fn window_millis(window: Duration) -> Result<i64> {
    let millis = i64::try_from(window.as_millis()).unwrap_or(i64::MAX);
    if millis <= 0 {
        return Err(LimiterError::Configuration(format!(
            "window must be at least one millisecond, got {:?}",
            window
        )));
    }
    Ok(millis)
}

pub(crate) fn millis_to_datetime(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis).single().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE_MS: i64 = 60_000;
    // An epoch aligned to a whole minute keeps the arithmetic readable.
    const T0: i64 = 1_700_000_040_000;

    #[test]
    fn test_align_window() {
        assert_eq!(align_window(T0, MINUTE_MS), T0);
        assert_eq!(align_window(T0 + 59_999, MINUTE_MS), T0);
        assert_eq!(align_window(T0 + 60_000, MINUTE_MS), T0 + MINUTE_MS);
    }

    #[test]
    fn test_window_millis_rejects_zero() {
        assert!(window_millis(Duration::ZERO).is_err());
        assert!(window_millis(Duration::from_micros(10)).is_err());
        assert_eq!(window_millis(Duration::from_secs(60)).unwrap(), MINUTE_MS);
    }

    #[test]
    fn test_hard_ceiling_within_one_window() {
        let mut state = CounterState::new(MINUTE_MS, T0);

        for i in 1..=5 {
            let outcome = state.increment_and_check(5, MINUTE_MS, T0 + i * 100);
            assert!(!outcome.over_limit, "increment {} should be within limit", i);
            assert_eq!(outcome.count, i as u64);
        }

        let outcome = state.increment_and_check(5, MINUTE_MS, T0 + 1_000);
        assert!(outcome.over_limit);
        assert_eq!(outcome.count, 6);
    }

    #[test]
    fn test_rollover_weights_previous_window() {
        let mut state = CounterState::new(MINUTE_MS, T0);
        for _ in 0..10 {
            state.increment_and_check(100, MINUTE_MS, T0);
        }

        // At the start of the next window the previous one weighs in fully.
        let at_boundary = state.snapshot_at(MINUTE_MS, T0 + MINUTE_MS);
        assert_eq!(at_boundary.current, 0);
        assert_eq!(at_boundary.previous, 10);
        assert!((at_boundary.effective - 10.0).abs() < f64::EPSILON);

        // Halfway through, half of it remains.
        let halfway = state.snapshot_at(MINUTE_MS, T0 + MINUTE_MS + 30_000);
        assert!((halfway.effective - 5.0).abs() < 1e-9);

        let later = state.snapshot_at(MINUTE_MS, T0 + MINUTE_MS + 45_000);
        assert!(later.effective < halfway.effective);
    }

    #[test]
    fn test_rollover_increment_uses_weighted_count() {
        let mut state = CounterState::new(MINUTE_MS, T0);
        for _ in 0..10 {
            state.increment_and_check(10, MINUTE_MS, T0 + 1_000);
        }

        // 10 * 0.5 + 1 = 6
        let outcome = state.increment_and_check(10, MINUTE_MS, T0 + MINUTE_MS + 30_000);
        assert_eq!(outcome.count, 6);
        assert!(!outcome.over_limit);
        assert_eq!(outcome.window_start.timestamp_millis(), T0 + MINUTE_MS);

        // Right at the boundary the previous window still counts in full.
        let mut state = CounterState::new(MINUTE_MS, T0);
        for _ in 0..10 {
            state.increment_and_check(10, MINUTE_MS, T0);
        }
        let outcome = state.increment_and_check(10, MINUTE_MS, T0 + MINUTE_MS);
        assert!(outcome.over_limit);
    }

    #[test]
    fn test_two_idle_windows_reset_state() {
        let mut state = CounterState::new(MINUTE_MS, T0);
        for _ in 0..10 {
            state.increment_and_check(10, MINUTE_MS, T0);
        }

        let snapshot = state.snapshot_at(MINUTE_MS, T0 + 2 * MINUTE_MS);
        assert_eq!(snapshot.current, 0);
        assert_eq!(snapshot.previous, 0);
        assert_eq!(snapshot.effective, 0.0);

        let outcome = state.increment_and_check(10, MINUTE_MS, T0 + 2 * MINUTE_MS + 5);
        assert_eq!(outcome.count, 1);
        assert!(!outcome.over_limit);
    }

    #[test]
    fn test_skewed_clocks_across_boundary_share_one_window() {
        let boundary = T0 + MINUTE_MS;
        let mut state = CounterState::new(MINUTE_MS, boundary + 1);

        let allowed = (0..20)
            .map(|i| if i % 2 == 0 { boundary + 1 } else { boundary - 1 })
            .filter(|&now| !state.increment_and_check(5, MINUTE_MS, now).over_limit)
            .count();

        assert_eq!(allowed, 5);
        assert_eq!(state.window_start_ms(), boundary);
        assert_eq!(state.current(), 20);
        assert_eq!(state.previous(), 0);
    }

    #[test]
    fn test_lagging_clock_counts_against_newer_window() {
        let mut state = CounterState::from_parts(T0 + MINUTE_MS, MINUTE_MS, 3, 2);
        let outcome = state.increment_and_check(10, MINUTE_MS, T0 + 59_000);
        assert_eq!(outcome.count, 6);
        assert_eq!(outcome.window_start.timestamp_millis(), T0 + MINUTE_MS);
        assert_eq!((state.current(), state.previous()), (4, 2));
    }

    #[test]
    fn test_changed_window_length_resets_state() {
        let mut state = CounterState::new(MINUTE_MS, T0);
        for _ in 0..3 {
            state.increment_and_check(10, MINUTE_MS, T0);
        }
        let outcome = state.increment_and_check(10, 2 * MINUTE_MS, T0 + 2 * MINUTE_MS);
        assert_eq!(outcome.count, 1);
    }

    #[test]
    fn test_expiry() {
        let state = CounterState::new(MINUTE_MS, T0);
        assert!(!state.is_expired(T0 + 2 * MINUTE_MS));
        assert!(state.is_expired(T0 + 2 * MINUTE_MS + 1));

        let long = CounterState::new(i64::MAX / 2 + 1, T0);
        assert!(!long.is_expired(T0 + MINUTE_MS));
    }
}
