//! Rate limit decisions.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::counter::CounterOutcome;
use super::rules::{RateLimitRule, Scope};

/// Quota metadata reported to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Quota {
    /// The rule's maximum events per window
    pub limit: u64,
    /// Estimated events left in the current window
    pub remaining: u64,
    /// When the current window ends
    pub reset_at: DateTime<Utc>,
    /// Name of the rule that produced this quota
    pub rule: String,
    /// Scope of that rule
    pub scope: Scope,
    /// Action of that rule, if any
    pub action: Option<String>,
}

/// The outcome of evaluating one request.
///
/// Created fresh per evaluation and never persisted. A decision without a
/// quota means no rule counted the request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    /// Whether the request may proceed
    pub allowed: bool,
    /// Time the decision was made
    pub evaluated_at: DateTime<Utc>,
    /// Quota of the binding rule
    pub quota: Option<Quota>,
}

impl Decision {
    /// Build a decision from a rule and the store's answer for it.
    pub fn from_outcome(rule: &RateLimitRule, outcome: &CounterOutcome, now: DateTime<Utc>) -> Self {
        let window_end = chrono::Duration::from_std(rule.window)
            .ok()
            .and_then(|window| outcome.window_start.checked_add_signed(window));
        // The window containing `now` always ends after it; the fallback only
        // matters for a store whose clock disagrees with ours.
        let reset_at = match window_end {
            Some(end) if end > now => end,
            _ => now + chrono::Duration::seconds(1),
        };

        let remaining = if outcome.over_limit {
            0
        } else {
            rule.limit.saturating_sub(outcome.count)
        };

        Self {
            allowed: !outcome.over_limit,
            evaluated_at: now,
            quota: Some(Quota {
                limit: rule.limit,
                remaining,
                reset_at,
                rule: rule.name.clone(),
                scope: rule.scope,
                action: rule.action.clone(),
            }),
        }
    }

    /// An allowed decision that no rule counted.
    pub fn unmetered(now: DateTime<Utc>) -> Self {
        Self {
            allowed: true,
            evaluated_at: now,
            quota: None,
        }
    }

    pub fn is_allowed(&self) -> bool {
        self.allowed
    }

    /// Time until the binding window resets, rounded up to whole seconds.
    ///
    /// Always at least one second when a quota is present.
    pub fn retry_after(&self) -> Option<Duration> {
        let quota = self.quota.as_ref()?;
        let millis = (quota.reset_at - self.evaluated_at).num_milliseconds().max(0) as u64;
        let secs = millis.div_ceil(1000).max(1);
        Some(Duration::from_secs(secs))
    }
}
