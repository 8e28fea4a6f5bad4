//! Process-wide rule registry with atomic replacement.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{info, warn};

use super::rules::RuleSet;
use crate::error::Result;

/// Holds the active [`RuleSet`].
///
/// Readers take an `Arc` snapshot and keep using it for the whole
/// evaluation, so a concurrent [`replace`](RuleRegistry::replace) can never
/// expose a half-updated rule list. Rule sets themselves are never mutated.
#[derive(Debug)]
pub struct RuleRegistry {
    current: RwLock<Arc<RuleSet>>,
}

impl RuleRegistry {
    /// Create a registry with an initial rule set.
    pub fn new(rules: RuleSet) -> Self {
        Self {
            current: RwLock::new(Arc::new(rules)),
        }
    }

    /// The active rule set.
    pub fn snapshot(&self) -> Arc<RuleSet> {
        self.current.read().clone()
    }

    /// Swap in a new rule set, returning the previous one.
    pub fn replace(&self, rules: RuleSet) -> Arc<RuleSet> {
        let next = Arc::new(rules);
        let previous = std::mem::replace(&mut *self.current.write(), next);
        info!(
            previous_rules = previous.len(),
            rules = self.current.read().len(),
            "Rate limit rules replaced"
        );
        previous
    }

    /// Build a rule set with `load` and swap it in.
    ///
    /// If loading or validation fails the active rules stay in place and the
    /// error is returned.
    pub fn reload<F>(&self, load: F) -> Result<()>
    where
        F: FnOnce() -> Result<RuleSet>,
    {
        match load() {
            Ok(rules) => {
                self.replace(rules);
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, "Rejected rate limit rule reload, keeping current rules");
                Err(err)
            }
        }
    }
}

impl Default for RuleRegistry {
    fn default() -> Self {
        Self::new(RuleSet::empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LimiterError;
    use crate::ratelimit::rules::{RateLimitRule, Scope};
    use std::time::Duration;

    fn rules(limit: u64) -> RuleSet {
        RuleSet::new(vec![
            RateLimitRule::new("ip", Scope::Ip, limit, Duration::from_secs(60)).unwrap()
        ])
        .unwrap()
    }

    #[test]
    fn test_snapshot_survives_replace() {
        let registry = RuleRegistry::new(rules(60));
        let before = registry.snapshot();

        let previous = registry.replace(rules(120));
        assert!(Arc::ptr_eq(&before, &previous));
        assert_eq!(before.get("ip").unwrap().limit, 60);
        assert_eq!(registry.snapshot().get("ip").unwrap().limit, 120);
    }

    #[test]
    fn test_failed_reload_keeps_rules() {
        let registry = RuleRegistry::new(rules(60));

        let result = registry.reload(|| {
            Err(LimiterError::Configuration("limit must be positive".to_string()))
        });
        assert!(result.is_err());
        assert_eq!(registry.snapshot().get("ip").unwrap().limit, 60);

        registry.reload(|| Ok(rules(30))).unwrap();
        assert_eq!(registry.snapshot().get("ip").unwrap().limit, 30);
    }

    #[test]
    fn test_default_is_empty() {
        assert!(RuleRegistry::default().snapshot().is_empty());
    }
}
