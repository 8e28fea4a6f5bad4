//! Multi-tier rate limit evaluation.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, trace, warn};

use super::clock::{Clock, SystemClock};
use super::counter::CounterOutcome;
use super::decision::Decision;
use super::context::RequestContext;
use super::key::CounterKey;
use super::metrics::LimiterMetrics;
use super::registry::RuleRegistry;
use super::rules::{FailureMode, RateLimitRule};
use super::store::CounterStore;
use crate::error::{LimiterError, Result};

/// Default bound on a single store round trip.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(250);

/// Evaluates requests against every applicable rule.
///
/// The limiter holds no counter state of its own; it is safe to share across
/// tasks and to run one per process in front of a shared store.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    registry: Arc<RuleRegistry>,
    clock: Arc<dyn Clock>,
    store_timeout: Duration,
    metrics: LimiterMetrics,
}

impl RateLimiter {
    /// Create a limiter using the system clock and the default store timeout.
    pub fn new(store: Arc<dyn CounterStore>, registry: Arc<RuleRegistry>) -> Self {
        Self {
            store,
            registry,
            clock: Arc::new(SystemClock::new()),
            store_timeout: DEFAULT_STORE_TIMEOUT,
            metrics: LimiterMetrics::new(),
        }
    }

    /// Use a different time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Bound each store call by `timeout`.
    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    /// Evaluate one request.
    ///
    /// Rules run most specific first. The first rule over its limit ends the
    /// evaluation with a denied decision, and rules after it are not
    /// incremented. Otherwise the decision of the most specific counted rule
    /// is returned, so callers see their tightest quota.
    ///
    /// # Errors
    ///
    /// `InvalidKeyInput` when the request's identity cannot be keyed, and
    /// `StoreUnavailable` when the store fails for a fail-closed rule. Store
    /// failures on fail-open rules skip that rule.
    pub async fn evaluate(&self, ctx: &RequestContext) -> Result<Decision> {
        let now = self.clock.now();
        let rules = self.registry.snapshot();
        let mut binding: Option<Decision> = None;

        trace!(ip = %ctx.ip, path = %ctx.path, method = %ctx.method, "Evaluating request");

        for rule in rules.rules_for(ctx) {
            let key = CounterKey::compose(rule.scope, rule.identifier(ctx), rule.action.as_deref())
                .map_err(|err| {
                    self.metrics.record_invalid_key();
                    debug!(rule = %rule.name, error = %err, "Cannot key request");
                    err
                })?;

            let outcome = match self.increment(&key, rule, now).await {
                Ok(outcome) => outcome,
                Err(err) if err.is_store_failure() => {
                    self.metrics.record_store_failure();
                    match rule.failure_mode {
                        FailureMode::FailOpen => {
                            warn!(
                                rule = %rule.name,
                                key = %key,
                                error = %err,
                                "Counter store failed, skipping rule (fail-open)"
                            );
                            continue;
                        }
                        FailureMode::FailClosed => {
                            warn!(
                                rule = %rule.name,
                                key = %key,
                                error = %err,
                                "Counter store failed, refusing request (fail-closed)"
                            );
                            return Err(LimiterError::StoreUnavailable(format!(
                                "rule '{}': {}",
                                rule.name, err
                            )));
                        }
                    }
                }
                Err(err) => return Err(err),
            };

            let decision = Decision::from_outcome(rule, &outcome, now);
            if !decision.allowed {
                self.metrics.record_denied();
                debug!(
                    rule = %rule.name,
                    key = %key,
                    count = outcome.count,
                    limit = rule.limit,
                    "Rate limit exceeded"
                );
                return Ok(decision);
            }
            binding.get_or_insert(decision);
        }

        self.metrics.record_allowed();
        Ok(binding.unwrap_or_else(|| Decision::unmetered(now)))
    }

    async fn increment(
        &self,
        key: &CounterKey,
        rule: &RateLimitRule,
        now: DateTime<Utc>,
    ) -> Result<CounterOutcome> {
        tokio::time::timeout(
            self.store_timeout,
            self.store.increment_and_check(key, rule.limit, rule.window, now),
        )
        .await
        .map_err(|_| {
            LimiterError::StoreUnavailable(format!(
                "{} store did not answer within {:?}",
                self.store.backend_name(),
                self.store_timeout
            ))
        })?
    }

    /// The registry this limiter reads rules from.
    pub fn registry(&self) -> &Arc<RuleRegistry> {
        &self.registry
    }

    /// The counter store.
    pub fn store(&self) -> &Arc<dyn CounterStore> {
        &self.store
    }

    /// Operational counters.
    pub fn metrics(&self) -> &LimiterMetrics {
        &self.metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;
    use crate::ratelimit::counter::CounterSnapshot;
    use crate::ratelimit::memory::MemoryCounterStore;
    use crate::ratelimit::rules::{RequestMatcher, RuleSet, Scope};
    use async_trait::async_trait;

    const MINUTE: Duration = Duration::from_secs(60);
    const HOUR: Duration = Duration::from_secs(3600);

    fn standard_rules() -> RuleSet {
        RuleSet::new(vec![
            RateLimitRule::new("ip", Scope::Ip, 60, MINUTE).unwrap(),
            RateLimitRule::new("user", Scope::User, 100, MINUTE)
                .unwrap()
                .with_action("api"),
            RateLimitRule::new("login", Scope::Action, 5, HOUR)
                .unwrap()
                .with_action("login")
                .with_failure_mode(FailureMode::FailClosed)
                .matching(RequestMatcher::new(["/login"], ["POST"])),
        ])
        .unwrap()
    }

    fn limiter_with(store: Arc<dyn CounterStore>, rules: RuleSet) -> (RateLimiter, ManualClock) {
        let clock = ManualClock::at_millis(1_700_000_040_000);
        let limiter = RateLimiter::new(store, Arc::new(RuleRegistry::new(rules)))
            .with_clock(Arc::new(clock.clone()));
        (limiter, clock)
    }

    async fn peek(store: &MemoryCounterStore, key: CounterKey, window: Duration, clock: &ManualClock) -> Option<CounterSnapshot> {
        store.peek(&key, window, clock.now()).await.unwrap()
    }

    /// A store that is always down.
    #[derive(Debug)]
    struct UnavailableStore;

    #[async_trait]
    impl CounterStore for UnavailableStore {
        async fn increment_and_check(
            &self,
            _key: &CounterKey,
            _limit: u64,
            _window: Duration,
            _now: DateTime<Utc>,
        ) -> Result<CounterOutcome> {
            Err(LimiterError::StoreUnavailable("connection refused".to_string()))
        }

        async fn peek(
            &self,
            _key: &CounterKey,
            _window: Duration,
            _now: DateTime<Utc>,
        ) -> Result<Option<CounterSnapshot>> {
            Err(LimiterError::StoreUnavailable("connection refused".to_string()))
        }

        fn backend_name(&self) -> &'static str {
            "unavailable"
        }
    }

    /// A store that never answers in time.
    #[derive(Debug)]
    struct StalledStore;

    #[async_trait]
    impl CounterStore for StalledStore {
        async fn increment_and_check(
            &self,
            _key: &CounterKey,
            _limit: u64,
            _window: Duration,
            _now: DateTime<Utc>,
        ) -> Result<CounterOutcome> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Err(LimiterError::StoreUnavailable("unreachable".to_string()))
        }

        async fn peek(
            &self,
            _key: &CounterKey,
            _window: Duration,
            _now: DateTime<Utc>,
        ) -> Result<Option<CounterSnapshot>> {
            Ok(None)
        }

        fn backend_name(&self) -> &'static str {
            "stalled"
        }
    }

    #[tokio::test]
    async fn test_anonymous_request_uses_ip_tier() {
        let (limiter, clock) = limiter_with(Arc::new(MemoryCounterStore::new()), standard_rules());
        let ctx = RequestContext::new("1.2.3.4", "GET", "/api/items");

        let decision = limiter.evaluate(&ctx).await.unwrap();
        let quota = decision.quota.unwrap();
        assert!(decision.allowed);
        assert_eq!(quota.rule, "ip");
        assert_eq!(quota.limit, 60);
        assert_eq!(quota.remaining, 59);
        assert!(quota.reset_at > clock.now());
    }

    #[tokio::test]
    async fn test_allowed_decision_reports_most_specific_rule() {
        let (limiter, _clock) = limiter_with(Arc::new(MemoryCounterStore::new()), standard_rules());
        let ctx = RequestContext::new("1.2.3.4", "POST", "/login").with_user("u1");

        for attempt in 1..=5u64 {
            let decision = limiter.evaluate(&ctx).await.unwrap();
            assert!(decision.allowed);
            let quota = decision.quota.unwrap();
            assert_eq!(quota.rule, "login");
            assert_eq!((quota.limit, quota.remaining), (5, 5 - attempt));
        }
        assert!(!limiter.evaluate(&ctx).await.unwrap().allowed);

        // Without a matching action rule the user tier binds.
        let browse = RequestContext::new("1.2.3.4", "GET", "/api/items").with_user("u1");
        let quota = limiter.evaluate(&browse).await.unwrap().quota.unwrap();
        assert_eq!(quota.rule, "user");
        assert_eq!(quota.limit, 100);
    }

    #[tokio::test]
    async fn test_ip_tier_denies_61st_request() {
        let (limiter, clock) = limiter_with(Arc::new(MemoryCounterStore::new()), standard_rules());
        let ctx = RequestContext::new("1.2.3.4", "GET", "/api/items");

        for i in 1..=60 {
            let decision = limiter.evaluate(&ctx).await.unwrap();
            assert!(decision.allowed, "request {} should be allowed", i);
            clock.advance(Duration::from_millis(500));
        }

        let decision = limiter.evaluate(&ctx).await.unwrap();
        assert!(!decision.allowed);
        let retry_after = decision.retry_after().unwrap();
        assert!(retry_after > Duration::ZERO && retry_after <= MINUTE);
        assert_eq!(limiter.metrics().snapshot().denied, 1);
        assert_eq!(limiter.metrics().snapshot().allowed, 60);
    }

    #[tokio::test]
    async fn test_action_denial_short_circuits_looser_tiers() {
        let store = Arc::new(MemoryCounterStore::new());
        let (limiter, clock) = limiter_with(store.clone(), standard_rules());
        let ctx = RequestContext::new("1.2.3.4", "POST", "/login").with_user("u1");

        for _ in 0..5 {
            assert!(limiter.evaluate(&ctx).await.unwrap().allowed);
        }

        let decision = limiter.evaluate(&ctx).await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.quota.as_ref().unwrap().rule, "login");

        let user_key = CounterKey::compose(Scope::User, "u1", Some("api")).unwrap();
        let ip_key = CounterKey::compose(Scope::Ip, "1.2.3.4", None).unwrap();
        assert_eq!(peek(&store, user_key, MINUTE, &clock).await.unwrap().current, 5);
        assert_eq!(peek(&store, ip_key, MINUTE, &clock).await.unwrap().current, 5);
    }

    #[tokio::test]
    async fn test_denied_first_request_leaves_later_tiers_untouched() {
        let store = Arc::new(MemoryCounterStore::new());
        let rules = RuleSet::new(vec![
            RateLimitRule::new("ip", Scope::Ip, 60, MINUTE).unwrap(),
            RateLimitRule::new("reset", Scope::Action, 1, HOUR)
                .unwrap()
                .with_action("password-reset")
                .matching(RequestMatcher::new(["/password-reset"], Vec::<String>::new())),
        ])
        .unwrap();
        let (limiter, clock) = limiter_with(store.clone(), rules);
        let ctx = RequestContext::new("5.6.7.8", "POST", "/password-reset");

        assert!(limiter.evaluate(&ctx).await.unwrap().allowed);
        assert!(!limiter.evaluate(&ctx).await.unwrap().allowed);

        let ip_key = CounterKey::compose(Scope::Ip, "5.6.7.8", None).unwrap();
        assert_eq!(peek(&store, ip_key, MINUTE, &clock).await.unwrap().current, 1);
    }

    #[tokio::test]
    async fn test_login_limit_independent_of_ip_budget() {
        let (limiter, _clock) = limiter_with(Arc::new(MemoryCounterStore::new()), standard_rules());
        let login = RequestContext::new("1.2.3.4", "POST", "/login");

        for _ in 0..5 {
            assert!(limiter.evaluate(&login).await.unwrap().allowed);
        }
        let decision = limiter.evaluate(&login).await.unwrap();
        assert!(!decision.allowed);

        // The IP tier still has budget for other paths.
        let browse = RequestContext::new("1.2.3.4", "GET", "/api/items");
        let decision = limiter.evaluate(&browse).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.quota.unwrap().remaining, 54);
    }

    #[tokio::test]
    async fn test_empty_ip_is_invalid_key_input() {
        let (limiter, _clock) = limiter_with(Arc::new(MemoryCounterStore::new()), standard_rules());
        let ctx = RequestContext::new("", "GET", "/");

        let err = limiter.evaluate(&ctx).await.unwrap_err();
        assert!(matches!(err, LimiterError::InvalidKeyInput(_)));
        assert_eq!(limiter.metrics().snapshot().invalid_keys, 1);
    }

    #[tokio::test]
    async fn test_fail_open_skips_rule() {
        let (limiter, _clock) = limiter_with(Arc::new(UnavailableStore), standard_rules());
        let ctx = RequestContext::new("1.2.3.4", "GET", "/api/items").with_user("u1");

        let decision = limiter.evaluate(&ctx).await.unwrap();
        assert!(decision.allowed);
        assert!(decision.quota.is_none());
        assert_eq!(limiter.metrics().snapshot().store_failures, 2);
    }

    #[tokio::test]
    async fn test_fail_closed_returns_store_unavailable() {
        let (limiter, _clock) = limiter_with(Arc::new(UnavailableStore), standard_rules());
        let ctx = RequestContext::new("1.2.3.4", "POST", "/login");

        let err = limiter.evaluate(&ctx).await.unwrap_err();
        assert!(matches!(err, LimiterError::StoreUnavailable(_)));
    }

    #[tokio::test]
    async fn test_store_timeout_is_bounded() {
        let (limiter, _clock) = limiter_with(Arc::new(StalledStore), standard_rules());
        let limiter = limiter.with_store_timeout(Duration::from_millis(20));

        let started = std::time::Instant::now();
        let login = RequestContext::new("1.2.3.4", "POST", "/login");
        let err = limiter.evaluate(&login).await.unwrap_err();
        assert!(matches!(err, LimiterError::StoreUnavailable(_)));
        assert!(started.elapsed() < Duration::from_secs(5));

        let browse = RequestContext::new("1.2.3.4", "GET", "/");
        assert!(limiter.evaluate(&browse).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_no_rules_is_unmetered() {
        let (limiter, _clock) = limiter_with(Arc::new(MemoryCounterStore::new()), RuleSet::empty());
        let decision = limiter.evaluate(&RequestContext::new("1.2.3.4", "GET", "/")).await.unwrap();
        assert!(decision.allowed);
        assert!(decision.quota.is_none());
    }

    #[tokio::test]
    async fn test_registry_swap_applies_to_next_evaluation() {
        let (limiter, _clock) = limiter_with(Arc::new(MemoryCounterStore::new()), standard_rules());
        let ctx = RequestContext::new("9.9.9.9", "GET", "/");
        assert_eq!(limiter.evaluate(&ctx).await.unwrap().quota.unwrap().limit, 60);

        limiter.registry().replace(
            RuleSet::new(vec![RateLimitRule::new("ip", Scope::Ip, 2, MINUTE).unwrap()]).unwrap(),
        );
        let decision = limiter.evaluate(&ctx).await.unwrap();
        assert_eq!(decision.quota.as_ref().unwrap().limit, 2);
        assert!(decision.allowed);
        assert!(!limiter.evaluate(&ctx).await.unwrap().allowed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_evaluations_admit_exactly_limit() {
        let rules = RuleSet::new(vec![RateLimitRule::new("ip", Scope::Ip, 25, MINUTE).unwrap()])
            .unwrap();
        let (limiter, _clock) = limiter_with(Arc::new(MemoryCounterStore::new()), rules);
        let limiter = Arc::new(limiter);

        let tasks: Vec<_> = (0..75)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move {
                    let ctx = RequestContext::new("7.7.7.7", "GET", "/");
                    limiter.evaluate(&ctx).await.unwrap().allowed
                })
            })
            .collect();

        let allowed = futures::future::join_all(tasks)
            .await
            .into_iter()
            .filter(|r| *r.as_ref().unwrap())
            .count();
        assert_eq!(allowed, 25);
        assert_eq!(limiter.metrics().snapshot().denied, 50);
    }
}
