//! Rate limiting logic and state management.

mod clock;
mod context;
mod counter;
mod decision;
mod evaluator;
mod key;
mod memory;
mod metrics;
mod redis;
mod registry;
mod rules;
mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use context::RequestContext;
pub use counter::{CounterOutcome, CounterSnapshot};
pub use decision::{Decision, Quota};
pub use evaluator::{RateLimiter, DEFAULT_STORE_TIMEOUT};
pub use key::CounterKey;
pub use memory::MemoryCounterStore;
pub use metrics::{LimiterMetrics, MetricsSnapshot};
pub use self::redis::RedisCounterStore;
pub use registry::RuleRegistry;
pub use rules::{
    FailureMode, PathPattern, RateLimitRule, RequestMatcher, RuleConfig, RuleSet, Scope, MAX_WINDOW,
};
pub use store::CounterStore;
