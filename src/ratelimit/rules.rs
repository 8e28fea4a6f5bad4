//! Rate limit rules and request matching.
//!
//! Rules are validated once, when a [`RuleSet`] is built, and are immutable
//! afterwards. A rule set keeps its rules ordered most specific first:
//! action rules, then user rules, then IP rules.

use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::context::RequestContext;
use crate::error::{LimiterError, Result};

/// Longest window a rule may use.
pub const MAX_WINDOW: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// The dimension a rate limit applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    /// Per client IP address
    Ip,
    /// Per authenticated user
    User,
    /// Per client IP, for one named sensitive action
    Action,
}

impl Scope {
    /// Key namespace prefix.
    pub fn prefix(&self) -> &'static str {
        match self {
            Scope::Ip => "ip",
            Scope::User => "user",
            Scope::Action => "action",
        }
    }

    /// Evaluation rank; lower runs first.
    fn rank(&self) -> u8 {
        match self {
            Scope::Action => 0,
            Scope::User => 1,
            Scope::Ip => 2,
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

/// What to do when the counter store cannot be reached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    /// Skip the rule and let the request through
    #[default]
    FailOpen,
    /// Refuse the request
    FailClosed,
}

/// A path pattern: exact match, or prefix match when it ends in `*`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathPattern {
    Exact(String),
    Prefix(String),
}

impl PathPattern {
    /// Parse a configured pattern.
    pub fn parse(pattern: &str) -> Self {
        match pattern.strip_suffix('*') {
            Some(prefix) => PathPattern::Prefix(prefix.to_string()),
            None => PathPattern::Exact(pattern.to_string()),
        }
    }

    /// Whether `path` matches this pattern.
    pub fn matches(&self, path: &str) -> bool {
        match self {
            PathPattern::Exact(exact) => {
                path == exact || path.strip_suffix('/').map_or(false, |p| p == exact)
            }
            PathPattern::Prefix(prefix) => path.starts_with(prefix.as_str()),
        }
    }
}

/// Selects the requests an action rule counts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestMatcher {
    paths: Vec<PathPattern>,
    methods: Vec<String>,
}

impl RequestMatcher {
    /// Build a matcher from path patterns and (optional) methods.
    pub fn new<P, M>(paths: P, methods: M) -> Self
    where
        P: IntoIterator,
        P::Item: AsRef<str>,
        M: IntoIterator,
        M::Item: AsRef<str>,
    {
        Self {
            paths: paths
                .into_iter()
                .map(|p| PathPattern::parse(p.as_ref()))
                .collect(),
            methods: methods
                .into_iter()
                .map(|m| m.as_ref().trim().to_ascii_uppercase())
                .filter(|m| !m.is_empty())
                .collect(),
        }
    }

    /// Whether the matcher lists no paths at all.
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Whether a request with this method and path is selected.
    ///
    /// An empty method list accepts every method.
    pub fn matches(&self, method: &str, path: &str) -> bool {
        let method_ok = self.methods.is_empty()
            || self.methods.iter().any(|m| m.eq_ignore_ascii_case(method));
        method_ok && self.paths.iter().any(|p| p.matches(path))
    }
}

/// Serializable rule definition as it appears in configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleConfig {
    /// Unique rule name
    pub name: String,
    /// Scope the rule counts against
    pub scope: Scope,
    /// Action name (required for action scope, key suffix otherwise)
    #[serde(default)]
    pub action: Option<String>,
    /// Maximum events per window
    pub limit: u64,
    /// Window length in seconds
    pub window_secs: u64,
    /// Behaviour when the store is unavailable
    #[serde(default)]
    pub failure_mode: FailureMode,
    /// Paths counted by an action rule
    #[serde(default)]
    pub paths: Vec<String>,
    /// Methods counted by an action rule (empty means all)
    #[serde(default)]
    pub methods: Vec<String>,
}

/// A validated rate limit rule.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitRule {
    /// Unique rule name
    pub name: String,
    /// Scope the rule counts against
    pub scope: Scope,
    /// Action name
    pub action: Option<String>,
    /// Maximum events per window
    pub limit: u64,
    /// Window length
    pub window: Duration,
    /// Behaviour when the store is unavailable
    pub failure_mode: FailureMode,
    matcher: RequestMatcher,
}

impl RateLimitRule {
    /// Create a rule, rejecting a zero limit or window.
    pub fn new(name: impl Into<String>, scope: Scope, limit: u64, window: Duration) -> Result<Self> {
        let name = name.into();
        if limit == 0 {
            return Err(LimiterError::Configuration(format!(
                "rule '{}': limit must be positive",
                name
            )));
        }
        if window.as_millis() == 0 {
            return Err(LimiterError::Configuration(format!(
                "rule '{}': window must be positive",
                name
            )));
        }
        if window > MAX_WINDOW {
            return Err(LimiterError::Configuration(format!(
                "rule '{}': window {:?} exceeds the maximum of {:?}",
                name, window, MAX_WINDOW
            )));
        }

        Ok(Self {
            name,
            scope,
            action: None,
            limit,
            window,
            failure_mode: FailureMode::default(),
            matcher: RequestMatcher::default(),
        })
    }

    /// Set the action name.
    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    /// Set the store failure policy.
    pub fn with_failure_mode(mut self, mode: FailureMode) -> Self {
        self.failure_mode = mode;
        self
    }

    /// Set the request matcher used by action rules.
    pub fn matching(mut self, matcher: RequestMatcher) -> Self {
        self.matcher = matcher;
        self
    }

    /// Whether this rule counts the given request.
    pub fn applies_to(&self, ctx: &RequestContext) -> bool {
        match self.scope {
            Scope::Ip => true,
            Scope::User => ctx.user().is_some(),
            Scope::Action => self.matcher.matches(&ctx.method, &ctx.path),
        }
    }

    /// The caller identifier this rule counts by.
    pub fn identifier<'a>(&self, ctx: &'a RequestContext) -> &'a str {
        match self.scope {
            Scope::Ip | Scope::Action => &ctx.ip,
            Scope::User => ctx.user().unwrap_or_default(),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(LimiterError::Configuration(
                "rule name must not be empty".to_string(),
            ));
        }
        if self.limit == 0 || self.window.as_millis() == 0 {
            return Err(LimiterError::Configuration(format!(
                "rule '{}': limit and window must be positive",
                self.name
            )));
        }
        if self.window > MAX_WINDOW {
            return Err(LimiterError::Configuration(format!(
                "rule '{}': window {:?} exceeds the maximum of {:?}",
                self.name, self.window, MAX_WINDOW
            )));
        }
        if let Some(action) = &self.action {
            if action.trim().is_empty() {
                return Err(LimiterError::Configuration(format!(
                    "rule '{}': action name must not be empty",
                    self.name
                )));
            }
        }
        if self.scope == Scope::Action {
            if self.action.is_none() {
                return Err(LimiterError::Configuration(format!(
                    "rule '{}': action scope requires an action name",
                    self.name
                )));
            }
            if self.matcher.is_empty() {
                return Err(LimiterError::Configuration(format!(
                    "rule '{}': action scope requires at least one path",
                    self.name
                )));
            }
        }
        Ok(())
    }
}

impl TryFrom<RuleConfig> for RateLimitRule {
    type Error = LimiterError;

    fn try_from(config: RuleConfig) -> Result<Self> {
        let mut rule = RateLimitRule::new(
            config.name,
            config.scope,
            config.limit,
            Duration::from_secs(config.window_secs),
        )?
        .with_failure_mode(config.failure_mode)
        .matching(RequestMatcher::new(&config.paths, &config.methods));
        rule.action = config.action;
        rule.validate()?;
        Ok(rule)
    }
}

/// An immutable, ordered set of validated rules.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<RateLimitRule>,
}

impl RuleSet {
    /// Validate and order rules, most specific scope first.
    ///
    /// Rules within the same scope keep their given order.
    pub fn new(mut rules: Vec<RateLimitRule>) -> Result<Self> {
        let mut names = HashSet::new();
        for rule in &rules {
            rule.validate()?;
            if !names.insert(rule.name.as_str()) {
                return Err(LimiterError::Configuration(format!(
                    "duplicate rule name '{}'",
                    rule.name
                )));
            }
        }

        rules.sort_by_key(|rule| rule.scope.rank());
        Ok(Self { rules })
    }

    /// A rule set that limits nothing.
    pub fn empty() -> Self {
        Self::default()
    }

    /// All rules in evaluation order.
    pub fn rules(&self) -> &[RateLimitRule] {
        &self.rules
    }

    /// Look up a rule by name.
    pub fn get(&self, name: &str) -> Option<&RateLimitRule> {
        self.rules.iter().find(|rule| rule.name == name)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// The rules that apply to a request, in evaluation order.
    pub fn rules_for<'a>(
        &'a self,
        ctx: &'a RequestContext,
    ) -> impl Iterator<Item = &'a RateLimitRule> + 'a {
        self.rules.iter().filter(move |rule| rule.applies_to(ctx))
    }
}
