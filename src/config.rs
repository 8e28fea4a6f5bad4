//! Configuration management for Tiergate.
//!
//! Settings are layered: built-in defaults, then an optional YAML file, then
//! environment variables prefixed with `TIERGATE` and using `__` as the
//! nesting separator (e.g. `TIERGATE__LIMITS__IP_PER_MINUTE__LIMIT=120`).

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{LimiterError, Result};
use crate::ratelimit::{
    FailureMode, PathPattern, RateLimitRule, RequestMatcher, RuleConfig, RuleSet, Scope,
};

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "TIERGATE";

/// Main configuration for the Tiergate service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Counter store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Rate limit rules
    #[serde(default)]
    pub limits: LimitsConfig,
}

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP bind address
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,

    /// Paths that bypass the limiter (a trailing `*` matches a prefix)
    #[serde(default = "default_exempt_paths")]
    pub exempt_paths: Vec<String>,

    /// Rule reload interval in seconds (0 disables reloading)
    #[serde(default = "default_reload_interval")]
    pub reload_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            exempt_paths: default_exempt_paths(),
            reload_interval_secs: default_reload_interval(),
        }
    }
}

impl ServerConfig {
    /// Parsed exempt path patterns.
    pub fn exempt_patterns(&self) -> Vec<PathPattern> {
        self.exempt_paths.iter().map(|p| PathPattern::parse(p)).collect()
    }
}

fn default_bind_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

fn default_exempt_paths() -> Vec<String> {
    vec!["/health".to_string(), "/docs*".to_string()]
}

fn default_reload_interval() -> u64 {
    60
}

/// Counter store backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process map, limits are per instance
    #[default]
    Memory,
    /// Shared Redis server
    Redis,
}

/// Counter store configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Which backend to use
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Prefix for Redis keys
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Bound on a single store operation in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Bound on connecting to the store in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// How often the in-memory store drops expired counters, in seconds
    #[serde(default = "default_purge_interval")]
    pub purge_interval_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            redis_url: default_redis_url(),
            key_prefix: default_key_prefix(),
            timeout_ms: default_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            purge_interval_secs: default_purge_interval(),
        }
    }
}

impl StoreConfig {
    /// Store operation timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_key_prefix() -> String {
    "tiergate".to_string()
}

fn default_timeout_ms() -> u64 {
    250
}

fn default_connect_timeout_ms() -> u64 {
    2000
}

fn default_purge_interval() -> u64 {
    60
}

/// One named limit: a count per window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitSpec {
    /// Whether the rule is active
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Maximum events per window
    pub limit: u64,

    /// Window length in seconds
    pub window_secs: u64,

    /// Behaviour when the store is unavailable
    #[serde(default)]
    pub failure_mode: FailureMode,

    /// Paths counted (action limits only)
    #[serde(default)]
    pub paths: Vec<String>,

    /// Methods counted (action limits only, empty means all)
    #[serde(default)]
    pub methods: Vec<String>,
}

fn default_enabled() -> bool {
    true
}

impl LimitSpec {
    fn new(limit: u64, window_secs: u64) -> Self {
        Self {
            enabled: true,
            limit,
            window_secs,
            failure_mode: FailureMode::FailOpen,
            paths: Vec::new(),
            methods: Vec::new(),
        }
    }

    fn action(limit: u64, window_secs: u64, paths: &[&str]) -> Self {
        Self {
            failure_mode: FailureMode::FailClosed,
            paths: paths.iter().map(|p| p.to_string()).collect(),
            methods: vec!["POST".to_string()],
            ..Self::new(limit, window_secs)
        }
    }

    fn to_rule(&self, name: &str, scope: Scope, action: Option<&str>) -> Result<RateLimitRule> {
        let mut rule = RateLimitRule::new(name, scope, self.limit, Duration::from_secs(self.window_secs))?
            .with_failure_mode(self.failure_mode);
        if let Some(action) = action {
            rule = rule.with_action(action);
        }
        if scope == Scope::Action {
            rule = rule.matching(RequestMatcher::new(&self.paths, &self.methods));
        }
        Ok(rule)
    }
}

/// The named limits every deployment carries, plus optional extra rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Requests per IP per minute
    #[serde(default = "default_ip_per_minute")]
    pub ip_per_minute: LimitSpec,

    /// Requests per authenticated user per minute (keyed under `api`)
    #[serde(default = "default_user_per_minute")]
    pub user_per_minute: LimitSpec,

    /// Login attempts per IP per hour
    #[serde(default = "default_login_per_hour")]
    pub login_per_hour: LimitSpec,

    /// Password reset requests per IP per day
    #[serde(default = "default_password_reset_per_day")]
    pub password_reset_per_day: LimitSpec,

    /// Additional rules
    #[serde(default)]
    pub extra: Vec<RuleConfig>,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            ip_per_minute: default_ip_per_minute(),
            user_per_minute: default_user_per_minute(),
            login_per_hour: default_login_per_hour(),
            password_reset_per_day: default_password_reset_per_day(),
            extra: Vec::new(),
        }
    }
}

fn default_ip_per_minute() -> LimitSpec {
    LimitSpec::new(60, 60)
}

fn default_user_per_minute() -> LimitSpec {
    LimitSpec::new(100, 60)
}

fn default_login_per_hour() -> LimitSpec {
    LimitSpec::action(5, 3600, &["/login", "/api/auth/login"])
}

fn default_password_reset_per_day() -> LimitSpec {
    LimitSpec::action(
        3,
        86_400,
        &[
            "/password-reset",
            "/api/auth/forgot-password",
            "/api/auth/reset-password",
        ],
    )
}

impl LimitsConfig {
    /// Validate the limits and build the rule set.
    pub fn to_rule_set(&self) -> Result<RuleSet> {
        let named = [
            ("ip_per_minute", &self.ip_per_minute, Scope::Ip, None),
            ("user_per_minute", &self.user_per_minute, Scope::User, Some("api")),
            ("login_per_hour", &self.login_per_hour, Scope::Action, Some("login")),
            (
                "password_reset_per_day",
                &self.password_reset_per_day,
                Scope::Action,
                Some("password-reset"),
            ),
        ];

        let mut rules = Vec::with_capacity(named.len() + self.extra.len());
        for (name, limits, scope, action) in named {
            if limits.enabled {
                rules.push(limits.to_rule(name, scope, action)?);
            }
        }
        for extra in &self.extra {
            rules.push(RateLimitRule::try_from(extra.clone())?);
        }

        RuleSet::new(rules)
    }
}

impl ServiceConfig {
    /// Load configuration from defaults, an optional YAML file and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&ServiceConfig::default())?);

        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration file");
            if !path.exists() {
                return Err(LimiterError::Configuration(format!(
                    "configuration file {} does not exist",
                    path.display()
                )));
            }
            builder = builder.add_source(File::from(path).format(FileFormat::Yaml));
        }

        let config: ServiceConfig = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("server.exempt_paths"),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML string layered over the defaults.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: ServiceConfig = Config::builder()
            .add_source(Config::try_from(&ServiceConfig::default())?)
            .add_source(File::from_str(yaml, FileFormat::Yaml))
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Check everything that would otherwise only fail at first use.
    pub fn validate(&self) -> Result<()> {
        if self.store.timeout_ms == 0 {
            return Err(LimiterError::Configuration(
                "store.timeout_ms must be positive".to_string(),
            ));
        }
        self.limits.to_rule_set().map(|_| ())
    }
}
