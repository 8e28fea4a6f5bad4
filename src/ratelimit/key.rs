//! Counter key composition.

use std::fmt;

use super::rules::Scope;
use crate::error::{LimiterError, Result};

/// A key that uniquely identifies one counter in a store.
///
/// Keys are namespaced by scope (`ip:`, `user:`, `action:`) and every
/// component is escaped, so keys from different scopes or actions can never
/// collide even when an identifier contains the separator (IPv6 addresses).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CounterKey(String);

impl CounterKey {
    /// Compose the key for a `(scope, identifier, action)` tuple.
    ///
    /// The identifier must be non-empty. Action-scoped keys require an
    /// action; for the other scopes an action only adds a namespace suffix
    /// (e.g. `user:42:api`).
    pub fn compose(scope: Scope, identifier: &str, action: Option<&str>) -> Result<Self> {
        let identifier = identifier.trim();
        if identifier.is_empty() {
            return Err(LimiterError::InvalidKeyInput(format!(
                "empty identifier for {} scope",
                scope
            )));
        }

        let action = match action.map(str::trim) {
            Some("") => {
                return Err(LimiterError::InvalidKeyInput(format!(
                    "empty action name for {} scope",
                    scope
                )))
            }
            other => other,
        };

        let key = match (scope, action) {
            (Scope::Action, Some(action)) => {
                format!("action:{}:{}", escape(action), escape(identifier))
            }
            (Scope::Action, None) => {
                return Err(LimiterError::InvalidKeyInput(
                    "action scope requires an action name".to_string(),
                ))
            }
            (scope, Some(action)) => {
                format!("{}:{}:{}", scope.prefix(), escape(identifier), escape(action))
            }
            (scope, None) => format!("{}:{}", scope.prefix(), escape(identifier)),
        };

        Ok(Self(key))
    }

    /// The key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CounterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CounterKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Percent-encode the separator and the escape character itself.
fn escape(component: &str) -> String {
    let mut out = String::with_capacity(component.len());
    for c in component.chars() {
        match c {
            '%' => out.push_str("%25"),
            ':' => out.push_str("%3A"),
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compose_ip_key() {
        let key = CounterKey::compose(Scope::Ip, "203.0.113.4", None).unwrap();
        assert_eq!(key.as_str(), "ip:203.0.113.4");
    }

    #[test]
    fn test_compose_user_key_with_namespace() {
        let key = CounterKey::compose(Scope::User, "9f2c", Some("api")).unwrap();
        assert_eq!(key.as_str(), "user:9f2c:api");
    }

    #[test]
    fn test_compose_action_key() {
        let key = CounterKey::compose(Scope::Action, "203.0.113.4", Some("login")).unwrap();
        assert_eq!(key.to_string(), "action:login:203.0.113.4");
    }

    #[test]
    fn test_compose_is_deterministic() {
        let a = CounterKey::compose(Scope::User, "alice", Some("api")).unwrap();
        let b = CounterKey::compose(Scope::User, "alice", Some("api")).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_scopes_never_collide() {
        let ip = CounterKey::compose(Scope::Ip, "1.2.3.4", None).unwrap();
        let user = CounterKey::compose(Scope::User, "1.2.3.4", None).unwrap();
        let action = CounterKey::compose(Scope::Action, "1.2.3.4", Some("ip")).unwrap();
        assert_ne!(ip, user);
        assert_ne!(ip, action);
        assert_ne!(user, action);
    }

    #[test]
    fn test_separator_in_identifier_is_escaped() {
        // "a:b" with action "c" must differ from "a" with action "b:c"
        let first = CounterKey::compose(Scope::User, "a:b", Some("c")).unwrap();
        let second = CounterKey::compose(Scope::User, "a", Some("b:c")).unwrap();
        assert_ne!(first, second);

        let ipv6 = CounterKey::compose(Scope::Ip, "::1", None).unwrap();
        assert_eq!(ipv6.as_str(), "ip:%3A%3A1");
    }

    #[test]
    fn test_empty_identifier_rejected() {
        let err = CounterKey::compose(Scope::Ip, "", None).unwrap_err();
        assert!(matches!(err, LimiterError::InvalidKeyInput(_)));

        let err = CounterKey::compose(Scope::User, "   ", Some("api")).unwrap_err();
        assert!(matches!(err, LimiterError::InvalidKeyInput(_)));
    }

    #[test]
    fn test_action_scope_requires_action() {
        let err = CounterKey::compose(Scope::Action, "1.2.3.4", None).unwrap_err();
        assert!(matches!(err, LimiterError::InvalidKeyInput(_)));

        let err = CounterKey::compose(Scope::Action, "1.2.3.4", Some("")).unwrap_err();
        assert!(matches!(err, LimiterError::InvalidKeyInput(_)));
    }
}
