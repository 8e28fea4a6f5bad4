//! Per-request input to the evaluator.

use serde::{Deserialize, Serialize};

/// What the limiter knows about an inbound request.
///
/// The caller resolves the client address (proxy headers included) and the
/// authenticated user before building this; both are opaque strings here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestContext {
    /// Client IP address
    pub ip: String,
    /// Authenticated user identifier, if any
    #[serde(default)]
    pub user_id: Option<String>,
    /// Request path without query string
    pub path: String,
    /// HTTP method
    pub method: String,
}

impl RequestContext {
    /// Create a context for an unauthenticated request.
    pub fn new(ip: impl Into<String>, method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            user_id: None,
            path: path.into(),
            method: method.into(),
        }
    }

    /// Attach an authenticated user.
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// The user id, treating a blank value as unauthenticated.
    pub fn user(&self) -> Option<&str> {
        self.user_id.as_deref().filter(|u| !u.trim().is_empty())
    }
}
