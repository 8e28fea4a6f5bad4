//! Mapping decisions and limiter errors onto HTTP responses.

use actix_web::http::header::{HeaderMap, HeaderName, HeaderValue, RETRY_AFTER};
use actix_web::HttpResponse;
use chrono::SecondsFormat;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::LimiterError;
use crate::ratelimit::Decision;

/// Maximum events in the binding window.
pub const X_RATELIMIT_LIMIT: &str = "x-ratelimit-limit";
/// Estimated events left in the binding window.
pub const X_RATELIMIT_REMAINING: &str = "x-ratelimit-remaining";
/// Unix time (seconds) at which the binding window resets.
pub const X_RATELIMIT_RESET: &str = "x-ratelimit-reset";

/// Body of a 429 response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectionBody {
    pub error: String,
    pub message: String,
    /// RFC 3339 time at which the caller may retry
    pub retry_after: String,
}

impl RejectionBody {
    /// Build the body for a denied decision.
    pub fn from_decision(decision: &Decision) -> Self {
        let (message, retry_after) = match (&decision.quota, decision.retry_after()) {
            (Some(quota), Some(wait)) => (
                format!(
                    "Too many requests: limit of {} reached for {}. Try again in {} seconds.",
                    quota.limit,
                    quota.action.as_deref().unwrap_or(quota.scope.prefix()),
                    wait.as_secs()
                ),
                quota.reset_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            ),
            _ => (
                "Too many requests. Please slow down.".to_string(),
                decision.evaluated_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            ),
        };

        Self {
            error: "Rate limit exceeded".to_string(),
            message,
            retry_after,
        }
    }
}

/// Body of a 400 or 503 limiter failure response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
}

/// Quota headers for a decision.
///
/// Unmetered decisions produce no headers. Denied decisions also carry
/// `Retry-After`.
pub fn quota_headers(decision: &Decision) -> Vec<(HeaderName, HeaderValue)> {
    let quota = match &decision.quota {
        Some(quota) => quota,
        None => return Vec::new(),
    };

    let mut headers = vec![
        (HeaderName::from_static(X_RATELIMIT_LIMIT), HeaderValue::from(quota.limit)),
        (
            HeaderName::from_static(X_RATELIMIT_REMAINING),
            HeaderValue::from(quota.remaining),
        ),
        (
            HeaderName::from_static(X_RATELIMIT_RESET),
            HeaderValue::from(quota.reset_at.timestamp()),
        ),
    ];

    if !decision.allowed {
        if let Some(wait) = decision.retry_after() {
            headers.push((RETRY_AFTER, HeaderValue::from(wait.as_secs())));
        }
    }
    headers
}

/// Attach quota headers to an outgoing response.
pub fn apply_quota_headers(headers: &mut HeaderMap, decision: &Decision) {
    for (name, value) in quota_headers(decision) {
        headers.insert(name, value);
    }
}

/// 429 response for a denied decision.
pub fn too_many_requests(decision: &Decision) -> HttpResponse {
    let mut response = HttpResponse::TooManyRequests();
    for header in quota_headers(decision) {
        response.insert_header(header);
    }
    response.json(RejectionBody::from_decision(decision))
}

/// Response for a limiter that could not reach a decision.
///
/// Unkeyable requests are rejected as bad requests; an unavailable store
/// (fail-closed rules only) is reported as 503.
pub fn limiter_error_response(err: &LimiterError) -> HttpResponse {
    match err {
        LimiterError::InvalidKeyInput(reason) => HttpResponse::BadRequest().json(ErrorBody {
            error: "Bad request".to_string(),
            message: format!("Cannot identify caller: {}", reason),
        }),
        other => {
            warn!(error = %other, "Rate limiter unavailable");
            HttpResponse::ServiceUnavailable()
                .insert_header((RETRY_AFTER, HeaderValue::from(1u64)))
                .json(ErrorBody {
                    error: "Rate limiter unavailable".to_string(),
                    message: "The request could not be checked. Please retry shortly.".to_string(),
                })
        }
    }
}
