//! HTTP surface: middleware, forward-auth endpoint and server.

mod client;
mod middleware;
mod response;
mod server;
mod service;

pub use client::{request_context, resolve_client_ip, AuthenticatedUser};
pub use middleware::{is_exempt, RateLimitMiddleware};
pub use response::{
    apply_quota_headers, limiter_error_response, quota_headers, too_many_requests, ErrorBody,
    RejectionBody, X_RATELIMIT_LIMIT, X_RATELIMIT_REMAINING, X_RATELIMIT_RESET,
};
pub use server::HttpGateway;
pub use service::{check, forwarded_context, health, routes, GatewayState};
