//! Gateway endpoints: forward-auth check and health.

use std::sync::Arc;

use actix_web::http::header::HeaderMap;
use actix_web::{web, HttpRequest, HttpResponse};
use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, instrument};

use super::client::resolve_client_ip;
use super::middleware::is_exempt;
use super::response::{limiter_error_response, quota_headers, too_many_requests};
use crate::ratelimit::{MetricsSnapshot, PathPattern, RateLimiter, RequestContext};

/// Original request URI, set by the fronting proxy.
pub const X_FORWARDED_URI: &str = "x-forwarded-uri";
/// Original request method, set by the fronting proxy.
pub const X_FORWARDED_METHOD: &str = "x-forwarded-method";
/// Authenticated user id, set by the fronting proxy after authentication.
pub const X_USER_ID: &str = "x-user-id";

/// Shared state for the gateway endpoints.
#[derive(Debug, Clone)]
pub struct GatewayState {
    pub limiter: Arc<RateLimiter>,
    pub exempt: Arc<Vec<PathPattern>>,
}

impl GatewayState {
    pub fn new(limiter: Arc<RateLimiter>, exempt: Vec<PathPattern>) -> Self {
        Self {
            limiter,
            exempt: Arc::new(exempt),
        }
    }
}

/// Register the gateway routes.
pub fn routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/v1/check", web::to(check))
        .route("/health", web::get().to(health));
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

/// Rebuild the proxied request from forward-auth headers.
///
/// Falls back to the check request's own method and `/` when the proxy
/// does not forward them.
pub fn forwarded_context(req: &HttpRequest) -> RequestContext {
    let headers = req.headers();

    let ip = resolve_client_ip(headers, req.peer_addr()).unwrap_or_default();
    let path = header(headers, X_FORWARDED_URI)
        .map(|uri| uri.split(['?', '#']).next().unwrap_or(uri))
        .filter(|path| !path.is_empty())
        .unwrap_or("/")
        .to_string();
    let method = header(headers, X_FORWARDED_METHOD)
        .map(str::to_ascii_uppercase)
        .unwrap_or_else(|| req.method().as_str().to_string());

    RequestContext {
        ip,
        user_id: header(headers, X_USER_ID).map(str::to_string),
        path,
        method,
    }
}

/// Forward-auth decision endpoint.
///
/// Answers 200 with quota headers when the proxied request may proceed,
/// 429 when it is limited. The proxy relays either to the client.
#[instrument(skip(state, req), fields(uri = ?req.headers().get(X_FORWARDED_URI)))]
pub async fn check(state: web::Data<GatewayState>, req: HttpRequest) -> HttpResponse {
    let ctx = forwarded_context(&req);

    if is_exempt(&state.exempt, &ctx.path) {
        debug!(path = %ctx.path, "Exempt path");
        return HttpResponse::Ok().finish();
    }

    match state.limiter.evaluate(&ctx).await {
        Ok(decision) if decision.allowed => {
            let mut response = HttpResponse::Ok();
            for header in quota_headers(&decision) {
                response.insert_header(header);
            }
            response.finish()
        }
        Ok(decision) => {
            info!(ip = %ctx.ip, path = %ctx.path, "Forwarded request limited");
            too_many_requests(&decision)
        }
        Err(err) => limiter_error_response(&err),
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    timestamp: String,
    store: &'static str,
    rules: usize,
    metrics: MetricsSnapshot,
}

/// Liveness plus limiter counters.
pub async fn health(state: web::Data<GatewayState>) -> HttpResponse {
    let limiter = &state.limiter;
    HttpResponse::Ok().json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        timestamp: Utc::now().to_rfc3339(),
        store: limiter.store().backend_name(),
        rules: limiter.registry().snapshot().len(),
        metrics: limiter.metrics().snapshot(),
    })
}
