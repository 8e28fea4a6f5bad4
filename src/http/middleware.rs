//! actix-web middleware that runs every request through the limiter.

use std::future::{ready, Future, Ready};
use std::pin::Pin;
use std::rc::Rc;
use std::sync::Arc;

use actix_web::body::EitherBody;
use actix_web::dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform};
use actix_web::Error;
use tracing::{debug, warn};

use super::client::request_context;
use super::response::{apply_quota_headers, limiter_error_response, too_many_requests};
use crate::ratelimit::{PathPattern, RateLimiter};

/// Whether a path bypasses rate limiting entirely.
pub fn is_exempt(exempt: &[PathPattern], path: &str) -> bool {
    exempt.iter().any(|pattern| pattern.matches(path))
}

/// Middleware factory.
///
/// Allowed responses get quota headers; denied requests never reach the
/// wrapped service.
#[derive(Debug, Clone)]
pub struct RateLimitMiddleware {
    limiter: Arc<RateLimiter>,
    exempt: Arc<Vec<PathPattern>>,
}

impl RateLimitMiddleware {
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        Self {
            limiter,
            exempt: Arc::new(Vec::new()),
        }
    }

    /// Paths that skip the limiter.
    pub fn with_exempt_paths(mut self, exempt: Vec<PathPattern>) -> Self {
        self.exempt = Arc::new(exempt);
        self
    }
}

impl<S, B> Transform<S, ServiceRequest> for RateLimitMiddleware
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Transform = RateLimitMiddlewareService<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(RateLimitMiddlewareService {
            service: Rc::new(service),
            limiter: self.limiter.clone(),
            exempt: self.exempt.clone(),
        }))
    }
}

pub struct RateLimitMiddlewareService<S> {
    service: Rc<S>,
    limiter: Arc<RateLimiter>,
    exempt: Arc<Vec<PathPattern>>,
}

impl<S, B> Service<ServiceRequest> for RateLimitMiddlewareService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>>>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let service = self.service.clone();

        if is_exempt(&self.exempt, req.path()) {
            return Box::pin(async move {
                let res = service.call(req).await?;
                Ok(res.map_into_left_body())
            });
        }

        let limiter = self.limiter.clone();
        Box::pin(async move {
            let ctx = request_context(req.request());

            let decision = match limiter.evaluate(&ctx).await {
                Ok(decision) => decision,
                Err(err) => {
                    debug!(error = %err, path = %ctx.path, "Request not evaluated");
                    let response = limiter_error_response(&err);
                    return Ok(req.into_response(response).map_into_right_body());
                }
            };

            if !decision.allowed {
                if let Some(quota) = &decision.quota {
                    warn!(
                        rule = %quota.rule,
                        ip = %ctx.ip,
                        path = %ctx.path,
                        "Rate limit exceeded"
                    );
                }
                let response = too_many_requests(&decision);
                return Ok(req.into_response(response).map_into_right_body());
            }

            let mut res = service.call(req).await?;
            apply_quota_headers(res.headers_mut(), &decision);
            Ok(res.map_into_left_body())
        })
    }
}
