//! HTTP server for the rate limiting gateway.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use actix_web::{web, App, HttpServer};
use tracing::{error, info};

use super::service::{routes, GatewayState};
use crate::error::Result;
use crate::ratelimit::{PathPattern, RateLimiter};

/// Serves the forward-auth check endpoint and health.
///
/// `/v1/check` evaluates the request described by forward-auth headers.
/// Applications embedding the limiter in their own actix app wrap their
/// routes with [`RateLimitMiddleware`](super::RateLimitMiddleware) instead.
pub struct HttpGateway {
    /// Address to bind to
    addr: SocketAddr,
    /// Shared limiter
    limiter: Arc<RateLimiter>,
    /// Paths that skip limiting
    exempt: Vec<PathPattern>,
}

impl HttpGateway {
    pub fn new(addr: SocketAddr, limiter: Arc<RateLimiter>, exempt: Vec<PathPattern>) -> Self {
        Self {
            addr,
            limiter,
            exempt,
        }
    }

    /// Run until `signal` resolves, then drain in-flight requests.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + 'static,
    {
        let state = web::Data::new(GatewayState::new(self.limiter.clone(), self.exempt.clone()));

        info!(addr = %self.addr, "Starting HTTP rate limit gateway");

        let server = HttpServer::new(move || {
            App::new().app_data(state.clone()).configure(routes)
        })
        .disable_signals()
        .bind(self.addr)
        .map_err(|e| {
            error!(addr = %self.addr, error = %e, "Failed to bind HTTP server");
            e
        })?
        .run();

        let handle = server.handle();
        actix_web::rt::spawn(async move {
            signal.await;
            info!("Stopping HTTP server");
            handle.stop(true).await;
        });

        server.await?;
        Ok(())
    }
}
