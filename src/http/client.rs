//! Resolving who is calling.

use std::net::{IpAddr, SocketAddr};

use actix_web::http::header::HeaderMap;
use actix_web::{HttpMessage, HttpRequest};

use crate::ratelimit::RequestContext;

pub const CF_CONNECTING_IP: &str = "cf-connecting-ip";
pub const X_FORWARDED_FOR: &str = "x-forwarded-for";
pub const X_REAL_IP: &str = "x-real-ip";

/// Authenticated user id, inserted into request extensions by whatever
/// authenticates the request upstream of the rate limiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser(pub String);

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

/// Client address for a request.
///
/// Precedence: `CF-Connecting-IP`, the first `X-Forwarded-For` entry,
/// `X-Real-IP`, then the socket peer. Returns `None` when nothing usable is
/// present; the evaluator rejects that as unkeyable.
pub fn resolve_client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> Option<String> {
    if let Some(ip) = header_str(headers, CF_CONNECTING_IP) {
        return Some(ip.to_string());
    }

    if let Some(first) = header_str(headers, X_FORWARDED_FOR)
        .and_then(|list| list.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
    {
        return Some(first.to_string());
    }

    if let Some(ip) = header_str(headers, X_REAL_IP) {
        return Some(ip.to_string());
    }

    peer.map(|addr| canonical_ip(addr.ip()).to_string())
}

// IPv4 peers on dual-stack sockets show up as mapped v6 addresses.
fn canonical_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(ip),
        v4 => v4,
    }
}

/// Build the limiter input for a request served by this process.
pub fn request_context(req: &HttpRequest) -> RequestContext {
    let ip = resolve_client_ip(req.headers(), req.peer_addr()).unwrap_or_default();
    let user_id = req
        .extensions()
        .get::<AuthenticatedUser>()
        .map(|user| user.0.clone());

    RequestContext {
        ip,
        user_id,
        path: req.path().to_string(),
        method: req.method().as_str().to_string(),
    }
}
