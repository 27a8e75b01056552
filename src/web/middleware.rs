//! Request middleware and client address extraction
//!
//! The origin guard turns away browser requests from origins outside the
//! allow-list before they reach a handler, so a disallowed page cannot
//! write events even when it ignores CORS (e.g. `no-cors` beacons).

use axum::{
    body::Body,
    http::{header, HeaderMap, Request},
    response::{IntoResponse, Response},
};
use futures::future::BoxFuture;
use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
    task::{Context, Poll},
};
use tower::{Layer, Service};
use tracing::debug;

use super::cors::OriginPolicy;
use crate::error::AppError;
use crate::ingest::SourceAddr;

/// Get the real client IP address, checking proxy headers first
/// Priority: X-Real-IP > X-Forwarded-For (first IP) > socket address
fn get_real_ip(headers: &HeaderMap, fallback_ip: Option<IpAddr>) -> String {
    // Try X-Real-IP first (set by Caddy/nginx)
    if let Some(real_ip) = headers.get("x-real-ip") {
        if let Ok(ip) = real_ip.to_str() {
            let ip = ip.trim();
            if !ip.is_empty() {
                return strip_port(ip).to_string();
            }
        }
    }

    // Try X-Forwarded-For (may contain chain of IPs, first is original client)
    if let Some(forwarded) = headers.get("x-forwarded-for") {
        if let Ok(ips) = forwarded.to_str() {
            if let Some(first_ip) = ips.split(',').next() {
                let ip = first_ip.trim();
                if !ip.is_empty() {
                    return strip_port(ip).to_string();
                }
            }
        }
    }

    // Fallback to direct connection IP
    fallback_ip
        .map(|ip| ip.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Drop a trailing `:port` from an address, leaving bare IPv6 intact.
/// `1.2.3.4:80` -> `1.2.3.4`, `[::1]:80` -> `::1`, `::1` -> `::1`
pub fn strip_port(addr: &str) -> &str {
    if addr.parse::<IpAddr>().is_ok() {
        return addr;
    }
    if let Some(rest) = addr.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            return &rest[..end];
        }
    }
    match addr.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') && port.chars().all(|c| c.is_ascii_digit()) => host,
        _ => addr,
    }
}

/// Page opened from disk: browsers send `Origin: null` or a file:// origin
fn is_file_origin(headers: &HeaderMap) -> bool {
    headers
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .map(|o| {
            let o = o.trim();
            o == "null" || o.starts_with("file:")
        })
        .unwrap_or(false)
}

/// Client address of a request as the ingest pipeline sees it
pub fn source_addr(headers: &HeaderMap, peer: Option<SocketAddr>) -> SourceAddr {
    SourceAddr {
        ip: get_real_ip(headers, peer.map(|addr| addr.ip())),
        file_origin: is_file_origin(headers),
    }
}

/// Layer that rejects requests whose `Origin` is not allowed
#[derive(Clone)]
pub struct OriginGuardLayer {
    policy: Arc<OriginPolicy>,
}

impl OriginGuardLayer {
    pub fn new(policy: OriginPolicy) -> Self {
        Self {
            policy: Arc::new(policy),
        }
    }
}

impl<S> Layer<S> for OriginGuardLayer {
    type Service = OriginGuard<S>;

    fn layer(&self, inner: S) -> Self::Service {
        OriginGuard {
            inner,
            policy: self.policy.clone(),
        }
    }
}

/// Middleware service enforcing the origin allow-list
#[derive(Clone)]
pub struct OriginGuard<S> {
    inner: S,
    policy: Arc<OriginPolicy>,
}

impl<S> Service<Request<Body>> for OriginGuard<S>
where
    S: Service<Request<Body>, Response = Response> + Send + Clone + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<Body>) -> Self::Future {
        // Requests without an Origin (curl, server-to-server) are not
        // browser cross-origin calls and pass through.
        let rejected = request
            .headers()
            .get(header::ORIGIN)
            .map(|v| v.to_str().map(|o| !self.policy.allows(o)).unwrap_or(true))
            .unwrap_or(false);

        if rejected {
            debug!(
                origin = ?request.headers().get(header::ORIGIN),
                path = %request.uri().path(),
                "rejecting request from disallowed origin"
            );
            let response = AppError::Forbidden.into_response();
            return Box::pin(async move { Ok::<_, S::Error>(response) });
        }

        let mut inner = self.inner.clone();
        Box::pin(async move { inner.call(request).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn strips_ports_but_keeps_bare_ipv6() {
        assert_eq!(strip_port("203.0.113.5:51234"), "203.0.113.5");
        assert_eq!(strip_port("203.0.113.5"), "203.0.113.5");
        assert_eq!(strip_port("[2001:db8::1]:443"), "2001:db8::1");
        assert_eq!(strip_port("[::1]"), "::1");
        assert_eq!(strip_port("2001:db8::1"), "2001:db8::1");
        assert_eq!(strip_port("::ffff:10.0.0.1"), "::ffff:10.0.0.1");
    }

    #[test]
    fn proxy_headers_take_priority() {
        let peer: SocketAddr = "10.0.0.2:4000".parse().unwrap();

        let mut headers = HeaderMap::new();
        assert_eq!(source_addr(&headers, Some(peer)).ip, "10.0.0.2");

        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.5:999, 10.0.0.1"));
        assert_eq!(source_addr(&headers, Some(peer)).ip, "203.0.113.5");

        headers.insert("x-real-ip", HeaderValue::from_static("198.51.100.1"));
        assert_eq!(source_addr(&headers, Some(peer)).ip, "198.51.100.1");

        assert_eq!(source_addr(&HeaderMap::new(), None).ip, "unknown");
    }

    #[test]
    fn detects_file_origin() {
        let mut headers = HeaderMap::new();
        assert!(!source_addr(&headers, None).file_origin);

        headers.insert(header::ORIGIN, HeaderValue::from_static("null"));
        assert!(source_addr(&headers, None).file_origin);

        headers.insert(header::ORIGIN, HeaderValue::from_static("file://"));
        assert!(source_addr(&headers, None).file_origin);

        headers.insert(header::ORIGIN, HeaderValue::from_static("https://example.com"));
        assert!(!source_addr(&headers, None).file_origin);
    }
}
