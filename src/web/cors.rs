//! Origin allow-list shared by the CORS layer and the origin guard

use axum::http::{header, request::Parts, HeaderValue, Method};
use std::collections::HashSet;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::warn;
use url::{Host, Url};

use crate::config::Config;

/// Which browser origins may post beacons and read data
#[derive(Debug, Clone, Default)]
pub struct OriginPolicy {
    /// Serialized `scheme://host[:port]` origins
    exact: HashSet<String>,
    allow_null: bool,
    allow_localhost: bool,
}

impl OriginPolicy {
    pub fn new<I, S>(origins: I, allow_null: bool, allow_localhost: bool) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let exact = origins
            .into_iter()
            .filter_map(|o| match Url::parse(o.as_ref()) {
                Ok(url) => Some(url.origin().ascii_serialization()),
                Err(e) => {
                    warn!("Skipping invalid CORS origin '{}': {}", o.as_ref(), e);
                    None
                }
            })
            .collect();
        Self {
            exact,
            allow_null,
            allow_localhost,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            &config.cors.allowed_origins,
            config.cors.allow_null_origin,
            config.allow_localhost_origins(),
        )
    }

    /// Whether the value of an `Origin` header is acceptable
    pub fn allows(&self, origin: &str) -> bool {
        if origin == "null" {
            return self.allow_null;
        }

        let Ok(url) = Url::parse(origin) else {
            return false;
        };

        match url.scheme() {
            "file" => return self.allow_null,
            "http" | "https" => {}
            _ => return false,
        }

        if self.exact.contains(&url.origin().ascii_serialization()) {
            return true;
        }

        self.allow_localhost && is_localhost(&url)
    }
}

fn is_localhost(url: &Url) -> bool {
    match url.host() {
        Some(Host::Domain(domain)) => {
            let domain = domain.to_ascii_lowercase();
            domain == "localhost" || domain.ends_with(".localhost")
        }
        Some(Host::Ipv4(ip)) => ip.is_loopback(),
        Some(Host::Ipv6(ip)) => ip.is_loopback(),
        None => false,
    }
}

/// CORS headers for allowed origins
pub fn cors_layer(policy: OriginPolicy) -> CorsLayer {
    CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(move |origin: &HeaderValue, _parts: &Parts| {
            origin.to_str().map(|o| policy.allows(o)).unwrap_or(false)
        }))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> OriginPolicy {
        OriginPolicy::new(["https://shop.example.com", "http://example.org:8080/"], true, true)
    }

    #[test]
    fn exact_origins_match_after_normalisation() {
        let p = policy();
        assert!(p.allows("https://shop.example.com"));
        assert!(p.allows("https://shop.example.com:443"));
        assert!(p.allows("http://example.org:8080"));
        assert!(!p.allows("http://shop.example.com"));
        assert!(!p.allows("https://evil.shop.example.com"));
        assert!(!p.allows("http://example.org"));
    }

    #[test]
    fn localhost_matches_host_not_substring() {
        let p = policy();
        assert!(p.allows("http://localhost:3000"));
        assert!(p.allows("http://127.0.0.1:5500"));
        assert!(p.allows("http://[::1]:8080"));
        assert!(p.allows("http://app.localhost"));
        assert!(!p.allows("https://evillocalhost.com"));
        assert!(!p.allows("https://localhost.evil.com"));
    }

    #[test]
    fn null_and_file_origins_follow_flag() {
        assert!(policy().allows("null"));
        assert!(policy().allows("file:///home/me/index.html"));

        let strict = OriginPolicy::new(["https://shop.example.com"], false, false);
        assert!(!strict.allows("null"));
        assert!(!strict.allows("file:///index.html"));
        assert!(!strict.allows("http://localhost:3000"));
    }

    #[test]
    fn garbage_and_other_schemes_are_rejected() {
        let p = policy();
        assert!(!p.allows("not a url"));
        assert!(!p.allows(""));
        assert!(!p.allows("chrome-extension://abcdef"));
    }
}
