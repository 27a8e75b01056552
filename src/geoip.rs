//! IP geolocation with graceful degradation
//!
//! Lookups go through a [`GeoProvider`] (an HTTP lookup service or a local
//! MaxMind GeoLite2 database). [`GeoResolver::resolve`] never fails: local
//! addresses short-circuit to the `localhost` sentinel and every provider
//! error or timeout degrades to `unknown`.

use async_trait::async_trait;
use maxminddb::{geoip2, Reader};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::GeoIpConfig;

const UNKNOWN: &str = "unknown";
const LOCALHOST: &str = "localhost";

/// Best-effort location of a client address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub city: String,
    pub region: String,
    pub country: String,
}

impl Location {
    pub fn unknown() -> Self {
        Self {
            city: UNKNOWN.to_string(),
            region: UNKNOWN.to_string(),
            country: UNKNOWN.to_string(),
        }
    }

    pub fn localhost() -> Self {
        Self {
            city: LOCALHOST.to_string(),
            region: LOCALHOST.to_string(),
            country: LOCALHOST.to_string(),
        }
    }

    /// Build from provider fields, filling gaps with `unknown`
    pub fn from_parts(city: Option<String>, region: Option<String>, country: Option<String>) -> Self {
        let or_unknown = |v: Option<String>| {
            v.filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| UNKNOWN.to_string())
        };
        Self {
            city: or_unknown(city),
            region: or_unknown(region),
            country: or_unknown(country),
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.city == UNKNOWN && self.region == UNKNOWN && self.country == UNKNOWN
    }
}

#[derive(Debug, Error)]
pub enum GeoError {
    #[error("geolocation request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("geolocation provider rejected lookup: {0}")]
    Rejected(String),

    #[error("geolocation database error: {0}")]
    Database(String),

    #[error("geolocation lookup timed out after {0:?}")]
    Timeout(Duration),
}

/// A source of IP-to-location data
#[async_trait]
pub trait GeoProvider: Send + Sync {
    async fn lookup(&self, ip: IpAddr) -> Result<Location, GeoError>;
}

/// Lookup against an ip-api.com compatible JSON endpoint
pub struct HttpGeoProvider {
    client: reqwest::Client,
    endpoint: String,
}

#[derive(Debug, Deserialize)]
struct IpApiResponse {
    status: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    city: Option<String>,
    #[serde(default, rename = "regionName")]
    region_name: Option<String>,
    #[serde(default)]
    country: Option<String>,
}

impl IpApiResponse {
    fn into_location(self) -> Result<Location, GeoError> {
        if self.status != "success" {
            return Err(GeoError::Rejected(
                self.message.unwrap_or_else(|| self.status.clone()),
            ));
        }
        Ok(Location::from_parts(self.city, self.region_name, self.country))
    }
}

impl HttpGeoProvider {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, GeoError> {
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
        })
    }
}

#[async_trait]
impl GeoProvider for HttpGeoProvider {
    async fn lookup(&self, ip: IpAddr) -> Result<Location, GeoError> {
        let url = self.endpoint.replace("{ip}", &ip.to_string());
        let body: IpApiResponse = self
            .client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        body.into_location()
    }
}

/// Lookup against a local MaxMind GeoLite2-City database
pub struct MaxMindProvider {
    reader: Reader<Vec<u8>>,
}

impl MaxMindProvider {
    pub fn open(database_path: &str) -> Result<Self, GeoError> {
        let reader = Reader::open_readfile(Path::new(database_path))
            .map_err(|e| GeoError::Database(e.to_string()))?;
        Ok(Self { reader })
    }
}

#[async_trait]
impl GeoProvider for MaxMindProvider {
    async fn lookup(&self, ip: IpAddr) -> Result<Location, GeoError> {
        let found = self
            .reader
            .lookup(ip)
            .map_err(|e| GeoError::Database(e.to_string()))?;
        let record: Option<geoip2::City> = found
            .decode()
            .map_err(|e| GeoError::Database(e.to_string()))?;

        Ok(record.as_ref().map(city_location).unwrap_or_else(Location::unknown))
    }
}

/// English names from a GeoLite2-City record; country falls back to its ISO code
fn city_location(record: &geoip2::City<'_>) -> Location {
    let city = record.city.names.english.map(str::to_string);
    let region = record
        .subdivisions
        .first()
        .and_then(|sub| sub.names.english)
        .map(str::to_string);
    let country = record
        .country
        .names
        .english
        .or(record.country.iso_code)
        .map(str::to_string);

    Location::from_parts(city, region, country)
}

/// Resolves client addresses to locations, one provider call at most
#[derive(Clone)]
pub struct GeoResolver {
    provider: Option<Arc<dyn GeoProvider>>,
    timeout: Duration,
}

impl GeoResolver {
    pub fn new(provider: Option<Arc<dyn GeoProvider>>, timeout: Duration) -> Self {
        Self { provider, timeout }
    }

    /// Resolver that never calls out; every public address is `unknown`
    pub fn disabled() -> Self {
        Self::new(None, Duration::from_secs(1))
    }

    /// Build the provider named in the config. A provider that cannot be
    /// initialised disables lookups instead of failing startup.
    pub fn from_config(config: &GeoIpConfig) -> Self {
        let timeout = Duration::from_millis(config.timeout_ms);
        let provider: Option<Arc<dyn GeoProvider>> = match config.provider.as_str() {
            "http" => match HttpGeoProvider::new(&config.endpoint, timeout) {
                Ok(p) => {
                    info!("GeoIP lookups via {}", config.endpoint);
                    Some(Arc::new(p))
                }
                Err(e) => {
                    warn!("Failed to build GeoIP HTTP client: {}", e);
                    None
                }
            },
            "maxmind" => {
                if !Path::new(&config.database).exists() {
                    warn!("GeoIP database not found at: {}", config.database);
                    warn!(
                        "Download GeoLite2-City.mmdb from MaxMind and place it at: {}",
                        config.database
                    );
                    None
                } else {
                    match MaxMindProvider::open(&config.database) {
                        Ok(p) => {
                            info!("GeoIP database loaded: {}", config.database);
                            Some(Arc::new(p))
                        }
                        Err(e) => {
                            warn!("Failed to load GeoIP database: {}", e);
                            None
                        }
                    }
                }
            }
            _ => None,
        };
        Self::new(provider, timeout)
    }

    pub fn is_available(&self) -> bool {
        self.provider.is_some()
    }

    /// Resolve `ip` to a location. Never fails.
    pub async fn resolve(&self, ip: &str) -> Location {
        let addr: IpAddr = match ip.trim().parse() {
            Ok(addr) => addr,
            Err(_) => {
                debug!(ip, "unparseable client address, skipping geolocation");
                return Location::unknown();
            }
        };

        if is_local_ip(&addr) {
            return Location::localhost();
        }

        let Some(provider) = self.provider.as_ref() else {
            return Location::unknown();
        };

        let outcome = match tokio::time::timeout(self.timeout, provider.lookup(addr)).await {
            Ok(result) => result,
            Err(_) => Err(GeoError::Timeout(self.timeout)),
        };

        match outcome {
            Ok(location) => location,
            Err(e) => {
                warn!(%addr, error = %e, "geolocation failed, recording unknown location");
                Location::unknown()
            }
        }
    }
}

/// Check if an address is loopback or otherwise not publicly routable
pub fn is_local_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(ipv4) => {
            ipv4.is_loopback()
                || ipv4.is_private()
                || ipv4.is_link_local()
                || ipv4.is_unspecified()
        }
        IpAddr::V6(ipv6) => {
            if let Some(mapped) = ipv6.to_ipv4_mapped() {
                return is_local_ip(&IpAddr::V4(mapped));
            }
            let first = ipv6.segments()[0];
            ipv6.is_loopback()
                || ipv6.is_unspecified()
                // fc00::/7 unique local
                || (first & 0xfe00) == 0xfc00
                // fe80::/10 link local
                || (first & 0xffc0) == 0xfe80
        }
    }
}
