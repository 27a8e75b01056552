//! Configuration management

use anyhow::Result;
use serde::Deserialize;
use url::Url;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub geoip: GeoIpConfig,
    pub cors: CorsConfig,
    pub rollup: RollupConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// "development" or "production"
    pub environment: String,
    /// Address recorded for beacons sent from pages opened via file://
    pub local_placeholder_ip: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            environment: "development".to_string(),
            local_placeholder_ip: "127.0.0.1".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite file path, or ":memory:"
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "pagebeacon.db".to_string(),
            max_connections: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GeoIpConfig {
    /// "http", "maxmind" or "none"
    pub provider: String,
    /// Lookup URL for the http provider; `{ip}` is replaced with the address
    pub endpoint: String,
    /// GeoLite2-City database for the maxmind provider
    pub database: String,
    pub timeout_ms: u64,
}

impl Default for GeoIpConfig {
    fn default() -> Self {
        Self {
            provider: "http".to_string(),
            endpoint: "http://ip-api.com/json/{ip}?fields=status,message,country,regionName,city"
                .to_string(),
            database: String::new(),
            timeout_ms: 3000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CorsConfig {
    pub allowed_origins: Vec<String>,
    /// Accept `Origin: null` (pages opened from disk, sandboxed iframes)
    pub allow_null_origin: bool,
    /// Accept http(s)://localhost, 127.0.0.1 and [::1] on any port.
    /// Unset means "everywhere except production".
    pub allow_localhost: Option<bool>,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: Vec::new(),
            allow_null_origin: true,
            allow_localhost: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RollupConfig {
    pub enabled: bool,
    pub interval_secs: u64,
}

impl Default for RollupConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let builder = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("BEACON")
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("cors.allowed_origins")
                    .try_parsing(true),
            )
            // Hosting platforms hand out the listen port as a bare PORT
            .set_override_option("server.port", std::env::var("PORT").ok())?;

        let settings = builder.build()?;
        let config: Config = settings.try_deserialize()?;

        // Validate configuration
        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        // Validate server config
        if self.server.port == 0 {
            anyhow::bail!("Invalid port: 0 is not allowed");
        }
        if self.server.host.is_empty() {
            anyhow::bail!("Server host cannot be empty");
        }
        if self.server.environment != "development" && self.server.environment != "production" {
            anyhow::bail!(
                "Invalid environment '{}'. Must be 'development' or 'production'",
                self.server.environment
            );
        }
        if self.server.local_placeholder_ip.parse::<std::net::IpAddr>().is_err() {
            anyhow::bail!(
                "local_placeholder_ip '{}' is not an IP address",
                self.server.local_placeholder_ip
            );
        }

        // Validate database config
        if self.database.url.is_empty() {
            anyhow::bail!("Database URL cannot be empty");
        }
        if self.database.max_connections == 0 {
            anyhow::bail!("database.max_connections must be at least 1");
        }

        // Validate geolocation config
        match self.geoip.provider.as_str() {
            "http" => {
                if !self.geoip.endpoint.contains("{ip}") {
                    anyhow::bail!("geoip.endpoint must contain an {{ip}} placeholder");
                }
            }
            "maxmind" => {
                if self.geoip.database.is_empty() {
                    anyhow::bail!("geoip.database is required for the maxmind provider");
                }
            }
            "none" => {}
            other => anyhow::bail!(
                "Invalid geoip provider '{}'. Must be 'http', 'maxmind' or 'none'",
                other
            ),
        }
        if self.geoip.timeout_ms == 0 {
            anyhow::bail!("geoip.timeout_ms must be greater than 0");
        }

        // Validate CORS allow-list
        for origin in &self.cors.allowed_origins {
            let parsed = Url::parse(origin)
                .map_err(|e| anyhow::anyhow!("Invalid CORS origin '{}': {}", origin, e))?;
            let bare = parsed.path() == "/" && parsed.query().is_none() && parsed.fragment().is_none();
            if parsed.host_str().is_none() || !bare {
                anyhow::bail!("Invalid CORS origin '{}': expected scheme://host[:port]", origin);
            }
        }

        if self.rollup.interval_secs == 0 {
            anyhow::bail!("rollup.interval_secs must be greater than 0");
        }

        // Validate logging level
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid logging level '{}'. Must be one of: {:?}",
                self.logging.level,
                valid_levels
            );
        }

        Ok(())
    }

    pub fn is_production(&self) -> bool {
        self.server.environment == "production"
    }

    /// Whether localhost origins pass the CORS policy
    pub fn allow_localhost_origins(&self) -> bool {
        self.cors.allow_localhost.unwrap_or(!self.is_production())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert!(config.allow_localhost_origins());
    }

    #[test]
    fn production_disables_localhost_unless_overridden() {
        let mut config = Config::default();
        config.server.environment = "production".to_string();
        assert!(!config.allow_localhost_origins());

        config.cors.allow_localhost = Some(true);
        assert!(config.allow_localhost_origins());
    }

    #[test]
    fn rejects_origin_with_path() {
        let mut config = Config::default();
        config.cors.allowed_origins = vec!["https://example.com/app".to_string()];
        assert!(config.validate().is_err());

        config.cors.allowed_origins = vec!["https://example.com".to_string()];
        assert!(config.validate().is_ok());
    }

    #[test]
    fn maxmind_requires_database_path() {
        let mut config = Config::default();
        config.geoip.provider = "maxmind".to_string();
        assert!(config.validate().is_err());

        config.geoip.database = "GeoLite2-City.mmdb".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_unknown_environment_and_level() {
        let mut config = Config::default();
        config.server.environment = "staging".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.logging.level = "verbose".to_string();
        assert!(config.validate().is_err());
    }
}
