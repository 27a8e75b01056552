use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use pagebeacon::{config, db, geoip, rollup, web};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (before any other initialization)
    let _ = dotenvy::dotenv();

    // Load configuration
    let config = config::Config::load()?;

    // RUST_LOG wins over the configured level when set
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.to_lowercase()));

    // Use LOG_FORMAT=gcp for structured GCP Cloud Logging
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    if log_format == "gcp" {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_stackdriver::layer())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    info!(
        "Starting Pagebeacon ({} mode)...",
        config.server.environment
    );

    // Initialize database
    let db = db::Database::new(&config.database).await?;
    db.run_migrations().await?;
    info!("Database initialized");

    // Initialize geolocation
    let geo = geoip::GeoResolver::from_config(&config.geoip);
    if geo.is_available() {
        info!("GeoIP enabled ({})", config.geoip.provider);
    } else {
        info!("GeoIP disabled, public addresses will be recorded as unknown");
    }

    if config.rollup.enabled {
        rollup::start_background_task(
            Arc::new(db.clone()),
            Duration::from_secs(config.rollup.interval_secs),
        );
    }

    let state = Arc::new(web::AppState::new(config, db, geo));

    // Start web server (blocking)
    web::start_server(state).await?;

    Ok(())
}
