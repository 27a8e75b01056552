//! Web server module

mod cors;
mod middleware;
mod routes;

pub use cors::OriginPolicy;

use anyhow::Result;
use axum::{
    routing::{get, post},
    Router,
};
use std::{net::SocketAddr, sync::Arc};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::Config;
use crate::db::{AggregateStore, Database, EventStore};
use crate::geoip::GeoResolver;

/// Everything a handler needs, built once at startup
pub struct AppState {
    pub config: Arc<Config>,
    pub events: Arc<dyn EventStore>,
    pub aggregates: Arc<dyn AggregateStore>,
    pub geo: GeoResolver,
}

impl AppState {
    pub fn new(config: Config, db: Database, geo: GeoResolver) -> Self {
        let db = Arc::new(db);
        Self {
            config: Arc::new(config),
            events: db.clone(),
            aggregates: db,
            geo,
        }
    }
}

/// Build the router with origin checks, CORS and request tracing.
///
/// Layers run outermost first: trace, CORS, origin guard, handler.
pub fn build_router(state: Arc<AppState>) -> Router {
    let policy = OriginPolicy::from_config(&state.config);

    Router::new()
        .route("/health", get(routes::health))
        .route("/api/event", post(routes::post_event))
        .route("/api/events", get(routes::get_recent_events))
        .route("/api/events/:session_id", get(routes::get_session_events))
        .route("/api/aggregated-data", get(routes::get_aggregated_data))
        .layer(middleware::OriginGuardLayer::new(policy.clone()))
        .layer(cors::cors_layer(policy))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn start_server(state: Arc<AppState>) -> Result<()> {
    let addr = format!("{}:{}", state.config.server.host, state.config.server.port);
    let app = build_router(state);

    info!("Web server starting on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
