//! HTTP route handlers

use axum::{
    body::Bytes,
    extract::{rejection::QueryRejection, ConnectInfo, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::json;
use std::{net::SocketAddr, sync::Arc};

use super::middleware::source_addr;
use super::AppState;
use crate::aggregate::{aggregate, AggregationResult};
use crate::db::Event;
use crate::error::AppError;
use crate::ingest::{ingest, EventInput};

/// GET /health
pub async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

/// POST /api/event
///
/// The body is parsed as JSON whatever its content type:
/// `navigator.sendBeacon` posts strings as `text/plain`.
pub async fn post_event(
    State(state): State<Arc<AppState>>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, AppError> {
    let payload: EventInput = serde_json::from_slice(&body)
        .map_err(|e| AppError::Validation(format!("invalid event payload: {e}")))?;

    let source = source_addr(&headers, peer.map(|ConnectInfo(addr)| addr));
    let ip = source.normalized(&state.config.server.local_placeholder_ip);

    let event = ingest(state.events.as_ref(), &state.geo, payload, ip).await?;
    tracing::info!(
        id = %event.id,
        page = event.page.as_deref().unwrap_or("-"),
        ip = %event.ip_address,
        "event recorded"
    );

    Ok((StatusCode::CREATED, Json(event)))
}

/// GET /api/events/:session_id
pub async fn get_session_events(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Json<Vec<Event>>, AppError> {
    let events = state
        .events
        .by_session(&session_id)
        .await
        .map_err(AppError::query("Failed to retrieve events"))?;
    Ok(Json(events))
}

/// Default and maximum page size for `GET /api/events`
pub const DEFAULT_RECENT_LIMIT: i64 = 100;
pub const MAX_RECENT_LIMIT: i64 = 1000;

#[derive(Debug, Deserialize)]
pub struct RecentQuery {
    pub limit: Option<i64>,
}

/// GET /api/events?limit=
///
/// Newest first. `limit` is clamped to 1..=MAX_RECENT_LIMIT.
pub async fn get_recent_events(
    State(state): State<Arc<AppState>>,
    query: Result<Query<RecentQuery>, QueryRejection>,
) -> Result<Json<Vec<Event>>, AppError> {
    let Query(query) = query.map_err(|e| AppError::Validation(e.body_text()))?;
    let limit = query
        .limit
        .unwrap_or(DEFAULT_RECENT_LIMIT)
        .clamp(1, MAX_RECENT_LIMIT);

    let events = state
        .events
        .recent(limit)
        .await
        .map_err(AppError::query("Failed to retrieve events"))?;
    Ok(Json(events))
}

#[derive(Debug, Deserialize)]
pub struct AggregateQuery {
    pub page: String,
    #[serde(default)]
    pub date: Option<String>,
}

/// GET /api/aggregated-data?page=&date=
pub async fn get_aggregated_data(
    State(state): State<Arc<AppState>>,
    query: Result<Query<AggregateQuery>, QueryRejection>,
) -> Result<Json<AggregationResult>, AppError> {
    let Query(query) = query.map_err(|e| AppError::Validation(e.body_text()))?;

    if query.page.is_empty() {
        return Err(AppError::Validation("page is required".to_string()));
    }

    // `?date=` with no value means no date filter
    let date = query.date.filter(|d| !d.is_empty());
    if let Some(date) = &date {
        NaiveDate::parse_from_str(date, "%Y-%m-%d")
            .map_err(|_| AppError::Validation(format!("invalid date '{date}', expected YYYY-MM-DD")))?;
    }

    let records = state
        .aggregates
        .query(&query.page, date.as_deref())
        .await
        .map_err(AppError::query("Failed to retrieve aggregated data"))?;

    Ok(Json(aggregate(&records)))
}
