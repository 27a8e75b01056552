//! Beacon ingestion: enrich a client payload and persist it

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::debug;
use uuid::Uuid;

use crate::db::{Event, EventStore};
use crate::error::AppError;
use crate::geoip::GeoResolver;

/// Fields assigned by the server; client-supplied values are dropped
const RESERVED_KEYS: &[&str] = &["id", "ip_address", "location", "timestamp"];

/// Payload posted by the tracking script. Unknown fields are kept.
#[derive(Debug, Default, Deserialize)]
pub struct EventInput {
    #[serde(default)]
    pub page: Option<String>,
    #[serde(default)]
    pub referrer: Option<String>,
    #[serde(default)]
    pub screen_resolution: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Where a beacon came from, as seen by the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceAddr {
    /// Client address without any port suffix
    pub ip: String,
    /// The page was opened from disk (`Origin: null` or `file://`)
    pub file_origin: bool,
}

impl SourceAddr {
    /// Address to record: file-origin callers get `placeholder_ip`
    pub fn normalized(&self, placeholder_ip: &str) -> String {
        if self.file_origin {
            placeholder_ip.to_string()
        } else {
            self.ip.clone()
        }
    }
}

/// Resolve the location of `ip`, assign an id and write one event.
pub async fn ingest(
    store: &dyn EventStore,
    geo: &GeoResolver,
    payload: EventInput,
    ip: String,
) -> Result<Event, AppError> {
    let location = geo.resolve(&ip).await;

    let mut properties = payload.extra;
    for key in RESERVED_KEYS {
        properties.remove(*key);
    }

    // Storage keeps millisecond precision; match it so the response equals
    // what a later read returns.
    let now = Utc::now();
    let timestamp = DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now);

    let event = Event {
        id: Uuid::new_v4().to_string(),
        session_id: payload.session_id,
        page: payload.page,
        referrer: payload.referrer,
        screen_resolution: payload.screen_resolution,
        ip_address: ip,
        location,
        timestamp,
        properties,
    };

    let stored = store.create(&event).await.map_err(AppError::StorageWrite)?;
    debug!(id = %stored.id, page = ?stored.page, "event stored");
    Ok(stored)
}
