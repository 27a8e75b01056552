//! Database module

mod schema;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::str::FromStr;

use crate::config::DatabaseConfig;
use crate::geoip::Location;

/// A single page-view beacon, enriched at ingest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub session_id: Option<String>,
    pub page: Option<String>,
    pub referrer: Option<String>,
    pub screen_resolution: Option<String>,
    pub ip_address: String,
    pub location: Location,
    pub timestamp: DateTime<Utc>,
    /// Any other fields the client sent, kept verbatim
    #[serde(flatten)]
    pub properties: Map<String, Value>,
}

/// One pre-computed hour of traffic for a page
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregatedRecord {
    pub page: String,
    pub date: String,
    pub hour: i64,
    pub page_loads: i64,
    pub distinct_users: i64,
    pub new_users: i64,
    pub cumulative_daily_distinct_users: i64,
}

/// Append-only store of raw events
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Persist `event` and return the stored record
    async fn create(&self, event: &Event) -> Result<Event>;

    /// All events carrying `session_id`, oldest first
    async fn by_session(&self, session_id: &str) -> Result<Vec<Event>>;

    /// The `limit` most recent events, newest first
    async fn recent(&self, limit: i64) -> Result<Vec<Event>>;
}

/// Store of hourly rollup rows
#[async_trait]
pub trait AggregateStore: Send + Sync {
    /// Rows for `page`, restricted to `date` when given
    async fn query(&self, page: &str, date: Option<&str>) -> Result<Vec<AggregatedRecord>>;

    /// Insert or replace rows keyed by (page, date, hour)
    async fn upsert(&self, records: &[AggregatedRecord]) -> Result<()>;
}

type EventRow = (
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    String,
    String,
    String,
    String,
    i64,
    Option<String>,
);

type AggregateRow = (String, String, i64, i64, i64, i64, i64);

fn event_from_row(row: EventRow) -> Event {
    let (id, session_id, page, referrer, screen_resolution, ip_address, city, region, country, ts, properties) =
        row;
    Event {
        id,
        session_id,
        page,
        referrer,
        screen_resolution,
        ip_address,
        location: Location {
            city,
            region,
            country,
        },
        timestamp: DateTime::from_timestamp_millis(ts).unwrap_or_default(),
        properties: properties
            .and_then(|p| serde_json::from_str(&p).ok())
            .unwrap_or_default(),
    }
}

fn aggregate_from_row(row: AggregateRow) -> AggregatedRecord {
    let (page, date, hour, page_loads, distinct_users, new_users, cumulative_daily_distinct_users) = row;
    AggregatedRecord {
        page,
        date,
        hour,
        page_loads,
        distinct_users,
        new_users,
        cumulative_daily_distinct_users,
    }
}

#[derive(Clone)]
pub struct Database {
    pool: Pool<Sqlite>,
}

impl Database {
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let in_memory = matches!(config.url.as_str(), ":memory:" | "sqlite::memory:");

        let pool = if in_memory {
            // Every connection to :memory: is a separate database, so keep
            // exactly one alive for the lifetime of the pool.
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(SqliteConnectOptions::from_str("sqlite::memory:")?)
                .await?
        } else {
            let options = SqliteConnectOptions::new()
                .filename(&config.url)
                .create_if_missing(true);
            SqlitePoolOptions::new()
                .max_connections(config.max_connections)
                .connect_with(options)
                .await?
        };

        Ok(Self { pool })
    }

    /// Fresh, migrated in-memory database
    pub async fn in_memory() -> Result<Self> {
        let db = Self::new(&DatabaseConfig {
            url: ":memory:".to_string(),
            max_connections: 1,
        })
        .await?;
        db.run_migrations().await?;
        Ok(db)
    }

    pub async fn run_migrations(&self) -> Result<()> {
        // Enable WAL mode for better concurrency
        sqlx::query("PRAGMA journal_mode=WAL")
            .execute(&self.pool)
            .await?;
        sqlx::query("PRAGMA synchronous=NORMAL")
            .execute(&self.pool)
            .await?;

        sqlx::query(schema::CREATE_EVENTS_TABLE)
            .execute(&self.pool)
            .await?;
        sqlx::query(schema::CREATE_PAGE_AGGREGATES_TABLE)
            .execute(&self.pool)
            .await?;
        sqlx::query(schema::CREATE_INDEX_SESSION)
            .execute(&self.pool)
            .await?;
        sqlx::query(schema::CREATE_INDEX_TIMESTAMP)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// (page, session_id, timestamp_ms) of every event in `[start_ms, end_ms)`
    pub async fn page_views_between(
        &self,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<(Option<String>, Option<String>, i64)>> {
        let rows: Vec<(Option<String>, Option<String>, i64)> = sqlx::query_as(
            r#"
            SELECT page, session_id, timestamp
            FROM events
            WHERE timestamp >= ? AND timestamp < ?
            "#,
        )
        .bind(start_ms)
        .bind(end_ms)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Earliest event timestamp of every session active in `[start_ms, end_ms)`
    pub async fn session_first_seen(&self, start_ms: i64, end_ms: i64) -> Result<Vec<(String, i64)>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT session_id, MIN(timestamp)
            FROM events
            WHERE session_id IN (
                SELECT DISTINCT session_id FROM events
                WHERE timestamp >= ? AND timestamp < ? AND session_id IS NOT NULL
            )
            GROUP BY session_id
            "#,
        )
        .bind(start_ms)
        .bind(end_ms)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

#[async_trait]
impl EventStore for Database {
    async fn create(&self, event: &Event) -> Result<Event> {
        let properties = if event.properties.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&event.properties)?)
        };

        sqlx::query(
            r#"
            INSERT INTO events (id, session_id, page, referrer, screen_resolution, ip_address, city, region, country, timestamp, properties)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&event.id)
        .bind(&event.session_id)
        .bind(&event.page)
        .bind(&event.referrer)
        .bind(&event.screen_resolution)
        .bind(&event.ip_address)
        .bind(&event.location.city)
        .bind(&event.location.region)
        .bind(&event.location.country)
        .bind(event.timestamp.timestamp_millis())
        .bind(properties)
        .execute(&self.pool)
        .await?;

        Ok(event.clone())
    }

    async fn by_session(&self, session_id: &str) -> Result<Vec<Event>> {
        let rows: Vec<EventRow> = sqlx::query_as(
            r#"
            SELECT id, session_id, page, referrer, screen_resolution, ip_address, city, region, country, timestamp, properties
            FROM events
            WHERE session_id = ?
            ORDER BY timestamp ASC, id ASC
            "#,
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(event_from_row).collect())
    }

    async fn recent(&self, limit: i64) -> Result<Vec<Event>> {
        let rows: Vec<EventRow> = sqlx::query_as(
            r#"
            SELECT id, session_id, page, referrer, screen_resolution, ip_address, city, region, country, timestamp, properties
            FROM events
            ORDER BY timestamp DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(event_from_row).collect())
    }
}

#[async_trait]
impl AggregateStore for Database {
    async fn query(&self, page: &str, date: Option<&str>) -> Result<Vec<AggregatedRecord>> {
        let rows: Vec<AggregateRow> = sqlx::query_as(
            r#"
            SELECT page, date, hour, page_loads, distinct_users, new_users, cumulative_daily_distinct_users
            FROM page_aggregates
            WHERE page = ? AND (? IS NULL OR date = ?)
            ORDER BY date ASC, hour ASC
            "#,
        )
        .bind(page)
        .bind(date)
        .bind(date)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(aggregate_from_row).collect())
    }

    async fn upsert(&self, records: &[AggregatedRecord]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for record in records {
            sqlx::query(
                r#"
                INSERT INTO page_aggregates (page, date, hour, page_loads, distinct_users, new_users, cumulative_daily_distinct_users)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT (page, date, hour) DO UPDATE SET
                    page_loads = excluded.page_loads,
                    distinct_users = excluded.distinct_users,
                    new_users = excluded.new_users,
                    cumulative_daily_distinct_users = excluded.cumulative_daily_distinct_users
                "#,
            )
            .bind(&record.page)
            .bind(&record.date)
            .bind(record.hour)
            .bind(record.page_loads)
            .bind(record.distinct_users)
            .bind(record.new_users)
            .bind(record.cumulative_daily_distinct_users)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(id: &str, session: &str, ts_ms: i64) -> Event {
        Event {
            id: id.to_string(),
            session_id: Some(session.to_string()),
            page: Some("/home".to_string()),
            referrer: None,
            screen_resolution: Some("1920x1080".to_string()),
            ip_address: "203.0.113.5".to_string(),
            location: Location::unknown(),
            timestamp: DateTime::from_timestamp_millis(ts_ms).unwrap(),
            properties: Map::new(),
        }
    }

    fn record(page: &str, date: &str, hour: i64, page_loads: i64) -> AggregatedRecord {
        AggregatedRecord {
            page: page.to_string(),
            date: date.to_string(),
            hour,
            page_loads,
            distinct_users: 1,
            new_users: 0,
            cumulative_daily_distinct_users: 1,
        }
    }

    #[tokio::test]
    async fn session_query_returns_only_matching_events_in_time_order() {
        let db = Database::in_memory().await.unwrap();
        db.create(&event("b", "s1", 2_000)).await.unwrap();
        db.create(&event("a", "s1", 1_000)).await.unwrap();
        db.create(&event("c", "s2", 1_500)).await.unwrap();

        let events = db.by_session("s1").await.unwrap();
        let ids: Vec<&str> = events.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);

        assert!(db.by_session("nope").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn recent_returns_newest_first_up_to_limit() {
        let db = Database::in_memory().await.unwrap();
        db.create(&event("old", "s1", 1_000)).await.unwrap();
        db.create(&event("newest", "s2", 3_000)).await.unwrap();
        db.create(&event("middle", "s1", 2_000)).await.unwrap();

        let ids: Vec<String> = db.recent(2).await.unwrap().into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec!["newest", "middle"]);

        assert_eq!(db.recent(10).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn stored_event_round_trips_properties_and_location() {
        let db = Database::in_memory().await.unwrap();
        let mut original = event("x", "s9", 1_700_000_000_123);
        original.location = Location::from_parts(Some("Oslo".into()), None, Some("Norway".into()));
        original.properties.insert("language".into(), json!("nb-NO"));
        original.properties.insert("viewport".into(), json!({"w": 390, "h": 844}));

        db.create(&original).await.unwrap();
        let stored = db.by_session("s9").await.unwrap();
        assert_eq!(stored, vec![original]);
    }

    #[tokio::test]
    async fn duplicate_id_is_a_write_failure() {
        let db = Database::in_memory().await.unwrap();
        db.create(&event("dup", "s1", 1)).await.unwrap();
        assert!(db.create(&event("dup", "s1", 2)).await.is_err());
    }

    #[tokio::test]
    async fn aggregate_query_filters_by_page_and_optional_date() {
        let db = Database::in_memory().await.unwrap();
        db.upsert(&[
            record("/home", "2024-01-01", 9, 3),
            record("/home", "2024-01-02", 9, 4),
            record("/about", "2024-01-01", 9, 7),
        ])
        .await
        .unwrap();

        let one_day = AggregateStore::query(&db, "/home", Some("2024-01-01")).await.unwrap();
        assert_eq!(one_day.len(), 1);
        assert_eq!(one_day[0].page_loads, 3);

        let all_days = AggregateStore::query(&db, "/home", None).await.unwrap();
        assert_eq!(all_days.len(), 2);
    }

    #[tokio::test]
    async fn upsert_replaces_existing_hour() {
        let db = Database::in_memory().await.unwrap();
        db.upsert(&[record("/home", "2024-01-01", 9, 3)]).await.unwrap();
        db.upsert(&[record("/home", "2024-01-01", 9, 8)]).await.unwrap();

        let rows = AggregateStore::query(&db, "/home", Some("2024-01-01")).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].page_loads, 8);
    }
}
