//! Database schema definitions

pub const CREATE_EVENTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS events (
    id TEXT PRIMARY KEY,
    session_id TEXT,
    page TEXT,
    referrer TEXT,
    screen_resolution TEXT,
    ip_address TEXT NOT NULL,
    city TEXT NOT NULL,
    region TEXT NOT NULL,
    country TEXT NOT NULL,
    timestamp BIGINT NOT NULL,  -- Unix epoch milliseconds
    properties TEXT             -- JSON object of any extra beacon fields
)
"#;

// Hourly rollups, one row per page/day/hour. Written by the rollup job or an
// external aggregation pipeline. Hours are not constrained here: readers
// discard anything outside 0-23.
pub const CREATE_PAGE_AGGREGATES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS page_aggregates (
    page TEXT NOT NULL,
    date TEXT NOT NULL,         -- YYYY-MM-DD (UTC)
    hour INTEGER NOT NULL,
    page_loads INTEGER NOT NULL DEFAULT 0,
    distinct_users INTEGER NOT NULL DEFAULT 0,
    new_users INTEGER NOT NULL DEFAULT 0,
    cumulative_daily_distinct_users INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (page, date, hour)
)
"#;

// For GET /api/events/:sessionId and first-seen lookups in the rollup
pub const CREATE_INDEX_SESSION: &str =
    "CREATE INDEX IF NOT EXISTS idx_events_session ON events(session_id, timestamp)";

// For the rollup's per-day scans
pub const CREATE_INDEX_TIMESTAMP: &str =
    "CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events(timestamp)";
