//! Hourly rollup job
//!
//! Recomputes `page_aggregates` rows for a UTC day from the raw events
//! table. Deployments that feed `page_aggregates` from an external pipeline
//! leave this disabled.

use anyhow::Result;
use chrono::{NaiveDate, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

use crate::aggregate::HOURS_PER_DAY;
use crate::db::{AggregateStore, AggregatedRecord, Database};

const HOUR_MS: i64 = 3_600_000;
const DAY_MS: i64 = 24 * HOUR_MS;

#[derive(Default)]
struct PageDay {
    loads: [i64; HOURS_PER_DAY],
    sessions: [HashSet<String>; HOURS_PER_DAY],
}

/// Build rollup rows for one day.
///
/// `views` are (page, session_id, timestamp_ms) within the day starting at
/// `day_start_ms`; `first_seen` maps each session to its earliest event.
/// Hours without page loads produce no row.
pub fn rollup_views(
    date: NaiveDate,
    day_start_ms: i64,
    views: &[(Option<String>, Option<String>, i64)],
    first_seen: &HashMap<String, i64>,
) -> Vec<AggregatedRecord> {
    let mut pages: BTreeMap<&str, PageDay> = BTreeMap::new();

    for (page, session, ts) in views {
        let Some(page) = page.as_deref() else {
            continue;
        };
        let offset = ts - day_start_ms;
        if !(0..DAY_MS).contains(&offset) {
            continue;
        }
        let hour = (offset / HOUR_MS) as usize;

        let day = pages.entry(page).or_default();
        day.loads[hour] += 1;
        if let Some(session) = session {
            day.sessions[hour].insert(session.clone());
        }
    }

    let date_str = date.format("%Y-%m-%d").to_string();
    let mut records = Vec::new();

    for (page, day) in pages {
        let mut seen_today: HashSet<&str> = HashSet::new();
        for hour in 0..HOURS_PER_DAY {
            let sessions = &day.sessions[hour];
            seen_today.extend(sessions.iter().map(String::as_str));
            if day.loads[hour] == 0 {
                continue;
            }

            let hour_start = day_start_ms + hour as i64 * HOUR_MS;
            let new_users = sessions
                .iter()
                .filter(|s| {
                    first_seen
                        .get(*s)
                        .is_some_and(|first| (hour_start..hour_start + HOUR_MS).contains(first))
                })
                .count();

            records.push(AggregatedRecord {
                page: page.to_string(),
                date: date_str.clone(),
                hour: hour as i64,
                page_loads: day.loads[hour],
                distinct_users: sessions.len() as i64,
                new_users: new_users as i64,
                cumulative_daily_distinct_users: seen_today.len() as i64,
            });
        }
    }

    records
}

/// Recompute and store the rollup rows for `date`. Returns the row count.
pub async fn rollup_day(db: &Database, date: NaiveDate) -> Result<usize> {
    let day_start_ms = date
        .and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc().timestamp_millis())
        .ok_or_else(|| anyhow::anyhow!("invalid rollup date {date}"))?;
    let day_end_ms = day_start_ms + DAY_MS;

    let views = db.page_views_between(day_start_ms, day_end_ms).await?;
    let first_seen: HashMap<String, i64> = db
        .session_first_seen(day_start_ms, day_end_ms)
        .await?
        .into_iter()
        .collect();

    let records = rollup_views(date, day_start_ms, &views, &first_seen);
    db.upsert(&records).await?;
    Ok(records.len())
}

/// Days to recompute on a tick. The first tick also covers yesterday, so
/// a restart shortly after midnight still finalises the previous day.
fn days_to_roll(last_day: Option<NaiveDate>, today: NaiveDate) -> Vec<NaiveDate> {
    let previous = last_day.or_else(|| today.pred_opt());
    let mut days = Vec::with_capacity(2);
    if let Some(prev) = previous.filter(|d| *d != today) {
        days.push(prev);
    }
    days.push(today);
    days
}

/// Periodically roll up the current day; the previous day gets one last
/// pass after midnight.
pub fn start_background_task(db: Arc<Database>, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        let mut last_day: Option<NaiveDate> = None;

        info!("Rollup task started (interval={}s)", interval.as_secs());

        loop {
            ticker.tick().await;
            let today = Utc::now().date_naive();

            for day in days_to_roll(last_day, today) {
                match rollup_day(&db, day).await {
                    Ok(rows) => debug!("Rolled up {} rows for {}", rows, day),
                    Err(e) => error!("Rollup for {} failed: {}", day, e),
                }
            }
            last_day = Some(today);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Event, EventStore};
    use crate::geoip::Location;
    use chrono::DateTime;
    use serde_json::Map;

    fn day() -> (NaiveDate, i64) {
        let date = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let start = date.and_hms_opt(0, 0, 0).unwrap().and_utc().timestamp_millis();
        (date, start)
    }

    fn view(page: &str, session: &str, ts: i64) -> (Option<String>, Option<String>, i64) {
        (Some(page.to_string()), Some(session.to_string()), ts)
    }

    #[test]
    fn counts_loads_distinct_new_and_cumulative_users() {
        let (date, start) = day();
        let h = |hour: i64, min: i64| start + hour * HOUR_MS + min * 60_000;

        let views = vec![
            view("/home", "a", h(9, 1)),
            view("/home", "a", h(9, 30)),
            view("/home", "b", h(9, 45)),
            view("/home", "a", h(14, 0)),
            view("/home", "c", h(14, 5)),
            view("/about", "c", h(14, 10)),
        ];
        let first_seen = HashMap::from([
            ("a".to_string(), h(9, 1)),
            // returning visitor from a previous day
            ("b".to_string(), start - DAY_MS),
            ("c".to_string(), h(14, 5)),
        ]);

        let rows = rollup_views(date, start, &views, &first_seen);
        assert_eq!(rows.len(), 3);

        let about = &rows[0];
        assert_eq!((about.page.as_str(), about.hour), ("/about", 14));
        assert_eq!(about.new_users, 1);

        let home_9 = &rows[1];
        assert_eq!(home_9.date, "2024-01-01");
        assert_eq!(home_9.hour, 9);
        assert_eq!(home_9.page_loads, 3);
        assert_eq!(home_9.distinct_users, 2);
        assert_eq!(home_9.new_users, 1);
        assert_eq!(home_9.cumulative_daily_distinct_users, 2);

        let home_14 = &rows[2];
        assert_eq!(home_14.page_loads, 2);
        assert_eq!(home_14.distinct_users, 2);
        assert_eq!(home_14.new_users, 1);
        assert_eq!(home_14.cumulative_daily_distinct_users, 3);
    }

    #[test]
    fn anonymous_views_count_as_loads_only() {
        let (date, start) = day();
        let views = vec![(Some("/home".to_string()), None, start + 5), (None, None, start + 6)];

        let rows = rollup_views(date, start, &views, &HashMap::new());
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].page_loads, 1);
        assert_eq!(rows[0].distinct_users, 0);
        assert_eq!(rows[0].cumulative_daily_distinct_users, 0);
    }

    #[tokio::test]
    async fn rollup_day_writes_rows_readable_by_the_aggregate_store() {
        let db = Database::in_memory().await.unwrap();
        let (date, start) = day();

        for (i, (session, hour)) in [("s1", 9), ("s1", 9), ("s2", 14)].into_iter().enumerate() {
            let event = Event {
                id: format!("e{i}"),
                session_id: Some(session.to_string()),
                page: Some("/home".to_string()),
                referrer: None,
                screen_resolution: None,
                ip_address: "203.0.113.5".to_string(),
                location: Location::unknown(),
                timestamp: DateTime::from_timestamp_millis(start + hour * HOUR_MS).unwrap(),
                properties: Map::new(),
            };
            db.create(&event).await.unwrap();
        }

        assert_eq!(rollup_day(&db, date).await.unwrap(), 2);
        // idempotent
        assert_eq!(rollup_day(&db, date).await.unwrap(), 2);

        let rows = AggregateStore::query(&db, "/home", Some("2024-01-01")).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].hour, 9);
        assert_eq!(rows[0].page_loads, 2);
        assert_eq!(rows[0].new_users, 1);
        assert_eq!(rows[1].hour, 14);
        assert_eq!(rows[1].cumulative_daily_distinct_users, 2);
    }

    #[test]
    fn first_tick_also_rolls_yesterday() {
        let today = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let yesterday = NaiveDate::from_ymd_opt(2024, 2, 29).unwrap();

        assert_eq!(days_to_roll(None, today), vec![yesterday, today]);
        assert_eq!(days_to_roll(Some(today), today), vec![today]);
        assert_eq!(days_to_roll(Some(yesterday), today), vec![yesterday, today]);
    }
}
