//! Folding hourly rollup rows into a per-page summary

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::db::AggregatedRecord;

pub const HOURS_PER_DAY: usize = 24;

/// Counters for one hour of the day
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HourlyBucket {
    pub hour: u8,
    pub page_loads: i64,
    pub distinct_users: i64,
    pub new_users: i64,
    pub cumulative_daily_distinct_users: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregationResult {
    pub total_page_views: i64,
    pub total_distinct_users: i64,
    pub total_new_users: i64,
    pub total_cumulative_daily_distinct_users: i64,
    /// Always 24 entries, index == hour
    pub hourly_breakdown: Vec<HourlyBucket>,
}

impl Default for AggregationResult {
    fn default() -> Self {
        Self {
            total_page_views: 0,
            total_distinct_users: 0,
            total_new_users: 0,
            total_cumulative_daily_distinct_users: 0,
            hourly_breakdown: (0..HOURS_PER_DAY as u8)
                .map(|hour| HourlyBucket {
                    hour,
                    ..Default::default()
                })
                .collect(),
        }
    }
}

impl AggregationResult {
    /// Add one record into its hour slot and the totals. Counters saturate
    /// at `i64::MAX` rather than wrapping.
    /// Records with an hour outside 0-23 are skipped; returns whether it was counted.
    pub fn add(&mut self, record: &AggregatedRecord) -> bool {
        let Some(slot) = usize::try_from(record.hour)
            .ok()
            .and_then(|h| self.hourly_breakdown.get_mut(h))
        else {
            return false;
        };

        slot.page_loads = slot.page_loads.saturating_add(record.page_loads);
        slot.distinct_users = slot.distinct_users.saturating_add(record.distinct_users);
        slot.new_users = slot.new_users.saturating_add(record.new_users);
        slot.cumulative_daily_distinct_users = slot
            .cumulative_daily_distinct_users
            .saturating_add(record.cumulative_daily_distinct_users);

        self.total_page_views = self.total_page_views.saturating_add(record.page_loads);
        self.total_distinct_users = self.total_distinct_users.saturating_add(record.distinct_users);
        self.total_new_users = self.total_new_users.saturating_add(record.new_users);
        self.total_cumulative_daily_distinct_users = self
            .total_cumulative_daily_distinct_users
            .saturating_add(record.cumulative_daily_distinct_users);
        true
    }

    /// Component-wise sum of two results
    pub fn merge(mut self, other: &AggregationResult) -> Self {
        self.total_page_views = self.total_page_views.saturating_add(other.total_page_views);
        self.total_distinct_users = self.total_distinct_users.saturating_add(other.total_distinct_users);
        self.total_new_users = self.total_new_users.saturating_add(other.total_new_users);
        self.total_cumulative_daily_distinct_users = self
            .total_cumulative_daily_distinct_users
            .saturating_add(other.total_cumulative_daily_distinct_users);
        for (mine, theirs) in self.hourly_breakdown.iter_mut().zip(&other.hourly_breakdown) {
            mine.page_loads = mine.page_loads.saturating_add(theirs.page_loads);
            mine.distinct_users = mine.distinct_users.saturating_add(theirs.distinct_users);
            mine.new_users = mine.new_users.saturating_add(theirs.new_users);
            mine.cumulative_daily_distinct_users = mine
                .cumulative_daily_distinct_users
                .saturating_add(theirs.cumulative_daily_distinct_users);
        }
        self
    }
}

/// Sum `records` into totals and a 24-slot hourly breakdown
pub fn aggregate(records: &[AggregatedRecord]) -> AggregationResult {
    let mut result = AggregationResult::default();
    for record in records {
        if !result.add(record) {
            warn!(
                page = %record.page,
                date = %record.date,
                hour = record.hour,
                "ignoring aggregate row with out-of-range hour"
            );
        }
    }
    result
}
