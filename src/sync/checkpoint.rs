use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::api::Granularity;
use crate::date_util::{watermark, DateRange};
use crate::sync::planner::{Plan, SyncMode};
use crate::sync::policy::DatasetKey;

/// Which cursor of a dataset a checkpoint belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointVariant {
    /// Forward progress of priority, refresh and catch-up runs.
    Forward,
    /// Last closed week fetched at weekly granularity.
    Weekly,
    /// Backward sweep towards the backfill lower bound.
    Backfill,
}

impl CheckpointVariant {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointVariant::Forward => "forward",
            CheckpointVariant::Weekly => "weekly",
            CheckpointVariant::Backfill => "backfill",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "forward" => Some(CheckpointVariant::Forward),
            "weekly" => Some(CheckpointVariant::Weekly),
            "backfill" => Some(CheckpointVariant::Backfill),
            _ => None,
        }
    }

    /// The cursor a plan advances once it has been applied.
    pub fn for_plan(plan: &Plan) -> Self {
        if plan.mode == SyncMode::Backfill {
            CheckpointVariant::Backfill
        } else if plan.granularity == Granularity::Weekly {
            CheckpointVariant::Weekly
        } else {
            CheckpointVariant::Forward
        }
    }
}

/// Compound checkpoint key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CheckpointKey {
    pub dataset: DatasetKey,
    pub variant: CheckpointVariant,
}

impl CheckpointKey {
    pub fn new(dataset: DatasetKey, variant: CheckpointVariant) -> Self {
        Self { dataset, variant }
    }

    pub fn forward(dataset: DatasetKey) -> Self {
        Self::new(dataset, CheckpointVariant::Forward)
    }

    pub fn backfill(dataset: DatasetKey) -> Self {
        Self::new(dataset, CheckpointVariant::Backfill)
    }
}

impl fmt::Display for CheckpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.dataset, self.variant.as_str())
    }
}

/// Durable sync cursor for one (dataset, variant).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub key: CheckpointKey,
    /// Last fully covered date, inclusive.
    pub cursor_time: NaiveDate,
    /// Pagination token for token-paginated feeds.
    pub cursor_token: Option<String>,
    pub high_watermark: NaiveDate,
    pub updated_at: DateTime<Utc>,
}

/// Compute the checkpoint that follows a successfully applied plan.
///
/// The cursor moves to the end of the plan's range. Forward and weekly
/// cursors never move backward. Weekly runs pin the high watermark to the
/// latest closed week written so far; other runs recompute it from today.
pub fn next_checkpoint(
    plan: &Plan,
    previous: Option<&Checkpoint>,
    today: NaiveDate,
    now: DateTime<Utc>,
    cursor_token: Option<String>,
) -> Checkpoint {
    let variant = CheckpointVariant::for_plan(plan);
    let monotonic = matches!(variant, CheckpointVariant::Forward | CheckpointVariant::Weekly);
    let mut cursor_time = plan.range.to;
    if let Some(prev) = previous.filter(|_| monotonic) {
        cursor_time = cursor_time.max(prev.cursor_time);
    }
    let high_watermark = if plan.granularity == Granularity::Weekly {
        let week_end = plan.range.to.min(watermark(today));
        match previous.filter(|_| monotonic) {
            Some(prev) => week_end.max(prev.high_watermark),
            None => week_end,
        }
    } else {
        watermark(today)
    };
    Checkpoint {
        key: CheckpointKey::new(plan.dataset, variant),
        cursor_time,
        cursor_token,
        high_watermark,
        updated_at: now,
    }
}

/// Granularity a loaded period was recorded at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeriodType {
    Daily,
    Weekly,
}

impl PeriodType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeriodType::Daily => "daily",
            PeriodType::Weekly => "weekly",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "daily" => Some(PeriodType::Daily),
            "weekly" => Some(PeriodType::Weekly),
            _ => None,
        }
    }
}

impl From<Granularity> for PeriodType {
    fn from(g: Granularity) -> Self {
        match g {
            Granularity::Daily => PeriodType::Daily,
            Granularity::Weekly => PeriodType::Weekly,
        }
    }
}

/// One entry of the append-only coverage log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadedPeriod {
    pub dataset: DatasetKey,
    pub period_type: PeriodType,
    pub range: DateRange,
    pub applied_at: DateTime<Utc>,
    pub record_count: u64,
}

/// How strictly a coverage check matches granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoverageRule {
    /// Only records of the queried type count, or a weekly record containing
    /// a daily query.
    SameGranularity,
    /// Any record counts, including a contiguous run of daily records
    /// spanning a weekly window.
    AnyGranularity,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn plan(mode: SyncMode, granularity: Granularity, from: NaiveDate, to: NaiveDate) -> Plan {
        Plan {
            dataset: DatasetKey::Sales,
            range: DateRange::new(from, to),
            mode,
            overlap_days: None,
            granularity,
        }
    }

    fn checkpoint(cursor: NaiveDate) -> Checkpoint {
        Checkpoint {
            key: CheckpointKey::forward(DatasetKey::Sales),
            cursor_time: cursor,
            cursor_token: None,
            high_watermark: cursor,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_forward_cursor_never_regresses() {
        let today = d(2024, 2, 7);
        let p = plan(SyncMode::Refresh, Granularity::Daily, d(2024, 2, 1), d(2024, 2, 3));
        let prev = checkpoint(d(2024, 2, 6));
        let next = next_checkpoint(&p, Some(&prev), today, Utc::now(), None);
        assert_eq!(next.cursor_time, d(2024, 2, 6));
        assert_eq!(next.high_watermark, d(2024, 2, 6));
        assert_eq!(next.key.variant, CheckpointVariant::Forward);
    }

    #[test]
    fn test_weekly_run_pins_high_watermark() {
        let today = d(2024, 2, 7);
        let p = plan(SyncMode::Priority, Granularity::Weekly, d(2024, 1, 29), d(2024, 2, 4));
        let next = next_checkpoint(&p, None, today, Utc::now(), None);
        assert_eq!(next.key.variant, CheckpointVariant::Weekly);
        assert_eq!(next.cursor_time, d(2024, 2, 4));
        assert_eq!(next.high_watermark, d(2024, 2, 4));
    }

    #[test]
    fn test_older_weekly_window_keeps_latest_week() {
        let today = d(2024, 2, 7);
        let latest = plan(SyncMode::Priority, Granularity::Weekly, d(2024, 1, 29), d(2024, 2, 4));
        let prev = next_checkpoint(&latest, None, today, Utc::now(), None);
        let older = plan(SyncMode::Catchup, Granularity::Weekly, d(2024, 1, 8), d(2024, 1, 14));
        let next = next_checkpoint(&older, Some(&prev), today, Utc::now(), None);
        assert_eq!(next.key.variant, CheckpointVariant::Weekly);
        assert_eq!(next.cursor_time, d(2024, 2, 4));
        assert_eq!(next.high_watermark, d(2024, 2, 4));
    }

    #[test]
    fn test_backfill_cursor_moves_backward() {
        let today = d(2024, 2, 7);
        let p = plan(SyncMode::Backfill, Granularity::Weekly, d(2024, 1, 15), d(2024, 1, 21));
        let mut prev = checkpoint(d(2024, 1, 28));
        prev.key = CheckpointKey::backfill(DatasetKey::Sales);
        let next = next_checkpoint(&p, Some(&prev), today, Utc::now(), None);
        assert_eq!(next.key.variant, CheckpointVariant::Backfill);
        assert_eq!(next.cursor_time, d(2024, 1, 21));
    }
}
