//! Pure planning: (policy, checkpoint, today) → the next window to sync.
//!
//! All ranges are inclusive on both ends and calendar-day granular. Nothing
//! here touches the store or the upstream API.

use std::fmt;

use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::api::Granularity;
use crate::date_util::{is_week_closed, last_closed_week, watermark, week_start, DateRange};
use crate::sync::checkpoint::Checkpoint;
use crate::sync::policy::{DatasetKey, DatasetPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    Priority,
    Refresh,
    Catchup,
    Backfill,
}

impl SyncMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncMode::Priority => "priority",
            SyncMode::Refresh => "refresh",
            SyncMode::Catchup => "catchup",
            SyncMode::Backfill => "backfill",
        }
    }
}

/// One window of work for one dataset. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub dataset: DatasetKey,
    pub range: DateRange,
    pub mode: SyncMode,
    pub overlap_days: Option<u32>,
    pub granularity: Granularity,
}

impl Plan {
    /// The same window applied to another dataset of a shared stream.
    pub fn for_dataset(&self, dataset: DatasetKey) -> Plan {
        Plan {
            dataset,
            ..self.clone()
        }
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} ({})",
            self.dataset,
            self.mode.as_str(),
            self.range,
            self.granularity.as_str()
        )
    }
}

/// A daily refresh of the trailing `days` up to the watermark.
pub fn build_trailing_plan(dataset: DatasetKey, days: u32, today: NaiveDate) -> Plan {
    let wm = watermark(today);
    let days = days.max(1);
    Plan {
        dataset,
        range: DateRange::new(wm - Duration::days(i64::from(days) - 1), wm),
        mode: SyncMode::Refresh,
        overlap_days: Some(days),
        granularity: Granularity::Daily,
    }
}

/// Short fast load of the priority window. Always returns a plan.
pub fn build_priority_plan(dataset: DatasetKey, policy: &DatasetPolicy, today: NaiveDate) -> Plan {
    build_trailing_plan(dataset, policy.priority_days, today)
}

/// Re-validate the trailing overlap window whose upstream values may still change.
pub fn build_refresh_plan(dataset: DatasetKey, policy: &DatasetPolicy, today: NaiveDate) -> Plan {
    build_trailing_plan(dataset, policy.refresh_overlap_days, today)
}

/// Next forward chunk after the checkpoint. `None` means fully caught up.
///
/// Without a checkpoint the chunk starts at the history floor
/// (`watermark − maxHistoryDays + 1`); with unbounded history it starts at the
/// priority window, leaving older data to backfill.
pub fn build_catchup_plan(
    dataset: DatasetKey,
    policy: &DatasetPolicy,
    checkpoint: Option<&Checkpoint>,
    today: NaiveDate,
) -> Option<Plan> {
    let wm = watermark(today);
    let floor = policy
        .max_history_days
        .map(|days| wm - Duration::days(i64::from(days)) + Duration::days(1));
    let mut start = match checkpoint {
        Some(cp) => cp.cursor_time + Duration::days(1),
        None => floor.unwrap_or(wm - Duration::days(i64::from(policy.priority_days)) + Duration::days(1)),
    };
    if let Some(floor) = floor {
        start = start.max(floor);
    }
    if start > wm {
        return None;
    }
    let end = (start + Duration::days(i64::from(policy.catchup_chunk_days) - 1)).min(wm);
    Some(Plan {
        dataset,
        range: DateRange::new(start, end),
        mode: SyncMode::Catchup,
        overlap_days: None,
        granularity: Granularity::Daily,
    })
}

/// Next closed week for the backward weekly sweep.
///
/// The most recently closed week belongs to the priority wave's weekly check,
/// so without a checkpoint the sweep starts at the week before it; with a
/// checkpoint it targets the week immediately preceding the checkpoint's
/// week. Returns `None` when the target week starts before the lower bound,
/// ends after the watermark, or is not closed yet.
pub fn build_sales_backfill_plan(
    dataset: DatasetKey,
    policy: &DatasetPolicy,
    checkpoint: Option<&Checkpoint>,
    today: NaiveDate,
) -> Option<Plan> {
    if !policy.backfill_enabled() {
        return None;
    }
    let anchor = match checkpoint {
        Some(cp) => DateRange::week_of(cp.cursor_time),
        None => last_closed_week(today),
    };
    let target = DateRange::week_of(anchor.from - Duration::days(7));
    if !is_week_closed(target.from, today) {
        return None;
    }
    if target.from < policy.backfill_lower_bound(today) || target.to > watermark(today) {
        return None;
    }
    Some(Plan {
        dataset,
        range: target,
        mode: SyncMode::Backfill,
        overlap_days: None,
        granularity: Granularity::Weekly,
    })
}

/// Daily-chunked backward step for datasets without weekly granularity.
///
/// Starts just below the priority window and moves back `chunk_days` per
/// call, clamped at the lower bound.
pub fn build_backfill_plan(
    dataset: DatasetKey,
    policy: &DatasetPolicy,
    checkpoint: Option<&Checkpoint>,
    today: NaiveDate,
) -> Option<Plan> {
    let backfill = policy.backfill.as_ref().filter(|b| b.enabled)?;
    let chunk = Duration::days(i64::from(backfill.chunk_days.max(1)));
    let lower = policy.backfill_lower_bound(today);
    let end = match checkpoint {
        Some(cp) => cp.cursor_time - chunk,
        None => watermark(today) - Duration::days(i64::from(policy.priority_days)),
    };
    if end < lower {
        return None;
    }
    let start = (end - chunk + Duration::days(1)).max(lower);
    Some(Plan {
        dataset,
        range: DateRange::new(start, end),
        mode: SyncMode::Backfill,
        overlap_days: None,
        granularity: Granularity::Daily,
    })
}

/// The weekly plan for the most recently closed week.
pub fn build_closed_week_plan(dataset: DatasetKey, today: NaiveDate) -> Plan {
    Plan {
        dataset,
        range: last_closed_week(today),
        mode: SyncMode::Priority,
        overlap_days: None,
        granularity: Granularity::Weekly,
    }
}

/// Priority plans for sales: the daily refresh of the priority window, plus
/// a weekly plan for the last closed week unless it is already loaded.
pub fn build_sales_plan(
    dataset: DatasetKey,
    policy: &DatasetPolicy,
    today: NaiveDate,
    closed_week_loaded: bool,
) -> Vec<Plan> {
    let mut plans = vec![build_priority_plan(dataset, policy, today)];
    if !closed_week_loaded {
        plans.push(build_closed_week_plan(dataset, today));
    }
    plans
}

/// Derived view of the weekly backfill sweep.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackfillProgress {
    pub lower_bound: NaiveDate,
    pub weeks_done: u32,
    pub weeks_remaining: u32,
    pub percent: f64,
    pub completed: bool,
}

/// Whole weeks strictly before `week_monday` that start on or after `lower`.
fn weeks_above(lower: NaiveDate, week_monday: NaiveDate) -> u32 {
    let days = (week_monday - lower).num_days();
    if days <= 0 {
        0
    } else {
        (days / 7) as u32
    }
}

/// Progress of the weekly backfill computed from its checkpoint and today.
pub fn backfill_progress(
    policy: &DatasetPolicy,
    checkpoint: Option<&Checkpoint>,
    today: NaiveDate,
) -> BackfillProgress {
    let lower_bound = policy.backfill_lower_bound(today);
    let total = weeks_above(lower_bound, last_closed_week(today).from);
    let remaining = match checkpoint {
        Some(cp) => weeks_above(lower_bound, week_start(cp.cursor_time)).min(total),
        None => total,
    };
    let done = total - remaining;
    let percent = if total == 0 {
        100.0
    } else {
        f64::from(done) * 100.0 / f64::from(total)
    };
    BackfillProgress {
        lower_bound,
        weeks_done: done,
        weeks_remaining: remaining,
        percent,
        completed: remaining == 0,
    }
}
