use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::Value;

use crate::api::ReportKind;
use crate::date_util::parse_day;
use crate::error::Result;
use crate::storage::repository::{self, FactTable};
use crate::sync::context::SyncContext;
use crate::sync::jobs::report_task::generate_chunked;
use crate::sync::jobs::{decode, merge_rows, parse_all, replace_window, DatasetJob, Fetched, Mergeable};
use crate::sync::planner::Plan;
use crate::sync::policy::DatasetKey;

const MAX_TASK_DAYS: u32 = 31;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawAcceptanceLine {
    #[serde(rename = "nmID")]
    nm_id: i64,
    #[serde(rename = "giCreateDate")]
    gi_create_date: Option<String>,
    #[serde(rename = "shkCreateDate")]
    shk_create_date: Option<String>,
    count: i64,
    total: f64,
}

/// Acceptance charges for one article on one day.
#[derive(Debug, Clone, PartialEq)]
pub struct AcceptanceCost {
    pub nm_id: i64,
    pub date: NaiveDate,
    pub total: f64,
    pub quantity: i64,
}

/// The charge date is the supply's acceptance date, falling back to the
/// barcode creation date.
pub fn parse_acceptance_line(value: &Value) -> Option<AcceptanceCost> {
    let raw: RawAcceptanceLine = decode(value, "acceptance")?;
    if raw.nm_id <= 0 {
        return None;
    }
    let date = raw
        .gi_create_date
        .as_deref()
        .and_then(parse_day)
        .or_else(|| raw.shk_create_date.as_deref().and_then(parse_day))?;
    Some(AcceptanceCost {
        nm_id: raw.nm_id,
        date,
        total: raw.total,
        quantity: raw.count,
    })
}

impl Mergeable for AcceptanceCost {
    type Key = (i64, NaiveDate);

    fn merge_key(&self) -> Self::Key {
        (self.nm_id, self.date)
    }

    fn absorb(&mut self, other: Self) {
        self.total += other.total;
        self.quantity += other.quantity;
    }
}

pub struct AcceptanceJob;

#[async_trait]
impl DatasetJob for AcceptanceJob {
    type Row = AcceptanceCost;

    fn dataset(&self) -> DatasetKey {
        DatasetKey::AcceptanceCost
    }

    async fn fetch(&self, ctx: &SyncContext, plan: &Plan) -> Result<Fetched<AcceptanceCost>> {
        let values = generate_chunked(ctx, ReportKind::Acceptance, &plan.range, MAX_TASK_DAYS).await?;
        let rows = parse_all(&values, "acceptance", parse_acceptance_line)
            .into_iter()
            .filter(|r| plan.range.contains(r.date))
            .collect();
        Ok(Fetched::new(rows, values.len() as u64))
    }

    async fn apply(&self, ctx: &SyncContext, plan: &Plan, rows: Vec<AcceptanceCost>) -> Result<u64> {
        let merged = merge_rows(rows);
        replace_window(
            ctx,
            FactTable::AcceptanceCosts,
            plan.range,
            merged,
            repository::upsert_acceptance_cost,
        )
        .await
    }
}
