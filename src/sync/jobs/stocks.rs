//! Warehouse remains: a point-in-time snapshot rather than a dated ledger.

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::Value;

use crate::api::{Granularity, ReportKind};
use crate::date_util::{watermark, DateRange};
use crate::error::Result;
use crate::storage::repository::{self, FactTable};
use crate::sync::checkpoint::Checkpoint;
use crate::sync::context::SyncContext;
use crate::sync::jobs::report_task::generate_report;
use crate::sync::jobs::{decode, merge_rows, parse_all, replace_window, DatasetJob, Fetched, Mergeable};
use crate::sync::planner::{Plan, SyncMode};
use crate::sync::policy::DatasetKey;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawWarehouse {
    quantity: i64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct RawRemains {
    nm_id: i64,
    vendor_code: String,
    tech_size: String,
    quantity_warehouses_full: Option<i64>,
    in_way_to_client: i64,
    in_way_from_client: i64,
    warehouses: Vec<RawWarehouse>,
}

/// Stock level of one article size on the snapshot date.
#[derive(Debug, Clone, PartialEq)]
pub struct StockLevel {
    pub nm_id: i64,
    pub snapshot_date: NaiveDate,
    pub size: String,
    pub supplier_article: String,
    pub quantity: i64,
    pub in_way_to_client: i64,
    pub in_way_from_client: i64,
}

/// The total quantity comes from `quantityWarehousesFull` when present,
/// else the sum over warehouses.
pub fn parse_remains(value: &Value, snapshot_date: NaiveDate) -> Option<StockLevel> {
    let raw: RawRemains = decode(value, "warehouse remains")?;
    if raw.nm_id <= 0 {
        return None;
    }
    let quantity = raw
        .quantity_warehouses_full
        .unwrap_or_else(|| raw.warehouses.iter().map(|w| w.quantity).sum());
    Some(StockLevel {
        nm_id: raw.nm_id,
        snapshot_date,
        size: raw.tech_size.trim().to_string(),
        supplier_article: raw.vendor_code,
        quantity,
        in_way_to_client: raw.in_way_to_client,
        in_way_from_client: raw.in_way_from_client,
    })
}

impl Mergeable for StockLevel {
    type Key = (i64, NaiveDate, String);

    fn merge_key(&self) -> Self::Key {
        (self.nm_id, self.snapshot_date, self.size.clone())
    }

    fn absorb(&mut self, other: Self) {
        self.quantity += other.quantity;
        self.in_way_to_client += other.in_way_to_client;
        self.in_way_from_client += other.in_way_from_client;
    }
}

pub struct StocksJob;

#[async_trait]
impl DatasetJob for StocksJob {
    type Row = StockLevel;

    fn dataset(&self) -> DatasetKey {
        DatasetKey::Stocks
    }

    /// One snapshot per watermark day; history cannot be replayed.
    fn plan(&self, ctx: &SyncContext, checkpoint: Option<&Checkpoint>) -> Option<Plan> {
        let wm = watermark(ctx.today());
        if checkpoint.is_some_and(|cp| cp.cursor_time >= wm) {
            return None;
        }
        Some(Plan {
            dataset: DatasetKey::Stocks,
            range: DateRange::single(wm),
            mode: SyncMode::Catchup,
            overlap_days: None,
            granularity: Granularity::Daily,
        })
    }

    async fn fetch(&self, ctx: &SyncContext, plan: &Plan) -> Result<Fetched<StockLevel>> {
        let snapshot = DateRange::single(plan.range.to);
        let values = generate_report(ctx, ReportKind::WarehouseRemains, &snapshot).await?;
        let rows = parse_all(&values, "warehouse remains", |v| parse_remains(v, plan.range.to));
        Ok(Fetched::new(rows, values.len() as u64))
    }

    async fn apply(&self, ctx: &SyncContext, plan: &Plan, rows: Vec<StockLevel>) -> Result<u64> {
        let merged = merge_rows(rows);
        replace_window(ctx, FactTable::Stocks, self.loaded_range(plan), merged, repository::upsert_stock_level).await
    }

    /// Only the snapshot day is loaded, however wide the plan.
    fn loaded_range(&self, plan: &Plan) -> DateRange {
        DateRange::single(plan.range.to)
    }
}
