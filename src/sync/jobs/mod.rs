//! Dataset jobs: one per dataset, each owning its fetch, parse and apply.
//!
//! [`DatasetJob`] is the typed interface a job implements. The runner and
//! orchestrator drive jobs through the object-safe [`SyncJob`], which every
//! `DatasetJob` gets for free.

pub mod acceptance;
pub mod advertising;
pub mod catalog;
pub mod finance;
pub mod order_stats;
pub mod paid_storage;
pub mod report_task;
pub mod stocks;
pub mod supplies;

#[cfg(test)]
pub(crate) mod fake;

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use rusqlite::Connection;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

use crate::date_util::DateRange;
use crate::error::Result;
use crate::storage::repository::{self, FactTable};
use crate::sync::checkpoint::{next_checkpoint, Checkpoint};
use crate::sync::context::SyncContext;
use crate::sync::planner::{build_catchup_plan, Plan};
use crate::sync::policy::DatasetKey;

/// Rows a fetch produced, plus the pagination token to persist, if any.
#[derive(Debug, Clone)]
pub struct Fetched<R> {
    pub rows: Vec<R>,
    /// Raw upstream rows seen, before parsing drops invalid ones.
    pub fetched: u64,
    pub cursor_token: Option<String>,
}

impl<R> Fetched<R> {
    pub fn new(rows: Vec<R>, fetched: u64) -> Self {
        Self {
            rows,
            fetched,
            cursor_token: None,
        }
    }
}

#[async_trait]
pub trait DatasetJob: Send + Sync {
    type Row: Send + Sync + 'static;

    fn dataset(&self) -> DatasetKey;

    /// Whether the upstream can aggregate this dataset by week.
    fn supports_weekly(&self) -> bool {
        false
    }

    fn plan(&self, ctx: &SyncContext, checkpoint: Option<&Checkpoint>) -> Option<Plan> {
        build_catchup_plan(
            self.dataset(),
            ctx.policy(self.dataset()),
            checkpoint,
            ctx.today(),
        )
    }

    /// Fetch every page for the plan's range.
    async fn fetch(&self, ctx: &SyncContext, plan: &Plan) -> Result<Fetched<Self::Row>>;

    /// Merge and store rows. Safe to repeat for the same plan.
    async fn apply(&self, ctx: &SyncContext, plan: &Plan, rows: Vec<Self::Row>) -> Result<u64>;

    /// Days a successful run of `plan` actually loaded.
    fn loaded_range(&self, plan: &Plan) -> DateRange {
        plan.range
    }

    fn build_next_checkpoint(
        &self,
        ctx: &SyncContext,
        plan: &Plan,
        previous: Option<&Checkpoint>,
        _fetched: u64,
        cursor_token: Option<String>,
    ) -> Checkpoint {
        next_checkpoint(plan, previous, ctx.today(), ctx.now(), cursor_token)
    }
}

/// Result of fetching and applying one plan.
#[derive(Debug, Clone)]
pub struct Applied {
    pub fetched: u64,
    pub applied: u64,
    pub cursor_token: Option<String>,
}

/// Object-safe view of a [`DatasetJob`] with its row type erased.
#[async_trait]
pub trait SyncJob: Send + Sync {
    fn key(&self) -> DatasetKey;

    fn weekly_capable(&self) -> bool;

    fn next_plan(&self, ctx: &SyncContext, checkpoint: Option<&Checkpoint>) -> Option<Plan>;

    async fn fetch_and_apply(&self, ctx: &SyncContext, plan: &Plan) -> Result<Applied>;

    fn covered_range(&self, plan: &Plan) -> DateRange;

    fn checkpoint_after(
        &self,
        ctx: &SyncContext,
        plan: &Plan,
        previous: Option<&Checkpoint>,
        applied: &Applied,
    ) -> Checkpoint;
}

#[async_trait]
impl<J: DatasetJob> SyncJob for J {
    fn key(&self) -> DatasetKey {
        self.dataset()
    }

    fn weekly_capable(&self) -> bool {
        self.supports_weekly()
    }

    fn next_plan(&self, ctx: &SyncContext, checkpoint: Option<&Checkpoint>) -> Option<Plan> {
        self.plan(ctx, checkpoint)
    }

    async fn fetch_and_apply(&self, ctx: &SyncContext, plan: &Plan) -> Result<Applied> {
        let fetched = self.fetch(ctx, plan).await?;
        log::debug!(
            "{}: fetched {} upstream rows, {} valid",
            plan,
            fetched.fetched,
            fetched.rows.len()
        );
        let applied = self.apply(ctx, plan, fetched.rows).await?;
        ctx.progress.on_applied(plan.dataset, &plan.range, applied);
        Ok(Applied {
            fetched: fetched.fetched,
            applied,
            cursor_token: fetched.cursor_token,
        })
    }

    fn covered_range(&self, plan: &Plan) -> DateRange {
        self.loaded_range(plan)
    }

    fn checkpoint_after(
        &self,
        ctx: &SyncContext,
        plan: &Plan,
        previous: Option<&Checkpoint>,
        applied: &Applied,
    ) -> Checkpoint {
        self.build_next_checkpoint(ctx, plan, previous, applied.fetched, applied.cursor_token.clone())
    }
}

/// The job that syncs `dataset`.
pub fn job_for(dataset: DatasetKey) -> Arc<dyn SyncJob> {
    match dataset {
        DatasetKey::Sales
        | DatasetKey::Returns
        | DatasetKey::Logistics
        | DatasetKey::Penalties => Arc::new(finance::FinanceJob::new(dataset)),
        DatasetKey::AdvertisingCost => Arc::new(advertising::AdvertisingJob::default()),
        DatasetKey::StorageCost => Arc::new(paid_storage::PaidStorageJob),
        DatasetKey::AcceptanceCost => Arc::new(acceptance::AcceptanceJob),
        DatasetKey::Stocks => Arc::new(stocks::StocksJob),
        DatasetKey::OrderStats => Arc::new(order_stats::OrderStatsJob::default()),
        DatasetKey::Supplies => Arc::new(supplies::SuppliesJob),
        DatasetKey::Catalog => Arc::new(catalog::CatalogJob::default()),
    }
}

// ── Merge ──────────────────────────────────────────────────────────

/// A row that can be grouped by a composite business key and summed.
pub trait Mergeable {
    type Key: Ord;

    fn merge_key(&self) -> Self::Key;

    /// Fold `other` (same key) into `self`, summing numeric measures.
    fn absorb(&mut self, other: Self);
}

/// Group rows by merge key, summing collisions. Output is sorted by key.
pub fn merge_rows<T: Mergeable>(rows: impl IntoIterator<Item = T>) -> Vec<T> {
    let mut merged: BTreeMap<T::Key, T> = BTreeMap::new();
    for row in rows {
        match merged.entry(row.merge_key()) {
            Entry::Occupied(mut slot) => slot.get_mut().absorb(row),
            Entry::Vacant(slot) => {
                slot.insert(row);
            }
        }
    }
    merged.into_values().collect()
}

// ── Parse helpers ──────────────────────────────────────────────────

/// Deserialize one upstream row into its raw shape, dropping it with a
/// warning when it does not match.
pub(crate) fn decode<R: DeserializeOwned>(value: &Value, feed: &str) -> Option<R> {
    match R::deserialize(value) {
        Ok(raw) => Some(raw),
        Err(e) => {
            log::warn!("Dropping malformed {feed} row: {e}");
            None
        }
    }
}

/// Parse every row with `parse`, counting what was dropped.
pub(crate) fn parse_all<T>(values: &[Value], feed: &str, parse: impl Fn(&Value) -> Option<T>) -> Vec<T> {
    let rows: Vec<T> = values.iter().filter_map(parse).collect();
    let dropped = values.len() - rows.len();
    if dropped > 0 {
        log::warn!("{feed}: dropped {dropped} of {} rows without a business key", values.len());
    }
    rows
}

// ── Apply helpers ──────────────────────────────────────────────────

/// Replace every row of `table` dated inside `range` with `rows`, in one
/// transaction. Rows must already be merged by key.
pub(crate) async fn replace_window<T, F>(
    ctx: &SyncContext,
    table: FactTable,
    range: DateRange,
    rows: Vec<T>,
    upsert: F,
) -> Result<u64>
where
    T: Send + 'static,
    F: Fn(&Connection, &T) -> std::result::Result<(), rusqlite::Error> + Send + 'static,
{
    let applied = ctx
        .db
        .writer()
        .call(move |conn| {
            let tx = conn.transaction()?;
            let removed = repository::delete_window(&tx, table, &range)?;
            for row in &rows {
                upsert(&tx, row)?;
            }
            tx.commit()?;
            log::debug!(
                "{}: replaced {removed} rows with {} for {range}",
                table.name(),
                rows.len()
            );
            Ok::<u64, rusqlite::Error>(rows.len() as u64)
        })
        .await?;
    Ok(applied)
}

/// Upsert rows by key in one transaction without clearing anything first.
pub(crate) async fn upsert_all<T, F>(
    ctx: &SyncContext,
    rows: Vec<T>,
    upsert: F,
) -> Result<u64>
where
    T: Send + 'static,
    F: Fn(&Connection, &T) -> std::result::Result<(), rusqlite::Error> + Send + 'static,
{
    let applied = ctx
        .db
        .writer()
        .call(move |conn| {
            let tx = conn.transaction()?;
            for row in &rows {
                upsert(&tx, row)?;
            }
            tx.commit()?;
            Ok::<u64, rusqlite::Error>(rows.len() as u64)
        })
        .await?;
    Ok(applied)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Line {
        article: i64,
        size: &'static str,
        qty: i64,
        amount: f64,
    }

    impl Mergeable for Line {
        type Key = (i64, &'static str);

        fn merge_key(&self) -> Self::Key {
            (self.article, self.size)
        }

        fn absorb(&mut self, other: Self) {
            self.qty += other.qty;
            self.amount += other.amount;
        }
    }

    #[test]
    fn test_merge_rows_sums_collisions() {
        let merged = merge_rows(vec![
            Line { article: 2, size: "M", qty: 1, amount: 10.0 },
            Line { article: 1, size: "S", qty: 2, amount: 5.0 },
            Line { article: 2, size: "M", qty: 3, amount: 2.5 },
            Line { article: 2, size: "L", qty: 1, amount: 1.0 },
        ]);
        assert_eq!(
            merged,
            vec![
                Line { article: 1, size: "S", qty: 2, amount: 5.0 },
                Line { article: 2, size: "L", qty: 1, amount: 1.0 },
                Line { article: 2, size: "M", qty: 4, amount: 12.5 },
            ]
        );
    }

    #[test]
    fn test_decode_drops_mismatched_shape() {
        #[derive(serde::Deserialize)]
        struct Raw {
            #[allow(dead_code)]
            id: i64,
        }
        assert!(decode::<Raw>(&serde_json::json!({"id": 5}), "test").is_some());
        assert!(decode::<Raw>(&serde_json::json!({"id": "five"}), "test").is_none());
        assert!(decode::<Raw>(&serde_json::json!([1, 2]), "test").is_none());
    }
}
