pub mod api;
pub mod date_util;
pub mod error;
pub mod storage;
pub mod sync;

use std::sync::Arc;

use chrono::NaiveDate;
use serde::Serialize;

pub use api::{ApiError, HttpApi, MarketplaceApi};
pub use error::{Error, Result};
pub use storage::Database;
pub use sync::checkpoint::{Checkpoint, CheckpointKey, CheckpointVariant};
pub use sync::context::{Clock, FixedClock, SyncContext, SyncSettings, SystemClock};
pub use sync::orchestrator::BackfillTick;
pub use sync::planner::{BackfillProgress, Plan, SyncMode};
pub use sync::policy::{DatasetKey, DatasetPolicy, PolicySet};
pub use sync::runner::RunOutcome;
pub use sync::week_sync::WeekSyncReport;
pub use sync::{
    ChannelProgress, DatasetReport, NoopProgress, SyncEvent, SyncProgress, SyncStatus, WaveReport,
};

// Re-export repository types needed by the binary crate, but not the module itself
pub use storage::repository::SyncRunRecord;

use date_util::{watermark, DateRange};
use storage::repository;
use sync::coverage;
use sync::jobs::job_for;
use sync::orchestrator::Orchestrator;
use sync::runner::{RunOptions, Runner};
use sync::week_sync::WeekSync;

/// Freshness of one dataset, for the `status` command.
#[derive(Debug, Clone, Serialize)]
pub struct DatasetStatus {
    pub dataset: DatasetKey,
    pub forward: Option<Checkpoint>,
    pub backfill: Option<Checkpoint>,
    pub last_run: Option<SyncRunRecord>,
    /// Unloaded ranges between the history floor and the watermark.
    pub gaps: Vec<DateRange>,
}

/// Main entry point for the seller data warehouse.
pub struct SellerDW {
    runner: Arc<Runner>,
    orchestrator: Orchestrator,
}

impl SellerDW {
    /// A warehouse over `db` that syncs from `api` with the system clock and
    /// default timing.
    pub fn new(
        db: Database,
        api: Arc<dyn MarketplaceApi>,
        policies: PolicySet,
        progress: Arc<dyn SyncProgress>,
    ) -> Self {
        Self::from_context(SyncContext {
            db,
            api,
            clock: Arc::new(SystemClock),
            policies,
            settings: SyncSettings::default(),
            progress,
        })
    }

    pub fn from_context(ctx: SyncContext) -> Self {
        let runner = Arc::new(Runner::new(Arc::new(ctx)));
        Self {
            orchestrator: Orchestrator::new(runner.clone()),
            runner,
        }
    }

    fn ctx(&self) -> &SyncContext {
        self.runner.context()
    }

    /// Access the database (for direct queries in the CLI).
    pub fn db(&self) -> &Database {
        &self.ctx().db
    }

    // ── Sync commands ──────────────────────────────────────────────

    pub async fn sync_priority(&self) -> Result<WaveReport> {
        self.orchestrator.run_priority_wave().await
    }

    pub async fn sync_refresh(&self) -> Result<WaveReport> {
        self.orchestrator.run_refresh_wave().await
    }

    /// Run catch-up ticks until no dataset has a further plan or a tick makes
    /// no progress. Returns every tick's report.
    pub async fn sync_catchup(&self, max_datasets: usize) -> Result<Vec<WaveReport>> {
        let mut reports = Vec::new();
        loop {
            let report = self.orchestrator.run_catchup_tick(max_datasets).await?;
            let progressed = report
                .datasets
                .iter()
                .any(|r| r.status == SyncStatus::Success);
            reports.push(report);
            if !progressed {
                break;
            }
        }
        Ok(reports)
    }

    pub async fn sync_backfill(&self) -> Result<BackfillTick> {
        self.orchestrator.run_backfill_tick().await
    }

    /// Sync one dataset by one plan. With `overlap_days` this is a trailing
    /// refresh; otherwise the next catch-up chunk.
    pub async fn sync_dataset(
        &self,
        dataset: DatasetKey,
        overlap_days: Option<u32>,
    ) -> Result<Option<RunOutcome>> {
        let options = RunOptions {
            priority_overlap_days: overlap_days,
        };
        self.runner.run(job_for(dataset).as_ref(), &options).await
    }

    /// Sweep history back to `lower_bound`, or to the sales backfill lower
    /// bound when none is given.
    pub async fn sync_weeks(
        &self,
        lower_bound: Option<NaiveDate>,
        max_windows: usize,
    ) -> Result<WeekSyncReport> {
        let lower_bound = lower_bound.unwrap_or_else(|| {
            self.ctx()
                .policy(DatasetKey::Sales)
                .backfill_lower_bound(self.ctx().today())
        });
        WeekSync::new(self.runner.clone(), lower_bound)
            .run(max_windows)
            .await
    }

    // ── Progress and status ────────────────────────────────────────

    pub async fn backfill_progress(&self) -> Result<BackfillProgress> {
        self.orchestrator.backfill_progress().await
    }

    pub async fn status(&self) -> Result<Vec<DatasetStatus>> {
        let ctx = self.ctx();
        let today = ctx.today();
        let (checkpoints, runs) = ctx
            .db
            .reader()
            .call(|conn| {
                Ok::<_, rusqlite::Error>((
                    repository::list_checkpoints(conn)?,
                    repository::latest_sync_runs(conn)?,
                ))
            })
            .await?;

        let mut statuses = Vec::with_capacity(DatasetKey::ALL.len());
        for dataset in DatasetKey::ALL {
            let find = |variant: CheckpointVariant| {
                checkpoints
                    .iter()
                    .find(|cp| cp.key == CheckpointKey::new(dataset, variant))
                    .cloned()
            };
            let loaded = ctx
                .db
                .reader()
                .call(move |conn| repository::loaded_ranges(conn, dataset))
                .await?;
            let wm = watermark(today);
            let floor = ctx
                .policy(dataset)
                .max_history_days
                .map(|days| wm - chrono::Duration::days(i64::from(days) - 1))
                .unwrap_or(wm);
            statuses.push(DatasetStatus {
                dataset,
                forward: find(CheckpointVariant::Forward),
                backfill: find(CheckpointVariant::Backfill),
                last_run: runs.iter().find(|r| r.dataset == dataset.as_str()).cloned(),
                gaps: coverage::find_gaps(DateRange::new(floor, wm), &loaded),
            });
        }
        Ok(statuses)
    }

    // ── Config commands ────────────────────────────────────────────

    pub async fn config_get(&self, key: &str) -> Result<Option<String>> {
        let value = self
            .db()
            .reader()
            .call({
                let key = key.to_string();
                move |conn| repository::get_config(conn, &key)
            })
            .await?;
        Ok(value)
    }

    pub async fn config_set(&self, key: &str, value: &str) -> Result<()> {
        self.db()
            .writer()
            .call({
                let key = key.to_string();
                let value = value.to_string();
                move |conn| repository::set_config(conn, &key, &value)
            })
            .await?;
        Ok(())
    }

    pub async fn config_list(&self) -> Result<Vec<(String, String)>> {
        let entries = self
            .db()
            .reader()
            .call(|conn| repository::list_config(conn))
            .await?;
        Ok(entries)
    }
}
