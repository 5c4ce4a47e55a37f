//! Backward sweep over the whole history, one calendar window at a time.
//!
//! Windows are whole Monday–Sunday weeks plus a daily window for the open
//! trailing week. Dataset × window combinations already in the loaded-period
//! registry are skipped. A cursor in `app_config` lets an interrupted sweep
//! resume at the next unprocessed window.

use std::sync::Arc;

use chrono::NaiveDate;
use serde::Serialize;

use crate::api::Granularity;
use crate::date_util::{date_key, parse_day, split_into_weeks, watermark, DateRange};
use crate::error::{Error, Result};
use crate::storage::repository;
use crate::sync::checkpoint::{CoverageRule, PeriodType};
use crate::sync::context::SyncContext;
use crate::sync::jobs::job_for;
use crate::sync::planner::{Plan, SyncMode};
use crate::sync::policy::DatasetKey;
use crate::sync::runner::Runner;

pub const CURSOR_KEY: &str = "week_sync.cursor";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WeekSyncReport {
    pub windows_total: usize,
    pub processed: usize,
    /// Windows every dataset had already loaded.
    pub skipped: usize,
    /// Windows given up on after exhausting retries.
    pub failed: usize,
    pub completed: bool,
}

enum WindowOutcome {
    Processed,
    Skipped,
    Failed,
}

pub struct WeekSync {
    runner: Arc<Runner>,
    lower_bound: NaiveDate,
    datasets: Vec<DatasetKey>,
}

impl WeekSync {
    /// Sweep every dated dataset back to `lower_bound`. Stocks and the
    /// catalog have no history to sweep.
    pub fn new(runner: Arc<Runner>, lower_bound: NaiveDate) -> Self {
        let datasets = DatasetKey::ALL
            .into_iter()
            .filter(|k| !matches!(k, DatasetKey::Stocks | DatasetKey::Catalog))
            .collect();
        Self {
            runner,
            lower_bound,
            datasets,
        }
    }

    pub fn with_datasets(mut self, datasets: &[DatasetKey]) -> Self {
        self.datasets = datasets.to_vec();
        self
    }

    fn ctx(&self) -> &SyncContext {
        self.runner.context()
    }

    /// All windows from the watermark back to the lower bound, newest first.
    pub fn windows(&self) -> Vec<(DateRange, bool)> {
        let wm = watermark(self.ctx().today());
        split_into_weeks(DateRange::new(self.lower_bound, wm))
    }

    pub async fn cursor(&self) -> Result<Option<NaiveDate>> {
        let raw = self
            .ctx()
            .db
            .reader()
            .call(|conn| repository::get_config(conn, CURSOR_KEY))
            .await?;
        Ok(raw.as_deref().and_then(parse_day))
    }

    async fn save_cursor(&self, cursor: NaiveDate) -> Result<()> {
        let value = date_key(cursor);
        self.ctx()
            .db
            .writer()
            .call(move |conn| repository::set_config(conn, CURSOR_KEY, &value))
            .await?;
        Ok(())
    }

    async fn clear_cursor(&self) -> Result<()> {
        self.ctx()
            .db
            .writer()
            .call(|conn| repository::delete_config(conn, CURSOR_KEY))
            .await?;
        Ok(())
    }

    /// Process at most `max_windows` windows past the saved cursor.
    pub async fn run(&self, max_windows: usize) -> Result<WeekSyncReport> {
        let windows = self.windows();
        let cursor = self.cursor().await?;
        let pending: Vec<(DateRange, bool)> = windows
            .iter()
            .copied()
            .filter(|(w, _)| !matches!(cursor, Some(c) if w.from >= c))
            .collect();
        let mut report = WeekSyncReport {
            windows_total: windows.len(),
            ..Default::default()
        };
        log::info!(
            "Week sync: {} of {} windows pending (lower bound {})",
            pending.len(),
            windows.len(),
            self.lower_bound
        );

        let batch = pending.len().min(max_windows);
        for &(window, weekly) in &pending[..batch] {
            match self.process_with_retry(window, weekly).await {
                WindowOutcome::Processed => report.processed += 1,
                WindowOutcome::Skipped => report.skipped += 1,
                WindowOutcome::Failed => report.failed += 1,
            }
            self.save_cursor(window.from).await?;
        }

        if batch == pending.len() {
            self.clear_cursor().await?;
            report.completed = true;
            log::info!("Week sync reached {}", self.lower_bound);
        }
        Ok(report)
    }

    async fn process_with_retry(&self, window: DateRange, weekly: bool) -> WindowOutcome {
        let retry = &self.ctx().settings.window_retry;
        let mut attempts = 0;
        loop {
            match self.process_window(window, weekly).await {
                Ok(true) => return WindowOutcome::Processed,
                Ok(false) => return WindowOutcome::Skipped,
                Err(e) => {
                    attempts += 1;
                    if !retry.should_retry(attempts) {
                        log::error!("Week sync: giving up on {window} after {attempts} attempts: {e}");
                        return WindowOutcome::Failed;
                    }
                    let delay = retry.calculate_delay(attempts - 1);
                    log::warn!("Week sync: {window} failed ({e}), retrying in {delay:?}");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Sync every dataset missing `window`. `Ok(false)` when all had it.
    async fn process_window(&self, window: DateRange, weekly: bool) -> Result<bool> {
        let period_type = if weekly { PeriodType::Weekly } else { PeriodType::Daily };
        let mut finance = Vec::new();
        let mut others = Vec::new();
        for &dataset in &self.datasets {
            if self.is_covered(dataset, period_type, window).await? {
                continue;
            }
            if dataset.is_finance() {
                finance.push(dataset);
            } else {
                others.push(dataset);
            }
        }
        if finance.is_empty() && others.is_empty() {
            log::debug!("Week sync: {window} already loaded");
            return Ok(false);
        }

        let mut errors = Vec::new();
        if !finance.is_empty() {
            let plan = window_plan(finance[0], window, weekly && job_for(finance[0]).weekly_capable());
            match self.runner.run_finance_batch(&plan, &finance).await {
                Ok(results) => errors.extend(
                    results
                        .into_iter()
                        .filter_map(|(k, r)| r.err().map(|e| format!("{k}: {e}"))),
                ),
                Err(e) => errors.push(format!("finance: {e}")),
            }
        }
        for dataset in others {
            let job = job_for(dataset);
            let plan = window_plan(dataset, window, weekly && job.weekly_capable());
            if let Err(e) = self.runner.run_with_plan(job.as_ref(), plan).await {
                errors.push(format!("{dataset}: {e}"));
            }
        }

        if errors.is_empty() {
            Ok(true)
        } else {
            Err(Error::Other(errors.join("; ")))
        }
    }

    async fn is_covered(&self, dataset: DatasetKey, period_type: PeriodType, window: DateRange) -> Result<bool> {
        let covered = self
            .ctx()
            .db
            .reader()
            .call(move |conn| {
                repository::is_period_loaded(conn, dataset, period_type, &window, CoverageRule::AnyGranularity)
            })
            .await?;
        Ok(covered)
    }
}

fn window_plan(dataset: DatasetKey, window: DateRange, weekly: bool) -> Plan {
    Plan {
        dataset,
        range: window,
        mode: SyncMode::Catchup,
        overlap_days: None,
        granularity: if weekly { Granularity::Weekly } else { Granularity::Daily },
    }
}
