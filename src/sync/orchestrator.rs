//! Sequences the sync waves across datasets.
//!
//! Finance datasets share one upstream stream and are always fetched as a
//! batch in their own branch, concurrent with the independent branches of
//! everything else. A dataset failure
//! is recorded in the wave report and never stops its siblings.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Duration;
use futures::future::join_all;
use futures::join;

use crate::date_util::{last_closed_week, DateRange};
use crate::error::{Error, Result};
use crate::storage::repository;
use crate::sync::checkpoint::{Checkpoint, CheckpointKey, CoverageRule, PeriodType};
use crate::sync::context::SyncContext;
use crate::sync::jobs::job_for;
use crate::sync::planner::{
    backfill_progress, build_backfill_plan, build_catchup_plan, build_closed_week_plan,
    build_priority_plan, build_refresh_plan, build_sales_backfill_plan, build_trailing_plan,
    BackfillProgress, Plan,
};
use crate::sync::policy::DatasetKey;
use crate::sync::runner::{RunOutcome, Runner};
use crate::sync::{DatasetReport, WaveReport};

/// Result of one backfill tick.
#[derive(Debug, Clone)]
pub struct BackfillTick {
    pub report: WaveReport,
    /// Progress of the weekly finance sweep after this tick.
    pub progress: BackfillProgress,
}

pub struct Orchestrator {
    runner: Arc<Runner>,
}

impl Orchestrator {
    pub fn new(runner: Arc<Runner>) -> Self {
        Self { runner }
    }

    pub fn runner(&self) -> &Runner {
        &self.runner
    }

    fn ctx(&self) -> &SyncContext {
        self.runner.context()
    }

    /// Short fast load of every dataset's priority window, plus the weekly
    /// load of the last closed week for finance datasets that lack it.
    pub async fn run_priority_wave(&self) -> Result<WaveReport> {
        let ctx = self.ctx();
        let today = ctx.today();
        let mut report = WaveReport::new("priority");

        let days = DatasetKey::FINANCE
            .iter()
            .map(|k| ctx.policy(*k).priority_days)
            .max()
            .unwrap_or(1);
        let plan = build_trailing_plan(DatasetKey::Sales, days, today);
        let others: Vec<Plan> = non_finance()
            .map(|k| build_priority_plan(k, ctx.policy(k), today))
            .collect();

        let (finance, others) = join!(
            self.finance_branch(&plan, &DatasetKey::FINANCE),
            self.run_plans(others)
        );
        self.record_all(&mut report, finance);
        self.record_all(&mut report, others);

        self.finish(report)
    }

    /// Re-validate each dataset's trailing overlap window, skipping datasets
    /// refreshed within their cadence.
    pub async fn run_refresh_wave(&self) -> Result<WaveReport> {
        let ctx = self.ctx();
        let today = ctx.today();
        let mut report = WaveReport::new("refresh");

        let mut due_finance = Vec::new();
        let mut plans = Vec::new();
        for dataset in DatasetKey::ALL {
            if !self.refresh_due(dataset).await? {
                log::debug!("{dataset}: refreshed recently, skipping");
                self.record(&mut report, DatasetReport::skipped(dataset));
                continue;
            }
            if dataset.is_finance() {
                due_finance.push(dataset);
            } else {
                plans.push(build_refresh_plan(dataset, ctx.policy(dataset), today));
            }
        }

        let finance = async {
            if due_finance.is_empty() {
                return Vec::new();
            }
            let days = due_finance
                .iter()
                .map(|k| ctx.policy(*k).refresh_overlap_days)
                .max()
                .unwrap_or(1);
            let plan = build_trailing_plan(DatasetKey::Sales, days, today);
            self.finance_branch(&plan, &due_finance).await
        };
        let (finance, others) = join!(finance, self.run_plans(plans));
        self.record_all(&mut report, finance);
        self.record_all(&mut report, others);

        self.finish(report)
    }

    /// Advance up to `max_datasets` datasets by one catch-up chunk each.
    /// Finance datasets whose next chunks coincide share one fetch. Every
    /// dataset reporting `Skipped` means everything is caught up.
    pub async fn run_catchup_tick(&self, max_datasets: usize) -> Result<WaveReport> {
        let ctx = self.ctx();
        let today = ctx.today();
        let mut report = WaveReport::new("catchup");

        let mut finance_groups = FinanceGroups::new();
        let mut plans = Vec::new();
        let mut budget = max_datasets.max(1);
        for dataset in DatasetKey::ALL {
            let checkpoint = self.runner.load_checkpoint(CheckpointKey::forward(dataset)).await?;
            let plan = if dataset.is_finance() {
                build_catchup_plan(dataset, ctx.policy(dataset), checkpoint.as_ref(), today)
            } else {
                job_for(dataset).next_plan(ctx, checkpoint.as_ref())
            };
            let Some(plan) = plan else {
                self.record(&mut report, DatasetReport::skipped(dataset));
                continue;
            };
            if budget == 0 {
                log::debug!("{dataset}: deferred to the next catch-up tick");
                continue;
            }
            budget -= 1;
            if dataset.is_finance() {
                group_finance(&mut finance_groups, plan);
            } else {
                plans.push(plan);
            }
        }

        let (finance, others) = join!(self.finance_groups(finance_groups), self.run_plans(plans));
        self.record_all(&mut report, finance);
        self.record_all(&mut report, others);

        self.finish(report)
    }

    /// Move each backfill cursor back by one step: a calendar week for
    /// finance datasets, `chunk_days` for the others.
    pub async fn run_backfill_tick(&self) -> Result<BackfillTick> {
        let ctx = self.ctx();
        let today = ctx.today();
        let mut report = WaveReport::new("backfill");

        let mut finance_groups = FinanceGroups::new();
        let mut plans = Vec::new();
        for dataset in DatasetKey::ALL {
            let policy = ctx.policy(dataset);
            if !policy.backfill_enabled() {
                continue;
            }
            let checkpoint = self.runner.load_checkpoint(CheckpointKey::backfill(dataset)).await?;
            let plan = if dataset.is_finance() {
                build_sales_backfill_plan(dataset, policy, checkpoint.as_ref(), today)
            } else {
                build_backfill_plan(dataset, policy, checkpoint.as_ref(), today)
            };
            match plan {
                Some(plan) if dataset.is_finance() => group_finance(&mut finance_groups, plan),
                Some(plan) => plans.push(plan),
                None => {
                    log::debug!("{dataset}: backfill complete");
                    self.record(&mut report, DatasetReport::skipped(dataset));
                }
            }
        }

        let (finance, others) = join!(self.finance_groups(finance_groups), self.run_plans(plans));
        self.record_all(&mut report, finance);
        self.record_all(&mut report, others);

        let progress = self.backfill_progress().await?;
        log::info!(
            "Backfill: {} weeks done, {} remaining ({:.1}%)",
            progress.weeks_done,
            progress.weeks_remaining,
            progress.percent
        );
        let report = self.finish(report)?;
        Ok(BackfillTick { report, progress })
    }

    /// Progress of the weekly sales backfill.
    pub async fn backfill_progress(&self) -> Result<BackfillProgress> {
        let ctx = self.ctx();
        let checkpoint = self
            .runner
            .load_checkpoint(CheckpointKey::backfill(DatasetKey::Sales))
            .await?;
        Ok(backfill_progress(
            ctx.policy(DatasetKey::Sales),
            checkpoint.as_ref(),
            ctx.today(),
        ))
    }

    async fn refresh_due(&self, dataset: DatasetKey) -> Result<bool> {
        let checkpoint = self.runner.load_checkpoint(CheckpointKey::forward(dataset)).await?;
        let cadence = Duration::minutes(i64::from(self.ctx().policy(dataset).refresh_every_minutes));
        Ok(!recently_updated(checkpoint.as_ref(), self.ctx().now() - cadence))
    }

    /// Trailing finance batch followed by the closed-week check. Both touch
    /// the shared finance stream, so they run in order within one branch.
    async fn finance_branch(&self, trailing: &Plan, datasets: &[DatasetKey]) -> Vec<DatasetReport> {
        let mut entries = self.finance_batch(trailing, datasets).await;
        entries.extend(self.closed_week_check(datasets).await);
        entries
    }

    async fn finance_groups(&self, groups: FinanceGroups) -> Vec<DatasetReport> {
        let mut entries = Vec::new();
        for (plan, datasets) in groups.into_values() {
            entries.extend(self.finance_batch(&plan, &datasets).await);
        }
        entries
    }

    /// Weekly load of the last closed week for the datasets that have not
    /// loaded it yet at weekly granularity.
    async fn closed_week_check(&self, datasets: &[DatasetKey]) -> Vec<DatasetReport> {
        let week = last_closed_week(self.ctx().today());
        let mut entries = Vec::new();
        let mut pending = Vec::new();
        for &dataset in datasets {
            let loaded = self
                .ctx()
                .db
                .reader()
                .call(move |conn| {
                    repository::is_period_loaded(
                        conn,
                        dataset,
                        PeriodType::Weekly,
                        &week,
                        CoverageRule::SameGranularity,
                    )
                })
                .await;
            match loaded {
                Ok(true) => log::debug!("{dataset}: week {week} already loaded"),
                Ok(false) => pending.push(dataset),
                Err(e) => {
                    let error = Error::from(e).to_string();
                    entries.push(DatasetReport::failed(dataset, None, error));
                }
            }
        }
        if !pending.is_empty() {
            let plan = build_closed_week_plan(DatasetKey::Sales, self.ctx().today());
            entries.extend(self.finance_batch(&plan, &pending).await);
        }
        entries
    }

    async fn finance_batch(&self, plan: &Plan, datasets: &[DatasetKey]) -> Vec<DatasetReport> {
        match self.runner.run_finance_batch(plan, datasets).await {
            Ok(results) => results
                .into_iter()
                .map(|(dataset, result)| to_report(dataset, &plan.for_dataset(dataset), result))
                .collect(),
            Err(Error::Busy(busy)) => {
                log::info!("{busy}: already syncing, finance batch {plan} skipped");
                datasets.iter().map(|&dataset| DatasetReport::skipped(dataset)).collect()
            }
            Err(e) => {
                log::error!("Finance batch {plan} failed: {e}");
                let message = e.to_string();
                datasets
                    .iter()
                    .map(|&dataset| {
                        DatasetReport::failed(dataset, Some(&plan.for_dataset(dataset)), message.clone())
                    })
                    .collect()
            }
        }
    }

    /// Run independent plans concurrently.
    async fn run_plans(&self, plans: Vec<Plan>) -> Vec<DatasetReport> {
        let runs = plans.into_iter().map(|plan| async move {
            let job = job_for(plan.dataset);
            let result = self.runner.run_with_plan(job.as_ref(), plan.clone()).await;
            to_report(plan.dataset, &plan, result)
        });
        join_all(runs).await
    }

    fn record_all(&self, report: &mut WaveReport, entries: Vec<DatasetReport>) {
        for entry in entries {
            self.record(report, entry);
        }
    }

    fn record(&self, report: &mut WaveReport, entry: DatasetReport) {
        self.ctx().progress.on_dataset_complete(&entry);
        report.push(entry);
    }

    fn finish(&self, report: WaveReport) -> Result<WaveReport> {
        let failures = report.failures();
        if !failures.is_empty() && failures.len() == report.datasets.len() {
            log::error!("{} wave: every dataset failed", report.wave);
            return Err(Error::WaveFailed {
                wave: report.wave,
                failures,
            });
        }
        log::info!(
            "{} wave finished ({:?}): {} applied, {} failed",
            report.wave,
            report.status(),
            report.total_applied(),
            failures.len()
        );
        for (dataset, error) in &failures {
            log::warn!("{dataset}: {error}");
        }
        Ok(report)
    }
}

/// Finance plans keyed by window; datasets with the same window share a fetch.
type FinanceGroups = BTreeMap<DateRange, (Plan, Vec<DatasetKey>)>;

fn group_finance(groups: &mut FinanceGroups, plan: Plan) {
    let dataset = plan.dataset;
    groups
        .entry(plan.range)
        .or_insert_with(|| (plan, Vec::new()))
        .1
        .push(dataset);
}

fn non_finance() -> impl Iterator<Item = DatasetKey> {
    DatasetKey::ALL.into_iter().filter(|k| !k.is_finance())
}

fn recently_updated(checkpoint: Option<&Checkpoint>, since: chrono::DateTime<chrono::Utc>) -> bool {
    checkpoint.is_some_and(|cp| cp.updated_at > since)
}

fn to_report(dataset: DatasetKey, plan: &Plan, result: Result<RunOutcome>) -> DatasetReport {
    match result {
        Ok(outcome) => DatasetReport::success(&outcome.plan, outcome.fetched, outcome.applied),
        Err(Error::Busy(_)) => {
            log::info!("{dataset}: already syncing, skipped");
            DatasetReport::skipped(dataset)
        }
        Err(e) => DatasetReport::failed(dataset, Some(plan), e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{
        ApiError, ApiResult, Feed, Granularity, MarketplaceApi, PageRequest, ReportKind, TaskStatus,
    };
    use crate::sync::jobs::fake::{d, test_context, FakeApi};
    use serde_json::Value;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::Notify;
    use crate::sync::SyncStatus;

    async fn orchestrator(api: Arc<FakeApi>, today: chrono::NaiveDate) -> Orchestrator {
        let runner = Runner::new(Arc::new(test_context(api, today).await));
        Orchestrator::new(Arc::new(runner))
    }

    fn finance_requests(api: &FakeApi, granularity: Granularity) -> usize {
        api.requests(Feed::FinanceReport)
            .iter()
            .filter(|r| r.granularity == granularity)
            .count()
    }

    #[tokio::test]
    async fn test_priority_wave_skips_loaded_closed_week_on_rerun() {
        let api = FakeApi::new();
        let orch = orchestrator(api.clone(), d(2024, 2, 7)).await;

        let first = orch.run_priority_wave().await.unwrap();
        assert_eq!(first.status(), SyncStatus::Success);
        assert_eq!(finance_requests(&api, Granularity::Daily), 1);
        assert_eq!(finance_requests(&api, Granularity::Weekly), 1);
        let weekly = api
            .requests(Feed::FinanceReport)
            .into_iter()
            .find(|r| r.granularity == Granularity::Weekly)
            .unwrap();
        assert_eq!(weekly.range, DateRange::new(d(2024, 1, 29), d(2024, 2, 4)));

        orch.run_priority_wave().await.unwrap();
        assert_eq!(finance_requests(&api, Granularity::Daily), 2);
        assert_eq!(finance_requests(&api, Granularity::Weekly), 1);
    }

    #[tokio::test]
    async fn test_one_failing_dataset_does_not_fail_the_wave() {
        let api = FakeApi::new();
        api.push_page_result(Feed::Supplies, Err(ApiError::Unauthorized("revoked".into())));
        let orch = orchestrator(api, d(2024, 2, 7)).await;

        let report = orch.run_priority_wave().await.unwrap();
        assert_eq!(report.status(), SyncStatus::PartialFailure);
        let failures = report.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, DatasetKey::Supplies);
        assert!(failures[0].1.contains("revoked"));
    }

    #[tokio::test]
    async fn test_wave_fails_only_when_every_dataset_failed() {
        let orch = orchestrator(FakeApi::new(), d(2024, 2, 7)).await;
        let mut report = WaveReport::new("refresh");
        report.push(DatasetReport::failed(DatasetKey::Sales, None, "boom".into()));
        report.push(DatasetReport::failed(DatasetKey::Stocks, None, "bang".into()));

        let err = orch.finish(report).unwrap_err();
        assert!(matches!(err, Error::WaveFailed { ref failures, .. } if failures.len() == 2));
    }

    #[tokio::test]
    async fn test_refresh_wave_respects_cadence() {
        let orch = orchestrator(FakeApi::new(), d(2024, 2, 7)).await;
        orch.run_priority_wave().await.unwrap();

        let report = orch.run_refresh_wave().await.unwrap();
        assert_eq!(report.status(), SyncStatus::Skipped);
        assert_eq!(report.datasets.len(), DatasetKey::ALL.len());
    }

    #[tokio::test]
    async fn test_catchup_tick_is_bounded_and_shares_finance_fetch() {
        let api = FakeApi::new();
        let orch = orchestrator(api.clone(), d(2024, 2, 7)).await;

        let report = orch.run_catchup_tick(2).await.unwrap();
        let ran: Vec<DatasetKey> = report
            .datasets
            .iter()
            .filter(|r| r.status == SyncStatus::Success)
            .map(|r| r.dataset)
            .collect();
        assert_eq!(ran, vec![DatasetKey::Sales, DatasetKey::Returns]);
        assert_eq!(api.requests(Feed::FinanceReport).len(), 1);
    }

    #[tokio::test]
    async fn test_backfill_tick_moves_one_week_back() {
        let api = FakeApi::new();
        let orch = orchestrator(api.clone(), d(2024, 2, 7)).await;

        let first = orch.run_backfill_tick().await.unwrap();
        assert_eq!(first.progress.weeks_done, 1);
        let sweep = orch
            .runner()
            .load_checkpoint(CheckpointKey::backfill(DatasetKey::Sales))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(sweep.cursor_time, d(2024, 1, 28));

        let second = orch.run_backfill_tick().await.unwrap();
        assert_eq!(second.progress.weeks_done, 2);
        assert!(second.progress.weeks_remaining < first.progress.weeks_remaining);
        let ranges: Vec<DateRange> = api.requests(Feed::FinanceReport).iter().map(|r| r.range).collect();
        assert_eq!(
            ranges,
            vec![
                DateRange::new(d(2024, 1, 22), d(2024, 1, 28)),
                DateRange::new(d(2024, 1, 15), d(2024, 1, 21)),
            ]
        );
    }

    /// Holds every finance fetch until a supplies fetch has started.
    struct GatedFinance {
        inner: Arc<FakeApi>,
        supplies_started: AtomicBool,
        started: Notify,
    }

    #[async_trait::async_trait]
    impl MarketplaceApi for GatedFinance {
        async fn fetch_page(&self, request: &PageRequest) -> ApiResult<Vec<Value>> {
            match request.feed {
                Feed::Supplies => {
                    self.supplies_started.store(true, Ordering::SeqCst);
                    self.started.notify_waiters();
                }
                Feed::FinanceReport => {
                    let wait = async {
                        loop {
                            let notified = self.started.notified();
                            if self.supplies_started.load(Ordering::SeqCst) {
                                break;
                            }
                            notified.await;
                        }
                    };
                    if tokio::time::timeout(std::time::Duration::from_secs(2), wait).await.is_err() {
                        return Err(ApiError::Unavailable("supplies never started".into()));
                    }
                }
                _ => {}
            }
            self.inner.fetch_page(request).await
        }

        async fn submit_report(&self, kind: ReportKind, range: &DateRange) -> ApiResult<String> {
            self.inner.submit_report(kind, range).await
        }

        async fn report_status(&self, kind: ReportKind, task_id: &str) -> ApiResult<TaskStatus> {
            self.inner.report_status(kind, task_id).await
        }

        async fn download_report(&self, kind: ReportKind, task_id: &str) -> ApiResult<Vec<Value>> {
            self.inner.download_report(kind, task_id).await
        }

        async fn campaigns(&self, ids: &[i64]) -> ApiResult<Vec<Value>> {
            self.inner.campaigns(ids).await
        }
    }

    #[tokio::test]
    async fn test_priority_wave_runs_finance_alongside_other_datasets() {
        let inner = FakeApi::new();
        let mut ctx = test_context(inner.clone(), d(2024, 2, 7)).await;
        ctx.api = Arc::new(GatedFinance {
            inner: inner.clone(),
            supplies_started: AtomicBool::new(false),
            started: Notify::new(),
        });
        let orch = Orchestrator::new(Arc::new(Runner::new(Arc::new(ctx))));

        let report = orch.run_priority_wave().await.unwrap();
        assert!(report.failures().is_empty(), "{:?}", report.failures());
        assert_eq!(finance_requests(&inner, Granularity::Daily), 1);
        assert_eq!(inner.requests(Feed::Supplies).len(), 1);
    }
}
