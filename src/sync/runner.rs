//! Runs one plan for one dataset: fetch, apply, then advance the checkpoint
//! and record the loaded period.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;

use crate::date_util::DateRange;
use crate::error::{Error, Result};
use crate::storage::repository;
use crate::sync::checkpoint::{Checkpoint, CheckpointKey, CheckpointVariant, LoadedPeriod, PeriodType};
use crate::sync::context::SyncContext;
use crate::sync::jobs::finance::{self, FinanceJob, FinanceStream, FINANCE_PAGE_SIZE};
use crate::sync::jobs::{Applied, SyncJob};
use crate::sync::planner::{build_trailing_plan, Plan};
use crate::sync::policy::DatasetKey;

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Run a refresh of this many trailing days instead of the job's own plan.
    pub priority_overlap_days: Option<u32>,
}

/// Result of one successfully committed plan.
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub plan: Plan,
    pub fetched: u64,
    pub applied: u64,
    pub checkpoint: Checkpoint,
}

/// Marks datasets as in flight until dropped.
pub(crate) struct FlightGuard<'a> {
    in_flight: &'a Mutex<HashSet<DatasetKey>>,
    datasets: Vec<DatasetKey>,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        for dataset in &self.datasets {
            in_flight.remove(dataset);
        }
    }
}

pub struct Runner {
    ctx: Arc<SyncContext>,
    in_flight: Mutex<HashSet<DatasetKey>>,
    finance_page_size: u32,
}

impl Runner {
    pub fn new(ctx: Arc<SyncContext>) -> Self {
        Self {
            ctx,
            in_flight: Mutex::new(HashSet::new()),
            finance_page_size: FINANCE_PAGE_SIZE,
        }
    }

    pub fn with_finance_page_size(mut self, page_size: u32) -> Self {
        self.finance_page_size = page_size.max(1);
        self
    }

    pub fn context(&self) -> &SyncContext {
        &self.ctx
    }

    /// Claim every dataset or none. A dataset already in flight fails fast.
    pub(crate) fn claim(&self, datasets: &[DatasetKey]) -> Result<FlightGuard<'_>> {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(busy) = datasets.iter().find(|d| in_flight.contains(d)) {
            return Err(Error::Busy(*busy));
        }
        in_flight.extend(datasets.iter().copied());
        Ok(FlightGuard {
            in_flight: &self.in_flight,
            datasets: datasets.to_vec(),
        })
    }

    pub async fn load_checkpoint(&self, key: CheckpointKey) -> Result<Option<Checkpoint>> {
        let checkpoint = self
            .ctx
            .db
            .reader()
            .call(move |conn| repository::get_checkpoint(conn, key))
            .await?;
        Ok(checkpoint)
    }

    /// Build the job's next plan from its forward checkpoint (or a trailing
    /// refresh when `options` asks for one) and run it. `Ok(None)` means
    /// there was nothing to do.
    pub async fn run(&self, job: &dyn SyncJob, options: &RunOptions) -> Result<Option<RunOutcome>> {
        let dataset = job.key();
        let _guard = self.claim(&[dataset])?;

        let plan = match options.priority_overlap_days {
            Some(days) => Some(build_trailing_plan(dataset, days, self.ctx.today())),
            None => {
                let previous = self.load_checkpoint(CheckpointKey::forward(dataset)).await?;
                job.next_plan(&self.ctx, previous.as_ref())
            }
        };
        let Some(plan) = plan else {
            log::info!("{dataset}: caught up, nothing to sync");
            return Ok(None);
        };
        self.execute(job, plan).await.map(Some)
    }

    /// Run a pre-built plan.
    pub async fn run_with_plan(&self, job: &dyn SyncJob, plan: Plan) -> Result<RunOutcome> {
        let _guard = self.claim(&[plan.dataset])?;
        self.execute(job, plan).await
    }

    async fn execute(&self, job: &dyn SyncJob, plan: Plan) -> Result<RunOutcome> {
        self.ctx.progress.on_plan(&plan);
        log::info!("Syncing {plan}");
        let run_id = self.start_run(&plan).await?;

        let applied = match job.fetch_and_apply(&self.ctx, &plan).await {
            Ok(applied) => applied,
            Err(e) => {
                self.fail_run(run_id, &e).await;
                return Err(e);
            }
        };

        let variant = CheckpointVariant::for_plan(&plan);
        let previous = self
            .load_checkpoint(CheckpointKey::new(plan.dataset, variant))
            .await?;
        let checkpoint = job.checkpoint_after(&self.ctx, &plan, previous.as_ref(), &applied);
        let loaded = job.covered_range(&plan);
        self.commit(run_id, plan, loaded, applied, checkpoint).await
    }

    /// Fetch the shared finance stream once for `plan`'s range and apply it
    /// to each of `datasets`. A fetch failure fails the whole batch; apply
    /// failures are reported per dataset.
    pub async fn run_finance_batch(
        &self,
        plan: &Plan,
        datasets: &[DatasetKey],
    ) -> Result<Vec<(DatasetKey, Result<RunOutcome>)>> {
        let _guard = self.claim(datasets)?;
        let plans: Vec<Plan> = datasets.iter().map(|d| plan.for_dataset(*d)).collect();
        let mut run_ids = Vec::with_capacity(plans.len());
        for p in &plans {
            self.ctx.progress.on_plan(p);
            run_ids.push(self.start_run(p).await?);
        }

        let stream = match finance::fetch_stream(&self.ctx, plan, self.finance_page_size).await {
            Ok(stream) => stream,
            Err(e) => {
                for run_id in run_ids {
                    self.fail_run(run_id, &e).await;
                }
                return Err(e);
            }
        };
        log::info!(
            "Finance batch {} ({}): {} upstream rows, {} tracked lines",
            plan.range,
            plan.granularity.as_str(),
            stream.fetched,
            stream.lines.len()
        );

        let mut results = Vec::with_capacity(plans.len());
        for (p, run_id) in plans.into_iter().zip(run_ids) {
            let dataset = p.dataset;
            let outcome = self.apply_finance(p, run_id, &stream).await;
            if let Err(e) = &outcome {
                log::warn!("{dataset}: finance apply failed: {e}");
            }
            results.push((dataset, outcome));
        }
        Ok(results)
    }

    async fn apply_finance(&self, plan: Plan, run_id: i64, stream: &FinanceStream) -> Result<RunOutcome> {
        let applied = match finance::apply_lines(&self.ctx, &plan, &stream.lines).await {
            Ok(applied) => applied,
            Err(e) => {
                self.fail_run(run_id, &e).await;
                return Err(e);
            }
        };
        self.ctx.progress.on_applied(plan.dataset, &plan.range, applied);
        let applied = Applied {
            fetched: stream.count_for(plan.dataset),
            applied,
            cursor_token: None,
        };

        let job = FinanceJob::new(plan.dataset);
        let variant = CheckpointVariant::for_plan(&plan);
        let previous = self
            .load_checkpoint(CheckpointKey::new(plan.dataset, variant))
            .await?;
        let checkpoint = job.checkpoint_after(&self.ctx, &plan, previous.as_ref(), &applied);
        let loaded = job.covered_range(&plan);
        self.commit(run_id, plan, loaded, applied, checkpoint).await
    }

    async fn start_run(&self, plan: &Plan) -> Result<i64> {
        let plan = plan.clone();
        let run_id = self
            .ctx
            .db
            .writer()
            .call(move |conn| repository::insert_sync_run(conn, &plan))
            .await?;
        Ok(run_id)
    }

    async fn fail_run(&self, run_id: i64, error: &Error) {
        let message = error.to_string();
        let result = self
            .ctx
            .db
            .writer()
            .call(move |conn| repository::finish_sync_run(conn, run_id, "failed", 0, 0, Some(message.as_str())))
            .await;
        if let Err(e) = result {
            log::warn!("Could not record failed run {run_id}: {e}");
        }
    }

    /// Advance the checkpoint and record the loaded period, after a
    /// successful apply. The period is recorded even when nothing was
    /// applied so empty windows are not fetched again.
    async fn commit(
        &self,
        run_id: i64,
        plan: Plan,
        loaded: DateRange,
        applied: Applied,
        checkpoint: Checkpoint,
    ) -> Result<RunOutcome> {
        let period = LoadedPeriod {
            dataset: plan.dataset,
            period_type: PeriodType::from(plan.granularity),
            range: loaded,
            applied_at: self.ctx.now(),
            record_count: applied.applied,
        };
        let saved = checkpoint.clone();
        let (fetched, applied_rows) = (applied.fetched, applied.applied);
        let committed = self
            .ctx
            .db
            .writer()
            .call(move |conn| {
                let tx = conn.transaction()?;
                repository::save_checkpoint(&tx, &saved)?;
                repository::insert_loaded_period(&tx, &period)?;
                repository::finish_sync_run(&tx, run_id, "completed", fetched, applied_rows, None)?;
                tx.commit()
            })
            .await;
        if let Err(e) = committed {
            let e = Error::from(e);
            self.fail_run(run_id, &e).await;
            return Err(e);
        }

        self.ctx.progress.on_checkpoint(&checkpoint);
        log::info!(
            "{}: applied {applied_rows} rows for {}, checkpoint {} -> {}",
            plan.dataset,
            plan.range,
            checkpoint.key,
            checkpoint.cursor_time
        );
        Ok(RunOutcome {
            plan,
            fetched,
            applied: applied_rows,
            checkpoint,
        })
    }
}
