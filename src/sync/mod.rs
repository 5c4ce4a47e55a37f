pub mod checkpoint;
pub mod context;
pub mod coverage;
pub mod jobs;
pub mod orchestrator;
pub mod planner;
pub mod policy;
pub mod rate_limit;
pub mod runner;
pub mod week_sync;

use serde::Serialize;
use tokio::sync::mpsc;

use crate::api::{ReportKind, TaskStatus};
use crate::date_util::DateRange;
use crate::sync::checkpoint::Checkpoint;
use crate::sync::planner::{Plan, SyncMode};
use crate::sync::policy::DatasetKey;

/// Observer for sync progress. Every method has a no-op default so
/// implementors only override what they display.
pub trait SyncProgress: Send + Sync {
    fn on_plan(&self, _plan: &Plan) {}
    fn on_page_fetched(&self, _dataset: DatasetKey, _page: u32, _rows: usize) {}
    fn on_report_status(&self, _report: ReportKind, _status: TaskStatus) {}
    fn on_applied(&self, _dataset: DatasetKey, _range: &DateRange, _applied: u64) {}
    fn on_checkpoint(&self, _checkpoint: &Checkpoint) {}
    fn on_dataset_complete(&self, _report: &DatasetReport) {}
}

/// Progress sink that ignores every event.
pub struct NoopProgress;

impl SyncProgress for NoopProgress {}

/// Progress events as plain data, for consumers on another task.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SyncEvent {
    PlanBuilt {
        plan: Plan,
    },
    PageFetched {
        dataset: DatasetKey,
        page: u32,
        rows: usize,
    },
    ReportStatus {
        report: ReportKind,
        status: TaskStatus,
    },
    Applied {
        dataset: DatasetKey,
        range: DateRange,
        applied: u64,
    },
    CheckpointAdvanced {
        checkpoint: Checkpoint,
    },
    DatasetComplete {
        report: DatasetReport,
    },
}

/// Forwards every progress callback as a [`SyncEvent`] on an unbounded
/// channel. Events are dropped once the receiver is gone.
#[derive(Clone)]
pub struct ChannelProgress {
    tx: mpsc::UnboundedSender<SyncEvent>,
}

impl ChannelProgress {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SyncEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, event: SyncEvent) {
        let _ = self.tx.send(event);
    }
}

impl SyncProgress for ChannelProgress {
    fn on_plan(&self, plan: &Plan) {
        self.send(SyncEvent::PlanBuilt { plan: plan.clone() });
    }

    fn on_page_fetched(&self, dataset: DatasetKey, page: u32, rows: usize) {
        self.send(SyncEvent::PageFetched { dataset, page, rows });
    }

    fn on_report_status(&self, report: ReportKind, status: TaskStatus) {
        self.send(SyncEvent::ReportStatus { report, status });
    }

    fn on_applied(&self, dataset: DatasetKey, range: &DateRange, applied: u64) {
        self.send(SyncEvent::Applied {
            dataset,
            range: *range,
            applied,
        });
    }

    fn on_checkpoint(&self, checkpoint: &Checkpoint) {
        self.send(SyncEvent::CheckpointAdvanced {
            checkpoint: checkpoint.clone(),
        });
    }

    fn on_dataset_complete(&self, report: &DatasetReport) {
        self.send(SyncEvent::DatasetComplete {
            report: report.clone(),
        });
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Success,
    /// Nothing to do: caught up, already loaded, or refreshed recently.
    Skipped,
    PartialFailure,
    Failed,
}

/// Outcome of one dataset within a wave.
#[derive(Debug, Clone, Serialize)]
pub struct DatasetReport {
    pub dataset: DatasetKey,
    pub status: SyncStatus,
    pub mode: Option<SyncMode>,
    pub range: Option<DateRange>,
    pub fetched: u64,
    pub applied: u64,
    pub error: Option<String>,
}

impl DatasetReport {
    pub fn success(plan: &Plan, fetched: u64, applied: u64) -> Self {
        Self {
            dataset: plan.dataset,
            status: SyncStatus::Success,
            mode: Some(plan.mode),
            range: Some(plan.range),
            fetched,
            applied,
            error: None,
        }
    }

    pub fn skipped(dataset: DatasetKey) -> Self {
        Self {
            dataset,
            status: SyncStatus::Skipped,
            mode: None,
            range: None,
            fetched: 0,
            applied: 0,
            error: None,
        }
    }

    pub fn failed(dataset: DatasetKey, plan: Option<&Plan>, error: String) -> Self {
        Self {
            dataset,
            status: SyncStatus::Failed,
            mode: plan.map(|p| p.mode),
            range: plan.map(|p| p.range),
            fetched: 0,
            applied: 0,
            error: Some(error),
        }
    }
}

/// Per-dataset outcomes of one orchestrator wave. A dataset can appear more
/// than once when it ran several plans (e.g. the closed-week check).
#[derive(Debug, Clone, Serialize)]
pub struct WaveReport {
    pub wave: String,
    pub datasets: Vec<DatasetReport>,
}

impl WaveReport {
    pub fn new(wave: &str) -> Self {
        Self {
            wave: wave.to_string(),
            datasets: Vec::new(),
        }
    }

    pub fn push(&mut self, report: DatasetReport) {
        self.datasets.push(report);
    }

    pub fn failures(&self) -> Vec<(DatasetKey, String)> {
        self.datasets
            .iter()
            .filter(|r| r.status == SyncStatus::Failed)
            .map(|r| (r.dataset, r.error.clone().unwrap_or_default()))
            .collect()
    }

    pub fn total_applied(&self) -> u64 {
        self.datasets.iter().map(|r| r.applied).sum()
    }

    /// Status derived from the per-dataset outcomes.
    pub fn status(&self) -> SyncStatus {
        let failed = self
            .datasets
            .iter()
            .filter(|r| r.status == SyncStatus::Failed)
            .count();
        if failed == 0 {
            if self.datasets.iter().all(|r| r.status == SyncStatus::Skipped) {
                SyncStatus::Skipped
            } else {
                SyncStatus::Success
            }
        } else if failed < self.datasets.len() {
            SyncStatus::PartialFailure
        } else {
            SyncStatus::Failed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::Granularity;
    use chrono::NaiveDate;

    fn plan(dataset: DatasetKey) -> Plan {
        let day = NaiveDate::from_ymd_opt(2024, 2, 6).unwrap();
        Plan {
            dataset,
            range: DateRange::single(day),
            mode: SyncMode::Refresh,
            overlap_days: Some(1),
            granularity: Granularity::Daily,
        }
    }

    #[test]
    fn test_wave_status_from_outcomes() {
        let mut wave = WaveReport::new("priority");
        wave.push(DatasetReport::skipped(DatasetKey::Catalog));
        assert_eq!(wave.status(), SyncStatus::Skipped);

        wave.push(DatasetReport::success(&plan(DatasetKey::Sales), 10, 4));
        assert_eq!(wave.status(), SyncStatus::Success);

        wave.push(DatasetReport::failed(DatasetKey::Stocks, None, "boom".into()));
        assert_eq!(wave.status(), SyncStatus::PartialFailure);
        assert_eq!(wave.failures(), vec![(DatasetKey::Stocks, "boom".to_string())]);
        assert_eq!(wave.total_applied(), 4);
    }

    #[tokio::test]
    async fn test_channel_progress_forwards_events() {
        let (progress, mut rx) = ChannelProgress::new();
        let p = plan(DatasetKey::Sales);
        progress.on_plan(&p);
        progress.on_page_fetched(DatasetKey::Sales, 1, 25);
        drop(progress);

        match rx.recv().await {
            Some(SyncEvent::PlanBuilt { plan }) => assert_eq!(plan, p),
            other => panic!("unexpected event: {other:?}"),
        }
        match rx.recv().await {
            Some(SyncEvent::PageFetched { rows, .. }) => assert_eq!(rows, 25),
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(rx.recv().await.is_none());
    }
}
