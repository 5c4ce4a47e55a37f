//! Scripted in-memory marketplace for tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::Value;

use crate::api::{ApiError, ApiResult, Feed, MarketplaceApi, PageRequest, ReportKind, TaskStatus};
use crate::date_util::DateRange;
use crate::storage::Database;
use crate::sync::context::{FixedClock, SyncContext, SyncSettings};
use crate::sync::policy::PolicySet;
use crate::sync::rate_limit::RetryPolicy;
use crate::sync::NoopProgress;

type Responder = Box<dyn Fn(&PageRequest) -> ApiResult<Vec<Value>> + Send + Sync>;

/// Pages are served from per-feed queues first, then from the responder,
/// then as an empty page. Report statuses default to `Done` once the
/// scripted queue is drained.
#[derive(Default)]
pub(crate) struct FakeApi {
    pages: Mutex<HashMap<Feed, VecDeque<ApiResult<Vec<Value>>>>>,
    responder: Mutex<Option<Responder>>,
    statuses: Mutex<VecDeque<ApiResult<TaskStatus>>>,
    downloads: Mutex<HashMap<ReportKind, ApiResult<Vec<Value>>>>,
    campaign_rows: Mutex<Vec<Value>>,
    campaign_error: Mutex<Option<ApiError>>,
    campaign_calls: Mutex<u32>,
    requests: Mutex<Vec<PageRequest>>,
    submitted: Mutex<Vec<(ReportKind, DateRange)>>,
    status_calls: Mutex<u32>,
    download_calls: Mutex<HashMap<ReportKind, u32>>,
}

impl FakeApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_page(&self, feed: Feed, rows: Vec<Value>) {
        self.push_page_result(feed, Ok(rows));
    }

    pub fn push_page_result(&self, feed: Feed, result: ApiResult<Vec<Value>>) {
        self.pages
            .lock()
            .unwrap()
            .entry(feed)
            .or_default()
            .push_back(result);
    }

    pub fn respond_with(
        &self,
        responder: impl Fn(&PageRequest) -> ApiResult<Vec<Value>> + Send + Sync + 'static,
    ) {
        *self.responder.lock().unwrap() = Some(Box::new(responder));
    }

    pub fn push_status(&self, status: ApiResult<TaskStatus>) {
        self.statuses.lock().unwrap().push_back(status);
    }

    pub fn set_download(&self, kind: ReportKind, rows: ApiResult<Vec<Value>>) {
        self.downloads.lock().unwrap().insert(kind, rows);
    }

    pub fn set_campaigns(&self, rows: Vec<Value>) {
        *self.campaign_rows.lock().unwrap() = rows;
    }

    /// Fail every campaign lookup with `error`.
    pub fn fail_campaigns(&self, error: ApiError) {
        *self.campaign_error.lock().unwrap() = Some(error);
    }

    pub fn campaign_calls(&self) -> u32 {
        *self.campaign_calls.lock().unwrap()
    }

    pub fn requests(&self, feed: Feed) -> Vec<PageRequest> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.feed == feed)
            .cloned()
            .collect()
    }

    pub fn submitted(&self) -> Vec<(ReportKind, DateRange)> {
        self.submitted.lock().unwrap().clone()
    }

    pub fn status_calls(&self) -> u32 {
        *self.status_calls.lock().unwrap()
    }

    pub fn download_calls(&self, kind: ReportKind) -> u32 {
        self.download_calls
            .lock()
            .unwrap()
            .get(&kind)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl MarketplaceApi for FakeApi {
    async fn fetch_page(&self, request: &PageRequest) -> ApiResult<Vec<Value>> {
        self.requests.lock().unwrap().push(request.clone());
        if let Some(scripted) = self
            .pages
            .lock()
            .unwrap()
            .get_mut(&request.feed)
            .and_then(|queue| queue.pop_front())
        {
            return scripted;
        }
        match self.responder.lock().unwrap().as_ref() {
            Some(responder) => responder(request),
            None => Ok(vec![]),
        }
    }

    async fn submit_report(&self, kind: ReportKind, range: &DateRange) -> ApiResult<String> {
        let mut submitted = self.submitted.lock().unwrap();
        submitted.push((kind, *range));
        Ok(format!("task-{}", submitted.len()))
    }

    async fn report_status(&self, _kind: ReportKind, _task_id: &str) -> ApiResult<TaskStatus> {
        *self.status_calls.lock().unwrap() += 1;
        self.statuses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(TaskStatus::Done))
    }

    async fn download_report(&self, kind: ReportKind, _task_id: &str) -> ApiResult<Vec<Value>> {
        *self.download_calls.lock().unwrap().entry(kind).or_default() += 1;
        self.downloads
            .lock()
            .unwrap()
            .get(&kind)
            .cloned()
            .unwrap_or(Ok(vec![]))
    }

    async fn campaigns(&self, ids: &[i64]) -> ApiResult<Vec<Value>> {
        *self.campaign_calls.lock().unwrap() += 1;
        if let Some(error) = self.campaign_error.lock().unwrap().clone() {
            return Err(error);
        }
        Ok(self
            .campaign_rows
            .lock()
            .unwrap()
            .iter()
            .filter(|row| {
                row.get("advertId")
                    .and_then(Value::as_i64)
                    .is_some_and(|id| ids.contains(&id))
            })
            .cloned()
            .collect())
    }
}

pub(crate) fn fast_settings() -> SyncSettings {
    SyncSettings {
        poll_interval: Duration::from_millis(1),
        report_timeout: Duration::from_secs(5),
        rate_limit_delay: Duration::from_millis(1),
        window_retry: RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            multiplier: 2.0,
        },
    }
}

/// A context over an in-memory database with a clock frozen at `today`.
pub(crate) async fn test_context(api: Arc<FakeApi>, today: NaiveDate) -> SyncContext {
    test_context_with(api, today, PolicySet::default()).await
}

pub(crate) async fn test_context_with(
    api: Arc<FakeApi>,
    today: NaiveDate,
    policies: PolicySet,
) -> SyncContext {
    SyncContext {
        db: Database::open_memory().await.unwrap(),
        api,
        clock: Arc::new(FixedClock::on(today)),
        policies,
        settings: fast_settings(),
        progress: Arc::new(NoopProgress),
    }
}

pub(crate) fn d(y: i32, m: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, day).unwrap()
}
