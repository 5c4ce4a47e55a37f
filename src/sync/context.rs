use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};

use crate::api::MarketplaceApi;
use crate::storage::Database;
use crate::sync::policy::{DatasetKey, DatasetPolicy, PolicySet};
use crate::sync::rate_limit::RetryPolicy;
use crate::sync::SyncProgress;

/// Source of "today" and "now" for planning and checkpoints.
pub trait Clock: Send + Sync {
    /// Local calendar date.
    fn today(&self) -> NaiveDate;
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn today(&self) -> NaiveDate {
        chrono::Local::now().date_naive()
    }

    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock frozen at a given instant, for replays and tests.
pub struct FixedClock {
    today: NaiveDate,
    now: DateTime<Utc>,
}

impl FixedClock {
    /// Noon UTC on `today`.
    pub fn on(today: NaiveDate) -> Self {
        let now = today
            .and_hms_opt(12, 0, 0)
            .map(|t| t.and_utc())
            .unwrap_or_else(Utc::now);
        Self { today, now }
    }
}

impl Clock for FixedClock {
    fn today(&self) -> NaiveDate {
        self.today
    }

    fn now(&self) -> DateTime<Utc> {
        self.now
    }
}

/// Timing knobs for upstream interaction.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    /// Interval between async report status checks.
    pub poll_interval: Duration,
    /// Wall-clock ceiling for an async report to reach a terminal state.
    pub report_timeout: Duration,
    /// Fixed wait after a 429 before retrying the same call.
    pub rate_limit_delay: Duration,
    /// Backoff for failing week-sync windows.
    pub window_retry: RetryPolicy,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            report_timeout: Duration::from_secs(15 * 60),
            rate_limit_delay: Duration::from_secs(60),
            window_retry: RetryPolicy::default(),
        }
    }
}

/// Shared session context handed to every job: stores, upstream client,
/// clock, policies and the progress sink. Built once per session.
pub struct SyncContext {
    pub db: Database,
    pub api: Arc<dyn MarketplaceApi>,
    pub clock: Arc<dyn Clock>,
    pub policies: PolicySet,
    pub settings: SyncSettings,
    pub progress: Arc<dyn SyncProgress>,
}

impl SyncContext {
    pub fn today(&self) -> NaiveDate {
        self.clock.today()
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn policy(&self, dataset: DatasetKey) -> &DatasetPolicy {
        self.policies.get(dataset)
    }
}
