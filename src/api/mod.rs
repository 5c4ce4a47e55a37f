//! Upstream marketplace API collaborator.
//!
//! The sync engine only talks to [`MarketplaceApi`]. Rows come back as
//! self-describing JSON values; every dataset job owns the parse layer that
//! turns them into typed rows.

pub mod http;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::date_util::DateRange;

pub use http::HttpApi;

/// Failure kinds the upstream can produce. The engine treats each kind
/// differently: `RateLimited` is retried, everything else propagates.
#[derive(Debug, Clone, Error)]
pub enum ApiError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("rate limited (429)")]
    RateLimited,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("HTTP {status}: {message}")]
    Status { status: u16, message: String },

    #[error("could not decode response: {0}")]
    Decode(String),
}

impl ApiError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, ApiError::RateLimited)
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Paginated upstream feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feed {
    /// Finance ledger shared by sales, returns, logistics and penalties.
    FinanceReport,
    AdvertisingHistory,
    OrderStats,
    Supplies,
    Catalog,
}

/// Reports generated asynchronously through submit → poll → download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportKind {
    PaidStorage,
    Acceptance,
    WarehouseRemains,
}

impl fmt::Display for ReportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReportKind::PaidStorage => "paid storage",
            ReportKind::Acceptance => "acceptance",
            ReportKind::WarehouseRemains => "warehouse remains",
        };
        f.write_str(name)
    }
}

/// Status of an async report generation task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    Done,
    Canceled,
    Purged,
}

impl TaskStatus {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "new" | "queued" => Some(TaskStatus::Queued),
            "processing" | "running" => Some(TaskStatus::Running),
            "done" => Some(TaskStatus::Done),
            "canceled" | "cancelled" => Some(TaskStatus::Canceled),
            "purged" => Some(TaskStatus::Purged),
            _ => None,
        }
    }

    /// Canceled and purged tasks never produce an artifact.
    pub fn is_aborted(&self) -> bool {
        matches!(self, TaskStatus::Canceled | TaskStatus::Purged)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Done => "done",
            TaskStatus::Canceled => "canceled",
            TaskStatus::Purged => "purged",
        };
        f.write_str(name)
    }
}

/// Granularity the upstream aggregates a report at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    Daily,
    Weekly,
}

impl Granularity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::Daily => "daily",
            Granularity::Weekly => "weekly",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "daily" => Some(Granularity::Daily),
            "weekly" => Some(Granularity::Weekly),
            _ => None,
        }
    }
}

/// One page request against a paginated feed. `cursor` is opaque to the
/// client: a row id, a page number or a catalog token depending on the feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub feed: Feed,
    pub range: DateRange,
    pub granularity: Granularity,
    pub cursor: Option<String>,
    pub limit: u32,
}

/// The upstream service. An empty page means "no more data", never an error.
#[async_trait]
pub trait MarketplaceApi: Send + Sync {
    async fn fetch_page(&self, request: &PageRequest) -> ApiResult<Vec<Value>>;

    /// Start generating a report and return its task id.
    async fn submit_report(&self, kind: ReportKind, range: &DateRange) -> ApiResult<String>;

    async fn report_status(&self, kind: ReportKind, task_id: &str) -> ApiResult<TaskStatus>;

    async fn download_report(&self, kind: ReportKind, task_id: &str) -> ApiResult<Vec<Value>>;

    /// Campaign details for the given advertising campaign ids.
    async fn campaigns(&self, ids: &[i64]) -> ApiResult<Vec<Value>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_status_parse() {
        assert_eq!(TaskStatus::parse("new"), Some(TaskStatus::Queued));
        assert_eq!(TaskStatus::parse("processing"), Some(TaskStatus::Running));
        assert_eq!(TaskStatus::parse("done"), Some(TaskStatus::Done));
        assert_eq!(TaskStatus::parse("purged"), Some(TaskStatus::Purged));
        assert_eq!(TaskStatus::parse("weird"), None);
        assert!(TaskStatus::Canceled.is_aborted());
        assert!(!TaskStatus::Running.is_aborted());
    }
}
