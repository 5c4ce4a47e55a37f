use std::fmt;
use thiserror::Error;

use crate::api::{ApiError, ReportKind, TaskStatus};
use crate::sync::policy::DatasetKey;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Upstream API error: {0}")]
    Api(#[from] ApiError),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(
        "{report} report did not finish within {elapsed_secs}s (last status: {last_status})"
    )]
    ReportTimeout {
        report: ReportKind,
        elapsed_secs: u64,
        last_status: TaskStatus,
    },

    #[error("{report} report task {task_id} ended as {status}")]
    ReportAborted {
        report: ReportKind,
        task_id: String,
        status: TaskStatus,
    },

    #[error("A sync for {0} is already running")]
    Busy(DatasetKey),

    #[error("Every dataset in the {wave} wave failed: {}", format_failures(.failures))]
    WaveFailed {
        wave: String,
        failures: Vec<(DatasetKey, String)>,
    },

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// True when the upstream service could not be reached at all, as opposed
    /// to returning bad or missing data.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Error::Api(ApiError::Unavailable(_)))
    }
}

fn format_failures(failures: &[(DatasetKey, String)]) -> String {
    failures
        .iter()
        .map(|(key, message)| format!("{key}: {message}"))
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Database(e.to_string())
    }
}

impl From<rusqlite_migration::Error> for Error {
    fn from(e: rusqlite_migration::Error) -> Self {
        Error::Migration(e.to_string())
    }
}

impl<E: fmt::Display> From<tokio_rusqlite::Error<E>> for Error {
    fn from(e: tokio_rusqlite::Error<E>) -> Self {
        Error::Database(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
