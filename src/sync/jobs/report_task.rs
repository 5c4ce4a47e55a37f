//! Submit → poll → download flow for reports the upstream builds
//! asynchronously.

use serde_json::Value;
use tokio::time::Instant;

use crate::api::{ReportKind, TaskStatus};
use crate::date_util::DateRange;
use crate::error::{Error, Result};
use crate::sync::context::SyncContext;
use crate::sync::rate_limit::retry_api;

/// Generate one report for `range` and download its rows.
///
/// Status is polled every `poll_interval`. A 429 while polling waits
/// `rate_limit_delay` and asks again, without limit. Canceled and purged
/// tasks fail the report; so does exceeding `report_timeout` before a
/// terminal state. The artifact is downloaded once.
pub async fn generate_report(ctx: &SyncContext, kind: ReportKind, range: &DateRange) -> Result<Vec<Value>> {
    let task_id = retry_api!(
        ctx.settings.rate_limit_delay,
        "report submit",
        ctx.api.submit_report(kind, range)
    )?;
    log::info!("Submitted {kind} report task {task_id} for {range}");

    let started = Instant::now();
    let mut last_status = TaskStatus::Queued;
    loop {
        let elapsed = started.elapsed();
        if elapsed >= ctx.settings.report_timeout {
            log::error!(
                "{kind} report task {task_id} timed out after {}s (last status: {last_status})",
                elapsed.as_secs()
            );
            return Err(Error::ReportTimeout {
                report: kind,
                elapsed_secs: elapsed.as_secs(),
                last_status,
            });
        }

        match ctx.api.report_status(kind, &task_id).await {
            Ok(TaskStatus::Done) => {
                ctx.progress.on_report_status(kind, TaskStatus::Done);
                break;
            }
            Ok(status) if status.is_aborted() => {
                ctx.progress.on_report_status(kind, status);
                return Err(Error::ReportAborted {
                    report: kind,
                    task_id,
                    status,
                });
            }
            Ok(status) => {
                if status != last_status {
                    ctx.progress.on_report_status(kind, status);
                }
                last_status = status;
                tokio::time::sleep(ctx.settings.poll_interval).await;
            }
            Err(e) if e.is_rate_limited() => {
                log::warn!(
                    "Rate limited (429) polling {kind} task {task_id}. Waiting {:?}",
                    ctx.settings.rate_limit_delay
                );
                tokio::time::sleep(ctx.settings.rate_limit_delay).await;
            }
            Err(e) => return Err(e.into()),
        }
    }

    let rows = retry_api!(
        ctx.settings.rate_limit_delay,
        "report download",
        ctx.api.download_report(kind, &task_id)
    )?;
    log::debug!("Downloaded {} rows of {kind} task {task_id}", rows.len());
    Ok(rows)
}

/// Generate one report per chunk of at most `max_days` and concatenate rows.
pub async fn generate_chunked(
    ctx: &SyncContext,
    kind: ReportKind,
    range: &DateRange,
    max_days: u32,
) -> Result<Vec<Value>> {
    let mut rows = Vec::new();
    for chunk in range.chunks(max_days) {
        rows.extend(generate_report(ctx, kind, &chunk).await?);
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ApiError;
    use crate::sync::jobs::fake::{d, test_context, FakeApi};
    use serde_json::json;
    use std::time::Duration;

    fn range() -> DateRange {
        DateRange::new(d(2024, 2, 1), d(2024, 2, 6))
    }

    #[tokio::test]
    async fn test_rate_limits_while_polling_are_waited_out() {
        let api = FakeApi::new();
        api.push_status(Ok(TaskStatus::Queued));
        api.push_status(Err(ApiError::RateLimited));
        api.push_status(Err(ApiError::RateLimited));
        api.push_status(Err(ApiError::RateLimited));
        api.push_status(Ok(TaskStatus::Running));
        api.set_download(ReportKind::PaidStorage, Ok(vec![json!({"nmId": 1})]));
        let ctx = test_context(api.clone(), d(2024, 2, 7)).await;

        let rows = generate_report(&ctx, ReportKind::PaidStorage, &range()).await.unwrap();
        assert_eq!(rows.len(), 1);
        // queued, 3× 429, running, done
        assert_eq!(api.status_calls(), 6);
        assert_eq!(api.download_calls(ReportKind::PaidStorage), 1);
    }

    #[tokio::test]
    async fn test_canceled_task_is_fatal() {
        let api = FakeApi::new();
        api.push_status(Ok(TaskStatus::Running));
        api.push_status(Ok(TaskStatus::Canceled));
        let ctx = test_context(api.clone(), d(2024, 2, 7)).await;

        let err = generate_report(&ctx, ReportKind::Acceptance, &range()).await.unwrap_err();
        assert!(matches!(
            err,
            Error::ReportAborted {
                status: TaskStatus::Canceled,
                ..
            }
        ));
        assert_eq!(api.download_calls(ReportKind::Acceptance), 0);
    }

    #[tokio::test]
    async fn test_not_found_status_propagates() {
        let api = FakeApi::new();
        api.push_status(Err(ApiError::NotFound("task".into())));
        let ctx = test_context(api, d(2024, 2, 7)).await;

        let err = generate_report(&ctx, ReportKind::Acceptance, &range()).await.unwrap_err();
        assert!(matches!(err, Error::Api(ApiError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_timeout_reports_last_status() {
        let api = FakeApi::new();
        for _ in 0..1000 {
            api.push_status(Ok(TaskStatus::Running));
        }
        let mut ctx = test_context(api, d(2024, 2, 7)).await;
        ctx.settings.report_timeout = Duration::from_millis(20);

        let err = generate_report(&ctx, ReportKind::WarehouseRemains, &range()).await.unwrap_err();
        match err {
            Error::ReportTimeout { last_status, report, .. } => {
                assert_eq!(last_status, TaskStatus::Running);
                assert_eq!(report, ReportKind::WarehouseRemains);
            }
            other => panic!("expected timeout, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_chunked_submits_one_task_per_chunk() {
        let api = FakeApi::new();
        let ctx = test_context(api.clone(), d(2024, 2, 20)).await;
        let range = DateRange::new(d(2024, 2, 1), d(2024, 2, 17));
        generate_chunked(&ctx, ReportKind::PaidStorage, &range, 8).await.unwrap();
        let submitted = api.submitted();
        assert_eq!(submitted.len(), 3);
        assert_eq!(submitted[2].1, DateRange::new(d(2024, 2, 17), d(2024, 2, 17)));
    }
}
