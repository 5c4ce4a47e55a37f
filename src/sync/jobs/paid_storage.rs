use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::Value;

use crate::api::ReportKind;
use crate::date_util::parse_day;
use crate::error::Result;
use crate::storage::repository::{self, FactTable};
use crate::sync::context::SyncContext;
use crate::sync::jobs::report_task::generate_chunked;
use crate::sync::jobs::{decode, merge_rows, parse_all, replace_window, DatasetJob, Fetched, Mergeable};
use crate::sync::planner::Plan;
use crate::sync::policy::DatasetKey;

/// Longest range one paid storage task may cover.
const MAX_TASK_DAYS: u32 = 8;

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct RawStorageLine {
    date: Option<String>,
    nm_id: i64,
    vendor_code: String,
    size: String,
    warehouse_price: f64,
    barcodes_count: i64,
}

/// Daily storage charge for one article size, summed across warehouses.
#[derive(Debug, Clone, PartialEq)]
pub struct StorageCost {
    pub nm_id: i64,
    pub date: NaiveDate,
    pub size: String,
    pub supplier_article: String,
    pub warehouse_price: f64,
    pub barcodes_count: i64,
}

pub fn parse_storage_line(value: &Value) -> Option<StorageCost> {
    let raw: RawStorageLine = decode(value, "paid storage")?;
    if raw.nm_id <= 0 {
        return None;
    }
    let date = raw.date.as_deref().and_then(parse_day)?;
    Some(StorageCost {
        nm_id: raw.nm_id,
        date,
        size: raw.size.trim().to_string(),
        supplier_article: raw.vendor_code,
        warehouse_price: raw.warehouse_price,
        barcodes_count: raw.barcodes_count,
    })
}

impl Mergeable for StorageCost {
    type Key = (i64, NaiveDate, String);

    fn merge_key(&self) -> Self::Key {
        (self.nm_id, self.date, self.size.clone())
    }

    fn absorb(&mut self, other: Self) {
        self.warehouse_price += other.warehouse_price;
        self.barcodes_count += other.barcodes_count;
    }
}

pub struct PaidStorageJob;

#[async_trait]
impl DatasetJob for PaidStorageJob {
    type Row = StorageCost;

    fn dataset(&self) -> DatasetKey {
        DatasetKey::StorageCost
    }

    async fn fetch(&self, ctx: &SyncContext, plan: &Plan) -> Result<Fetched<StorageCost>> {
        let values = generate_chunked(ctx, ReportKind::PaidStorage, &plan.range, MAX_TASK_DAYS).await?;
        let rows = parse_all(&values, "paid storage", parse_storage_line)
            .into_iter()
            .filter(|r| plan.range.contains(r.date))
            .collect();
        Ok(Fetched::new(rows, values.len() as u64))
    }

    async fn apply(&self, ctx: &SyncContext, plan: &Plan, rows: Vec<StorageCost>) -> Result<u64> {
        let merged = merge_rows(rows);
        replace_window(ctx, FactTable::StorageCosts, plan.range, merged, repository::upsert_storage_cost).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ApiError, Granularity, TaskStatus};
    use crate::date_util::DateRange;
    use crate::sync::jobs::fake::{d, test_context, FakeApi};
    use crate::sync::jobs::SyncJob;
    use crate::sync::planner::SyncMode;
    use serde_json::json;

    fn storage(nm_id: i64, date: &str, size: &str, price: f64) -> Value {
        json!({
            "date": date,
            "nmId": nm_id,
            "vendorCode": "ART",
            "size": size,
            "warehousePrice": price,
            "barcodesCount": 1,
            "warehouse": "Коледино",
        })
    }

    #[test]
    fn test_parse_storage_line() {
        let row = parse_storage_line(&storage(3, "2024-02-05", " 44 ", 1.5)).unwrap();
        assert_eq!(row.size, "44");
        assert_eq!(row.date, d(2024, 2, 5));
        assert!(parse_storage_line(&json!({"date": "2024-02-05"})).is_none());
        assert!(parse_storage_line(&json!({"nmId": 3})).is_none());
    }

    #[tokio::test]
    async fn test_rate_limited_poll_then_merged_apply() {
        let api = FakeApi::new();
        for _ in 0..3 {
            api.push_status(Err(ApiError::RateLimited));
        }
        api.push_status(Ok(TaskStatus::Done));
        api.set_download(
            ReportKind::PaidStorage,
            Ok(vec![
                storage(1, "2024-02-05", "M", 1.0),
                storage(1, "2024-02-05", "M", 2.0),
                storage(1, "2024-02-05", "L", 1.0),
                storage(2, "2024-02-06", "", 4.0),
                json!({"date": "2024-02-06", "size": "S"}),
            ]),
        );
        let ctx = test_context(api.clone(), d(2024, 2, 7)).await;
        let plan = Plan {
            dataset: DatasetKey::StorageCost,
            range: DateRange::new(d(2024, 2, 5), d(2024, 2, 6)),
            mode: SyncMode::Refresh,
            overlap_days: Some(2),
            granularity: Granularity::Daily,
        };

        let applied = PaidStorageJob.fetch_and_apply(&ctx, &plan).await.unwrap();
        assert_eq!(applied.fetched, 5);
        // (1, M) merged, (1, L), (2, "")
        assert_eq!(applied.applied, 3);
        assert_eq!(api.download_calls(ReportKind::PaidStorage), 1);

        let stored = ctx
            .db
            .reader()
            .call(|conn| repository::count_rows(conn, FactTable::StorageCosts))
            .await
            .unwrap();
        assert_eq!(stored, 3);
    }
}
