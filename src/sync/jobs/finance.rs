//! Finance ledger stream shared by sales, returns, logistics and penalties.
//!
//! The upstream report mixes every operation type in one paginated stream.
//! Each dataset keeps only its own operation and groups lines by
//! article × date × size, summing the measures.

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::Value;

use crate::api::{Feed, PageRequest};
use crate::date_util::{parse_day, DateRange};
use crate::error::Result;
use crate::storage::repository::{self, FactTable};
use crate::sync::context::SyncContext;
use crate::sync::jobs::{decode, merge_rows, replace_window, DatasetJob, Fetched, Mergeable};
use crate::sync::planner::Plan;
use crate::sync::policy::DatasetKey;
use crate::sync::rate_limit::retry_api;

/// Upstream maximum rows per finance page.
pub const FINANCE_PAGE_SIZE: u32 = 100_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FinanceOperation {
    Sale,
    Return,
    Logistics,
    Penalty,
}

impl FinanceOperation {
    /// Classify the upstream operation name. Operations outside the four
    /// tracked kinds (storage, compensation, ...) yield `None`.
    pub fn from_oper_name(name: &str) -> Option<Self> {
        let name = name.trim().to_lowercase();
        if name.starts_with("продажа") {
            Some(FinanceOperation::Sale)
        } else if name.starts_with("возврат") {
            Some(FinanceOperation::Return)
        } else if name.contains("логистик") {
            Some(FinanceOperation::Logistics)
        } else if name.starts_with("штраф") {
            Some(FinanceOperation::Penalty)
        } else {
            None
        }
    }

    pub fn dataset(&self) -> DatasetKey {
        match self {
            FinanceOperation::Sale => DatasetKey::Sales,
            FinanceOperation::Return => DatasetKey::Returns,
            FinanceOperation::Logistics => DatasetKey::Logistics,
            FinanceOperation::Penalty => DatasetKey::Penalties,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawFinanceLine {
    rrd_id: Option<i64>,
    supplier_oper_name: String,
    nm_id: i64,
    sa_name: String,
    ts_name: String,
    rr_dt: Option<String>,
    quantity: i64,
    retail_amount: f64,
    ppvz_for_pay: f64,
    delivery_rub: f64,
    penalty: f64,
}

/// One normalized ledger line.
#[derive(Debug, Clone, PartialEq)]
pub struct FinanceLine {
    pub operation: FinanceOperation,
    pub nm_id: i64,
    pub date: NaiveDate,
    pub size: String,
    pub supplier_article: String,
    pub quantity: i64,
    pub retail_amount: f64,
    pub for_pay: f64,
    pub delivery_rub: f64,
    pub penalty: f64,
}

/// Parse one finance report row. Lines of untracked operations and lines
/// without an article or report date yield `None`. A missing size becomes
/// the empty string.
pub fn parse_finance_line(value: &Value) -> Option<FinanceLine> {
    let raw: RawFinanceLine = decode(value, "finance")?;
    let operation = FinanceOperation::from_oper_name(&raw.supplier_oper_name)?;
    if raw.nm_id <= 0 {
        log::warn!("Dropping finance line {:?} without nm_id", raw.rrd_id);
        return None;
    }
    let Some(date) = raw.rr_dt.as_deref().and_then(parse_day) else {
        log::warn!("Dropping finance line {:?} without rr_dt", raw.rrd_id);
        return None;
    };
    Some(FinanceLine {
        operation,
        nm_id: raw.nm_id,
        date,
        size: raw.ts_name.trim().to_string(),
        supplier_article: raw.sa_name,
        quantity: raw.quantity,
        retail_amount: raw.retail_amount,
        for_pay: raw.ppvz_for_pay,
        delivery_rub: raw.delivery_rub,
        penalty: raw.penalty,
    })
}

/// Lines parsed from one finance page, with counts of what was left out.
#[derive(Debug, Default)]
pub struct FinancePage {
    pub lines: Vec<FinanceLine>,
    /// Operations that feed none of the finance datasets.
    pub untracked: usize,
    /// Tracked operations missing their article or date.
    pub dropped: usize,
}

pub fn parse_finance_page(page: &[Value]) -> FinancePage {
    let mut parsed = FinancePage::default();
    for value in page {
        let tracked = value
            .get("supplier_oper_name")
            .and_then(Value::as_str)
            .and_then(FinanceOperation::from_oper_name)
            .is_some();
        if !tracked {
            parsed.untracked += 1;
            continue;
        }
        match parse_finance_line(value) {
            Some(line) => parsed.lines.push(line),
            None => parsed.dropped += 1,
        }
    }
    parsed
}

/// Grouped finance measures for one article × date × size.
#[derive(Debug, Clone, PartialEq)]
pub struct FinanceAggregate {
    pub nm_id: i64,
    pub date: NaiveDate,
    pub size: String,
    pub supplier_article: String,
    pub quantity: i64,
    pub retail_amount: f64,
    pub for_pay: f64,
    pub delivery_rub: f64,
    pub penalty: f64,
    /// Ledger lines folded into this aggregate.
    pub lines: i64,
}

impl From<&FinanceLine> for FinanceAggregate {
    fn from(line: &FinanceLine) -> Self {
        Self {
            nm_id: line.nm_id,
            date: line.date,
            size: line.size.clone(),
            supplier_article: line.supplier_article.clone(),
            quantity: line.quantity,
            retail_amount: line.retail_amount,
            for_pay: line.for_pay,
            delivery_rub: line.delivery_rub,
            penalty: line.penalty,
            lines: 1,
        }
    }
}

impl Mergeable for FinanceAggregate {
    type Key = (i64, NaiveDate, String);

    fn merge_key(&self) -> Self::Key {
        (self.nm_id, self.date, self.size.clone())
    }

    fn absorb(&mut self, other: Self) {
        if self.supplier_article.is_empty() {
            self.supplier_article = other.supplier_article;
        }
        self.quantity += other.quantity;
        self.retail_amount += other.retail_amount;
        self.for_pay += other.for_pay;
        self.delivery_rub += other.delivery_rub;
        self.penalty += other.penalty;
        self.lines += other.lines;
    }
}

/// Group the lines of `dataset` inside `range`.
pub fn aggregate(dataset: DatasetKey, range: &DateRange, lines: &[FinanceLine]) -> Vec<FinanceAggregate> {
    merge_rows(
        lines
            .iter()
            .filter(|l| l.operation.dataset() == dataset && range.contains(l.date))
            .map(FinanceAggregate::from),
    )
}

/// Every tracked line of the finance stream for one range, fetched once.
#[derive(Debug, Clone, Default)]
pub struct FinanceStream {
    pub lines: Vec<FinanceLine>,
    /// Raw rows across all pages, tracked or not.
    pub fetched: u64,
}

impl FinanceStream {
    pub fn count_for(&self, dataset: DatasetKey) -> u64 {
        self.lines
            .iter()
            .filter(|l| l.operation.dataset() == dataset)
            .count() as u64
    }
}

/// Page through the finance report for `plan`'s range and granularity.
///
/// Pagination follows the last row's `rrd_id` and stops on an empty page or
/// a page shorter than `page_size`.
pub async fn fetch_stream(ctx: &SyncContext, plan: &Plan, page_size: u32) -> Result<FinanceStream> {
    let mut stream = FinanceStream::default();
    let mut cursor: Option<String> = None;
    let mut page_number = 0u32;

    loop {
        let request = PageRequest {
            feed: Feed::FinanceReport,
            range: plan.range,
            granularity: plan.granularity,
            cursor: cursor.clone(),
            limit: page_size,
        };
        let page = retry_api!(
            ctx.settings.rate_limit_delay,
            "finance report",
            ctx.api.fetch_page(&request)
        )?;
        if page.is_empty() {
            break;
        }
        page_number += 1;
        stream.fetched += page.len() as u64;
        ctx.progress.on_page_fetched(plan.dataset, page_number, page.len());
        log::debug!("Finance page {page_number} for {}: {} rows", plan.range, page.len());

        let parsed = parse_finance_page(&page);
        if parsed.untracked > 0 {
            log::debug!("Finance page {page_number}: ignored {} untracked operations", parsed.untracked);
        }
        if parsed.dropped > 0 {
            log::warn!(
                "Finance page {page_number}: dropped {} tracked rows without a business key",
                parsed.dropped
            );
        }
        stream.lines.extend(parsed.lines);

        if page.len() < page_size as usize {
            break;
        }
        match page.last().and_then(|row| row.get("rrd_id")).and_then(Value::as_i64) {
            Some(rrd_id) => cursor = Some(rrd_id.to_string()),
            None => {
                log::warn!("Finance page without rrd_id on its last row; stopping pagination");
                break;
            }
        }
    }

    Ok(stream)
}

/// Replace `plan`'s window for its dataset with the grouped lines.
pub async fn apply_lines(ctx: &SyncContext, plan: &Plan, lines: &[FinanceLine]) -> Result<u64> {
    let Some(table) = FactTable::for_finance(plan.dataset) else {
        return Ok(0);
    };
    let rows = aggregate(plan.dataset, &plan.range, lines);
    replace_window(ctx, table, plan.range, rows, move |conn, row: &FinanceAggregate| {
        repository::upsert_finance_aggregate(conn, table, row)
    })
    .await
}

/// Single-dataset view of the finance stream.
pub struct FinanceJob {
    dataset: DatasetKey,
    page_size: u32,
}

impl FinanceJob {
    pub fn new(dataset: DatasetKey) -> Self {
        Self {
            dataset,
            page_size: FINANCE_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }
}

#[async_trait]
impl DatasetJob for FinanceJob {
    type Row = FinanceLine;

    fn dataset(&self) -> DatasetKey {
        self.dataset
    }

    fn supports_weekly(&self) -> bool {
        true
    }

    async fn fetch(&self, ctx: &SyncContext, plan: &Plan) -> Result<Fetched<FinanceLine>> {
        let stream = fetch_stream(ctx, plan, self.page_size).await?;
        let lines: Vec<FinanceLine> = stream
            .lines
            .into_iter()
            .filter(|l| l.operation.dataset() == self.dataset)
            .collect();
        Ok(Fetched::new(lines, stream.fetched))
    }

    async fn apply(&self, ctx: &SyncContext, plan: &Plan, rows: Vec<FinanceLine>) -> Result<u64> {
        apply_lines(ctx, plan, &rows).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::api::Granularity;
    use crate::sync::jobs::fake::{d, test_context, FakeApi};
    use crate::sync::planner::SyncMode;
    use serde_json::json;

    pub(crate) fn line(rrd_id: i64, op: &str, nm_id: i64, day: &str, size: &str, qty: i64, amount: f64) -> Value {
        json!({
            "rrd_id": rrd_id,
            "supplier_oper_name": op,
            "nm_id": nm_id,
            "sa_name": format!("ART-{nm_id}"),
            "ts_name": size,
            "rr_dt": day,
            "quantity": qty,
            "retail_amount": amount,
            "ppvz_for_pay": amount * 0.8,
            "delivery_rub": 0.0,
            "penalty": 0.0,
        })
    }

    fn plan(dataset: DatasetKey, from: NaiveDate, to: NaiveDate) -> Plan {
        Plan {
            dataset,
            range: DateRange::new(from, to),
            mode: SyncMode::Refresh,
            overlap_days: None,
            granularity: Granularity::Daily,
        }
    }

    #[test]
    fn test_operation_names() {
        assert_eq!(FinanceOperation::from_oper_name("Продажа"), Some(FinanceOperation::Sale));
        assert_eq!(FinanceOperation::from_oper_name("Возврат"), Some(FinanceOperation::Return));
        assert_eq!(FinanceOperation::from_oper_name("Логистика"), Some(FinanceOperation::Logistics));
        assert_eq!(
            FinanceOperation::from_oper_name("Коррекция логистики"),
            Some(FinanceOperation::Logistics)
        );
        assert_eq!(FinanceOperation::from_oper_name("Штраф"), Some(FinanceOperation::Penalty));
        assert_eq!(FinanceOperation::from_oper_name("Хранение"), None);
    }

    #[test]
    fn test_parse_defaults_and_drops() {
        let parsed = parse_finance_line(&json!({
            "supplier_oper_name": "Продажа",
            "nm_id": 7,
            "rr_dt": "2024-02-05T00:00:00Z",
        }))
        .unwrap();
        assert_eq!(parsed.date, d(2024, 2, 5));
        assert_eq!(parsed.size, "");
        assert_eq!(parsed.quantity, 0);
        assert_eq!(parsed.retail_amount, 0.0);

        // No article
        assert!(parse_finance_line(&json!({"supplier_oper_name": "Продажа", "rr_dt": "2024-02-05"})).is_none());
        // No date
        assert!(parse_finance_line(&json!({"supplier_oper_name": "Продажа", "nm_id": 7})).is_none());
        // Untracked operation
        assert!(parse_finance_line(&line(1, "Хранение", 7, "2024-02-05", "M", 1, 1.0)).is_none());
    }

    #[test]
    fn test_page_counts_untracked_apart_from_dropped() {
        let page = vec![
            line(1, "Продажа", 7, "2024-02-05", "M", 1, 100.0),
            line(2, "Хранение", 7, "2024-02-05", "M", 1, 5.0),
            line(3, "Хранение", 8, "2024-02-05", "M", 1, 5.0),
            json!({"rrd_id": 4, "supplier_oper_name": "Продажа", "rr_dt": "2024-02-05"}),
        ];
        let parsed = parse_finance_page(&page);
        assert_eq!(parsed.lines.len(), 1);
        assert_eq!(parsed.untracked, 2);
        assert_eq!(parsed.dropped, 1);
    }

    #[test]
    fn test_aggregate_sums_lines_per_key() {
        let lines: Vec<FinanceLine> = [
            line(1, "Продажа", 7, "2024-02-05", "M", 1, 100.0),
            line(2, "Продажа", 7, "2024-02-05", "M", 2, 50.0),
            line(3, "Продажа", 7, "2024-02-05", "L", 1, 10.0),
            line(4, "Возврат", 7, "2024-02-05", "M", 1, 100.0),
            line(5, "Продажа", 7, "2024-01-01", "M", 1, 100.0),
        ]
        .iter()
        .filter_map(parse_finance_line)
        .collect();

        let range = DateRange::new(d(2024, 2, 1), d(2024, 2, 6));
        let sales = aggregate(DatasetKey::Sales, &range, &lines);
        assert_eq!(sales.len(), 2);
        let medium = sales.iter().find(|a| a.size == "M").unwrap();
        assert_eq!(medium.quantity, 3);
        assert_eq!(medium.retail_amount, 150.0);
        assert_eq!(medium.lines, 2);

        let returns = aggregate(DatasetKey::Returns, &range, &lines);
        assert_eq!(returns.len(), 1);
    }

    #[tokio::test]
    async fn test_fetch_follows_rrd_id_until_short_page() {
        let api = FakeApi::new();
        api.push_page(
            Feed::FinanceReport,
            vec![
                line(10, "Продажа", 1, "2024-02-05", "M", 1, 10.0),
                line(11, "Логистика", 1, "2024-02-05", "M", 1, 5.0),
            ],
        );
        api.push_page(
            Feed::FinanceReport,
            vec![line(12, "Продажа", 1, "2024-02-06", "M", 1, 10.0)],
        );
        let ctx = test_context(api.clone(), d(2024, 2, 7)).await;

        let p = plan(DatasetKey::Sales, d(2024, 2, 1), d(2024, 2, 6));
        let stream = fetch_stream(&ctx, &p, 2).await.unwrap();
        assert_eq!(stream.fetched, 3);
        assert_eq!(stream.count_for(DatasetKey::Sales), 2);
        assert_eq!(stream.count_for(DatasetKey::Logistics), 1);

        let requests = api.requests(Feed::FinanceReport);
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].cursor, None);
        assert_eq!(requests[1].cursor.as_deref(), Some("11"));
    }

    #[tokio::test]
    async fn test_reapply_is_idempotent() {
        let api = FakeApi::new();
        let ctx = test_context(api, d(2024, 2, 7)).await;
        let p = plan(DatasetKey::Sales, d(2024, 2, 1), d(2024, 2, 6));
        let lines: Vec<FinanceLine> = [
            line(1, "Продажа", 7, "2024-02-05", "M", 1, 100.0),
            line(2, "Продажа", 7, "2024-02-05", "M", 2, 50.0),
        ]
        .iter()
        .filter_map(parse_finance_line)
        .collect();

        assert_eq!(apply_lines(&ctx, &p, &lines).await.unwrap(), 1);
        assert_eq!(apply_lines(&ctx, &p, &lines).await.unwrap(), 1);

        let stored = ctx
            .db
            .reader()
            .call(move |conn| repository::list_finance_aggregates(conn, FactTable::Sales, &p.range))
            .await
            .unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].quantity, 3);
        assert_eq!(stored[0].retail_amount, 150.0);
    }

    #[tokio::test]
    async fn test_rate_limited_page_is_retried() {
        let api = FakeApi::new();
        api.push_page_result(Feed::FinanceReport, Err(crate::api::ApiError::RateLimited));
        api.push_page(
            Feed::FinanceReport,
            vec![line(1, "Штраф", 3, "2024-02-05", "", 0, 0.0)],
        );
        let ctx = test_context(api.clone(), d(2024, 2, 7)).await;
        let job = FinanceJob::new(DatasetKey::Penalties);
        let p = plan(DatasetKey::Penalties, d(2024, 2, 5), d(2024, 2, 5));
        let fetched = job.fetch(&ctx, &p).await.unwrap();
        assert_eq!(fetched.rows.len(), 1);
        assert_eq!(api.requests(Feed::FinanceReport).len(), 2);
    }
}
