use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::Value;

use crate::api::{Feed, Granularity, PageRequest};
use crate::date_util::parse_day;
use crate::error::Result;
use crate::storage::repository::{self, FactTable};
use crate::sync::context::SyncContext;
use crate::sync::jobs::{decode, merge_rows, parse_all, replace_window, DatasetJob, Fetched, Mergeable};
use crate::sync::planner::Plan;
use crate::sync::policy::DatasetKey;
use crate::sync::rate_limit::retry_api;

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct RawIncome {
    income_id: i64,
    date: Option<String>,
    supplier_article: String,
    tech_size: String,
    quantity: i64,
    total_price: f64,
    warehouse_name: String,
    nm_id: i64,
}

/// Incoming supply line, one per supply × article × date × size.
#[derive(Debug, Clone, PartialEq)]
pub struct Supply {
    pub income_id: i64,
    pub nm_id: i64,
    pub date: NaiveDate,
    pub size: String,
    pub supplier_article: String,
    pub warehouse: String,
    pub quantity: i64,
    pub total_price: f64,
}

pub fn parse_income(value: &Value) -> Option<Supply> {
    let raw: RawIncome = decode(value, "supplies")?;
    if raw.nm_id <= 0 || raw.income_id <= 0 {
        return None;
    }
    let date = raw.date.as_deref().and_then(parse_day)?;
    Some(Supply {
        income_id: raw.income_id,
        nm_id: raw.nm_id,
        date,
        size: raw.tech_size.trim().to_string(),
        supplier_article: raw.supplier_article,
        warehouse: raw.warehouse_name,
        quantity: raw.quantity,
        total_price: raw.total_price,
    })
}

impl Mergeable for Supply {
    type Key = (i64, i64, NaiveDate, String);

    fn merge_key(&self) -> Self::Key {
        (self.income_id, self.nm_id, self.date, self.size.clone())
    }

    fn absorb(&mut self, other: Self) {
        self.quantity += other.quantity;
        self.total_price += other.total_price;
    }
}

/// The incomes feed returns everything since the range start in one
/// response; rows past the range end are dropped.
pub struct SuppliesJob;

#[async_trait]
impl DatasetJob for SuppliesJob {
    type Row = Supply;

    fn dataset(&self) -> DatasetKey {
        DatasetKey::Supplies
    }

    async fn fetch(&self, ctx: &SyncContext, plan: &Plan) -> Result<Fetched<Supply>> {
        let request = PageRequest {
            feed: Feed::Supplies,
            range: plan.range,
            granularity: Granularity::Daily,
            cursor: None,
            limit: 0,
        };
        let page = retry_api!(
            ctx.settings.rate_limit_delay,
            "supplies",
            ctx.api.fetch_page(&request)
        )?;
        ctx.progress.on_page_fetched(DatasetKey::Supplies, 1, page.len());
        let rows = parse_all(&page, "supplies", parse_income)
            .into_iter()
            .filter(|s| plan.range.contains(s.date))
            .collect();
        Ok(Fetched::new(rows, page.len() as u64))
    }

    async fn apply(&self, ctx: &SyncContext, plan: &Plan, rows: Vec<Supply>) -> Result<u64> {
        let merged = merge_rows(rows);
        replace_window(ctx, FactTable::Supplies, plan.range, merged, repository::upsert_supply).await
    }
}
