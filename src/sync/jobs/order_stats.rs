//! Order funnel statistics, queried one day at a time and paginated by page
//! number.

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::Value;

use crate::api::{Feed, Granularity, PageRequest};
use crate::date_util::DateRange;
use crate::error::Result;
use crate::storage::repository::{self, FactTable};
use crate::sync::context::SyncContext;
use crate::sync::jobs::{decode, merge_rows, parse_all, replace_window, DatasetJob, Fetched, Mergeable};
use crate::sync::planner::Plan;
use crate::sync::policy::DatasetKey;
use crate::sync::rate_limit::retry_api;

pub const ORDER_STATS_PAGE_SIZE: u32 = 1000;

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct RawPeriodStats {
    open_card_count: i64,
    add_to_cart_count: i64,
    orders_count: i64,
    orders_sum_rub: f64,
    buyouts_count: i64,
    buyouts_sum_rub: f64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct RawStatistics {
    selected_period: RawPeriodStats,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawCard {
    #[serde(rename = "nmID")]
    nm_id: i64,
    statistics: RawStatistics,
}

/// Funnel counters of one article on one day.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderStat {
    pub nm_id: i64,
    pub date: NaiveDate,
    pub open_card_count: i64,
    pub add_to_cart_count: i64,
    pub orders_count: i64,
    pub orders_sum: f64,
    pub buyouts_count: i64,
    pub buyouts_sum: f64,
}

/// Cards carry no date of their own; `day` is the day the page was queried
/// for. Missing counters default to zero.
pub fn parse_card(value: &Value, day: NaiveDate) -> Option<OrderStat> {
    let raw: RawCard = decode(value, "order stats")?;
    if raw.nm_id <= 0 {
        return None;
    }
    let stats = raw.statistics.selected_period;
    Some(OrderStat {
        nm_id: raw.nm_id,
        date: day,
        open_card_count: stats.open_card_count,
        add_to_cart_count: stats.add_to_cart_count,
        orders_count: stats.orders_count,
        orders_sum: stats.orders_sum_rub,
        buyouts_count: stats.buyouts_count,
        buyouts_sum: stats.buyouts_sum_rub,
    })
}

impl Mergeable for OrderStat {
    type Key = (i64, NaiveDate);

    fn merge_key(&self) -> Self::Key {
        (self.nm_id, self.date)
    }

    fn absorb(&mut self, other: Self) {
        self.open_card_count += other.open_card_count;
        self.add_to_cart_count += other.add_to_cart_count;
        self.orders_count += other.orders_count;
        self.orders_sum += other.orders_sum;
        self.buyouts_count += other.buyouts_count;
        self.buyouts_sum += other.buyouts_sum;
    }
}

pub struct OrderStatsJob {
    page_size: u32,
}

impl Default for OrderStatsJob {
    fn default() -> Self {
        Self {
            page_size: ORDER_STATS_PAGE_SIZE,
        }
    }
}

impl OrderStatsJob {
    pub fn with_page_size(page_size: u32) -> Self {
        Self {
            page_size: page_size.max(1),
        }
    }

    /// Every page for one day. A page exactly `page_size` long may be the
    /// last one, so the next page is requested and an empty answer ends the
    /// day.
    async fn fetch_day(&self, ctx: &SyncContext, day: NaiveDate) -> Result<Vec<Value>> {
        let mut rows = Vec::new();
        let mut page_number = 1u32;
        loop {
            let request = PageRequest {
                feed: Feed::OrderStats,
                range: DateRange::single(day),
                granularity: Granularity::Daily,
                cursor: Some(page_number.to_string()),
                limit: self.page_size,
            };
            let page = retry_api!(
                ctx.settings.rate_limit_delay,
                "order stats",
                ctx.api.fetch_page(&request)
            )?;
            let len = page.len();
            ctx.progress.on_page_fetched(DatasetKey::OrderStats, page_number, len);
            rows.extend(page);
            if len < self.page_size as usize {
                break;
            }
            page_number += 1;
        }
        Ok(rows)
    }
}

#[async_trait]
impl DatasetJob for OrderStatsJob {
    type Row = OrderStat;

    fn dataset(&self) -> DatasetKey {
        DatasetKey::OrderStats
    }

    async fn fetch(&self, ctx: &SyncContext, plan: &Plan) -> Result<Fetched<OrderStat>> {
        let mut stats = Vec::new();
        let mut fetched = 0u64;
        for day in plan.range.iter_days() {
            let values = self.fetch_day(ctx, day).await?;
            fetched += values.len() as u64;
            stats.extend(parse_all(&values, "order stats", |v| parse_card(v, day)));
        }
        Ok(Fetched::new(stats, fetched))
    }

    async fn apply(&self, ctx: &SyncContext, plan: &Plan, rows: Vec<OrderStat>) -> Result<u64> {
        let merged = merge_rows(rows);
        replace_window(ctx, FactTable::OrderStats, plan.range, merged, repository::upsert_order_stat).await
    }
}
