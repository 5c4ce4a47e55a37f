use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use crate::date_util::{date_key, DateRange};
use crate::sync::checkpoint::{
    Checkpoint, CheckpointKey, CheckpointVariant, CoverageRule, LoadedPeriod, PeriodType,
};
use crate::sync::coverage;
use crate::sync::jobs::acceptance::AcceptanceCost;
use crate::sync::jobs::advertising::{AdCost, Campaign};
use crate::sync::jobs::catalog::Product;
use crate::sync::jobs::finance::FinanceAggregate;
use crate::sync::jobs::order_stats::OrderStat;
use crate::sync::jobs::paid_storage::StorageCost;
use crate::sync::jobs::stocks::StockLevel;
use crate::sync::jobs::supplies::Supply;
use crate::sync::planner::Plan;
use crate::sync::policy::DatasetKey;

// ── Column helpers ─────────────────────────────────────────────────

fn conversion_error(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, message.into())
}

fn day_column(row: &rusqlite::Row<'_>, idx: usize) -> Result<NaiveDate, rusqlite::Error> {
    let raw: String = row.get(idx)?;
    NaiveDate::parse_from_str(&raw, "%Y-%m-%d")
        .map_err(|e| conversion_error(idx, format!("{raw}: {e}")))
}

fn timestamp_column(row: &rusqlite::Row<'_>, idx: usize) -> Result<DateTime<Utc>, rusqlite::Error> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, format!("{raw}: {e}")))
}

fn dataset_column(row: &rusqlite::Row<'_>, idx: usize) -> Result<DatasetKey, rusqlite::Error> {
    let raw: String = row.get(idx)?;
    raw.parse()
        .map_err(|_| conversion_error(idx, format!("unknown dataset {raw}")))
}

// ── Config ─────────────────────────────────────────────────────────

pub fn get_config(conn: &Connection, key: &str) -> Result<Option<String>, rusqlite::Error> {
    conn.query_row(
        "SELECT value FROM app_config WHERE key = ?1",
        params![key],
        |row| row.get(0),
    )
    .optional()
}

pub fn set_config(conn: &Connection, key: &str, value: &str) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT OR REPLACE INTO app_config (key, value, updated_at)
         VALUES (?1, ?2, datetime('now'))",
        params![key, value],
    )?;
    Ok(())
}

pub fn delete_config(conn: &Connection, key: &str) -> Result<bool, rusqlite::Error> {
    let count = conn.execute("DELETE FROM app_config WHERE key = ?1", params![key])?;
    Ok(count > 0)
}

pub fn list_config(conn: &Connection) -> Result<Vec<(String, String)>, rusqlite::Error> {
    let mut stmt = conn.prepare("SELECT key, value FROM app_config ORDER BY key")?;
    let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
    rows.collect()
}

// ── Checkpoints ────────────────────────────────────────────────────

fn checkpoint_from_row(row: &rusqlite::Row<'_>) -> Result<Checkpoint, rusqlite::Error> {
    let dataset = dataset_column(row, 0)?;
    let variant_raw: String = row.get(1)?;
    let variant = CheckpointVariant::parse(&variant_raw)
        .ok_or_else(|| conversion_error(1, format!("unknown variant {variant_raw}")))?;
    Ok(Checkpoint {
        key: CheckpointKey::new(dataset, variant),
        cursor_time: day_column(row, 2)?,
        cursor_token: row.get(3)?,
        high_watermark: day_column(row, 4)?,
        updated_at: timestamp_column(row, 5)?,
    })
}

pub fn get_checkpoint(
    conn: &Connection,
    key: CheckpointKey,
) -> Result<Option<Checkpoint>, rusqlite::Error> {
    conn.query_row(
        "SELECT dataset, variant, cursor_date, cursor_token, high_watermark, updated_at
         FROM sync_checkpoints WHERE dataset = ?1 AND variant = ?2",
        params![key.dataset.as_str(), key.variant.as_str()],
        checkpoint_from_row,
    )
    .optional()
}

pub fn save_checkpoint(conn: &Connection, checkpoint: &Checkpoint) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT INTO sync_checkpoints (
            dataset, variant, cursor_date, cursor_token, high_watermark, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        ON CONFLICT(dataset, variant) DO UPDATE SET
            cursor_date=excluded.cursor_date, cursor_token=excluded.cursor_token,
            high_watermark=excluded.high_watermark, updated_at=excluded.updated_at",
        params![
            checkpoint.key.dataset.as_str(),
            checkpoint.key.variant.as_str(),
            date_key(checkpoint.cursor_time),
            checkpoint.cursor_token,
            date_key(checkpoint.high_watermark),
            checkpoint.updated_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

pub fn list_checkpoints(conn: &Connection) -> Result<Vec<Checkpoint>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT dataset, variant, cursor_date, cursor_token, high_watermark, updated_at
         FROM sync_checkpoints ORDER BY dataset, variant",
    )?;
    let rows = stmt.query_map([], checkpoint_from_row)?;
    rows.collect()
}

// ── Loaded Periods ─────────────────────────────────────────────────

pub fn insert_loaded_period(conn: &Connection, period: &LoadedPeriod) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT INTO loaded_periods (dataset, period_type, date_from, date_to, applied_at, record_count)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            period.dataset.as_str(),
            period.period_type.as_str(),
            date_key(period.range.from),
            date_key(period.range.to),
            period.applied_at.to_rfc3339(),
            period.record_count as i64,
        ],
    )?;
    Ok(())
}

/// Loaded periods of a dataset that overlap `range`.
pub fn list_loaded_periods(
    conn: &Connection,
    dataset: DatasetKey,
    range: &DateRange,
) -> Result<Vec<LoadedPeriod>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT dataset, period_type, date_from, date_to, applied_at, record_count
         FROM loaded_periods
         WHERE dataset = ?1 AND date_from <= ?3 AND date_to >= ?2
         ORDER BY date_from, id",
    )?;
    let rows = stmt.query_map(
        params![dataset.as_str(), date_key(range.from), date_key(range.to)],
        |row| {
            let type_raw: String = row.get(1)?;
            let period_type = PeriodType::parse(&type_raw)
                .ok_or_else(|| conversion_error(1, format!("unknown period type {type_raw}")))?;
            let count: i64 = row.get(5)?;
            Ok(LoadedPeriod {
                dataset: dataset_column(row, 0)?,
                period_type,
                range: DateRange::new(day_column(row, 2)?, day_column(row, 3)?),
                applied_at: timestamp_column(row, 4)?,
                record_count: count.max(0) as u64,
            })
        },
    )?;
    rows.collect()
}

/// Whether `range` is already covered for `dataset`. A weekly record covers
/// every day inside it; under [`CoverageRule::AnyGranularity`] a contiguous
/// run of daily records also covers a weekly window.
pub fn is_period_loaded(
    conn: &Connection,
    dataset: DatasetKey,
    period_type: PeriodType,
    range: &DateRange,
    rule: CoverageRule,
) -> Result<bool, rusqlite::Error> {
    let periods = list_loaded_periods(conn, dataset, range)?;
    let ranges: Vec<DateRange> = periods
        .iter()
        .filter(|p| match rule {
            CoverageRule::AnyGranularity => true,
            CoverageRule::SameGranularity => {
                p.period_type == period_type || p.period_type == PeriodType::Weekly
            }
        })
        .map(|p| p.range)
        .collect();
    Ok(coverage::is_covered(&ranges, range))
}

/// All loaded ranges for a dataset, for gap reporting.
pub fn loaded_ranges(conn: &Connection, dataset: DatasetKey) -> Result<Vec<DateRange>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT date_from, date_to FROM loaded_periods WHERE dataset = ?1 ORDER BY date_from",
    )?;
    let rows = stmt.query_map(params![dataset.as_str()], |row| {
        Ok(DateRange::new(day_column(row, 0)?, day_column(row, 1)?))
    })?;
    rows.collect()
}

// ── Sync Runs ──────────────────────────────────────────────────────

pub fn insert_sync_run(conn: &Connection, plan: &Plan) -> Result<i64, rusqlite::Error> {
    conn.execute(
        "INSERT INTO sync_runs (dataset, mode, granularity, range_start, range_end, status, started_at)
         VALUES (?1, ?2, ?3, ?4, ?5, 'running', ?6)",
        params![
            plan.dataset.as_str(),
            plan.mode.as_str(),
            plan.granularity.as_str(),
            date_key(plan.range.from),
            date_key(plan.range.to),
            Utc::now().to_rfc3339(),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn finish_sync_run(
    conn: &Connection,
    run_id: i64,
    status: &str,
    fetched_rows: u64,
    applied_rows: u64,
    error_message: Option<&str>,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "UPDATE sync_runs SET
            status = ?2, completed_at = ?3,
            fetched_rows = ?4, applied_rows = ?5,
            error_message = ?6
         WHERE id = ?1",
        params![
            run_id,
            status,
            Utc::now().to_rfc3339(),
            fetched_rows as i64,
            applied_rows as i64,
            error_message,
        ],
    )?;
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunRecord {
    pub dataset: String,
    pub mode: String,
    pub granularity: String,
    pub range_start: String,
    pub range_end: String,
    pub status: String,
    pub started_at: String,
    pub fetched_rows: i64,
    pub applied_rows: i64,
    pub error_message: Option<String>,
}

/// Most recent run per dataset.
pub fn latest_sync_runs(conn: &Connection) -> Result<Vec<SyncRunRecord>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT dataset, mode, granularity, range_start, range_end, status, started_at,
                fetched_rows, applied_rows, error_message
         FROM sync_runs
         WHERE id IN (SELECT MAX(id) FROM sync_runs GROUP BY dataset)
         ORDER BY dataset",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(SyncRunRecord {
            dataset: row.get(0)?,
            mode: row.get(1)?,
            granularity: row.get(2)?,
            range_start: row.get(3)?,
            range_end: row.get(4)?,
            status: row.get(5)?,
            started_at: row.get(6)?,
            fetched_rows: row.get(7)?,
            applied_rows: row.get(8)?,
            error_message: row.get(9)?,
        })
    })?;
    rows.collect()
}

// ── Fact Windows ───────────────────────────────────────────────────

/// Date-keyed result tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FactTable {
    Sales,
    Returns,
    Logistics,
    Penalties,
    AdCosts,
    StorageCosts,
    AcceptanceCosts,
    Stocks,
    OrderStats,
    Supplies,
}

impl FactTable {
    pub const ALL: [FactTable; 10] = [
        FactTable::Sales,
        FactTable::Returns,
        FactTable::Logistics,
        FactTable::Penalties,
        FactTable::AdCosts,
        FactTable::StorageCosts,
        FactTable::AcceptanceCosts,
        FactTable::Stocks,
        FactTable::OrderStats,
        FactTable::Supplies,
    ];

    fn table_and_date_column(&self) -> (&'static str, &'static str) {
        match self {
            FactTable::Sales => ("fact_sales", "op_date"),
            FactTable::Returns => ("fact_returns", "op_date"),
            FactTable::Logistics => ("fact_logistics", "op_date"),
            FactTable::Penalties => ("fact_penalties", "op_date"),
            FactTable::AdCosts => ("fact_ad_costs", "cost_date"),
            FactTable::StorageCosts => ("fact_storage_costs", "cost_date"),
            FactTable::AcceptanceCosts => ("fact_acceptance_costs", "cost_date"),
            FactTable::Stocks => ("fact_stocks", "snapshot_date"),
            FactTable::OrderStats => ("fact_order_stats", "stat_date"),
            FactTable::Supplies => ("fact_supplies", "supply_date"),
        }
    }

    pub fn name(&self) -> &'static str {
        self.table_and_date_column().0
    }

    /// Result table for a finance-stream dataset.
    pub fn for_finance(dataset: DatasetKey) -> Option<FactTable> {
        match dataset {
            DatasetKey::Sales => Some(FactTable::Sales),
            DatasetKey::Returns => Some(FactTable::Returns),
            DatasetKey::Logistics => Some(FactTable::Logistics),
            DatasetKey::Penalties => Some(FactTable::Penalties),
            _ => None,
        }
    }
}

/// Delete every row of `table` dated inside `range`.
pub fn delete_window(
    conn: &Connection,
    table: FactTable,
    range: &DateRange,
) -> Result<usize, rusqlite::Error> {
    let (name, column) = table.table_and_date_column();
    conn.execute(
        &format!("DELETE FROM {name} WHERE {column} >= ?1 AND {column} <= ?2"),
        params![date_key(range.from), date_key(range.to)],
    )
}

pub fn count_rows(conn: &Connection, table: FactTable) -> Result<i64, rusqlite::Error> {
    conn.query_row(&format!("SELECT COUNT(*) FROM {}", table.name()), [], |row| {
        row.get(0)
    })
}

// ── Finance ────────────────────────────────────────────────────────

pub fn upsert_finance_aggregate(
    conn: &Connection,
    table: FactTable,
    row: &FinanceAggregate,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        &format!(
            "INSERT INTO {} (
                nm_id, op_date, size, supplier_article, quantity, retail_amount,
                for_pay, delivery_rub, penalty, lines, cached_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, datetime('now'))
            ON CONFLICT(nm_id, op_date, size) DO UPDATE SET
                supplier_article=excluded.supplier_article, quantity=excluded.quantity,
                retail_amount=excluded.retail_amount, for_pay=excluded.for_pay,
                delivery_rub=excluded.delivery_rub, penalty=excluded.penalty,
                lines=excluded.lines, cached_at=excluded.cached_at",
            table.name()
        ),
        params![
            row.nm_id,
            date_key(row.date),
            row.size,
            row.supplier_article,
            row.quantity,
            row.retail_amount,
            row.for_pay,
            row.delivery_rub,
            row.penalty,
            row.lines,
        ],
    )?;
    Ok(())
}

/// Read back a finance table (used by the CLI summary and tests).
pub fn list_finance_aggregates(
    conn: &Connection,
    table: FactTable,
    range: &DateRange,
) -> Result<Vec<FinanceAggregate>, rusqlite::Error> {
    let mut stmt = conn.prepare(&format!(
        "SELECT nm_id, op_date, size, supplier_article, quantity, retail_amount,
                for_pay, delivery_rub, penalty, lines
         FROM {} WHERE op_date >= ?1 AND op_date <= ?2
         ORDER BY op_date, nm_id, size",
        table.name()
    ))?;
    let rows = stmt.query_map(params![date_key(range.from), date_key(range.to)], |row| {
        Ok(FinanceAggregate {
            nm_id: row.get(0)?,
            date: day_column(row, 1)?,
            size: row.get(2)?,
            supplier_article: row.get(3)?,
            quantity: row.get(4)?,
            retail_amount: row.get(5)?,
            for_pay: row.get(6)?,
            delivery_rub: row.get(7)?,
            penalty: row.get(8)?,
            lines: row.get(9)?,
        })
    })?;
    rows.collect()
}

// ── Advertising ────────────────────────────────────────────────────

pub fn upsert_campaign(conn: &Connection, campaign: &Campaign) -> Result<(), rusqlite::Error> {
    let nm_ids = serde_json::to_string(&campaign.nm_ids).unwrap_or_else(|_| "[]".into());
    conn.execute(
        "INSERT INTO dim_campaigns (advert_id, name, nm_ids, cached_at)
         VALUES (?1, ?2, ?3, datetime('now'))
         ON CONFLICT(advert_id) DO UPDATE SET
            name=excluded.name, nm_ids=excluded.nm_ids, cached_at=excluded.cached_at",
        params![campaign.advert_id, campaign.name, nm_ids],
    )?;
    Ok(())
}

pub fn known_campaign_ids(conn: &Connection) -> Result<Vec<i64>, rusqlite::Error> {
    let mut stmt = conn.prepare("SELECT advert_id FROM dim_campaigns ORDER BY advert_id")?;
    let rows = stmt.query_map([], |row| row.get(0))?;
    rows.collect()
}

pub fn upsert_ad_cost(conn: &Connection, row: &AdCost) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT INTO fact_ad_costs (advert_id, cost_date, campaign_name, amount, charges, cached_at)
         VALUES (?1, ?2, ?3, ?4, ?5, datetime('now'))
         ON CONFLICT(advert_id, cost_date) DO UPDATE SET
            campaign_name=excluded.campaign_name, amount=excluded.amount,
            charges=excluded.charges, cached_at=excluded.cached_at",
        params![
            row.advert_id,
            date_key(row.date),
            row.campaign_name,
            row.amount,
            row.charges,
        ],
    )?;
    Ok(())
}

// ── Async Report Facts ─────────────────────────────────────────────

pub fn upsert_storage_cost(conn: &Connection, row: &StorageCost) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT INTO fact_storage_costs (
            nm_id, cost_date, size, supplier_article, warehouse_price, barcodes_count, cached_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, datetime('now'))
        ON CONFLICT(nm_id, cost_date, size) DO UPDATE SET
            supplier_article=excluded.supplier_article,
            warehouse_price=excluded.warehouse_price,
            barcodes_count=excluded.barcodes_count, cached_at=excluded.cached_at",
        params![
            row.nm_id,
            date_key(row.date),
            row.size,
            row.supplier_article,
            row.warehouse_price,
            row.barcodes_count,
        ],
    )?;
    Ok(())
}

pub fn upsert_acceptance_cost(
    conn: &Connection,
    row: &AcceptanceCost,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT INTO fact_acceptance_costs (nm_id, cost_date, total, quantity, cached_at)
         VALUES (?1, ?2, ?3, ?4, datetime('now'))
         ON CONFLICT(nm_id, cost_date) DO UPDATE SET
            total=excluded.total, quantity=excluded.quantity, cached_at=excluded.cached_at",
        params![row.nm_id, date_key(row.date), row.total, row.quantity],
    )?;
    Ok(())
}

pub fn upsert_stock_level(conn: &Connection, row: &StockLevel) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT INTO fact_stocks (
            nm_id, snapshot_date, size, supplier_article, quantity,
            in_way_to_client, in_way_from_client, cached_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, datetime('now'))
        ON CONFLICT(nm_id, snapshot_date, size) DO UPDATE SET
            supplier_article=excluded.supplier_article, quantity=excluded.quantity,
            in_way_to_client=excluded.in_way_to_client,
            in_way_from_client=excluded.in_way_from_client, cached_at=excluded.cached_at",
        params![
            row.nm_id,
            date_key(row.snapshot_date),
            row.size,
            row.supplier_article,
            row.quantity,
            row.in_way_to_client,
            row.in_way_from_client,
        ],
    )?;
    Ok(())
}

// ── Order Funnel ───────────────────────────────────────────────────

pub fn upsert_order_stat(conn: &Connection, row: &OrderStat) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT INTO fact_order_stats (
            nm_id, stat_date, open_card_count, add_to_cart_count, orders_count,
            orders_sum, buyouts_count, buyouts_sum, cached_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, datetime('now'))
        ON CONFLICT(nm_id, stat_date) DO UPDATE SET
            open_card_count=excluded.open_card_count,
            add_to_cart_count=excluded.add_to_cart_count,
            orders_count=excluded.orders_count, orders_sum=excluded.orders_sum,
            buyouts_count=excluded.buyouts_count, buyouts_sum=excluded.buyouts_sum,
            cached_at=excluded.cached_at",
        params![
            row.nm_id,
            date_key(row.date),
            row.open_card_count,
            row.add_to_cart_count,
            row.orders_count,
            row.orders_sum,
            row.buyouts_count,
            row.buyouts_sum,
        ],
    )?;
    Ok(())
}

// ── Supplies ───────────────────────────────────────────────────────

pub fn upsert_supply(conn: &Connection, row: &Supply) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT INTO fact_supplies (
            income_id, nm_id, supply_date, size, supplier_article, warehouse,
            quantity, total_price, cached_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, datetime('now'))
        ON CONFLICT(income_id, nm_id, supply_date, size) DO UPDATE SET
            supplier_article=excluded.supplier_article, warehouse=excluded.warehouse,
            quantity=excluded.quantity, total_price=excluded.total_price,
            cached_at=excluded.cached_at",
        params![
            row.income_id,
            row.nm_id,
            date_key(row.date),
            row.size,
            row.supplier_article,
            row.warehouse,
            row.quantity,
            row.total_price,
        ],
    )?;
    Ok(())
}

// ── Catalog ────────────────────────────────────────────────────────

pub fn upsert_product(conn: &Connection, product: &Product) -> Result<(), rusqlite::Error> {
    let sizes = serde_json::to_string(&product.sizes).unwrap_or_else(|_| "[]".into());
    conn.execute(
        "INSERT INTO dim_products (
            nm_id, supplier_article, title, brand, subject, sizes, updated_at, cached_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, datetime('now'))
        ON CONFLICT(nm_id) DO UPDATE SET
            supplier_article=excluded.supplier_article, title=excluded.title,
            brand=excluded.brand, subject=excluded.subject, sizes=excluded.sizes,
            updated_at=excluded.updated_at, cached_at=excluded.cached_at",
        params![
            product.nm_id,
            product.supplier_article,
            product.title,
            product.brand,
            product.subject,
            sizes,
            product.updated_at,
        ],
    )?;
    Ok(())
}
