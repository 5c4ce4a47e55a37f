//! Product cards, paginated by an `updatedAt|nmID` token that survives
//! between runs so each run only walks cards changed since the last one.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::api::{Feed, Granularity, PageRequest};
use crate::error::Result;
use crate::storage::repository;
use crate::sync::checkpoint::CheckpointKey;
use crate::sync::context::SyncContext;
use crate::sync::jobs::{decode, parse_all, upsert_all, DatasetJob, Fetched};
use crate::sync::planner::Plan;
use crate::sync::policy::DatasetKey;
use crate::sync::rate_limit::retry_api;

pub const CATALOG_PAGE_SIZE: u32 = 100;

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct RawSize {
    tech_size: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct RawCard {
    #[serde(rename = "nmID")]
    nm_id: i64,
    vendor_code: String,
    title: String,
    brand: String,
    subject_name: String,
    sizes: Vec<RawSize>,
    updated_at: Option<String>,
}

/// Product dimension row.
#[derive(Debug, Clone, PartialEq)]
pub struct Product {
    pub nm_id: i64,
    pub supplier_article: String,
    pub title: String,
    pub brand: String,
    pub subject: String,
    pub sizes: Vec<String>,
    pub updated_at: Option<String>,
}

pub fn parse_product(value: &Value) -> Option<Product> {
    let raw: RawCard = decode(value, "catalog")?;
    if raw.nm_id <= 0 {
        return None;
    }
    Some(Product {
        nm_id: raw.nm_id,
        supplier_article: raw.vendor_code,
        title: raw.title,
        brand: raw.brand,
        subject: raw.subject_name,
        sizes: raw
            .sizes
            .into_iter()
            .map(|s| s.tech_size)
            .filter(|s| !s.is_empty())
            .collect(),
        updated_at: raw.updated_at,
    })
}

/// Continuation token pointing just after `card`.
pub fn token_after(card: &Value) -> Option<String> {
    let updated_at = card.get("updatedAt")?.as_str()?;
    let nm_id = card.get("nmID")?.as_i64()?;
    Some(format!("{updated_at}|{nm_id}"))
}

pub struct CatalogJob {
    page_size: u32,
}

impl Default for CatalogJob {
    fn default() -> Self {
        Self {
            page_size: CATALOG_PAGE_SIZE,
        }
    }
}

impl CatalogJob {
    pub fn with_page_size(page_size: u32) -> Self {
        Self {
            page_size: page_size.max(1),
        }
    }
}

#[async_trait]
impl DatasetJob for CatalogJob {
    type Row = Product;

    fn dataset(&self) -> DatasetKey {
        DatasetKey::Catalog
    }

    async fn fetch(&self, ctx: &SyncContext, plan: &Plan) -> Result<Fetched<Product>> {
        let previous = ctx
            .db
            .reader()
            .call(|conn| repository::get_checkpoint(conn, CheckpointKey::forward(DatasetKey::Catalog)))
            .await?;
        let mut token = previous.and_then(|cp| cp.cursor_token);
        let mut products = Vec::new();
        let mut fetched = 0u64;
        let mut page_number = 0u32;

        loop {
            let request = PageRequest {
                feed: Feed::Catalog,
                range: plan.range,
                granularity: Granularity::Daily,
                cursor: token.clone(),
                limit: self.page_size,
            };
            let page = retry_api!(
                ctx.settings.rate_limit_delay,
                "catalog",
                ctx.api.fetch_page(&request)
            )?;
            if page.is_empty() {
                break;
            }
            page_number += 1;
            fetched += page.len() as u64;
            ctx.progress.on_page_fetched(DatasetKey::Catalog, page_number, page.len());
            products.extend(parse_all(&page, "catalog", parse_product));

            if let Some(next) = page.last().and_then(token_after) {
                token = Some(next);
            }
            if page.len() < self.page_size as usize {
                break;
            }
        }

        Ok(Fetched {
            rows: products,
            fetched,
            cursor_token: token,
        })
    }

    async fn apply(&self, ctx: &SyncContext, _plan: &Plan, rows: Vec<Product>) -> Result<u64> {
        upsert_all(ctx, rows, repository::upsert_product).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::date_util::DateRange;
    use crate::sync::checkpoint::Checkpoint;
    use crate::sync::jobs::fake::{d, test_context, FakeApi};
    use crate::sync::jobs::SyncJob;
    use crate::sync::planner::SyncMode;
    use serde_json::json;

    fn card(nm_id: i64, updated_at: &str) -> Value {
        json!({
            "nmID": nm_id,
            "vendorCode": format!("ART-{nm_id}"),
            "title": "Dress",
            "sizes": [{"techSize": "42"}, {"techSize": ""}],
            "updatedAt": updated_at,
        })
    }

    fn plan() -> Plan {
        Plan {
            dataset: DatasetKey::Catalog,
            range: DateRange::single(d(2024, 2, 6)),
            mode: SyncMode::Catchup,
            overlap_days: None,
            granularity: Granularity::Daily,
        }
    }

    #[test]
    fn test_parse_product() {
        let p = parse_product(&card(5, "2024-02-01T10:00:00Z")).unwrap();
        assert_eq!(p.sizes, vec!["42".to_string()]);
        assert_eq!(p.brand, "");
        assert!(parse_product(&json!({"title": "x"})).is_none());
        assert_eq!(
            token_after(&card(5, "2024-02-01T10:00:00Z")).as_deref(),
            Some("2024-02-01T10:00:00Z|5")
        );
    }

    #[tokio::test]
    async fn test_token_is_persisted_and_resumed() {
        let api = FakeApi::new();
        api.push_page(Feed::Catalog, vec![card(1, "2024-02-01T00:00:00Z"), card(2, "2024-02-02T00:00:00Z")]);
        api.push_page(Feed::Catalog, vec![card(3, "2024-02-03T00:00:00Z")]);
        let ctx = test_context(api.clone(), d(2024, 2, 7)).await;
        let job = CatalogJob::with_page_size(2);

        let applied = job.fetch_and_apply(&ctx, &plan()).await.unwrap();
        assert_eq!(applied.applied, 3);
        assert_eq!(applied.cursor_token.as_deref(), Some("2024-02-03T00:00:00Z|3"));

        let checkpoint = job.checkpoint_after(&ctx, &plan(), None, &applied);
        assert_eq!(checkpoint.cursor_token.as_deref(), Some("2024-02-03T00:00:00Z|3"));
        let saved: Checkpoint = checkpoint.clone();
        ctx.db
            .writer()
            .call(move |conn| repository::save_checkpoint(conn, &saved))
            .await
            .unwrap();

        // Nothing changed since: the next run starts from the saved token.
        let again = job.fetch_and_apply(&ctx, &plan()).await.unwrap();
        assert_eq!(again.applied, 0);
        assert_eq!(again.cursor_token, checkpoint.cursor_token);
        let requests = api.requests(Feed::Catalog);
        assert_eq!(requests.last().unwrap().cursor, checkpoint.cursor_token);
    }
}
