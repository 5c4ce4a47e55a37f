use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::Value;

use crate::api::{Feed, Granularity, PageRequest};
use crate::date_util::parse_day;
use crate::error::Result;
use crate::storage::repository::{self, FactTable};
use crate::sync::context::SyncContext;
use crate::sync::jobs::{decode, merge_rows, parse_all, DatasetJob, Fetched, Mergeable};
use crate::sync::planner::Plan;
use crate::sync::policy::DatasetKey;
use crate::sync::rate_limit::retry_api;

/// Longest range the spend history endpoint accepts per call.
const MAX_RANGE_DAYS: u32 = 31;

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct RawCharge {
    advert_id: i64,
    upd_time: Option<String>,
    upd_sum: f64,
    camp_name: String,
}

/// One spend charge against a campaign.
#[derive(Debug, Clone, PartialEq)]
pub struct AdCharge {
    pub advert_id: i64,
    pub date: NaiveDate,
    pub campaign_name: String,
    pub amount: f64,
}

pub fn parse_charge(value: &Value) -> Option<AdCharge> {
    let raw: RawCharge = decode(value, "advertising")?;
    if raw.advert_id <= 0 {
        return None;
    }
    let date = raw.upd_time.as_deref().and_then(parse_day)?;
    Some(AdCharge {
        advert_id: raw.advert_id,
        date,
        campaign_name: raw.camp_name,
        amount: raw.upd_sum,
    })
}

/// Daily spend of one campaign.
#[derive(Debug, Clone, PartialEq)]
pub struct AdCost {
    pub advert_id: i64,
    pub date: NaiveDate,
    pub campaign_name: String,
    pub amount: f64,
    pub charges: i64,
}

impl From<AdCharge> for AdCost {
    fn from(charge: AdCharge) -> Self {
        Self {
            advert_id: charge.advert_id,
            date: charge.date,
            campaign_name: charge.campaign_name,
            amount: charge.amount,
            charges: 1,
        }
    }
}

impl Mergeable for AdCost {
    type Key = (i64, NaiveDate);

    fn merge_key(&self) -> Self::Key {
        (self.advert_id, self.date)
    }

    fn absorb(&mut self, other: Self) {
        if self.campaign_name.is_empty() {
            self.campaign_name = other.campaign_name;
        }
        self.amount += other.amount;
        self.charges += other.charges;
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawNms {
    nms: Vec<i64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct RawCampaign {
    advert_id: i64,
    name: String,
    auto_params: Option<RawNms>,
    united_params: Vec<RawNms>,
}

/// Campaign dimension row.
#[derive(Debug, Clone, PartialEq)]
pub struct Campaign {
    pub advert_id: i64,
    pub name: String,
    /// Articles the campaign advertises.
    pub nm_ids: Vec<i64>,
}

pub fn parse_campaign(value: &Value) -> Option<Campaign> {
    let raw: RawCampaign = decode(value, "campaign")?;
    if raw.advert_id <= 0 {
        return None;
    }
    let nm_ids: BTreeSet<i64> = raw
        .auto_params
        .into_iter()
        .chain(raw.united_params)
        .flat_map(|p| p.nms)
        .collect();
    Some(Campaign {
        advert_id: raw.advert_id,
        name: raw.name,
        nm_ids: nm_ids.into_iter().collect(),
    })
}

pub struct AdvertisingJob {
    max_range_days: u32,
}

impl Default for AdvertisingJob {
    fn default() -> Self {
        Self {
            max_range_days: MAX_RANGE_DAYS,
        }
    }
}

/// What the advertising fetch hands to apply: spend charges plus details of
/// any campaign the dimension table has not seen yet.
#[derive(Debug, Clone, PartialEq)]
pub enum AdRow {
    Charge(AdCharge),
    Campaign(Campaign),
}

impl AdvertisingJob {
    /// Look up campaigns referenced by `advert_ids` that are not stored yet.
    async fn missing_campaigns(&self, ctx: &SyncContext, advert_ids: BTreeSet<i64>) -> Result<Vec<Campaign>> {
        let known = ctx.db.reader().call(|conn| repository::known_campaign_ids(conn)).await?;
        let missing: Vec<i64> = advert_ids
            .into_iter()
            .filter(|id| !known.contains(id))
            .collect();
        if missing.is_empty() {
            return Ok(Vec::new());
        }
        let rows = retry_api!(
            ctx.settings.rate_limit_delay,
            "campaign lookup",
            ctx.api.campaigns(&missing)
        )?;
        let campaigns = parse_all(&rows, "campaign", parse_campaign);
        log::debug!("Looked up {} of {} new campaigns", campaigns.len(), missing.len());
        Ok(campaigns)
    }
}

#[async_trait]
impl DatasetJob for AdvertisingJob {
    type Row = AdRow;

    fn dataset(&self) -> DatasetKey {
        DatasetKey::AdvertisingCost
    }

    async fn fetch(&self, ctx: &SyncContext, plan: &Plan) -> Result<Fetched<AdRow>> {
        let mut charges = Vec::new();
        let mut fetched = 0u64;
        for (index, chunk) in plan.range.chunks(self.max_range_days).into_iter().enumerate() {
            let request = PageRequest {
                feed: Feed::AdvertisingHistory,
                range: chunk,
                granularity: Granularity::Daily,
                cursor: None,
                limit: 0,
            };
            let page = retry_api!(
                ctx.settings.rate_limit_delay,
                "advertising history",
                ctx.api.fetch_page(&request)
            )?;
            fetched += page.len() as u64;
            ctx.progress.on_page_fetched(plan.dataset, index as u32 + 1, page.len());
            charges.extend(
                parse_all(&page, "advertising", parse_charge)
                    .into_iter()
                    .filter(|c| chunk.contains(c.date)),
            );
        }

        let advert_ids: BTreeSet<i64> = charges.iter().map(|c| c.advert_id).collect();
        let campaigns = self.missing_campaigns(ctx, advert_ids).await?;
        let rows = campaigns
            .into_iter()
            .map(AdRow::Campaign)
            .chain(charges.into_iter().map(AdRow::Charge))
            .collect();
        Ok(Fetched::new(rows, fetched))
    }

    async fn apply(&self, ctx: &SyncContext, plan: &Plan, rows: Vec<AdRow>) -> Result<u64> {
        let mut campaigns = Vec::new();
        let mut charges = Vec::new();
        for row in rows {
            match row {
                AdRow::Campaign(campaign) => campaigns.push(campaign),
                AdRow::Charge(charge) => charges.push(AdCost::from(charge)),
            }
        }
        let costs = merge_rows(charges);
        let range = plan.range;

        let applied = ctx
            .db
            .writer()
            .call(move |conn| {
                let tx = conn.transaction()?;
                for campaign in &campaigns {
                    repository::upsert_campaign(&tx, campaign)?;
                }
                repository::delete_window(&tx, FactTable::AdCosts, &range)?;
                for cost in &costs {
                    repository::upsert_ad_cost(&tx, cost)?;
                }
                tx.commit()?;
                Ok::<u64, rusqlite::Error>(costs.len() as u64)
            })
            .await?;
        Ok(applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ApiError;
    use crate::date_util::DateRange;
    use crate::sync::jobs::fake::{d, test_context, FakeApi};
    use crate::sync::jobs::SyncJob;
    use crate::sync::planner::SyncMode;
    use serde_json::json;

    fn charge(advert_id: i64, time: &str, sum: f64) -> Value {
        json!({"advertId": advert_id, "updTime": time, "updSum": sum, "campName": "Spring"})
    }

    #[test]
    fn test_parse_charge() {
        let c = parse_charge(&charge(5, "2024-02-05T10:00:00+03:00", 12.5)).unwrap();
        assert_eq!(c.date, d(2024, 2, 5));
        assert_eq!(c.amount, 12.5);
        assert!(parse_charge(&json!({"updTime": "2024-02-05", "updSum": 1})).is_none());
        assert!(parse_charge(&json!({"advertId": 5, "updSum": 1})).is_none());
    }

    #[test]
    fn test_parse_campaign_collects_articles() {
        let c = parse_campaign(&json!({
            "advertId": 9,
            "name": "Auto",
            "autoParams": {"nms": [3, 1]},
            "unitedParams": [{"nms": [1, 2]}],
        }))
        .unwrap();
        assert_eq!(c.nm_ids, vec![1, 2, 3]);
        assert_eq!(parse_campaign(&json!({"advertId": 4})).unwrap().nm_ids, Vec::<i64>::new());
    }

    #[tokio::test]
    async fn test_long_range_is_chunked_and_charges_merged() {
        let api = FakeApi::new();
        api.respond_with(|req| {
            if req.range.contains(d(2024, 1, 5)) {
                Ok(vec![
                    charge(5, "2024-01-05T10:00:00", 10.0),
                    charge(5, "2024-01-05T18:00:00", 2.0),
                ])
            } else {
                Ok(vec![charge(6, "2024-02-20T09:00:00", 4.0)])
            }
        });
        api.set_campaigns(vec![json!({"advertId": 5, "name": "Spring", "autoParams": {"nms": [1]}})]);
        let ctx = test_context(api.clone(), d(2024, 3, 1)).await;
        let job = AdvertisingJob::default();
        let plan = Plan {
            dataset: DatasetKey::AdvertisingCost,
            range: DateRange::new(d(2024, 1, 1), d(2024, 2, 29)),
            mode: SyncMode::Catchup,
            overlap_days: None,
            granularity: Granularity::Daily,
        };

        let applied = job.fetch_and_apply(&ctx, &plan).await.unwrap();
        assert_eq!(api.requests(Feed::AdvertisingHistory).len(), 2);
        assert_eq!(applied.fetched, 3);
        assert_eq!(applied.applied, 2);

        let known = ctx.db.reader().call(|conn| repository::known_campaign_ids(conn)).await.unwrap();
        assert_eq!(known, vec![5]);
    }

    fn february_plan() -> Plan {
        Plan {
            dataset: DatasetKey::AdvertisingCost,
            range: DateRange::new(d(2024, 2, 1), d(2024, 2, 6)),
            mode: SyncMode::Catchup,
            overlap_days: None,
            granularity: Granularity::Daily,
        }
    }

    #[tokio::test]
    async fn test_campaign_lookup_failure_fails_fetch() {
        let api = FakeApi::new();
        api.push_page(Feed::AdvertisingHistory, vec![charge(7, "2024-02-03T10:00:00", 3.0)]);
        api.fail_campaigns(ApiError::Unavailable("maintenance".into()));
        let ctx = test_context(api.clone(), d(2024, 2, 7)).await;

        let err = AdvertisingJob::default().fetch(&ctx, &february_plan()).await.unwrap_err();
        assert!(matches!(err, crate::Error::Api(ApiError::Unavailable(_))), "{err:?}");
        assert_eq!(api.campaign_calls(), 1);
    }

    #[tokio::test]
    async fn test_apply_only_writes_the_store() {
        let api = FakeApi::new();
        api.fail_campaigns(ApiError::Unavailable("maintenance".into()));
        let ctx = test_context(api.clone(), d(2024, 2, 7)).await;
        let job = AdvertisingJob::default();
        let plan = february_plan();
        let rows = vec![
            AdRow::Campaign(Campaign {
                advert_id: 7,
                name: "Spring".into(),
                nm_ids: vec![1],
            }),
            AdRow::Charge(parse_charge(&charge(7, "2024-02-03T10:00:00", 3.0)).unwrap()),
            AdRow::Charge(parse_charge(&charge(7, "2024-02-03T12:00:00", 1.5)).unwrap()),
        ];

        assert_eq!(job.apply(&ctx, &plan, rows.clone()).await.unwrap(), 1);
        assert_eq!(job.apply(&ctx, &plan, rows).await.unwrap(), 1);
        assert_eq!(api.campaign_calls(), 0);

        let count = ctx
            .db
            .reader()
            .call(|conn| repository::count_rows(conn, FactTable::AdCosts))
            .await
            .unwrap();
        assert_eq!(count, 1);
        let known = ctx.db.reader().call(|conn| repository::known_campaign_ids(conn)).await.unwrap();
        assert_eq!(known, vec![7]);
    }
}
