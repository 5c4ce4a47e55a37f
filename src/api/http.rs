use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde_json::{json, Value};

use super::{ApiError, ApiResult, Feed, MarketplaceApi, PageRequest, ReportKind, TaskStatus};
use crate::date_util::{date_key, DateRange};

const STATISTICS_HOST: &str = "https://statistics-api.wildberries.ru";
const ANALYTICS_HOST: &str = "https://seller-analytics-api.wildberries.ru";
const ADVERT_HOST: &str = "https://advert-api.wildberries.ru";
const CONTENT_HOST: &str = "https://content-api.wildberries.ru";

/// Environment variable holding the seller API token.
pub const TOKEN_ENV: &str = "SELLERDW_TOKEN";

/// Thin HTTP implementation of [`MarketplaceApi`].
#[derive(Clone)]
pub struct HttpApi {
    http: reqwest::Client,
    token: String,
}

impl HttpApi {
    pub fn new(token: impl Into<String>) -> ApiResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| ApiError::Unavailable(e.to_string()))?;
        Ok(Self {
            http,
            token: token.into(),
        })
    }

    /// Build a client from the `SELLERDW_TOKEN` environment variable.
    pub fn from_env() -> ApiResult<Self> {
        let token = std::env::var(TOKEN_ENV)
            .map_err(|_| ApiError::Unauthorized(format!("{TOKEN_ENV} is not set")))?;
        Self::new(token)
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        self.http
            .request(method, url)
            .header("Authorization", &self.token)
    }

    /// Send a request and decode the JSON body. `204 No Content` decodes to
    /// `Value::Null`.
    async fn send(&self, builder: RequestBuilder) -> ApiResult<Value> {
        let response = builder
            .send()
            .await
            .map_err(|e| ApiError::Unavailable(e.to_string()))?;
        let status = response.status();
        match status {
            StatusCode::NO_CONTENT => return Ok(Value::Null),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                let body = response.text().await.unwrap_or_default();
                return Err(ApiError::Unauthorized(body));
            }
            StatusCode::TOO_MANY_REQUESTS => return Err(ApiError::RateLimited),
            StatusCode::NOT_FOUND => {
                let body = response.text().await.unwrap_or_default();
                return Err(ApiError::NotFound(body));
            }
            s if s.is_server_error() => {
                let body = response.text().await.unwrap_or_default();
                return Err(ApiError::Unavailable(format!("HTTP {}: {body}", s.as_u16())));
            }
            s if !s.is_success() => {
                let body = response.text().await.unwrap_or_default();
                return Err(ApiError::Status {
                    status: s.as_u16(),
                    message: body,
                });
            }
            _ => {}
        }
        let body = response
            .text()
            .await
            .map_err(|e| ApiError::Unavailable(e.to_string()))?;
        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body).map_err(|e| ApiError::Decode(e.to_string()))
    }

    fn report_base(kind: ReportKind) -> &'static str {
        match kind {
            ReportKind::PaidStorage => "/api/v1/paid_storage",
            ReportKind::Acceptance => "/api/v1/acceptance_report",
            ReportKind::WarehouseRemains => "/api/v1/warehouse_remains",
        }
    }
}

/// Pull the row array out of a response: either the body itself or the first
/// array found under one of `paths`.
fn rows_at(body: Value, paths: &[&str]) -> ApiResult<Vec<Value>> {
    match body {
        Value::Null => Ok(Vec::new()),
        Value::Array(rows) => Ok(rows),
        other => {
            for path in paths {
                if let Some(Value::Array(rows)) = other.pointer(path) {
                    return Ok(rows.clone());
                }
                if let Some(Value::Null) = other.pointer(path) {
                    return Ok(Vec::new());
                }
            }
            Err(ApiError::Decode(format!(
                "expected an array at one of {paths:?}"
            )))
        }
    }
}

#[async_trait]
impl MarketplaceApi for HttpApi {
    async fn fetch_page(&self, request: &PageRequest) -> ApiResult<Vec<Value>> {
        let from = date_key(request.range.from);
        let to = date_key(request.range.to);
        match request.feed {
            Feed::FinanceReport => {
                let url = format!("{STATISTICS_HOST}/api/v5/supplier/reportDetailByPeriod");
                let rrdid = request.cursor.clone().unwrap_or_else(|| "0".into());
                let builder = self.request(Method::GET, &url).query(&[
                    ("dateFrom", from.as_str()),
                    ("dateTo", to.as_str()),
                    ("limit", request.limit.to_string().as_str()),
                    ("rrdid", rrdid.as_str()),
                    ("period", request.granularity.as_str()),
                ]);
                rows_at(self.send(builder).await?, &[])
            }
            Feed::AdvertisingHistory => {
                // Not paginated: a follow-up page request is always empty.
                if request.cursor.is_some() {
                    return Ok(Vec::new());
                }
                let url = format!("{ADVERT_HOST}/adv/v1/upd");
                let builder = self
                    .request(Method::GET, &url)
                    .query(&[("from", from.as_str()), ("to", to.as_str())]);
                rows_at(self.send(builder).await?, &[])
            }
            Feed::OrderStats => {
                let url = format!("{ANALYTICS_HOST}/api/v2/nm-report/detail");
                let page: u32 = request
                    .cursor
                    .as_deref()
                    .and_then(|c| c.parse().ok())
                    .unwrap_or(1);
                let body = json!({
                    "period": {
                        "begin": format!("{from} 00:00:00"),
                        "end": format!("{to} 23:59:59"),
                    },
                    "page": page,
                });
                let builder = self.request(Method::POST, &url).json(&body);
                rows_at(self.send(builder).await?, &["/data/cards"])
            }
            Feed::Supplies => {
                if request.cursor.is_some() {
                    return Ok(Vec::new());
                }
                let url = format!("{STATISTICS_HOST}/api/v1/supplier/incomes");
                let builder = self
                    .request(Method::GET, &url)
                    .query(&[("dateFrom", from.as_str())]);
                rows_at(self.send(builder).await?, &[])
            }
            Feed::Catalog => {
                let url = format!("{CONTENT_HOST}/content/v2/get/cards/list");
                let mut cursor = json!({ "limit": request.limit });
                if let Some((updated_at, nm_id)) =
                    request.cursor.as_deref().and_then(|c| c.split_once('|'))
                {
                    cursor["updatedAt"] = json!(updated_at);
                    cursor["nmID"] = json!(nm_id.parse::<i64>().unwrap_or_default());
                }
                let body = json!({
                    "settings": {
                        "cursor": cursor,
                        "filter": { "withPhoto": -1 },
                    }
                });
                let builder = self.request(Method::POST, &url).json(&body);
                rows_at(self.send(builder).await?, &["/cards"])
            }
        }
    }

    async fn submit_report(&self, kind: ReportKind, range: &DateRange) -> ApiResult<String> {
        let url = format!("{ANALYTICS_HOST}{}", Self::report_base(kind));
        let from = date_key(range.from);
        let to = date_key(range.to);
        let builder = match kind {
            ReportKind::WarehouseRemains => self.request(Method::GET, &url).query(&[
                ("groupByNm", "true"),
                ("groupBySize", "true"),
                ("groupByBrand", "false"),
            ]),
            _ => self
                .request(Method::GET, &url)
                .query(&[("dateFrom", from.as_str()), ("dateTo", to.as_str())]),
        };
        let body = self.send(builder).await?;
        body.pointer("/data/taskId")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ApiError::Decode("missing data.taskId".into()))
    }

    async fn report_status(&self, kind: ReportKind, task_id: &str) -> ApiResult<TaskStatus> {
        let url = format!(
            "{ANALYTICS_HOST}{}/tasks/{task_id}/status",
            Self::report_base(kind)
        );
        let body = self.send(self.request(Method::GET, &url)).await?;
        let raw = body
            .pointer("/data/status")
            .and_then(Value::as_str)
            .ok_or_else(|| ApiError::Decode("missing data.status".into()))?;
        TaskStatus::parse(raw).ok_or_else(|| ApiError::Decode(format!("unknown status {raw}")))
    }

    async fn download_report(&self, kind: ReportKind, task_id: &str) -> ApiResult<Vec<Value>> {
        let url = format!(
            "{ANALYTICS_HOST}{}/tasks/{task_id}/download",
            Self::report_base(kind)
        );
        rows_at(self.send(self.request(Method::GET, &url)).await?, &["/data"])
    }

    async fn campaigns(&self, ids: &[i64]) -> ApiResult<Vec<Value>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let url = format!("{ADVERT_HOST}/adv/v1/promotion/adverts");
        let builder = self.request(Method::POST, &url).json(&ids);
        rows_at(self.send(builder).await?, &[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rows_at_plain_array() {
        let rows = rows_at(json!([{"a": 1}, {"a": 2}]), &[]).unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn test_rows_at_nested_and_empty() {
        let rows = rows_at(json!({"data": {"cards": [{"nmID": 1}]}}), &["/data/cards"]).unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows_at(Value::Null, &["/data"]).unwrap().is_empty());
        assert!(rows_at(json!({"data": null}), &["/data"]).unwrap().is_empty());
    }

    #[test]
    fn test_rows_at_missing_array_is_decode_error() {
        let err = rows_at(json!({"error": true}), &["/data"]).unwrap_err();
        assert!(matches!(err, ApiError::Decode(_)));
    }
}
