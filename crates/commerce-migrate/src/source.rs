//! Source platform adapter.
//!
//! The collector only needs one call: list a page of records for an entity
//! kind. [`RestSourceClient`] implements it for a page-based REST API that
//! answers `GET /{kind}s/?page=&limit=` with `{count, results, next}`.
//! The `next` link is never consulted.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use tracing::debug;

use crate::config::{RetryConfig, SourceConfig};
use crate::error::{MigrateError, Result};
use crate::http::{build_client, read_json, transport_error};
use crate::model::{EntityKind, RawRecord};
use crate::ratelimit::RateLimiter;

/// One page of raw records.
#[derive(Debug, Clone, Default)]
pub struct SourcePage {
    pub records: Vec<RawRecord>,
    /// Total the source claims to hold for this kind, when it says so.
    pub reported_total: Option<u64>,
}

impl SourcePage {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Paginated read access to the source platform.
#[async_trait]
pub trait SourceApi: Send + Sync {
    /// Fetch logical page `page` (1-based) of `page_size` records.
    async fn list_page(&self, kind: EntityKind, page: i64, page_size: usize)
        -> Result<SourcePage>;

    /// Source-reported record count for `kind`.
    async fn reported_total(&self, kind: EntityKind) -> Result<Option<u64>> {
        Ok(self.list_page(kind, 1, 1).await?.reported_total)
    }

    /// Verify credentials and reachability.
    async fn health_check(&self) -> Result<()> {
        self.list_page(EntityKind::Customer, 1, 1).await.map(|_| ())
    }
}

/// reqwest-based client for the source REST API.
pub struct RestSourceClient {
    client: Client,
    base_url: String,
    api_key: String,
    api_secret: String,
    page_base: i64,
    limiter: RateLimiter,
}

impl RestSourceClient {
    pub fn new(config: &SourceConfig, retry: &RetryConfig) -> Result<Self> {
        Ok(Self {
            client: build_client(retry.request_timeout())?,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            api_secret: config.api_secret.clone(),
            page_base: config.page_base,
            limiter: RateLimiter::new(config.requests_per_second),
        })
    }

    /// API page number for logical page `page`.
    pub fn api_page(&self, page: i64) -> i64 {
        page - 1 + self.page_base
    }

    fn list_url(&self, kind: EntityKind) -> String {
        format!("{}/{}/", self.base_url, kind.plural())
    }
}

#[async_trait]
impl SourceApi for RestSourceClient {
    async fn list_page(
        &self,
        kind: EntityKind,
        page: i64,
        page_size: usize,
    ) -> Result<SourcePage> {
        if page < 1 {
            return Err(MigrateError::Config(format!(
                "logical pages start at 1, got {}",
                page
            )));
        }
        let operation = format!("list {} page {}", kind.plural(), page);
        let api_page = self.api_page(page);

        self.limiter.acquire().await;
        debug!("GET {} page={} limit={}", self.list_url(kind), api_page, page_size);
        let response = self
            .client
            .get(self.list_url(kind))
            .basic_auth(&self.api_key, Some(&self.api_secret))
            .header(reqwest::header::ACCEPT, "application/json")
            .query(&[("page", api_page), ("limit", page_size as i64)])
            .send()
            .await
            .map_err(|e| transport_error(&operation, e))?;

        let body = read_json(&operation, response).await?;
        parse_page(&operation, body)
    }
}

/// Accept `{count, results}` envelopes as well as bare arrays.
fn parse_page(operation: &str, body: Value) -> Result<SourcePage> {
    match body {
        Value::Array(records) => Ok(SourcePage {
            records,
            reported_total: None,
        }),
        Value::Object(mut map) => {
            let reported_total = map.get("count").and_then(Value::as_u64);
            let records = match map.remove("results") {
                Some(Value::Array(records)) => records,
                Some(Value::Null) | None => Vec::new(),
                Some(_) => {
                    return Err(MigrateError::Api {
                        operation: operation.to_string(),
                        status: 200,
                        message: "'results' is not an array".into(),
                    })
                }
            };
            Ok(SourcePage {
                records,
                reported_total,
            })
        }
        Value::Null => Ok(SourcePage::default()),
        _ => Err(MigrateError::Api {
            operation: operation.to_string(),
            status: 200,
            message: "unexpected list response shape".into(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn client(page_base: i64) -> RestSourceClient {
        let config = SourceConfig {
            base_url: "https://api.example.com/v1/".into(),
            api_key: "k".into(),
            api_secret: "s".into(),
            page_base,
            requests_per_second: 0.0,
        };
        RestSourceClient::new(&config, &RetryConfig::default()).unwrap()
    }

    #[test]
    fn test_api_page_mapping() {
        assert_eq!(client(0).api_page(1), 0);
        assert_eq!(client(0).api_page(119), 118);
        assert_eq!(client(1).api_page(1), 1);
    }

    #[test]
    fn test_list_url() {
        assert_eq!(
            client(0).list_url(EntityKind::Subscription),
            "https://api.example.com/v1/subscriptions/"
        );
    }

    #[test]
    fn test_parse_envelope_ignores_next() {
        let page = parse_page(
            "op",
            json!({"count": 612000, "results": [{"id": 1}, {"id": 2}], "next": null}),
        )
        .unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page.reported_total, Some(612000));
    }

    #[test]
    fn test_parse_empty_and_bare_array() {
        assert!(parse_page("op", json!({"count": 10, "results": []}))
            .unwrap()
            .is_empty());
        assert_eq!(parse_page("op", json!([{"id": 1}])).unwrap().len(), 1);
        assert!(parse_page("op", json!("nope")).is_err());
    }
}
