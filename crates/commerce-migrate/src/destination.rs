//! Destination platform adapter.
//!
//! [`DestinationApi`] is the write side of the migration: customers, orders
//! scoped to a customer, and per-subscription records stored as customer
//! metafields. [`RestDestinationClient`] implements it against a
//! Shopify-style Admin REST API.

use std::collections::HashSet;
use std::future::Future;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::config::{DestinationConfig, RetryConfig};
use crate::error::Result;
use crate::http::{build_client, created_id, read_json, read_json_page, transport_error};
use crate::model::{extract_id, DestinationId, SourceId};
use crate::ratelimit::RateLimiter;

/// Structured value attached to a destination entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metafield {
    pub namespace: String,
    pub key: String,
    #[serde(rename = "type")]
    pub value_type: String,
    /// Encoded value; JSON text for `json` metafields.
    pub value: String,
}

impl Metafield {
    /// A `json` metafield holding `value`.
    pub fn json(namespace: impl Into<String>, key: impl Into<String>, value: &Value) -> Self {
        Self {
            namespace: namespace.into(),
            key: key.into(),
            value_type: "json".to_string(),
            value: value.to_string(),
        }
    }

    /// Decode the stored JSON value.
    pub fn decode(&self) -> Result<Value> {
        Ok(serde_json::from_str(&self.value)?)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Address {
    pub first_name: String,
    pub last_name: String,
    pub company: String,
    pub address1: String,
    pub address2: String,
    pub city: String,
    pub province: String,
    pub country: String,
    pub zip: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CustomerRequest {
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    pub note: String,
    pub verified_email: bool,
    pub accepts_marketing: bool,
    #[serde(serialize_with = "join_tags")]
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<Address>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub metafields: Vec<Metafield>,
}

impl CustomerRequest {
    pub fn metafield(&self, namespace: &str, key: &str) -> Option<&Metafield> {
        self.metafields
            .iter()
            .find(|m| m.namespace == namespace && m.key == key)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LineItemProperty {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LineItem {
    pub title: String,
    pub quantity: i64,
    pub price: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sku: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vendor: Option<String>,
    pub requires_shipping: bool,
    pub taxable: bool,
    pub properties: Vec<LineItemProperty>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OrderRequest {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub email: String,
    pub line_items: Vec<LineItem>,
    pub financial_status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fulfillment_status: Option<String>,
    pub currency: String,
    pub total_price: String,
    pub subtotal_price: String,
    pub total_tax: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<String>,
    #[serde(serialize_with = "join_tags")]
    pub tags: Vec<String>,
    pub note: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shipping_address: Option<Address>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub billing_address: Option<Address>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub metafields: Vec<Metafield>,
}

/// A source subscription carried over as a customer metafield.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubscriptionRecordRequest {
    pub source_id: SourceId,
    pub metafield: Metafield,
}

fn join_tags<S: Serializer>(tags: &[String], serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(&tags.join(", "))
}

/// True when the comma-separated `tags` list contains `tag` exactly.
pub fn has_tag(tags: &str, tag: &str) -> bool {
    tags.split(',').any(|t| t.trim() == tag)
}

/// Write access to the destination platform.
#[async_trait]
pub trait DestinationApi: Send + Sync {
    async fn create_customer(&self, request: &CustomerRequest) -> Result<DestinationId>;

    async fn update_customer(&self, id: DestinationId, request: &CustomerRequest) -> Result<()>;

    /// Find a customer previously created with `external_ref` among its tags.
    async fn find_customer_by_ref(&self, external_ref: &str) -> Result<Option<DestinationId>>;

    async fn create_order(
        &self,
        customer_id: DestinationId,
        request: &OrderRequest,
    ) -> Result<DestinationId>;

    /// Find an order of `customer_id` tagged with `external_ref`.
    async fn find_order_by_ref(
        &self,
        customer_id: DestinationId,
        external_ref: &str,
    ) -> Result<Option<DestinationId>>;

    async fn create_subscription_record(
        &self,
        customer_id: DestinationId,
        request: &SubscriptionRecordRequest,
    ) -> Result<DestinationId>;

    /// Find the metafield `namespace.key` on `customer_id`.
    async fn find_subscription_record(
        &self,
        customer_id: DestinationId,
        namespace: &str,
        key: &str,
    ) -> Result<Option<DestinationId>>;

    async fn health_check(&self) -> Result<()>;
}

/// reqwest-based client for a Shopify-style Admin REST API.
pub struct RestDestinationClient {
    client: Client,
    base_url: String,
    access_token: String,
    limiter: RateLimiter,
}

impl RestDestinationClient {
    pub fn new(config: &DestinationConfig, retry: &RetryConfig) -> Result<Self> {
        Ok(Self {
            client: build_client(retry.request_timeout())?,
            base_url: config.admin_base_url(),
            access_token: config.access_token.clone(),
            limiter: RateLimiter::new(config.requests_per_second),
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.request_url(method, &format!("{}/{}", self.base_url, path))
    }

    /// Request an absolute URL, such as a pagination link.
    fn request_url(&self, method: Method, url: &str) -> RequestBuilder {
        self.client
            .request(method, url)
            .header("X-Shopify-Access-Token", &self.access_token)
            .header(reqwest::header::ACCEPT, "application/json")
    }

    async fn send(&self, operation: &str, builder: RequestBuilder) -> Result<Value> {
        self.limiter.acquire().await;
        let response = builder
            .send()
            .await
            .map_err(|e| transport_error(operation, e))?;
        read_json(operation, response).await
    }

    async fn send_page(
        &self,
        operation: &str,
        builder: RequestBuilder,
    ) -> Result<(Value, Option<String>)> {
        self.limiter.acquire().await;
        let response = builder
            .send()
            .await
            .map_err(|e| transport_error(operation, e))?;
        read_json_page(operation, response).await
    }
}

/// Walk a cursor-paginated listing until an entry of `body[list]` carries
/// `tag`.
///
/// `fetch` gets `None` for the first page and the previous page's next link
/// after that. A next link that was already visited ends the walk.
async fn scan_tagged<F, Fut>(list: &str, tag: &str, mut fetch: F) -> Result<Option<DestinationId>>
where
    F: FnMut(Option<String>) -> Fut,
    Fut: Future<Output = Result<(Value, Option<String>)>>,
{
    let mut visited = HashSet::new();
    let mut cursor = None;
    loop {
        let (body, next) = fetch(cursor.take()).await?;
        if let Some(id) = first_tagged(&body, list, tag) {
            return Ok(Some(id));
        }
        match next {
            Some(url) if visited.insert(url.clone()) => cursor = Some(url),
            Some(url) => {
                warn!("{} listing returned {} twice, stopping lookup", list, url);
                return Ok(None);
            }
            None => return Ok(None),
        }
    }
}

/// First entry of `body[list]` whose `tags` contain `tag`.
fn first_tagged(body: &Value, list: &str, tag: &str) -> Option<DestinationId> {
    body.get(list)?
        .as_array()?
        .iter()
        .find(|item| {
            item.get("tags")
                .and_then(Value::as_str)
                .map(|tags| has_tag(tags, tag))
                .unwrap_or(false)
        })
        .and_then(|item| extract_id(item, "id"))
}

#[async_trait]
impl DestinationApi for RestDestinationClient {
    async fn create_customer(&self, request: &CustomerRequest) -> Result<DestinationId> {
        let operation = "create customer";
        let customer = serde_json::to_value(request)?;
        let body = self
            .send(
                operation,
                self.request(Method::POST, "customers.json")
                    .json(&json!({ "customer": customer })),
            )
            .await?;
        let id = created_id(operation, &body, "customer")?;
        debug!("Created destination customer {}", id);
        Ok(id)
    }

    async fn update_customer(&self, id: DestinationId, request: &CustomerRequest) -> Result<()> {
        // Metafields are written once at creation; the Admin API rejects
        // duplicate namespace/key pairs on update.
        let mut payload = serde_json::to_value(request)?;
        if let Some(obj) = payload.as_object_mut() {
            obj.remove("metafields");
            obj.remove("addresses");
            obj.insert("id".into(), json!(id));
        }
        self.send(
            "update customer",
            self.request(Method::PUT, &format!("customers/{}.json", id))
                .json(&json!({ "customer": payload })),
        )
        .await?;
        Ok(())
    }

    async fn find_customer_by_ref(&self, external_ref: &str) -> Result<Option<DestinationId>> {
        let query = format!("tag:\"{}\"", external_ref);
        scan_tagged("customers", external_ref, |cursor| {
            let builder = match cursor {
                Some(url) => self.request_url(Method::GET, &url),
                None => self.request(Method::GET, "customers/search.json").query(&[
                    ("query", query.as_str()),
                    ("fields", "id,tags"),
                    ("limit", "250"),
                ]),
            };
            self.send_page("search customers", builder)
        })
        .await
    }

    async fn create_order(
        &self,
        customer_id: DestinationId,
        request: &OrderRequest,
    ) -> Result<DestinationId> {
        let operation = "create order";
        let mut order = serde_json::to_value(request)?;
        if let Some(obj) = order.as_object_mut() {
            obj.insert("customer".into(), json!({ "id": customer_id }));
            obj.insert("send_receipt".into(), json!(false));
            obj.insert("send_fulfillment_receipt".into(), json!(false));
            obj.insert("inventory_behaviour".into(), json!("bypass"));
        }
        let body = self
            .send(
                operation,
                self.request(Method::POST, "orders.json")
                    .json(&json!({ "order": order })),
            )
            .await?;
        created_id(operation, &body, "order")
    }

    async fn find_order_by_ref(
        &self,
        customer_id: DestinationId,
        external_ref: &str,
    ) -> Result<Option<DestinationId>> {
        let customer = customer_id.to_string();
        scan_tagged("orders", external_ref, |cursor| {
            let builder = match cursor {
                Some(url) => self.request_url(Method::GET, &url),
                None => self.request(Method::GET, "orders.json").query(&[
                    ("customer_id", customer.as_str()),
                    ("status", "any"),
                    ("fields", "id,tags"),
                    ("limit", "250"),
                ]),
            };
            self.send_page("list customer orders", builder)
        })
        .await
    }

    async fn create_subscription_record(
        &self,
        customer_id: DestinationId,
        request: &SubscriptionRecordRequest,
    ) -> Result<DestinationId> {
        let operation = "create subscription metafield";
        let metafield = serde_json::to_value(&request.metafield)?;
        let body = self
            .send(
                operation,
                self.request(
                    Method::POST,
                    &format!("customers/{}/metafields.json", customer_id),
                )
                .json(&json!({ "metafield": metafield })),
            )
            .await?;
        created_id(operation, &body, "metafield")
    }

    async fn find_subscription_record(
        &self,
        customer_id: DestinationId,
        namespace: &str,
        key: &str,
    ) -> Result<Option<DestinationId>> {
        let body = self
            .send(
                "list customer metafields",
                self.request(
                    Method::GET,
                    &format!("customers/{}/metafields.json", customer_id),
                )
                .query(&[("namespace", namespace), ("key", key)]),
            )
            .await?;
        Ok(body
            .get("metafields")
            .and_then(Value::as_array)
            .and_then(|items| {
                items.iter().find(|m| {
                    m.get("namespace").and_then(Value::as_str) == Some(namespace)
                        && m.get("key").and_then(Value::as_str) == Some(key)
                })
            })
            .and_then(|m| extract_id(m, "id")))
    }

    async fn health_check(&self) -> Result<()> {
        self.send("fetch shop", self.request(Method::GET, "shop.json"))
            .await
            .map(|_| ())
    }
}
