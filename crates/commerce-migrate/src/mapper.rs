//! Payload mapping from staged source records to destination requests.
//!
//! Every entity created on the destination carries two tags: the provenance
//! tag shared by all migrated entities, and an external reference tag
//! `{provenance}:{kind}:{source_id}` that lets a re-run find an entity whose
//! identity link was never written.

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde_json::{json, Value};

use crate::config::MigrationConfig;
use crate::destination::{
    Address, CustomerRequest, LineItem, LineItemProperty, Metafield, OrderRequest,
    SubscriptionRecordRequest,
};
use crate::error::{MigrateError, Result};
use crate::model::{extract_id, EntityKind, SourceId, StagedRecord};

/// Source datetime layouts, tried in order after RFC 3339.
const DATETIME_FORMATS: [&str; 3] = [
    "%Y-%m-%dT%H:%M:%S%.fZ",
    "%Y-%m-%dT%H:%M:%SZ",
    "%Y-%m-%d %H:%M:%S",
];

/// Tagging and metafield naming applied to every mapped request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapperSettings {
    pub provenance_tag: String,
    pub metafield_namespace: String,
    pub metafield_key: String,
}

impl Default for MapperSettings {
    fn default() -> Self {
        Self::from_config(&MigrationConfig::default())
    }
}

impl MapperSettings {
    pub fn from_config(config: &MigrationConfig) -> Self {
        Self {
            provenance_tag: config.provenance_tag.trim().to_string(),
            metafield_namespace: config.metafield_namespace.clone(),
            metafield_key: config.metafield_key.clone(),
        }
    }

    /// Reconciliation key for a source record.
    pub fn external_ref(&self, kind: EntityKind, source_id: SourceId) -> String {
        format!("{}:{}:{}", self.provenance_tag, kind, source_id)
    }

    /// Metafield key holding one migrated subscription.
    pub fn subscription_key(&self, source_id: SourceId) -> String {
        format!("subscription_{}", source_id)
    }
}

/// Build the customer create/update request.
///
/// `subscriptions` are the staged subscription rows owned by the customer;
/// they are merged with any subscriptions embedded in the customer payload.
pub fn map_customer(
    record: &StagedRecord,
    subscriptions: &[StagedRecord],
    settings: &MapperSettings,
) -> Result<CustomerRequest> {
    let payload = &record.payload;
    let email = str_field(payload, "email").unwrap_or_default();
    let (first_name, last_name) = customer_names(payload);
    let phone = clean_phone(str_field(payload, "phone").as_deref());

    if email.is_empty() && phone.is_none() && first_name.is_empty() && last_name.is_empty() {
        return Err(MigrateError::invalid_payload(
            EntityKind::Customer,
            format!(
                "customer {} has no email, phone or name",
                record.source_id
            ),
        ));
    }

    let mut addresses = Vec::new();
    let shipping = extract_address(payload, "shipping");
    let billing = extract_address(payload, "billing");
    if let Some(addr) = shipping.clone() {
        addresses.push(addr);
    }
    if let Some(addr) = billing {
        if shipping.as_ref() != Some(&addr) {
            addresses.push(addr);
        }
    }

    let mut metafields = Vec::new();
    if let Some(history) = subscription_history(record, subscriptions) {
        metafields.push(Metafield::json(
            &settings.metafield_namespace,
            &settings.metafield_key,
            &history,
        ));
    }

    Ok(CustomerRequest {
        email,
        first_name,
        last_name,
        phone,
        note: format!("Imported from source. Original ID: {}", record.source_id),
        verified_email: true,
        accepts_marketing: truthy(payload.get("marketing_opt_in")),
        tags: vec![
            settings.provenance_tag.clone(),
            settings.external_ref(EntityKind::Customer, record.source_id),
        ],
        addresses,
        metafields,
    })
}

/// Structured subscription history for a customer, or `None` when empty.
///
/// Entries are the raw subscription objects, deduplicated by `id` (staged
/// rows win over embedded copies) and sorted ascending by `id`.
pub fn subscription_history(record: &StagedRecord, staged: &[StagedRecord]) -> Option<Value> {
    let mut by_id: std::collections::BTreeMap<i64, Value> = std::collections::BTreeMap::new();
    let mut without_id = Vec::new();

    if let Some(Value::Array(embedded)) = record.payload.get("subscriptions") {
        for sub in embedded {
            match extract_id(sub, "id") {
                Some(id) => {
                    by_id.insert(id, sub.clone());
                }
                None => without_id.push(sub.clone()),
            }
        }
    }
    for sub in staged {
        by_id.insert(sub.source_id, sub.payload.clone());
    }

    if by_id.is_empty() && without_id.is_empty() {
        return None;
    }

    let subscriptions: Vec<Value> = by_id.into_values().chain(without_id).collect();
    Some(json!({
        "source_customer_id": record.source_id,
        "subscriptions": subscriptions,
    }))
}

/// Build the order create request. The owning customer is attached by the adapter.
pub fn map_order(record: &StagedRecord, settings: &MapperSettings) -> Result<OrderRequest> {
    let payload = &record.payload;
    if !payload.is_object() {
        return Err(MigrateError::invalid_payload(
            EntityKind::Order,
            format!("order {} payload is not an object", record.source_id),
        ));
    }

    let line_items = payload
        .get("items")
        .and_then(Value::as_array)
        .map(|items| items.iter().map(map_line_item).collect())
        .unwrap_or_default();

    let mut tags = vec![
        settings.provenance_tag.clone(),
        settings.external_ref(EntityKind::Order, record.source_id),
    ];
    if payload.get("subscription_id").map_or(false, |v| !v.is_null()) {
        tags.push(format!("{}-subscription", settings.provenance_tag));
    }

    let currency = str_field(payload, "currency").unwrap_or_else(|| "USD".to_string());

    Ok(OrderRequest {
        email: str_field(payload, "customer_email")
            .or_else(|| str_field(payload, "email"))
            .unwrap_or_default(),
        line_items,
        financial_status: map_financial_status(str_field(payload, "status").as_deref()),
        fulfillment_status: map_fulfillment_status(
            str_field(payload, "fulfillment_status").as_deref(),
        ),
        currency,
        total_price: money(payload.get("total")),
        subtotal_price: money(payload.get("subtotal")),
        total_tax: money(payload.get("tax")),
        processed_at: convert_datetime(str_field(payload, "date_created").as_deref()),
        tags,
        note: format!("Imported from source. Original order ID: {}", record.source_id),
        shipping_address: extract_address(payload, "shipping"),
        billing_address: extract_address(payload, "billing"),
        metafields: vec![Metafield {
            namespace: settings.metafield_namespace.clone(),
            key: "source_order_id".to_string(),
            value_type: "single_line_text_field".to_string(),
            value: record.source_id.to_string(),
        }],
    })
}

/// Build the per-subscription metafield record.
pub fn map_subscription_record(
    record: &StagedRecord,
    settings: &MapperSettings,
) -> Result<SubscriptionRecordRequest> {
    let payload = &record.payload;
    if !payload.is_object() {
        return Err(MigrateError::invalid_payload(
            EntityKind::Subscription,
            format!("subscription {} payload is not an object", record.source_id),
        ));
    }

    let products: Vec<Value> = payload
        .get("items")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .map(|item| {
                    json!({
                        "source_product_id": item.get("product_id").cloned().unwrap_or(Value::Null),
                        "product_name": str_field(item, "product_name")
                            .unwrap_or_else(|| "Unknown Product".to_string()),
                        "sku": str_field(item, "sku").unwrap_or_default(),
                        "quantity": quantity(item.get("quantity")),
                        "price": money(item.get("price")),
                        "vendor": str_field(item, "vendor").unwrap_or_default(),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    let date = |field: &str| convert_datetime(str_field(payload, field).as_deref());
    let value = json!({
        "source_subscription_id": record.source_id,
        "status": str_field(payload, "status").unwrap_or_else(|| "unknown".to_string()),
        "frequency": str_field(payload, "frequency").unwrap_or_else(|| "unknown".to_string()),
        "created_at": date("date_created"),
        "updated_at": date("date_updated"),
        "next_billing_date": date("next_billing_date"),
        "cancelled_at": date("cancelled_at"),
        "paused_at": date("paused_at"),
        "total_value": money(payload.get("total")),
        "currency": str_field(payload, "currency").unwrap_or_else(|| "USD".to_string()),
        "billing_cycles_completed": payload
            .get("billing_cycles_completed")
            .and_then(Value::as_i64)
            .unwrap_or(0),
        "products": products,
    });

    Ok(SubscriptionRecordRequest {
        source_id: record.source_id,
        metafield: Metafield::json(
            &settings.metafield_namespace,
            settings.subscription_key(record.source_id),
            &value,
        ),
    })
}

/// Whether a customer shows any commercial activity worth migrating.
pub fn is_active_customer(record: &StagedRecord, has_orders: bool, has_subscriptions: bool) -> bool {
    if has_orders || has_subscriptions {
        return true;
    }
    let payload = &record.payload;
    if matches!(payload.get("subscriptions"), Some(Value::Array(a)) if !a.is_empty()) {
        return true;
    }
    if let Some(status) = str_field(payload, "subscription_status") {
        if !status.is_empty() && status != "none" {
            return true;
        }
    }
    number(payload.get("total_revenue")).map_or(false, |r| r > 0.0)
}

fn map_line_item(item: &Value) -> LineItem {
    let mut properties = vec![LineItemProperty {
        name: "Source Product ID".to_string(),
        value: item
            .get("product_id")
            .map(value_text)
            .unwrap_or_default(),
    }];
    let sku = str_field(item, "sku")
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());
    if let Some(sku) = &sku {
        properties.push(LineItemProperty {
            name: "Source SKU".to_string(),
            value: sku.clone(),
        });
    }

    LineItem {
        title: str_field(item, "product_name").unwrap_or_else(|| "Unknown Product".to_string()),
        quantity: quantity(item.get("quantity")),
        price: money(item.get("price")),
        sku,
        vendor: str_field(item, "vendor").filter(|v| !v.is_empty()),
        requires_shipping: true,
        taxable: true,
        properties,
    }
}

fn customer_names(payload: &Value) -> (String, String) {
    let first = str_field(payload, "first_name").unwrap_or_default();
    let last = str_field(payload, "last_name").unwrap_or_default();
    if !first.is_empty() || !last.is_empty() {
        return (first, last);
    }
    match str_field(payload, "name") {
        Some(name) => {
            let name = clean_text(&name).unwrap_or_default();
            match name.split_once(' ') {
                Some((first, rest)) => (first.to_string(), rest.trim().to_string()),
                None => (name, String::new()),
            }
        }
        None => (String::new(), String::new()),
    }
}

/// Pull a `{kind}_address` object (falling back to `address`) into a
/// destination address. Requires at least `line1` and `city`.
pub fn extract_address(payload: &Value, kind: &str) -> Option<Address> {
    let data = payload
        .get(format!("{}_address", kind))
        .filter(|v| v.is_object())
        .or_else(|| payload.get("address").filter(|v| v.is_object()))?;

    let field = |name: &str| str_field(data, name).unwrap_or_default();
    let address = Address {
        first_name: field("first_name"),
        last_name: field("last_name"),
        company: field("company"),
        address1: field("line1"),
        address2: field("line2"),
        city: field("city"),
        province: field("state"),
        country: field("country"),
        zip: field("postal_code"),
        phone: clean_phone(str_field(data, "phone").as_deref()),
    };

    if address.address1.trim().is_empty() || address.city.trim().is_empty() {
        return None;
    }
    Some(address)
}

/// Normalise a phone number for the destination.
///
/// US/Canada numbers become `+1XXXXXXXXXX`, longer international numbers
/// keep their digits behind a `+`, anything shorter is dropped.
pub fn clean_phone(raw: Option<&str>) -> Option<String> {
    let raw = raw?.trim();
    if raw.is_empty() {
        return None;
    }

    let kept: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || matches!(c, '+' | ' ' | '-' | '(' | ')' | '.' | 'x' | 'X'))
        .collect();
    let without_ext = strip_extension(&kept);

    let digits: String = without_ext
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '+')
        .collect();
    if !digits.chars().any(|c| c.is_ascii_digit()) {
        return None;
    }

    let national = if let Some(rest) = digits.strip_prefix("+1") {
        rest.to_string()
    } else if digits.starts_with('1') && digits.len() == 11 {
        digits[1..].to_string()
    } else {
        digits.clone()
    };

    if national.len() == 10 && national.chars().all(|c| c.is_ascii_digit()) {
        Some(format!("+1{}", national))
    } else if national.len() > 10 {
        if digits.starts_with('+') {
            Some(digits)
        } else {
            Some(format!("+{}", digits))
        }
    } else {
        None
    }
}

/// Drop a trailing `x123` extension.
fn strip_extension(phone: &str) -> &str {
    if let Some(idx) = phone.rfind(|c| c == 'x' || c == 'X') {
        let tail = &phone[idx + 1..];
        if !tail.is_empty() && tail.chars().all(|c| c.is_ascii_digit()) {
            return &phone[..idx];
        }
    }
    phone
}

/// Strip HTML tags and common entities, collapse whitespace.
pub fn clean_text(text: &str) -> Option<String> {
    let mut out = String::with_capacity(text.len());
    let mut in_tag = false;
    for c in text.chars() {
        match c {
            '<' => in_tag = true,
            '>' if in_tag => in_tag = false,
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }
    let out = out
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'");
    let collapsed = out.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

/// Normalise a source timestamp to RFC 3339 UTC; unknown layouts yield `None`.
pub fn convert_datetime(raw: Option<&str>) -> Option<String> {
    let raw = raw?.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(
            dt.with_timezone(&Utc)
                .to_rfc3339_opts(SecondsFormat::Secs, true),
        );
    }
    DATETIME_FORMATS.iter().find_map(|fmt| {
        NaiveDateTime::parse_from_str(raw, fmt)
            .ok()
            .map(|naive| naive.and_utc().to_rfc3339_opts(SecondsFormat::Secs, true))
    })
}

pub fn map_financial_status(status: Option<&str>) -> String {
    match status.map(|s| s.to_lowercase()).as_deref() {
        Some("paid") | Some("completed") => "paid",
        Some("cancelled") => "voided",
        Some("refunded") => "refunded",
        Some("partially_refunded") => "partially_refunded",
        _ => "pending",
    }
    .to_string()
}

pub fn map_fulfillment_status(status: Option<&str>) -> Option<String> {
    match status?.to_lowercase().as_str() {
        "shipped" | "fulfilled" => Some("fulfilled".to_string()),
        "delivered" => Some("fulfilled".to_string()),
        "partial" | "partially_fulfilled" => Some("partial".to_string()),
        _ => None,
    }
}

fn str_field(value: &Value, field: &str) -> Option<String> {
    match value.get(field)? {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn number(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn money(value: Option<&Value>) -> String {
    match value {
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
        _ => "0.00".to_string(),
    }
}

fn quantity(value: Option<&Value>) -> i64 {
    number(value).map(|q| q as i64).filter(|q| *q > 0).unwrap_or(1)
}

fn truthy(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_i64().map_or(false, |n| n != 0),
        Some(Value::String(s)) => matches!(s.to_lowercase().as_str(), "true" | "yes" | "1"),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn staged(kind: EntityKind, payload: Value) -> StagedRecord {
        StagedRecord::from_raw(kind, payload, Utc::now()).unwrap()
    }

    #[test]
    fn test_customer_with_embedded_subscription() {
        let settings = MapperSettings::default();
        let record = staged(
            EntityKind::Customer,
            json!({"id": 42, "name": "A. Smith", "subscriptions": [{"id": 9, "status": "active"}]}),
        );
        let req = map_customer(&record, &[], &settings).unwrap();

        assert_eq!(req.first_name, "A.");
        assert_eq!(req.last_name, "Smith");
        assert!(req.tags.contains(&"cj-import".to_string()));
        assert!(req.tags.contains(&"cj-import:customer:42".to_string()));

        let history = req
            .metafield("migration", "subscription_history")
            .unwrap()
            .decode()
            .unwrap();
        assert_eq!(
            history["subscriptions"],
            json!([{"id": 9, "status": "active"}])
        );
        assert_eq!(history["source_customer_id"], 42);
    }

    #[test]
    fn test_history_merges_staged_and_sorts() {
        let record = staged(
            EntityKind::Customer,
            json!({"id": 1, "email": "a@x.com", "subscriptions": [{"id": 20, "status": "old"}]}),
        );
        let subs = vec![
            staged(
                EntityKind::Subscription,
                json!({"id": 20, "customer_id": 1, "status": "cancelled"}),
            ),
            staged(
                EntityKind::Subscription,
                json!({"id": 5, "customer_id": 1, "status": "active"}),
            ),
        ];
        let history = subscription_history(&record, &subs).unwrap();
        let list = history["subscriptions"].as_array().unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0]["id"], 5);
        assert_eq!(list[1]["status"], "cancelled");
    }

    #[test]
    fn test_no_subscriptions_no_metafield() {
        let record = staged(EntityKind::Customer, json!({"id": 3, "email": "c@x.com"}));
        let req = map_customer(&record, &[], &MapperSettings::default()).unwrap();
        assert!(req.metafields.is_empty());
    }

    #[test]
    fn test_customer_without_identity_rejected() {
        let record = staged(EntityKind::Customer, json!({"id": 3}));
        let err = map_customer(&record, &[], &MapperSettings::default()).unwrap_err();
        assert!(matches!(err, MigrateError::InvalidPayload { .. }));
    }

    #[test]
    fn test_clean_phone() {
        assert_eq!(clean_phone(Some("(555) 123-4567")).as_deref(), Some("+15551234567"));
        assert_eq!(clean_phone(Some("1-555-123-4567")).as_deref(), Some("+15551234567"));
        assert_eq!(clean_phone(Some("+1 555 123 4567 x89")).as_deref(), Some("+15551234567"));
        assert_eq!(clean_phone(Some("+44 20 7946 0958")).as_deref(), Some("+442079460958"));
        assert_eq!(clean_phone(Some("12345")), None);
        assert_eq!(clean_phone(Some("n/a")), None);
        assert_eq!(clean_phone(None), None);
    }

    #[test]
    fn test_address_requires_line1_and_city() {
        let payload = json!({
            "shipping_address": {"line1": "1 Main St", "city": "Springfield", "state": "IL", "postal_code": "62701"},
            "billing_address": {"line1": "1 Main St"}
        });
        let shipping = extract_address(&payload, "shipping").unwrap();
        assert_eq!(shipping.zip, "62701");
        assert!(extract_address(&payload, "billing").is_none());
    }

    #[test]
    fn test_identical_billing_is_dropped() {
        let addr = json!({"line1": "1 Main St", "city": "Springfield"});
        let record = staged(
            EntityKind::Customer,
            json!({"id": 7, "email": "d@x.com", "shipping_address": addr, "billing_address": addr}),
        );
        let req = map_customer(&record, &[], &MapperSettings::default()).unwrap();
        assert_eq!(req.addresses.len(), 1);
    }

    #[test]
    fn test_convert_datetime_formats() {
        assert_eq!(
            convert_datetime(Some("2021-03-04T05:06:07.123Z")).as_deref(),
            Some("2021-03-04T05:06:07Z")
        );
        assert_eq!(
            convert_datetime(Some("2021-03-04 05:06:07")).as_deref(),
            Some("2021-03-04T05:06:07Z")
        );
        assert_eq!(
            convert_datetime(Some("2021-03-04T05:06:07-05:00")).as_deref(),
            Some("2021-03-04T10:06:07Z")
        );
        assert_eq!(convert_datetime(Some("last tuesday")), None);
    }

    #[test]
    fn test_order_mapping() {
        let settings = MapperSettings::default();
        let record = staged(
            EntityKind::Order,
            json!({
                "id": 1001,
                "customer_id": 42,
                "subscription_id": 9,
                "status": "Completed",
                "fulfillment_status": "shipped",
                "total": 19.99,
                "items": [{"product_name": "Box", "quantity": "2", "price": "9.99", "sku": " BOX-1 "}]
            }),
        );
        let req = map_order(&record, &settings).unwrap();
        assert_eq!(req.financial_status, "paid");
        assert_eq!(req.fulfillment_status.as_deref(), Some("fulfilled"));
        assert_eq!(req.total_price, "19.99");
        assert_eq!(req.currency, "USD");
        assert_eq!(req.line_items[0].quantity, 2);
        assert_eq!(req.line_items[0].sku.as_deref(), Some("BOX-1"));
        assert!(req.tags.contains(&"cj-import:order:1001".to_string()));
        assert!(req.tags.contains(&"cj-import-subscription".to_string()));
    }

    #[test]
    fn test_financial_status_map() {
        assert_eq!(map_financial_status(Some("cancelled")), "voided");
        assert_eq!(map_financial_status(Some("failed")), "pending");
        assert_eq!(map_financial_status(None), "pending");
    }

    #[test]
    fn test_subscription_record_key() {
        let settings = MapperSettings::default();
        let record = staged(
            EntityKind::Subscription,
            json!({"id": 9, "customer_id": 42, "status": "active", "frequency": "monthly"}),
        );
        let req = map_subscription_record(&record, &settings).unwrap();
        assert_eq!(req.metafield.key, "subscription_9");
        let value = req.metafield.decode().unwrap();
        assert_eq!(value["status"], "active");
        assert_eq!(value["source_subscription_id"], 9);
    }

    #[test]
    fn test_activity_filter() {
        let idle = staged(EntityKind::Customer, json!({"id": 1, "total_revenue": "0"}));
        assert!(!is_active_customer(&idle, false, false));
        assert!(is_active_customer(&idle, true, false));

        let paying = staged(EntityKind::Customer, json!({"id": 2, "total_revenue": 12.5}));
        assert!(is_active_customer(&paying, false, false));

        let subscribed = staged(
            EntityKind::Customer,
            json!({"id": 3, "subscription_status": "active"}),
        );
        assert!(is_active_customer(&subscribed, false, false));
    }

    #[test]
    fn test_clean_text() {
        assert_eq!(
            clean_text("<b>Jane</b>&nbsp; Doe ").as_deref(),
            Some("Jane Doe")
        );
        assert_eq!(clean_text("<br/>"), None);
    }
}
