//! # Product Snapshots and Records
//!
//! `DetailSnapshot` is one observation of a product detail payload, typed
//! and defaulted at the fetch boundary. `ProductRecord` is what the catalog
//! keeps per product: the latest snapshot fields plus the price and
//! availability histories accumulated across observations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use super::history::{parse_timestamp, AvailabilityHistoryEntry, History, PriceHistoryEntry};
use super::query::ItemId;

pub const DEFAULT_CURRENCY: &str = "TND";
pub const DEFAULT_BRAND: &str = "na";
pub const DEFAULT_AVAILABILITY: &str = "unknown";
pub const FLAG_NO: &str = "no";
pub const FLAG_YES: &str = "yes";

/// Detail payload could not be turned into a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PayloadError {
    #[error("payload has no `response` field")]
    MissingResponse,
    #[error("payload `response` is empty")]
    EmptyResponse,
    #[error("payload `response` is not an array")]
    NotAnArray,
    #[error("payload item is not a JSON object")]
    NotAnObject,
    #[error("payload carries no usable product id")]
    MissingId,
}

/// Promotional fields as published by the aggregator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Promotion {
    pub price_drop: f64,
    pub price_drop_percent: f64,
    pub price_week_changed: String,
    pub price_week_drop: f64,
    pub price_week_drop_percent: f64,
    pub price_deal: String,
    pub price_hot_deal: String,
    pub price_top_deal: String,
}

impl Default for Promotion {
    fn default() -> Self {
        Self {
            price_drop: 0.0,
            price_drop_percent: 0.0,
            price_week_changed: FLAG_NO.to_string(),
            price_week_drop: 0.0,
            price_week_drop_percent: 0.0,
            price_deal: FLAG_NO.to_string(),
            price_hot_deal: FLAG_NO.to_string(),
            price_top_deal: FLAG_NO.to_string(),
        }
    }
}

/// Current-value fields shared by snapshots and records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProductFields {
    pub title: String,
    pub store_label: String,
    pub category: String,
    pub subcategory: String,
    pub source_name: String,
    pub image: String,
    pub currency: String,
    pub price: f64,
    pub price_min: f64,
    pub price_max: f64,
    #[serde(flatten)]
    pub promotion: Promotion,
    pub link: String,
    pub source_link: String,
    pub brand: String,
    pub availability: String,
    pub clicks: u64,
    #[serde(rename = "clicksExternal")]
    pub clicks_external: u64,
    pub date_creation: String,
}

impl Default for ProductFields {
    fn default() -> Self {
        Self {
            title: String::new(),
            store_label: String::new(),
            category: String::new(),
            subcategory: String::new(),
            source_name: String::new(),
            image: String::new(),
            currency: DEFAULT_CURRENCY.to_string(),
            price: 0.0,
            price_min: 0.0,
            price_max: 0.0,
            promotion: Promotion::default(),
            link: String::new(),
            source_link: String::new(),
            brand: DEFAULT_BRAND.to_string(),
            availability: DEFAULT_AVAILABILITY.to_string(),
            clicks: 0,
            clicks_external: 0,
            date_creation: String::new(),
        }
    }
}

impl ProductFields {
    fn from_object(item: &Map<String, Value>) -> Self {
        let defaults = Self::default();
        Self {
            title: text(item, "title", &defaults.title),
            store_label: text(item, "store_label", &defaults.store_label),
            category: text(item, "category", &defaults.category),
            subcategory: text(item, "subcategory", &defaults.subcategory),
            source_name: text(item, "source_name", &defaults.source_name),
            image: text(item, "image", &defaults.image),
            currency: text(item, "currency", &defaults.currency),
            price: number(item, "price"),
            price_min: number(item, "price_min"),
            price_max: number(item, "price_max"),
            promotion: Promotion {
                price_drop: number(item, "price_drop"),
                price_drop_percent: number(item, "price_drop_percent"),
                price_week_changed: flag(item, "price_week_changed"),
                price_week_drop: number(item, "price_week_drop"),
                price_week_drop_percent: number(item, "price_week_drop_percent"),
                price_deal: flag(item, "price_deal"),
                price_hot_deal: flag(item, "price_hot_deal"),
                price_top_deal: flag(item, "price_top_deal"),
            },
            link: text(item, "link", &defaults.link),
            source_link: text(item, "source_link", &defaults.source_link),
            brand: text(item, "brand", &defaults.brand),
            availability: text(item, "availability", &defaults.availability),
            clicks: counter(item, "clicks"),
            clicks_external: counter(item, "clicksExternal"),
            date_creation: text(item, "date_creation", &defaults.date_creation),
        }
    }
}

/// One observation of a product's detail page.
#[derive(Debug, Clone, PartialEq)]
pub struct DetailSnapshot {
    pub id: ItemId,
    pub fields: ProductFields,
    pub inline_prices: Vec<PriceHistoryEntry>,
    pub inline_availability: Vec<AvailabilityHistoryEntry>,
}

impl DetailSnapshot {
    /// Builds a snapshot from a full detail response (`{"response": [item, ..]}`).
    ///
    /// Only the first element of `response` is used. A `response` holding a
    /// bare object is accepted as well.
    pub fn from_payload(requested: &ItemId, payload: &Value) -> Result<Self, PayloadError> {
        let response = payload.get("response").ok_or(PayloadError::MissingResponse)?;
        let item = match response {
            Value::Array(items) => items.first().ok_or(PayloadError::EmptyResponse)?,
            Value::Null => return Err(PayloadError::EmptyResponse),
            other => other,
        };
        Self::from_item(requested, item)
    }

    /// Builds a snapshot from a single product object, applying the field defaults.
    pub fn from_item(requested: &ItemId, item: &Value) -> Result<Self, PayloadError> {
        let object = item.as_object().ok_or(PayloadError::NotAnObject)?;
        if object.is_empty() {
            return Err(PayloadError::EmptyResponse);
        }

        let id = match object.get("uniqueID") {
            Some(Value::String(id)) if !id.trim().is_empty() => ItemId::new(id.trim()),
            Some(Value::Number(id)) => ItemId::new(id.to_string()),
            _ => requested.clone(),
        };
        if id.is_empty() {
            return Err(PayloadError::MissingId);
        }

        Ok(Self {
            id,
            fields: ProductFields::from_object(object),
            inline_prices: table(object, "priceTable", &["date_price", "date"], &["price", "value"], as_number),
            inline_availability: table(
                object,
                "availabilityTable",
                &["date_availability", "date"],
                &["availability", "value"],
                |v| v.as_str().filter(|s| !s.is_empty()).map(str::to_string),
            ),
        })
    }

    /// Convenience constructor used by the merge store tests and benches.
    #[must_use]
    pub fn new(id: impl Into<ItemId>, price: f64, availability: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fields: ProductFields {
                price,
                availability: availability.into(),
                ..ProductFields::default()
            },
            inline_prices: Vec::new(),
            inline_availability: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_source(mut self, source_name: impl Into<String>) -> Self {
        self.fields.source_name = source_name.into();
        self
    }

    #[must_use]
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.fields.title = title.into();
        self
    }
}

/// Persisted catalog entry for one product.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductRecord {
    #[serde(rename = "uniqueID")]
    pub id: ItemId,
    #[serde(flatten)]
    pub fields: ProductFields,
    #[serde(rename = "priceHistory", default)]
    pub price_history: History<f64>,
    #[serde(rename = "availabilityHistory", default)]
    pub availability_history: History<String>,
    #[serde(rename = "firstSeen")]
    pub first_seen: DateTime<Utc>,
    #[serde(rename = "lastUpdated")]
    pub last_updated: DateTime<Utc>,
}

impl ProductRecord {
    #[must_use]
    pub fn source_name(&self) -> &str {
        &self.fields.source_name
    }

    #[must_use]
    pub fn price(&self) -> f64 {
        self.fields.price
    }

    #[must_use]
    pub fn availability(&self) -> &str {
        &self.fields.availability
    }
}

fn text(item: &Map<String, Value>, key: &str, default: &str) -> String {
    match item.get(key) {
        Some(Value::String(value)) => value.clone(),
        Some(Value::Number(value)) => value.to_string(),
        Some(Value::Bool(value)) => value.to_string(),
        _ => default.to_string(),
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|n| n.is_finite()),
        _ => None,
    }
}

fn number(item: &Map<String, Value>, key: &str) -> f64 {
    item.get(key).and_then(as_number).unwrap_or(0.0)
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn counter(item: &Map<String, Value>, key: &str) -> u64 {
    match item.get(key) {
        Some(Value::Number(n)) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f > 0.0).map(|f| f as u64))
            .unwrap_or(0),
        Some(Value::String(s)) => s.trim().parse::<u64>().unwrap_or(0),
        _ => 0,
    }
}

fn flag(item: &Map<String, Value>, key: &str) -> String {
    match item.get(key) {
        Some(Value::String(value)) if !value.is_empty() => value.clone(),
        Some(Value::Bool(true)) => FLAG_YES.to_string(),
        _ => FLAG_NO.to_string(),
    }
}

fn table<T>(
    item: &Map<String, Value>,
    key: &str,
    date_keys: &[&str],
    value_keys: &[&str],
    convert: impl Fn(&Value) -> Option<T>,
) -> Vec<super::history::HistoryEntry<T>> {
    let Some(Value::Array(rows)) = item.get(key) else {
        return Vec::new();
    };
    rows.iter()
        .filter_map(|row| {
            let row = row.as_object()?;
            let timestamp = date_keys
                .iter()
                .find_map(|k| row.get(*k).and_then(Value::as_str))
                .and_then(parse_timestamp)?;
            let value = value_keys.iter().find_map(|k| row.get(*k).and_then(&convert))?;
            Some(super::history::HistoryEntry::new(timestamp, value))
        })
        .collect()
}
