//! # Catalog Aggregates
//!
//! Source statistics derived from the record set, the persisted snapshot
//! shape, and the view handed to persistence sinks on every flush.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::product::ProductRecord;
use super::query::ItemId;

/// Bucket for records whose source name is empty.
pub const UNKNOWN_SOURCE: &str = "unknown";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceStat {
    pub name: String,
    pub products: usize,
    pub percentage: f64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CatalogStats {
    pub total_products: usize,
    pub total_sources: usize,
    pub sources: Vec<SourceStat>,
}

impl CatalogStats {
    /// Full recompute over the record set.
    ///
    /// Sources are ordered by product count (descending), then name.
    /// Percentages are rounded to two decimals.
    pub fn compute<'a, I>(records: I) -> Self
    where
        I: IntoIterator<Item = &'a ProductRecord>,
    {
        let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
        let mut total = 0usize;
        for record in records {
            let name = match record.source_name().trim() {
                "" => UNKNOWN_SOURCE,
                name => name,
            };
            *counts.entry(name).or_default() += 1;
            total += 1;
        }

        let mut sources: Vec<SourceStat> = counts
            .into_iter()
            .map(|(name, products)| SourceStat {
                name: name.to_string(),
                products,
                percentage: round2(products as f64 * 100.0 / total as f64),
            })
            .collect();
        sources.sort_by(|a, b| b.products.cmp(&a.products).then_with(|| a.name.cmp(&b.name)));

        Self {
            total_products: total,
            total_sources: sources.len(),
            sources,
        }
    }

    #[must_use]
    pub fn source(&self, name: &str) -> Option<&SourceStat> {
        self.sources.iter().find(|stat| stat.name == name)
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// On-disk catalog file: `{ stats, products }`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CatalogSnapshot {
    pub stats: CatalogStats,
    pub products: Vec<ProductRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum HistoryChange {
    Price(f64),
    Availability(String),
}

/// One history entry added to the store, tagged with the store version
/// that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRow {
    pub version: u64,
    pub item_id: ItemId,
    pub timestamp: DateTime<Utc>,
    pub change: HistoryChange,
}

/// Everything a sink needs for one flush.
#[derive(Debug, Clone, Default)]
pub struct CatalogView {
    /// Store version the view was taken at.
    pub version: u64,
    pub products: Vec<ProductRecord>,
    pub stats: CatalogStats,
    /// History rows added after the flusher's last acknowledged version.
    pub history: Vec<HistoryRow>,
}
