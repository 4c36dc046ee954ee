//! # Merge Store
//!
//! Keyed catalog of `ProductRecord`s fed by detail snapshots from concurrent
//! workers. A single coarse `RwLock` guards the record map, the derived
//! source statistics and the history journal, so every upsert is atomic with
//! respect to the others and to `snapshot_all`.
//!
//! History rules per record:
//! - the first observation seeds one price and one availability entry at `now`
//! - later observations append only when the value differs from the prior one
//! - inline tables from the payload are merged when their timestamp is new

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::clock::{Clock, SystemClock};
use crate::domain::{
    CatalogStats, CatalogView, DetailSnapshot, HistoryChange, HistoryRow, ItemId, ProductRecord, SourceStat,
};
use crate::domain::history::History;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("snapshot has an empty item id")]
    EmptyId,
}

/// Result of one upsert, for callers that need more than the record.
#[derive(Debug, Clone)]
pub struct UpsertOutcome {
    pub record: ProductRecord,
    pub created: bool,
    pub price_changed: bool,
    pub availability_changed: bool,
    /// Inline table entries that were new to the record.
    pub inline_entries_added: usize,
}

#[derive(Default)]
struct StoreState {
    records: HashMap<ItemId, ProductRecord>,
    stats: CatalogStats,
    version: u64,
    journal: Vec<HistoryRow>,
}

impl StoreState {
    fn journal_entry(&mut self, item_id: &ItemId, timestamp: chrono::DateTime<chrono::Utc>, change: HistoryChange) {
        self.journal.push(HistoryRow {
            version: self.version,
            item_id: item_id.clone(),
            timestamp,
            change,
        });
    }
}

pub struct MergeStore {
    state: RwLock<StoreState>,
    clock: Arc<dyn Clock>,
}

impl Default for MergeStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MergeStore {
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: RwLock::new(StoreState::default()),
            clock,
        }
    }

    /// Seeds the store from a persisted snapshot. Later duplicates win.
    /// Loaded history is treated as already persisted and is not journaled.
    pub async fn load(&self, records: Vec<ProductRecord>) -> usize {
        let mut state = self.state.write().await;
        for record in records {
            if record.id.is_empty() {
                continue;
            }
            state.records.insert(record.id.clone(), record);
        }
        state.stats = CatalogStats::compute(state.records.values());
        state.version += 1;
        info!(products = state.records.len(), "📂 Merge store seeded from persisted catalog");
        state.records.len()
    }

    pub async fn upsert(&self, snapshot: DetailSnapshot) -> Result<ProductRecord, StoreError> {
        self.upsert_detailed(snapshot).await.map(|outcome| outcome.record)
    }

    pub async fn upsert_detailed(&self, snapshot: DetailSnapshot) -> Result<UpsertOutcome, StoreError> {
        if snapshot.id.is_empty() {
            return Err(StoreError::EmptyId);
        }

        let mut state = self.state.write().await;
        let now = self.clock.now();
        state.version += 1;

        let DetailSnapshot {
            id,
            fields,
            inline_prices,
            inline_availability,
        } = snapshot;

        let mut rows = Vec::new();
        let (created, price_changed, availability_changed, mut record) = match state.records.remove(&id) {
            None => {
                rows.push((now, HistoryChange::Price(fields.price)));
                rows.push((now, HistoryChange::Availability(fields.availability.clone())));
                let record = ProductRecord {
                    id: id.clone(),
                    price_history: History::seeded(now, fields.price),
                    availability_history: History::seeded(now, fields.availability.clone()),
                    fields,
                    first_seen: now,
                    last_updated: now,
                };
                (true, false, false, record)
            }
            Some(mut record) => {
                let price_changed = price_differs(record.fields.price, fields.price);
                let availability_changed = record.fields.availability != fields.availability;
                if price_changed {
                    record.price_history.record(now, fields.price);
                    rows.push((now, HistoryChange::Price(fields.price)));
                }
                if availability_changed {
                    record.availability_history.record(now, fields.availability.clone());
                    rows.push((now, HistoryChange::Availability(fields.availability.clone())));
                }
                record.fields = fields;
                record.last_updated = now;
                (false, price_changed, availability_changed, record)
            }
        };

        let added_prices = record.price_history.merge_missing(inline_prices);
        let added_availability = record.availability_history.merge_missing(inline_availability);
        let inline_entries_added = added_prices.len() + added_availability.len();
        rows.extend(added_prices.into_iter().map(|e| (e.timestamp, HistoryChange::Price(e.value))));
        rows.extend(
            added_availability
                .into_iter()
                .map(|e| (e.timestamp, HistoryChange::Availability(e.value))),
        );

        for (timestamp, change) in rows {
            state.journal_entry(&id, timestamp, change);
        }
        state.records.insert(id.clone(), record.clone());
        state.stats = CatalogStats::compute(state.records.values());

        debug!(
            item_id = %id,
            created,
            price_changed,
            availability_changed,
            inline_entries_added,
            total = state.records.len(),
            "Merged detail snapshot"
        );

        Ok(UpsertOutcome {
            record,
            created,
            price_changed,
            availability_changed,
            inline_entries_added,
        })
    }

    /// Consistent copy of every record (oldest first) and the source stats.
    pub async fn snapshot_all(&self) -> (Vec<ProductRecord>, Vec<SourceStat>) {
        let state = self.state.read().await;
        (sorted_records(&state), state.stats.sources.clone())
    }

    /// Records, stats and the history rows newer than `since`, taken under one lock.
    pub async fn view_since(&self, since: u64) -> CatalogView {
        let state = self.state.read().await;
        CatalogView {
            version: state.version,
            products: sorted_records(&state),
            stats: state.stats.clone(),
            history: delta(&state.journal, since),
        }
    }

    pub async fn history_delta(&self, since: u64) -> Vec<HistoryRow> {
        let state = self.state.read().await;
        delta(&state.journal, since)
    }

    /// Drops journal rows up to and including `version` once a sink has them.
    pub async fn release_history(&self, version: u64) {
        let mut state = self.state.write().await;
        state.journal.retain(|row| row.version > version);
    }

    pub async fn version(&self) -> u64 {
        self.state.read().await.version
    }

    pub async fn stats(&self) -> CatalogStats {
        self.state.read().await.stats.clone()
    }

    pub async fn get(&self, id: &ItemId) -> Option<ProductRecord> {
        self.state.read().await.records.get(id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.records.is_empty()
    }
}

fn price_differs(previous: f64, current: f64) -> bool {
    (previous - current).abs() > f64::EPSILON
}

fn sorted_records(state: &StoreState) -> Vec<ProductRecord> {
    let mut records: Vec<ProductRecord> = state.records.values().cloned().collect();
    records.sort_by(|a, b| a.first_seen.cmp(&b.first_seen).then_with(|| a.id.cmp(&b.id)));
    records
}

fn delta(journal: &[HistoryRow], since: u64) -> Vec<HistoryRow> {
    // journal is appended in version order
    let start = journal.partition_point(|row| row.version <= since);
    journal[start..].to_vec()
}
