//! # Detail Worker Pool
//!
//! N identical consumers drain the id frontier. Each one renders the
//! product page, waits for the matching detail response, types it into a
//! `DetailSnapshot` and merges it into the shared store. A failed item is
//! logged and dropped; it is never retried and never stops the pool.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::endpoints::{DetailMatcher, SiteEndpoints};
use super::frontier::{Frontier, Pop};
use crate::application::{MergeStore, StoreError, UpsertOutcome};
use crate::domain::{DetailSnapshot, ItemId, PayloadError};
use crate::infrastructure::fetcher::{FetchError, ResponseCorrelatedFetcher};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WorkerError {
    #[error("Configuration error: {0}")]
    ConfigurationError(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("Malformed detail payload: {0}")]
    Payload(#[from] PayloadError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What workers do once the crawl is cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DrainPolicy {
    /// Keep consuming until the frontier is empty; in-flight fetches complete.
    #[default]
    Drain,
    /// Abort in-flight fetches and exit at the next loop boundary.
    HardStop,
}

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub worker_count: usize,
    pub fetch_timeout: Duration,
    pub poll_interval: Duration,
    pub drain_policy: DrainPolicy,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            worker_count: 5,
            fetch_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(1),
            drain_policy: DrainPolicy::Drain,
        }
    }
}

/// Dropped items by reason.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DropCounts {
    pub fetch: u64,
    pub payload: u64,
    pub store: u64,
    pub cancelled: u64,
}

impl DropCounts {
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.fetch + self.payload + self.store + self.cancelled
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerPoolStats {
    pub worker_count: usize,
    pub items_processed: u64,
    /// Detail payloads received, whether or not they could be merged.
    pub fetched: u64,
    pub upserted: u64,
    /// Upserts that created a new record.
    pub created: u64,
    pub dropped: DropCounts,
    pub average_processing_time: Duration,
    pub last_item_completed: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Default, Clone)]
struct WorkerPoolMetrics {
    items_processed: u64,
    upserted: u64,
    created: u64,
    dropped: DropCounts,
    average_processing_time: Duration,
    last_item_completed: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Clone)]
pub struct WorkerPool {
    fetcher: Arc<ResponseCorrelatedFetcher>,
    endpoints: SiteEndpoints,
    store: Arc<MergeStore>,
    options: WorkerOptions,
    cancel: CancellationToken,
    metrics: Arc<RwLock<WorkerPoolMetrics>>,
}

impl WorkerPool {
    #[must_use]
    pub fn new(
        fetcher: Arc<ResponseCorrelatedFetcher>,
        endpoints: SiteEndpoints,
        store: Arc<MergeStore>,
        options: WorkerOptions,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            fetcher,
            endpoints,
            store,
            options,
            cancel,
            metrics: Arc::new(RwLock::new(WorkerPoolMetrics::default())),
        }
    }

    #[must_use]
    pub fn options(&self) -> &WorkerOptions {
        &self.options
    }

    /// Spawns `worker_count` consumers and waits until all of them exit.
    pub async fn run(&self, frontier: Arc<Frontier>) -> WorkerPoolStats {
        let worker_count = self.options.worker_count.max(1);
        info!(worker_count, policy = ?self.options.drain_policy, "👷 Starting detail workers");

        let mut workers = JoinSet::new();
        for worker_id in 0..worker_count {
            let pool = self.clone();
            let frontier = Arc::clone(&frontier);
            workers.spawn(async move { pool.consume(worker_id, &frontier).await });
        }
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Detail worker task failed");
            }
        }

        let stats = self.statistics().await;
        info!(
            processed = stats.items_processed,
            upserted = stats.upserted,
            created = stats.created,
            dropped = stats.dropped.total(),
            "🏁 Detail workers finished"
        );
        stats
    }

    /// Consumer loop of one worker. Returns the number of items it handled.
    pub async fn consume(&self, worker_id: usize, frontier: &Frontier) -> u64 {
        let mut handled = 0u64;
        loop {
            if self.cancel.is_cancelled() && self.options.drain_policy == DrainPolicy::HardStop {
                debug!(worker_id, "🛑 Worker stopping on cancellation");
                break;
            }
            let id = match frontier.pop(self.options.poll_interval).await {
                Pop::Item(id) => id,
                Pop::Empty => continue,
                Pop::Done => break,
            };

            let started = Instant::now();
            let result = self.process_item(&id).await;
            match &result {
                Ok(outcome) => debug!(
                    worker_id,
                    item_id = %id,
                    created = outcome.created,
                    price_changed = outcome.price_changed,
                    "✅ Detail merged"
                ),
                Err(WorkerError::Fetch(FetchError::Cancelled { .. })) => {
                    debug!(worker_id, item_id = %id, "Detail fetch cancelled");
                }
                Err(e) => warn!(worker_id, item_id = %id, error = %e, "Dropping item"),
            }
            self.update_metrics(started, &result).await;
            handled += 1;
        }
        debug!(worker_id, handled, "Worker exited");
        handled
    }

    /// Fetches, types and merges one item.
    pub async fn process_item(&self, id: &ItemId) -> Result<UpsertOutcome, WorkerError> {
        let url = self.endpoints.detail_url(id);
        let matcher = DetailMatcher::new(id);
        let payload = match self.options.drain_policy {
            DrainPolicy::HardStop => {
                self.fetcher
                    .fetch_with_cancellation(&url, &matcher, self.options.fetch_timeout, &self.cancel)
                    .await?
            }
            DrainPolicy::Drain => self.fetcher.fetch(&url, &matcher, self.options.fetch_timeout).await?,
        };
        let snapshot = DetailSnapshot::from_payload(id, &payload)?;
        Ok(self.store.upsert_detailed(snapshot).await?)
    }

    pub async fn statistics(&self) -> WorkerPoolStats {
        let metrics = self.metrics.read().await;
        WorkerPoolStats {
            worker_count: self.options.worker_count.max(1),
            items_processed: metrics.items_processed,
            fetched: metrics.upserted + metrics.dropped.payload + metrics.dropped.store,
            upserted: metrics.upserted,
            created: metrics.created,
            dropped: metrics.dropped,
            average_processing_time: metrics.average_processing_time,
            last_item_completed: metrics.last_item_completed,
        }
    }

    async fn update_metrics(&self, start_time: Instant, result: &Result<UpsertOutcome, WorkerError>) {
        let mut metrics = self.metrics.write().await;
        let duration = start_time.elapsed();

        metrics.items_processed += 1;
        match result {
            Ok(outcome) => {
                metrics.upserted += 1;
                if outcome.created {
                    metrics.created += 1;
                }
            }
            Err(WorkerError::Fetch(FetchError::Cancelled { .. })) => metrics.dropped.cancelled += 1,
            Err(WorkerError::Fetch(_) | WorkerError::ConfigurationError(_)) => metrics.dropped.fetch += 1,
            Err(WorkerError::Payload(_)) => metrics.dropped.payload += 1,
            Err(WorkerError::Store(_)) => metrics.dropped.store += 1,
        }

        // running mean
        let count = u32::try_from(metrics.items_processed).unwrap_or(u32::MAX);
        if count <= 1 {
            metrics.average_processing_time = duration;
        } else {
            let total_time = metrics.average_processing_time * (count - 1) + duration;
            metrics.average_processing_time = total_time / count;
        }
        metrics.last_item_completed = Some(chrono::Utc::now());
    }
}

/// Builder for `WorkerPool`
pub struct WorkerPoolBuilder {
    fetcher: Option<Arc<ResponseCorrelatedFetcher>>,
    endpoints: Option<SiteEndpoints>,
    store: Option<Arc<MergeStore>>,
    options: WorkerOptions,
    cancel: CancellationToken,
}

impl WorkerPoolBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            fetcher: None,
            endpoints: None,
            store: None,
            options: WorkerOptions::default(),
            cancel: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn with_fetcher(mut self, fetcher: Arc<ResponseCorrelatedFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    #[must_use]
    pub fn with_endpoints(mut self, endpoints: SiteEndpoints) -> Self {
        self.endpoints = Some(endpoints);
        self
    }

    #[must_use]
    pub fn with_store(mut self, store: Arc<MergeStore>) -> Self {
        self.store = Some(store);
        self
    }

    #[must_use]
    pub fn with_options(mut self, options: WorkerOptions) -> Self {
        self.options = options;
        self
    }

    #[must_use]
    pub fn with_worker_count(mut self, worker_count: usize) -> Self {
        self.options.worker_count = worker_count;
        self
    }

    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn build(self) -> Result<WorkerPool, WorkerError> {
        let fetcher = self
            .fetcher
            .ok_or_else(|| WorkerError::ConfigurationError("fetcher not configured".to_string()))?;
        let endpoints = self
            .endpoints
            .ok_or_else(|| WorkerError::ConfigurationError("site endpoints not configured".to_string()))?;
        let store = self
            .store
            .ok_or_else(|| WorkerError::ConfigurationError("merge store not configured".to_string()))?;
        if self.options.worker_count == 0 {
            return Err(WorkerError::ConfigurationError("worker_count must be at least 1".to_string()));
        }

        Ok(WorkerPool::new(fetcher, endpoints, store, self.options, self.cancel))
    }
}

impl Default for WorkerPoolBuilder {
    fn default() -> Self {
        Self::new()
    }
}
