//! # Crawl Orchestrator
//!
//! Wires one producer, the frontier, the detail worker pool and the
//! periodic flusher for a single query, under one cancellation token.
//! Partial outcomes (retries exhausted, cancellation, sink failures) are
//! reported in `CrawlReport`, not returned as errors.

use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::endpoints::SiteEndpoints;
use super::flusher::PeriodicFlusher;
use super::frontier::{frontier, DEFAULT_FRONTIER_CAPACITY};
use super::producer::{FrontierProducer, ProduceReport, ProducerOptions};
use super::workers::{WorkerOptions, WorkerPool, WorkerPoolStats};
use crate::application::MergeStore;
use crate::domain::{CatalogStats, SearchQuery};
use crate::infrastructure::fetcher::{FetcherConfig, ResponseCorrelatedFetcher};
use crate::infrastructure::persistence::{PersistenceSink, SinkError};
use crate::infrastructure::render::RenderEngine;

#[derive(Error, Debug)]
pub enum CrawlError {
    #[error("Crawl task panicked: {0}")]
    TaskPanicked(String),
    #[error("Invalid crawl options: {0}")]
    InvalidOptions(String),
}

#[derive(Debug, Clone)]
pub struct CrawlOptions {
    pub producer: ProducerOptions,
    pub workers: WorkerOptions,
    pub fetcher: FetcherConfig,
    pub queue_capacity: usize,
    pub flush_interval: Duration,
    pub start_page: u32,
}

impl Default for CrawlOptions {
    fn default() -> Self {
        Self {
            producer: ProducerOptions::default(),
            workers: WorkerOptions::default(),
            fetcher: FetcherConfig::default(),
            queue_capacity: DEFAULT_FRONTIER_CAPACITY,
            flush_interval: Duration::from_secs(2),
            start_page: 1,
        }
    }
}

impl CrawlOptions {
    pub fn validate(&self) -> Result<(), CrawlError> {
        if self.workers.worker_count == 0 {
            return Err(CrawlError::InvalidOptions("worker_count must be at least 1".into()));
        }
        if self.queue_capacity == 0 {
            return Err(CrawlError::InvalidOptions("queue_capacity must be at least 1".into()));
        }
        if self.producer.max_attempts == 0 {
            return Err(CrawlError::InvalidOptions("max_attempts must be at least 1".into()));
        }
        if self.flush_interval.is_zero() {
            return Err(CrawlError::InvalidOptions("flush_interval must be positive".into()));
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct CrawlReport {
    pub run_id: Uuid,
    pub produce: ProduceReport,
    pub workers: WorkerPoolStats,
    pub stats: CatalogStats,
    /// Successful periodic flushes, the final one included.
    pub flushes: u64,
    pub flush_failures: u64,
    pub final_flush_error: Option<SinkError>,
    pub elapsed: Duration,
}

impl CrawlReport {
    /// True when listing ended early or the last flush did not land.
    #[must_use]
    pub fn is_partial(&self) -> bool {
        self.produce.completion.is_partial() || self.final_flush_error.is_some()
    }
}

pub struct CrawlOrchestrator {
    fetcher: Arc<ResponseCorrelatedFetcher>,
    endpoints: SiteEndpoints,
    store: Arc<MergeStore>,
    sink: Option<Arc<dyn PersistenceSink>>,
    options: CrawlOptions,
    cancel: CancellationToken,
}

impl CrawlOrchestrator {
    #[must_use]
    pub fn new(engine: Arc<dyn RenderEngine>, endpoints: SiteEndpoints, store: Arc<MergeStore>, options: CrawlOptions) -> Self {
        let fetcher = Arc::new(ResponseCorrelatedFetcher::with_config(engine, &options.fetcher));
        Self {
            fetcher,
            endpoints,
            store,
            sink: None,
            options,
            cancel: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn PersistenceSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Cancelling this token stops the producer, even one blocked on a full
    /// frontier; workers then follow their drain policy.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    #[must_use]
    pub fn store(&self) -> &Arc<MergeStore> {
        &self.store
    }

    #[must_use]
    pub fn fetcher(&self) -> &Arc<ResponseCorrelatedFetcher> {
        &self.fetcher
    }

    pub async fn run(&self, query: &SearchQuery) -> Result<CrawlReport, CrawlError> {
        self.options.validate()?;
        let started = Instant::now();
        let run_id = Uuid::new_v4();
        info!(
            %run_id,
            text = %query.free_text,
            category = %query.category,
            workers = self.options.workers.worker_count,
            start_page = self.options.start_page,
            "🚀 Starting crawl"
        );

        let (sender, frontier) = frontier(self.options.queue_capacity);

        let producer = FrontierProducer::new(
            Arc::clone(&self.fetcher),
            self.endpoints.clone(),
            self.options.producer.clone(),
            self.cancel.clone(),
        );
        let producer_query = query.clone();
        let start_page = self.options.start_page;
        let producer_handle =
            tokio::spawn(async move { producer.produce_into(&producer_query, sender, start_page).await });

        let pool = WorkerPool::new(
            Arc::clone(&self.fetcher),
            self.endpoints.clone(),
            Arc::clone(&self.store),
            self.options.workers.clone(),
            self.cancel.clone(),
        );
        let pool_handle = tokio::spawn({
            let frontier = Arc::clone(&frontier);
            async move { pool.run(frontier).await }
        });

        let flush_stop = CancellationToken::new();
        let flusher = self.sink.as_ref().map(|sink| {
            Arc::new(PeriodicFlusher::new(
                Arc::clone(&self.store),
                Arc::clone(sink),
                self.options.flush_interval,
            ))
        });
        let flusher_handle = flusher.as_ref().map(|flusher| {
            let flusher = Arc::clone(flusher);
            let stop = flush_stop.clone();
            tokio::spawn(async move { flusher.run(stop, 0).await })
        });

        let (produced, drained) = tokio::join!(producer_handle, pool_handle);

        flush_stop.cancel();
        let mut flushes = 0;
        let mut flush_failures = 0;
        let mut final_flush_error = None;
        if let Some(flusher) = flusher {
            let mut cursor = 0;
            if let Some(handle) = flusher_handle {
                match handle.await {
                    Ok(report) => {
                        flushes = report.flushes;
                        flush_failures = report.failures;
                        cursor = report.cursor;
                    }
                    Err(e) => error!(error = %e, "Periodic flusher task failed"),
                }
            }
            match flusher.flush_once(&mut cursor).await {
                Ok(()) => flushes += 1,
                Err(e) => {
                    warn!(error = %e, "⚠️ Final flush failed");
                    flush_failures += 1;
                    final_flush_error = Some(e);
                }
            }
        }

        let produce = produced.map_err(|e| CrawlError::TaskPanicked(format!("producer: {e}")))?;
        let workers = drained.map_err(|e| CrawlError::TaskPanicked(format!("worker pool: {e}")))?;
        let stats = self.store.stats().await;
        let elapsed = started.elapsed();

        info!(
            %run_id,
            found = produce.total_found,
            pages = produce.pages_fetched,
            completion = ?produce.completion,
            upserted = workers.upserted,
            dropped = workers.dropped.total(),
            products = stats.total_products,
            flushes,
            elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            "🏁 Crawl finished"
        );

        Ok(CrawlReport {
            run_id,
            produce,
            workers,
            stats,
            flushes,
            flush_failures,
            final_flush_error,
            elapsed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawling::endpoints::DEFAULT_BASE_URL;
    use crate::crawling::producer::Completion;
    use crate::crawling::workers::DrainPolicy;
    use crate::domain::{EndReason, ItemId};
    use crate::infrastructure::persistence::JsonFileSink;
    use crate::infrastructure::scripted_engine::{ScriptedNavigation, ScriptedRenderEngine};
    use serde_json::json;
    use tempfile::tempdir;

    fn fast_options() -> CrawlOptions {
        CrawlOptions {
            producer: ProducerOptions {
                fetch_timeout: Duration::from_millis(500),
                max_attempts: 2,
                retry_backoff: Duration::from_millis(10),
                max_pages: None,
            },
            workers: WorkerOptions {
                worker_count: 3,
                fetch_timeout: Duration::from_millis(500),
                poll_interval: Duration::from_millis(20),
                ..WorkerOptions::default()
            },
            flush_interval: Duration::from_millis(50),
            ..CrawlOptions::default()
        }
    }

    fn script_catalog(engine: &ScriptedRenderEngine, endpoints: &SiteEndpoints, query: &SearchQuery, ids: &[&str]) {
        let items: Vec<_> = ids.iter().map(|id| json!({ "uniqueID": id })).collect();
        engine.script(
            endpoints.listing_url(query, 1),
            ScriptedNavigation::respond(
                endpoints.listing_resource(query, 1),
                json!({ "status": "SUCCESS", "response": items }).to_string(),
            ),
        );
        for (i, id) in ids.iter().enumerate() {
            let id = ItemId::from(*id);
            let price = 10.0 + i as f64;
            engine.script(
                endpoints.detail_url(&id),
                ScriptedNavigation::respond(
                    endpoints.detail_resource(&id),
                    json!({ "response": [{
                        "uniqueID": id.as_str(),
                        "title": format!("Item {id}"),
                        "price": price,
                        "availability": "in_stock",
                        "source_name": "mytek"
                    }]})
                    .to_string(),
                ),
            );
        }
    }

    #[tokio::test]
    async fn crawl_merges_every_listed_item_and_flushes() {
        let dir = tempdir().unwrap();
        let engine = ScriptedRenderEngine::new();
        let endpoints = SiteEndpoints::new(DEFAULT_BASE_URL).unwrap();
        let query = SearchQuery::new("laptop");
        script_catalog(&engine, &endpoints, &query, &["a", "b", "c"]);

        let store = Arc::new(MergeStore::new());
        let sink = Arc::new(JsonFileSink::new(dir.path().join("catalog.json")));
        let orchestrator = CrawlOrchestrator::new(Arc::new(engine.clone()), endpoints, store.clone(), fast_options())
            .with_sink(sink.clone());

        let report = orchestrator.run(&query).await.unwrap();

        assert_eq!(report.produce.total_found, 3);
        assert_eq!(report.produce.completion, Completion::EndOfResults { reason: EndReason::ShortPage });
        assert_eq!(report.workers.upserted, 3);
        assert_eq!(report.stats.total_products, 3);
        assert!(report.final_flush_error.is_none());
        assert!(!report.is_partial());
        assert_eq!(engine.open_contexts(), 0);

        let saved = sink.load().await.unwrap().unwrap();
        assert_eq!(saved.products.len(), 3);
        assert_eq!(saved.stats.sources[0].name, "mytek");
    }

    #[tokio::test]
    async fn zero_workers_is_rejected() {
        let engine = ScriptedRenderEngine::new();
        let endpoints = SiteEndpoints::new(DEFAULT_BASE_URL).unwrap();
        let mut options = fast_options();
        options.workers.worker_count = 0;
        let orchestrator = CrawlOrchestrator::new(Arc::new(engine), endpoints, Arc::new(MergeStore::new()), options);

        let result = orchestrator.run(&SearchQuery::new("x")).await;

        assert!(matches!(result, Err(CrawlError::InvalidOptions(_))));
    }

    #[tokio::test]
    async fn cancelled_crawl_reports_partial_completion() {
        let engine = ScriptedRenderEngine::new();
        let endpoints = SiteEndpoints::new(DEFAULT_BASE_URL).unwrap();
        let orchestrator =
            CrawlOrchestrator::new(Arc::new(engine.clone()), endpoints, Arc::new(MergeStore::new()), fast_options());
        orchestrator.cancellation_token().cancel();

        let report = orchestrator.run(&SearchQuery::new("x")).await.unwrap();

        assert!(matches!(report.produce.completion, Completion::Cancelled { page: 1 }));
        assert!(report.is_partial());
        assert_eq!(report.workers.items_processed, 0);
        assert_eq!(engine.open_contexts(), 0);
    }

    #[tokio::test]
    async fn hard_stop_cancel_with_a_full_frontier_finishes() {
        let engine = ScriptedRenderEngine::new();
        let endpoints = SiteEndpoints::new(DEFAULT_BASE_URL).unwrap();
        let query = SearchQuery::new("ecran");
        let items: Vec<_> = (0..24).map(|i| json!({ "uniqueID": format!("s{i}") })).collect();
        // detail pages are left unscripted and never answer
        engine.script(
            endpoints.listing_url(&query, 1),
            ScriptedNavigation::respond(
                endpoints.listing_resource(&query, 1),
                json!({ "status": "SUCCESS", "response": items }).to_string(),
            ),
        );

        let mut options = fast_options();
        options.workers.worker_count = 1;
        options.workers.fetch_timeout = Duration::from_secs(10);
        options.workers.drain_policy = DrainPolicy::HardStop;
        options.queue_capacity = 2;
        let orchestrator =
            CrawlOrchestrator::new(Arc::new(engine.clone()), endpoints, Arc::new(MergeStore::new()), options);

        let cancel = orchestrator.cancellation_token();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            cancel.cancel();
        });
        let report = tokio::time::timeout(Duration::from_secs(3), orchestrator.run(&query))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(report.produce.completion, Completion::Cancelled { page: 1 });
        assert!(report.produce.total_found < 24);
        assert_eq!(report.workers.upserted, 0);
        assert_eq!(engine.open_contexts(), 0);
    }
}
