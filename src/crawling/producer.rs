//! # Frontier Producer
//!
//! Walks the listing pages of one query through the response-correlated
//! fetcher and hands every discovered item id to a callback (normally the
//! frontier). Listing failures are retried with a fixed backoff; once the
//! retries are spent the crawl ends with whatever was found so far.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::endpoints::{ListingMatcher, SiteEndpoints};
use super::frontier::{FrontierError, FrontierSender};
use crate::domain::{EndReason, ItemId, ListingPage, SearchQuery};
use crate::infrastructure::fetcher::{FetchError, ResponseCorrelatedFetcher};

#[derive(Debug, Clone)]
pub struct ProducerOptions {
    pub fetch_timeout: Duration,
    /// Attempts per listing page, including the first.
    pub max_attempts: u32,
    pub retry_backoff: Duration,
    /// Stop after this many pages even if results continue.
    pub max_pages: Option<u32>,
}

impl Default for ProducerOptions {
    fn default() -> Self {
        Self {
            fetch_timeout: Duration::from_secs(30),
            max_attempts: 3,
            retry_backoff: Duration::from_secs(2),
            max_pages: None,
        }
    }
}

/// How a production run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    EndOfResults { reason: EndReason },
    RetriesExhausted { page: u32, last_error: FetchError },
    Cancelled { page: u32 },
    PageLimitReached { page: u32 },
    /// Every consumer went away; ids could no longer be delivered.
    FrontierClosed { page: u32 },
}

impl Completion {
    #[must_use]
    pub const fn is_partial(&self) -> bool {
        !matches!(self, Self::EndOfResults { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProduceReport {
    /// Ids handed to the callback.
    pub total_found: usize,
    pub pages_fetched: u32,
    /// Listing items that carried no id.
    pub skipped_items: usize,
    pub start_page: u32,
    pub completion: Completion,
}

pub struct FrontierProducer {
    fetcher: Arc<ResponseCorrelatedFetcher>,
    endpoints: SiteEndpoints,
    options: ProducerOptions,
    cancel: CancellationToken,
}

impl FrontierProducer {
    #[must_use]
    pub fn new(
        fetcher: Arc<ResponseCorrelatedFetcher>,
        endpoints: SiteEndpoints,
        options: ProducerOptions,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            fetcher,
            endpoints,
            options,
            cancel,
        }
    }

    /// Produces into a frontier and closes it when done.
    pub async fn produce_into(&self, query: &SearchQuery, sender: FrontierSender, start_page: u32) -> ProduceReport {
        let report = self.produce(query, |id| sender.push(id), start_page).await;
        sender.close();
        report
    }

    /// Walks listing pages from `start_page`, calling `on_id` for every id.
    ///
    /// Termination is checked in order: end-of-results status, empty page,
    /// short page. The ids of the terminating page are still delivered.
    pub async fn produce<F, Fut>(&self, query: &SearchQuery, mut on_id: F, start_page: u32) -> ProduceReport
    where
        F: FnMut(ItemId) -> Fut,
        Fut: Future<Output = Result<(), FrontierError>>,
    {
        let start_page = start_page.max(1);
        let mut page = start_page;
        let mut total_found = 0usize;
        let mut pages_fetched = 0u32;
        let mut skipped_items = 0usize;

        info!(query = ?query.free_text, start_page, "🚀 Starting listing crawl");

        let completion = 'pages: loop {
            if self.cancel.is_cancelled() {
                break Completion::Cancelled { page };
            }
            if self.options.max_pages.is_some_and(|max| pages_fetched >= max) {
                break Completion::PageLimitReached { page };
            }

            let listing = match self.fetch_page(query, page).await {
                Ok(listing) => listing,
                Err(FetchError::Cancelled { .. }) => break Completion::Cancelled { page },
                Err(last_error) => break Completion::RetriesExhausted { page, last_error },
            };
            pages_fetched += 1;
            skipped_items += listing.skipped;
            let end_reason = listing.end_reason(query.page_size);
            let found = listing.ids.len();

            for id in listing.ids {
                // a full frontier must not outlive cancellation
                let delivered = tokio::select! {
                    biased;
                    () = self.cancel.cancelled() => break 'pages Completion::Cancelled { page },
                    delivered = on_id(id) => delivered,
                };
                if delivered.is_err() {
                    break 'pages Completion::FrontierClosed { page };
                }
                total_found += 1;
            }
            debug!(page, found, total_found, skipped = listing.skipped, "📄 Listing page processed");

            if let Some(reason) = end_reason {
                break Completion::EndOfResults { reason };
            }
            page += 1;
        };

        if completion.is_partial() {
            warn!(?completion, total_found, pages_fetched, "⚠️ Listing crawl ended early");
        } else {
            info!(?completion, total_found, pages_fetched, "✅ Listing crawl complete");
        }

        ProduceReport {
            total_found,
            pages_fetched,
            skipped_items,
            start_page,
            completion,
        }
    }

    async fn fetch_page(&self, query: &SearchQuery, page: u32) -> Result<ListingPage, FetchError> {
        let url = self.endpoints.listing_url(query, page);
        let matcher = ListingMatcher::new(query, page);
        let max_attempts = self.options.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let result = self
                .fetcher
                .fetch_with_cancellation(&url, &matcher, self.options.fetch_timeout, &self.cancel)
                .await
                .and_then(|payload| {
                    ListingPage::from_response(&payload).map_err(|e| FetchError::Parse {
                        resource: url.clone(),
                        reason: e.to_string(),
                    })
                });

            match result {
                Ok(listing) => return Ok(listing),
                Err(error) if !error.is_retryable() || attempt >= max_attempts => {
                    if error.is_retryable() {
                        warn!(page, attempt, error = %error, "❌ Listing page failed after all attempts");
                    }
                    return Err(error);
                }
                Err(error) => {
                    warn!(
                        page,
                        attempt,
                        max_attempts,
                        error = %error,
                        "Listing fetch failed, retrying in {:?}",
                        self.options.retry_backoff
                    );
                    tokio::select! {
                        () = self.cancel.cancelled() => return Err(FetchError::Cancelled { url }),
                        () = tokio::time::sleep(self.options.retry_backoff) => {}
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawling::frontier::{frontier, Pop};
    use crate::infrastructure::scripted_engine::{ScriptedNavigation, ScriptedRenderEngine};
    use serde_json::json;

    const BASE: &str = "https://shop.test";

    struct Harness {
        engine: ScriptedRenderEngine,
        endpoints: SiteEndpoints,
        query: SearchQuery,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                engine: ScriptedRenderEngine::new(),
                endpoints: SiteEndpoints::new(BASE).unwrap(),
                query: SearchQuery::new("tv").with_category("electromenager"),
            }
        }

        fn page(&self, page: u32, count: usize) -> &Self {
            let ids: Vec<_> = (0..count).map(|i| json!({"uniqueID": format!("p{page}-{i}")})).collect();
            self.script(page, ScriptedNavigation::respond(
                self.endpoints.listing_resource(&self.query, page),
                json!({"status": {"code": "OK"}, "response": ids}).to_string(),
            ))
        }

        fn script(&self, page: u32, navigation: ScriptedNavigation) -> &Self {
            self.engine.script(self.endpoints.listing_url(&self.query, page), navigation);
            self
        }

        fn producer(&self, cancel: CancellationToken) -> FrontierProducer {
            let fetcher = Arc::new(ResponseCorrelatedFetcher::new(Arc::new(self.engine.clone())));
            FrontierProducer::new(
                fetcher,
                self.endpoints.clone(),
                ProducerOptions {
                    fetch_timeout: Duration::from_millis(100),
                    max_attempts: 3,
                    retry_backoff: Duration::from_millis(10),
                    max_pages: None,
                },
                cancel,
            )
        }

        async fn collect(&self, start_page: u32) -> (Vec<ItemId>, ProduceReport) {
            let mut ids = Vec::new();
            let report = self
                .producer(CancellationToken::new())
                .produce(
                    &self.query,
                    |id| {
                        ids.push(id);
                        std::future::ready(Ok(()))
                    },
                    start_page,
                )
                .await;
            (ids, report)
        }
    }

    #[tokio::test]
    async fn stops_after_short_page() {
        let harness = Harness::new();
        harness.page(1, 24).page(2, 24).page(3, 3);

        let (ids, report) = harness.collect(1).await;

        assert_eq!(ids.len(), 51);
        assert_eq!(report.total_found, 51);
        assert_eq!(report.pages_fetched, 3);
        assert_eq!(report.completion, Completion::EndOfResults { reason: EndReason::ShortPage });
        assert_eq!(harness.engine.navigation_count(&harness.endpoints.listing_url(&harness.query, 4)), 0);
    }

    #[tokio::test]
    async fn sentinel_on_first_page_yields_nothing() {
        let harness = Harness::new();
        harness.script(1, ScriptedNavigation::respond(
            harness.endpoints.listing_resource(&harness.query, 1),
            json!({"status": {"code": "ERROR_ELASTIC"}}).to_string(),
        ));

        let (ids, report) = harness.collect(1).await;

        assert!(ids.is_empty());
        assert_eq!(report.completion, Completion::EndOfResults { reason: EndReason::StatusSentinel });
        assert!(!report.completion.is_partial());
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let harness = Harness::new();
        harness
            .script(1, ScriptedNavigation::fail("net::ERR_CONNECTION_RESET"))
            .script(1, ScriptedNavigation::silent())
            .page(1, 2);

        let (ids, report) = harness.collect(1).await;

        assert_eq!(ids.len(), 2);
        assert_eq!(harness.engine.navigation_count(&harness.endpoints.listing_url(&harness.query, 1)), 3);
        assert_eq!(report.completion, Completion::EndOfResults { reason: EndReason::ShortPage });
    }

    #[tokio::test]
    async fn exhausted_retries_keep_earlier_pages() {
        let harness = Harness::new();
        harness.page(1, 24).script(2, ScriptedNavigation::fail("HTTP 503"));

        let (ids, report) = harness.collect(1).await;

        assert_eq!(ids.len(), 24);
        assert!(matches!(
            report.completion,
            Completion::RetriesExhausted { page: 2, last_error: FetchError::Navigation { .. } }
        ));
        assert_eq!(harness.engine.navigation_count(&harness.endpoints.listing_url(&harness.query, 2)), 3);
    }

    #[tokio::test]
    async fn malformed_listing_is_a_retried_parse_error() {
        let harness = Harness::new();
        harness.script(1, ScriptedNavigation::respond(
            harness.endpoints.listing_resource(&harness.query, 1),
            json!({"status": {"code": "OK"}, "response": "unavailable"}).to_string(),
        ));

        let (_, report) = harness.collect(1).await;

        assert!(matches!(
            report.completion,
            Completion::RetriesExhausted { page: 1, last_error: FetchError::Parse { .. } }
        ));
    }

    #[tokio::test]
    async fn honours_start_page_and_page_limit() {
        let harness = Harness::new();
        harness.page(3, 24).page(4, 24).page(5, 24);
        let mut producer = harness.producer(CancellationToken::new());
        producer.options.max_pages = Some(2);

        let mut ids = Vec::new();
        let report = producer
            .produce(
                &harness.query,
                |id| {
                    ids.push(id);
                    std::future::ready(Ok(()))
                },
                3,
            )
            .await;

        assert_eq!(ids.len(), 48);
        assert_eq!(report.start_page, 3);
        assert_eq!(report.completion, Completion::PageLimitReached { page: 5 });
    }

    #[tokio::test]
    async fn cancellation_abandons_backoff() {
        let harness = Harness::new();
        harness.script(1, ScriptedNavigation::fail("offline"));
        let cancel = CancellationToken::new();
        let mut producer = harness.producer(cancel.clone());
        producer.options.retry_backoff = Duration::from_secs(60);

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            trigger.cancel();
        });
        let report = tokio::time::timeout(
            Duration::from_secs(5),
            producer.produce(&harness.query, |_| std::future::ready(Ok(())), 1),
        )
        .await
        .unwrap();

        assert_eq!(report.completion, Completion::Cancelled { page: 1 });
    }

    #[tokio::test]
    async fn cancellation_releases_a_blocked_push() {
        let harness = Harness::new();
        harness.page(1, 24);
        let cancel = CancellationToken::new();
        let (sender, frontier) = frontier(2);

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });
        let report = tokio::time::timeout(
            Duration::from_secs(3),
            harness.producer(cancel).produce_into(&harness.query, sender, 1),
        )
        .await
        .unwrap();

        assert_eq!(report.completion, Completion::Cancelled { page: 1 });
        assert_eq!(report.total_found, 2);
        assert_eq!(frontier.pending(), 2);
    }

    #[tokio::test]
    async fn produce_into_closes_the_frontier() {
        let harness = Harness::new();
        harness.page(1, 2);
        let (sender, frontier) = frontier(16);

        let report = harness
            .producer(CancellationToken::new())
            .produce_into(&harness.query, sender, 1)
            .await;

        assert_eq!(report.total_found, 2);
        assert!(frontier.is_done());
        let poll = Duration::from_millis(10);
        assert!(matches!(frontier.pop(poll).await, Pop::Item(_)));
        assert!(matches!(frontier.pop(poll).await, Pop::Item(_)));
        assert_eq!(frontier.pop(poll).await, Pop::Done);
    }

    #[tokio::test]
    async fn closed_frontier_stops_production() {
        let harness = Harness::new();
        harness.page(1, 24).page(2, 24);
        let (sender, frontier) = frontier(64);
        frontier.close().await;

        let report = harness
            .producer(CancellationToken::new())
            .produce_into(&harness.query, sender, 1)
            .await;

        assert_eq!(report.completion, Completion::FrontierClosed { page: 1 });
        assert_eq!(report.total_found, 0);
    }
}
