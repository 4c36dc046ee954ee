//! # Response-Correlated Fetcher
//!
//! Renders a URL in a fresh, isolated context and returns the JSON body of
//! the first observed response whose target resource satisfies a
//! `ResponseMatcher`. Every call owns its context and listener; the context
//! is torn down on success, on failure and when the caller drops the future.

use std::num::NonZeroU32;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use governor::{
    clock::DefaultClock,
    state::{direct::NotKeyed, InMemoryState},
    Quota, RateLimiter,
};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::render::{ObservedResponse, RenderContext, RenderEngine, RenderError};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("navigation to {url} failed: {reason}")]
    Navigation { url: String, reason: String },
    #[error("no matching response for {url} within {timeout:?}")]
    Timeout { url: String, timeout: Duration },
    #[error("response from {resource} is not usable JSON: {reason}")]
    Parse { resource: String, reason: String },
    #[error("could not open a rendering context: {0}")]
    ContextOpen(String),
    #[error("fetch of {url} cancelled")]
    Cancelled { url: String },
}

impl FetchError {
    /// Every failure except cancellation may succeed on a later attempt.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        !matches!(self, Self::Cancelled { .. })
    }

    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Navigation { .. } => "navigation",
            Self::Timeout { .. } => "timeout",
            Self::Parse { .. } => "parse",
            Self::ContextOpen(_) => "context_open",
            Self::Cancelled { .. } => "cancelled",
        }
    }
}

/// Decides whether an observed response belongs to the current fetch.
pub trait ResponseMatcher: Send + Sync {
    fn matches(&self, resource_url: &str) -> bool;
}

impl<F> ResponseMatcher for F
where
    F: Fn(&str) -> bool + Send + Sync,
{
    fn matches(&self, resource_url: &str) -> bool {
        self(resource_url)
    }
}

#[derive(Debug, Clone, Default)]
pub struct FetcherConfig {
    /// Upper bound on simultaneously open rendering contexts.
    pub max_open_contexts: Option<usize>,
    /// Navigations started per second across all callers.
    pub max_navigations_per_second: Option<u32>,
}

pub struct ResponseCorrelatedFetcher {
    engine: Arc<dyn RenderEngine>,
    context_slots: Option<Arc<Semaphore>>,
    rate_limiter: Option<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
    open_contexts: Arc<AtomicUsize>,
}

impl ResponseCorrelatedFetcher {
    #[must_use]
    pub fn new(engine: Arc<dyn RenderEngine>) -> Self {
        Self::with_config(engine, &FetcherConfig::default())
    }

    /// Zero limits are treated as "unbounded".
    #[must_use]
    pub fn with_config(engine: Arc<dyn RenderEngine>, config: &FetcherConfig) -> Self {
        let context_slots = config
            .max_open_contexts
            .filter(|limit| *limit > 0)
            .map(|limit| Arc::new(Semaphore::new(limit)));
        let rate_limiter = config
            .max_navigations_per_second
            .and_then(NonZeroU32::new)
            .map(|rate| RateLimiter::direct(Quota::per_second(rate)));

        Self {
            engine,
            context_slots,
            rate_limiter,
            open_contexts: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Contexts opened by this fetcher that have not been torn down yet.
    #[must_use]
    pub fn open_contexts(&self) -> usize {
        self.open_contexts.load(Ordering::SeqCst)
    }

    /// Fetches `url` and returns the decoded body of the first matching response.
    ///
    /// `budget` covers opening the context, navigation and waiting for the
    /// match. Waiting for a context slot or the navigation rate limit is not
    /// part of the budget.
    pub async fn fetch(&self, url: &str, matcher: &dyn ResponseMatcher, budget: Duration) -> Result<Value, FetchError> {
        let _slot = self.acquire_slot().await?;
        if let Some(limiter) = &self.rate_limiter {
            limiter.until_ready().await;
        }

        let started = Instant::now();
        debug!(url, ?budget, "Opening rendering context");
        let context = tokio::time::timeout(budget, self.engine.open_context())
            .await
            .map_err(|_| timeout_error(url, budget))?
            .map_err(|e| FetchError::ContextOpen(e.to_string()))?;

        let mut guard = ContextGuard::new(context, Arc::clone(&self.open_contexts));
        let remaining = budget.saturating_sub(started.elapsed());
        let outcome = tokio::time::timeout(remaining, await_match(guard.context_mut(), url, matcher, budget)).await;
        guard.close().await;

        let response = outcome.map_err(|_| timeout_error(url, budget))??;
        debug!(
            url,
            resource = %response.resource_url,
            elapsed_ms = started.elapsed().as_millis(),
            "Matched response"
        );
        serde_json::from_str(&response.body).map_err(|e| FetchError::Parse {
            resource: response.resource_url,
            reason: e.to_string(),
        })
    }

    /// Like `fetch`, but returns `Cancelled` as soon as `token` fires.
    pub async fn fetch_with_cancellation(
        &self,
        url: &str,
        matcher: &dyn ResponseMatcher,
        budget: Duration,
        token: &CancellationToken,
    ) -> Result<Value, FetchError> {
        if token.is_cancelled() {
            return Err(FetchError::Cancelled { url: url.to_string() });
        }
        tokio::select! {
            biased;
            () = token.cancelled() => {
                debug!(url, "🛑 Fetch cancelled");
                Err(FetchError::Cancelled { url: url.to_string() })
            }
            result = self.fetch(url, matcher, budget) => result,
        }
    }

    async fn acquire_slot(&self) -> Result<Option<OwnedSemaphorePermit>, FetchError> {
        match &self.context_slots {
            Some(slots) => Arc::clone(slots)
                .acquire_owned()
                .await
                .map(Some)
                .map_err(|e| FetchError::ContextOpen(e.to_string())),
            None => Ok(None),
        }
    }
}

fn timeout_error(url: &str, budget: Duration) -> FetchError {
    FetchError::Timeout {
        url: url.to_string(),
        timeout: budget,
    }
}

async fn await_match(
    context: &mut dyn RenderContext,
    url: &str,
    matcher: &dyn ResponseMatcher,
    budget: Duration,
) -> Result<ObservedResponse, FetchError> {
    let mut responses = context.observe();
    let navigation = context.navigate(url);
    tokio::pin!(navigation);
    let mut navigated = false;

    loop {
        tokio::select! {
            biased;
            observed = responses.recv() => match observed {
                Some(response) if matcher.matches(&response.resource_url) => return Ok(response),
                Some(response) => trace!(url, resource = %response.resource_url, "Ignoring unrelated response"),
                // listener gone: nothing can match any more
                None => return Err(timeout_error(url, budget)),
            },
            result = &mut navigation, if !navigated => {
                result.map_err(|e: RenderError| FetchError::Navigation {
                    url: url.to_string(),
                    reason: e.to_string(),
                })?;
                navigated = true;
            }
        }
    }
}

/// Placeholder left behind when a guard hands its context to a teardown task.
struct ReleasedContext;

#[async_trait::async_trait]
impl RenderContext for ReleasedContext {
    fn observe(&mut self) -> tokio::sync::mpsc::UnboundedReceiver<ObservedResponse> {
        tokio::sync::mpsc::unbounded_channel().1
    }

    async fn navigate(&mut self, _url: &str) -> Result<(), RenderError> {
        Err(RenderError::Closed)
    }

    async fn close(&mut self) {}
}

/// Scope guard around one rendering context.
struct ContextGuard {
    context: Box<dyn RenderContext>,
    gauge: Arc<AtomicUsize>,
    closed: bool,
}

impl ContextGuard {
    fn new(context: Box<dyn RenderContext>, gauge: Arc<AtomicUsize>) -> Self {
        gauge.fetch_add(1, Ordering::SeqCst);
        Self {
            context,
            gauge,
            closed: false,
        }
    }

    fn context_mut(&mut self) -> &mut dyn RenderContext {
        self.context.as_mut()
    }

    async fn close(mut self) {
        self.context.close().await;
        self.closed = true;
    }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        self.gauge.fetch_sub(1, Ordering::SeqCst);
        if self.closed {
            return;
        }
        // cancelled mid-fetch: finish the async teardown off the caller's task
        let mut context = std::mem::replace(&mut self.context, Box::new(ReleasedContext));
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                context.close().await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::scripted_engine::{ScriptedNavigation, ScriptedRenderEngine};

    const PAGE: &str = "https://shop.test/search;pagenumber=1";

    fn fetcher(engine: &ScriptedRenderEngine) -> ResponseCorrelatedFetcher {
        ResponseCorrelatedFetcher::new(Arc::new(engine.clone()))
    }

    fn resource_is(expected: &'static str) -> impl Fn(&str) -> bool + Send + Sync {
        move |resource: &str| resource == expected
    }

    #[tokio::test]
    async fn returns_first_matching_response_and_skips_others() {
        let engine = ScriptedRenderEngine::new();
        engine.script(
            PAGE,
            ScriptedNavigation::respond("https://shop.test/find/?q=2", r#"{"page": 2}"#)
                .then("https://shop.test/static/app.js", "not json")
                .then_after(Duration::from_millis(20), "https://shop.test/find/?q=1", r#"{"page": 1}"#),
        );
        let fetcher = fetcher(&engine);

        let value = fetcher
            .fetch(PAGE, &resource_is("https://shop.test/find/?q=1"), Duration::from_secs(2))
            .await
            .unwrap();

        assert_eq!(value["page"], 1);
        assert_eq!(fetcher.open_contexts(), 0);
        assert_eq!(engine.open_contexts(), 0);
    }

    #[tokio::test]
    async fn unmatched_fetch_times_out_without_leaking_contexts() {
        let engine = ScriptedRenderEngine::new();
        engine.script(PAGE, ScriptedNavigation::respond("https://shop.test/find/?q=other", "{}"));
        let fetcher = fetcher(&engine);

        let error = fetcher
            .fetch(PAGE, &resource_is("https://shop.test/find/?q=1"), Duration::from_millis(50))
            .await
            .unwrap_err();

        assert!(matches!(error, FetchError::Timeout { .. }));
        assert_eq!(fetcher.open_contexts(), 0);
        assert_eq!(engine.open_contexts(), 0);
        assert_eq!(engine.contexts_opened(), 1);
    }

    #[tokio::test]
    async fn navigation_failure_is_reported() {
        let engine = ScriptedRenderEngine::new();
        engine.script(PAGE, ScriptedNavigation::fail("net::ERR_NAME_NOT_RESOLVED"));
        let fetcher = fetcher(&engine);

        let error = fetcher.fetch(PAGE, &|_: &str| true, Duration::from_secs(1)).await.unwrap_err();

        assert_eq!(error.kind(), "navigation");
        assert!(error.to_string().contains("ERR_NAME_NOT_RESOLVED"));
        assert_eq!(engine.open_contexts(), 0);
    }

    #[tokio::test]
    async fn matching_non_json_body_is_a_parse_error() {
        let engine = ScriptedRenderEngine::new();
        engine.script(PAGE, ScriptedNavigation::respond("https://shop.test/find/?q=1", "<html>"));
        let fetcher = fetcher(&engine);

        let error = fetcher.fetch(PAGE, &|_: &str| true, Duration::from_secs(1)).await.unwrap_err();

        assert!(matches!(error, FetchError::Parse { ref resource, .. } if resource.ends_with("q=1")));
    }

    #[tokio::test]
    async fn cancellation_tears_the_context_down() {
        let engine = ScriptedRenderEngine::new();
        engine.script(PAGE, ScriptedNavigation::silent());
        let fetcher = fetcher(&engine);
        let token = CancellationToken::new();

        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });
        let error = fetcher
            .fetch_with_cancellation(PAGE, &|_: &str| false, Duration::from_secs(5), &token)
            .await
            .unwrap_err();

        assert_eq!(error, FetchError::Cancelled { url: PAGE.to_string() });
        assert_eq!(fetcher.open_contexts(), 0);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(engine.open_contexts(), 0);
    }

    #[tokio::test]
    async fn context_limit_bounds_simultaneous_pages() {
        let engine = ScriptedRenderEngine::new();
        for page in 1..=4 {
            engine.script(
                format!("https://shop.test/p/{page}"),
                ScriptedNavigation::silent().then_after(Duration::from_millis(10), format!("r{page}"), "{}"),
            );
        }
        let fetcher = Arc::new(ResponseCorrelatedFetcher::with_config(
            Arc::new(engine.clone()),
            &FetcherConfig {
                max_open_contexts: Some(2),
                max_navigations_per_second: None,
            },
        ));

        let mut handles = Vec::new();
        for page in 1..=4 {
            let fetcher = Arc::clone(&fetcher);
            handles.push(tokio::spawn(async move {
                let url = format!("https://shop.test/p/{page}");
                let expected = format!("r{page}");
                fetcher
                    .fetch(&url, &move |resource: &str| resource == expected, Duration::from_secs(2))
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert!(engine.peak_open_contexts() <= 2);
        assert_eq!(engine.contexts_opened(), 4);
    }
}
