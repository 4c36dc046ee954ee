//! # Scripted Render Engine
//!
//! In-process `RenderEngine` that replays canned network responses per
//! navigation URL. Used for dry runs, integration tests and benches where a
//! real browser is not available.
//!
//! Each navigation URL owns a queue of `ScriptedNavigation`s. Every
//! navigation pops the front of the queue; the last script stays in place
//! and is replayed for any further navigation. URLs without a script
//! navigate successfully and produce no responses.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;

use super::render::{ObservedResponse, RenderContext, RenderEngine, RenderError};

#[derive(Debug, Clone)]
pub struct ScriptedResponse {
    pub response: ObservedResponse,
    /// Delay measured from the start of the navigation.
    pub delay: Duration,
}

/// What happens when a context navigates to a given URL.
#[derive(Debug, Clone, Default)]
pub struct ScriptedNavigation {
    pub failure: Option<String>,
    pub navigation_delay: Duration,
    pub responses: Vec<ScriptedResponse>,
}

impl ScriptedNavigation {
    /// Navigation that loads but never emits a response.
    #[must_use]
    pub fn silent() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn fail(reason: impl Into<String>) -> Self {
        Self {
            failure: Some(reason.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn respond(resource_url: impl Into<String>, body: impl Into<String>) -> Self {
        Self::silent().then(resource_url, body)
    }

    #[must_use]
    pub fn then(self, resource_url: impl Into<String>, body: impl Into<String>) -> Self {
        self.then_after(Duration::ZERO, resource_url, body)
    }

    #[must_use]
    pub fn then_after(mut self, delay: Duration, resource_url: impl Into<String>, body: impl Into<String>) -> Self {
        self.responses.push(ScriptedResponse {
            response: ObservedResponse::ok(resource_url, body),
            delay,
        });
        self
    }

    #[must_use]
    pub fn with_navigation_delay(mut self, delay: Duration) -> Self {
        self.navigation_delay = delay;
        self
    }
}

#[derive(Default)]
struct EngineState {
    scripts: Mutex<HashMap<String, VecDeque<ScriptedNavigation>>>,
    navigations: Mutex<Vec<String>>,
    open: AtomicUsize,
    peak_open: AtomicUsize,
    opened: AtomicUsize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl EngineState {
    fn next_script(&self, url: &str) -> ScriptedNavigation {
        let mut scripts = lock(&self.scripts);
        match scripts.get_mut(url) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or_default(),
            Some(queue) => queue.front().cloned().unwrap_or_default(),
            None => ScriptedNavigation::silent(),
        }
    }

    fn release(&self) {
        self.open.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Clone, Default)]
pub struct ScriptedRenderEngine {
    state: Arc<EngineState>,
}

impl ScriptedRenderEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a script for `url`.
    pub fn script(&self, url: impl Into<String>, navigation: ScriptedNavigation) -> &Self {
        lock(&self.state.scripts)
            .entry(url.into())
            .or_default()
            .push_back(navigation);
        self
    }

    /// Contexts currently open.
    #[must_use]
    pub fn open_contexts(&self) -> usize {
        self.state.open.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously open contexts so far.
    #[must_use]
    pub fn peak_open_contexts(&self) -> usize {
        self.state.peak_open.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn contexts_opened(&self) -> usize {
        self.state.opened.load(Ordering::SeqCst)
    }

    /// Navigation URLs in the order they were requested.
    #[must_use]
    pub fn navigations(&self) -> Vec<String> {
        lock(&self.state.navigations).clone()
    }

    #[must_use]
    pub fn navigation_count(&self, url: &str) -> usize {
        lock(&self.state.navigations).iter().filter(|u| *u == url).count()
    }
}

#[async_trait]
impl RenderEngine for ScriptedRenderEngine {
    async fn open_context(&self) -> Result<Box<dyn RenderContext>, RenderError> {
        let open = self.state.open.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.peak_open.fetch_max(open, Ordering::SeqCst);
        self.state.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedContext {
            engine: Arc::clone(&self.state),
            listener: None,
            emitters: Vec::new(),
            closed: false,
        }))
    }
}

struct ScriptedContext {
    engine: Arc<EngineState>,
    listener: Option<mpsc::UnboundedSender<ObservedResponse>>,
    emitters: Vec<JoinHandle<()>>,
    closed: bool,
}

impl ScriptedContext {
    fn shutdown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        for emitter in self.emitters.drain(..) {
            emitter.abort();
        }
        self.listener = None;
        self.engine.release();
    }
}

#[async_trait]
impl RenderContext for ScriptedContext {
    fn observe(&mut self) -> mpsc::UnboundedReceiver<ObservedResponse> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listener = Some(tx);
        rx
    }

    async fn navigate(&mut self, url: &str) -> Result<(), RenderError> {
        if self.closed {
            return Err(RenderError::Closed);
        }
        lock(&self.engine.navigations).push(url.to_string());
        let script = self.engine.next_script(url);
        trace!(url, responses = script.responses.len(), "Replaying scripted navigation");

        if let Some(listener) = &self.listener {
            for scripted in script.responses {
                let listener = listener.clone();
                self.emitters.push(tokio::spawn(async move {
                    if !scripted.delay.is_zero() {
                        tokio::time::sleep(scripted.delay).await;
                    }
                    let _ = listener.send(scripted.response);
                }));
            }
        }

        if !script.navigation_delay.is_zero() {
            tokio::time::sleep(script.navigation_delay).await;
        }
        match script.failure {
            Some(reason) => Err(RenderError::Navigation(reason)),
            None => Ok(()),
        }
    }

    async fn close(&mut self) {
        self.shutdown();
    }
}

impl Drop for ScriptedContext {
    fn drop(&mut self) {
        self.shutdown();
    }
}
