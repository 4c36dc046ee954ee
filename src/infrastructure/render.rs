//! # Render-and-Observe Capability
//!
//! Abstraction over a real browser engine. A `RenderEngine` hands out
//! isolated `RenderContext`s (one fresh page each); a context navigates to a
//! URL and streams every network response it observes to the single
//! receiver returned by `observe`. Responses from one context are never
//! delivered to another.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

/// A network response seen by a rendering context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedResponse {
    /// Target resource address of the response (the XHR URL).
    pub resource_url: String,
    pub status: u16,
    pub body: String,
}

impl ObservedResponse {
    #[must_use]
    pub fn ok(resource_url: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            resource_url: resource_url.into(),
            status: 200,
            body: body.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RenderError {
    #[error("rendering context unavailable: {0}")]
    ContextUnavailable(String),
    #[error("navigation failed: {0}")]
    Navigation(String),
    #[error("rendering context already closed")]
    Closed,
}

#[async_trait]
pub trait RenderEngine: Send + Sync {
    async fn open_context(&self) -> Result<Box<dyn RenderContext>, RenderError>;
}

#[async_trait]
pub trait RenderContext: Send {
    /// Registers the response listener. Must be called before `navigate`;
    /// a second call replaces the first listener.
    fn observe(&mut self) -> mpsc::UnboundedReceiver<ObservedResponse>;

    /// Triggers navigation. Resolves once the engine considers the page
    /// loaded; responses may arrive before or after that point.
    async fn navigate(&mut self, url: &str) -> Result<(), RenderError>;

    /// Releases the page and its listener. Idempotent.
    async fn close(&mut self);
}
