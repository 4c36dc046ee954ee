//! # Persistence Sinks
//!
//! Durable destinations for the merge store's view. A sink receives the
//! whole catalog plus the history rows added since its last successful
//! flush; what it keeps from that is up to the sink.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::warn;

use crate::domain::CatalogView;

pub mod json_file_sink;
pub mod sqlite_sink;

pub use json_file_sink::JsonFileSink;
pub use sqlite_sink::SqliteSink;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[async_trait]
pub trait PersistenceSink: Send + Sync {
    /// Short label used in logs.
    fn name(&self) -> &str;

    async fn persist(&self, view: &CatalogView) -> Result<(), SinkError>;
}

/// Writes the same view to several sinks. Every sink is attempted; the
/// first error is returned.
pub struct FanoutSink {
    sinks: Vec<Arc<dyn PersistenceSink>>,
}

impl FanoutSink {
    #[must_use]
    pub fn new(sinks: Vec<Arc<dyn PersistenceSink>>) -> Self {
        Self { sinks }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

#[async_trait]
impl PersistenceSink for FanoutSink {
    fn name(&self) -> &str {
        "fanout"
    }

    async fn persist(&self, view: &CatalogView) -> Result<(), SinkError> {
        let mut first_error = None;
        for sink in &self.sinks {
            if let Err(e) = sink.persist(view).await {
                warn!(sink = sink.name(), error = %e, "Sink write failed");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}
