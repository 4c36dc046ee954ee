//! Periodic persistence of the merge store.
//!
//! The flusher keeps a version cursor: each flush hands the sink the full
//! catalog plus the history rows journaled after the cursor. The cursor
//! only advances after the sink accepted the view, so a failed flush is
//! retried with the same rows on the next tick.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::application::MergeStore;
use crate::infrastructure::persistence::{PersistenceSink, SinkError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlushReport {
    pub flushes: u64,
    pub failures: u64,
    /// Store version covered by the last successful flush.
    pub cursor: u64,
}

pub struct PeriodicFlusher {
    store: Arc<MergeStore>,
    sink: Arc<dyn PersistenceSink>,
    interval: Duration,
}

impl PeriodicFlusher {
    #[must_use]
    pub fn new(store: Arc<MergeStore>, sink: Arc<dyn PersistenceSink>, interval: Duration) -> Self {
        Self { store, sink, interval }
    }

    /// Persists everything after `cursor` and advances it on success.
    pub async fn flush_once(&self, cursor: &mut u64) -> Result<(), SinkError> {
        let view = self.store.view_since(*cursor).await;
        self.sink.persist(&view).await?;

        self.store.release_history(view.version).await;
        debug!(
            sink = self.sink.name(),
            from = *cursor,
            to = view.version,
            products = view.products.len(),
            history_rows = view.history.len(),
            "💾 Flush complete"
        );
        *cursor = view.version;
        Ok(())
    }

    /// Flushes on every tick until `stop` fires. The final flush is left to
    /// the caller so it can observe its result.
    pub async fn run(&self, stop: CancellationToken, mut cursor: u64) -> FlushReport {
        let mut report = FlushReport {
            cursor,
            ..FlushReport::default()
        };
        let mut ticker = interval(self.interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                () = stop.cancelled() => break,
                _ = ticker.tick() => {
                    match self.flush_once(&mut cursor).await {
                        Ok(()) => report.flushes += 1,
                        Err(e) => {
                            report.failures += 1;
                            warn!(sink = self.sink.name(), error = %e, "⚠️ Periodic flush failed");
                        }
                    }
                    report.cursor = cursor;
                }
            }
        }

        info!(
            flushes = report.flushes,
            failures = report.failures,
            cursor = report.cursor,
            "🛑 Periodic flusher stopped"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{CatalogView, DetailSnapshot};
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        views: Mutex<Vec<CatalogView>>,
        failing: AtomicBool,
    }

    #[async_trait]
    impl PersistenceSink for RecordingSink {
        fn name(&self) -> &str {
            "recording"
        }

        async fn persist(&self, view: &CatalogView) -> Result<(), SinkError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(SinkError::Io {
                    path: PathBuf::from("catalog.json"),
                    source: std::io::Error::other("read-only file system"),
                });
            }
            self.views.lock().await.push(view.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn flush_advances_cursor_and_releases_history() {
        let store = Arc::new(MergeStore::new());
        let sink = Arc::new(RecordingSink::default());
        let flusher = PeriodicFlusher::new(store.clone(), sink.clone(), Duration::from_secs(1));
        store.upsert(DetailSnapshot::new("a", 10.0, "in_stock")).await.unwrap();

        let mut cursor = 0;
        flusher.flush_once(&mut cursor).await.unwrap();
        assert_eq!(cursor, 1);
        assert!(store.history_delta(0).await.is_empty());

        store.upsert(DetailSnapshot::new("a", 9.0, "in_stock")).await.unwrap();
        flusher.flush_once(&mut cursor).await.unwrap();

        let views = sink.views.lock().await;
        assert_eq!(views[0].history.len(), 2);
        assert_eq!(views[1].history.len(), 1);
        assert_eq!(views[1].products.len(), 1);
    }

    #[tokio::test]
    async fn failed_flush_keeps_rows_for_next_attempt() {
        let store = Arc::new(MergeStore::new());
        let sink = Arc::new(RecordingSink::default());
        let flusher = PeriodicFlusher::new(store.clone(), sink.clone(), Duration::from_secs(1));
        store.upsert(DetailSnapshot::new("a", 10.0, "in_stock")).await.unwrap();

        sink.failing.store(true, Ordering::SeqCst);
        let mut cursor = 0;
        assert!(flusher.flush_once(&mut cursor).await.is_err());
        assert_eq!(cursor, 0);

        sink.failing.store(false, Ordering::SeqCst);
        flusher.flush_once(&mut cursor).await.unwrap();
        assert_eq!(sink.views.lock().await[0].history.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn run_flushes_on_interval_until_stopped() {
        let store = Arc::new(MergeStore::new());
        let sink = Arc::new(RecordingSink::default());
        let flusher = Arc::new(PeriodicFlusher::new(store.clone(), sink.clone(), Duration::from_millis(100)));
        store.upsert(DetailSnapshot::new("a", 10.0, "in_stock")).await.unwrap();

        let stop = CancellationToken::new();
        let handle = tokio::spawn({
            let flusher = flusher.clone();
            let stop = stop.clone();
            async move { flusher.run(stop, 0).await }
        });

        tokio::time::sleep(Duration::from_millis(350)).await;
        stop.cancel();
        let report = handle.await.unwrap();

        assert_eq!(report.flushes, 3);
        assert_eq!(report.failures, 0);
        assert_eq!(report.cursor, 1);
    }
}
