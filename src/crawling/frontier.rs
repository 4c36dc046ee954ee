//! # ID Frontier
//!
//! Bounded FIFO of item ids between the listing producer and the detail
//! workers. The producer side applies backpressure when the queue is full;
//! dropping or closing the sender marks the frontier done, and consumers
//! observe completion once the remaining ids are drained.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;

use crate::domain::ItemId;

pub const DEFAULT_FRONTIER_CAPACITY: usize = 10_000;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrontierError {
    #[error("frontier closed: no consumer is left")]
    Closed,
}

/// Outcome of one `pop` attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pop {
    Item(ItemId),
    /// Nothing arrived within the poll interval; the producer is still running.
    Empty,
    /// The producer finished and every id has been handed out.
    Done,
}

#[derive(Debug, Default)]
struct FrontierCounters {
    enqueued: AtomicUsize,
    dequeued: AtomicUsize,
    done: AtomicBool,
}

/// Producer half.
pub struct FrontierSender {
    sender: mpsc::Sender<ItemId>,
    counters: Arc<FrontierCounters>,
}

impl FrontierSender {
    /// Waits for capacity, then enqueues `id`.
    pub async fn push(&self, id: ItemId) -> Result<(), FrontierError> {
        self.sender.send(id).await.map_err(|_| FrontierError::Closed)?;
        self.counters.enqueued.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Signals that no more ids will be produced.
    pub fn close(self) {
        self.counters.done.store(true, Ordering::SeqCst);
    }
}

impl Drop for FrontierSender {
    fn drop(&mut self) {
        self.counters.done.store(true, Ordering::SeqCst);
    }
}

/// Consumer half, shared by all workers.
pub struct Frontier {
    receiver: Mutex<mpsc::Receiver<ItemId>>,
    counters: Arc<FrontierCounters>,
}

/// Creates a frontier holding at most `capacity` pending ids.
#[must_use]
pub fn frontier(capacity: usize) -> (FrontierSender, Arc<Frontier>) {
    let (sender, receiver) = mpsc::channel(capacity.max(1));
    let counters = Arc::new(FrontierCounters::default());
    (
        FrontierSender {
            sender,
            counters: Arc::clone(&counters),
        },
        Arc::new(Frontier {
            receiver: Mutex::new(receiver),
            counters,
        }),
    )
}

impl Frontier {
    /// Pops the next id, waiting at most `poll` for one to arrive.
    pub async fn pop(&self, poll: Duration) -> Pop {
        let mut receiver = self.receiver.lock().await;
        match timeout(poll, receiver.recv()).await {
            Ok(Some(id)) => {
                self.counters.dequeued.fetch_add(1, Ordering::SeqCst);
                Pop::Item(id)
            }
            Ok(None) => Pop::Done,
            Err(_) => Pop::Empty,
        }
    }

    /// Refuses further pushes; ids already queued can still be popped.
    pub async fn close(&self) {
        self.receiver.lock().await.close();
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.counters.done.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn enqueued(&self) -> usize {
        self.counters.enqueued.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn dequeued(&self) -> usize {
        self.counters.dequeued.load(Ordering::SeqCst)
    }

    /// Ids enqueued but not yet handed to a worker.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.enqueued().saturating_sub(self.dequeued())
    }
}
