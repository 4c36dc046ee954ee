//! # Crawling Module
//!
//! The crawl pipeline for one query:
//! listing pages → frontier → detail workers → merge store → periodic flush.
//!
//! - `endpoints`: navigation URLs, resource URLs and response matchers
//! - `frontier`: bounded id queue shared by producer and workers
//! - `producer`: listing pagination and termination
//! - `workers`: detail fetch, typing and merge
//! - `flusher`: periodic persistence of the store
//! - `orchestrator`: wires the above under one cancellation token

pub mod endpoints;
pub mod flusher;
pub mod frontier;
pub mod orchestrator;
pub mod producer;
pub mod workers;

pub use endpoints::{DetailMatcher, ListingMatcher, SiteEndpoints, DEFAULT_BASE_URL};
pub use flusher::{FlushReport, PeriodicFlusher};
pub use frontier::{frontier, Frontier, FrontierError, FrontierSender, Pop, DEFAULT_FRONTIER_CAPACITY};
pub use orchestrator::{CrawlError, CrawlOptions, CrawlOrchestrator, CrawlReport};
pub use producer::{Completion, FrontierProducer, ProduceReport, ProducerOptions};
pub use workers::{DrainPolicy, DropCounts, WorkerError, WorkerOptions, WorkerPool, WorkerPoolBuilder, WorkerPoolStats};
