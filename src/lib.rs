//! PriceWatch Crawler - response-correlated catalog crawling
//!
//! Crawls a JS-rendered price aggregator by observing the JSON responses a
//! page triggers instead of scraping rendered HTML, and keeps a merged
//! catalog with per-product price and availability history.

// Module declarations
pub mod domain;
pub mod application;
pub mod infrastructure;
pub mod crawling;

pub use application::{MergeStore, StoreError};
pub use crawling::{CrawlError, CrawlOptions, CrawlOrchestrator, CrawlReport};
pub use domain::{CatalogStats, DetailSnapshot, ItemId, ProductRecord, SearchQuery};
pub use infrastructure::{FetchError, ResponseCorrelatedFetcher};
