//! Domain module - catalog entities and value objects
//!
//! Pure data types shared by the crawl pipeline, the merge store and the
//! persistence sinks. Nothing in here performs I/O.
//!
//! - `query`: search parameters and item identifiers
//! - `listing`: typed view of one listing response page
//! - `product`: detail snapshots and the persisted product record
//! - `history`: time-ordered, timestamp-unique history arrays
//! - `catalog`: source statistics and the flushable catalog view

pub mod catalog;
pub mod history;
pub mod listing;
pub mod product;
pub mod query;

pub use catalog::{CatalogSnapshot, CatalogStats, CatalogView, HistoryChange, HistoryRow, SourceStat};
pub use history::{AvailabilityHistoryEntry, History, HistoryEntry, HistoryWrite, PriceHistoryEntry};
pub use listing::{EndReason, ListingPage};
pub use product::{DetailSnapshot, PayloadError, ProductFields, ProductRecord, Promotion};
pub use query::{ItemId, SearchQuery, SortDirection, SortSpec};
