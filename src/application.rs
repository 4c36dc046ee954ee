//! Application layer module
//!
//! Stateful services that sit between the crawl pipeline and persistence:
//! the concurrent merge store and the clock it stamps history with.

pub mod clock;
pub mod merge_store;

pub use clock::{Clock, SteppingClock, SystemClock};
pub use merge_store::{MergeStore, StoreError, UpsertOutcome};
