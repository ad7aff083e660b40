//! # subdist-id
//!
//! Typed identifiers for the subdist scheduler.
//!
//! ## Design Principles
//!
//! - Work items are opaque, caller-chosen strings; the scheduler never
//!   interprets them beyond ordering
//! - Workers are small integers assigned at process start
//! - Both types are distinct so an item can never be passed where a worker
//!   is expected
//!
//! ## Ordering
//!
//! `ItemId` orders byte-wise lexicographically, which is the order the
//! rebalancing engine relies on when it picks the "last" item of a worker.
//! `WorkerId` orders numerically.

mod error;
mod types;

pub use error::IdError;
pub use types::*;
