//! subdist scheduler
//!
//! Distributes a changing set of work items across a changing set of
//! workers so that every item is handled by exactly one worker, loads stay
//! within one item of each other, and items move only when they must.
//!
//! ## Architecture
//!
//! - **Registry**: which items exist and which workers are alive
//! - **Elector**: picks the single master, first writer wins
//! - **Rebalance worker**: runs on the master, plans and applies moves to
//!   the shared assignment table
//! - **Worker runtime**: runs on every worker, starts and cancels item
//!   handlers to match the worker's slice of the table

pub mod assignment;
pub mod config;
pub mod election;
pub mod error;
pub mod handler;
pub mod rebalance;
pub mod registry;
pub mod runtime;
pub mod scheduler;

pub use assignment::{AssignmentStore, AssignmentTable, InMemoryAssignmentStore, Move};
pub use config::Config;
pub use election::{Elector, InMemoryElector};
pub use error::{SchedulerError, SchedulerResult};
pub use handler::{IdleHandler, ItemHandler};
pub use rebalance::{plan_rebalance, RebalancePlan, RebalanceStats, RebalanceWorker};
pub use registry::{InMemoryRegistry, MembershipSnapshot, Registry};
pub use runtime::{HandlerState, ReconcileStats, RuntimeConfig, WorkerRuntime};
pub use scheduler::{Scheduler, SchedulerConfig};
pub use subdist_id::{IdError, ItemId, WorkerId};
