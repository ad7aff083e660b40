//! Rebalancing engine.
//!
//! Runs only on the master. Each tick it reads the assignment table and the
//! registry, plans the moves that bring every worker into the
//! `[avg, avg + 1]` band, and applies them one at a time.
//!
//! - `load`: worker load ordering and the queue the planner works on
//! - `planner`: pure planning of a single tick
//! - `worker`: the periodic loop that applies plans to the shared table

mod load;
mod planner;
mod worker;

pub use load::{LoadQueue, Transfer, WorkerLoad};
pub use planner::{plan_rebalance, RebalancePlan, RebalanceStats};
pub use worker::RebalanceWorker;
