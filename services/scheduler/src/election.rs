//! Master election.
//!
//! Exactly one worker becomes master and runs the rebalancing engine. The
//! in-memory elector is first-writer-wins: the slot is set once and never
//! cleared. It has no way to notice a dead master or promote a successor;
//! a deployment spanning processes needs a lease-based elector backed by a
//! coordination service.

use async_trait::async_trait;
use subdist_id::WorkerId;
use tokio::sync::Mutex;
use tracing::info;

use crate::error::SchedulerResult;

/// Leader election capability.
#[async_trait]
pub trait Elector: Send + Sync {
    /// Try to become leader. Returns true iff `worker` is (now or already)
    /// the leader.
    async fn try_become_leader(&self, worker: WorkerId) -> SchedulerResult<bool>;

    /// The current leader, if one has been elected.
    async fn leader(&self) -> SchedulerResult<Option<WorkerId>>;
}

/// First-writer-wins elector for a single process.
#[derive(Default)]
pub struct InMemoryElector {
    slot: Mutex<Option<WorkerId>>,
}

impl InMemoryElector {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Elector for InMemoryElector {
    async fn try_become_leader(&self, worker: WorkerId) -> SchedulerResult<bool> {
        let mut slot = self.slot.lock().await;
        let leader = *slot.get_or_insert_with(|| {
            info!(worker_id = %worker, "Elected master");
            worker
        });
        Ok(leader == worker)
    }

    async fn leader(&self) -> SchedulerResult<Option<WorkerId>> {
        Ok(*self.slot.lock().await)
    }
}
