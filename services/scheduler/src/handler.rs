//! Per-item handler capability.
//!
//! A worker runtime spawns one handler task for every item it owns. The
//! handler does the actual delivery work and must return promptly once its
//! cancellation token fires.

use async_trait::async_trait;
use subdist_id::{ItemId, WorkerId};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Work performed for a single owned item.
#[async_trait]
pub trait ItemHandler: Send + Sync + 'static {
    /// Handle `item` on behalf of `worker` until `cancel` fires.
    ///
    /// Returning before cancellation counts as an unexpected exit; the
    /// runtime restarts the handler on its next pass if the item is still
    /// assigned.
    async fn handle(&self, worker: WorkerId, item: ItemId, cancel: CancellationToken);
}

/// Handler that holds the item until it is cancelled.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdleHandler;

#[async_trait]
impl ItemHandler for IdleHandler {
    async fn handle(&self, worker: WorkerId, item: ItemId, cancel: CancellationToken) {
        debug!(worker_id = %worker, item = %item, "Handling item");
        cancel.cancelled().await;
        debug!(worker_id = %worker, item = %item, "Handler cancelled");
    }
}
