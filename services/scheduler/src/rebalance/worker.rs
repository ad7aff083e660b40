//! Rebalance background worker.
//!
//! Runs the rebalancing engine on a periodic interval until shutdown.

use std::sync::Arc;
use std::time::Duration;

use subdist_reconcile::TableDigest;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use super::planner::{plan_rebalance, RebalanceStats};
use crate::assignment::AssignmentStore;
use crate::error::{SchedulerError, SchedulerResult};
use crate::registry::Registry;

/// Rebalance worker that drives the engine on the master.
pub struct RebalanceWorker {
    registry: Arc<dyn Registry>,
    store: Arc<dyn AssignmentStore>,
    interval: Duration,
    last_digest: Option<TableDigest>,
}

impl RebalanceWorker {
    /// Create a new rebalance worker.
    pub fn new(
        registry: Arc<dyn Registry>,
        store: Arc<dyn AssignmentStore>,
        interval: Duration,
    ) -> Self {
        Self {
            registry,
            store,
            interval,
            last_digest: None,
        }
    }

    /// Run the rebalance loop until shutdown is signaled.
    #[instrument(skip(self, shutdown))]
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_ms = self.interval.as_millis() as u64,
            "Starting rebalance worker"
        );

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.rebalance().await {
                        Ok(_) => {}
                        Err(SchedulerError::NoWorkers) => {
                            debug!("No workers registered, skipping rebalance tick");
                        }
                        Err(e) if e.is_transient() => {
                            warn!(error = %e, "Rebalance tick interrupted, will retry");
                        }
                        Err(e) => {
                            error!(error = %e, "Rebalance tick failed");
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Rebalance worker shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Run a single rebalance tick: plan against fresh snapshots, then apply
    /// each move under the store's lock.
    pub async fn rebalance(&mut self) -> SchedulerResult<RebalanceStats> {
        let table = self.store.snapshot().await?;
        let membership = self.registry.snapshot().await?;

        let plan = plan_rebalance(&table, &membership)?;
        for mv in plan.moves() {
            debug!(?mv, "Applying move");
            self.store.apply(mv).await?;
        }

        let stats = plan.stats();
        if !plan.is_empty() {
            info!(
                avg = plan.avg(),
                workers_added = stats.workers_added,
                workers_removed = stats.workers_removed,
                items_dropped = stats.items_dropped,
                items_assigned = stats.items_assigned,
                items_shed = stats.items_shed,
                items_filled = stats.items_filled,
                "Rebalance complete"
            );
        }

        self.log_table_if_changed().await?;
        Ok(stats)
    }

    async fn log_table_if_changed(&mut self) -> SchedulerResult<()> {
        let table = self.store.snapshot().await?;
        let digest = table.digest();
        if self.last_digest.as_ref() == Some(&digest) {
            return Ok(());
        }

        for (worker, items) in table.entries() {
            info!(
                worker_id = %worker,
                item_count = items.len(),
                items = %items.iter().map(|i| i.as_str()).collect::<Vec<_>>().join(" "),
                "Worker assignment"
            );
        }
        debug!(
            digest = %digest,
            table = %serde_json::to_string(&table).unwrap_or_default(),
            "Assignment table"
        );

        self.last_digest = Some(digest);
        Ok(())
    }
}
