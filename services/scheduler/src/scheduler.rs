//! Scheduler facade.
//!
//! Wires the registry, elector, assignment store and item handler together
//! and exposes the operations a host process needs: registering items and
//! running workers.

use std::sync::Arc;
use std::time::Duration;

use subdist_id::{ItemId, WorkerId};
use subdist_reconcile::DEFAULT_REBALANCE_INTERVAL;
use tokio::sync::watch;
use tracing::{error, info, instrument};

use crate::assignment::{AssignmentStore, AssignmentTable, InMemoryAssignmentStore};
use crate::election::{Elector, InMemoryElector};
use crate::error::{SchedulerError, SchedulerResult};
use crate::handler::ItemHandler;
use crate::rebalance::RebalanceWorker;
use crate::registry::{InMemoryRegistry, Registry};
use crate::runtime::{RuntimeConfig, WorkerRuntime};

/// Scheduler configuration.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    /// Interval between rebalance ticks on the master.
    pub rebalance_interval: Duration,

    /// Worker runtime settings.
    pub runtime: RuntimeConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            rebalance_interval: DEFAULT_REBALANCE_INTERVAL,
            runtime: RuntimeConfig::default(),
        }
    }
}

/// Shared handle to a scheduler. Cloning is cheap.
#[derive(Clone)]
pub struct Scheduler {
    registry: Arc<dyn Registry>,
    store: Arc<dyn AssignmentStore>,
    elector: Arc<dyn Elector>,
    handler: Arc<dyn ItemHandler>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        registry: Arc<dyn Registry>,
        store: Arc<dyn AssignmentStore>,
        elector: Arc<dyn Elector>,
        handler: Arc<dyn ItemHandler>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            registry,
            store,
            elector,
            handler,
            config,
        }
    }

    /// A scheduler whose workers all live in this process.
    pub fn in_memory(handler: Arc<dyn ItemHandler>, config: SchedulerConfig) -> Self {
        Self::new(
            Arc::new(InMemoryRegistry::new()),
            Arc::new(InMemoryAssignmentStore::new()),
            Arc::new(InMemoryElector::new()),
            handler,
            config,
        )
    }

    pub fn registry(&self) -> &Arc<dyn Registry> {
        &self.registry
    }

    /// Register a work item. Returns false if it was already registered.
    pub async fn register_work_item(&self, item: ItemId) -> SchedulerResult<bool> {
        self.registry.register_work_item(item).await
    }

    /// Deregister a work item. Its owner stops handling it after the next
    /// rebalance tick.
    pub async fn deregister_work_item(&self, item: &ItemId) -> SchedulerResult<bool> {
        self.registry.deregister_work_item(item).await
    }

    /// A snapshot of the current assignment table.
    pub async fn assignments(&self) -> SchedulerResult<AssignmentTable> {
        self.store.snapshot().await
    }

    /// The elected master, if any.
    pub async fn master(&self) -> SchedulerResult<Option<WorkerId>> {
        self.elector.leader().await
    }

    /// Run a worker until shutdown is signaled.
    ///
    /// Registers the worker, takes part in the election, starts the
    /// rebalance loop if this worker won, and then drives the worker's
    /// handlers. On shutdown every handler is stopped and the worker
    /// deregisters itself.
    ///
    /// Fails with [`SchedulerError::WorkerAlreadyRunning`] if `worker` is
    /// already registered.
    #[instrument(skip(self, shutdown))]
    pub async fn start_worker(
        &self,
        worker: WorkerId,
        shutdown: watch::Receiver<bool>,
    ) -> SchedulerResult<()> {
        if !self.registry.register_worker(worker).await? {
            return Err(SchedulerError::WorkerAlreadyRunning(worker));
        }

        let rebalance = if self.elector.try_become_leader(worker).await? {
            info!(worker_id = %worker, "Worker is master, starting rebalance loop");
            let rebalancer = RebalanceWorker::new(
                Arc::clone(&self.registry),
                Arc::clone(&self.store),
                self.config.rebalance_interval,
            );
            Some(tokio::spawn(rebalancer.run(shutdown.clone())))
        } else {
            None
        };

        let runtime = WorkerRuntime::new(
            worker,
            Arc::clone(&self.store),
            Arc::clone(&self.handler),
            self.config.runtime,
        );
        runtime.run(shutdown).await;

        if let Some(handle) = rebalance {
            if let Err(e) = handle.await {
                error!(worker_id = %worker, error = %e, "Rebalance task panicked");
            }
        }

        self.registry.deregister_worker(worker).await?;
        info!(worker_id = %worker, "Worker stopped");
        Ok(())
    }
}
