//! Worker runtime.
//!
//! Each worker owns a local map from item to handler task. On every pass the
//! runtime reads the worker's slice of the assignment table, starts handlers
//! for newly assigned items and cancels handlers for items it lost.
//!
//! Per item the lifecycle is `UNASSIGNED -> RUNNING -> STOPPING -> removed`.
//! A handler task reports its exit over a channel; the runtime removes the
//! entry when the report arrives. An item that is assigned again while its
//! old handler is still stopping is only restarted after that handler is
//! gone. A handler that ignores cancellation is aborted once it has been
//! stopping for longer than the stop timeout.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use subdist_id::{ItemId, WorkerId};
use subdist_reconcile::{ConvergenceStatus, SetDiff, DEFAULT_RECONCILE_INTERVAL, DEFAULT_STOP_TIMEOUT};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::assignment::AssignmentStore;
use crate::error::SchedulerResult;
use crate::handler::ItemHandler;

/// Upper bound on a single wait while settling.
const SETTLE_POLL: Duration = Duration::from_millis(50);

/// Worker runtime configuration.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeConfig {
    /// Interval between reconciliation passes.
    pub reconcile_interval: Duration,

    /// How long a cancelled handler may take to exit before it is aborted.
    pub stop_timeout: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            reconcile_interval: DEFAULT_RECONCILE_INTERVAL,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }
}

/// Lifecycle state of a local handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    /// Handling the item.
    Running,

    /// Cancelled, waiting for the task to exit.
    Stopping,
}

struct HandlerEntry {
    cancel: CancellationToken,
    state: HandlerState,
    stopping_since: Option<Instant>,
    generation: u64,
    task: JoinHandle<()>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct ExitCounts {
    reported: usize,
    unreported: usize,
}

impl ExitCounts {
    fn total(&self) -> usize {
        self.reported + self.unreported
    }
}

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileStats {
    pub started: usize,
    pub cancelled: usize,
    /// Entries removed after their handler exited.
    pub removed: usize,
    /// Handlers aborted after exceeding the stop timeout.
    pub aborted: usize,
    pub status: ConvergenceStatus,
}

/// Drives the handlers of a single worker.
pub struct WorkerRuntime {
    worker: WorkerId,
    store: Arc<dyn AssignmentStore>,
    handler: Arc<dyn ItemHandler>,
    config: RuntimeConfig,
    handlers: HashMap<ItemId, HandlerEntry>,
    next_generation: u64,
    exit_tx: mpsc::UnboundedSender<(ItemId, u64)>,
    exit_rx: mpsc::UnboundedReceiver<(ItemId, u64)>,
}

impl WorkerRuntime {
    pub fn new(
        worker: WorkerId,
        store: Arc<dyn AssignmentStore>,
        handler: Arc<dyn ItemHandler>,
        config: RuntimeConfig,
    ) -> Self {
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        Self {
            worker,
            store,
            handler,
            config,
            handlers: HashMap::new(),
            next_generation: 0,
            exit_tx,
            exit_rx,
        }
    }

    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    /// Items with a running handler, ascending.
    pub fn running_items(&self) -> Vec<ItemId> {
        let mut items: Vec<ItemId> = self
            .handlers
            .iter()
            .filter(|(_, e)| e.state == HandlerState::Running)
            .map(|(item, _)| item.clone())
            .collect();
        items.sort();
        items
    }

    pub fn handler_state(&self, item: &ItemId) -> Option<HandlerState> {
        self.handlers.get(item).map(|e| e.state)
    }

    /// Number of local handlers, running or stopping.
    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    /// Run the reconciliation loop until shutdown, then stop every handler.
    #[instrument(skip(self, shutdown), fields(worker_id = %self.worker))]
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            reconcile_interval_ms = self.config.reconcile_interval.as_millis() as u64,
            stop_timeout_ms = self.config.stop_timeout.as_millis() as u64,
            "Starting worker runtime"
        );

        let mut interval = tokio::time::interval(self.config.reconcile_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.reconcile().await {
                        Ok(stats) if stats.status.is_converging() => {
                            debug!(
                                started = stats.started,
                                cancelled = stats.cancelled,
                                removed = stats.removed,
                                aborted = stats.aborted,
                                "Reconciliation pass"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => {
                            error!(error = %e, "Reconciliation failed");
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Worker runtime shutting down");
                        break;
                    }
                }
            }
        }

        self.stop().await;
    }

    /// Perform a single reconciliation pass.
    pub async fn reconcile(&mut self) -> SchedulerResult<ReconcileStats> {
        let removed = self.collect_exits().total();
        let aborted = self.abort_overdue();

        let desired = self.store.items_for(self.worker).await?;
        let diff = SetDiff::between(desired.iter(), self.handlers.keys());
        let pending = !diff.is_empty();

        let mut started = 0;
        for item in diff.to_start {
            self.start(item);
            started += 1;
        }

        let mut cancelled = 0;
        for item in &diff.to_stop {
            if self.cancel(item) {
                cancelled += 1;
            }
        }

        let status = if pending || self.has_stopping() {
            ConvergenceStatus::Converging
        } else {
            ConvergenceStatus::Converged
        };

        Ok(ReconcileStats {
            started,
            cancelled,
            removed,
            aborted,
            status,
        })
    }

    /// Wait until no handler is stopping, or `timeout` elapses.
    ///
    /// Returns true if every stopping handler exited in time.
    pub async fn settle(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            self.collect_exits();
            if !self.has_stopping() {
                return true;
            }

            let now = Instant::now();
            if now >= deadline {
                return false;
            }

            let wait = (deadline - now).min(SETTLE_POLL);
            if let Ok(Some((item, generation))) =
                tokio::time::timeout(wait, self.exit_rx.recv()).await
            {
                self.on_exit(&item, generation);
            }
        }
    }

    /// Cancel every handler and wait for them to exit, aborting whatever is
    /// left after the stop timeout. Returns the number of aborted handlers.
    pub async fn stop(&mut self) -> usize {
        info!(
            worker_id = %self.worker,
            count = self.handlers.len(),
            "Stopping all handlers"
        );

        let items: Vec<ItemId> = self.handlers.keys().cloned().collect();
        for item in &items {
            self.cancel(item);
        }

        if self.settle(self.config.stop_timeout).await {
            return 0;
        }

        let leftover: Vec<(ItemId, HandlerEntry)> = self.handlers.drain().collect();
        for (item, entry) in &leftover {
            warn!(worker_id = %self.worker, item = %item, "Force aborting handler");
            entry.task.abort();
        }
        leftover.len()
    }

    fn start(&mut self, item: ItemId) {
        let cancel = CancellationToken::new();
        let generation = self.next_generation;
        self.next_generation += 1;

        let task = tokio::spawn({
            let handler = Arc::clone(&self.handler);
            let exit_tx = self.exit_tx.clone();
            let cancel = cancel.clone();
            let worker = self.worker;
            let item = item.clone();
            async move {
                handler.handle(worker, item.clone(), cancel).await;
                // The runtime may already be gone during shutdown.
                let _ = exit_tx.send((item, generation));
            }
        });

        info!(worker_id = %self.worker, item = %item, "Started handler");
        self.handlers.insert(
            item,
            HandlerEntry {
                cancel,
                state: HandlerState::Running,
                stopping_since: None,
                generation,
                task,
            },
        );
    }

    /// Signal cancellation. Returns false if the item has no running handler.
    fn cancel(&mut self, item: &ItemId) -> bool {
        let Some(entry) = self.handlers.get_mut(item) else {
            return false;
        };
        if entry.state == HandlerState::Stopping {
            return false;
        }

        entry.cancel.cancel();
        entry.state = HandlerState::Stopping;
        entry.stopping_since = Some(Instant::now());
        info!(worker_id = %self.worker, item = %item, "Cancelled handler");
        true
    }

    fn has_stopping(&self) -> bool {
        self.handlers
            .values()
            .any(|e| e.state == HandlerState::Stopping)
    }

    /// Remove the entries of handlers that have exited.
    ///
    /// Finished tasks are collected before the channel is drained: a task
    /// only finishes after sending its report, so a finished entry still
    /// present after the drain never reported (it panicked).
    fn collect_exits(&mut self) -> ExitCounts {
        let finished: Vec<(ItemId, u64)> = self
            .handlers
            .iter()
            .filter(|(_, e)| e.task.is_finished())
            .map(|(item, e)| (item.clone(), e.generation))
            .collect();

        let mut counts = ExitCounts::default();
        while let Ok((item, generation)) = self.exit_rx.try_recv() {
            if self.on_exit(&item, generation) {
                counts.reported += 1;
            }
        }

        for (item, generation) in finished {
            if self.handlers.get(&item).map(|e| e.generation) != Some(generation) {
                continue;
            }
            self.handlers.remove(&item);
            warn!(worker_id = %self.worker, item = %item, "Handler terminated without reporting");
            counts.unreported += 1;
        }

        counts
    }

    fn on_exit(&mut self, item: &ItemId, generation: u64) -> bool {
        // Reports from an aborted or replaced handler are ignored.
        if self.handlers.get(item).map(|e| e.generation) != Some(generation) {
            return false;
        }
        let Some(entry) = self.handlers.remove(item) else {
            return false;
        };

        match entry.state {
            HandlerState::Running => {
                warn!(worker_id = %self.worker, item = %item, "Handler exited while running");
            }
            HandlerState::Stopping => {
                debug!(worker_id = %self.worker, item = %item, "Handler stopped");
            }
        }
        true
    }

    fn abort_overdue(&mut self) -> usize {
        let timeout = self.config.stop_timeout;
        let overdue: Vec<ItemId> = self
            .handlers
            .iter()
            .filter(|(_, e)| e.stopping_since.is_some_and(|t| t.elapsed() >= timeout))
            .map(|(item, _)| item.clone())
            .collect();

        for item in &overdue {
            if let Some(entry) = self.handlers.remove(item) {
                warn!(
                    worker_id = %self.worker,
                    item = %item,
                    timeout_ms = timeout.as_millis() as u64,
                    "Force aborting handler"
                );
                entry.task.abort();
            }
        }
        overdue.len()
    }
}

impl Drop for WorkerRuntime {
    fn drop(&mut self) {
        for entry in self.handlers.values() {
            entry.cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::assignment::{AssignmentTable, InMemoryAssignmentStore, Move};
    use crate::handler::IdleHandler;

    fn item(s: &str) -> ItemId {
        ItemId::new(s).unwrap()
    }

    fn w(n: u64) -> WorkerId {
        WorkerId::new(n)
    }

    fn store_with(items: &[&str]) -> Arc<InMemoryAssignmentStore> {
        let table = AssignmentTable::new().with_worker(w(1), items.iter().map(|s| item(s)));
        Arc::new(InMemoryAssignmentStore::with_table(table))
    }

    struct StubbornHandler;

    #[async_trait]
    impl ItemHandler for StubbornHandler {
        async fn handle(&self, _: WorkerId, _: ItemId, _: CancellationToken) {
            std::future::pending::<()>().await;
        }
    }

    #[derive(Default)]
    struct ReturningHandler {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ItemHandler for ReturningHandler {
        async fn handle(&self, _: WorkerId, _: ItemId, _: CancellationToken) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_first_pass_starts_assigned_items() {
        let store = store_with(&["a", "b"]);
        let mut runtime = WorkerRuntime::new(w(1), store, Arc::new(IdleHandler), RuntimeConfig::default());

        let stats = runtime.reconcile().await.unwrap();
        assert_eq!(stats.started, 2);
        assert_eq!(stats.status, ConvergenceStatus::Converging);
        assert_eq!(runtime.running_items(), vec![item("a"), item("b")]);

        let stats = runtime.reconcile().await.unwrap();
        assert_eq!(stats.started, 0);
        assert_eq!(stats.status, ConvergenceStatus::Converged);
    }

    #[tokio::test]
    async fn test_lost_item_is_cancelled_and_removed() {
        let store = store_with(&["a"]);
        let mut runtime =
            WorkerRuntime::new(w(1), store.clone(), Arc::new(IdleHandler), RuntimeConfig::default());
        runtime.reconcile().await.unwrap();

        store
            .apply(&Move::Drop { item: item("a"), from: w(1) })
            .await
            .unwrap();
        let stats = runtime.reconcile().await.unwrap();
        assert_eq!(stats.cancelled, 1);
        assert_eq!(runtime.handler_state(&item("a")), Some(HandlerState::Stopping));

        assert!(runtime.settle(Duration::from_secs(1)).await);
        assert_eq!(runtime.handler_count(), 0);
    }

    #[tokio::test]
    async fn test_reassigned_while_stopping_waits_for_removal() {
        let store = Arc::new(InMemoryAssignmentStore::with_table(
            AssignmentTable::new().with_worker(w(1), vec![item("a")]),
        ));
        let config = RuntimeConfig {
            reconcile_interval: Duration::from_secs(1),
            stop_timeout: Duration::from_secs(60),
        };
        let mut runtime = WorkerRuntime::new(w(1), store.clone(), Arc::new(StubbornHandler), config);
        runtime.reconcile().await.unwrap();

        store
            .apply(&Move::Drop { item: item("a"), from: w(1) })
            .await
            .unwrap();
        runtime.reconcile().await.unwrap();
        store
            .apply(&Move::Assign { item: item("a"), to: w(1) })
            .await
            .unwrap();

        let stats = runtime.reconcile().await.unwrap();
        assert_eq!(stats.started, 0);
        assert_eq!(stats.status, ConvergenceStatus::Converging);
        assert_eq!(runtime.handler_state(&item("a")), Some(HandlerState::Stopping));
    }

    #[tokio::test]
    async fn test_returned_handler_is_restarted() {
        let store = store_with(&["a"]);
        let handler = Arc::new(ReturningHandler::default());
        let mut runtime =
            WorkerRuntime::new(w(1), store, handler.clone(), RuntimeConfig::default());

        runtime.reconcile().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let stats = runtime.reconcile().await.unwrap();
        assert_eq!(stats.removed, 1);
        assert_eq!(stats.started, 1);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
    }

    struct PanickingHandler;

    #[async_trait]
    impl ItemHandler for PanickingHandler {
        async fn handle(&self, _: WorkerId, item: ItemId, _: CancellationToken) {
            panic!("handler for {item} failed");
        }
    }

    #[tokio::test]
    async fn test_exit_report_is_counted_as_reported() {
        let store = store_with(&["a"]);
        let mut runtime = WorkerRuntime::new(
            w(1),
            store,
            Arc::new(ReturningHandler::default()),
            RuntimeConfig::default(),
        );
        runtime.reconcile().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(
            runtime.collect_exits(),
            ExitCounts {
                reported: 1,
                unreported: 0
            }
        );
        assert_eq!(runtime.handler_count(), 0);
    }

    #[tokio::test]
    async fn test_panicked_handler_is_counted_as_unreported() {
        let store = store_with(&["a"]);
        let mut runtime =
            WorkerRuntime::new(w(1), store, Arc::new(PanickingHandler), RuntimeConfig::default());
        runtime.reconcile().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(
            runtime.collect_exits(),
            ExitCounts {
                reported: 0,
                unreported: 1
            }
        );
        assert_eq!(runtime.handler_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stubborn_handler_is_aborted_after_timeout() {
        let store = store_with(&["a"]);
        let config = RuntimeConfig {
            reconcile_interval: Duration::from_secs(1),
            stop_timeout: Duration::from_secs(5),
        };
        let mut runtime = WorkerRuntime::new(w(1), store.clone(), Arc::new(StubbornHandler), config);
        runtime.reconcile().await.unwrap();

        store
            .apply(&Move::Drop { item: item("a"), from: w(1) })
            .await
            .unwrap();
        runtime.reconcile().await.unwrap();
        assert!(!runtime.settle(Duration::from_secs(1)).await);

        tokio::time::advance(Duration::from_secs(5)).await;
        let stats = runtime.reconcile().await.unwrap();
        assert_eq!(stats.aborted, 1);
        assert_eq!(runtime.handler_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_aborts_leftovers() {
        let store = store_with(&["a", "b"]);
        let config = RuntimeConfig {
            reconcile_interval: Duration::from_secs(1),
            stop_timeout: Duration::from_secs(2),
        };
        let mut runtime = WorkerRuntime::new(w(1), store, Arc::new(StubbornHandler), config);
        runtime.reconcile().await.unwrap();

        assert_eq!(runtime.stop().await, 2);
        assert_eq!(runtime.handler_count(), 0);
    }

    #[tokio::test]
    async fn test_run_stops_handlers_on_shutdown() {
        let store = store_with(&["a", "b"]);
        let config = RuntimeConfig {
            reconcile_interval: Duration::from_millis(10),
            stop_timeout: Duration::from_secs(1),
        };
        let runtime = WorkerRuntime::new(w(1), store, Arc::new(IdleHandler), config);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(runtime.run(shutdown_rx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown_tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
    }
}
