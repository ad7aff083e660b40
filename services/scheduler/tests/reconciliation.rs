//! Worker runtime reconciliation against a shared assignment table.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use subdist_scheduler::{
    AssignmentStore, AssignmentTable, HandlerState, InMemoryAssignmentStore, ItemHandler, ItemId,
    Move, RuntimeConfig, WorkerId, WorkerRuntime,
};
use tokio_util::sync::CancellationToken;

fn item(s: &str) -> ItemId {
    ItemId::new(s).unwrap()
}

const W: WorkerId = WorkerId::new(1);

#[derive(Default)]
struct RecordingHandler {
    events: Mutex<Vec<String>>,
}

impl RecordingHandler {
    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn record(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }
}

#[async_trait]
impl ItemHandler for RecordingHandler {
    async fn handle(&self, _worker: WorkerId, item: ItemId, cancel: CancellationToken) {
        self.record(format!("start {item}"));
        cancel.cancelled().await;
        self.record(format!("stop {item}"));
    }
}

#[tokio::test]
async fn test_swap_one_item() {
    let store = Arc::new(InMemoryAssignmentStore::with_table(
        AssignmentTable::new().with_worker(W, vec![item("A"), item("B")]),
    ));
    let handler = Arc::new(RecordingHandler::default());
    let mut runtime = WorkerRuntime::new(W, store.clone(), handler.clone(), RuntimeConfig::default());

    runtime.reconcile().await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(runtime.running_items(), vec![item("A"), item("B")]);

    store
        .apply(&Move::Drop { item: item("A"), from: W })
        .await
        .unwrap();
    store
        .apply(&Move::Assign { item: item("C"), to: W })
        .await
        .unwrap();

    let stats = runtime.reconcile().await.unwrap();
    assert_eq!((stats.started, stats.cancelled), (1, 1));
    assert_eq!(runtime.handler_state(&item("A")), Some(HandlerState::Stopping));

    assert!(runtime.settle(Duration::from_secs(1)).await);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(runtime.running_items(), vec![item("B"), item("C")]);
    assert_eq!(runtime.handler_state(&item("A")), None);

    let mut events = handler.events();
    events.sort();
    assert_eq!(events, vec!["start A", "start B", "start C", "stop A"]);

    let stats = runtime.reconcile().await.unwrap();
    assert!(stats.status.is_converged());

    assert_eq!(runtime.stop().await, 0);
    let stops = handler.events().into_iter().filter(|e| e.starts_with("stop")).count();
    assert_eq!(stops, 3);
}

#[tokio::test]
async fn test_item_moved_between_workers() {
    let w2 = WorkerId::new(2);
    let store = Arc::new(InMemoryAssignmentStore::with_table(
        AssignmentTable::new()
            .with_worker(W, vec![item("A")])
            .with_worker(w2, vec![]),
    ));
    let handler = Arc::new(RecordingHandler::default());
    let mut first = WorkerRuntime::new(W, store.clone(), handler.clone(), RuntimeConfig::default());
    let mut second = WorkerRuntime::new(w2, store.clone(), handler.clone(), RuntimeConfig::default());

    first.reconcile().await.unwrap();
    second.reconcile().await.unwrap();
    assert_eq!(first.running_items(), vec![item("A")]);
    assert!(second.running_items().is_empty());

    store
        .apply(&Move::Transfer { item: item("A"), from: W, to: w2 })
        .await
        .unwrap();
    first.reconcile().await.unwrap();
    second.reconcile().await.unwrap();

    assert!(first.settle(Duration::from_secs(1)).await);
    assert_eq!(first.handler_count(), 0);
    assert_eq!(second.running_items(), vec![item("A")]);
    assert_eq!(store.snapshot().await.unwrap().owner_of(&item("A")), Some(w2));

    second.stop().await;
}
