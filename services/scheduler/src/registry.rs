//! Membership registry: which work items exist and which workers are alive.
//!
//! The in-memory implementation stands in for a coordination service. Items
//! and workers live behind one lock so a snapshot never mixes two states.

use std::collections::{BTreeSet, HashSet};

use async_trait::async_trait;
use subdist_id::{ItemId, WorkerId};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::SchedulerResult;

/// A consistent copy of the registry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MembershipSnapshot {
    /// Registered items, in registration order.
    pub items: Vec<ItemId>,

    /// Registered workers.
    pub workers: BTreeSet<WorkerId>,
}

impl MembershipSnapshot {
    /// Build a snapshot directly (used by tests and offline planning).
    pub fn new(
        items: impl IntoIterator<Item = ItemId>,
        workers: impl IntoIterator<Item = WorkerId>,
    ) -> Self {
        Self {
            items: items.into_iter().collect(),
            workers: workers.into_iter().collect(),
        }
    }
}

/// Membership registry capability.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Register a work item. Returns false if it was already registered.
    async fn register_work_item(&self, item: ItemId) -> SchedulerResult<bool>;

    /// Deregister a work item. Returns false if it was not registered.
    async fn deregister_work_item(&self, item: &ItemId) -> SchedulerResult<bool>;

    /// Register a worker. Returns false if it was already registered.
    async fn register_worker(&self, worker: WorkerId) -> SchedulerResult<bool>;

    /// Deregister a worker. Returns false if it was not registered.
    async fn deregister_worker(&self, worker: WorkerId) -> SchedulerResult<bool>;

    /// A consistent copy of the current membership.
    async fn snapshot(&self) -> SchedulerResult<MembershipSnapshot>;
}

#[derive(Default)]
struct Membership {
    items: Vec<ItemId>,
    known: HashSet<ItemId>,
    workers: BTreeSet<WorkerId>,
}

/// In-process registry.
#[derive(Default)]
pub struct InMemoryRegistry {
    inner: Mutex<Membership>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Registry for InMemoryRegistry {
    async fn register_work_item(&self, item: ItemId) -> SchedulerResult<bool> {
        let mut inner = self.inner.lock().await;
        if !inner.known.insert(item.clone()) {
            debug!(item = %item, "Work item already registered");
            return Ok(false);
        }
        debug!(item = %item, "Registered work item");
        inner.items.push(item);
        Ok(true)
    }

    async fn deregister_work_item(&self, item: &ItemId) -> SchedulerResult<bool> {
        let mut inner = self.inner.lock().await;
        if !inner.known.remove(item) {
            return Ok(false);
        }
        inner.items.retain(|i| i != item);
        info!(item = %item, "Deregistered work item");
        Ok(true)
    }

    async fn register_worker(&self, worker: WorkerId) -> SchedulerResult<bool> {
        let added = self.inner.lock().await.workers.insert(worker);
        if added {
            info!(worker_id = %worker, "Registered worker");
        }
        Ok(added)
    }

    async fn deregister_worker(&self, worker: WorkerId) -> SchedulerResult<bool> {
        let removed = self.inner.lock().await.workers.remove(&worker);
        if removed {
            info!(worker_id = %worker, "Deregistered worker");
        }
        Ok(removed)
    }

    async fn snapshot(&self) -> SchedulerResult<MembershipSnapshot> {
        let inner = self.inner.lock().await;
        Ok(MembershipSnapshot {
            items: inner.items.clone(),
            workers: inner.workers.clone(),
        })
    }
}
