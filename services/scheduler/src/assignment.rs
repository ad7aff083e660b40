//! Assignment table and the store that guards it.
//!
//! The assignment table maps each worker to the items it owns. It is written
//! only by the rebalancing engine running on the master, one [`Move`] at a
//! time, and read by every worker runtime.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use subdist_id::{ItemId, WorkerId};
use subdist_reconcile::TableDigest;
use tokio::sync::RwLock;

use crate::error::{SchedulerError, SchedulerResult};

/// A single change to the assignment table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Move {
    /// Give a registered worker an (empty) entry.
    AddWorker { worker: WorkerId },

    /// Remove a deregistered worker and release everything it owned.
    RemoveWorker { worker: WorkerId },

    /// Remove an item that is no longer registered.
    Drop { item: ItemId, from: WorkerId },

    /// Give an unowned item to a worker.
    Assign { item: ItemId, to: WorkerId },

    /// Move an owned item between workers.
    Transfer {
        item: ItemId,
        from: WorkerId,
        to: WorkerId,
    },
}

/// Mapping from worker to the items it owns.
///
/// Each worker's items are kept in ascending order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AssignmentTable {
    owners: BTreeMap<WorkerId, Vec<ItemId>>,
}

impl AssignmentTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder used by tests and seeding: add a worker owning `items`.
    /// Repeated items are kept once.
    #[must_use]
    pub fn with_worker(mut self, worker: WorkerId, items: impl IntoIterator<Item = ItemId>) -> Self {
        let mut items: Vec<ItemId> = items.into_iter().collect();
        items.sort();
        items.dedup();
        self.owners.insert(worker, items);
        self
    }

    /// Workers with an entry, ascending.
    pub fn workers(&self) -> impl Iterator<Item = WorkerId> + '_ {
        self.owners.keys().copied()
    }

    /// `(worker, items)` entries, ascending by worker.
    pub fn entries(&self) -> impl Iterator<Item = (WorkerId, &[ItemId])> + '_ {
        self.owners.iter().map(|(w, items)| (*w, items.as_slice()))
    }

    /// Items owned by `worker`; empty if the worker has no entry.
    pub fn items_for(&self, worker: WorkerId) -> &[ItemId] {
        self.owners.get(&worker).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn contains_worker(&self, worker: WorkerId) -> bool {
        self.owners.contains_key(&worker)
    }

    /// The worker owning `item`, if any.
    pub fn owner_of(&self, item: &ItemId) -> Option<WorkerId> {
        self.owners
            .iter()
            .find(|(_, items)| items.binary_search(item).is_ok())
            .map(|(w, _)| *w)
    }

    pub fn worker_count(&self) -> usize {
        self.owners.len()
    }

    /// Total owned items across all workers.
    pub fn total_items(&self) -> usize {
        self.owners.values().map(Vec::len).sum()
    }

    /// Item count per worker.
    pub fn loads(&self) -> BTreeMap<WorkerId, usize> {
        self.owners.iter().map(|(w, items)| (*w, items.len())).collect()
    }

    /// Digest for change detection.
    pub fn digest(&self) -> TableDigest {
        TableDigest::compute(self.entries())
    }

    /// Apply a single move.
    ///
    /// Item moves are checked against the current table; a move that no
    /// longer fits (item already owned, missing source, unknown worker) is
    /// rejected without modifying the table.
    pub fn apply(&mut self, mv: &Move) -> SchedulerResult<()> {
        match mv {
            Move::AddWorker { worker } => {
                self.owners.entry(*worker).or_default();
            }
            Move::RemoveWorker { worker } => {
                self.owners.remove(worker);
            }
            Move::Drop { item, from } => {
                self.remove_item(item, *from)?;
            }
            Move::Assign { item, to } => {
                if let Some(owner) = self.owner_of(item) {
                    return Err(SchedulerError::StaleMove(format!(
                        "item {item} already owned by worker {owner}"
                    )));
                }
                self.insert_item(item.clone(), *to)?;
            }
            Move::Transfer { item, from, to } => {
                if !self.owners.contains_key(to) {
                    return Err(SchedulerError::StaleMove(format!("unknown worker {to}")));
                }
                self.remove_item(item, *from)?;
                self.insert_item(item.clone(), *to)?;
            }
        }
        Ok(())
    }

    fn remove_item(&mut self, item: &ItemId, from: WorkerId) -> SchedulerResult<()> {
        let items = self
            .owners
            .get_mut(&from)
            .ok_or_else(|| SchedulerError::StaleMove(format!("unknown worker {from}")))?;
        let pos = items.binary_search(item).map_err(|_| {
            SchedulerError::StaleMove(format!("item {item} not owned by worker {from}"))
        })?;
        items.remove(pos);
        Ok(())
    }

    fn insert_item(&mut self, item: ItemId, to: WorkerId) -> SchedulerResult<()> {
        let items = self
            .owners
            .get_mut(&to)
            .ok_or_else(|| SchedulerError::StaleMove(format!("unknown worker {to}")))?;
        if let Err(pos) = items.binary_search(&item) {
            items.insert(pos, item);
        }
        Ok(())
    }
}

/// Shared access to the assignment table.
///
/// Every call is a single logical operation under the store's own lock.
#[async_trait]
pub trait AssignmentStore: Send + Sync {
    /// A consistent copy of the whole table.
    async fn snapshot(&self) -> SchedulerResult<AssignmentTable>;

    /// The items currently assigned to `worker`.
    async fn items_for(&self, worker: WorkerId) -> SchedulerResult<Vec<ItemId>>;

    /// Apply one move atomically.
    async fn apply(&self, mv: &Move) -> SchedulerResult<()>;
}

/// In-process assignment store.
#[derive(Default)]
pub struct InMemoryAssignmentStore {
    table: RwLock<AssignmentTable>,
}

impl InMemoryAssignmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store seeded with an existing table.
    pub fn with_table(table: AssignmentTable) -> Self {
        Self {
            table: RwLock::new(table),
        }
    }
}

#[async_trait]
impl AssignmentStore for InMemoryAssignmentStore {
    async fn snapshot(&self) -> SchedulerResult<AssignmentTable> {
        Ok(self.table.read().await.clone())
    }

    async fn items_for(&self, worker: WorkerId) -> SchedulerResult<Vec<ItemId>> {
        Ok(self.table.read().await.items_for(worker).to_vec())
    }

    async fn apply(&self, mv: &Move) -> SchedulerResult<()> {
        self.table.write().await.apply(mv)
    }
}
