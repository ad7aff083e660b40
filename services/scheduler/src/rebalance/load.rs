//! Worker load ordering.
//!
//! `WorkerLoad` orders "lighter first":
//!
//! 1. fewer owned items first;
//! 2. on equal counts, the worker whose sorted item list compares
//!    lexicographically *greater* first;
//! 3. on identical lists, the smaller worker id first.
//!
//! Step 2 is plain lexicographic sequence comparison (a proper prefix is
//! smaller), reversed. Step 3 makes the order total, so every tie is broken
//! by content and the planner's output is reproducible.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use subdist_id::{ItemId, WorkerId};

/// A worker and the items it owns, sorted ascending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerLoad {
    worker: WorkerId,
    items: Vec<ItemId>,
}

impl WorkerLoad {
    pub fn new(worker: WorkerId, mut items: Vec<ItemId>) -> Self {
        items.sort();
        Self { worker, items }
    }

    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    pub fn items(&self) -> &[ItemId] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn insert(&mut self, item: ItemId) {
        if let Err(pos) = self.items.binary_search(&item) {
            self.items.insert(pos, item);
        }
    }

    fn pop_last(&mut self) -> Option<ItemId> {
        self.items.pop()
    }
}

impl Ord for WorkerLoad {
    fn cmp(&self, other: &Self) -> Ordering {
        self.items
            .len()
            .cmp(&other.items.len())
            .then_with(|| other.items.cmp(&self.items))
            .then_with(|| self.worker.cmp(&other.worker))
    }
}

impl PartialOrd for WorkerLoad {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// An item moved from the heaviest worker to the lightest one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transfer {
    pub item: ItemId,
    pub from: WorkerId,
    pub to: WorkerId,
}

/// Workers ordered by [`WorkerLoad`], re-ordered after every single change.
#[derive(Debug, Clone, Default)]
pub struct LoadQueue {
    loads: BTreeSet<WorkerLoad>,
}

impl LoadQueue {
    pub fn new(loads: impl IntoIterator<Item = WorkerLoad>) -> Self {
        Self {
            loads: loads.into_iter().collect(),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.loads.len()
    }

    pub fn total_items(&self) -> usize {
        self.loads.iter().map(WorkerLoad::len).sum()
    }

    /// The worker that would receive the next item.
    pub fn lightest(&self) -> Option<&WorkerLoad> {
        self.loads.first()
    }

    /// The worker that would give up the next item.
    pub fn heaviest(&self) -> Option<&WorkerLoad> {
        self.loads.last()
    }

    /// Workers in order, lightest first.
    pub fn iter(&self) -> impl Iterator<Item = &WorkerLoad> {
        self.loads.iter()
    }

    /// Give `item` to the lightest worker. Returns the receiving worker, or
    /// `None` if the queue is empty.
    pub fn assign(&mut self, item: ItemId) -> Option<WorkerId> {
        let mut lightest = self.loads.pop_first()?;
        lightest.insert(item);
        let worker = lightest.worker;
        self.loads.insert(lightest);
        Some(worker)
    }

    /// Move the heaviest worker's last item to the lightest worker.
    ///
    /// Does nothing and returns `None` unless the move strictly narrows the
    /// gap between the two (the donor owns at least two more items than the
    /// receiver).
    pub fn transfer_last(&mut self) -> Option<Transfer> {
        let (light, heavy) = (self.lightest()?, self.heaviest()?);
        if light.len() + 1 >= heavy.len() {
            return None;
        }

        let mut donor = self.loads.pop_last()?;
        let mut receiver = self.loads.pop_first()?;
        let item = donor.pop_last()?;
        receiver.insert(item.clone());

        let transfer = Transfer {
            item,
            from: donor.worker,
            to: receiver.worker,
        };
        self.loads.insert(donor);
        self.loads.insert(receiver);
        Some(transfer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn load(worker: u64, items: &[&str]) -> WorkerLoad {
        WorkerLoad::new(
            WorkerId::new(worker),
            items.iter().map(|s| ItemId::new(*s).unwrap()).collect(),
        )
    }

    #[rstest]
    #[case::fewer_items_first(load(1, &["a"]), load(2, &["a", "b"]), Ordering::Less)]
    #[case::greater_sequence_first(load(1, &["002"]), load(2, &["001"]), Ordering::Less)]
    #[case::smaller_sequence_last(load(1, &["001", "004"]), load(2, &["002", "003"]), Ordering::Greater)]
    #[case::first_mismatch_decides(load(1, &["a", "z"]), load(2, &["b", "c"]), Ordering::Greater)]
    #[case::identical_lists_by_worker(load(1, &["a"]), load(2, &["a"]), Ordering::Less)]
    #[case::empty_by_worker(load(3, &[]), load(2, &[]), Ordering::Greater)]
    fn test_load_order(#[case] a: WorkerLoad, #[case] b: WorkerLoad, #[case] expected: Ordering) {
        assert_eq!(a.cmp(&b), expected);
        assert_eq!(b.cmp(&a), expected.reverse());
    }

    #[test]
    fn test_assign_goes_to_lightest() {
        let mut queue = LoadQueue::new(vec![load(1, &["a", "b"]), load(2, &["c"])]);
        assert_eq!(queue.assign(ItemId::new("d").unwrap()), Some(WorkerId::new(2)));
        assert_eq!(queue.lightest().unwrap().len(), 2);
    }

    #[test]
    fn test_assign_alternates_like_documented_split() {
        let mut queue = LoadQueue::new(vec![load(1, &[]), load(2, &[])]);
        let owners: Vec<u64> = ["001", "002", "003", "004", "005", "006"]
            .iter()
            .map(|s| queue.assign(ItemId::new(*s).unwrap()).unwrap().value())
            .collect();
        assert_eq!(owners, vec![1, 2, 2, 1, 2, 1]);
    }

    #[test]
    fn test_assign_empty_queue() {
        let mut queue = LoadQueue::default();
        assert_eq!(queue.assign(ItemId::new("a").unwrap()), None);
    }

    #[test]
    fn test_transfer_last_moves_greatest_item() {
        let mut queue = LoadQueue::new(vec![load(1, &["a", "b", "c"]), load(2, &[])]);
        let transfer = queue.transfer_last().unwrap();
        assert_eq!(transfer.item.as_str(), "c");
        assert_eq!(transfer.from, WorkerId::new(1));
        assert_eq!(transfer.to, WorkerId::new(2));
        assert_eq!(queue.total_items(), 3);
    }

    #[test]
    fn test_transfer_last_refuses_when_balanced() {
        let mut queue = LoadQueue::new(vec![load(1, &["a", "b"]), load(2, &["c"])]);
        assert_eq!(queue.transfer_last(), None);
    }

    #[test]
    fn test_single_worker_never_transfers() {
        let mut queue = LoadQueue::new(vec![load(1, &["a", "b", "c"])]);
        assert_eq!(queue.transfer_last(), None);
    }
}
