//! Rebalance planning.
//!
//! The planner is a pure function of the current assignment table and the
//! registry snapshot. It returns the ordered list of single-item moves that
//! takes the table to a state where:
//!
//! - every registered item has exactly one owner;
//! - every registered worker owns between `avg` and `avg + 1` items, where
//!   `avg = total_items / worker_count`;
//! - no item moved that did not have to.
//!
//! Moves are emitted in phases: membership changes (workers added or removed,
//! deregistered items dropped), then assignment of unowned items, then
//! shedding from overloaded workers, then filling underloaded ones. Within
//! each phase every decision reads the [`LoadQueue`] as updated by the
//! previous move.

use std::collections::{HashMap, HashSet};

use subdist_id::{ItemId, WorkerId};

use super::load::{LoadQueue, WorkerLoad};
use crate::assignment::{AssignmentTable, Move};
use crate::error::{SchedulerError, SchedulerResult};
use crate::registry::MembershipSnapshot;

/// Counts of moves in a plan, by phase.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RebalanceStats {
    pub workers_added: usize,
    pub workers_removed: usize,
    pub items_dropped: usize,
    pub items_assigned: usize,
    pub items_shed: usize,
    pub items_filled: usize,
}

impl RebalanceStats {
    /// Item moves that change which worker handles an item.
    pub fn item_moves(&self) -> usize {
        self.items_dropped + self.items_assigned + self.items_shed + self.items_filled
    }
}

/// The outcome of planning one rebalance tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RebalancePlan {
    moves: Vec<Move>,
    stats: RebalanceStats,
    avg: usize,
}

impl RebalancePlan {
    pub fn moves(&self) -> &[Move] {
        &self.moves
    }

    pub fn stats(&self) -> RebalanceStats {
        self.stats
    }

    /// The equilibrium load: every worker ends with `avg` or `avg + 1` items.
    pub fn avg(&self) -> usize {
        self.avg
    }

    pub fn is_empty(&self) -> bool {
        self.moves.is_empty()
    }
}

/// Plan the moves for one rebalance tick.
///
/// Returns [`SchedulerError::NoWorkers`] when no worker is registered; the
/// caller skips the tick.
pub fn plan_rebalance(
    table: &AssignmentTable,
    membership: &MembershipSnapshot,
) -> SchedulerResult<RebalancePlan> {
    if membership.workers.is_empty() {
        return Err(SchedulerError::NoWorkers);
    }

    let mut plan = RebalancePlan::default();
    let registered: HashSet<&ItemId> = membership.items.iter().collect();

    // Membership changes.
    for worker in table.workers() {
        if !membership.workers.contains(&worker) {
            plan.push(Move::RemoveWorker { worker });
            plan.stats.workers_removed += 1;
        }
    }
    for &worker in &membership.workers {
        if !table.contains_worker(worker) {
            plan.push(Move::AddWorker { worker });
            plan.stats.workers_added += 1;
        }
    }

    // Working copy of live owners plus the reverse index item -> owner.
    let mut owner_of: HashMap<&ItemId, WorkerId> = HashMap::new();
    let mut loads = Vec::with_capacity(membership.workers.len());
    for &worker in &membership.workers {
        let mut kept = Vec::new();
        for item in sorted(table.items_for(worker)) {
            if !registered.contains(item) || owner_of.contains_key(item) {
                // Deregistered, or a second copy under this or another worker.
                plan.push(Move::Drop {
                    item: item.clone(),
                    from: worker,
                });
                plan.stats.items_dropped += 1;
                continue;
            }
            owner_of.insert(item, worker);
            kept.push(item.clone());
        }
        loads.push(WorkerLoad::new(worker, kept));
    }
    let mut queue = LoadQueue::new(loads);

    // Assign unowned items in registration order.
    for item in &membership.items {
        if owner_of.contains_key(item) {
            continue;
        }
        if let Some(to) = queue.assign(item.clone()) {
            owner_of.insert(item, to);
            plan.push(Move::Assign {
                item: item.clone(),
                to,
            });
            plan.stats.items_assigned += 1;
        }
    }

    plan.avg = queue.total_items() / queue.worker_count();
    let avg = plan.avg;

    // Shed: nobody keeps more than avg + 1.
    while queue.heaviest().is_some_and(|w| w.len() > avg + 1) {
        let Some(t) = queue.transfer_last() else { break };
        plan.push(Move::Transfer {
            item: t.item,
            from: t.from,
            to: t.to,
        });
        plan.stats.items_shed += 1;
    }

    // Fill: nobody keeps fewer than avg.
    while queue.lightest().is_some_and(|w| w.len() < avg) {
        let Some(t) = queue.transfer_last() else { break };
        plan.push(Move::Transfer {
            item: t.item,
            from: t.from,
            to: t.to,
        });
        plan.stats.items_filled += 1;
    }

    Ok(plan)
}

impl RebalancePlan {
    fn push(&mut self, mv: Move) {
        self.moves.push(mv);
    }
}

/// Items in ascending order, without assuming the source keeps them sorted.
/// Repeats are kept so the caller can drop them.
fn sorted(items: &[ItemId]) -> Vec<&ItemId> {
    let mut sorted: Vec<&ItemId> = items.iter().collect();
    sorted.sort();
    sorted
}
