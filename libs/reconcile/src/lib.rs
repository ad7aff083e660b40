//! Reconciliation loop primitives.
//!
//! This library provides helpers for implementing reconciliation loops
//! that converge current state to desired state. Key concepts:
//!
//! - **Desired state**: What a worker should be running (its slice of the
//!   assignment table).
//! - **Current state**: What the worker is actually running (its local
//!   handler map).
//! - **Convergence**: The process of making current match desired.
//!
//! # Invariants
//!
//! - All operations are idempotent
//! - Decisions are deterministic given the same inputs

use std::collections::BTreeSet;
use std::fmt::Display;
use std::time::Duration;

use sha2::{Digest, Sha256};

/// Convergence status for a reconciled resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvergenceStatus {
    /// Current matches desired.
    Converged,

    /// Current is moving toward desired (starts or stops still in flight).
    Converging,
}

impl ConvergenceStatus {
    /// Returns true if the resource has converged.
    pub fn is_converged(&self) -> bool {
        matches!(self, Self::Converged)
    }

    /// Returns true if the resource is still converging.
    pub fn is_converging(&self) -> bool {
        matches!(self, Self::Converging)
    }
}

/// Difference between a desired set and a current set.
///
/// Both vectors are sorted ascending, so callers act on them in a
/// reproducible order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetDiff<T> {
    /// Present in desired, missing from current.
    pub to_start: Vec<T>,

    /// Present in current, missing from desired.
    pub to_stop: Vec<T>,
}

impl<T: Ord + Clone> SetDiff<T> {
    /// Compute the diff between `desired` and `current`.
    pub fn between<'a, D, C>(desired: D, current: C) -> Self
    where
        T: 'a,
        D: IntoIterator<Item = &'a T>,
        C: IntoIterator<Item = &'a T>,
    {
        let desired: BTreeSet<&T> = desired.into_iter().collect();
        let current: BTreeSet<&T> = current.into_iter().collect();

        Self {
            to_start: desired.difference(&current).map(|t| (*t).clone()).collect(),
            to_stop: current.difference(&desired).map(|t| (*t).clone()).collect(),
        }
    }

    /// Returns true if nothing needs to start or stop.
    pub fn is_empty(&self) -> bool {
        self.to_start.is_empty() && self.to_stop.is_empty()
    }

    /// Convergence status implied by this diff.
    pub fn status(&self) -> ConvergenceStatus {
        if self.is_empty() {
            ConvergenceStatus::Converged
        } else {
            ConvergenceStatus::Converging
        }
    }
}

/// A digest of an assignment table for cheap change detection.
///
/// Two tables with the same owners and the same owned items in the same
/// order produce the same digest.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TableDigest(String);

impl TableDigest {
    /// Compute a digest over `(owner, items)` entries, in iteration order.
    pub fn compute<O, I, V>(entries: impl IntoIterator<Item = (O, I)>) -> Self
    where
        O: Display,
        I: IntoIterator<Item = V>,
        V: Display,
    {
        let mut hasher = Sha256::new();
        for (owner, items) in entries {
            hasher.update(owner.to_string().as_bytes());
            hasher.update(b"=");
            for item in items {
                hasher.update(item.to_string().as_bytes());
                hasher.update(b"\0");
            }
            hasher.update(b"\n");
        }
        let result = hasher.finalize();
        Self(format!("sha256:{}", hex::encode(&result[..16]))) // First 16 bytes (128 bits)
    }

    /// Get the digest string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TableDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Default reconciliation interval for worker runtimes.
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(1);

/// Default rebalance interval for the master.
pub const DEFAULT_REBALANCE_INTERVAL: Duration = Duration::from_secs(1);

/// Default time a cancelled handler gets before it is force-aborted.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(30);
