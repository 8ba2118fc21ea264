//! Causal buffer for remote operations that arrived before their
//! dependencies.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use crate::id::OperationId;
use crate::operation::Operation;

/// A buffered operation and the time it first entered the buffer.
#[derive(Debug, Clone)]
pub struct PendingOperation {
    pub operation: Operation,
    pub buffered_at: Instant,
}

/// Operations waiting on a missing element, keyed by that element's id.
///
/// Entries never expire on their own; the owning replica checks
/// [`CausalBuffer::len`] and [`CausalBuffer::oldest_age`] against its bounds.
#[derive(Debug, Default)]
pub struct CausalBuffer {
    waiting: HashMap<OperationId, Vec<PendingOperation>>,
    buffered: HashSet<OperationId>,
}

impl CausalBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer `operation` until `missing` arrives. Returns false if the
    /// operation is already buffered.
    pub fn insert(&mut self, missing: OperationId, operation: Operation, now: Instant) -> bool {
        self.park(missing, PendingOperation { operation, buffered_at: now })
    }

    /// Re-buffer a released operation under another missing dependency,
    /// keeping its original arrival time.
    pub fn park(&mut self, missing: OperationId, pending: PendingOperation) -> bool {
        if !self.buffered.insert(pending.operation.id()) {
            return false;
        }
        self.waiting.entry(missing).or_default().push(pending);
        true
    }

    /// Remove and return everything waiting on `dependency`, in arrival order.
    pub fn take_waiting(&mut self, dependency: &OperationId) -> Vec<PendingOperation> {
        let released = self.waiting.remove(dependency).unwrap_or_default();
        for pending in &released {
            self.buffered.remove(&pending.operation.id());
        }
        released
    }

    pub fn contains(&self, id: &OperationId) -> bool {
        self.buffered.contains(id)
    }

    pub fn len(&self) -> usize {
        self.buffered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffered.is_empty()
    }

    /// Age of the longest-waiting entry.
    pub fn oldest_age(&self, now: Instant) -> Option<Duration> {
        self.waiting
            .values()
            .flatten()
            .map(|p| now.saturating_duration_since(p.buffered_at))
            .max()
    }

    /// Drop everything. Returns how many operations were discarded.
    pub fn clear(&mut self) -> usize {
        let dropped = self.buffered.len();
        self.waiting.clear();
        self.buffered.clear();
        dropped
    }
}
