//! Append-only log of integrated operations.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::id::{OperationId, ReplicaId};
use crate::operation::Operation;
use crate::state_vector::StateVector;

/// Every operation integrated by a replica, in integration order.
///
/// Integration order is causally safe: an operation is only logged after
/// everything it depends on, so replaying a suffix of the log on a peer that
/// holds the prefix never needs buffering.
#[derive(Debug, Clone, Default)]
pub struct OpLog {
    operations: Vec<Operation>,
    seen: HashSet<OperationId>,
    state_vector: StateVector,
    /// Counter ranges (start → end, inclusive) integrated past a gap.
    ahead: HashMap<ReplicaId, BTreeMap<u64, u64>>,
}

impl OpLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: &OperationId) -> bool {
        self.seen.contains(id)
    }

    /// Append an integrated operation. Returns false for a duplicate.
    pub fn append(&mut self, operation: Operation) -> bool {
        let id = operation.id();
        if !self.seen.insert(id) {
            return false;
        }
        self.advance(id.replica, id.counter, operation.last_counter());
        self.operations.push(operation);
        true
    }

    fn advance(&mut self, replica: ReplicaId, first: u64, last: u64) {
        let current = self.state_vector.get(&replica);
        if last <= current {
            return;
        }
        if first > current.saturating_add(1) {
            self.ahead.entry(replica).or_default().insert(first, last);
            return;
        }

        self.state_vector.advance(replica, last);
        let Some(ranges) = self.ahead.get_mut(&replica) else {
            return;
        };
        loop {
            let Some((start, end)) = ranges.first_key_value().map(|(s, e)| (*s, *e)) else {
                break;
            };
            let mark = self.state_vector.get(&replica);
            if start > mark.saturating_add(1) {
                break;
            }
            ranges.remove(&start);
            self.state_vector.advance(replica, end);
        }
        if ranges.is_empty() {
            self.ahead.remove(&replica);
        }
    }

    pub fn state_vector(&self) -> &StateVector {
        &self.state_vector
    }

    /// Whether some counters were integrated past a gap that is still open.
    pub fn has_gaps(&self) -> bool {
        !self.ahead.is_empty()
    }

    /// Operations the holder of `peer` has not integrated, in log order.
    pub fn delta_since(&self, peer: &StateVector) -> Vec<Operation> {
        self.operations
            .iter()
            .filter(|op| op.last_counter() > peer.get(&op.replica()))
            .cloned()
            .collect()
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}
