//! Per-replica contiguous high-water marks.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::id::{OperationId, ReplicaId};

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0100_0000_01b3;

/// Summary of which operations a replica has integrated.
///
/// An entry `replica → c` means every counter `1..=c` of that replica is
/// present. Entries never decrease.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateVector {
    entries: BTreeMap<ReplicaId, u64>,
}

impl StateVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest contiguous counter seen for `replica` (0 = nothing).
    pub fn get(&self, replica: &ReplicaId) -> u64 {
        self.entries.get(replica).copied().unwrap_or(0)
    }

    /// Raise the mark for `replica` to `counter`. Lower values are ignored.
    pub fn advance(&mut self, replica: ReplicaId, counter: u64) {
        if counter == 0 {
            return;
        }
        let entry = self.entries.entry(replica).or_insert(0);
        if counter > *entry {
            *entry = counter;
        }
    }

    pub fn covers(&self, id: &OperationId) -> bool {
        id.counter <= self.get(&id.replica)
    }

    /// Entry-wise maximum.
    pub fn merge(&mut self, other: &StateVector) {
        for (replica, counter) in other.iter() {
            self.advance(*replica, counter);
        }
    }

    /// True when every entry of `other` is covered by `self`.
    pub fn dominates(&self, other: &StateVector) -> bool {
        other.iter().all(|(replica, counter)| self.get(replica) >= counter)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ReplicaId, u64)> {
        self.entries.iter().map(|(replica, counter)| (replica, *counter))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sum of all marks; the number of counters covered.
    pub fn total(&self) -> u64 {
        self.entries.values().fold(0u64, |acc, c| acc.saturating_add(*c))
    }

    /// Stable FNV-1a hash over the sorted entries.
    ///
    /// Two replicas with equal vectors produce equal digests on any platform.
    pub fn digest(&self) -> u64 {
        let mut hash = FNV_OFFSET;
        for (replica, counter) in &self.entries {
            for byte in replica.as_uuid().as_bytes().iter().chain(counter.to_be_bytes().iter()) {
                hash ^= *byte as u64;
                hash = hash.wrapping_mul(FNV_PRIME);
            }
        }
        hash
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advance_is_monotonic() {
        let r = ReplicaId::random();
        let mut sv = StateVector::new();
        sv.advance(r, 5);
        sv.advance(r, 3);
        assert_eq!(sv.get(&r), 5);
        sv.advance(r, 9);
        assert_eq!(sv.get(&r), 9);
    }

    #[test]
    fn test_unknown_replica_is_zero() {
        let sv = StateVector::new();
        assert_eq!(sv.get(&ReplicaId::random()), 0);
        assert!(sv.is_empty());
    }

    #[test]
    fn test_advance_zero_creates_nothing() {
        let mut sv = StateVector::new();
        sv.advance(ReplicaId::random(), 0);
        assert!(sv.is_empty());
    }

    #[test]
    fn test_covers() {
        let r = ReplicaId::random();
        let mut sv = StateVector::new();
        sv.advance(r, 4);
        assert!(sv.covers(&OperationId::new(r, 4)));
        assert!(!sv.covers(&OperationId::new(r, 5)));
        assert!(!sv.covers(&OperationId::new(ReplicaId::random(), 1)));
    }

    #[test]
    fn test_merge_and_dominates() {
        let a = ReplicaId::random();
        let b = ReplicaId::random();

        let mut left = StateVector::new();
        left.advance(a, 3);
        let mut right = StateVector::new();
        right.advance(a, 1);
        right.advance(b, 7);

        assert!(!left.dominates(&right));
        left.merge(&right);
        assert_eq!(left.get(&a), 3);
        assert_eq!(left.get(&b), 7);
        assert!(left.dominates(&right));
        assert_eq!(left.total(), 10);
    }

    #[test]
    fn test_digest_matches_for_equal_vectors() {
        let a = ReplicaId::random();
        let b = ReplicaId::random();

        let mut first = StateVector::new();
        first.advance(a, 2);
        first.advance(b, 9);
        let mut second = StateVector::new();
        second.advance(b, 9);
        second.advance(a, 2);

        assert_eq!(first.digest(), second.digest());

        second.advance(a, 3);
        assert_ne!(first.digest(), second.digest());
    }

    #[test]
    fn test_empty_digest_is_offset_basis() {
        assert_eq!(StateVector::new().digest(), FNV_OFFSET);
    }
}
