//! Operation identifiers.
//!
//! Every replica owns a random 128-bit [`ReplicaId`] chosen when it joins a
//! session, and a counter that only ever moves forward. The pair forms an
//! [`OperationId`]. No coordination between replicas is needed to mint ids.
//!
//! ```text
//! ReplicaId (uuid v4)      counter (u64, starts at 1)
//! ┌──────────────────┐     ┌─────┐
//! │ 7f3a…e21c        │  +  │  42 │   =>  OperationId 7f3a9b10:42
//! └──────────────────┘     └─────┘
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::CoreError;

/// Stable identity of one replica for the lifetime of a session.
///
/// The derived ordering (uuid byte order) is the replica tie-break used by
/// the text CRDT, so it must stay identical on every replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReplicaId(Uuid);

impl ReplicaId {
    /// Fresh random identity.
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }

    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let simple = self.0.simple().to_string();
        write!(f, "{}", &simple[..8])
    }
}

/// Identity of a single operation (and of every character it inserts).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OperationId {
    pub replica: ReplicaId,
    pub counter: u64,
}

impl OperationId {
    pub fn new(replica: ReplicaId, counter: u64) -> Self {
        Self { replica, counter }
    }

    /// The id `n` counters further along the same replica, if representable.
    pub fn offset(&self, n: u64) -> Option<OperationId> {
        self.counter
            .checked_add(n)
            .map(|counter| OperationId::new(self.replica, counter))
    }

    /// Ids minted by a real replica are never nil and never use counter 0.
    pub fn is_well_formed(&self) -> bool {
        !self.replica.is_nil() && self.counter > 0
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.replica, self.counter)
    }
}

/// Mints strictly increasing operation ids for one replica.
///
/// Once the counter space is exhausted the generator stays failed: every
/// later call reports [`CoreError::CounterOverflow`].
#[derive(Debug, Clone)]
pub struct IdGenerator {
    replica: ReplicaId,
    /// Last counter handed out (0 = none yet).
    last: u64,
    exhausted: bool,
}

impl IdGenerator {
    pub fn new(replica: ReplicaId) -> Self {
        Self::resume(replica, 0)
    }

    /// Continue after `last_counter`, e.g. when restoring from a snapshot
    /// that already holds operations from this replica.
    pub fn resume(replica: ReplicaId, last_counter: u64) -> Self {
        Self {
            replica,
            last: last_counter,
            exhausted: false,
        }
    }

    pub fn next_id(&mut self) -> Result<OperationId, CoreError> {
        self.reserve(1)
    }

    /// Reserve `n` consecutive counters and return the first id of the run.
    pub fn reserve(&mut self, n: u64) -> Result<OperationId, CoreError> {
        debug_assert!(n > 0, "reserve(0) mints nothing");
        if self.exhausted {
            return Err(CoreError::CounterOverflow { replica: self.replica });
        }

        match (self.last.checked_add(1), self.last.checked_add(n)) {
            (Some(first), Some(end)) => {
                self.last = end;
                Ok(OperationId::new(self.replica, first))
            }
            _ => {
                self.exhausted = true;
                log::error!(
                    "Replica {} exhausted its operation counter at {}",
                    self.replica,
                    self.last
                );
                Err(CoreError::CounterOverflow { replica: self.replica })
            }
        }
    }

    pub fn replica(&self) -> ReplicaId {
        self.replica
    }

    pub fn last_counter(&self) -> u64 {
        self.last
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_id_strictly_increasing() {
        let replica = ReplicaId::random();
        let mut ids = IdGenerator::new(replica);

        let a = ids.next_id().unwrap();
        let b = ids.next_id().unwrap();
        assert_eq!(a.counter, 1);
        assert_eq!(b.counter, 2);
        assert_eq!(a.replica, replica);
        assert_eq!(b.replica, replica);
    }

    #[test]
    fn test_reserve_run() {
        let mut ids = IdGenerator::new(ReplicaId::random());
        let first = ids.reserve(5).unwrap();
        assert_eq!(first.counter, 1);
        assert_eq!(ids.last_counter(), 5);
        assert_eq!(ids.next_id().unwrap().counter, 6);
    }

    #[test]
    fn test_resume_continues_after_counter() {
        let mut ids = IdGenerator::resume(ReplicaId::random(), 41);
        assert_eq!(ids.next_id().unwrap().counter, 42);
    }

    #[test]
    fn test_counter_overflow_is_sticky() {
        let replica = ReplicaId::random();
        let mut ids = IdGenerator::resume(replica, u64::MAX - 1);
        assert_eq!(ids.next_id().unwrap().counter, u64::MAX);

        let err = ids.next_id().unwrap_err();
        assert_eq!(err, CoreError::CounterOverflow { replica });
        assert!(err.is_fatal());
        // Stays failed.
        assert!(ids.reserve(1).is_err());
    }

    #[test]
    fn test_reserve_overflow_mid_run() {
        let mut ids = IdGenerator::resume(ReplicaId::random(), u64::MAX - 2);
        assert!(ids.reserve(3).is_err());
    }

    #[test]
    fn test_random_replicas_distinct() {
        assert_ne!(ReplicaId::random(), ReplicaId::random());
    }

    #[test]
    fn test_offset() {
        let id = OperationId::new(ReplicaId::random(), 10);
        assert_eq!(id.offset(3).unwrap().counter, 13);
        assert!(OperationId::new(id.replica, u64::MAX).offset(1).is_none());
    }

    #[test]
    fn test_well_formed() {
        let replica = ReplicaId::random();
        assert!(OperationId::new(replica, 1).is_well_formed());
        assert!(!OperationId::new(replica, 0).is_well_formed());
        assert!(!OperationId::new(ReplicaId::from_uuid(Uuid::nil()), 1).is_well_formed());
    }

    #[test]
    fn test_display_short_form() {
        let id = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
        let op = OperationId::new(ReplicaId::from_uuid(id), 7);
        assert_eq!(op.to_string(), "550e8400:7");
    }
}
