//! One participant's copy of a collaborative document.
//!
//! ```text
//! local edit ──► TextDocument ──► Operation ──► OpLog ──► (session ships it)
//!
//! remote op ──► validate ──► deps present? ──yes──► TextDocument ──► OpLog
//!                                 │                                   │
//!                                 no                          release waiters
//!                                 ▼                                   │
//!                            CausalBuffer ◄───── still missing ───────┘
//! ```
//!
//! Every operation is applied exactly once: duplicates are detected against
//! both the log and the buffer before anything else happens.

use std::collections::VecDeque;
use std::ops::Range;
use std::time::{Duration, Instant};

use crate::buffer::CausalBuffer;
use crate::error::CoreError;
use crate::id::{IdGenerator, OperationId, ReplicaId};
use crate::oplog::OpLog;
use crate::operation::Operation;
use crate::snapshot::{DeleteRecord, Snapshot};
use crate::state_vector::StateVector;
use crate::text::{push_change, ChangeRange, TextDocument};

/// Bounds for the causal buffer.
#[derive(Debug, Clone)]
pub struct ReplicaConfig {
    /// Buffered operations tolerated before a resync is forced.
    pub max_buffered_ops: usize,
    /// Longest time one operation may wait for its dependencies.
    pub max_buffer_age: Duration,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            max_buffered_ops: 10_000,
            max_buffer_age: Duration::from_secs(30),
        }
    }
}

impl ReplicaConfig {
    /// Small bounds for tests.
    pub fn for_testing() -> Self {
        Self {
            max_buffered_ops: 64,
            max_buffer_age: Duration::from_millis(200),
        }
    }
}

/// Result of integrating one remote operation.
#[derive(Debug, Clone, PartialEq)]
pub enum IntegrateOutcome {
    /// Applied, plus `released` buffered operations that it unblocked.
    Applied { changes: Vec<ChangeRange>, released: usize },
    /// Waiting on `missing`.
    Buffered { missing: OperationId },
    /// Already integrated or already buffered.
    Duplicate,
}

/// Operations produced by a local edit and the visible changes they made.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LocalEdit {
    pub operations: Vec<Operation>,
    pub changes: Vec<ChangeRange>,
}

impl LocalEdit {
    fn extend(&mut self, other: LocalEdit) {
        self.operations.extend(other.operations);
        self.changes.extend(other.changes);
    }
}

pub struct Replica {
    id: ReplicaId,
    ids: IdGenerator,
    document: TextDocument,
    log: OpLog,
    buffer: CausalBuffer,
    config: ReplicaConfig,
}

impl Replica {
    /// Empty document under a fresh random identity.
    pub fn new(config: ReplicaConfig) -> Self {
        Self::with_id(ReplicaId::random(), config)
    }

    pub fn with_id(id: ReplicaId, config: ReplicaConfig) -> Self {
        Self {
            id,
            ids: IdGenerator::new(id),
            document: TextDocument::new(),
            log: OpLog::new(),
            buffer: CausalBuffer::new(),
            config,
        }
    }

    /// Rebuild a replica from a snapshot.
    ///
    /// The log is reconstructed in dependency order, so the restored state
    /// vector equals the one of the replica that took the snapshot.
    pub fn from_snapshot(id: ReplicaId, snapshot: &Snapshot, config: ReplicaConfig) -> Result<Self, CoreError> {
        let mut document = TextDocument::from_elements(snapshot.elements.clone())?;
        let mut log = OpLog::new();
        let invalid = |e: CoreError| CoreError::InvalidSnapshot(e.to_string());

        for operation in snapshot.causal_operations() {
            operation.validate().map_err(invalid)?;
            if !operation.is_insert() {
                document.apply_remote(&operation).map_err(invalid)?;
            }
            if !log.append(operation) {
                return Err(CoreError::InvalidSnapshot("duplicate operation id".to_string()));
            }
        }

        let last_local = log
            .operations()
            .iter()
            .filter(|op| op.replica() == id)
            .map(|op| op.last_counter())
            .max()
            .unwrap_or(0);

        log::debug!(
            "Restored replica {} from snapshot ({} elements, {} deletes)",
            id,
            snapshot.elements.len(),
            snapshot.deletions.len()
        );

        Ok(Self {
            id,
            ids: IdGenerator::resume(id, last_local),
            document,
            log,
            buffer: CausalBuffer::new(),
            config,
        })
    }

    pub fn snapshot(&self) -> Snapshot {
        let deletions = self
            .log
            .operations()
            .iter()
            .filter_map(|op| match op {
                Operation::Delete { id, targets } => Some(DeleteRecord { id: *id, targets: targets.clone() }),
                Operation::Insert { .. } => None,
            })
            .collect();
        Snapshot {
            elements: self.document.elements().to_vec(),
            deletions,
        }
    }

    // ─── Accessors ──────────────────────────────────────────────

    pub fn id(&self) -> ReplicaId {
        self.id
    }

    pub fn text(&self) -> String {
        self.document.text()
    }

    pub fn len(&self) -> usize {
        self.document.len()
    }

    pub fn is_empty(&self) -> bool {
        self.document.is_empty()
    }

    pub fn document(&self) -> &TextDocument {
        &self.document
    }

    pub fn state_vector(&self) -> &StateVector {
        self.log.state_vector()
    }

    pub fn operations(&self) -> &[Operation] {
        self.log.operations()
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn config(&self) -> &ReplicaConfig {
        &self.config
    }

    // ─── Local edits ────────────────────────────────────────────

    pub fn insert(&mut self, position: usize, content: &str) -> Result<LocalEdit, CoreError> {
        let (operation, changes) = self.document.local_insert(&mut self.ids, position, content)?;
        self.record_local(operation.clone());
        Ok(LocalEdit { operations: vec![operation], changes })
    }

    pub fn delete(&mut self, range: Range<usize>) -> Result<LocalEdit, CoreError> {
        let (operation, changes) = self.document.local_delete(&mut self.ids, range)?;
        self.record_local(operation.clone());
        Ok(LocalEdit { operations: vec![operation], changes })
    }

    /// Replace the whole visible text with `content`.
    pub fn replace_all(&mut self, content: &str) -> Result<LocalEdit, CoreError> {
        let mut edit = LocalEdit::default();
        if !self.document.is_empty() {
            edit.extend(self.delete(0..self.document.len())?);
        }
        if !content.is_empty() {
            edit.extend(self.insert(0, content)?);
        }
        Ok(edit)
    }

    fn record_local(&mut self, operation: Operation) {
        self.log.append(operation);
    }

    // ─── Remote integration ─────────────────────────────────────

    /// Integrate a remote operation, buffering it if a dependency is missing.
    pub fn integrate(&mut self, operation: Operation, now: Instant) -> Result<IntegrateOutcome, CoreError> {
        let id = operation.id();
        if self.log.contains(&id) || self.buffer.contains(&id) {
            return Ok(IntegrateOutcome::Duplicate);
        }
        operation.validate()?;
        if id.replica == self.id {
            return Err(CoreError::MalformedOperation(format!(
                "{} claims the local replica id",
                id
            )));
        }

        if let Some(missing) = self.first_missing(&operation) {
            log::debug!("Buffering {} until {} arrives", id, missing);
            self.buffer.insert(missing, operation, now);
            return Ok(IntegrateOutcome::Buffered { missing });
        }

        let new_elements = element_ids(&operation);
        let mut changes = self.apply(operation)?;
        let released = self.release(new_elements, &mut changes);
        Ok(IntegrateOutcome::Applied { changes, released })
    }

    fn first_missing(&self, operation: &Operation) -> Option<OperationId> {
        operation
            .dependencies()
            .into_iter()
            .find(|dependency| !self.document.contains(dependency))
    }

    fn apply(&mut self, operation: Operation) -> Result<Vec<ChangeRange>, CoreError> {
        let changes = self.document.apply_remote(&operation)?;
        self.log.append(operation);
        Ok(changes)
    }

    /// Integrate every buffered operation unblocked by `added`, transitively.
    fn release(&mut self, added: Vec<OperationId>, changes: &mut Vec<ChangeRange>) -> usize {
        let mut ready: VecDeque<OperationId> = added.into();
        let mut released = 0;

        while let Some(dependency) = ready.pop_front() {
            for pending in self.buffer.take_waiting(&dependency) {
                if self.log.contains(&pending.operation.id()) {
                    continue;
                }
                if let Some(missing) = self.first_missing(&pending.operation) {
                    self.buffer.park(missing, pending);
                    continue;
                }

                let id = pending.operation.id();
                let new_elements = element_ids(&pending.operation);
                match self.apply(pending.operation) {
                    Ok(applied) => {
                        for change in applied {
                            push_change(changes, change);
                        }
                        released += 1;
                        ready.extend(new_elements);
                    }
                    Err(e) => log::warn!("Dropping buffered operation {}: {}", id, e),
                }
            }
        }
        released
    }

    /// Operations the holder of `peer` is missing, in causally safe order.
    pub fn compute_delta(&self, peer: &StateVector) -> Vec<Operation> {
        self.log.delta_since(peer)
    }

    // ─── Buffer health ──────────────────────────────────────────

    /// Fails when the causal buffer exceeds its count or age bound.
    pub fn buffer_health(&self, now: Instant) -> Result<(), CoreError> {
        let buffered = self.buffer.len();
        let oldest_age = self.buffer.oldest_age(now).unwrap_or_default();
        if buffered > self.config.max_buffered_ops || oldest_age > self.config.max_buffer_age {
            return Err(CoreError::UnknownDependencyTimeout { buffered, oldest_age });
        }
        Ok(())
    }

    /// Buffered operations or counter gaps in the state vector.
    pub fn has_gaps(&self) -> bool {
        !self.buffer.is_empty() || self.log.has_gaps()
    }

    /// Drop every buffered operation (full resync). Returns how many.
    pub fn clear_buffer(&mut self) -> usize {
        let dropped = self.buffer.clear();
        if dropped > 0 {
            log::warn!("Replica {} dropped {} buffered operations", self.id, dropped);
        }
        dropped
    }
}

/// Ids of the elements an operation adds to the document.
fn element_ids(operation: &Operation) -> Vec<OperationId> {
    match operation {
        Operation::Insert { id, .. } => (0..operation.span()).filter_map(|k| id.offset(k)).collect(),
        Operation::Delete { .. } => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn replica(n: u128) -> Replica {
        Replica::with_id(ReplicaId::from_uuid(Uuid::from_u128(n)), ReplicaConfig::for_testing())
    }

    fn sync(from: &Replica, to: &mut Replica) {
        for op in from.compute_delta(to.state_vector()) {
            to.integrate(op, Instant::now()).unwrap();
        }
    }

    #[test]
    fn test_local_edits_advance_state_vector() {
        let mut a = replica(1);
        a.insert(0, "abc").unwrap();
        a.delete(0..1).unwrap();

        assert_eq!(a.text(), "bc");
        assert_eq!(a.state_vector().get(&a.id()), 4);
        assert_eq!(a.operations().len(), 2);
    }

    #[test]
    fn test_causal_gating() {
        let mut a = replica(1);
        let mut b = replica(2);

        let e1 = a.insert(0, "e").unwrap().operations.remove(0);
        let x = a.insert(1, "X").unwrap().operations.remove(0);

        let now = Instant::now();
        let outcome = b.integrate(x.clone(), now).unwrap();
        assert_eq!(outcome, IntegrateOutcome::Buffered { missing: e1.id() });
        assert_eq!(b.text(), "");
        assert!(b.has_gaps());

        match b.integrate(e1, now).unwrap() {
            IntegrateOutcome::Applied { changes, released } => {
                assert_eq!(released, 1);
                assert_eq!(changes, vec![ChangeRange::inserted(0, 2)]);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(b.text(), a.text());
        assert_eq!(b.state_vector(), a.state_vector());
        assert!(!b.has_gaps());
    }

    #[test]
    fn test_gap_without_buffering_is_reported() {
        let mut hub = replica(1);
        let mut client = replica(2);
        hub.insert(0, "Z").unwrap();
        sync(&hub, &mut client);

        // "a" never reaches the hub; "b" only depends on "Z".
        let lost = client.insert(1, "a").unwrap().operations.remove(0);
        let b = client.insert(0, "b").unwrap().operations.remove(0);

        let outcome = hub.integrate(b, Instant::now()).unwrap();
        assert!(matches!(outcome, IntegrateOutcome::Applied { .. }));
        assert_eq!(hub.buffered_len(), 0);
        assert_eq!(hub.text(), "bZ");
        assert!(hub.has_gaps());

        // Pulling with the hub's state vector returns the lost operation.
        let delta = client.compute_delta(hub.state_vector());
        assert!(delta.contains(&lost));
        for op in delta {
            hub.integrate(op, Instant::now()).unwrap();
        }
        assert_eq!(hub.text(), client.text());
        assert!(!hub.has_gaps());
    }

    #[test]
    fn test_release_is_transitive() {
        let mut a = replica(1);
        let ops: Vec<Operation> = ["a", "b", "c", "d"]
            .iter()
            .enumerate()
            .map(|(i, s)| a.insert(i, s).unwrap().operations.remove(0))
            .collect();

        let mut b = replica(2);
        let now = Instant::now();
        for op in ops.iter().rev() {
            b.integrate(op.clone(), now).unwrap();
        }
        assert_eq!(b.text(), "abcd");
        assert_eq!(b.buffered_len(), 0);
    }

    #[test]
    fn test_rebuffer_on_second_missing_dependency() {
        let mut a = replica(1);
        let left = a.insert(0, "L").unwrap().operations.remove(0);
        let right = a.insert(1, "R").unwrap().operations.remove(0);
        let middle = a.insert(1, "m").unwrap().operations.remove(0);

        let mut b = replica(2);
        let now = Instant::now();
        assert_eq!(b.integrate(middle, now).unwrap(), IntegrateOutcome::Buffered { missing: left.id() });
        b.integrate(left, now).unwrap();
        // Still waiting on its right anchor.
        assert_eq!(b.buffered_len(), 1);
        b.integrate(right, now).unwrap();
        assert_eq!(b.text(), "LmR");
        assert_eq!(b.buffered_len(), 0);
    }

    #[test]
    fn test_duplicates_are_ignored() {
        let mut a = replica(1);
        let op = a.insert(0, "hi").unwrap().operations.remove(0);
        let mut b = replica(2);
        let now = Instant::now();

        assert!(matches!(b.integrate(op.clone(), now).unwrap(), IntegrateOutcome::Applied { .. }));
        assert_eq!(b.integrate(op, now).unwrap(), IntegrateOutcome::Duplicate);
        assert_eq!(b.text(), "hi");
        assert_eq!(b.operations().len(), 1);
    }

    #[test]
    fn test_buffered_duplicate_ignored() {
        let mut a = replica(1);
        a.insert(0, "a").unwrap();
        let dependent = a.insert(1, "b").unwrap().operations.remove(0);

        let mut b = replica(2);
        let now = Instant::now();
        assert!(matches!(b.integrate(dependent.clone(), now).unwrap(), IntegrateOutcome::Buffered { .. }));
        assert_eq!(b.integrate(dependent, now).unwrap(), IntegrateOutcome::Duplicate);
        assert_eq!(b.buffered_len(), 1);
    }

    #[test]
    fn test_malformed_rejected_without_mutation() {
        let mut b = replica(2);
        let bad = Operation::Insert {
            id: OperationId::new(ReplicaId::random(), 0),
            origin: None,
            origin_right: None,
            content: "x".into(),
        };
        assert!(matches!(b.integrate(bad, Instant::now()), Err(CoreError::MalformedOperation(_))));
        assert!(b.is_empty());
        assert!(b.state_vector().is_empty());
    }

    #[test]
    fn test_rejects_operation_claiming_local_id() {
        let mut b = replica(2);
        let spoofed = Operation::Insert {
            id: OperationId::new(b.id(), 1),
            origin: None,
            origin_right: None,
            content: "x".into(),
        };
        assert!(b.integrate(spoofed, Instant::now()).is_err());
    }

    #[test]
    fn test_compute_delta_brings_peer_up_to_date() {
        let mut a = replica(1);
        let mut b = replica(2);
        a.insert(0, "hello").unwrap();
        sync(&a, &mut b);
        a.delete(0..1).unwrap();
        a.insert(4, "!").unwrap();

        let delta = a.compute_delta(b.state_vector());
        assert_eq!(delta.len(), 2);
        sync(&a, &mut b);
        assert_eq!(b.text(), "ello!");
        assert!(a.compute_delta(b.state_vector()).is_empty());
    }

    #[test]
    fn test_concrete_scenario() {
        // B has the smaller replica id, so its concurrent root insert sorts first.
        let mut a = replica(2);
        let mut b = replica(1);

        a.insert(0, "ab").unwrap();
        assert_eq!(a.text(), "ab");
        b.insert(0, "x").unwrap();

        sync(&a, &mut b);
        sync(&b, &mut a);
        assert_eq!(a.text(), "xab");
        assert_eq!(b.text(), "xab");

        a.delete(1..2).unwrap();
        sync(&a, &mut b);
        assert_eq!(a.text(), "xb");
        assert_eq!(b.text(), "xb");
    }

    #[test]
    fn test_replace_all() {
        let mut a = replica(1);
        a.insert(0, "old text").unwrap();
        let edit = a.replace_all("new").unwrap();

        assert_eq!(a.text(), "new");
        assert_eq!(edit.operations.len(), 2);
        assert_eq!(edit.changes, vec![ChangeRange::deleted(0, 8), ChangeRange::inserted(0, 3)]);

        let mut b = replica(2);
        sync(&a, &mut b);
        assert_eq!(b.text(), "new");
    }

    #[test]
    fn test_snapshot_round_trip() {
        let mut a = replica(1);
        let mut b = replica(2);
        a.insert(0, "hello world").unwrap();
        sync(&a, &mut b);
        b.insert(5, ",").unwrap();
        b.delete(0..1).unwrap();
        sync(&b, &mut a);
        a.delete(3..6).unwrap();

        let snapshot = a.snapshot();
        let restored = Replica::from_snapshot(ReplicaId::random(), &snapshot, ReplicaConfig::default()).unwrap();
        assert_eq!(restored.text(), a.text());
        assert_eq!(restored.state_vector(), a.state_vector());

        let json = snapshot.to_json().unwrap();
        let from_json = Replica::from_snapshot(ReplicaId::random(), &Snapshot::from_json(&json).unwrap(), ReplicaConfig::default()).unwrap();
        assert_eq!(from_json.text(), a.text());
    }

    #[test]
    fn test_snapshot_restore_same_identity_keeps_counters() {
        let mut a = replica(1);
        a.insert(0, "abc").unwrap();
        let snapshot = a.snapshot();

        let mut restored = Replica::from_snapshot(a.id(), &snapshot, ReplicaConfig::default()).unwrap();
        let edit = restored.insert(3, "d").unwrap();
        assert_eq!(edit.operations[0].id().counter, 4);
    }

    #[test]
    fn test_buffer_health_count_bound() {
        let mut b = Replica::with_id(
            ReplicaId::random(),
            ReplicaConfig { max_buffered_ops: 2, max_buffer_age: Duration::from_secs(60) },
        );
        let ghost = ReplicaId::random();
        let now = Instant::now();
        for counter in 2..5 {
            let op = Operation::Insert {
                id: OperationId::new(ghost, counter),
                origin: Some(OperationId::new(ghost, 1)),
                origin_right: None,
                content: "x".into(),
            };
            b.integrate(op, now).unwrap();
        }

        assert!(matches!(
            b.buffer_health(now),
            Err(CoreError::UnknownDependencyTimeout { buffered: 3, .. })
        ));
        assert_eq!(b.clear_buffer(), 3);
        assert!(b.buffer_health(now).is_ok());
    }

    #[test]
    fn test_buffer_health_age_bound() {
        let mut b = replica(2);
        let ghost = ReplicaId::random();
        let start = Instant::now();
        let op = Operation::Insert {
            id: OperationId::new(ghost, 2),
            origin: Some(OperationId::new(ghost, 1)),
            origin_right: None,
            content: "x".into(),
        };
        b.integrate(op, start).unwrap();

        assert!(b.buffer_health(start + Duration::from_millis(100)).is_ok());
        assert!(b.buffer_health(start + Duration::from_millis(300)).is_err());
    }
}
