//! Operations exchanged between replicas.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::id::{OperationId, ReplicaId};

/// One replicated edit, in the form it is logged and sent over the wire.
///
/// An `Insert` carries a run of characters: the k-th char of `content` has id
/// `(id.replica, id.counter + k)` and is anchored after the previous char of
/// the run (or after `origin` for k = 0). Every char of the run shares
/// `origin_right`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Insert {
        id: OperationId,
        origin: Option<OperationId>,
        origin_right: Option<OperationId>,
        content: String,
    },
    Delete {
        id: OperationId,
        targets: Vec<OperationId>,
    },
}

impl Operation {
    pub fn id(&self) -> OperationId {
        match self {
            Operation::Insert { id, .. } | Operation::Delete { id, .. } => *id,
        }
    }

    pub fn replica(&self) -> ReplicaId {
        self.id().replica
    }

    pub fn is_insert(&self) -> bool {
        matches!(self, Operation::Insert { .. })
    }

    /// Number of counters this operation consumes.
    pub fn span(&self) -> u64 {
        match self {
            Operation::Insert { content, .. } => content.chars().count() as u64,
            Operation::Delete { .. } => 1,
        }
    }

    /// Last counter consumed. Saturates for malformed runs; call
    /// [`Operation::validate`] first.
    pub fn last_counter(&self) -> u64 {
        self.id().counter.saturating_add(self.span().saturating_sub(1))
    }

    /// Whether `other` is one of the ids minted by this operation.
    pub fn mints(&self, other: &OperationId) -> bool {
        let id = self.id();
        other.replica == id.replica && other.counter >= id.counter && other.counter <= self.last_counter()
    }

    /// Ids of the character elements this operation must find locally
    /// before it can be applied.
    pub fn dependencies(&self) -> Vec<OperationId> {
        match self {
            Operation::Insert { origin, origin_right, .. } => {
                origin.iter().chain(origin_right.iter()).copied().collect()
            }
            Operation::Delete { targets, .. } => targets.clone(),
        }
    }

    /// Structural checks that need no document state.
    pub fn validate(&self) -> Result<(), CoreError> {
        let id = self.id();
        if !id.is_well_formed() {
            return Err(malformed(format!("invalid operation id {}", id)));
        }

        match self {
            Operation::Insert { origin, origin_right, content, .. } => {
                if content.is_empty() {
                    return Err(malformed(format!("insert {} has empty content", id)));
                }
                if id.offset(self.span() - 1).is_none() {
                    return Err(malformed(format!("insert {} overflows the counter space", id)));
                }
                for anchor in origin.iter().chain(origin_right.iter()) {
                    if !anchor.is_well_formed() {
                        return Err(malformed(format!("insert {} has invalid anchor {}", id, anchor)));
                    }
                    if self.mints(anchor) {
                        return Err(malformed(format!("insert {} is anchored to itself", id)));
                    }
                }
                if origin.is_some() && origin == origin_right {
                    return Err(malformed(format!("insert {} has identical origins", id)));
                }
            }
            Operation::Delete { targets, .. } => {
                if targets.is_empty() {
                    return Err(malformed(format!("delete {} has no targets", id)));
                }
                for target in targets {
                    if !target.is_well_formed() {
                        return Err(malformed(format!("delete {} has invalid target {}", id, target)));
                    }
                    if *target == id {
                        return Err(malformed(format!("delete {} targets itself", id)));
                    }
                }
            }
        }
        Ok(())
    }
}

fn malformed(reason: String) -> CoreError {
    CoreError::MalformedOperation(reason)
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn insert(replica: ReplicaId, counter: u64, content: &str) -> Operation {
        Operation::Insert {
            id: OperationId::new(replica, counter),
            origin: None,
            origin_right: None,
            content: content.to_string(),
        }
    }

    #[test]
    fn test_span_and_last_counter() {
        let r = ReplicaId::random();
        let op = insert(r, 10, "héllo");
        assert_eq!(op.span(), 5);
        assert_eq!(op.last_counter(), 14);
        assert!(op.mints(&OperationId::new(r, 12)));
        assert!(!op.mints(&OperationId::new(r, 15)));

        let del = Operation::Delete { id: OperationId::new(r, 20), targets: vec![OperationId::new(r, 10)] };
        assert_eq!(del.span(), 1);
        assert_eq!(del.last_counter(), 20);
    }

    #[test]
    fn test_dependencies() {
        let r = ReplicaId::random();
        let left = OperationId::new(r, 1);
        let right = OperationId::new(r, 2);
        let op = Operation::Insert {
            id: OperationId::new(r, 3),
            origin: Some(left),
            origin_right: Some(right),
            content: "x".into(),
        };
        assert_eq!(op.dependencies(), vec![left, right]);
    }

    #[test]
    fn test_validate_accepts_well_formed() {
        let r = ReplicaId::random();
        assert!(insert(r, 1, "abc").validate().is_ok());
        let del = Operation::Delete { id: OperationId::new(r, 4), targets: vec![OperationId::new(r, 1)] };
        assert!(del.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_malformed() {
        let r = ReplicaId::random();
        let nil = ReplicaId::from_uuid(Uuid::nil());

        let cases = vec![
            insert(nil, 1, "a"),
            insert(r, 0, "a"),
            insert(r, 1, ""),
            insert(r, u64::MAX, "ab"),
            Operation::Insert {
                id: OperationId::new(r, 5),
                origin: Some(OperationId::new(r, 6)),
                origin_right: None,
                content: "ab".into(),
            },
            Operation::Insert {
                id: OperationId::new(r, 5),
                origin: Some(OperationId::new(r, 1)),
                origin_right: Some(OperationId::new(r, 1)),
                content: "a".into(),
            },
            Operation::Delete { id: OperationId::new(r, 2), targets: vec![] },
            Operation::Delete { id: OperationId::new(r, 2), targets: vec![OperationId::new(r, 2)] },
            Operation::Delete { id: OperationId::new(r, 2), targets: vec![OperationId::new(r, 0)] },
        ];

        for op in cases {
            assert!(
                matches!(op.validate(), Err(CoreError::MalformedOperation(_))),
                "expected rejection for {:?}",
                op
            );
        }
    }

    #[test]
    fn test_json_shape() {
        let r = ReplicaId::random();
        let json = serde_json::to_string(&insert(r, 1, "a")).unwrap();
        assert!(json.starts_with("{\"insert\":"));
        let back: Operation = serde_json::from_str(&json).unwrap();
        assert_eq!(back, insert(r, 1, "a"));
    }
}
