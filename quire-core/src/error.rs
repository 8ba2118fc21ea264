use std::time::Duration;

use thiserror::Error;

use crate::id::ReplicaId;

/// Errors raised by the replicated text core.
///
/// Remote-input errors (`MalformedOperation`, `UnknownDependencyTimeout`) are
/// isolated per operation: the document is never left partially mutated.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CoreError {
    #[error("Malformed operation: {0}")]
    MalformedOperation(String),

    #[error("{buffered} buffered operations waiting on unknown dependencies (oldest for {oldest_age:?})")]
    UnknownDependencyTimeout { buffered: usize, oldest_age: Duration },

    /// Fatal for the replica: a new identity must be created and resynced.
    #[error("Operation counter exhausted for replica {replica}")]
    CounterOverflow { replica: ReplicaId },

    #[error("Position {position} out of bounds (visible length {len})")]
    PositionOutOfBounds { position: usize, len: usize },

    #[error("Edit is empty")]
    EmptyEdit,

    #[error("Invalid snapshot: {0}")]
    InvalidSnapshot(String),
}

impl CoreError {
    /// Whether the replica that raised this error can keep collaborating.
    pub fn is_fatal(&self) -> bool {
        matches!(self, CoreError::CounterOverflow { .. })
    }
}
