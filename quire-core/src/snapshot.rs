//! Full-document snapshots.
//!
//! A snapshot holds the element sequence with tombstones plus the identity
//! of every delete, so a replica rebuilt from it reports the same visible
//! text and the same state vector as the one that produced it.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::CoreError;
use crate::id::OperationId;
use crate::operation::Operation;
use crate::text::CharacterElement;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteRecord {
    pub id: OperationId,
    pub targets: Vec<OperationId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Document order, tombstones included.
    pub elements: Vec<CharacterElement>,
    pub deletions: Vec<DeleteRecord>,
}

impl Snapshot {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn visible_text(&self) -> String {
        self.elements
            .iter()
            .filter(|e| !e.deleted)
            .map(|e| e.content)
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty() && self.deletions.is_empty()
    }

    /// Human-readable export.
    pub fn to_json(&self) -> Result<String, CoreError> {
        serde_json::to_string(self).map_err(|e| CoreError::InvalidSnapshot(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self, CoreError> {
        serde_json::from_str(json).map_err(|e| CoreError::InvalidSnapshot(e.to_string()))
    }

    /// Rebuild a log for the snapshot: one single-char insert per element in
    /// an order where every element follows its origins, then the deletes.
    pub(crate) fn causal_operations(&self) -> Vec<Operation> {
        let index: HashMap<OperationId, usize> = self
            .elements
            .iter()
            .enumerate()
            .map(|(i, e)| (e.id, i))
            .collect();

        let mut visited = vec![false; self.elements.len()];
        let mut order = Vec::with_capacity(self.elements.len());

        // Iterative post-order DFS over (origin, origin_right).
        for root in 0..self.elements.len() {
            if visited[root] {
                continue;
            }
            let mut stack = vec![(root, false)];
            while let Some((i, expanded)) = stack.pop() {
                if expanded {
                    order.push(i);
                    continue;
                }
                if visited[i] {
                    continue;
                }
                visited[i] = true;
                stack.push((i, true));

                let element = &self.elements[i];
                for anchor in element.origin.iter().chain(element.origin_right.iter()) {
                    if let Some(&j) = index.get(anchor) {
                        if !visited[j] {
                            stack.push((j, false));
                        }
                    }
                }
            }
        }

        let inserts = order.into_iter().map(|i| {
            let element = &self.elements[i];
            Operation::Insert {
                id: element.id,
                origin: element.origin,
                origin_right: element.origin_right,
                content: element.content.to_string(),
            }
        });
        let deletes = self.deletions.iter().map(|record| Operation::Delete {
            id: record.id,
            targets: record.targets.clone(),
        });
        inserts.chain(deletes).collect()
    }
}
