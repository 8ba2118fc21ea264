//! Replicated text sequence (YATA-style CRDT).
//!
//! The document is a flat sequence of character elements. Deleted
//! characters stay in place as tombstones so that later operations can
//! still anchor to them.
//!
//! ```text
//! visible:   x   a         b
//! sequence: [x] [a] [c†]  [b]        († = tombstone)
//!                 ▲    ▲
//!              origin  origin_right  of an insert placed between a and c
//! ```
//!
//! Concurrent inserts anchored at the same origin are ordered by replica id
//! (smaller id first). The rule only looks at ids, so every replica places
//! them identically regardless of arrival order.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::ops::Range;

use crate::error::CoreError;
use crate::id::{IdGenerator, OperationId};
use crate::operation::Operation;

/// One character of the replicated sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacterElement {
    pub id: OperationId,
    pub origin: Option<OperationId>,
    pub origin_right: Option<OperationId>,
    pub content: char,
    pub deleted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    Inserted,
    Deleted,
}

/// A visible-coordinate change, as an editor would apply it.
///
/// Ranges in one batch apply sequentially: each `start` is relative to the
/// text after the previous range was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRange {
    pub kind: ChangeKind,
    pub start: usize,
    pub len: usize,
}

impl ChangeRange {
    pub fn inserted(start: usize, len: usize) -> Self {
        Self { kind: ChangeKind::Inserted, start, len }
    }

    pub fn deleted(start: usize, len: usize) -> Self {
        Self { kind: ChangeKind::Deleted, start, len }
    }
}

/// Append `change`, merging it into the previous range when adjacent.
pub(crate) fn push_change(changes: &mut Vec<ChangeRange>, change: ChangeRange) {
    if let Some(last) = changes.last_mut() {
        if last.kind == change.kind {
            match change.kind {
                ChangeKind::Inserted if change.start == last.start + last.len => {
                    last.len += change.len;
                    return;
                }
                ChangeKind::Deleted if change.start == last.start => {
                    last.len += change.len;
                    return;
                }
                ChangeKind::Deleted if change.start + change.len == last.start => {
                    last.start = change.start;
                    last.len += change.len;
                    return;
                }
                _ => {}
            }
        }
    }
    changes.push(change);
}

/// The replicated text of one document.
#[derive(Debug, Clone, Default)]
pub struct TextDocument {
    elements: Vec<CharacterElement>,
    known: HashSet<OperationId>,
    visible_len: usize,
}

impl TextDocument {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a document from a stored element sequence.
    pub(crate) fn from_elements(elements: Vec<CharacterElement>) -> Result<Self, CoreError> {
        let mut known = HashSet::with_capacity(elements.len());
        for element in &elements {
            if !element.id.is_well_formed() || !known.insert(element.id) {
                return Err(CoreError::InvalidSnapshot(format!(
                    "duplicate or invalid element id {}",
                    element.id
                )));
            }
        }
        for element in &elements {
            for anchor in element.origin.iter().chain(element.origin_right.iter()) {
                if !known.contains(anchor) {
                    return Err(CoreError::InvalidSnapshot(format!(
                        "element {} anchored to missing element {}",
                        element.id, anchor
                    )));
                }
            }
        }

        let visible_len = elements.iter().filter(|e| !e.deleted).count();
        Ok(Self { elements, known, visible_len })
    }

    /// Full sequence, tombstones included.
    pub fn elements(&self) -> &[CharacterElement] {
        &self.elements
    }

    /// Visible length in chars.
    pub fn len(&self) -> usize {
        self.visible_len
    }

    pub fn is_empty(&self) -> bool {
        self.visible_len == 0
    }

    pub fn text(&self) -> String {
        self.visible_chars().collect()
    }

    pub fn contains(&self, id: &OperationId) -> bool {
        self.known.contains(id)
    }

    pub fn element(&self, id: &OperationId) -> Option<&CharacterElement> {
        self.index_of(id).map(|i| &self.elements[i])
    }

    fn visible_chars(&self) -> impl Iterator<Item = char> + '_ {
        self.elements.iter().filter(|e| !e.deleted).map(|e| e.content)
    }

    fn index_of(&self, id: &OperationId) -> Option<usize> {
        if !self.known.contains(id) {
            return None;
        }
        self.elements.iter().position(|e| e.id == *id)
    }

    /// Number of visible elements strictly before sequence index `index`.
    fn visible_before(&self, index: usize) -> usize {
        self.elements[..index].iter().filter(|e| !e.deleted).count()
    }

    /// Sequence index of the `position`-th visible element.
    fn index_of_visible(&self, position: usize) -> Option<usize> {
        self.elements
            .iter()
            .enumerate()
            .filter(|(_, e)| !e.deleted)
            .nth(position)
            .map(|(i, _)| i)
    }

    // ─── Local edits ────────────────────────────────────────────

    /// Insert `content` so that it starts at visible `position`.
    pub fn local_insert(
        &mut self,
        ids: &mut IdGenerator,
        position: usize,
        content: &str,
    ) -> Result<(Operation, Vec<ChangeRange>), CoreError> {
        if content.is_empty() {
            return Err(CoreError::EmptyEdit);
        }
        if position > self.visible_len {
            return Err(CoreError::PositionOutOfBounds { position, len: self.visible_len });
        }

        let (origin, insert_at) = match position {
            0 => (None, 0),
            _ => {
                let index = self.index_of_visible(position - 1).ok_or(
                    CoreError::PositionOutOfBounds { position, len: self.visible_len },
                )?;
                (Some(self.elements[index].id), index + 1)
            }
        };
        let origin_right = self.elements.get(insert_at).map(|e| e.id);

        let first = ids.reserve(content.chars().count() as u64)?;
        let changes = self.integrate_run(first, origin, origin_right, content);

        let operation = Operation::Insert {
            id: first,
            origin,
            origin_right,
            content: content.to_string(),
        };
        Ok((operation, changes))
    }

    /// Tombstone the visible chars in `range`.
    pub fn local_delete(
        &mut self,
        ids: &mut IdGenerator,
        range: Range<usize>,
    ) -> Result<(Operation, Vec<ChangeRange>), CoreError> {
        if range.start >= range.end {
            return Err(CoreError::EmptyEdit);
        }
        if range.end > self.visible_len {
            return Err(CoreError::PositionOutOfBounds { position: range.end, len: self.visible_len });
        }

        let targets: Vec<OperationId> = self
            .elements
            .iter()
            .filter(|e| !e.deleted)
            .skip(range.start)
            .take(range.end - range.start)
            .map(|e| e.id)
            .collect();

        let id = ids.next_id()?;
        let changes = self.delete_targets(&targets);
        Ok((Operation::Delete { id, targets }, changes))
    }

    // ─── Remote integration ─────────────────────────────────────

    /// Integrate an operation whose dependencies are all present.
    ///
    /// Re-applying an already integrated insert or delete changes nothing.
    pub fn apply_remote(&mut self, operation: &Operation) -> Result<Vec<ChangeRange>, CoreError> {
        operation.validate()?;
        if let Some(missing) = operation.dependencies().into_iter().find(|d| !self.contains(d)) {
            return Err(CoreError::MalformedOperation(format!(
                "{} depends on unknown element {}",
                operation.id(),
                missing
            )));
        }

        match operation {
            Operation::Insert { id, origin, origin_right, content } => {
                if self.contains(id) {
                    return Ok(Vec::new());
                }
                let overlaps = (1..operation.span())
                    .filter_map(|k| id.offset(k))
                    .any(|other| self.contains(&other));
                if overlaps {
                    return Err(CoreError::MalformedOperation(format!(
                        "insert {} reuses ids already in the document",
                        id
                    )));
                }
                Ok(self.integrate_run(*id, *origin, *origin_right, content))
            }
            Operation::Delete { targets, .. } => Ok(self.delete_targets(targets)),
        }
    }

    fn integrate_run(
        &mut self,
        first: OperationId,
        origin: Option<OperationId>,
        origin_right: Option<OperationId>,
        content: &str,
    ) -> Vec<ChangeRange> {
        let mut changes = Vec::new();
        let mut start = origin.and_then(|o| self.index_of(&o)).map_or(0, |i| i + 1);
        let mut end = origin_right
            .and_then(|r| self.index_of(&r))
            .unwrap_or(self.elements.len());
        let mut previous = origin;
        let mut last_placed: Option<(usize, usize)> = None;

        for (k, content) in content.chars().enumerate() {
            let Some(id) = first.offset(k as u64) else {
                break;
            };
            let element = CharacterElement {
                id,
                origin: previous,
                origin_right,
                content,
                deleted: false,
            };
            let dest = self.integrate_element(element, start, end);

            let visible = match last_placed {
                Some((index, visible)) if dest == index + 1 => visible + 1,
                _ => self.visible_before(dest),
            };
            push_change(&mut changes, ChangeRange::inserted(visible, 1));

            last_placed = Some((dest, visible));
            previous = Some(id);
            start = dest + 1;
            // The right anchor always sits at or after `dest`, so it shifted by one.
            end = match origin_right {
                Some(_) => end + 1,
                None => self.elements.len(),
            };
        }
        changes
    }

    /// Place one element between sequence indices `start..end` and return
    /// its final index.
    fn integrate_element(&mut self, element: CharacterElement, start: usize, end: usize) -> usize {
        let mut dest = start;
        let mut scanned: HashSet<OperationId> = HashSet::new();
        let mut conflicting: HashSet<OperationId> = HashSet::new();

        for i in start..end {
            let other = &self.elements[i];
            scanned.insert(other.id);
            conflicting.insert(other.id);

            if other.origin == element.origin {
                if other.id.replica < element.id.replica {
                    dest = i + 1;
                    conflicting.clear();
                } else if other.origin_right == element.origin_right {
                    break;
                }
            } else if let Some(other_origin) = other.origin.filter(|o| scanned.contains(o)) {
                if !conflicting.contains(&other_origin) {
                    dest = i + 1;
                    conflicting.clear();
                }
            } else {
                break;
            }
        }

        self.known.insert(element.id);
        if !element.deleted {
            self.visible_len += 1;
        }
        self.elements.insert(dest, element);
        dest
    }

    fn delete_targets(&mut self, targets: &[OperationId]) -> Vec<ChangeRange> {
        let wanted: HashSet<OperationId> = targets
            .iter()
            .copied()
            .filter(|t| self.known.contains(t))
            .collect();
        let mut changes = Vec::new();
        let mut remaining = wanted.len();
        let mut visible = 0;

        for element in self.elements.iter_mut() {
            if remaining == 0 {
                break;
            }
            if wanted.contains(&element.id) {
                remaining -= 1;
                if !element.deleted {
                    element.deleted = true;
                    self.visible_len -= 1;
                    push_change(&mut changes, ChangeRange::deleted(visible, 1));
                    continue;
                }
            }
            if !element.deleted {
                visible += 1;
            }
        }
        changes
    }

    // ─── Line/column helpers ────────────────────────────────────

    /// Zero-based (line, column) of a visible position. Positions past the
    /// end resolve to the end of the text.
    pub fn position_to_line_col(&self, position: usize) -> (usize, usize) {
        let mut line = 0;
        let mut column = 0;
        for ch in self.visible_chars().take(position) {
            if ch == '\n' {
                line += 1;
                column = 0;
            } else {
                column += 1;
            }
        }
        (line, column)
    }

    /// Visible position of a zero-based (line, column), clamped to the end
    /// of that line and of the text.
    pub fn line_col_to_position(&self, line: usize, column: usize) -> usize {
        let mut current_line = 0;
        let mut current_column = 0;
        for (position, ch) in self.visible_chars().enumerate() {
            if current_line == line {
                if current_column == column || ch == '\n' {
                    return position;
                }
                current_column += 1;
            } else if ch == '\n' {
                current_line += 1;
            }
        }
        self.visible_len
    }
}
