//! Snapshot persistence for the relay hub.
//!
//! The hub checkpoints each room's document as a [`Snapshot`] and reloads it
//! when the room is reopened. Snapshots are bincode-encoded and LZ4
//! compressed on disk.

pub mod rocks;

use std::collections::HashMap;
use std::sync::RwLock;

use quire_core::Snapshot;
use uuid::Uuid;

pub use rocks::{DocumentMetadata, RocksSnapshotStore, StoreConfig, StoreError};

/// Where the hub keeps document snapshots.
///
/// Calls are synchronous. Callers run them off the message hot path
/// (room open, checkpoint, room close).
pub trait SnapshotStore: Send + Sync {
    fn save_snapshot(&self, doc_id: Uuid, snapshot: &Snapshot) -> Result<(), StoreError>;

    /// `Ok(None)` when the document was never saved.
    fn load_snapshot(&self, doc_id: Uuid) -> Result<Option<Snapshot>, StoreError>;

    fn list_documents(&self) -> Result<Vec<Uuid>, StoreError>;

    fn delete_document(&self, doc_id: Uuid) -> Result<(), StoreError>;
}

/// Encode a snapshot for storage: bincode, then LZ4 with the size prepended.
pub fn encode_snapshot(snapshot: &Snapshot) -> Result<Vec<u8>, StoreError> {
    let raw = bincode::serde::encode_to_vec(snapshot, bincode::config::standard())
        .map_err(|e| StoreError::SerializationError(e.to_string()))?;
    Ok(lz4_flex::compress_prepend_size(&raw))
}

pub fn decode_snapshot(bytes: &[u8]) -> Result<Snapshot, StoreError> {
    let raw = lz4_flex::decompress_size_prepended(bytes).map_err(|e| StoreError::CompressionError(e.to_string()))?;
    let (snapshot, _) = bincode::serde::decode_from_slice(&raw, bincode::config::standard())
        .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
    Ok(snapshot)
}

/// In-process store, for tests and hubs that need no durability.
///
/// Holds encoded bytes so it exercises the same codec as the RocksDB store.
#[derive(Default)]
pub struct MemorySnapshotStore {
    documents: RwLock<HashMap<Uuid, Vec<u8>>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.documents.read().map(|docs| docs.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned<T>(_: T) -> StoreError {
    StoreError::DatabaseError("memory store lock poisoned".into())
}

impl SnapshotStore for MemorySnapshotStore {
    fn save_snapshot(&self, doc_id: Uuid, snapshot: &Snapshot) -> Result<(), StoreError> {
        let encoded = encode_snapshot(snapshot)?;
        self.documents.write().map_err(poisoned)?.insert(doc_id, encoded);
        Ok(())
    }

    fn load_snapshot(&self, doc_id: Uuid) -> Result<Option<Snapshot>, StoreError> {
        let documents = self.documents.read().map_err(poisoned)?;
        documents.get(&doc_id).map(|bytes| decode_snapshot(bytes)).transpose()
    }

    fn list_documents(&self) -> Result<Vec<Uuid>, StoreError> {
        Ok(self.documents.read().map_err(poisoned)?.keys().copied().collect())
    }

    fn delete_document(&self, doc_id: Uuid) -> Result<(), StoreError> {
        self.documents.write().map_err(poisoned)?.remove(&doc_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quire_core::{Replica, ReplicaConfig};

    fn sample_snapshot() -> Snapshot {
        let mut replica = Replica::new(ReplicaConfig::default());
        replica.insert(0, "persist me, please").unwrap();
        replica.delete(0..8).unwrap();
        replica.snapshot()
    }

    #[test]
    fn test_codec_roundtrip_keeps_tombstones() {
        let snapshot = sample_snapshot();
        let decoded = decode_snapshot(&encode_snapshot(&snapshot).unwrap()).unwrap();
        assert_eq!(decoded, snapshot);
        assert_eq!(decoded.visible_text(), "me, please");
        assert_eq!(decoded.deletions.len(), 1);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(decode_snapshot(&[1, 2, 3]), Err(StoreError::CompressionError(_))));
    }

    #[test]
    fn test_memory_store() {
        let store = MemorySnapshotStore::new();
        let doc = Uuid::new_v4();
        assert_eq!(store.load_snapshot(doc).unwrap(), None);

        let snapshot = sample_snapshot();
        store.save_snapshot(doc, &snapshot).unwrap();
        assert_eq!(store.load_snapshot(doc).unwrap(), Some(snapshot));
        assert_eq!(store.list_documents().unwrap(), vec![doc]);

        store.delete_document(doc).unwrap();
        assert!(store.is_empty());
    }
}
