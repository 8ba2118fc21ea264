//! RocksDB-backed snapshot store.
//!
//! Column families:
//! - `documents`: latest snapshot per document (bincode + LZ4)
//! - `metadata`: per-document bookkeeping (bincode)
//!
//! Keys are the 16 raw bytes of the document id. A snapshot and its metadata
//! are written in one batch, so a crash never leaves them out of step.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode, IteratorMode, Options,
    SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use thiserror::Error;
use uuid::Uuid;

use quire_core::Snapshot;

use super::{decode_snapshot, encode_snapshot, SnapshotStore};

const CF_DOCUMENTS: &str = "documents";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_METADATA];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    pub bloom_filter_bits: i32,
    /// fsync on every snapshot write
    pub sync_writes: bool,
    pub max_open_files: i32,
    /// Write buffer size per column family
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("quire_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches, no fsync.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 4 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 1024 * 1024,
        }
    }
}

/// Bookkeeping stored next to each snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub doc_id: Uuid,
    /// Number of times the snapshot was written
    pub version: u64,
    /// Elements in the snapshot, tombstones included
    pub element_count: u64,
    /// Visible characters at save time
    pub visible_len: u64,
    pub compressed_size: u64,
    /// Seconds since epoch
    pub created_at: u64,
    pub updated_at: u64,
}

impl DocumentMetadata {
    fn new(doc_id: Uuid) -> Self {
        let now = unix_seconds();
        Self {
            doc_id,
            version: 0,
            element_count: 0,
            visible_len: 0,
            compressed_size: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(meta)
    }
}

/// Snapshot I/O failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Document not found: {0}")]
    NotFound(Uuid),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    #[error("Compression error: {0}")]
    CompressionError(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

pub struct RocksSnapshotStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RocksSnapshotStore {
    /// Open (or create) the store and its column families.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(&db_opts, &config.path, cf_descriptors)?;
        log::info!("Snapshot store opened at {}", config.path.display());

        Ok(Self { db, config })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            // Values are already LZ4 compressed.
            CF_DOCUMENTS => opts.set_compression_type(DBCompressionType::None),
            CF_METADATA => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }
        opts
    }

    pub fn load_metadata(&self, doc_id: Uuid) -> Result<DocumentMetadata, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(&cf, doc_id.as_bytes())? {
            Some(bytes) => DocumentMetadata::decode(&bytes),
            None => Err(StoreError::NotFound(doc_id)),
        }
    }

    pub fn document_exists(&self, doc_id: Uuid) -> Result<bool, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        Ok(self.db.get_cf(&cf, doc_id.as_bytes())?.is_some())
    }

    /// Flush memtables to disk.
    pub fn flush(&self) -> Result<(), StoreError> {
        for name in COLUMN_FAMILIES {
            let cf = self.cf(name)?;
            self.db.flush_cf(&cf)?;
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }
}

impl SnapshotStore for RocksSnapshotStore {
    fn save_snapshot(&self, doc_id: Uuid, snapshot: &Snapshot) -> Result<(), StoreError> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_meta = self.cf(CF_METADATA)?;
        let encoded = encode_snapshot(snapshot)?;

        let mut meta = match self.load_metadata(doc_id) {
            Ok(meta) => meta,
            Err(StoreError::NotFound(_)) => DocumentMetadata::new(doc_id),
            Err(e) => return Err(e),
        };
        meta.version += 1;
        meta.element_count = snapshot.elements.len() as u64;
        meta.visible_len = snapshot.elements.iter().filter(|e| !e.deleted).count() as u64;
        meta.compressed_size = encoded.len() as u64;
        meta.updated_at = unix_seconds();

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_docs, doc_id.as_bytes(), &encoded);
        batch.put_cf(&cf_meta, doc_id.as_bytes(), &meta.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;

        log::debug!(
            "Saved snapshot for doc {} (v{}, {} elements, {} bytes)",
            doc_id,
            meta.version,
            meta.element_count,
            meta.compressed_size
        );
        Ok(())
    }

    fn load_snapshot(&self, doc_id: Uuid) -> Result<Option<Snapshot>, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        match self.db.get_cf(&cf, doc_id.as_bytes())? {
            Some(bytes) => decode_snapshot(&bytes).map(Some),
            None => Ok(None),
        }
    }

    fn list_documents(&self) -> Result<Vec<Uuid>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut doc_ids = Vec::new();

        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = item?;
            let bytes: [u8; 16] = key
                .as_ref()
                .try_into()
                .map_err(|_| StoreError::DeserializationError("Invalid document key".into()))?;
            doc_ids.push(Uuid::from_bytes(bytes));
        }
        Ok(doc_ids)
    }

    fn delete_document(&self, doc_id: Uuid) -> Result<(), StoreError> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let mut batch = WriteBatch::default();
        batch.delete_cf(&cf_docs, doc_id.as_bytes());
        batch.delete_cf(&cf_meta, doc_id.as_bytes());
        self.db.write(batch)?;
        Ok(())
    }
}

fn unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use quire_core::{Replica, ReplicaConfig};

    fn open_temp() -> (tempfile::TempDir, RocksSnapshotStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksSnapshotStore::open(StoreConfig::for_testing(dir.path())).unwrap();
        (dir, store)
    }

    fn snapshot_of(text: &str) -> Snapshot {
        let mut replica = Replica::new(ReplicaConfig::default());
        replica.insert(0, text).unwrap();
        replica.snapshot()
    }

    #[test]
    fn test_open_creates_directory() {
        let (_dir, store) = open_temp();
        assert!(store.path().exists());
        assert!(store.list_documents().unwrap().is_empty());
    }

    #[test]
    fn test_save_load_snapshot() {
        let (_dir, store) = open_temp();
        let doc = Uuid::new_v4();
        let snapshot = snapshot_of("Hello, quire! A snapshot with enough text to compress well well well.");

        store.save_snapshot(doc, &snapshot).unwrap();
        assert_eq!(store.load_snapshot(doc).unwrap(), Some(snapshot.clone()));
        assert!(store.document_exists(doc).unwrap());

        let meta = store.load_metadata(doc).unwrap();
        assert_eq!(meta.doc_id, doc);
        assert_eq!(meta.version, 1);
        assert_eq!(meta.element_count, snapshot.elements.len() as u64);
        assert!(meta.compressed_size > 0);
    }

    #[test]
    fn test_missing_document() {
        let (_dir, store) = open_temp();
        let doc = Uuid::new_v4();
        assert_eq!(store.load_snapshot(doc).unwrap(), None);
        assert_eq!(store.load_metadata(doc), Err(StoreError::NotFound(doc)));
        assert!(!store.document_exists(doc).unwrap());
    }

    #[test]
    fn test_overwrite_bumps_version_keeps_created_at() {
        let (_dir, store) = open_temp();
        let doc = Uuid::new_v4();

        store.save_snapshot(doc, &snapshot_of("one")).unwrap();
        let first = store.load_metadata(doc).unwrap();
        store.save_snapshot(doc, &snapshot_of("two two")).unwrap();
        let second = store.load_metadata(doc).unwrap();

        assert_eq!(second.version, 2);
        assert_eq!(second.created_at, first.created_at);
        assert_eq!(second.visible_len, 7);
        assert_eq!(store.load_snapshot(doc).unwrap().unwrap().visible_text(), "two two");
    }

    #[test]
    fn test_list_and_delete() {
        let (_dir, store) = open_temp();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        store.save_snapshot(a, &snapshot_of("a")).unwrap();
        store.save_snapshot(b, &snapshot_of("b")).unwrap();

        let mut docs = store.list_documents().unwrap();
        docs.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(docs, expected);

        store.delete_document(a).unwrap();
        assert_eq!(store.list_documents().unwrap(), vec![b]);
        assert_eq!(store.load_snapshot(a).unwrap(), None);
    }

    #[test]
    fn test_reopen_persists() {
        let dir = tempfile::tempdir().unwrap();
        let doc = Uuid::new_v4();
        {
            let store = RocksSnapshotStore::open(StoreConfig::for_testing(dir.path())).unwrap();
            store.save_snapshot(doc, &snapshot_of("durable")).unwrap();
            store.flush().unwrap();
        }
        let store = RocksSnapshotStore::open(StoreConfig::for_testing(dir.path())).unwrap();
        assert_eq!(store.load_snapshot(doc).unwrap().unwrap().visible_text(), "durable");
    }
}
