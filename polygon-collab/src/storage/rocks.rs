//! RocksDB-backed operation log.
//!
//! Column families:
//! - `operations`      - `StoredOperation` JSON, keyed by doc_id:sequence
//! - `operation_index` - operation id → doc_id:sequence
//! - `documents`       - latest scene JSON (LZ4 compressed)
//! - `checkpoints`     - history checkpoints (LZ4 compressed, keyed by doc_id:version)
//! - `history`         - history entries JSON, keyed by doc_id:version
//! - `metadata`        - per-document counters (bincode)
//!
//! Append and load cost are tracked by the `create_batch_100_ops` and
//! `get_by_document_1000_ops` benches in `benches/collab_benchmark.rs`.

use chrono::{DateTime, Utc};
use log::{debug, warn};
use polygon_core::history::state::state_hash;
use polygon_core::{
    CheckpointStore, DocumentId, DocumentState, HistoryEntry, HistoryError, HistorySink,
    Operation, OperationError, OperationId, SceneState,
};
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::SystemTime;
use uuid::Uuid;

/// Column family names.
const CF_OPERATIONS: &str = "operations";
const CF_OPERATION_INDEX: &str = "operation_index";
const CF_DOCUMENTS: &str = "documents";
const CF_CHECKPOINTS: &str = "checkpoints";
const CF_HISTORY: &str = "history";
const CF_METADATA: &str = "metadata";

/// All column family names for initialization.
const COLUMN_FAMILIES: &[&str] = &[
    CF_OPERATIONS,
    CF_OPERATION_INDEX,
    CF_DOCUMENTS,
    CF_CHECKPOINTS,
    CF_HISTORY,
    CF_METADATA,
];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 256MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 64MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("polygon_data"),
            block_cache_size: 256 * 1024 * 1024, // 256MB
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 64 * 1024 * 1024, // 64MB
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024, // 8MB
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024, // 4MB
        }
    }
}

/// Per-document counters, updated in the same batch as the data they describe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    /// Document UUID
    pub doc_id: Uuid,
    /// Sequence the next appended operation receives
    pub next_sequence: u64,
    /// Operations ever appended (live and soft-deleted)
    pub operation_count: u64,
    /// Soft-deleted operations
    pub deleted_count: u64,
    /// Uncompressed scene size in bytes
    pub scene_size: u64,
    /// Compressed scene size in bytes
    pub compressed_size: u64,
    /// Creation timestamp (seconds since epoch)
    pub created_at: u64,
    /// Last modified timestamp (seconds since epoch)
    pub updated_at: u64,
}

impl DocumentMetadata {
    fn new(doc_id: Uuid) -> Self {
        let now = now_secs();
        Self {
            doc_id,
            next_sequence: 0,
            operation_count: 0,
            deleted_count: 0,
            scene_size: 0,
            compressed_size: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn live_count(&self) -> u64 {
        self.operation_count.saturating_sub(self.deleted_count)
    }

    fn touch(&mut self) {
        self.updated_at = now_secs();
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

/// An operation as persisted; `deleted_at` marks a soft delete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredOperation {
    pub operation: Operation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl StoredOperation {
    pub fn live(operation: Operation) -> Self {
        Self {
            operation,
            deleted_at: None,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// A durable history checkpoint with an integrity hash of its state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointRecord {
    pub state: DocumentState,
    pub state_hash: String,
    pub created_at: DateTime<Utc>,
}

/// Checkpoint listing row: what a client needs to pick a version to load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointInfo {
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub state_hash: String,
}

impl From<&CheckpointRecord> for CheckpointInfo {
    fn from(record: &CheckpointRecord) -> Self {
        Self {
            version: record.state.version,
            created_at: record.created_at,
            state_hash: record.state_hash.clone(),
        }
    }
}

/// Storage errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// RocksDB internal error
    DatabaseError(String),
    /// Document not found
    NotFound(Uuid),
    /// Serialization failed
    SerializationError(String),
    /// Deserialization failed (including checkpoint hash mismatches)
    DeserializationError(String),
    /// Compression error
    CompressionError(String),
    /// Writer lock poisoned by a panicking writer
    LockPoisoned,
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::NotFound(id) => write!(f, "Document not found: {id}"),
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            StoreError::CompressionError(e) => write!(f, "Compression error: {e}"),
            StoreError::LockPoisoned => write!(f, "Writer lock poisoned"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

impl From<StoreError> for OperationError {
    fn from(e: StoreError) -> Self {
        OperationError::storage(e.to_string())
    }
}

impl From<StoreError> for HistoryError {
    fn from(e: StoreError) -> Self {
        HistoryError::Storage(e.to_string())
    }
}

/// RocksDB-backed operation log.
///
/// Reads go straight to the database. Writes that touch document metadata
/// go through a [`LogWriter`], which holds the store-wide writer lock, so a
/// sequence read, its validation and the batch that consumes it cannot
/// interleave with another writer.
pub struct OperationLog {
    /// RocksDB instance (single-threaded mode; writes serialize on the writer lock)
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    writer: Mutex<()>,
}

impl OperationLog {
    /// Open the log at the configured path.
    ///
    /// Creates the database and column families if they don't exist.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.set_max_total_wal_size(128 * 1024 * 1024); // 128MB WAL limit
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        debug!("Opened operation log at {}", config.path.display());
        Ok(Self {
            db,
            config,
            writer: Mutex::new(()),
        })
    }

    /// Build column-family-specific options.
    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024); // 16KB blocks
        opts.set_block_based_table_factory(&block_opts);

        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_OPERATIONS | CF_HISTORY => {
                // Many small appends, range-scanned by doc_id
                opts.set_max_write_buffer_number(4);
            }
            CF_OPERATION_INDEX | CF_METADATA | CF_DOCUMENTS => {
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_CHECKPOINTS => {
                // Values are already LZ4 framed
                opts.set_max_write_buffer_number(2);
                opts.set_compression_type(DBCompressionType::None);
            }
            _ => {}
        }

        opts
    }

    /// Acquire the store-wide writer lock.
    pub fn writer(&self) -> Result<LogWriter<'_>, StoreError> {
        let guard = self.writer.lock().map_err(|_| StoreError::LockPoisoned)?;
        Ok(LogWriter { log: self, _guard: guard })
    }

    // ─── Operations ───────────────────────────────────────────────────

    /// All stored operations of a document (soft-deleted included), by sequence.
    pub fn load_operations(&self, doc_id: Uuid) -> Result<Vec<StoredOperation>, StoreError> {
        self.scan_prefix(CF_OPERATIONS, doc_id, 0, |_, value| decode_json(value))
    }

    /// Live operations of a document, by sequence.
    pub fn live_operations(&self, doc_id: Uuid) -> Result<Vec<Operation>, StoreError> {
        Ok(self
            .load_operations(doc_id)?
            .into_iter()
            .filter(|stored| !stored.is_deleted())
            .map(|stored| stored.operation)
            .collect())
    }

    /// Where an operation lives: `(document, sequence)`.
    pub fn locate(&self, id: &OperationId) -> Result<Option<(Uuid, u64)>, StoreError> {
        let cf = self.cf(CF_OPERATION_INDEX)?;
        match self.db.get_cf(cf, id.as_str().as_bytes())? {
            Some(value) => split_key(&value)
                .map(Some)
                .ok_or_else(|| StoreError::DeserializationError("Invalid index entry".into())),
            None => Ok(None),
        }
    }

    /// Load one operation by id, whether live or soft-deleted.
    pub fn load_operation(
        &self,
        id: &OperationId,
    ) -> Result<Option<(Uuid, StoredOperation)>, StoreError> {
        let Some((doc_id, sequence)) = self.locate(id)? else {
            return Ok(None);
        };
        let cf = self.cf(CF_OPERATIONS)?;
        match self.db.get_cf(cf, versioned_key(doc_id, sequence))? {
            Some(value) => Ok(Some((doc_id, decode_json(&value)?))),
            None => Ok(None),
        }
    }

    // ─── Scenes ───────────────────────────────────────────────────────

    /// Load the persisted scene of a document, if one was saved.
    pub fn load_scene(&self, doc_id: Uuid) -> Result<Option<SceneState>, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        match self.db.get_cf(cf, doc_id.as_bytes())? {
            Some(compressed) => {
                let bytes = lz4_flex::decompress_size_prepended(&compressed)
                    .map_err(|e| StoreError::CompressionError(e.to_string()))?;
                SceneState::parse(&bytes)
                    .map(Some)
                    .map_err(|e| StoreError::DeserializationError(e.to_string()))
            }
            None => Ok(None),
        }
    }

    // ─── History ──────────────────────────────────────────────────────

    /// Persisted history entries of a document, by version.
    pub fn load_history(&self, doc_id: Uuid) -> Result<Vec<HistoryEntry>, StoreError> {
        self.load_history_range(doc_id, 0, u64::MAX)
    }

    /// Persisted history entries with `from <= version <= to`.
    pub fn load_history_range(
        &self,
        doc_id: Uuid,
        from: u64,
        to: u64,
    ) -> Result<Vec<HistoryEntry>, StoreError> {
        let entries: Vec<HistoryEntry> =
            self.scan_prefix(CF_HISTORY, doc_id, from, |_, value| decode_json(value))?;
        Ok(entries.into_iter().take_while(|e| e.version <= to).collect())
    }

    pub fn append_history(&self, doc_id: Uuid, entries: &[HistoryEntry]) -> Result<(), StoreError> {
        let cf = self.cf(CF_HISTORY)?;
        let mut batch = WriteBatch::default();
        for entry in entries {
            batch.put_cf(cf, versioned_key(doc_id, entry.version), encode_json(entry)?);
        }
        self.write(batch)
    }

    pub fn save_checkpoint_record(
        &self,
        doc_id: Uuid,
        state: &DocumentState,
    ) -> Result<(), StoreError> {
        let cf = self.cf(CF_CHECKPOINTS)?;
        let record = CheckpointRecord {
            state: state.clone(),
            state_hash: state_hash(state),
            created_at: Utc::now(),
        };
        let compressed = lz4_flex::compress_prepend_size(&encode_json(&record)?);
        let mut batch = WriteBatch::default();
        batch.put_cf(cf, versioned_key(doc_id, state.version), compressed);
        self.write(batch)
    }

    pub fn load_checkpoint_record(
        &self,
        doc_id: Uuid,
        version: u64,
    ) -> Result<Option<CheckpointRecord>, StoreError> {
        let cf = self.cf(CF_CHECKPOINTS)?;
        match self.db.get_cf(cf, versioned_key(doc_id, version))? {
            Some(value) => decode_checkpoint(&value).map(Some),
            None => Ok(None),
        }
    }

    /// Highest-version checkpoint of a document.
    pub fn latest_checkpoint_record(
        &self,
        doc_id: Uuid,
    ) -> Result<Option<CheckpointRecord>, StoreError> {
        let cf = self.cf(CF_CHECKPOINTS)?;
        let start = versioned_key(doc_id, u64::MAX);
        let mut iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&start, Direction::Reverse));
        match iter.next() {
            Some(item) => {
                let (key, value) = item?;
                if key.len() < 24 || &key[..16] != doc_id.as_bytes() {
                    return Ok(None);
                }
                decode_checkpoint(&value).map(Some)
            }
            None => Ok(None),
        }
    }

    /// Every checkpoint of a document, oldest first.
    pub fn list_checkpoints(&self, doc_id: Uuid) -> Result<Vec<CheckpointInfo>, StoreError> {
        self.scan_prefix(CF_CHECKPOINTS, doc_id, 0, |_, value| {
            decode_checkpoint(value).map(|record| CheckpointInfo::from(&record))
        })
    }

    /// Delete checkpoints with a version strictly above `version`.
    pub fn discard_checkpoints_after(&self, doc_id: Uuid, version: u64) -> Result<u64, StoreError> {
        self.delete_versions_after(CF_CHECKPOINTS, doc_id, version)
    }

    /// Drop history entries above `version` (superseded or cleared history).
    pub fn discard_history_after(&self, doc_id: Uuid, version: u64) -> Result<u64, StoreError> {
        self.delete_versions_after(CF_HISTORY, doc_id, version)
    }

    fn delete_versions_after(&self, cf_name: &str, doc_id: Uuid, version: u64) -> Result<u64, StoreError> {
        let Some(from) = version.checked_add(1) else {
            return Ok(0);
        };
        let cf = self.cf(cf_name)?;
        let keys = self.scan_prefix(cf_name, doc_id, from, |key, _| Ok(key.to_vec()))?;
        if keys.is_empty() {
            return Ok(0);
        }
        let mut batch = WriteBatch::default();
        for key in &keys {
            batch.delete_cf(cf, key);
        }
        self.write(batch)?;
        Ok(keys.len() as u64)
    }

    // ─── Metadata ─────────────────────────────────────────────────────

    /// Load document metadata.
    pub fn load_metadata(&self, doc_id: Uuid) -> Result<DocumentMetadata, StoreError> {
        self.find_metadata(doc_id)?
            .ok_or(StoreError::NotFound(doc_id))
    }

    pub fn document_exists(&self, doc_id: Uuid) -> Result<bool, StoreError> {
        Ok(self.find_metadata(doc_id)?.is_some())
    }

    /// List all document IDs with stored operations or scenes.
    pub fn list_documents(&self) -> Result<Vec<Uuid>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut doc_ids = Vec::new();

        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            if key.len() == 16 {
                let id = Uuid::from_bytes(
                    key.as_ref()
                        .try_into()
                        .map_err(|_| StoreError::DeserializationError("Invalid UUID key".into()))?,
                );
                doc_ids.push(id);
            }
        }

        Ok(doc_ids)
    }

    /// Force a memtable flush.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    /// Get the database path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    /// Get a column family handle.
    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }

    fn find_metadata(&self, doc_id: Uuid) -> Result<Option<DocumentMetadata>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(cf, doc_id.as_bytes())? {
            Some(bytes) => DocumentMetadata::decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    fn write(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    /// Visit every `doc_id:n` key with `n >= from`, in key order.
    fn scan_prefix<T>(
        &self,
        cf_name: &str,
        doc_id: Uuid,
        from: u64,
        mut visit: impl FnMut(&[u8], &[u8]) -> Result<T, StoreError>,
    ) -> Result<Vec<T>, StoreError> {
        let cf = self.cf(cf_name)?;
        let start = versioned_key(doc_id, from);
        let mut out = Vec::new();

        for item in self
            .db
            .iterator_cf(cf, IteratorMode::From(&start, Direction::Forward))
        {
            let (key, value) = item?;
            // Stop once past this document's key prefix
            if key.len() < 24 || &key[..16] != doc_id.as_bytes() {
                break;
            }
            out.push(visit(key.as_ref(), value.as_ref())?);
        }

        Ok(out)
    }
}

/// Exclusive write access to the log.
pub struct LogWriter<'a> {
    log: &'a OperationLog,
    _guard: MutexGuard<'a, ()>,
}

impl LogWriter<'_> {
    /// Sequence the next appended operation of `doc_id` receives.
    pub fn next_sequence(&self, doc_id: Uuid) -> Result<u64, StoreError> {
        Ok(self
            .log
            .find_metadata(doc_id)?
            .map(|meta| meta.next_sequence)
            .unwrap_or(0))
    }

    /// Append operations, their index entries and the metadata in one batch.
    ///
    /// Sequences must start at `next_sequence` and be contiguous.
    pub fn append(&self, doc_id: Uuid, ops: &[Operation]) -> Result<DocumentMetadata, StoreError> {
        let cf_ops = self.log.cf(CF_OPERATIONS)?;
        let cf_index = self.log.cf(CF_OPERATION_INDEX)?;
        let cf_meta = self.log.cf(CF_METADATA)?;

        let mut meta = self
            .log
            .find_metadata(doc_id)?
            .unwrap_or_else(|| DocumentMetadata::new(doc_id));

        let mut batch = WriteBatch::default();
        for (offset, op) in ops.iter().enumerate() {
            let expected = meta.next_sequence + offset as u64;
            if op.sequence != expected {
                return Err(StoreError::SerializationError(format!(
                    "Operation {} has sequence {}, expected {}",
                    op.id, op.sequence, expected
                )));
            }
            let key = versioned_key(doc_id, op.sequence);
            batch.put_cf(cf_ops, &key, encode_json(&StoredOperation::live(op.clone()))?);
            batch.put_cf(cf_index, op.id.as_str().as_bytes(), &key);
        }

        meta.next_sequence += ops.len() as u64;
        meta.operation_count += ops.len() as u64;
        meta.touch();
        batch.put_cf(cf_meta, doc_id.as_bytes(), meta.encode()?);

        self.log.write(batch)?;
        debug!("Appended {} operation(s) to document {}", ops.len(), doc_id);
        Ok(meta)
    }

    /// Overwrite a stored operation in place (update or soft delete).
    pub fn replace(&self, doc_id: Uuid, stored: &StoredOperation) -> Result<(), StoreError> {
        let cf_ops = self.log.cf(CF_OPERATIONS)?;
        let cf_meta = self.log.cf(CF_METADATA)?;
        let key = versioned_key(doc_id, stored.operation.sequence);

        let previous: Option<StoredOperation> = match self.log.db.get_cf(cf_ops, &key)? {
            Some(value) => Some(decode_json(&value)?),
            None => None,
        };
        let Some(previous) = previous else {
            return Err(StoreError::NotFound(doc_id));
        };

        let mut meta = self.log.load_metadata(doc_id)?;
        if stored.is_deleted() && !previous.is_deleted() {
            meta.deleted_count += 1;
        }
        meta.touch();

        let mut batch = WriteBatch::default();
        batch.put_cf(cf_ops, &key, encode_json(stored)?);
        batch.put_cf(cf_meta, doc_id.as_bytes(), meta.encode()?);
        self.log.write(batch)
    }

    /// Save the scene of a document (LZ4 compressed).
    pub fn save_scene(&self, doc_id: Uuid, scene: &SceneState) -> Result<DocumentMetadata, StoreError> {
        let cf_docs = self.log.cf(CF_DOCUMENTS)?;
        let cf_meta = self.log.cf(CF_METADATA)?;

        let json = scene
            .to_json()
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;
        let compressed = lz4_flex::compress_prepend_size(&json);

        let mut meta = self
            .log
            .find_metadata(doc_id)?
            .unwrap_or_else(|| DocumentMetadata::new(doc_id));
        meta.scene_size = json.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.touch();

        let mut batch = WriteBatch::default();
        batch.put_cf(cf_docs, doc_id.as_bytes(), &compressed);
        batch.put_cf(cf_meta, doc_id.as_bytes(), meta.encode()?);
        self.log.write(batch)?;

        Ok(meta)
    }

    /// Delete a document: operations, index entries, scene, history,
    /// checkpoints and metadata.
    pub fn delete_document(&self, doc_id: Uuid) -> Result<(), StoreError> {
        let log = self.log;
        let mut batch = WriteBatch::default();

        let cf_index = log.cf(CF_OPERATION_INDEX)?;
        for stored in log.load_operations(doc_id)? {
            batch.delete_cf(cf_index, stored.operation.id.as_str().as_bytes());
        }
        for cf_name in [CF_OPERATIONS, CF_HISTORY, CF_CHECKPOINTS] {
            let cf = log.cf(cf_name)?;
            for key in log.scan_prefix(cf_name, doc_id, 0, |key, _| Ok(key.to_vec()))? {
                batch.delete_cf(cf, key);
            }
        }
        batch.delete_cf(log.cf(CF_DOCUMENTS)?, doc_id.as_bytes());
        batch.delete_cf(log.cf(CF_METADATA)?, doc_id.as_bytes());

        log.write(batch)
    }
}

// ─── History persistence seams ────────────────────────────────────────

impl CheckpointStore for OperationLog {
    fn save_checkpoint(
        &self,
        document_id: DocumentId,
        version: u64,
        state: &DocumentState,
    ) -> Result<(), HistoryError> {
        if state.version != version {
            return Err(HistoryError::Storage(format!(
                "Checkpoint state is at version {}, not {}",
                state.version, version
            )));
        }
        Ok(self.save_checkpoint_record(document_id, state)?)
    }

    fn load_checkpoint(
        &self,
        document_id: DocumentId,
        version: u64,
    ) -> Result<Option<DocumentState>, HistoryError> {
        Ok(self
            .load_checkpoint_record(document_id, version)?
            .map(|record| record.state))
    }

    fn latest_checkpoint(&self, document_id: DocumentId) -> Result<Option<DocumentState>, HistoryError> {
        Ok(self
            .latest_checkpoint_record(document_id)?
            .map(|record| record.state))
    }

    fn discard_after(&self, document_id: DocumentId, version: u64) -> Result<(), HistoryError> {
        let removed = self.discard_checkpoints_after(document_id, version)?;
        if removed > 0 {
            debug!(
                "Discarded {} checkpoint(s) above version {} of document {}",
                removed, version, document_id
            );
        }
        Ok(())
    }
}

impl HistorySink for OperationLog {
    fn save_entries(&self, document_id: DocumentId, entries: &[HistoryEntry]) -> Result<(), HistoryError> {
        Ok(self.append_history(document_id, entries)?)
    }

    fn discard_entries_after(&self, document_id: DocumentId, version: u64) -> Result<(), HistoryError> {
        let removed = self.discard_history_after(document_id, version)?;
        if removed > 0 {
            debug!(
                "Discarded {} history entries above version {} of document {}",
                removed, version, document_id
            );
        }
        Ok(())
    }
}

// ─── Encoding ─────────────────────────────────────────────────────────

/// Build a key: doc_id (16 bytes) + sequence or version (8 bytes big-endian).
fn versioned_key(doc_id: Uuid, n: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(24);
    key.extend_from_slice(doc_id.as_bytes());
    key.extend_from_slice(&n.to_be_bytes());
    key
}

fn split_key(key: &[u8]) -> Option<(Uuid, u64)> {
    if key.len() != 24 {
        return None;
    }
    let doc_id = Uuid::from_bytes(key[..16].try_into().ok()?);
    let n = u64::from_be_bytes(key[16..24].try_into().ok()?);
    Some((doc_id, n))
}

fn encode_json<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    serde_json::to_vec(value).map_err(|e| StoreError::SerializationError(e.to_string()))
}

fn decode_json<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    serde_json::from_slice(bytes).map_err(|e| StoreError::DeserializationError(e.to_string()))
}

fn decode_checkpoint(value: &[u8]) -> Result<CheckpointRecord, StoreError> {
    let bytes = lz4_flex::decompress_size_prepended(value)
        .map_err(|e| StoreError::CompressionError(e.to_string()))?;
    let record: CheckpointRecord = decode_json(&bytes)?;
    let actual = state_hash(&record.state);
    if actual != record.state_hash {
        warn!(
            "Checkpoint at version {} failed its integrity check",
            record.state.version
        );
        return Err(StoreError::DeserializationError(format!(
            "Checkpoint hash mismatch: stored {}, computed {}",
            record.state_hash, actual
        )));
    }
    Ok(record)
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
