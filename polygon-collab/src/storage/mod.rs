//! Persistent storage layer for operation logs.
//!
//! Architecture:
//! ```text
//! ┌────────────────┐  batches   ┌──────────────┐
//! │ OperationStore │ ─────────► │ OperationLog │
//! │ (validation)   │            │ (RocksDB)    │
//! └────────────────┘            └──────┬───────┘
//! ┌────────────────┐  checkpoints      │ column families
//! │ HistoryEngine  │ ──────────────────┤
//! └────────────────┘                   ▼
//!              ┌──────────────────────────────────────────┐
//!              │ CF "operations"      - ordered op log    │
//!              │ CF "operation_index" - id → doc:seq      │
//!              │ CF "documents"       - latest scene      │
//!              │ CF "checkpoints"     - history snapshots │
//!              │ CF "history"         - history entries   │
//!              │ CF "metadata"        - counters          │
//!              └──────────────────────────────────────────┘
//! ```
//!
//! Benches: `create_batch_100_ops` (one 100-item batch through the store)
//! and `get_by_document_1000_ops` (full live-operation load).

pub mod rocks;

pub use rocks::{
    CheckpointInfo, CheckpointRecord, DocumentMetadata, LogWriter, OperationLog, StoreConfig, StoreError,
    StoredOperation,
};
