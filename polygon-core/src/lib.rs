//! # polygon-core - Operation model and history engine for Polygon CAD
//!
//! Pure, synchronous building blocks shared by the server and clients.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐  derive   ┌──────────────────┐
//! │ [Operation]      │ ────────► │ SceneState       │
//! │ (ordered log)    │           │ (sketches/solids)│
//! └──────────────────┘           └──────────────────┘
//!          ▲ migrate_scene                │
//!          └──────────────────────────────┘
//!
//! ┌──────────────────┐  apply / revert   ┌──────────────────┐
//! │ HistoryEngine    │ ────────────────► │ DocumentState    │
//! │ (undo/redo/goto) │ ◄──── checkpoints │ CheckpointStore  │
//! └──────────────────┘                   └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`operation`] - Typed operations and parameter validation
//! - [`scene`] - Per-plane sketches and extruded shapes derived from operations
//! - [`migration`] - Client-only scenes to operation batches
//! - [`history`] - Action recording, undo/redo, checkpoint replay
//! - [`error`] - Error taxonomy

pub mod error;
pub mod history;
pub mod migration;
pub mod operation;
pub mod scene;

pub use error::{HistoryError, OperationError};
pub use history::{
    ActionDraft, ActionKind, CheckpointStore, DocumentState, HistoryEngine, HistoryEntry,
    HistoryOptions, HistorySink, MemoryCheckpointStore,
};
pub use migration::migrate_scene;
pub use operation::{
    Dimension, NewOperation, Operation, OperationId, OperationParams, OperationType, Point3,
};
pub use scene::{derive_extruded_shapes, derive_sketches, DrawingItem, ExtrudedShape, SceneState};

/// Document identifier.
pub type DocumentId = uuid::Uuid;

/// User identifier.
pub type UserId = uuid::Uuid;
