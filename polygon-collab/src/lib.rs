//! # polygon-collab - Operation store and real-time sync for Polygon CAD
//!
//! Persists the operation log, serves it to collaborators over WebSocket,
//! and keeps each client's optimistic edits in step with the store.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ SyncBridge  │                     │ SyncServer  │
//! │ (per doc)   │                     │ (central)   │
//! └──────┬──────┘                     └──────┬──────┘
//!        │                                   │
//!        ▼                                   ▼
//! ┌─────────────┐     Binary Proto   ┌─────────────────┐
//! │ SyncClient  │ ◄─────────────────► │ OperationStore  │
//! │ (per user)  │                     │ + RoomRegistry  │
//! └─────────────┘                     └───────┬─────────┘
//!                                             │
//!                                     ┌───────┴───────┐
//!                                     │ OperationLog  │
//!                                     │ (RocksDB)     │
//!                                     └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`storage`] - RocksDB operation log, scenes, checkpoints, history
//! - [`store`] - Authorized, validated operation service
//! - [`auth`] - Membership and role checks
//! - [`cache`] - Derived-geometry cache invalidation
//! - [`export`] - Native JSON export
//! - [`bridge`] - Debounced autosave and scene sync per mounted document
//! - [`history_sync`] - Periodic flush of history outboxes
//! - [`protocol`] - Binary wire protocol (bincode-encoded SyncMessage)
//! - [`room`] - Per-document peer sets and frame fan-out
//! - [`server`] - WebSocket sync server
//! - [`client`] - WebSocket sync client with offline queue
//!
//! ## Benches
//!
//! `benches/collab_benchmark.rs` times frame encode/decode, RPC request
//! round-trips, room fan-out (1,000 frames to 100 peers), offline-queue
//! replay, batch creation and full-document loads.

pub mod auth;
pub mod bridge;
pub mod cache;
pub mod client;
pub mod export;
pub mod history_sync;
pub mod protocol;
pub mod room;
pub mod server;
pub mod storage;
pub mod store;

// Re-exports for convenience
pub use auth::{Authorizer, DocumentInfo, MembershipDirectory, Role, Session};
pub use bridge::{
    BridgeConfig, BridgeStats, FlushOutcome, LocalBackend, OperationBackend, OutboundEvent,
    StateTransport, SyncBridge, SyncError,
};
pub use cache::{GeometryCache, GeometryCacheRegistry};
pub use client::{
    ClientConfig, ConnectionState, OfflineQueue, RemoteHistory, SyncClient, SyncEvent,
};
pub use export::{export_document, ExportArtifact, ExportFormat, ExportOptions};
pub use history_sync::{spawn_history_sync, HistorySyncHandle};
pub use protocol::{MessageType, PeerInfo, ProtocolError, RpcCall, RpcReply, SyncMessage};
pub use room::{Room, RoomRegistry};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use storage::{CheckpointInfo, OperationLog, StoreConfig, StoreError};
pub use store::OperationStore;
