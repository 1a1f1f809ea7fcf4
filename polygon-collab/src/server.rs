//! WebSocket sync server with room-based document routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── Room (doc_id) ── frame channel
//! Client B ──┘         │
//!                      ├── OperationStore ── OperationLog (RocksDB)
//!                      │       │
//!                      │       ├── operations / index (bincode)
//!                      │       └── scenes (LZ4)
//!                      │
//!           ┌──────────┼───────────┐
//!           ▼          ▼           ▼
//!        Client A   Client B    Client C
//! ```
//!
//! Each connection joins exactly one document. After `Join` the server:
//! - answers `StateRequest` with the persisted scene
//! - validates, persists and relays `StateUpdate` as `StateUpdated`
//! - relays `OperationsSaved`
//! - executes `Request` frames against the store as the joined user
//!
//! Peers never receive their own frames.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use polygon_core::{OperationError, SceneState};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::auth::{Authorizer, Session};
use crate::room::{FrameReceiver, Room, RoomRegistry};
use crate::cache::GeometryCacheRegistry;
use crate::export::export_document;
use crate::protocol::{
    JoinAccepted, JoinRequest, MessageType, PeerInfo, ProtocolError, RpcCall, RpcReply, RpcRequest,
    RpcResponse, SyncMessage,
};
use crate::storage::{OperationLog, StoreConfig, StoreError};
use crate::store::OperationStore;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum peers per room
    pub max_peers_per_room: usize,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// Seconds between server pings; 0 disables the heartbeat
    pub heartbeat_interval_secs: u64,
    /// RocksDB directory of the operation log
    pub storage_path: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_room: 100,
            broadcast_capacity: 256,
            heartbeat_interval_secs: 30,
            storage_path: PathBuf::from("polygon_data"),
        }
    }
}

impl ServerConfig {
    /// Ephemeral port and small rooms.
    pub fn for_testing(storage_path: impl Into<PathBuf>) -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            max_peers_per_room: 10,
            broadcast_capacity: 64,
            heartbeat_interval_secs: 30,
            storage_path: storage_path.into(),
        }
    }

    /// Defaults overridden by `POLYGON_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(addr) = lookup("POLYGON_BIND_ADDR") {
            config.bind_addr = addr;
        }
        if let Some(path) = lookup("POLYGON_STORAGE_PATH") {
            config.storage_path = PathBuf::from(path);
        }
        if let Some(n) = parse_var(&lookup, "POLYGON_MAX_PEERS") {
            config.max_peers_per_room = n;
        }
        if let Some(n) = parse_var(&lookup, "POLYGON_BROADCAST_CAPACITY") {
            config.broadcast_capacity = n;
        }
        if let Some(n) = parse_var(&lookup, "POLYGON_HEARTBEAT_SECS") {
            config.heartbeat_interval_secs = n;
        }
        config
    }
}

fn parse_var<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Ignoring {key}={raw}: not a valid number");
            None
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
    pub rpc_calls: u64,
    /// Frames lagging peers never received
    pub dropped_frames: u64,
    pub persisted_scenes: u64,
}

/// State shared by every connection task.
#[derive(Clone)]
struct ServerContext {
    config: ServerConfig,
    rooms: Arc<RoomRegistry>,
    store: Arc<OperationStore>,
    stats: Arc<RwLock<ServerStats>>,
}

/// The joined side of a connection.
struct JoinedPeer {
    peer_id: Uuid,
    doc_id: Uuid,
    session: Session,
    room: Arc<Room>,
}

/// The sync server.
pub struct SyncServer {
    ctx: ServerContext,
}

impl SyncServer {
    /// Open the operation log at `config.storage_path` and build the store.
    pub fn new(config: ServerConfig, auth: Arc<dyn Authorizer>) -> Result<Self, StoreError> {
        let log = OperationLog::open(StoreConfig {
            path: config.storage_path.clone(),
            ..StoreConfig::default()
        })?;
        let store = OperationStore::new(Arc::new(log), auth, Arc::new(GeometryCacheRegistry::new()));
        Ok(Self::with_store(config, Arc::new(store)))
    }

    /// Serve an existing store.
    pub fn with_store(config: ServerConfig, store: Arc<OperationStore>) -> Self {
        let rooms = Arc::new(RoomRegistry::new(config.broadcast_capacity));
        Self {
            ctx: ServerContext {
                config,
                rooms,
                store,
                stats: Arc::new(RwLock::new(ServerStats::default())),
            },
        }
    }

    /// Bind `config.bind_addr` and serve until the listener fails.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.ctx.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        info!("Sync server listening on {}", listener.local_addr()?);
        let documents = self.ctx.store.log().list_documents()?;
        info!("Operation log holds {} document(s)", documents.len());

        loop {
            let (stream, addr) = listener.accept().await?;
            debug!("New TCP connection from {addr}");

            let ctx = self.ctx.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, ctx).await {
                    error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        ctx: ServerContext,
    ) -> Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        info!("WebSocket connection established from {addr}");

        {
            let mut s = ctx.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let mut joined: Option<JoinedPeer> = None;
        let result = Self::connection_loop(&ctx, addr, ws_stream, &mut joined).await;

        // Cleanup: leave the room
        if let Some(peer) = joined {
            peer.room.leave(&peer.peer_id).await;
            let _ = peer.room.publish(&SyncMessage::peer_left(peer.peer_id, peer.doc_id));
            if ctx.rooms.close_if_empty(&peer.doc_id).await {
                info!("Room {} removed (empty)", peer.doc_id);
            }
            info!("Peer {} left doc {}", peer.peer_id, peer.doc_id);
        }
        {
            let mut s = ctx.stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
            s.active_rooms = ctx.rooms.len().await;
        }

        result
    }

    async fn connection_loop(
        ctx: &ServerContext,
        addr: SocketAddr,
        ws_stream: WebSocketStream<TcpStream>,
        joined: &mut Option<JoinedPeer>,
    ) -> Result<(), BoxError> {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let mut broadcast_rx: Option<FrameReceiver> = None;

        // Ping every period; two silent periods close the connection.
        let period = Duration::from_secs(ctx.config.heartbeat_interval_secs);
        let mut heartbeat = (!period.is_zero()).then(|| {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });
        let mut last_seen = Instant::now();

        loop {
            tokio::select! {
                // Incoming WebSocket message
                msg = ws_receiver.next() => {
                    last_seen = Instant::now();
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            {
                                let mut s = ctx.stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += bytes.len() as u64;
                            }
                            let frame = match SyncMessage::decode(&bytes) {
                                Ok(frame) => frame,
                                Err(e) => {
                                    warn!("Failed to decode message from {addr}: {e}");
                                    continue;
                                }
                            };

                            let Some(peer) = joined.as_ref() else {
                                // First frame: join a document room
                                match Self::join(ctx, &frame).await {
                                    Ok((peer, rx, reply)) => {
                                        ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                                        *joined = Some(peer);
                                        broadcast_rx = Some(rx);
                                    }
                                    Err(e) => {
                                        warn!("Rejected join from {addr}: {e}");
                                        let reply = SyncMessage::error(frame.peer_id, frame.doc_id, &e)?;
                                        ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                                        let _ = ws_sender.send(Message::Close(None)).await;
                                        return Ok(());
                                    }
                                }
                                continue;
                            };

                            if let Some(reply) = Self::handle_frame(ctx, peer, frame).await? {
                                ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                            }
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            info!("Connection closed from {addr}");
                            return Ok(());
                        }

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Err(e)) => {
                            error!("WebSocket error from {addr}: {e}");
                            return Ok(());
                        }

                        _ => {}
                    }
                }

                // Outgoing broadcast frame
                msg = async {
                    match broadcast_rx.as_mut() {
                        Some(rx) => rx.recv().await,
                        // Not joined yet: wait forever
                        None => std::future::pending().await,
                    }
                } => {
                    match msg {
                        Ok(data) => {
                            // Don't echo back to sender
                            if let (Ok(frame), Some(peer)) = (SyncMessage::decode(&data), joined.as_ref()) {
                                if frame.peer_id == peer.peer_id {
                                    continue;
                                }
                            }
                            ws_sender.send(Message::Binary(data.to_vec().into())).await?;
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!("Peer at {addr} lagged by {n} frames");
                            ctx.stats.write().await.dropped_frames += n;
                        }
                        Err(broadcast::error::RecvError::Closed) => return Ok(()),
                    }
                }

                // Heartbeat
                _ = async {
                    match heartbeat.as_mut() {
                        Some(ticker) => {
                            ticker.tick().await;
                        }
                        None => std::future::pending().await,
                    }
                } => {
                    if last_seen.elapsed() >= period * 2 {
                        info!("Peer at {addr} missed two heartbeats, closing");
                        let _ = ws_sender.send(Message::Close(None)).await;
                        return Ok(());
                    }
                    ws_sender.send(Message::Ping(Vec::new().into())).await?;
                }
            }
        }
    }

    /// Check membership and capacity, then enter the document's room.
    async fn join(
        ctx: &ServerContext,
        frame: &SyncMessage,
    ) -> Result<(JoinedPeer, FrameReceiver, SyncMessage), OperationError> {
        let request: JoinRequest = frame
            .json(MessageType::Join)
            .map_err(|_| OperationError::invalid("First frame must be a valid join"))?;
        let session = Session::new(request.user_id);
        ctx.store.document(&session, frame.doc_id)?;

        let peer_id = if frame.peer_id.is_nil() { Uuid::new_v4() } else { frame.peer_id };
        let info = PeerInfo {
            peer_id,
            user_id: request.user_id,
        };

        let room = ctx.rooms.open(frame.doc_id).await;
        let Some(rx) = room.admit(info.clone(), ctx.config.max_peers_per_room).await else {
            ctx.rooms.close_if_empty(&frame.doc_id).await;
            return Err(OperationError::forbidden("Document room is full"));
        };

        let peer_count = room.member_count().await;
        if let Ok(msg) = SyncMessage::with_json(MessageType::PeerJoined, peer_id, frame.doc_id, 0, &info) {
            let _ = room.publish(&msg);
        }
        ctx.stats.write().await.active_rooms = ctx.rooms.len().await;

        let reply = SyncMessage::with_json(
            MessageType::Joined,
            peer_id,
            frame.doc_id,
            0,
            &JoinAccepted { peer_id, peer_count },
        )
        .map_err(|e| OperationError::storage(e.to_string()))?;

        info!(
            "Peer {} (user {}) joined doc {} ({} in room)",
            peer_id, request.user_id, frame.doc_id, peer_count
        );

        Ok((
            JoinedPeer {
                peer_id,
                doc_id: frame.doc_id,
                session,
                room,
            },
            rx,
            reply,
        ))
    }

    /// Handle one frame of a joined peer. Returns the direct reply, if any.
    async fn handle_frame(
        ctx: &ServerContext,
        peer: &JoinedPeer,
        frame: SyncMessage,
    ) -> Result<Option<SyncMessage>, ProtocolError> {
        match frame.msg_type {
            MessageType::StateRequest => {
                let scene = ctx.store.load_scene(&peer.session, peer.doc_id);
                match scene {
                    Ok(scene) => SyncMessage::with_json(
                        MessageType::StateHydrated,
                        peer.peer_id,
                        peer.doc_id,
                        0,
                        &scene,
                    )
                    .map(Some),
                    Err(e) => SyncMessage::error(peer.peer_id, peer.doc_id, &e).map(Some),
                }
            }

            MessageType::StateUpdate => {
                let persisted = SceneState::parse(&frame.payload)
                    .and_then(|scene| ctx.store.save_scene(&peer.session, peer.doc_id, &scene));
                if let Err(e) = persisted {
                    warn!("Rejected state update from peer {}: {e}", peer.peer_id);
                    return SyncMessage::error(peer.peer_id, peer.doc_id, &e).map(Some);
                }
                ctx.stats.write().await.persisted_scenes += 1;

                let relay = SyncMessage::new(
                    MessageType::StateUpdated,
                    peer.peer_id,
                    peer.doc_id,
                    frame.clock,
                    frame.payload,
                );
                peer.room.publish(&relay)?;
                Ok(None)
            }

            MessageType::OperationsSaved => {
                let relay = SyncMessage::new(
                    MessageType::OperationsSaved,
                    peer.peer_id,
                    peer.doc_id,
                    frame.clock,
                    frame.payload,
                );
                peer.room.publish(&relay)?;
                Ok(None)
            }

            MessageType::Request => {
                let request: RpcRequest = frame.json(MessageType::Request)?;
                ctx.stats.write().await.rpc_calls += 1;
                debug!("RPC {} from peer {}", request.request_id, peer.peer_id);
                let response = RpcResponse {
                    request_id: request.request_id,
                    result: Self::execute(ctx, peer, request.call),
                };
                SyncMessage::with_json(MessageType::Response, peer.peer_id, peer.doc_id, 0, &response)
                    .map(Some)
            }

            MessageType::Ping => Ok(Some(SyncMessage::pong(peer.peer_id))),

            MessageType::Join => {
                let e = OperationError::invalid("Connection already joined a document");
                SyncMessage::error(peer.peer_id, peer.doc_id, &e).map(Some)
            }

            other => {
                debug!("Unhandled message type: {:?}", other);
                Ok(None)
            }
        }
    }

    /// Run a store call as the joined user.
    fn execute(ctx: &ServerContext, peer: &JoinedPeer, call: RpcCall) -> Result<RpcReply, OperationError> {
        let store = &ctx.store;
        let session = &peer.session;
        match call {
            RpcCall::GetOperations => store
                .get_by_document(session, peer.doc_id)
                .map(RpcReply::Operations),
            RpcCall::GetOperation { id } => store.get_by_id(session, &id).map(RpcReply::Operation),
            RpcCall::CreateBatch { operations } => store
                .create_batch(session, peer.doc_id, operations)
                .map(RpcReply::Operations),
            RpcCall::Update { id, parameters } => store
                .update(session, &id, &parameters)
                .map(RpcReply::Operation),
            RpcCall::Delete { id } => store.delete(session, &id).map(|_| RpcReply::Done),
            RpcCall::LoadScene => store.load_scene(session, peer.doc_id).map(RpcReply::Scene),
            RpcCall::SaveScene { scene } => store
                .save_scene(session, peer.doc_id, &scene)
                .map(|_| RpcReply::Done),
            RpcCall::Export { format, options } => {
                export_document(store, session, peer.doc_id, format, &options).map(RpcReply::Export)
            }
            RpcCall::SaveHistoryEntries { entries } => store
                .save_history_entries(session, peer.doc_id, &entries)
                .map(|_| RpcReply::Done),
            RpcCall::GetHistory { from, to } => store
                .get_history(session, peer.doc_id, from, to)
                .map(RpcReply::History),
            RpcCall::DiscardHistoryAfter { version } => store
                .discard_history_after(session, peer.doc_id, version)
                .map(|_| RpcReply::Done),
            RpcCall::GetCheckpoint { version } => store
                .get_checkpoint(session, peer.doc_id, version)
                .map(RpcReply::State),
            RpcCall::SaveCheckpoint { version, state } => store
                .save_checkpoint(session, peer.doc_id, version, &state)
                .map(|_| RpcReply::Done),
            RpcCall::GetLatestState => store.latest_state(session, peer.doc_id).map(RpcReply::State),
            RpcCall::GetCheckpoints => store
                .list_checkpoints(session, peer.doc_id)
                .map(RpcReply::Checkpoints),
            RpcCall::DiscardCheckpointsAfter { version } => store
                .discard_checkpoints_after(session, peer.doc_id, version)
                .map(|_| RpcReply::Done),
        }
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.ctx.stats.read().await.clone();
        stats.active_rooms = self.ctx.rooms.len().await;
        stats
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.ctx.config.bind_addr
    }

    pub fn store(&self) -> &Arc<OperationStore> {
        &self.ctx.store
    }
}
