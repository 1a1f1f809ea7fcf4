//! WebSocket sync client for connecting to the collaboration server.
//!
//! Provides:
//! - Connection lifecycle (connect with join handshake, disconnect)
//! - Scene updates and saved-operation notices to the room
//! - Store RPC with per-request timeouts, including history and checkpoints
//! - Offline queue for scene updates emitted while disconnected
//!
//! A [`SyncClient`] is a cheap handle; clones share one connection. It
//! implements both bridge collaborator traits, so a [`crate::bridge::SyncBridge`]
//! can run directly on top of it, and [`RemoteHistory`] adapts it to the
//! history engine's persistence seams.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use polygon_core::{
    CheckpointStore, DocumentId, DocumentState, HistoryEntry, HistoryError, HistorySink,
    NewOperation, Operation, OperationError, OperationId, SceneState, UserId,
};
use serde_json::{Map, Value};
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::bridge::{OperationBackend, OutboundEvent, StateTransport, SyncError};
use crate::export::{ExportArtifact, ExportFormat, ExportOptions};
use crate::protocol::{
    JoinAccepted, MessageType, PeerInfo, ProtocolError, RpcCall, RpcReply, RpcRequest, RpcResponse,
    SyncMessage,
};
use crate::storage::CheckpointInfo;

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// Join accepted
    Connected,
    /// Connection lost
    Disconnected,
    /// `document:state:updated` from another peer (scene JSON)
    RemoteState {
        peer_id: Uuid,
        clock: u64,
        scene: Vec<u8>,
    },
    /// `document:state:hydrated`: the persisted scene, if any
    Hydrated(Option<SceneState>),
    /// `document:operations:saved` from another peer
    OperationsSaved {
        peer_id: Uuid,
        operations: Vec<Operation>,
    },
    /// A peer joined the document
    PeerJoined(PeerInfo),
    /// A peer left the document
    PeerLeft(Uuid),
    /// The server refused a frame
    Rejected(OperationError),
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server URL, e.g. `ws://127.0.0.1:9090`
    pub server_url: String,
    /// Deadline for the join handshake and each RPC
    pub request_timeout: Duration,
    /// Scene updates kept while disconnected
    pub offline_queue_capacity: usize,
    /// Buffered application events
    pub event_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:9090".to_string(),
            request_timeout: Duration::from_secs(10),
            offline_queue_capacity: 10_000,
            event_capacity: 256,
        }
    }
}

impl ClientConfig {
    pub fn for_testing(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            request_timeout: Duration::from_secs(2),
            offline_queue_capacity: 16,
            event_capacity: 64,
        }
    }
}

/// Offline queue for scene updates emitted while disconnected.
///
/// Queued updates are replayed in order on connect.
/// Target: 1000 queued updates replay in <50ms.
pub struct OfflineQueue {
    queue: VecDeque<QueuedUpdate>,
    max_size: usize,
}

#[derive(Debug, Clone)]
struct QueuedUpdate {
    clock: u64,
    payload: Vec<u8>,
}

impl OfflineQueue {
    /// Create a new offline queue with max capacity.
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Queue an update for later replay. False when full.
    pub fn enqueue(&mut self, clock: u64, payload: Vec<u8>) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back(QueuedUpdate { clock, payload });
        true
    }

    /// Drain all queued updates for replay.
    pub fn drain(&mut self) -> Vec<(u64, Vec<u8>)> {
        self.queue.drain(..).map(|u| (u.clock, u.payload)).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    /// Total bytes queued.
    pub fn total_bytes(&self) -> usize {
        self.queue.iter().map(|u| u.payload.len()).sum()
    }
}

type PendingRequests = Mutex<HashMap<u64, oneshot::Sender<RpcResponse>>>;

struct ClientInner {
    peer_id: Uuid,
    user_id: UserId,
    doc_id: DocumentId,
    config: ClientConfig,

    state: RwLock<ConnectionState>,

    /// Lamport clock for causal ordering
    clock: AtomicU64,

    offline_queue: Mutex<OfflineQueue>,

    /// Channel to the WebSocket writer task while connected
    outgoing_tx: RwLock<Option<mpsc::Sender<Vec<u8>>>>,

    pending: PendingRequests,
    next_request_id: AtomicU64,

    event_tx: mpsc::Sender<SyncEvent>,
    event_rx: Mutex<Option<mpsc::Receiver<SyncEvent>>>,
}

/// The sync client.
#[derive(Clone)]
pub struct SyncClient {
    inner: Arc<ClientInner>,
}

impl SyncClient {
    /// Create a client for `user_id` editing `doc_id`.
    pub fn new(user_id: UserId, doc_id: DocumentId, config: ClientConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel(config.event_capacity);
        Self {
            inner: Arc::new(ClientInner {
                peer_id: Uuid::new_v4(),
                user_id,
                doc_id,
                offline_queue: Mutex::new(OfflineQueue::new(config.offline_queue_capacity)),
                config,
                state: RwLock::new(ConnectionState::Disconnected),
                clock: AtomicU64::new(0),
                outgoing_tx: RwLock::new(None),
                pending: Mutex::new(HashMap::new()),
                next_request_id: AtomicU64::new(1),
                event_tx,
                event_rx: Mutex::new(Some(event_rx)),
            }),
        }
    }

    /// Take the event receiver (can only be called once).
    pub async fn take_event_rx(&self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.inner.event_rx.lock().await.take()
    }

    /// Connect, join the document, and start the reader and writer tasks.
    ///
    /// Queued offline updates are replayed once the join is accepted.
    pub async fn connect(&self) -> Result<JoinAccepted, SyncError> {
        let inner = &self.inner;
        *inner.state.write().await = ConnectionState::Connecting;

        match self.handshake().await {
            Ok(accepted) => Ok(accepted),
            Err(e) => {
                *inner.state.write().await = ConnectionState::Disconnected;
                Err(e)
            }
        }
    }

    async fn handshake(&self) -> Result<JoinAccepted, SyncError> {
        let inner = &self.inner;
        let url = format!("{}/{}", inner.config.server_url, inner.doc_id);
        let (ws_stream, _) = tokio_tungstenite::connect_async(&url)
            .await
            .map_err(|e| SyncError::SyncFailure(format!("connect to {url} failed: {e}")))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let join = SyncMessage::join(inner.peer_id, inner.doc_id, inner.user_id)?;
        ws_writer
            .send(Message::Binary(join.encode()?.into()))
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)?;

        // Wait for Joined or Error
        let reply = tokio::time::timeout(inner.config.request_timeout, async {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        let frame = SyncMessage::decode(&bytes)?;
                        if matches!(frame.msg_type, MessageType::Joined | MessageType::Error) {
                            return Ok(frame);
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
            Err(ProtocolError::ConnectionClosed)
        })
        .await
        .map_err(|_| ProtocolError::Timeout)??;

        if reply.msg_type == MessageType::Error {
            let error: OperationError = reply.json(MessageType::Error)?;
            return Err(SyncError::Rejected(error));
        }
        let accepted: JoinAccepted = reply.json(MessageType::Joined)?;

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });
        *inner.outgoing_tx.write().await = Some(out_tx);
        *inner.state.write().await = ConnectionState::Connected;
        let _ = inner.event_tx.send(SyncEvent::Connected).await;

        info!(
            "Joined doc {} as peer {} ({} in room)",
            inner.doc_id, inner.peer_id, accepted.peer_count
        );

        self.replay_offline_queue().await;

        // Reader task: process incoming frames
        let reader = self.inner.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        match SyncMessage::decode(&bytes) {
                            Ok(frame) => reader.dispatch(frame).await,
                            Err(e) => warn!("Failed to decode frame: {e}"),
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            // Connection lost
            *reader.state.write().await = ConnectionState::Disconnected;
            reader.outgoing_tx.write().await.take();
            // Waiting requests see their sender dropped.
            reader.pending.lock().await.clear();
            let _ = reader.event_tx.send(SyncEvent::Disconnected).await;
            info!("Disconnected from doc {}", reader.doc_id);
        });

        Ok(accepted)
    }

    async fn replay_offline_queue(&self) {
        let queued = self.inner.offline_queue.lock().await.drain();
        if queued.is_empty() {
            return;
        }
        info!("Replaying {} queued scene updates", queued.len());
        for (clock, payload) in queued {
            let msg = SyncMessage::state_update(self.inner.peer_id, self.inner.doc_id, clock, payload);
            if let Err(e) = self.inner.send_frame(&msg).await {
                warn!("Replay of queued update {clock} failed: {e}");
            }
        }
    }

    /// Close the connection. Pending requests fail.
    pub async fn disconnect(&self) {
        // Dropping the sender ends the writer, which closes the socket.
        self.inner.outgoing_tx.write().await.take();
        *self.inner.state.write().await = ConnectionState::Disconnected;
    }

    // ─── Room traffic ────────────────────────────────────────────────

    /// Publish a scene. Queued for replay while disconnected.
    pub async fn send_state(&self, scene: &SceneState) -> Result<(), SyncError> {
        let payload = scene.to_json()?;
        let clock = self.inner.clock.fetch_add(1, Ordering::SeqCst) + 1;

        if self.connection_state().await != ConnectionState::Connected {
            let mut queue = self.inner.offline_queue.lock().await;
            if !queue.enqueue(clock, payload) {
                return Err(SyncError::SyncFailure("offline queue is full".into()));
            }
            return Ok(());
        }

        let msg = SyncMessage::state_update(self.inner.peer_id, self.inner.doc_id, clock, payload);
        Ok(self.inner.send_frame(&msg).await?)
    }

    /// Tell the room which operations the store confirmed.
    pub async fn send_operations_saved(&self, operations: &[Operation]) -> Result<(), SyncError> {
        let clock = self.inner.clock.load(Ordering::SeqCst);
        let msg = SyncMessage::with_json(
            MessageType::OperationsSaved,
            self.inner.peer_id,
            self.inner.doc_id,
            clock,
            &operations,
        )?;
        Ok(self.inner.send_frame(&msg).await?)
    }

    /// Ask for the persisted scene; the answer arrives as [`SyncEvent::Hydrated`].
    pub async fn request_state(&self) -> Result<(), SyncError> {
        let msg = SyncMessage::state_request(self.inner.peer_id, self.inner.doc_id);
        Ok(self.inner.send_frame(&msg).await?)
    }

    /// Send a ping to the server.
    pub async fn send_ping(&self) -> Result<(), SyncError> {
        Ok(self.inner.send_frame(&SyncMessage::ping(self.inner.peer_id)).await?)
    }

    // ─── Store RPC ───────────────────────────────────────────────────

    /// Execute a store call on the server as the joined user.
    pub async fn call(&self, call: RpcCall) -> Result<RpcReply, SyncError> {
        if self.connection_state().await != ConnectionState::Connected {
            return Err(SyncError::SyncFailure("not connected".into()));
        }

        let request_id = self.inner.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().await.insert(request_id, tx);

        let msg = SyncMessage::with_json(
            MessageType::Request,
            self.inner.peer_id,
            self.inner.doc_id,
            0,
            &RpcRequest { request_id, call },
        )?;
        if let Err(e) = self.inner.send_frame(&msg).await {
            self.inner.pending.lock().await.remove(&request_id);
            return Err(e.into());
        }

        match tokio::time::timeout(self.inner.config.request_timeout, rx).await {
            Ok(Ok(response)) => response.result.map_err(SyncError::Rejected),
            Ok(Err(_)) => Err(SyncError::SyncFailure("connection lost".into())),
            Err(_) => {
                self.inner.pending.lock().await.remove(&request_id);
                Err(ProtocolError::Timeout.into())
            }
        }
    }

    pub async fn get_operations(&self) -> Result<Vec<Operation>, SyncError> {
        match self.call(RpcCall::GetOperations).await? {
            RpcReply::Operations(ops) => Ok(ops),
            other => Err(unexpected(other)),
        }
    }

    pub async fn get_operation(&self, id: OperationId) -> Result<Operation, SyncError> {
        match self.call(RpcCall::GetOperation { id }).await? {
            RpcReply::Operation(op) => Ok(op),
            other => Err(unexpected(other)),
        }
    }

    pub async fn create_operations(&self, operations: Vec<NewOperation>) -> Result<Vec<Operation>, SyncError> {
        match self.call(RpcCall::CreateBatch { operations }).await? {
            RpcReply::Operations(ops) => Ok(ops),
            other => Err(unexpected(other)),
        }
    }

    pub async fn update_operation(
        &self,
        id: OperationId,
        parameters: Map<String, Value>,
    ) -> Result<Operation, SyncError> {
        match self.call(RpcCall::Update { id, parameters }).await? {
            RpcReply::Operation(op) => Ok(op),
            other => Err(unexpected(other)),
        }
    }

    pub async fn delete_operation(&self, id: OperationId) -> Result<(), SyncError> {
        self.call(RpcCall::Delete { id }).await.map(|_| ())
    }

    pub async fn fetch_scene(&self) -> Result<Option<SceneState>, SyncError> {
        match self.call(RpcCall::LoadScene).await? {
            RpcReply::Scene(scene) => Ok(scene),
            other => Err(unexpected(other)),
        }
    }

    pub async fn store_scene(&self, scene: SceneState) -> Result<(), SyncError> {
        self.call(RpcCall::SaveScene { scene }).await.map(|_| ())
    }

    pub async fn export(
        &self,
        format: ExportFormat,
        options: ExportOptions,
    ) -> Result<ExportArtifact, SyncError> {
        match self.call(RpcCall::Export { format, options }).await? {
            RpcReply::Export(artifact) => Ok(artifact),
            other => Err(unexpected(other)),
        }
    }

    // ─── History RPC ─────────────────────────────────────────────────

    pub async fn save_history_entries(&self, entries: Vec<HistoryEntry>) -> Result<(), SyncError> {
        self.call(RpcCall::SaveHistoryEntries { entries }).await.map(|_| ())
    }

    pub async fn get_history(
        &self,
        from: Option<u64>,
        to: Option<u64>,
    ) -> Result<Vec<HistoryEntry>, SyncError> {
        match self.call(RpcCall::GetHistory { from, to }).await? {
            RpcReply::History(entries) => Ok(entries),
            other => Err(unexpected(other)),
        }
    }

    pub async fn discard_history_after(&self, version: u64) -> Result<(), SyncError> {
        self.call(RpcCall::DiscardHistoryAfter { version }).await.map(|_| ())
    }

    pub async fn get_checkpoint(&self, version: u64) -> Result<Option<DocumentState>, SyncError> {
        match self.call(RpcCall::GetCheckpoint { version }).await? {
            RpcReply::State(state) => Ok(state),
            other => Err(unexpected(other)),
        }
    }

    pub async fn save_checkpoint(&self, version: u64, state: DocumentState) -> Result<(), SyncError> {
        self.call(RpcCall::SaveCheckpoint { version, state }).await.map(|_| ())
    }

    /// Latest checkpointed state; `None` for a document with no checkpoints.
    pub async fn get_latest_state(&self) -> Result<Option<DocumentState>, SyncError> {
        match self.call(RpcCall::GetLatestState).await? {
            RpcReply::State(state) => Ok(state),
            other => Err(unexpected(other)),
        }
    }

    pub async fn get_checkpoints(&self) -> Result<Vec<CheckpointInfo>, SyncError> {
        match self.call(RpcCall::GetCheckpoints).await? {
            RpcReply::Checkpoints(list) => Ok(list),
            other => Err(unexpected(other)),
        }
    }

    pub async fn discard_checkpoints_after(&self, version: u64) -> Result<(), SyncError> {
        self.call(RpcCall::DiscardCheckpointsAfter { version }).await.map(|_| ())
    }

    // ─── Accessors ───────────────────────────────────────────────────

    pub async fn connection_state(&self) -> ConnectionState {
        *self.inner.state.read().await
    }

    pub fn peer_id(&self) -> Uuid {
        self.inner.peer_id
    }

    pub fn user_id(&self) -> UserId {
        self.inner.user_id
    }

    pub fn doc_id(&self) -> DocumentId {
        self.inner.doc_id
    }

    pub fn server_url(&self) -> &str {
        &self.inner.config.server_url
    }

    /// Current Lamport clock value.
    pub fn clock(&self) -> u64 {
        self.inner.clock.load(Ordering::SeqCst)
    }

    pub async fn offline_queue_len(&self) -> usize {
        self.inner.offline_queue.lock().await.len()
    }
}

impl ClientInner {
    async fn send_frame(&self, msg: &SyncMessage) -> Result<(), ProtocolError> {
        let encoded = msg.encode()?;
        let tx = self
            .outgoing_tx
            .read()
            .await
            .clone()
            .ok_or(ProtocolError::ConnectionClosed)?;
        tx.send(encoded).await.map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// Route one incoming frame to a waiting request or the event channel.
    async fn dispatch(&self, frame: SyncMessage) {
        self.clock.fetch_max(frame.clock, Ordering::SeqCst);

        let event = match frame.msg_type {
            MessageType::StateUpdated => Some(SyncEvent::RemoteState {
                peer_id: frame.peer_id,
                clock: frame.clock,
                scene: frame.payload,
            }),
            MessageType::StateHydrated => frame
                .json::<Option<SceneState>>(MessageType::StateHydrated)
                .map(SyncEvent::Hydrated)
                .ok(),
            MessageType::OperationsSaved => frame
                .json::<Vec<Operation>>(MessageType::OperationsSaved)
                .map(|operations| SyncEvent::OperationsSaved {
                    peer_id: frame.peer_id,
                    operations,
                })
                .ok(),
            MessageType::PeerJoined => frame.json(MessageType::PeerJoined).map(SyncEvent::PeerJoined).ok(),
            MessageType::PeerLeft => Some(SyncEvent::PeerLeft(frame.peer_id)),
            MessageType::Error => frame.json(MessageType::Error).map(SyncEvent::Rejected).ok(),
            MessageType::Response => {
                match frame.json::<RpcResponse>(MessageType::Response) {
                    Ok(response) => {
                        let waiter = self.pending.lock().await.remove(&response.request_id);
                        match waiter {
                            Some(tx) => {
                                let _ = tx.send(response);
                            }
                            None => debug!("Late response {} dropped", response.request_id),
                        }
                    }
                    Err(e) => warn!("Malformed RPC response: {e}"),
                }
                None
            }
            MessageType::Pong => {
                debug!("Pong from server");
                None
            }
            other => {
                debug!("Ignoring {} frame", other.event_name());
                None
            }
        };

        if let Some(evt) = event {
            let _ = self.event_tx.send(evt).await;
        }
    }
}

fn unexpected(reply: RpcReply) -> SyncError {
    SyncError::SyncFailure(format!("unexpected RPC reply: {reply:?}"))
}

// ─── Bridge collaborators ─────────────────────────────────────────────

impl OperationBackend for SyncClient {
    async fn load_operations(&self, document_id: DocumentId) -> Result<Vec<Operation>, SyncError> {
        check_document(self, document_id)?;
        self.get_operations().await
    }

    async fn create_batch(
        &self,
        document_id: DocumentId,
        operations: Vec<NewOperation>,
    ) -> Result<Vec<Operation>, SyncError> {
        check_document(self, document_id)?;
        self.create_operations(operations).await
    }

    async fn load_scene(&self, document_id: DocumentId) -> Result<Option<SceneState>, SyncError> {
        check_document(self, document_id)?;
        self.fetch_scene().await
    }

    async fn save_scene(&self, document_id: DocumentId, scene: SceneState) -> Result<(), SyncError> {
        check_document(self, document_id)?;
        self.store_scene(scene).await
    }
}

impl StateTransport for SyncClient {
    async fn emit(&self, event: OutboundEvent) -> Result<(), SyncError> {
        match event {
            OutboundEvent::StateUpdate { document_id, scene } => {
                check_document(self, document_id)?;
                self.send_state(&scene).await
            }
            OutboundEvent::OperationsSaved {
                document_id,
                operations,
            } => {
                check_document(self, document_id)?;
                self.send_operations_saved(&operations).await
            }
        }
    }
}

/// History persistence over a connected client.
///
/// The engine's seams are synchronous, so each call parks the calling
/// worker thread with `block_in_place` until the reply arrives. Requires a
/// multi-threaded runtime.
pub struct RemoteHistory {
    client: SyncClient,
    runtime: Handle,
}

impl RemoteHistory {
    pub fn new(client: SyncClient) -> Result<Self, SyncError> {
        let runtime = Handle::try_current()
            .map_err(|e| SyncError::SyncFailure(format!("no tokio runtime: {e}")))?;
        if runtime.runtime_flavor() != RuntimeFlavor::MultiThread {
            return Err(SyncError::SyncFailure(
                "remote history needs a multi-threaded runtime".into(),
            ));
        }
        Ok(Self { client, runtime })
    }

    fn run<T>(
        &self,
        document_id: DocumentId,
        call: impl std::future::Future<Output = Result<T, SyncError>>,
    ) -> Result<T, HistoryError> {
        check_document(&self.client, document_id).map_err(history_error)?;
        tokio::task::block_in_place(|| self.runtime.block_on(call)).map_err(history_error)
    }
}

impl CheckpointStore for RemoteHistory {
    fn save_checkpoint(
        &self,
        document_id: DocumentId,
        version: u64,
        state: &DocumentState,
    ) -> Result<(), HistoryError> {
        self.run(document_id, self.client.save_checkpoint(version, state.clone()))
    }

    fn load_checkpoint(
        &self,
        document_id: DocumentId,
        version: u64,
    ) -> Result<Option<DocumentState>, HistoryError> {
        self.run(document_id, self.client.get_checkpoint(version))
    }

    fn latest_checkpoint(&self, document_id: DocumentId) -> Result<Option<DocumentState>, HistoryError> {
        self.run(document_id, self.client.get_latest_state())
    }

    fn discard_after(&self, document_id: DocumentId, version: u64) -> Result<(), HistoryError> {
        self.run(document_id, self.client.discard_checkpoints_after(version))
    }
}

impl HistorySink for RemoteHistory {
    fn save_entries(&self, document_id: DocumentId, entries: &[HistoryEntry]) -> Result<(), HistoryError> {
        self.run(document_id, self.client.save_history_entries(entries.to_vec()))
    }

    fn discard_entries_after(&self, document_id: DocumentId, version: u64) -> Result<(), HistoryError> {
        self.run(document_id, self.client.discard_history_after(version))
    }
}

fn history_error(e: SyncError) -> HistoryError {
    HistoryError::Storage(e.to_string())
}

fn check_document(client: &SyncClient, document_id: DocumentId) -> Result<(), SyncError> {
    if client.doc_id() == document_id {
        Ok(())
    } else {
        Err(SyncError::Rejected(OperationError::invalid(format!(
            "client is joined to {}, not {}",
            client.doc_id(),
            document_id
        ))))
    }
}
