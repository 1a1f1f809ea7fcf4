//! Binary frame protocol for document sync and store RPC.
//!
//! Wire format (bincode-encoded header, JSON payload):
//! ```text
//! ┌──────────┬───────────┬──────────┬──────────┬──────────────┐
//! │ msg_type │ peer_id   │ doc_id   │ clock    │ payload      │
//! │ 1 byte   │ 16 bytes  │ 16 bytes │ 8 bytes  │ JSON, varlen │
//! └──────────┴───────────┴──────────┴──────────┴──────────────┘
//! ```
//!
//! Scene payloads are the same JSON the bridge persists, so a relayed
//! `StateUpdated` frame carries byte-identical content to the stored scene.

use polygon_core::{
    DocumentState, HistoryEntry, NewOperation, Operation, OperationError, OperationId, SceneState,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::export::{ExportArtifact, ExportFormat, ExportOptions};
use crate::storage::CheckpointInfo;

/// Frame types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// First frame of a connection: `JoinRequest`
    Join = 1,
    /// Join accepted: `JoinAccepted`
    Joined = 2,
    /// Another peer entered the room: `PeerInfo`
    PeerJoined = 3,
    /// A peer disconnected (empty payload)
    PeerLeft = 4,
    /// Ask for the persisted scene (empty payload)
    StateRequest = 5,
    /// Reply to `StateRequest`: `Option<SceneState>`
    StateHydrated = 6,
    /// Client scene change: `SceneState`
    StateUpdate = 7,
    /// Scene change relayed to the other peers: `SceneState`
    StateUpdated = 8,
    /// Operations confirmed by the store: `Vec<Operation>`
    OperationsSaved = 9,
    /// Store call: `RpcRequest`
    Request = 10,
    /// Store reply: `RpcResponse`
    Response = 11,
    /// Rejection: `OperationError`
    Error = 12,
    /// Heartbeat ping
    Ping = 13,
    /// Heartbeat pong
    Pong = 14,
}

impl MessageType {
    /// Event name used in logs and by web clients.
    pub fn event_name(self) -> &'static str {
        match self {
            MessageType::Join => "document:join",
            MessageType::Joined => "document:joined",
            MessageType::PeerJoined => "document:peer:joined",
            MessageType::PeerLeft => "document:peer:left",
            MessageType::StateRequest => "document:state:request",
            MessageType::StateHydrated => "document:state:hydrated",
            MessageType::StateUpdate => "document:state:update",
            MessageType::StateUpdated => "document:state:updated",
            MessageType::OperationsSaved => "document:operations:saved",
            MessageType::Request => "rpc:request",
            MessageType::Response => "rpc:response",
            MessageType::Error => "error",
            MessageType::Ping => "ping",
            MessageType::Pong => "pong",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest {
    pub user_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinAccepted {
    pub peer_id: Uuid,
    /// Peers in the room, including the joiner.
    pub peer_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    pub peer_id: Uuid,
    pub user_id: Uuid,
}

/// Store call executed by the server as the joined user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum RpcCall {
    GetOperations,
    GetOperation { id: OperationId },
    CreateBatch { operations: Vec<NewOperation> },
    Update { id: OperationId, parameters: Map<String, Value> },
    Delete { id: OperationId },
    LoadScene,
    SaveScene { scene: SceneState },
    Export { format: ExportFormat, options: ExportOptions },
    SaveHistoryEntries { entries: Vec<HistoryEntry> },
    /// Inclusive version range; open ends default to the whole history.
    GetHistory { from: Option<u64>, to: Option<u64> },
    DiscardHistoryAfter { version: u64 },
    GetCheckpoint { version: u64 },
    SaveCheckpoint { version: u64, state: DocumentState },
    GetLatestState,
    GetCheckpoints,
    DiscardCheckpointsAfter { version: u64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcRequest {
    pub request_id: u64,
    pub call: RpcCall,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum RpcReply {
    Operations(Vec<Operation>),
    Operation(Operation),
    Scene(Option<SceneState>),
    Export(ExportArtifact),
    History(Vec<HistoryEntry>),
    State(Option<DocumentState>),
    Checkpoints(Vec<CheckpointInfo>),
    Done,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcResponse {
    pub request_id: u64,
    pub result: Result<RpcReply, OperationError>,
}

/// One protocol frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    pub peer_id: Uuid,
    pub doc_id: Uuid,
    /// Sender-local Lamport clock
    pub clock: u64,
    /// JSON payload (shape depends on msg_type)
    pub payload: Vec<u8>,
}

impl SyncMessage {
    pub fn new(msg_type: MessageType, peer_id: Uuid, doc_id: Uuid, clock: u64, payload: Vec<u8>) -> Self {
        Self {
            msg_type,
            peer_id,
            doc_id,
            clock,
            payload,
        }
    }

    /// Frame with a JSON-encoded payload.
    pub fn with_json<T: Serialize>(
        msg_type: MessageType,
        peer_id: Uuid,
        doc_id: Uuid,
        clock: u64,
        payload: &T,
    ) -> Result<Self, ProtocolError> {
        let payload =
            serde_json::to_vec(payload).map_err(|e| ProtocolError::SerializationError(e.to_string()))?;
        Ok(Self::new(msg_type, peer_id, doc_id, clock, payload))
    }

    pub fn join(peer_id: Uuid, doc_id: Uuid, user_id: Uuid) -> Result<Self, ProtocolError> {
        Self::with_json(MessageType::Join, peer_id, doc_id, 0, &JoinRequest { user_id })
    }

    /// Scene change; the payload is the scene JSON verbatim.
    pub fn state_update(peer_id: Uuid, doc_id: Uuid, clock: u64, scene_json: Vec<u8>) -> Self {
        Self::new(MessageType::StateUpdate, peer_id, doc_id, clock, scene_json)
    }

    pub fn state_request(peer_id: Uuid, doc_id: Uuid) -> Self {
        Self::new(MessageType::StateRequest, peer_id, doc_id, 0, Vec::new())
    }

    pub fn error(peer_id: Uuid, doc_id: Uuid, error: &OperationError) -> Result<Self, ProtocolError> {
        Self::with_json(MessageType::Error, peer_id, doc_id, 0, error)
    }

    pub fn peer_left(peer_id: Uuid, doc_id: Uuid) -> Self {
        Self::new(MessageType::PeerLeft, peer_id, doc_id, 0, Vec::new())
    }

    pub fn ping(peer_id: Uuid) -> Self {
        Self::new(MessageType::Ping, peer_id, Uuid::nil(), 0, Vec::new())
    }

    pub fn pong(peer_id: Uuid) -> Self {
        Self::new(MessageType::Pong, peer_id, Uuid::nil(), 0, Vec::new())
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }

    /// Decode the JSON payload, checking the frame type first.
    pub fn json<T: DeserializeOwned>(&self, expected: MessageType) -> Result<T, ProtocolError> {
        if self.msg_type != expected {
            return Err(ProtocolError::InvalidMessageType);
        }
        serde_json::from_slice(&self.payload)
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    InvalidMessageType,
    ConnectionClosed,
    Timeout,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::InvalidMessageType => write!(f, "Invalid message type"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::Timeout => write!(f, "Connection timeout"),
        }
    }
}

impl std::error::Error for ProtocolError {}

#[cfg(test)]
mod tests {
    use super::*;
    use polygon_core::OperationType;
    use serde_json::json;

    #[test]
    fn test_frame_header_roundtrip() {
        let peer = Uuid::new_v4();
        let doc = Uuid::new_v4();
        let scene = br#"{"sketches":{"x":[],"y":[],"z":[]},"extrudedShapes":[]}"#.to_vec();

        let msg = SyncMessage::state_update(peer, doc, 42, scene.clone());
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded.msg_type, MessageType::StateUpdate);
        assert_eq!(decoded.peer_id, peer);
        assert_eq!(decoded.doc_id, doc);
        assert_eq!(decoded.clock, 42);
        assert_eq!(decoded.payload, scene);
    }

    #[test]
    fn test_join_payload() {
        let user = Uuid::new_v4();
        let msg = SyncMessage::join(Uuid::new_v4(), Uuid::new_v4(), user).unwrap();
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();
        let join: JoinRequest = decoded.json(MessageType::Join).unwrap();
        assert_eq!(join.user_id, user);
        assert!(decoded.json::<JoinRequest>(MessageType::Joined).is_err());
    }

    #[test]
    fn test_rpc_request_shape() {
        let request = RpcRequest {
            request_id: 7,
            call: RpcCall::CreateBatch {
                operations: vec![NewOperation::new(
                    OperationType::SketchCircle,
                    json!({"dimension": "z", "center": {"x": 0, "y": 0, "z": 0}, "radius": 2}),
                )],
            },
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["requestId"], 7);
        assert_eq!(value["call"]["method"], "create_batch");
        assert_eq!(value["call"]["operations"][0]["type"], "sketch_circle");

        let unit = serde_json::to_value(RpcCall::LoadScene).unwrap();
        assert_eq!(unit, json!({"method": "load_scene"}));

        let range = serde_json::to_value(RpcCall::GetHistory { from: Some(3), to: None }).unwrap();
        assert_eq!(range, json!({"method": "get_history", "from": 3, "to": null}));
    }

    #[test]
    fn test_rpc_error_response() {
        let response = RpcResponse {
            request_id: 3,
            result: Err(OperationError::forbidden("not a member")),
        };
        let bytes = serde_json::to_vec(&response).unwrap();
        let back: RpcResponse = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back, response);
    }

    #[test]
    fn test_decode_invalid_bytes() {
        assert!(SyncMessage::decode(&[0xFF, 0xFE, 0xFD]).is_err());
    }

    #[test]
    fn test_message_type_values() {
        assert_eq!(MessageType::Join as u8, 1);
        assert_eq!(MessageType::StateUpdated as u8, 8);
        assert_eq!(MessageType::OperationsSaved as u8, 9);
        assert_eq!(MessageType::Pong as u8, 14);
        assert_eq!(MessageType::StateUpdate.event_name(), "document:state:update");
    }

    #[test]
    fn test_header_overhead_is_small() {
        let msg = SyncMessage::state_update(Uuid::new_v4(), Uuid::new_v4(), 1, vec![b'x'; 50]);
        let encoded = msg.encode().unwrap();
        assert!(encoded.len() < 150, "Encoded size {} too large", encoded.len());
    }
}
