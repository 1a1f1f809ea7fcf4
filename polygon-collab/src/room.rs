//! Document rooms: who is connected to a document, and a shared channel
//! carrying pre-encoded frames to all of them.
//!
//! Every member receives every frame, its own included. The connection
//! task drops frames whose `peer_id` is its own. A member that falls more
//! than `capacity` frames behind loses the oldest ones; the server counts
//! the loss in `ServerStats::dropped_frames`.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex};
use uuid::Uuid;

use crate::protocol::{PeerInfo, ProtocolError, SyncMessage};

/// Receiving end handed to each member.
pub type FrameReceiver = broadcast::Receiver<Arc<Vec<u8>>>;

/// The peers joined to one document.
pub struct Room {
    frames: broadcast::Sender<Arc<Vec<u8>>>,
    members: Mutex<HashMap<Uuid, PeerInfo>>,
}

impl Room {
    pub fn new(capacity: usize) -> Self {
        let (frames, _) = broadcast::channel(capacity);
        Self {
            frames,
            members: Mutex::new(HashMap::new()),
        }
    }

    /// Admit a peer unless `limit` members are already in. The check and the
    /// insert share one lock, so concurrent joins cannot overfill the room.
    pub async fn admit(&self, info: PeerInfo, limit: usize) -> Option<FrameReceiver> {
        let mut members = self.members.lock().await;
        if members.len() >= limit {
            return None;
        }
        members.insert(info.peer_id, info);
        Some(self.frames.subscribe())
    }

    pub async fn leave(&self, peer_id: &Uuid) -> Option<PeerInfo> {
        self.members.lock().await.remove(peer_id)
    }

    pub async fn member_count(&self) -> usize {
        self.members.lock().await.len()
    }

    /// Encode `msg` once for every member. Returns how many received it.
    pub fn publish(&self, msg: &SyncMessage) -> Result<usize, ProtocolError> {
        Ok(self.publish_encoded(Arc::new(msg.encode()?)))
    }

    /// Fan out an already encoded frame. No members means nobody to tell.
    pub fn publish_encoded(&self, frame: Arc<Vec<u8>>) -> usize {
        self.frames.send(frame).unwrap_or(0)
    }
}

/// Live rooms by document id. A room exists while it has members.
pub struct RoomRegistry {
    rooms: Mutex<HashMap<Uuid, Arc<Room>>>,
    capacity: usize,
}

impl RoomRegistry {
    /// `capacity` frames are buffered per member of each room.
    pub fn new(capacity: usize) -> Self {
        Self {
            rooms: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    /// The document's room, opened on first use.
    pub async fn open(&self, doc_id: Uuid) -> Arc<Room> {
        let mut rooms = self.rooms.lock().await;
        rooms
            .entry(doc_id)
            .or_insert_with(|| Arc::new(Room::new(self.capacity)))
            .clone()
    }

    /// Close the room if its last member left. Returns whether it closed.
    pub async fn close_if_empty(&self, doc_id: &Uuid) -> bool {
        let mut rooms = self.rooms.lock().await;
        let empty = match rooms.get(doc_id) {
            Some(room) => room.member_count().await == 0,
            None => false,
        };
        if empty {
            rooms.remove(doc_id);
        }
        empty
    }

    pub async fn len(&self) -> usize {
        self.rooms.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> PeerInfo {
        PeerInfo {
            peer_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
        }
    }

    #[tokio::test]
    async fn test_publish_reaches_every_member() {
        let room = Room::new(16);
        let author = peer();
        let mut receivers = Vec::new();
        for info in [author.clone(), peer(), peer()] {
            receivers.push(room.admit(info, 10).await.unwrap());
        }

        let msg = SyncMessage::state_update(author.peer_id, Uuid::new_v4(), 1, b"{}".to_vec());
        assert_eq!(room.publish(&msg).unwrap(), 3);
        for rx in &mut receivers {
            let frame = SyncMessage::decode(&rx.recv().await.unwrap()).unwrap();
            assert_eq!(frame.peer_id, author.peer_id);
        }
    }

    #[tokio::test]
    async fn test_admit_respects_limit_and_leave_frees_a_seat() {
        let room = Room::new(16);
        let first = peer();
        assert!(room.admit(first.clone(), 2).await.is_some());
        assert!(room.admit(peer(), 2).await.is_some());
        assert!(room.admit(peer(), 2).await.is_none());
        assert_eq!(room.member_count().await, 2);

        assert_eq!(room.leave(&first.peer_id).await, Some(first));
        assert!(room.admit(peer(), 2).await.is_some());
    }

    #[tokio::test]
    async fn test_slow_member_lags() {
        let room = Room::new(2);
        let mut rx = room.admit(peer(), 10).await.unwrap();
        for i in 0..5u8 {
            room.publish_encoded(Arc::new(vec![i]));
        }
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(3))
        ));
        assert_eq!(*rx.recv().await.unwrap(), vec![3]);
    }

    #[tokio::test]
    async fn test_registry_shares_and_closes_rooms() {
        let registry = RoomRegistry::new(16);
        let doc_id = Uuid::new_v4();

        let room = registry.open(doc_id).await;
        assert!(Arc::ptr_eq(&room, &registry.open(doc_id).await));

        let info = peer();
        let _rx = room.admit(info.clone(), 10).await.unwrap();
        assert!(!registry.close_if_empty(&doc_id).await);
        assert_eq!(registry.len().await, 1);

        room.leave(&info.peer_id).await;
        assert!(registry.close_if_empty(&doc_id).await);
        assert!(registry.is_empty().await);
        assert!(!registry.close_if_empty(&doc_id).await);
    }
}
