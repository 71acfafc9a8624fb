//! Per-document fan-out of server messages.
//!
//! Every document gets one tokio broadcast channel. A message is wrapped in
//! an [`Envelope`] naming the connection it came from; each connection's
//! receive loop skips envelopes carrying its own id, so an accepted edit
//! reaches every *other* participant exactly once.
//!
//! Lagging receivers lose the oldest buffered messages (tokio's
//! `RecvError::Lagged`); the gateway answers that with a fresh snapshot.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};

use crate::document::DocumentId;
use crate::presence::ConnectionId;
use crate::protocol::ServerMessage;

/// A message plus the connection that caused it (`None` = everyone).
#[derive(Debug, Clone)]
pub struct Envelope {
    pub origin: Option<ConnectionId>,
    pub message: Arc<ServerMessage>,
}

impl Envelope {
    /// Whether the holder of `connection_id` should forward this message.
    pub fn is_for(&self, connection_id: ConnectionId) -> bool {
        self.origin != Some(connection_id)
    }
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub active_receivers: usize,
}

/// Broadcast channel for a single document.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Envelope>,
    capacity: usize,
    messages_sent: AtomicU64,
}

impl BroadcastGroup {
    /// `capacity` is how many messages a slow receiver may fall behind
    /// before it starts losing them.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            capacity,
            messages_sent: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.sender.subscribe()
    }

    /// Send to every receiver. Returns how many receivers were subscribed.
    pub fn broadcast(&self, origin: Option<ConnectionId>, message: ServerMessage) -> usize {
        let envelope = Envelope {
            origin,
            message: Arc::new(message),
        };
        let count = self.sender.send(envelope).unwrap_or(0);
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            active_receivers: self.receiver_count(),
        }
    }
}

/// Maps document ids to their broadcast groups.
pub struct RoomManager {
    rooms: RwLock<HashMap<DocumentId, Arc<BroadcastGroup>>>,
    default_capacity: usize,
}

impl RoomManager {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            default_capacity,
        }
    }

    pub async fn get_or_create(&self, document_id: &str) -> Arc<BroadcastGroup> {
        // Fast path: read lock
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(document_id) {
                return room.clone();
            }
        }

        // Slow path: double-check under the write lock
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(document_id) {
            return room.clone();
        }

        let room = Arc::new(BroadcastGroup::new(self.default_capacity));
        rooms.insert(document_id.to_string(), room.clone());
        room
    }

    /// Subscribe to a document's room, creating it if needed.
    ///
    /// The receiver is created while the room map is locked, so a concurrent
    /// `remove_if_empty` either runs first (and a fresh room is made) or sees
    /// the new receiver and keeps the room.
    pub async fn subscribe(
        &self,
        document_id: &str,
    ) -> (Arc<BroadcastGroup>, broadcast::Receiver<Envelope>) {
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(document_id) {
                let receiver = room.subscribe();
                return (room.clone(), receiver);
            }
        }

        let mut rooms = self.rooms.write().await;
        let room = rooms
            .entry(document_id.to_string())
            .or_insert_with(|| Arc::new(BroadcastGroup::new(self.default_capacity)))
            .clone();
        let receiver = room.subscribe();
        (room, receiver)
    }

    pub async fn get(&self, document_id: &str) -> Option<Arc<BroadcastGroup>> {
        self.rooms.read().await.get(document_id).cloned()
    }

    /// Drop the room if nobody is subscribed any more.
    pub async fn remove_if_empty(&self, document_id: &str) -> bool {
        let mut rooms = self.rooms.write().await;
        match rooms.get(document_id) {
            Some(room) if room.receiver_count() == 0 => {
                rooms.remove(document_id);
                true
            }
            _ => false,
        }
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn user_left(user: &str) -> ServerMessage {
        ServerMessage::UserLeft {
            user_id: user.into(),
        }
    }

    #[tokio::test]
    async fn test_fan_out_reaches_all_receivers() {
        let group = BroadcastGroup::new(16);
        let mut rx1 = group.subscribe();
        let mut rx2 = group.subscribe();
        let mut rx3 = group.subscribe();

        let count = group.broadcast(None, user_left("alice"));
        assert_eq!(count, 3);

        for rx in [&mut rx1, &mut rx2, &mut rx3] {
            let envelope = rx.recv().await.unwrap();
            assert_eq!(*envelope.message, user_left("alice"));
        }
    }

    #[tokio::test]
    async fn test_origin_filter() {
        let group = BroadcastGroup::new(16);
        let sender = Uuid::new_v4();
        let other = Uuid::new_v4();
        let mut rx = group.subscribe();

        group.broadcast(Some(sender), user_left("alice"));
        let envelope = rx.recv().await.unwrap();
        assert!(!envelope.is_for(sender));
        assert!(envelope.is_for(other));

        group.broadcast(None, user_left("bob"));
        let envelope = rx.recv().await.unwrap();
        assert!(envelope.is_for(sender));
    }

    #[tokio::test]
    async fn test_lagging_receiver_reports_lag() {
        let group = BroadcastGroup::new(2);
        let mut rx = group.subscribe();
        for i in 0..5 {
            group.broadcast(None, user_left(&format!("u{i}")));
        }
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(_))
        ));
    }

    #[tokio::test]
    async fn test_stats() {
        let group = BroadcastGroup::new(16);
        let _rx = group.subscribe();
        group.broadcast(None, ServerMessage::Pong);
        group.broadcast(None, ServerMessage::Pong);
        let stats = group.stats();
        assert_eq!(stats.messages_sent, 2);
        assert_eq!(stats.active_receivers, 1);
        assert_eq!(group.capacity(), 16);
    }

    #[tokio::test]
    async fn test_room_manager_get_or_create() {
        let manager = RoomManager::new(16);
        let room1 = manager.get_or_create("doc").await;
        let room2 = manager.get_or_create("doc").await;
        assert!(Arc::ptr_eq(&room1, &room2));
        assert_eq!(manager.room_count().await, 1);

        manager.get_or_create("other").await;
        assert_eq!(manager.room_count().await, 2);
    }

    #[tokio::test]
    async fn test_room_manager_cleanup() {
        let manager = RoomManager::new(16);
        let room = manager.get_or_create("doc").await;
        let rx = room.subscribe();

        assert!(!manager.remove_if_empty("doc").await);
        drop(rx);
        assert!(manager.remove_if_empty("doc").await);
        assert!(manager.get("doc").await.is_none());
    }

    #[tokio::test]
    async fn test_subscribe_keeps_room_alive() {
        let manager = RoomManager::new(16);
        let (room, rx) = manager.subscribe("doc").await;
        assert!(!manager.remove_if_empty("doc").await);
        assert!(Arc::ptr_eq(&room, &manager.get_or_create("doc").await));

        drop(rx);
        assert!(manager.remove_if_empty("doc").await);

        // A later subscriber gets the room everyone else will use.
        let (fresh, mut rx) = manager.subscribe("doc").await;
        assert!(!Arc::ptr_eq(&room, &fresh));
        manager
            .get_or_create("doc")
            .await
            .broadcast(None, user_left("alice"));
        assert_eq!(*rx.recv().await.unwrap().message, user_left("alice"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_subscribe_races_removal() {
        let manager = Arc::new(RoomManager::new(16));
        for _ in 0..200 {
            let (_, first) = manager.subscribe("doc").await;
            let remover = {
                let manager = manager.clone();
                tokio::spawn(async move {
                    drop(first);
                    manager.remove_if_empty("doc").await;
                })
            };
            let (_, mut rx) = manager.subscribe("doc").await;
            remover.await.unwrap();

            // Whatever the interleaving, the live room reaches the subscriber.
            manager
                .get_or_create("doc")
                .await
                .broadcast(None, ServerMessage::Pong);
            assert_eq!(*rx.recv().await.unwrap().message, ServerMessage::Pong);
            drop(rx);
            manager.remove_if_empty("doc").await;
        }
    }
}
