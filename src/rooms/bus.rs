use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;

/// Capacity of each room topic. Receivers that fall this far behind skip
/// events (RecvError::Lagged); delivery is at-most-once.
const TOPIC_CAPACITY: usize = 256;

/// An event fanned out to every session subscribed to a room's topic,
/// including the publishing session itself.
#[derive(Clone, Debug, PartialEq)]
pub enum BroadcastEvent {
    Join {
        room_id: i64,
        username: String,
    },
    Leave {
        room_id: i64,
        username: String,
    },
    Message {
        room_id: i64,
        username: String,
        message: String,
    },
}

/// One broadcast channel per room, keyed by the room's topic name. Cloneable;
/// lives in `AppState`. Topics are created on first use and never torn down;
/// a topic with no receivers just drops what is published to it.
#[derive(Clone)]
pub struct RoomBus {
    topics: Arc<Mutex<HashMap<String, broadcast::Sender<BroadcastEvent>>>>,
}

impl RoomBus {
    pub fn new() -> Self {
        Self {
            topics: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<BroadcastEvent> {
        let mut topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        topics
            .entry(topic.to_owned())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .clone()
    }

    /// Subscribes to a topic. Only events published strictly after this call
    /// returns are delivered to the receiver.
    pub fn subscribe(&self, topic: &str) -> broadcast::Receiver<BroadcastEvent> {
        self.sender(topic).subscribe()
    }

    /// Publishes to every current subscriber. A topic nobody listens on is
    /// not an error.
    pub fn publish(&self, topic: &str, event: BroadcastEvent) {
        let _ = self.sender(topic).send(event);
    }
}

impl Default for RoomBus {
    fn default() -> Self {
        Self::new()
    }
}
