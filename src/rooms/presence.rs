use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::auth::Identity;

/// What a room remembers about one user. Full overwrites only; `left` plus
/// `last_update` let clients show who was here and when.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub username: String,
    pub name: String,
    pub left: bool,
    pub last_update: i64,
}

impl PresenceRecord {
    pub fn seen_now(identity: &Identity) -> Self {
        Self {
            username: identity.username.clone(),
            name: identity.name.clone(),
            left: false,
            last_update: now_ts(),
        }
    }
}

pub fn now_ts() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}

struct RoomPresence {
    users: HashMap<i64, PresenceRecord>,
    expires_at: Instant,
}

/// Shared map of room id to per-user presence, bounded by a soft TTL: every
/// write to a room pushes the whole map's expiry out, and an idle room's map
/// vanishes as a unit. Expired maps are purged lazily on access.
///
/// All methods take the lock briefly and never hold it across an await.
pub struct PresenceStore {
    ttl: Duration,
    rooms: RwLock<HashMap<i64, RoomPresence>>,
}

impl PresenceStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            rooms: RwLock::new(HashMap::new()),
        }
    }

    /// Merges a fresh record for the user into the room's map, creating the
    /// map if needed, and resets the room's TTL countdown.
    pub async fn upsert(&self, room_id: i64, user_id: i64, record: PresenceRecord) {
        let mut rooms = self.rooms.write().await;
        let expires_at = Instant::now() + self.ttl;
        match rooms.get_mut(&room_id) {
            Some(room) if room.expires_at > Instant::now() => {
                room.users.insert(user_id, record);
                room.expires_at = expires_at;
            }
            _ => {
                rooms.insert(
                    room_id,
                    RoomPresence {
                        users: HashMap::from([(user_id, record)]),
                        expires_at,
                    },
                );
            }
        }
    }

    /// Flips the user's record to `left` with a fresh timestamp. A room the
    /// store never saw a join for stays absent; a leave fabricates nothing.
    pub async fn mark_left(&self, room_id: i64, user_id: i64) {
        let mut rooms = self.rooms.write().await;
        let Some(room) = rooms.get_mut(&room_id) else {
            return;
        };
        if room.expires_at <= Instant::now() {
            rooms.remove(&room_id);
            return;
        }
        if let Some(record) = room.users.get_mut(&user_id) {
            record.left = true;
            record.last_update = now_ts();
        }
        room.expires_at = Instant::now() + self.ttl;
    }

    /// The room's presence map verbatim, or `None` if absent or expired.
    pub async fn read(&self, room_id: i64) -> Option<HashMap<i64, PresenceRecord>> {
        {
            let rooms = self.rooms.read().await;
            match rooms.get(&room_id) {
                None => return None,
                Some(room) if room.expires_at > Instant::now() => {
                    return Some(room.users.clone());
                }
                Some(_) => {}
            }
        }
        // Expired; take the write lock to purge it.
        let mut rooms = self.rooms.write().await;
        if rooms
            .get(&room_id)
            .is_some_and(|room| room.expires_at <= Instant::now())
        {
            rooms.remove(&room_id);
        }
        None
    }
}
