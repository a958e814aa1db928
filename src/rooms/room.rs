use sqlx::SqlitePool;

use crate::auth::Identity;
use crate::error::{ClientError, SessionError};

/// A chat room as the directory knows it. Ids are externally assigned and
/// stable; a session treats the row as immutable between lookups.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Room {
    pub id: i64,
    pub title: String,
    pub staff_only: bool,
}

impl Room {
    /// Topic name on the broadcast bus carrying this room's events.
    pub fn topic(&self) -> String {
        format!("room-{}", self.id)
    }
}

/// Fetches a room for the user, checking permissions along the way.
///
/// The login check is defensive; anonymous connections are refused before a
/// session ever opens.
pub async fn lookup_room(
    db_pool: &SqlitePool,
    room_id: i64,
    identity: &Identity,
) -> Result<Room, SessionError> {
    if !identity.is_authenticated() {
        return Err(ClientError::UserMustLogin.into());
    }

    let row: Option<(i64, String, bool)> =
        sqlx::query_as("SELECT id,title,staff_only FROM rooms WHERE id=?")
            .bind(room_id)
            .fetch_optional(db_pool)
            .await?;

    let Some((id, title, staff_only)) = row else {
        return Err(ClientError::RoomInvalid.into());
    };
    let room = Room {
        id,
        title,
        staff_only,
    };

    if room.staff_only && !identity.is_staff() {
        return Err(ClientError::RoomAccessDenied.into());
    }

    Ok(room)
}
