use sqlx::SqlitePool;
use tower_sessions::Session;

use crate::AppResult;

/// Session-store key under which the login flow leaves the user id.
pub const USER_ID: &str = "user_id";

/// The authenticated user behind a connection. Resolved once at upgrade time
/// and constant for the life of the session; login itself happens elsewhere.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Identity {
    pub user_id: i64,
    pub username: String,
    pub name: String,
    pub staff: bool,
}

impl Identity {
    /// Placeholder identity for a connection that never logged in. Kept only
    /// so the directory's defensive login check has something to reject;
    /// anonymous upgrades are refused before a session opens.
    pub fn anonymous() -> Self {
        Self {
            user_id: 0,
            username: String::new(),
            name: String::new(),
            staff: false,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.user_id != 0
    }

    pub fn is_staff(&self) -> bool {
        self.staff
    }
}

/// Looks up the identity the session cookie points at, if any. `None` means
/// the connection is anonymous and must be refused.
pub async fn current_identity(session: &Session, db_pool: &SqlitePool) -> AppResult<Option<Identity>> {
    let Some(user_id) = session.get::<i64>(USER_ID).await? else {
        return Ok(None);
    };

    let row: Option<(String, String, bool)> =
        sqlx::query_as("SELECT username,name,is_staff FROM users WHERE id=?")
            .bind(user_id)
            .fetch_optional(db_pool)
            .await?;

    Ok(row.map(|(username, name, staff)| Identity {
        user_id,
        username,
        name,
        staff,
    }))
}
