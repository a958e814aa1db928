pub mod auth;
pub mod config;
pub mod error;
pub mod rooms;

use std::sync::Arc;

use axum::extract::FromRef;
use sqlx::SqlitePool;

use crate::config::RelayConfig;
use crate::rooms::bus::RoomBus;
use crate::rooms::msg::LinkSanitizer;
use crate::rooms::presence::PresenceStore;

pub use crate::error::{AppError, AppResult, ClientError, SessionError};

#[derive(Clone, FromRef)]
pub struct AppState {
    pub db_pool: SqlitePool,
    pub config: RelayConfig,
    pub presence: Arc<PresenceStore>,
    pub bus: RoomBus,
    pub sanitizer: LinkSanitizer,
}

impl AppState {
    pub fn new(db_pool: SqlitePool, config: RelayConfig) -> Self {
        Self {
            db_pool,
            presence: Arc::new(PresenceStore::new(config.presence_ttl)),
            bus: RoomBus::new(),
            sanitizer: rooms::msg::default_sanitizer(),
            config,
        }
    }
}
