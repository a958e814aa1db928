pub mod bus;
pub mod msg;
pub mod presence;
pub mod room;
pub mod session;
mod ws;

use axum::{routing::get, Router};

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/ws", get(ws::chat_ws))
}
