use axum::{
    debug_handler,
    extract::{ws::Message, State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tower_sessions::Session;

use crate::rooms::msg::{Command, Frame};
use crate::rooms::session::ChatSession;
use crate::{auth, AppResult, AppState};

/// Upgrades `/ws` to the relay protocol: one socket, one `ChatSession`, any
/// number of rooms joined over it.
#[debug_handler(state = crate::AppState)]
pub async fn chat_ws(
    State(state): State<AppState>,
    session: Session,
    ws: WebSocketUpgrade,
) -> AppResult<Response> {
    // Connecting -> Open only with a logged-in identity; anonymous upgrades
    // are refused outright.
    let Some(identity) = auth::current_identity(&session, &state.db_pool).await? else {
        return Ok(StatusCode::UNAUTHORIZED.into_response());
    };

    Ok(ws
        .on_upgrade(async move |stream| {
            let username = identity.username.clone();
            tracing::info!(user = %username, "connection open");

            let (mut sender, mut receiver) = stream.split();
            let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();

            let writer = tokio::spawn(async move {
                while let Some(frame) = rx.recv().await {
                    let Ok(text) = serde_json::to_string(&frame) else {
                        continue;
                    };
                    if sender.send(Message::text(text)).await.is_err() {
                        break;
                    }
                }
            });

            let mut chat = ChatSession::new(&state, identity, tx);
            while let Some(Ok(msg)) = receiver.next().await {
                // Frames that aren't a recognized command are dropped, not
                // answered.
                let Ok(command) = serde_json::from_slice::<Command>(&msg.into_data()) else {
                    continue;
                };
                if let Err(err) = chat.handle_command(command).await {
                    tracing::error!(user = %username, error = %err, "command failed on a shared dependency");
                }
            }

            chat.close().await;
            writer.abort();
            tracing::info!(user = %username, "connection closed");
        })
        .into_response())
}
