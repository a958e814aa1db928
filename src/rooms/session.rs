use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use sqlx::SqlitePool;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::auth::Identity;
use crate::config::RelayConfig;
use crate::error::{ClientError, SessionError};
use crate::rooms::bus::{BroadcastEvent, RoomBus};
use crate::rooms::msg::{Command, Frame, LinkSanitizer};
use crate::rooms::presence::{PresenceRecord, PresenceStore};
use crate::rooms::room::{lookup_room, Room};
use crate::AppState;

/// The protocol state machine behind one live connection.
///
/// The transport feeds it inbound commands one at a time; bus events for the
/// rooms it has joined are forwarded to the client by per-room subscription
/// tasks. `rooms` is connection-local membership and is the authorization
/// boundary for sends.
pub struct ChatSession {
    identity: Identity,
    db_pool: SqlitePool,
    config: RelayConfig,
    presence: Arc<PresenceStore>,
    bus: RoomBus,
    sanitizer: LinkSanitizer,
    out: mpsc::UnboundedSender<Frame>,
    rooms: HashSet<i64>,
    subscriptions: HashMap<i64, JoinHandle<()>>,
}

impl ChatSession {
    pub fn new(state: &AppState, identity: Identity, out: mpsc::UnboundedSender<Frame>) -> Self {
        Self {
            identity,
            db_pool: state.db_pool.clone(),
            config: state.config.clone(),
            presence: state.presence.clone(),
            bus: state.bus.clone(),
            sanitizer: state.sanitizer.clone(),
            out,
            rooms: HashSet::new(),
            subscriptions: HashMap::new(),
        }
    }

    pub fn joined_rooms(&self) -> &HashSet<i64> {
        &self.rooms
    }

    /// Runs one inbound command. A `ClientError` becomes a single error frame
    /// and the session stays usable; an infrastructure fault aborts just this
    /// operation (no ack) and is handed back for the transport to log.
    pub async fn handle_command(&mut self, command: Command) -> Result<(), anyhow::Error> {
        let result = match command {
            Command::Join { room } => self.join_room(room).await,
            Command::Leave { room } => self.leave_room(room).await,
            Command::Send { room, message } => self.send_room(room, message).await,
            Command::RoomUsers { room } => self.room_users(room).await,
        };
        match result {
            Ok(()) => Ok(()),
            Err(SessionError::Client(err)) => {
                tracing::debug!(user = %self.identity.username, code = err.code(), "command refused");
                self.send(Frame::Error { error: err.code() });
                Ok(())
            }
            Err(SessionError::Infra(err)) => Err(err),
        }
    }

    /// Force-leaves every room still joined. Must complete unconditionally:
    /// a failing directory lookup still gets its presence record marked and
    /// its subscription dropped.
    pub async fn close(&mut self) {
        for room_id in self.rooms.clone() {
            if let Err(err) = self.leave_room(room_id).await {
                tracing::debug!(room_id, error = %err, "forced leave failed during close");
                self.rooms.remove(&room_id);
                self.presence.mark_left(room_id, self.identity.user_id).await;
                self.unsubscribe(room_id);
            }
        }
        for (_, task) in self.subscriptions.drain() {
            task.abort();
        }
    }

    async fn join_room(&mut self, room_id: i64) -> Result<(), SessionError> {
        let room = lookup_room(&self.db_pool, room_id, &self.identity).await?;
        if self.config.notify_on_enter_leave {
            self.bus.publish(
                &room.topic(),
                BroadcastEvent::Join {
                    room_id,
                    username: self.identity.username.clone(),
                },
            );
        }
        self.rooms.insert(room_id);
        self.presence
            .upsert(room_id, self.identity.user_id, PresenceRecord::seen_now(&self.identity))
            .await;
        self.subscribe(&room);
        self.send(Frame::join_ack(room.id, room.title));
        Ok(())
    }

    async fn leave_room(&mut self, room_id: i64) -> Result<(), SessionError> {
        let room = lookup_room(&self.db_pool, room_id, &self.identity).await?;
        if self.config.notify_on_enter_leave {
            self.bus.publish(
                &room.topic(),
                BroadcastEvent::Leave {
                    room_id,
                    username: self.identity.username.clone(),
                },
            );
        }
        self.rooms.remove(&room_id);
        self.presence.mark_left(room_id, self.identity.user_id).await;
        self.unsubscribe(room_id);
        self.send(Frame::leave_ack(room.id));
        Ok(())
    }

    async fn send_room(&mut self, room_id: i64, message: String) -> Result<(), SessionError> {
        // Membership on this connection gates sends; staff access is still
        // re-checked through the directory on every message.
        if !self.rooms.contains(&room_id) {
            return Err(ClientError::RoomAccessDenied.into());
        }
        let room = lookup_room(&self.db_pool, room_id, &self.identity).await?;
        self.bus.publish(
            &room.topic(),
            BroadcastEvent::Message {
                room_id,
                username: self.identity.username.clone(),
                // Raw text; sanitization happens once, at the outbound edge.
                message,
            },
        );
        self.presence
            .upsert(room_id, self.identity.user_id, PresenceRecord::seen_now(&self.identity))
            .await;
        Ok(())
    }

    async fn room_users(&mut self, room_id: i64) -> Result<(), SessionError> {
        let users = self.presence.read(room_id).await.unwrap_or_default();
        self.send(Frame::room_users(room_id, users));
        Ok(())
    }

    /// Starts a task forwarding the room topic to this connection. Rejoining
    /// replaces the previous subscription rather than stacking a second one.
    fn subscribe(&mut self, room: &Room) {
        let mut rx = self.bus.subscribe(&room.topic());
        let out = self.out.clone();
        let sanitizer = self.sanitizer.clone();
        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if out.send(handle_event(event, &sanitizer)).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "subscriber lagged, events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        if let Some(old) = self.subscriptions.insert(room.id, task) {
            old.abort();
        }
    }

    fn unsubscribe(&mut self, room_id: i64) {
        if let Some(task) = self.subscriptions.remove(&room_id) {
            task.abort();
        }
    }

    fn send(&self, frame: Frame) {
        // The receiver is gone once the socket closes; nothing left to tell.
        let _ = self.out.send(frame);
    }
}

/// Shapes a bus event into the frame the client sees. Message text passes
/// through the link sanitizer here and nowhere else.
pub fn handle_event(event: BroadcastEvent, sanitizer: &LinkSanitizer) -> Frame {
    match event {
        BroadcastEvent::Join { room_id, username } => Frame::enter_notice(room_id, username),
        BroadcastEvent::Leave { room_id, username } => Frame::leave_notice(room_id, username),
        BroadcastEvent::Message {
            room_id,
            username,
            message,
        } => Frame::message_notice(room_id, username, sanitizer(&message)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rooms::msg::MsgType;
    use crate::rooms::presence::now_ts;
    use std::time::Duration;

    async fn test_state() -> AppState {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::query("CREATE TABLE rooms (id INTEGER PRIMARY KEY, title TEXT NOT NULL, staff_only BOOLEAN NOT NULL DEFAULT FALSE)")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO rooms (id,title,staff_only) VALUES (1,'Lobby',FALSE),(2,'Back Office',TRUE)")
            .execute(&pool)
            .await
            .unwrap();
        AppState::new(pool, RelayConfig::default())
    }

    fn identity(user_id: i64, username: &str, staff: bool) -> Identity {
        Identity {
            user_id,
            username: username.into(),
            name: username.to_uppercase(),
            staff,
        }
    }

    fn open_session(
        state: &AppState,
        who: Identity,
    ) -> (ChatSession, mpsc::UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ChatSession::new(state, who, tx), rx)
    }

    async fn next_frame(rx: &mut mpsc::UnboundedReceiver<Frame>) -> Frame {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for a frame")
            .expect("session dropped its outbound channel")
    }

    #[tokio::test]
    async fn join_acks_and_registers_presence() {
        let state = test_state().await;
        let (mut session, mut rx) = open_session(&state, identity(7, "ali", false));
        let before = now_ts();

        session.handle_command(Command::Join { room: 1 }).await.unwrap();

        assert_eq!(
            next_frame(&mut rx).await,
            Frame::join_ack(1, "Lobby".into())
        );
        assert!(session.joined_rooms().contains(&1));

        session.handle_command(Command::RoomUsers { room: 1 }).await.unwrap();
        let Frame::RoomUsers { data, room, .. } = next_frame(&mut rx).await else {
            panic!("expected a room_users frame");
        };
        assert_eq!(room, 1);
        let record = &data.users[&7];
        assert_eq!(record.username, "ali");
        assert!(!record.left);
        assert!(record.last_update >= before);
    }

    #[tokio::test]
    async fn leave_marks_presence_and_spares_others() {
        let state = test_state().await;
        let (mut a, mut a_rx) = open_session(&state, identity(7, "ali", false));
        let (mut b, mut b_rx) = open_session(&state, identity(8, "bee", false));

        a.handle_command(Command::Join { room: 1 }).await.unwrap();
        b.handle_command(Command::Join { room: 1 }).await.unwrap();
        next_frame(&mut a_rx).await;
        next_frame(&mut b_rx).await;

        a.handle_command(Command::Leave { room: 1 }).await.unwrap();
        // Skip any notices already queued ahead of the ack.
        loop {
            if next_frame(&mut a_rx).await == Frame::leave_ack(1) {
                break;
            }
        }
        assert!(a.joined_rooms().is_empty());

        b.handle_command(Command::RoomUsers { room: 1 }).await.unwrap();
        loop {
            if let Frame::RoomUsers { data, .. } = next_frame(&mut b_rx).await {
                assert!(data.users[&7].left);
                assert!(!data.users[&8].left);
                break;
            }
        }
    }

    #[tokio::test]
    async fn joining_a_missing_room_mutates_nothing() {
        let state = test_state().await;
        let (mut session, mut rx) = open_session(&state, identity(7, "ali", true));

        session.handle_command(Command::Join { room: 5451 }).await.unwrap();

        assert_eq!(
            next_frame(&mut rx).await,
            Frame::Error { error: "RoomInvalid" }
        );
        assert!(session.joined_rooms().is_empty());
        assert!(state.presence.read(5451).await.is_none());
    }

    #[tokio::test]
    async fn staff_only_room_refuses_non_staff() {
        let state = test_state().await;
        let (mut session, mut rx) = open_session(&state, identity(7, "ali", false));

        session.handle_command(Command::Join { room: 2 }).await.unwrap();
        assert_eq!(
            next_frame(&mut rx).await,
            Frame::Error {
                error: "RoomAccessDenied"
            }
        );

        let (mut staff, mut staff_rx) = open_session(&state, identity(8, "bee", true));
        staff.handle_command(Command::Join { room: 2 }).await.unwrap();
        assert_eq!(
            next_frame(&mut staff_rx).await,
            Frame::join_ack(2, "Back Office".into())
        );
    }

    #[tokio::test]
    async fn send_requires_membership_and_broadcasts_nothing_otherwise() {
        let state = test_state().await;
        let mut tap = state.bus.subscribe("room-1");
        let (mut session, mut rx) = open_session(&state, identity(7, "ali", false));

        session
            .handle_command(Command::Send {
                room: 1,
                message: "hello".into(),
            })
            .await
            .unwrap();

        assert_eq!(
            next_frame(&mut rx).await,
            Frame::Error {
                error: "RoomAccessDenied"
            }
        );
        assert!(tap.try_recv().is_err());
    }

    #[tokio::test]
    async fn sender_receives_its_own_message() {
        let state = test_state().await;
        let (mut session, mut rx) = open_session(&state, identity(7, "ali", false));

        session.handle_command(Command::Join { room: 1 }).await.unwrap();
        next_frame(&mut rx).await;

        session
            .handle_command(Command::Send {
                room: 1,
                message: "hello".into(),
            })
            .await
            .unwrap();

        assert_eq!(
            next_frame(&mut rx).await,
            Frame::message_notice(1, "ali".into(), "hello".into())
        );
    }

    #[tokio::test]
    async fn rejoin_runs_the_full_sequence_again() {
        let state = test_state().await;
        let mut tap = state.bus.subscribe("room-1");
        let (mut session, mut rx) = open_session(&state, identity(7, "ali", false));

        session.handle_command(Command::Join { room: 1 }).await.unwrap();
        session.handle_command(Command::Join { room: 1 }).await.unwrap();

        // Two acks, possibly interleaved with the session's own enter notice
        // from the second join.
        let mut acks = 0;
        while acks < 2 {
            if next_frame(&mut rx).await == Frame::join_ack(1, "Lobby".into()) {
                acks += 1;
            }
        }
        // Two enter notices on the wire; no no-op short-circuit.
        assert!(matches!(tap.recv().await, Ok(BroadcastEvent::Join { .. })));
        assert!(matches!(tap.recv().await, Ok(BroadcastEvent::Join { .. })));
        assert_eq!(session.joined_rooms().len(), 1);
    }

    #[tokio::test]
    async fn close_drains_every_room_even_when_a_lookup_fails() {
        let state = test_state().await;
        let (mut session, _rx) = open_session(&state, identity(7, "ali", true));

        session.handle_command(Command::Join { room: 1 }).await.unwrap();
        session.handle_command(Command::Join { room: 2 }).await.unwrap();

        // Room 1 disappears from the directory mid-session.
        sqlx::query("DELETE FROM rooms WHERE id=1")
            .execute(&state.db_pool)
            .await
            .unwrap();

        session.close().await;

        assert!(session.joined_rooms().is_empty());
        assert!(session.subscriptions.is_empty());
        assert!(state.presence.read(1).await.unwrap()[&7].left);
        assert!(state.presence.read(2).await.unwrap()[&7].left);
    }

    #[tokio::test]
    async fn client_error_leaves_the_session_usable() {
        let state = test_state().await;
        let (mut session, mut rx) = open_session(&state, identity(7, "ali", false));

        session.handle_command(Command::Join { room: 5451 }).await.unwrap();
        assert_eq!(
            next_frame(&mut rx).await,
            Frame::Error { error: "RoomInvalid" }
        );

        session.handle_command(Command::Join { room: 1 }).await.unwrap();
        assert_eq!(next_frame(&mut rx).await, Frame::join_ack(1, "Lobby".into()));
    }

    #[tokio::test]
    async fn notify_flag_off_suppresses_enter_and_leave_broadcasts() {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::query("CREATE TABLE rooms (id INTEGER PRIMARY KEY, title TEXT NOT NULL, staff_only BOOLEAN NOT NULL DEFAULT FALSE)")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO rooms (id,title,staff_only) VALUES (1,'Lobby',FALSE)")
            .execute(&pool)
            .await
            .unwrap();
        let state = AppState::new(
            pool,
            RelayConfig {
                notify_on_enter_leave: false,
                ..RelayConfig::default()
            },
        );

        let mut tap = state.bus.subscribe("room-1");
        let (mut session, mut rx) = open_session(&state, identity(7, "ali", false));

        session.handle_command(Command::Join { room: 1 }).await.unwrap();
        assert_eq!(next_frame(&mut rx).await, Frame::join_ack(1, "Lobby".into()));
        session.handle_command(Command::Leave { room: 1 }).await.unwrap();
        assert_eq!(next_frame(&mut rx).await, Frame::leave_ack(1));

        assert!(tap.try_recv().is_err());
    }

    #[tokio::test]
    async fn event_shaping_sanitizes_message_text_once() {
        let sanitizer = crate::rooms::msg::default_sanitizer();
        let frame = handle_event(
            BroadcastEvent::Message {
                room_id: 1,
                username: "ali".into(),
                message: "<script>".into(),
            },
            &sanitizer,
        );
        let Frame::Notice {
            msg_type, message, ..
        } = frame
        else {
            panic!("expected a notice");
        };
        assert_eq!(msg_type, MsgType::Message);
        assert_eq!(message.as_deref(), Some("&lt;script&gt;"));
    }
}
