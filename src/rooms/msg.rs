use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize, Serializer};

use crate::rooms::presence::PresenceRecord;

/// Stable integer codes clients key their rendering off.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MsgType {
    Message = 0,
    Warning = 1,
    Alert = 2,
    Muted = 3,
    Enter = 4,
    Leave = 5,
    Internal = 6,
}

impl Serialize for MsgType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(*self as u8)
    }
}

/// An inbound client frame. Anything that doesn't parse as one of these is
/// silently dropped by the dispatch loop.
#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    Join { room: i64 },
    Leave { room: i64 },
    Send { room: i64, message: String },
    RoomUsers { room: i64 },
}

#[derive(Debug, Serialize, PartialEq)]
pub struct UsersPayload {
    pub users: HashMap<i64, PresenceRecord>,
}

/// An outbound frame, serialized straight into the socket's text payload.
#[derive(Debug, Serialize, PartialEq)]
#[serde(untagged)]
pub enum Frame {
    JoinAck {
        join: String,
        title: String,
    },
    LeaveAck {
        leave: String,
    },
    Error {
        error: &'static str,
    },
    Notice {
        msg_type: MsgType,
        room: i64,
        username: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    RoomUsers {
        #[serde(rename = "type")]
        msg_type: MsgType,
        room: i64,
        data: UsersPayload,
    },
}

impl Frame {
    pub fn join_ack(room_id: i64, title: String) -> Self {
        Self::JoinAck {
            join: room_id.to_string(),
            title,
        }
    }

    pub fn leave_ack(room_id: i64) -> Self {
        Self::LeaveAck {
            leave: room_id.to_string(),
        }
    }

    pub fn enter_notice(room_id: i64, username: String) -> Self {
        Self::Notice {
            msg_type: MsgType::Enter,
            room: room_id,
            username,
            message: None,
        }
    }

    pub fn leave_notice(room_id: i64, username: String) -> Self {
        Self::Notice {
            msg_type: MsgType::Leave,
            room: room_id,
            username,
            message: None,
        }
    }

    pub fn message_notice(room_id: i64, username: String, sanitized: String) -> Self {
        Self::Notice {
            msg_type: MsgType::Message,
            room: room_id,
            username,
            message: Some(sanitized),
        }
    }

    pub fn room_users(room_id: i64, users: HashMap<i64, PresenceRecord>) -> Self {
        Self::RoomUsers {
            msg_type: MsgType::Internal,
            room: room_id,
            data: UsersPayload { users },
        }
    }
}

/// Collaborator applied to message text exactly once, at the outbound edge.
pub type LinkSanitizer = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// The stock sanitizer: escape markup, then wrap bare http(s) URLs in
/// anchors so clients can render messages as HTML.
pub fn default_sanitizer() -> LinkSanitizer {
    Arc::new(|text| autolink(&escape_html(text)))
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

fn next_url(s: &str) -> Option<usize> {
    match (s.find("http://"), s.find("https://")) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

fn autolink(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = next_url(rest) {
        out.push_str(&rest[..start]);
        let tail = &rest[start..];
        let end = tail.find(char::is_whitespace).unwrap_or(tail.len());
        let url = &tail[..end];
        out.push_str("<a href=\"");
        out.push_str(url);
        out.push_str("\" rel=\"nofollow\">");
        out.push_str(url);
        out.push_str("</a>");
        rest = &tail[end..];
    }
    out.push_str(rest);
    out
}
