//! `tableproto`: the JSON frame protocol spoken over the party WebSocket.
//!
//! Frames are internally tagged objects; the `type` field discriminates.
//! Inbound frames (client → hub) live in [`client`], outbound frames
//! (hub → client) in [`server`]. Decoding never panics: malformed input
//! comes back as a [`ProtoError`] so the hub can answer the sender with a
//! private error instead of dropping the socket.

pub mod client;
pub mod conn;
pub mod server;

use serde::{Deserialize, Serialize};

/// In-character vs out-of-character chat. Plain chat defaults to IC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChatMode {
    IC,
    OOC,
}

impl ChatMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ChatMode::IC => "IC",
            ChatMode::OOC => "OOC",
        }
    }
}

#[derive(Debug, Clone)]
pub enum ProtoError {
    BadJson(String),
    UnknownType(String),
}

impl std::fmt::Display for ProtoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtoError::BadJson(e) => write!(f, "bad json: {e}"),
            ProtoError::UnknownType(t) => write!(f, "unknown frame type: {t}"),
        }
    }
}

impl std::error::Error for ProtoError {}

/// RFC 3339 wall-clock stamp for outbound frames and persisted rows.
pub fn now_ts() -> String {
    chrono::Utc::now().to_rfc3339()
}
