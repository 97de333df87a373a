use serde::Deserialize;

use crate::{ChatMode, ProtoError};

/// Inbound frames. `message` carries both plain chat and slash macros;
/// the hub routes on the leading character of `text`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Message {
        actor: String,
        text: String,
        #[serde(default)]
        mode: Option<ChatMode>,
        #[serde(default)]
        context: Option<String>,
        #[serde(default)]
        encounter_id: Option<String>,
    },
    Whisper {
        actor: String,
        to: String,
        text: String,
    },
    Narration {
        actor: String,
        text: String,
    },
    Ping {},
}

pub fn parse_client_frame(s: &str) -> Result<ClientFrame, ProtoError> {
    match serde_json::from_str::<ClientFrame>(s) {
        Ok(f) => Ok(f),
        Err(e) => {
            let msg = e.to_string();
            if msg.contains("unknown variant") {
                Err(ProtoError::UnknownType(msg))
            } else {
                Err(ProtoError::BadJson(msg))
            }
        }
    }
}
