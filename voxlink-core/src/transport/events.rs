//! Signaling events carried as JSON text frames on the transport socket.
//!
//! Every text frame is an object with a `type` discriminator. Types the
//! client does not recognise are forwarded as [`SignalingEvent::Unknown`]
//! rather than rejected — the server is free to grow its vocabulary without
//! breaking older clients.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One decoded control event from the remote service, plus the locally
/// generated socket-lifecycle events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum SignalingEvent {
    /// The transport session is established server-side.
    RoomJoined { payload: Value },
    /// The assistant or user started/stopped speaking.
    SpeechUpdate {
        status: String,
        role: Option<String>,
    },
    /// A partial or final transcript line.
    Transcript {
        role: Option<String>,
        transcript_type: Option<String>,
        transcript: String,
    },
    /// Server-reported error.
    ServerError { message: String },
    /// Any type this client does not know.
    Unknown { kind: String, payload: Value },
    /// Locally generated: the socket closed normally.
    SocketClosed,
    /// Locally generated: the socket failed mid-call.
    SocketError { message: String },
}

impl SignalingEvent {
    /// Decode a text frame. Frames without a string `type` field, or that are
    /// not JSON objects at all, become `Unknown` with kind `"invalid"` — a
    /// malformed control frame must never kill the read loop.
    pub fn from_json(text: &str) -> Self {
        let value: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(_) => {
                return Self::Unknown {
                    kind: "invalid".into(),
                    payload: Value::String(text.to_string()),
                }
            }
        };
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("invalid")
            .to_string();

        match kind.as_str() {
            "room-joined" => Self::RoomJoined { payload: value },
            "speech-update" => Self::SpeechUpdate {
                status: value
                    .get("status")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                role: value
                    .get("role")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            },
            "transcript" => Self::Transcript {
                role: value
                    .get("role")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                transcript_type: value
                    .get("transcriptType")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                transcript: value
                    .get("transcript")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            },
            "error" => Self::ServerError {
                message: value
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            },
            _ => Self::Unknown {
                kind,
                payload: value,
            },
        }
    }
}
