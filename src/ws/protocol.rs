//! Decoding and validation of message envelopes.
//!
//! Every inbound frame passes through here before it reaches a room, so a
//! coordinator only ever sees well-formed messages.
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

use crate::models::{ClientMessage, ServerMessage};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProtocolError {
    #[error("message is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("message has no 'type' field")]
    MissingType,

    #[error("unknown message type '{0}'")]
    UnknownType(String),

    #[error("invalid '{kind}' message: {reason}")]
    InvalidPayload { kind: String, reason: String },

    #[error("binary frames are not supported")]
    BinaryFrame,

    #[error("connection already has a session")]
    AlreadyConnected,
}

fn decode_tagged<T: DeserializeOwned>(text: &str, known: &[&str]) -> Result<T, ProtocolError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;

    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(ProtocolError::MissingType)?
        .to_string();
    if !known.contains(&kind.as_str()) {
        return Err(ProtocolError::UnknownType(kind));
    }

    serde_json::from_value(value).map_err(|e| ProtocolError::InvalidPayload {
        kind,
        reason: e.to_string(),
    })
}

/// Decode and validate a peer's envelope.
pub fn decode_client(text: &str) -> Result<ClientMessage, ProtocolError> {
    let msg: ClientMessage = decode_tagged(text, &ClientMessage::TYPES)?;
    let invalid = |reason: String| ProtocolError::InvalidPayload {
        kind: msg.type_name().to_string(),
        reason,
    };

    match &msg {
        ClientMessage::Update(update) => update.changes.validate().map_err(invalid)?,
        ClientMessage::Cursor(cursor) => {
            if !cursor.x.is_finite() || !cursor.y.is_finite() {
                return Err(invalid("cursor position must be finite".to_string()));
            }
        }
        ClientMessage::Connect(_) | ClientMessage::Disconnect(_) => {}
    }
    Ok(msg)
}

/// Decode a room's envelope on the peer side.
pub fn decode_server(text: &str) -> Result<ServerMessage, ProtocolError> {
    decode_tagged(text, &ServerMessage::TYPES)
}

pub fn encode<T: serde::Serialize>(msg: &T) -> Result<String, serde_json::Error> {
    serde_json::to_string(msg)
}
