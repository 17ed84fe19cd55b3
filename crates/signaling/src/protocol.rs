//! JSON signaling protocol types
//!
//! Every message in either direction is one JSON object with a `type` field.
//! Inbound messages are kept as raw objects alongside their typed form, since
//! offers, answers and candidates are relayed with their original fields.

use crate::device::DeviceType;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Reply sent for any message that fails to parse
pub const INVALID_MESSAGE_FORMAT: &str = "Invalid message format";

/// Reason attached to `user-left` when a device reconnects
pub const REASON_RECONNECTED: &str = "reconnected";

/// Reason attached to `bye` when the liveness monitor gives up on a peer
pub const REASON_TIMEOUT: &str = "timeout";

/// Inbound message type names
pub mod message_types {
    pub const JOIN: &str = "join";
    pub const OFFER: &str = "offer";
    pub const ANSWER: &str = "answer";
    pub const ICE_CANDIDATE: &str = "ice-candidate";
    pub const BYE: &str = "bye";
    pub const PING: &str = "ping";
    pub const PONG: &str = "pong";
    pub const IOS_CAPABILITIES: &str = "ios-capabilities";
}

/// Parameters of a `join` message
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct JoinParams {
    pub room_id: Option<String>,
    pub device_id: Option<String>,
    pub reconnect: bool,
    pub capabilities: Option<Value>,
}

/// Parameters of an `offer` or `answer` message
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SdpParams {
    pub sdp: String,
    #[serde(default)]
    pub room_id: Option<String>,
}

/// Parameters of an `ice-candidate` message
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CandidateParams {
    pub candidate: Value,
    #[serde(default)]
    pub sdp_mid: Option<Value>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_m_line_index: Option<Value>,
    #[serde(default)]
    pub room_id: Option<String>,
}

/// Parameters of a `bye`, `ping` or `pong` message
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct RoomParams {
    pub room_id: Option<String>,
}

/// Parameters of an `ios-capabilities` message
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CapabilitiesParams {
    pub capabilities: Value,
    #[serde(default)]
    pub room_id: Option<String>,
}

/// Typed inbound message
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Join(JoinParams),
    Offer(SdpParams),
    Answer(SdpParams),
    IceCandidate(CandidateParams),
    Bye(RoomParams),
    Ping(RoomParams),
    Pong(RoomParams),
    IosCapabilities(CapabilitiesParams),
    /// Unknown type, relayed verbatim
    Other { kind: String, room_id: Option<String> },
}

impl ClientMessage {
    /// Room named by the message, if any
    pub fn room_id(&self) -> Option<&str> {
        match self {
            ClientMessage::Join(p) => p.room_id.as_deref(),
            ClientMessage::Offer(p) | ClientMessage::Answer(p) => p.room_id.as_deref(),
            ClientMessage::IceCandidate(p) => p.room_id.as_deref(),
            ClientMessage::Bye(p) | ClientMessage::Ping(p) | ClientMessage::Pong(p) => {
                p.room_id.as_deref()
            }
            ClientMessage::IosCapabilities(p) => p.room_id.as_deref(),
            ClientMessage::Other { room_id, .. } => room_id.as_deref(),
        }
    }
}

/// A parsed inbound message together with its raw object
#[derive(Debug, Clone)]
pub struct Inbound {
    pub message: ClientMessage,
    pub raw: Map<String, Value>,
}

fn params<T: for<'de> Deserialize<'de>>(raw: &Map<String, Value>) -> Result<T> {
    serde_json::from_value(Value::Object(raw.clone()))
        .map_err(|e| Error::MalformedMessage(e.to_string()))
}

/// Parse an inbound text frame
pub fn parse_client_message(text: &str) -> Result<Inbound> {
    use message_types::*;

    let value: Value =
        serde_json::from_str(text).map_err(|e| Error::MalformedMessage(e.to_string()))?;
    let Value::Object(raw) = value else {
        return Err(Error::MalformedMessage("expected a JSON object".to_string()));
    };
    let Some(kind) = raw.get("type").and_then(Value::as_str).map(str::to_string) else {
        return Err(Error::MalformedMessage("missing string field `type`".to_string()));
    };

    let message = match kind.as_str() {
        JOIN => ClientMessage::Join(params(&raw)?),
        OFFER => ClientMessage::Offer(params(&raw)?),
        ANSWER => ClientMessage::Answer(params(&raw)?),
        ICE_CANDIDATE => ClientMessage::IceCandidate(params(&raw)?),
        BYE => ClientMessage::Bye(params(&raw)?),
        PING => ClientMessage::Ping(params(&raw)?),
        PONG => ClientMessage::Pong(params(&raw)?),
        IOS_CAPABILITIES => ClientMessage::IosCapabilities(params(&raw)?),
        _ => ClientMessage::Other {
            room_id: raw
                .get("roomId")
                .and_then(Value::as_str)
                .map(str::to_string),
            kind,
        },
    };

    Ok(Inbound { message, raw })
}

/// Messages produced by the relay itself
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    UserJoined {
        user_id: String,
        device_type: DeviceType,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        is_reconnect: Option<bool>,
    },

    #[serde(rename_all = "camelCase")]
    UserLeft {
        user_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        device_type: Option<DeviceType>,
    },

    #[serde(rename_all = "camelCase")]
    RoomInfo {
        clients: usize,
        room: String,
        device_types: Vec<DeviceType>,
    },

    Error { message: String },

    #[serde(rename_all = "camelCase")]
    PeerDisconnected {
        user_id: String,
        device_type: DeviceType,
    },

    #[serde(rename_all = "camelCase")]
    Ping { timestamp: i64, keep_alive: bool },

    Pong { timestamp: i64 },

    Bye { reason: String },

    #[serde(rename_all = "camelCase")]
    IosCapabilitiesUpdate {
        user_id: String,
        capabilities: Value,
    },
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }

    /// Refusal for a full room, naming the limit
    pub fn room_full(max: usize) -> Self {
        Self::error(format!("Room is full, maximum {} connections allowed", max))
    }
}

/// Copy a relayed message and stamp it with its sender
pub fn stamp(
    raw: &Map<String, Value>,
    sender_id: &str,
    sender_device: DeviceType,
    timestamp: i64,
) -> Value {
    let mut out = raw.clone();
    out.insert("senderId".to_string(), Value::from(sender_id));
    out.insert(
        "senderDeviceType".to_string(),
        Value::from(sender_device.as_str()),
    );
    out.insert("timestamp".to_string(), Value::from(timestamp));
    Value::Object(out)
}

/// Copy of `message` with its `sdp` field replaced
pub fn with_sdp(message: &Value, sdp: String) -> Value {
    let mut out = message.clone();
    if let Some(obj) = out.as_object_mut() {
        obj.insert("sdp".to_string(), Value::String(sdp));
    }
    out
}

/// Milliseconds since the Unix epoch
pub fn current_timestamp() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
