//! Message types for the realtime channel

use crate::notifications::Notification;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A structured frame pushed by the server: a `type` discriminator plus payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default)]
    pub payload: Value,
}

impl InboundMessage {
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
        }
    }

    /// Interpret the frame as a typed server event.
    ///
    /// Unknown kinds, and known kinds whose payload does not match the
    /// expected shape, come back as [`ServerEvent::Other`].
    pub fn event(&self) -> ServerEvent {
        let typed = match self.kind.as_str() {
            "notification" => serde_json::from_value(self.payload.clone())
                .ok()
                .map(ServerEvent::Notification),
            "threat_alert" => serde_json::from_value(self.payload.clone())
                .ok()
                .map(ServerEvent::ThreatAlert),
            "threat_update" => serde_json::from_value(self.payload.clone())
                .ok()
                .map(ServerEvent::ThreatUpdate),
            "system_message" => serde_json::from_value(self.payload.clone())
                .ok()
                .map(ServerEvent::SystemMessage),
            "pong" => Some(ServerEvent::Pong),
            "subscribed" => Some(ServerEvent::Subscribed {
                channel: string_field(&self.payload, "channel"),
            }),
            "error" => Some(ServerEvent::Error {
                message: string_field(&self.payload, "message"),
            }),
            _ => None,
        };
        typed.unwrap_or_else(|| ServerEvent::Other(self.clone()))
    }
}

fn string_field(payload: &Value, field: &str) -> String {
    payload
        .get(field)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// Typed view of the server-pushed events the client understands
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    /// A personal notification for the connected user
    Notification(Notification),

    /// A newly reported threat, broadcast to every client
    ThreatAlert(ThreatAlert),

    /// Moderation status change of an existing threat
    ThreatUpdate(ThreatUpdate),

    /// Platform-wide announcement
    SystemMessage(SystemMessage),

    /// Keepalive reply
    Pong,

    /// Subscription acknowledgement
    Subscribed { channel: String },

    /// Server-side rejection of a client frame
    Error { message: String },

    /// Anything else, delivered untouched
    Other(InboundMessage),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreatAlert {
    pub id: Option<String>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub severity: String,
    #[serde(default)]
    pub threat_type: String,
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreatUpdate {
    pub threat_id: String,
    pub status: String,
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemMessage {
    pub message: String,
    #[serde(default = "default_level")]
    pub level: String,
    pub timestamp: Option<String>,
}

fn default_level() -> String {
    "info".to_string()
}

/// A client-initiated frame, only sent while the channel is connected
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientMessage {
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl ClientMessage {
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload: Some(payload),
        }
    }

    /// Keepalive frame, answered by `pong`
    pub fn ping() -> Self {
        Self {
            kind: "ping".to_string(),
            payload: None,
        }
    }

    /// Ask the server to stream threat updates to this connection
    pub fn subscribe_threats() -> Self {
        Self {
            kind: "subscribe_threats".to_string(),
            payload: None,
        }
    }
}
