//! Protocol definitions for the realtime channel
//!
//! Frames are JSON text messages carrying a `type` discriminator. The server
//! puts the body under `data` (or `payload`); frames without either key use
//! their remaining top-level fields as the payload.

mod message;

pub use message::{
    ClientMessage, InboundMessage, ServerEvent, SystemMessage, ThreatAlert, ThreatUpdate,
};

use serde_json::{Map, Value};
use thiserror::Error;

/// Protocol-specific errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Message has no `type` discriminator")]
    MissingType,

    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Maximum inbound frame size accepted by the parser (1 MB)
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Parse an inbound text frame into a structured message
pub fn parse_inbound(text: &str) -> Result<InboundMessage, ProtocolError> {
    if text.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size: text.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }

    let value: Value = serde_json::from_str(text)
        .map_err(|e| ProtocolError::MalformedMessage(format!("Failed to deserialize: {}", e)))?;

    let Value::Object(mut fields) = value else {
        return Err(ProtocolError::MalformedMessage(
            "Frame is not a JSON object".to_string(),
        ));
    };

    let kind = match fields.remove("type") {
        Some(Value::String(kind)) if !kind.is_empty() => kind,
        _ => return Err(ProtocolError::MissingType),
    };

    let payload = fields
        .remove("payload")
        .or_else(|| fields.remove("data"))
        .unwrap_or_else(|| rest_as_payload(fields));

    Ok(InboundMessage { kind, payload })
}

fn rest_as_payload(fields: Map<String, Value>) -> Value {
    if fields.is_empty() {
        Value::Null
    } else {
        Value::Object(fields)
    }
}

/// Encode an outbound message as a text frame
pub fn encode_outbound(msg: &ClientMessage) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(msg)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_data_key() {
        let msg = parse_inbound(r#"{"type":"threat_alert","data":{"id":"t1","title":"Botnet","severity":"high","threat_type":"malware"}}"#).unwrap();
        assert_eq!(msg.kind, "threat_alert");
        assert_eq!(msg.payload["title"], "Botnet");
        assert!(matches!(msg.event(), ServerEvent::ThreatAlert(a) if a.severity == "high"));
    }

    #[test]
    fn test_parse_payload_key() {
        let msg = parse_inbound(r#"{"type":"custom","payload":[1,2,3]}"#).unwrap();
        assert_eq!(msg.payload, json!([1, 2, 3]));
        assert!(matches!(msg.event(), ServerEvent::Other(_)));
    }

    #[test]
    fn test_parse_flat_frame_uses_remaining_fields() {
        let msg = parse_inbound(r#"{"type":"subscribed","channel":"threats"}"#).unwrap();
        assert_eq!(
            msg.event(),
            ServerEvent::Subscribed {
                channel: "threats".to_string()
            }
        );

        let pong = parse_inbound(r#"{"type":"pong"}"#).unwrap();
        assert_eq!(pong.payload, Value::Null);
        assert_eq!(pong.event(), ServerEvent::Pong);
    }

    #[test]
    fn test_python_repr_frame_is_malformed() {
        let result = parse_inbound("{'type': 'system_message', 'data': {'message': 'hi'}}");
        assert!(matches!(result, Err(ProtocolError::MalformedMessage(_))));
    }

    #[test]
    fn test_missing_or_empty_type() {
        assert!(matches!(
            parse_inbound(r#"{"data":{}}"#),
            Err(ProtocolError::MissingType)
        ));
        assert!(matches!(
            parse_inbound(r#"{"type":""}"#),
            Err(ProtocolError::MissingType)
        ));
        assert!(matches!(
            parse_inbound(r#"{"type":7}"#),
            Err(ProtocolError::MissingType)
        ));
    }

    #[test]
    fn test_non_object_frame() {
        assert!(matches!(
            parse_inbound("[1,2]"),
            Err(ProtocolError::MalformedMessage(_))
        ));
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let big = format!(r#"{{"type":"x","data":"{}"}}"#, "a".repeat(MAX_MESSAGE_SIZE));
        assert!(matches!(
            parse_inbound(&big),
            Err(ProtocolError::MessageTooLarge { .. })
        ));
    }

    #[test]
    fn test_system_message_default_level() {
        let msg = parse_inbound(r#"{"type":"system_message","data":{"message":"maintenance"}}"#)
            .unwrap();
        match msg.event() {
            ServerEvent::SystemMessage(m) => {
                assert_eq!(m.message, "maintenance");
                assert_eq!(m.level, "info");
            }
            other => panic!("Expected SystemMessage, got {:?}", other),
        }
    }

    #[test]
    fn test_known_kind_with_wrong_shape_falls_back_to_other() {
        let msg = parse_inbound(r#"{"type":"threat_update","data":{"nope":true}}"#).unwrap();
        assert!(matches!(msg.event(), ServerEvent::Other(m) if m.kind == "threat_update"));
    }

    #[test]
    fn test_encode_outbound() {
        assert_eq!(encode_outbound(&ClientMessage::ping()).unwrap(), r#"{"type":"ping"}"#);
        assert_eq!(
            encode_outbound(&ClientMessage::new("chat", json!({"text": "hi"}))).unwrap(),
            r#"{"type":"chat","payload":{"text":"hi"}}"#
        );
    }
}
