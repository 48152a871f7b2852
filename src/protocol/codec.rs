//! Frame encoding for protocol messages.

use crate::common::error::ClientError;
use crate::protocol::message::ProtocolMessage;

/// Converts protocol messages to and from transport text frames.
pub trait FrameCodec: Send + Sync {
    fn encode(&self, message: &ProtocolMessage) -> Result<String, ClientError>;
    fn decode(&self, frame: &str) -> Result<ProtocolMessage, ClientError>;
}

/// JSON text frames (`format=json`).
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl FrameCodec for JsonCodec {
    fn encode(&self, message: &ProtocolMessage) -> Result<String, ClientError> {
        Ok(serde_json::to_string(message)?)
    }

    fn decode(&self, frame: &str) -> Result<ProtocolMessage, ClientError> {
        Ok(serde_json::from_str(frame)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::message::Action;

    #[test]
    fn test_decode_connected() {
        let frame = r#"{
            "action": 4,
            "connectionId": "abc123",
            "connectionSerial": -1,
            "connectionDetails": {
                "connectionKey": "abc123!xyz",
                "connectionStateTtl": 120000,
                "maxIdleInterval": 15000
            }
        }"#;
        let msg = JsonCodec.decode(frame).unwrap();
        assert_eq!(msg.action, Action::Connected);
        assert_eq!(msg.connection_id.as_deref(), Some("abc123"));
        let details = msg.connection_details.unwrap();
        assert_eq!(details.connection_key.as_deref(), Some("abc123!xyz"));
        assert_eq!(details.connection_state_ttl, Some(120000));
    }

    #[test]
    fn test_decode_nack_with_error() {
        let frame = r#"{"action":2,"msgSerial":3,"count":2,
            "error":{"code":40160,"statusCode":401,"message":"not permitted"}}"#;
        let msg = JsonCodec.decode(frame).unwrap();
        assert_eq!(msg.action, Action::Nack);
        assert_eq!(msg.msg_serial, Some(3));
        assert_eq!(msg.count, Some(2));
        assert_eq!(msg.error.unwrap().code, 40160);
    }

    #[test]
    fn test_encode_omits_absent_fields() {
        let frame = JsonCodec
            .encode(&ProtocolMessage::attach("chat", None))
            .unwrap();
        assert_eq!(frame, r#"{"action":10,"channel":"chat"}"#);
    }

    #[test]
    fn test_unknown_action_is_codec_error() {
        let result = JsonCodec.decode(r#"{"action":99}"#);
        assert!(matches!(result, Err(ClientError::Codec { .. })));
    }
}
