use bytes::Bytes;
use derive_more::Display;
use serde::de::{value::StrDeserializer, IntoDeserializer};
use serde::{Deserialize, Serialize};

use super::data_types::PeerId;
use super::errors::CodecError;

/// every message exchanged through the relay
#[allow(clippy::upper_case_acronyms)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
pub enum MessageType {
    /// ask the relay whether `target` is connected
    FindUser,
    /// relay reply: `target` is connected
    UserOnline,
    /// relay reply: `target` is not connected
    UserOffline,
    StartCall,
    AcceptCall,
    RejectCall,
    /// payload holds the offering session description
    Offer,
    /// payload holds the answering session description
    Answer,
    /// payload holds a serialized ICE candidate
    ICE,
    EndCall,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalMessage {
    pub message_type: MessageType,
    pub sender: PeerId,
    pub target: PeerId,
    /// SDP for Offer/Answer, a serialized candidate for ICE. None otherwise
    pub payload: Option<String>,
}

// wire shape: {"type": .., "sender": .., "target": .., "data": ..}
#[derive(Serialize)]
struct WireOut<'a> {
    #[serde(rename = "type")]
    message_type: MessageType,
    sender: &'a str,
    target: &'a str,
    data: Option<&'a str>,
}

#[derive(Deserialize)]
struct WireIn {
    #[serde(rename = "type")]
    message_type: String,
    sender: String,
    target: String,
    #[serde(default)]
    data: Option<String>,
}

impl SignalMessage {
    pub fn new(message_type: MessageType, sender: &str, target: &str) -> Self {
        Self {
            message_type,
            sender: sender.to_string(),
            target: target.to_string(),
            payload: None,
        }
    }

    pub fn with_payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    pub fn encode(&self) -> Bytes {
        let wire = WireOut {
            message_type: self.message_type,
            sender: &self.sender,
            target: &self.target,
            data: self.payload.as_deref(),
        };
        // a struct of strings always serializes
        Bytes::from(serde_json::to_vec(&wire).unwrap_or_default())
    }

    /// unknown fields are ignored and an absent `data` reads as None
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let wire: WireIn = serde_json::from_slice(bytes)?;
        // an unknown type is reported apart from malformed JSON
        let name: StrDeserializer<serde::de::value::Error> =
            wire.message_type.as_str().into_deserializer();
        let message_type = MessageType::deserialize(name)
            .map_err(|_| CodecError::UnknownMessageType(wire.message_type.clone()))?;
        Ok(Self {
            message_type,
            sender: wire.sender,
            target: wire.target,
            payload: wire.data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_wire_shape() {
        let msg = SignalMessage::new(MessageType::Offer, "a", "b").with_payload("v=0");
        let value: serde_json::Value = serde_json::from_slice(&msg.encode()).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"type": "Offer", "sender": "a", "target": "b", "data": "v=0"})
        );

        let msg = SignalMessage::new(MessageType::EndCall, "a", "b");
        let value: serde_json::Value = serde_json::from_slice(&msg.encode()).unwrap();
        assert_eq!(value["data"], serde_json::Value::Null);
    }

    #[test]
    fn decodes_with_missing_data_and_extra_fields() {
        let raw = br#"{"type":"StartCall","sender":"b","target":"a","extra":1}"#;
        let msg = SignalMessage::decode(raw).unwrap();
        assert_eq!(msg.message_type, MessageType::StartCall);
        assert_eq!(msg.sender, "b");
        assert_eq!(msg.target, "a");
        assert_eq!(msg.payload, None);
    }

    #[test]
    fn decodes_ice_payload() {
        let raw = br#"{"type":"ICE","sender":"b","target":"a","data":"{\"candidate\":\"x\"}"}"#;
        let msg = SignalMessage::decode(raw).unwrap();
        assert_eq!(msg.message_type, MessageType::ICE);
        assert_eq!(msg.payload.as_deref(), Some(r#"{"candidate":"x"}"#));
    }

    #[test]
    fn type_names_match_variants() {
        for t in [MessageType::FindUser, MessageType::ICE, MessageType::EndCall] {
            let raw = format!(r#"{{"type":"{}","sender":"b","target":"a"}}"#, t);
            assert_eq!(SignalMessage::decode(raw.as_bytes()).unwrap().message_type, t);
        }
        // names are case sensitive
        let raw = br#"{"type":"ice","sender":"b","target":"a"}"#;
        assert!(matches!(
            SignalMessage::decode(raw),
            Err(CodecError::UnknownMessageType(t)) if t == "ice"
        ));
    }

    #[test]
    fn unknown_type_is_distinct_from_malformed() {
        let raw = br#"{"type":"Ring","sender":"b","target":"a"}"#;
        assert!(matches!(
            SignalMessage::decode(raw),
            Err(CodecError::UnknownMessageType(t)) if t == "Ring"
        ));

        assert!(matches!(
            SignalMessage::decode(b"not json"),
            Err(CodecError::Malformed(_))
        ));
        assert!(matches!(
            SignalMessage::decode(br#"{"type":"Offer","sender":"b"}"#),
            Err(CodecError::Malformed(_))
        ));
    }
}
