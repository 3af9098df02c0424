//! Decoded message model.
//!
//! A [`Message`] is the envelope with its payload already interpreted: text
//! payloads become JSON objects, binary payloads stay as bytes. All Cast
//! semantics beyond the namespace live inside the JSON, so the helpers here
//! only peek at the handful of keys the engine itself needs.

use crate::error::WireError;
use crate::namespace::{MESSAGE_TYPE, REQUEST_ID};
use crate::proto::{CastMessage, PayloadType, ProtocolVersion};
use bytes::Bytes;
use serde_json::Value;
use std::fmt;

/// Interpreted payload
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// UTF-8 payload parsed as a JSON object
    Json(Value),
    /// Raw bytes (device auth and app-specific binary channels)
    Binary(Bytes),
}

/// A message on a namespace, independent of its frame encoding
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Envelope protocol version
    pub protocol_version: ProtocolVersion,
    /// Sender id
    pub source_id: String,
    /// Receiver id
    pub destination_id: String,
    /// Namespace (case-sensitive)
    pub namespace: String,
    /// Payload
    pub payload: Payload,
}

impl Message {
    /// Build a JSON message
    pub fn json(
        namespace: impl Into<String>,
        source_id: impl Into<String>,
        destination_id: impl Into<String>,
        data: Value,
    ) -> Self {
        Self {
            protocol_version: ProtocolVersion::Castv210,
            source_id: source_id.into(),
            destination_id: destination_id.into(),
            namespace: namespace.into(),
            payload: Payload::Json(data),
        }
    }

    /// Build a binary message
    pub fn binary(
        namespace: impl Into<String>,
        source_id: impl Into<String>,
        destination_id: impl Into<String>,
        data: impl Into<Bytes>,
    ) -> Self {
        Self {
            protocol_version: ProtocolVersion::Castv210,
            source_id: source_id.into(),
            destination_id: destination_id.into(),
            namespace: namespace.into(),
            payload: Payload::Binary(data.into()),
        }
    }

    /// JSON body, if this is a text message
    pub fn data(&self) -> Option<&Value> {
        match &self.payload {
            Payload::Json(value) => Some(value),
            Payload::Binary(_) => None,
        }
    }

    /// Mutable JSON body, if this is a text message
    pub fn data_mut(&mut self) -> Option<&mut Value> {
        match &mut self.payload {
            Payload::Json(value) => Some(value),
            Payload::Binary(_) => None,
        }
    }

    /// Binary body, if this is a binary message
    pub fn bytes(&self) -> Option<&Bytes> {
        match &self.payload {
            Payload::Binary(bytes) => Some(bytes),
            Payload::Json(_) => None,
        }
    }

    /// Value of the `requestId` key, when it is a non-negative integer
    pub fn request_id(&self) -> Option<u64> {
        self.data()?.get(REQUEST_ID)?.as_u64()
    }

    /// Value of the `type` key
    pub fn message_type(&self) -> Option<&str> {
        self.data()?.get(MESSAGE_TYPE)?.as_str()
    }

    /// Convert into the protobuf envelope
    pub fn to_envelope(&self) -> CastMessage {
        let (payload_type, payload_utf8, payload_binary) = match &self.payload {
            Payload::Json(value) => (PayloadType::String, Some(value.to_string()), None),
            Payload::Binary(bytes) => (PayloadType::Binary, None, Some(bytes.to_vec())),
        };

        CastMessage {
            protocol_version: self.protocol_version as i32,
            source_id: self.source_id.clone(),
            destination_id: self.destination_id.clone(),
            namespace: self.namespace.clone(),
            payload_type: payload_type as i32,
            payload_utf8,
            payload_binary,
        }
    }

    /// Interpret a protobuf envelope.
    ///
    /// Fails with [`WireError::MalformedPayload`] when a text payload is not a
    /// JSON object; the envelope itself was fine in that case.
    pub fn from_envelope(envelope: CastMessage) -> Result<Self, WireError> {
        let protocol_version = ProtocolVersion::try_from(envelope.protocol_version)
            .map_err(|e| WireError::Protobuf(format!("protocol version: {e}")))?;
        let payload_type = PayloadType::try_from(envelope.payload_type)
            .map_err(|e| WireError::Protobuf(format!("payload type: {e}")))?;

        let payload = match payload_type {
            PayloadType::String => {
                let text = envelope.payload_utf8.ok_or(WireError::MissingPayload)?;
                match serde_json::from_str::<Value>(&text) {
                    Ok(value @ Value::Object(_)) => Payload::Json(value),
                    Ok(_) => {
                        return Err(WireError::MalformedPayload {
                            namespace: envelope.namespace,
                            reason: "payload is not a JSON object".to_string(),
                        })
                    }
                    Err(e) => {
                        return Err(WireError::MalformedPayload {
                            namespace: envelope.namespace,
                            reason: e.to_string(),
                        })
                    }
                }
            }
            PayloadType::Binary => {
                let bytes = envelope.payload_binary.ok_or(WireError::MissingPayload)?;
                Payload::Binary(Bytes::from(bytes))
            }
        };

        Ok(Self {
            protocol_version,
            source_id: envelope.source_id,
            destination_id: envelope.destination_id,
            namespace: envelope.namespace,
            payload,
        })
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Message {} from {} to {}: ",
            self.namespace, self.source_id, self.destination_id
        )?;
        match &self.payload {
            Payload::Json(value) => write!(f, "{value}"),
            Payload::Binary(bytes) => write!(f, "<{} bytes>", bytes.len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::namespace::{NS_RECEIVER, PLATFORM_DESTINATION_ID};
    use serde_json::json;

    #[test]
    fn test_request_id_and_type() {
        let msg = Message::json(
            NS_RECEIVER,
            "sender-0",
            PLATFORM_DESTINATION_ID,
            json!({"type": "GET_STATUS", "requestId": 7}),
        );
        assert_eq!(msg.request_id(), Some(7));
        assert_eq!(msg.message_type(), Some("GET_STATUS"));

        let negative = Message::json(NS_RECEIVER, "a", "b", json!({"requestId": -1}));
        assert_eq!(negative.request_id(), None);
    }

    #[test]
    fn test_non_object_json_is_malformed() {
        let envelope = CastMessage {
            protocol_version: 0,
            source_id: "receiver-0".into(),
            destination_id: "sender-0".into(),
            namespace: NS_RECEIVER.into(),
            payload_type: PayloadType::String as i32,
            payload_utf8: Some("[1, 2, 3]".into()),
            payload_binary: None,
        };

        match Message::from_envelope(envelope) {
            Err(err @ WireError::MalformedPayload { .. }) => assert!(!err.is_fatal()),
            other => panic!("expected malformed payload, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_payload() {
        let envelope = CastMessage {
            protocol_version: 0,
            source_id: "receiver-0".into(),
            destination_id: "sender-0".into(),
            namespace: "urn:x-cast:custom".into(),
            payload_type: PayloadType::Binary as i32,
            payload_utf8: None,
            payload_binary: None,
        };
        assert_eq!(Message::from_envelope(envelope), Err(WireError::MissingPayload));
    }

    #[test]
    fn test_display_hides_binary_body() {
        let msg = Message::binary("urn:x-cast:custom", "a", "b", vec![1u8, 2, 3]);
        assert_eq!(msg.to_string(), "Message urn:x-cast:custom from a to b: <3 bytes>");
    }
}
