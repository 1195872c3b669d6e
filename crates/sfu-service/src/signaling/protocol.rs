//! Signaling wire format.
//!
//! JSON text frames with a `type` discriminator in SCREAMING_SNAKE_CASE and
//! camelCase fields. Inbound frames are parsed in two phases: the envelope's
//! `type` is read first, then the payload is decoded and validated against
//! that type, so every failure can name the request it belongs to.

use crate::actors::messages::ProducerInfo;
use crate::errors::SfuError;
use crate::media::{MediaKind, TransportOptions};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Longest accepted chat message, in characters.
pub const MAX_CHAT_MESSAGE_CHARS: usize = 4096;

/// Messages sent by clients.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    JoinRoom { room_id: String },

    RequestSendTransport,

    RequestReceiveTransport,

    #[serde(rename_all = "camelCase")]
    ConnectProducerTransport {
        transport_id: String,
        dtls_parameters: Value,
    },

    #[serde(rename_all = "camelCase")]
    ConnectReceiveTransport {
        transport_id: String,
        dtls_parameters: Value,
    },

    #[serde(rename_all = "camelCase")]
    ProduceMedia {
        transport_id: String,
        kind: MediaKind,
        rtp_parameters: Value,
    },

    #[serde(rename_all = "camelCase")]
    ConsumeMedia {
        transport_id: String,
        producer_id: String,
        rtp_capabilities: Value,
    },

    #[serde(rename_all = "camelCase")]
    Resume { consumer_id: String },

    #[serde(rename_all = "camelCase")]
    CloseProducer { producer_id: String },

    ExitRoom,

    Message { message: String },
}

impl ClientMessage {
    /// Every inbound `type` value.
    pub const TYPES: [&'static str; 11] = [
        "JOIN_ROOM",
        "REQUEST_SEND_TRANSPORT",
        "REQUEST_RECEIVE_TRANSPORT",
        "CONNECT_PRODUCER_TRANSPORT",
        "CONNECT_RECEIVE_TRANSPORT",
        "PRODUCE_MEDIA",
        "CONSUME_MEDIA",
        "RESUME",
        "CLOSE_PRODUCER",
        "EXIT_ROOM",
        "MESSAGE",
    ];

    /// Wire `type` of this message.
    #[must_use]
    pub const fn message_type(&self) -> &'static str {
        match self {
            ClientMessage::JoinRoom { .. } => "JOIN_ROOM",
            ClientMessage::RequestSendTransport => "REQUEST_SEND_TRANSPORT",
            ClientMessage::RequestReceiveTransport => "REQUEST_RECEIVE_TRANSPORT",
            ClientMessage::ConnectProducerTransport { .. } => "CONNECT_PRODUCER_TRANSPORT",
            ClientMessage::ConnectReceiveTransport { .. } => "CONNECT_RECEIVE_TRANSPORT",
            ClientMessage::ProduceMedia { .. } => "PRODUCE_MEDIA",
            ClientMessage::ConsumeMedia { .. } => "CONSUME_MEDIA",
            ClientMessage::Resume { .. } => "RESUME",
            ClientMessage::CloseProducer { .. } => "CLOSE_PRODUCER",
            ClientMessage::ExitRoom => "EXIT_ROOM",
            ClientMessage::Message { .. } => "MESSAGE",
        }
    }

    /// Payload checks serde cannot express.
    fn validate(&self) -> Result<(), String> {
        match self {
            ClientMessage::JoinRoom { room_id } => non_empty("roomId", room_id),
            ClientMessage::ConnectProducerTransport {
                transport_id,
                dtls_parameters,
            }
            | ClientMessage::ConnectReceiveTransport {
                transport_id,
                dtls_parameters,
            } => {
                non_empty("transportId", transport_id)?;
                object("dtlsParameters", dtls_parameters)
            }
            ClientMessage::ProduceMedia {
                transport_id,
                rtp_parameters,
                ..
            } => {
                non_empty("transportId", transport_id)?;
                object("rtpParameters", rtp_parameters)
            }
            ClientMessage::ConsumeMedia {
                transport_id,
                producer_id,
                rtp_capabilities,
            } => {
                non_empty("transportId", transport_id)?;
                non_empty("producerId", producer_id)?;
                object("rtpCapabilities", rtp_capabilities)
            }
            ClientMessage::Resume { consumer_id } => non_empty("consumerId", consumer_id),
            ClientMessage::CloseProducer { producer_id } => non_empty("producerId", producer_id),
            ClientMessage::Message { message } => {
                if message.trim().is_empty() {
                    Err("message must not be empty".to_string())
                } else if message.chars().count() > MAX_CHAT_MESSAGE_CHARS {
                    Err(format!(
                        "message exceeds {MAX_CHAT_MESSAGE_CHARS} characters"
                    ))
                } else {
                    Ok(())
                }
            }
            ClientMessage::RequestSendTransport
            | ClientMessage::RequestReceiveTransport
            | ClientMessage::ExitRoom => Ok(()),
        }
    }
}

fn non_empty(field: &str, value: &str) -> Result<(), String> {
    if value.trim().is_empty() {
        Err(format!("{field} must not be empty"))
    } else {
        Ok(())
    }
}

fn object(field: &str, value: &Value) -> Result<(), String> {
    if value.is_object() {
        Ok(())
    } else {
        Err(format!("{field} must be an object"))
    }
}

/// Inbound frame that could not be turned into a [`ClientMessage`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason}")]
pub struct ParseError {
    /// The frame's `type`, when one could be read.
    pub request_type: Option<String>,
    pub reason: String,
}

impl ParseError {
    fn new(request_type: Option<&str>, reason: impl Into<String>) -> Self {
        Self {
            request_type: request_type.map(str::to_string),
            reason: reason.into(),
        }
    }
}

/// Parse and validate one inbound text frame.
pub fn parse_client_message(text: &str) -> Result<ClientMessage, ParseError> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| ParseError::new(None, format!("malformed JSON: {e}")))?;

    let Some(envelope) = value.as_object() else {
        return Err(ParseError::new(None, "message must be a JSON object"));
    };

    let request_type = match envelope.get("type") {
        Some(Value::String(t)) => t.clone(),
        Some(_) => return Err(ParseError::new(None, "type must be a string")),
        None => return Err(ParseError::new(None, "missing field `type`")),
    };

    if !ClientMessage::TYPES.contains(&request_type.as_str()) {
        return Err(ParseError::new(
            Some(&request_type),
            format!("unknown message type {request_type}"),
        ));
    }

    let message: ClientMessage = serde_json::from_value(value)
        .map_err(|e| ParseError::new(Some(&request_type), e.to_string()))?;

    message
        .validate()
        .map_err(|reason| ParseError::new(Some(&request_type), reason))?;

    Ok(message)
}

/// Messages sent to clients.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    RoomJoined {
        room_id: String,
        rtp_capabilities: Value,
        producers: Vec<ProducerInfo>,
    },

    #[serde(rename_all = "camelCase")]
    SendTransportCreated { transport_options: TransportOptions },

    #[serde(rename_all = "camelCase")]
    ReceiveTransportCreated { transport_options: TransportOptions },

    #[serde(rename_all = "camelCase")]
    TransportConnected { transport_id: String },

    #[serde(rename_all = "camelCase")]
    ProducerCreated {
        producer_id: String,
        kind: MediaKind,
    },

    #[serde(rename_all = "camelCase")]
    MediaConsumed {
        consumer_id: String,
        producer_id: String,
        kind: MediaKind,
        rtp_parameters: Value,
    },

    #[serde(rename_all = "camelCase")]
    ConsumerResumed { consumer_id: String },

    #[serde(rename_all = "camelCase")]
    NewPeerProducer {
        producer_id: String,
        peer_id: String,
        kind: MediaKind,
    },

    /// A producer closed; `consumer_ids` are this session's consumers that
    /// closed with it.
    #[serde(rename_all = "camelCase")]
    ProducerClosed {
        producer_id: String,
        peer_id: String,
        consumer_ids: Vec<String>,
    },

    #[serde(rename_all = "camelCase")]
    PeerLeft {
        peer_id: String,
        producer_ids: Vec<String>,
        consumer_ids: Vec<String>,
    },

    #[serde(rename_all = "camelCase")]
    TransportClosed {
        transport_id: String,
        producer_ids: Vec<String>,
        consumer_ids: Vec<String>,
    },

    #[serde(rename_all = "camelCase")]
    RoomExited { room_id: String },

    #[serde(rename_all = "camelCase")]
    Message {
        peer_id: String,
        user_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        display_name: Option<String>,
        text: String,
    },

    #[serde(rename_all = "camelCase")]
    Error {
        code: String,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        request_type: Option<String>,
    },
}

impl ServerMessage {
    /// `ERROR` for a failed request. Only the client-safe message is sent.
    #[must_use]
    pub fn error(err: &SfuError, request_type: Option<&str>) -> Self {
        ServerMessage::Error {
            code: err.error_code().to_string(),
            message: err.client_message(),
            request_type: request_type.map(str::to_string),
        }
    }

    /// `ERROR` for a frame that did not parse.
    #[must_use]
    pub fn parse_error(err: &ParseError) -> Self {
        ServerMessage::Error {
            code: "PROTOCOL_ERROR".to_string(),
            message: err.reason.clone(),
            request_type: err.request_type.clone(),
        }
    }

    #[must_use]
    pub const fn message_type(&self) -> &'static str {
        match self {
            ServerMessage::RoomJoined { .. } => "ROOM_JOINED",
            ServerMessage::SendTransportCreated { .. } => "SEND_TRANSPORT_CREATED",
            ServerMessage::ReceiveTransportCreated { .. } => "RECEIVE_TRANSPORT_CREATED",
            ServerMessage::TransportConnected { .. } => "TRANSPORT_CONNECTED",
            ServerMessage::ProducerCreated { .. } => "PRODUCER_CREATED",
            ServerMessage::MediaConsumed { .. } => "MEDIA_CONSUMED",
            ServerMessage::ConsumerResumed { .. } => "CONSUMER_RESUMED",
            ServerMessage::NewPeerProducer { .. } => "NEW_PEER_PRODUCER",
            ServerMessage::ProducerClosed { .. } => "PRODUCER_CLOSED",
            ServerMessage::PeerLeft { .. } => "PEER_LEFT",
            ServerMessage::TransportClosed { .. } => "TRANSPORT_CLOSED",
            ServerMessage::RoomExited { .. } => "ROOM_EXITED",
            ServerMessage::Message { .. } => "MESSAGE",
            ServerMessage::Error { .. } => "ERROR",
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_join_room() {
        let message = parse_client_message(r#"{"type":"JOIN_ROOM","roomId":"r1"}"#).unwrap();
        assert_eq!(
            message,
            ClientMessage::JoinRoom {
                room_id: "r1".to_string()
            }
        );
        assert_eq!(message.message_type(), "JOIN_ROOM");
    }

    #[test]
    fn test_parse_unit_variants() {
        assert_eq!(
            parse_client_message(r#"{"type":"REQUEST_SEND_TRANSPORT"}"#).unwrap(),
            ClientMessage::RequestSendTransport
        );
        assert_eq!(
            parse_client_message(r#"{"type":"EXIT_ROOM"}"#).unwrap(),
            ClientMessage::ExitRoom
        );
    }

    #[test]
    fn test_parse_produce_media() {
        let text = json!({
            "type": "PRODUCE_MEDIA",
            "transportId": "t1",
            "kind": "video",
            "rtpParameters": { "codecs": [] },
        })
        .to_string();

        let message = parse_client_message(&text).unwrap();
        assert!(matches!(
            message,
            ClientMessage::ProduceMedia { kind: MediaKind::Video, ref transport_id, .. }
                if transport_id == "t1"
        ));
    }

    #[test]
    fn test_every_type_name_round_trips_through_message_type() {
        let samples = [
            json!({"type": "JOIN_ROOM", "roomId": "r"}),
            json!({"type": "REQUEST_SEND_TRANSPORT"}),
            json!({"type": "REQUEST_RECEIVE_TRANSPORT"}),
            json!({"type": "CONNECT_PRODUCER_TRANSPORT", "transportId": "t", "dtlsParameters": {}}),
            json!({"type": "CONNECT_RECEIVE_TRANSPORT", "transportId": "t", "dtlsParameters": {}}),
            json!({"type": "PRODUCE_MEDIA", "transportId": "t", "kind": "audio", "rtpParameters": {}}),
            json!({"type": "CONSUME_MEDIA", "transportId": "t", "producerId": "p", "rtpCapabilities": {}}),
            json!({"type": "RESUME", "consumerId": "c"}),
            json!({"type": "CLOSE_PRODUCER", "producerId": "p"}),
            json!({"type": "EXIT_ROOM"}),
            json!({"type": "MESSAGE", "message": "hi"}),
        ];

        for (sample, expected) in samples.iter().zip(ClientMessage::TYPES) {
            let message = parse_client_message(&sample.to_string()).unwrap();
            assert_eq!(message.message_type(), expected);
        }
    }

    #[test]
    fn test_malformed_json() {
        let err = parse_client_message("{not json").unwrap_err();
        assert_eq!(err.request_type, None);
        assert!(err.reason.contains("malformed JSON"));
    }

    #[test]
    fn test_non_object_and_missing_type() {
        assert!(parse_client_message("[1,2]").is_err());
        assert!(parse_client_message(r#""JOIN_ROOM""#).is_err());

        let err = parse_client_message(r#"{"roomId":"r1"}"#).unwrap_err();
        assert_eq!(err.reason, "missing field `type`");

        let err = parse_client_message(r#"{"type":7}"#).unwrap_err();
        assert_eq!(err.reason, "type must be a string");
    }

    #[test]
    fn test_unknown_type_named_in_error() {
        let err = parse_client_message(r#"{"type":"SUBSCRIBE"}"#).unwrap_err();
        assert_eq!(err.request_type.as_deref(), Some("SUBSCRIBE"));
        assert!(err.reason.contains("unknown message type"));
    }

    #[test]
    fn test_missing_field_names_request_type() {
        let err = parse_client_message(r#"{"type":"JOIN_ROOM"}"#).unwrap_err();
        assert_eq!(err.request_type.as_deref(), Some("JOIN_ROOM"));
        assert!(err.reason.contains("roomId"));
    }

    #[test]
    fn test_wrong_field_type() {
        let err = parse_client_message(r#"{"type":"RESUME","consumerId":42}"#).unwrap_err();
        assert_eq!(err.request_type.as_deref(), Some("RESUME"));

        let err = parse_client_message(
            r#"{"type":"PRODUCE_MEDIA","transportId":"t","kind":"data","rtpParameters":{}}"#,
        )
        .unwrap_err();
        assert_eq!(err.request_type.as_deref(), Some("PRODUCE_MEDIA"));
    }

    #[test]
    fn test_validation_failures() {
        let err = parse_client_message(r#"{"type":"JOIN_ROOM","roomId":"  "}"#).unwrap_err();
        assert_eq!(err.reason, "roomId must not be empty");

        let err = parse_client_message(
            r#"{"type":"CONNECT_PRODUCER_TRANSPORT","transportId":"t","dtlsParameters":"x"}"#,
        )
        .unwrap_err();
        assert_eq!(err.reason, "dtlsParameters must be an object");

        let long = "x".repeat(MAX_CHAT_MESSAGE_CHARS + 1);
        let text = json!({"type": "MESSAGE", "message": long}).to_string();
        assert!(parse_client_message(&text).is_err());

        let err = parse_client_message(r#"{"type":"MESSAGE","message":""}"#).unwrap_err();
        assert_eq!(err.request_type.as_deref(), Some("MESSAGE"));
    }

    #[test]
    fn test_server_message_wire_shape() {
        let message = ServerMessage::ProducerClosed {
            producer_id: "p1".to_string(),
            peer_id: "s1".to_string(),
            consumer_ids: vec!["c1".to_string()],
        };
        assert_eq!(
            serde_json::to_value(&message).unwrap(),
            json!({
                "type": "PRODUCER_CLOSED",
                "producerId": "p1",
                "peerId": "s1",
                "consumerIds": ["c1"],
            })
        );
        assert_eq!(message.message_type(), "PRODUCER_CLOSED");
    }

    #[test]
    fn test_room_joined_lists_producers() {
        let message = ServerMessage::RoomJoined {
            room_id: "r1".to_string(),
            rtp_capabilities: json!({"codecs": []}),
            producers: vec![ProducerInfo {
                producer_id: "p1".to_string(),
                peer_id: "s1".to_string(),
                kind: MediaKind::Audio,
            }],
        };
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["type"], "ROOM_JOINED");
        assert_eq!(value["roomId"], "r1");
        assert_eq!(
            value["producers"],
            json!([{"producerId": "p1", "peerId": "s1", "kind": "audio"}])
        );
    }

    #[test]
    fn test_error_message_from_sfu_error() {
        let message = ServerMessage::error(
            &SfuError::TransportNotFound("t-9".to_string()),
            Some("CONNECT_PRODUCER_TRANSPORT"),
        );
        assert_eq!(
            serde_json::to_value(&message).unwrap(),
            json!({
                "type": "ERROR",
                "code": "NOT_FOUND",
                "message": "Transport not found",
                "requestType": "CONNECT_PRODUCER_TRANSPORT",
            })
        );
    }

    #[test]
    fn test_optional_fields_omitted() {
        let message = ServerMessage::Message {
            peer_id: "s1".to_string(),
            user_id: "u1".to_string(),
            display_name: None,
            text: "hi".to_string(),
        };
        let value = serde_json::to_value(&message).unwrap();
        assert!(value.get("displayName").is_none());

        let message = ServerMessage::parse_error(&ParseError::new(None, "malformed JSON"));
        let value = serde_json::to_value(&message).unwrap();
        assert!(value.get("requestType").is_none());
        assert_eq!(value["code"], "PROTOCOL_ERROR");
    }
}
