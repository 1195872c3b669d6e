//! Inbound frame handling for a session.
//!
//! Each frame is parsed, dispatched to the owning [`SessionActor`] and
//! answered with at most one reply. Failures become `ERROR` replies; the
//! connection stays open.

use crate::actors::session::SessionActor;
use crate::actors::messages::InboundFrame;
use crate::errors::SfuError;
use crate::media::TransportDirection;
use crate::observability;

use super::protocol::{parse_client_message, ClientMessage, ServerMessage};

use std::time::Instant;
use tracing::{debug, warn};

/// Metric label for frames that never produced a [`ClientMessage`].
const INVALID_MESSAGE_TYPE: &str = "INVALID";

/// Handle one frame from the client.
pub(crate) async fn handle_frame(session: &mut SessionActor, frame: InboundFrame) {
    let started = Instant::now();

    let text = match frame {
        InboundFrame::Text(text) => text,
        InboundFrame::Binary(len) => {
            debug!(
                target: "sfu.signaling",
                session_id = %session.session_id(),
                len,
                "Binary frame rejected"
            );
            let err = SfuError::Protocol("binary frames are not supported".to_string());
            session.send(ServerMessage::error(&err, None)).await;
            observability::record_signaling_message(INVALID_MESSAGE_TYPE, "error");
            return;
        }
    };

    let message = match parse_client_message(&text) {
        Ok(message) => message,
        Err(e) => {
            debug!(
                target: "sfu.signaling",
                session_id = %session.session_id(),
                request_type = ?e.request_type,
                reason = %e.reason,
                "Rejected inbound frame"
            );
            session.send(ServerMessage::parse_error(&e)).await;
            observability::record_signaling_message(INVALID_MESSAGE_TYPE, "error");
            return;
        }
    };

    let message_type = message.message_type();

    let outcome = match dispatch(session, message).await {
        Ok(reply) => {
            if let Some(reply) = reply {
                session.send(reply).await;
            }
            "ok"
        }
        Err(e) => {
            if e.error_code() == "INTERNAL_ERROR" {
                warn!(
                    target: "sfu.signaling",
                    session_id = %session.session_id(),
                    message_type,
                    error = %e,
                    "Request failed"
                );
            } else {
                debug!(
                    target: "sfu.signaling",
                    session_id = %session.session_id(),
                    message_type,
                    error = %e,
                    "Request rejected"
                );
            }
            session
                .send(ServerMessage::error(&e, Some(message_type)))
                .await;
            "error"
        }
    };

    observability::record_signaling_message(message_type, outcome);
    observability::record_message_latency(message_type, started.elapsed());
}

async fn dispatch(
    session: &mut SessionActor,
    message: ClientMessage,
) -> Result<Option<ServerMessage>, SfuError> {
    match message {
        ClientMessage::JoinRoom { room_id } => session.join_room(room_id).await.map(Some),
        ClientMessage::RequestSendTransport => session
            .create_transport(TransportDirection::Send)
            .await
            .map(Some),
        ClientMessage::RequestReceiveTransport => session
            .create_transport(TransportDirection::Receive)
            .await
            .map(Some),
        ClientMessage::ConnectProducerTransport {
            transport_id,
            dtls_parameters,
        } => session
            .connect_transport(transport_id, dtls_parameters, TransportDirection::Send)
            .await
            .map(Some),
        ClientMessage::ConnectReceiveTransport {
            transport_id,
            dtls_parameters,
        } => session
            .connect_transport(transport_id, dtls_parameters, TransportDirection::Receive)
            .await
            .map(Some),
        ClientMessage::ProduceMedia {
            transport_id,
            kind,
            rtp_parameters,
        } => session
            .produce(transport_id, kind, rtp_parameters)
            .await
            .map(Some),
        ClientMessage::ConsumeMedia {
            transport_id,
            producer_id,
            rtp_capabilities,
        } => session
            .consume(transport_id, producer_id, rtp_capabilities)
            .await
            .map(Some),
        ClientMessage::Resume { consumer_id } => session.resume_consumer(consumer_id).await,
        ClientMessage::CloseProducer { producer_id } => session.close_producer(producer_id).await,
        ClientMessage::ExitRoom => Ok(session
            .leave_room()
            .await
            .map(|room_id| ServerMessage::RoomExited { room_id })),
        ClientMessage::Message { message } => session.chat(message).await,
    }
}
