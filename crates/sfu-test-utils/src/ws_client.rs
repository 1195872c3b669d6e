//! WebSocket signaling client for E2E tests.
//!
//! Wraps a `tokio-tungstenite` connection with JSON send/receive helpers and
//! receive timeouts so a missing server message fails the test instead of
//! hanging it.

use crate::fixtures::{dtls_parameters, receive_capabilities, video_rtp_parameters};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

/// Default bound on waiting for a server message.
pub const DEFAULT_RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Outcome of a connection attempt.
pub enum ConnectOutcome {
    /// Upgrade accepted.
    Upgraded(SignalingClient),
    /// Upgrade refused with an HTTP status.
    Rejected(u16),
}

/// JSON signaling client.
pub struct SignalingClient {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    recv_timeout: Duration,
}

impl SignalingClient {
    /// Connect and expect the upgrade to succeed.
    pub async fn connect(url: &str) -> Result<Self, anyhow::Error> {
        match Self::try_connect(url).await? {
            ConnectOutcome::Upgraded(client) => Ok(client),
            ConnectOutcome::Rejected(status) => {
                Err(anyhow::anyhow!("Connection rejected with HTTP {}", status))
            }
        }
    }

    /// Connect, reporting an HTTP rejection instead of failing.
    pub async fn try_connect(url: &str) -> Result<ConnectOutcome, anyhow::Error> {
        match connect_async(url).await {
            Ok((stream, _response)) => Ok(ConnectOutcome::Upgraded(Self {
                stream,
                recv_timeout: DEFAULT_RECV_TIMEOUT,
            })),
            Err(tungstenite::Error::Http(response)) => {
                Ok(ConnectOutcome::Rejected(response.status().as_u16()))
            }
            Err(e) => Err(anyhow::anyhow!("WebSocket connect failed: {}", e)),
        }
    }

    /// Override the receive timeout.
    pub fn with_recv_timeout(mut self, timeout: Duration) -> Self {
        self.recv_timeout = timeout;
        self
    }

    /// Send a JSON message as a text frame.
    pub async fn send(&mut self, message: Value) -> Result<(), anyhow::Error> {
        self.send_raw(message.to_string()).await
    }

    /// Send an arbitrary text frame.
    pub async fn send_raw(&mut self, text: String) -> Result<(), anyhow::Error> {
        self.stream
            .send(Message::Text(text))
            .await
            .map_err(|e| anyhow::anyhow!("WebSocket send failed: {}", e))
    }

    /// Send a binary frame.
    pub async fn send_binary(&mut self, data: Vec<u8>) -> Result<(), anyhow::Error> {
        self.stream
            .send(Message::Binary(data))
            .await
            .map_err(|e| anyhow::anyhow!("WebSocket send failed: {}", e))
    }

    /// Next JSON message from the server.
    pub async fn recv(&mut self) -> Result<Value, anyhow::Error> {
        let deadline = tokio::time::Instant::now() + self.recv_timeout;
        loop {
            let frame = tokio::time::timeout_at(deadline, self.stream.next())
                .await
                .map_err(|_| anyhow::anyhow!("Timed out waiting for server message"))?;

            match frame {
                Some(Ok(Message::Text(text))) => {
                    return serde_json::from_str(&text)
                        .map_err(|e| anyhow::anyhow!("Server sent invalid JSON: {}", e));
                }
                Some(Ok(Message::Close(_))) | None => {
                    return Err(anyhow::anyhow!("Connection closed by server"));
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(anyhow::anyhow!("WebSocket read failed: {}", e)),
            }
        }
    }

    /// Next message, which must have the given `type`.
    pub async fn recv_type(&mut self, message_type: &str) -> Result<Value, anyhow::Error> {
        let message = self.recv().await?;
        if message.get("type").and_then(Value::as_str) == Some(message_type) {
            Ok(message)
        } else {
            Err(anyhow::anyhow!(
                "Expected {} but received {}",
                message_type,
                message
            ))
        }
    }

    /// Send a request and return the reply, which must have `reply_type`.
    pub async fn request(
        &mut self,
        message: Value,
        reply_type: &str,
    ) -> Result<Value, anyhow::Error> {
        self.send(message).await?;
        self.recv_type(reply_type).await
    }

    /// Assert that no message arrives within `window`.
    pub async fn expect_silence(&mut self, window: Duration) -> Result<(), anyhow::Error> {
        match tokio::time::timeout(window, self.stream.next()).await {
            Err(_) => Ok(()),
            Ok(Some(Ok(Message::Text(text)))) => {
                Err(anyhow::anyhow!("Unexpected server message: {}", text))
            }
            Ok(other) => Err(anyhow::anyhow!("Unexpected socket event: {:?}", other)),
        }
    }

    /// Wait for the server to close the connection.
    pub async fn expect_closed(&mut self) -> Result<(), anyhow::Error> {
        let deadline = tokio::time::Instant::now() + self.recv_timeout;
        loop {
            match tokio::time::timeout_at(deadline, self.stream.next()).await {
                Err(_) => return Err(anyhow::anyhow!("Connection still open")),
                Ok(Some(Ok(Message::Close(_))) | None | Some(Err(_))) => return Ok(()),
                Ok(Some(Ok(_))) => {}
            }
        }
    }

    // ------------------------------------------------------------------------
    // Signaling flows
    // ------------------------------------------------------------------------

    /// `JOIN_ROOM`, returning the `ROOM_JOINED` reply.
    pub async fn join_room(&mut self, room_id: &str) -> Result<Value, anyhow::Error> {
        self.request(json!({"type": "JOIN_ROOM", "roomId": room_id}), "ROOM_JOINED")
            .await
    }

    /// Create and connect a send transport, returning its id.
    pub async fn open_send_transport(&mut self) -> Result<String, anyhow::Error> {
        self.open_transport(
            "REQUEST_SEND_TRANSPORT",
            "SEND_TRANSPORT_CREATED",
            "CONNECT_PRODUCER_TRANSPORT",
        )
        .await
    }

    /// Create and connect a receive transport, returning its id.
    pub async fn open_receive_transport(&mut self) -> Result<String, anyhow::Error> {
        self.open_transport(
            "REQUEST_RECEIVE_TRANSPORT",
            "RECEIVE_TRANSPORT_CREATED",
            "CONNECT_RECEIVE_TRANSPORT",
        )
        .await
    }

    async fn open_transport(
        &mut self,
        request: &str,
        created: &str,
        connect: &str,
    ) -> Result<String, anyhow::Error> {
        let reply = self.request(json!({"type": request}), created).await?;
        let transport_id = reply
            .pointer("/transportOptions/id")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow::anyhow!("{} without transportOptions.id", created))?
            .to_string();

        self.request(
            json!({
                "type": connect,
                "transportId": transport_id,
                "dtlsParameters": dtls_parameters(),
            }),
            "TRANSPORT_CONNECTED",
        )
        .await?;

        Ok(transport_id)
    }

    /// `PRODUCE_MEDIA` of a VP8 video track, returning the producer id.
    pub async fn produce_video(&mut self, transport_id: &str) -> Result<String, anyhow::Error> {
        self.produce(transport_id, "video", video_rtp_parameters())
            .await
    }

    /// `PRODUCE_MEDIA`, returning the producer id.
    pub async fn produce(
        &mut self,
        transport_id: &str,
        kind: &str,
        rtp_parameters: Value,
    ) -> Result<String, anyhow::Error> {
        let reply = self
            .request(
                json!({
                    "type": "PRODUCE_MEDIA",
                    "transportId": transport_id,
                    "kind": kind,
                    "rtpParameters": rtp_parameters,
                }),
                "PRODUCER_CREATED",
            )
            .await?;
        string_field(&reply, "producerId")
    }

    /// `CONSUME_MEDIA` with Opus/VP8 capabilities, returning `MEDIA_CONSUMED`.
    pub async fn consume(
        &mut self,
        transport_id: &str,
        producer_id: &str,
    ) -> Result<Value, anyhow::Error> {
        self.request(
            json!({
                "type": "CONSUME_MEDIA",
                "transportId": transport_id,
                "producerId": producer_id,
                "rtpCapabilities": receive_capabilities(),
            }),
            "MEDIA_CONSUMED",
        )
        .await
    }

    /// Close the connection from the client side.
    pub async fn close(mut self) -> Result<(), anyhow::Error> {
        self.stream
            .close(None)
            .await
            .map_err(|e| anyhow::anyhow!("WebSocket close failed: {}", e))
    }
}

/// String field of a server message.
pub fn string_field(message: &Value, field: &str) -> Result<String, anyhow::Error> {
    message
        .get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| anyhow::anyhow!("{} missing from {}", field, message))
}
