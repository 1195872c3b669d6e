//! WebSocket connection gateway.
//!
//! `GET /ws?token=...` verifies the caller before upgrading. Each accepted
//! socket gets one [`SessionActor`]: a reader loop forwards frames to it and
//! a writer task drains its outbound channel back onto the socket. When the
//! socket closes, or the service shuts down, the session is disconnected.

use crate::actors::metrics::ActorMetrics;
use crate::actors::registry::RoomRegistryHandle;
use crate::actors::session::{SessionActor, SessionActorHandle, SessionSettings};
use crate::auth::{CallerIdentity, TokenVerifier};
use crate::errors::SfuError;
use crate::observability;
use crate::signaling::ServerMessage;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, instrument, warn};

/// Outbound messages buffered per connection before the session waits.
const OUTBOUND_CHANNEL_BUFFER: usize = 256;

/// Bound on session teardown after the socket closes.
const SESSION_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Bound on flushing queued messages to a closing socket.
const WRITER_STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// Shared state for gateway handlers.
pub struct GatewayState {
    pub verifier: Arc<dyn TokenVerifier>,
    pub registry: RoomRegistryHandle,
    pub session_settings: SessionSettings,
    pub metrics: Arc<ActorMetrics>,
    /// Cancelled on service shutdown; parent of every session token.
    pub shutdown: CancellationToken,
    pub max_message_bytes: usize,
}

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    token: Option<String>,
}

/// Router serving the signaling endpoint.
pub fn gateway_router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Verify the token, then upgrade.
///
/// Rejected callers get `401` and no session is created.
async fn ws_handler(
    Query(query): Query<WsQuery>,
    State(state): State<Arc<GatewayState>>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(token) = query.token.filter(|t| !t.is_empty()) else {
        debug!(target: "sfu.gateway", "Connection rejected: missing token");
        observability::record_auth_rejection("missing_token");
        return StatusCode::UNAUTHORIZED.into_response();
    };

    let identity = match state.verifier.verify(&token) {
        Ok(identity) => identity,
        Err(e) => {
            debug!(target: "sfu.gateway", error = %e, "Connection rejected: invalid token");
            observability::record_auth_rejection("invalid_token");
            return (StatusCode::UNAUTHORIZED, e.client_message()).into_response();
        }
    };

    ws.max_message_size(state.max_message_bytes)
        .on_upgrade(move |socket| handle_socket(socket, state, identity))
}

#[instrument(skip_all, name = "sfu.gateway.connection", fields(user_id = %identity.id))]
async fn handle_socket(socket: WebSocket, state: Arc<GatewayState>, identity: CallerIdentity) {
    let (sink, mut stream) = socket.split();
    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CHANNEL_BUFFER);
    let session_token = state.shutdown.child_token();

    let (session, session_task) = SessionActor::spawn(
        identity,
        outbound_tx,
        state.registry.clone(),
        state.session_settings.clone(),
        Arc::clone(&state.metrics),
        session_token.clone(),
    );
    let session_id = session.session_id().to_string();

    info!(target: "sfu.gateway", session_id = %session_id, "Connection accepted");

    let mut writer = spawn_writer(sink, outbound_rx, session_id.clone());

    loop {
        tokio::select! {
            () = state.shutdown.cancelled() => {
                debug!(target: "sfu.gateway", session_id = %session_id, "Closing connection for shutdown");
                break;
            }

            // Session stopped itself, e.g. a client that stopped reading.
            () = session_token.cancelled() => {
                debug!(target: "sfu.gateway", session_id = %session_id, "Session stopped, closing connection");
                break;
            }

            // Writer stopped: the socket can no longer be written.
            _ = &mut writer => {
                debug!(target: "sfu.gateway", session_id = %session_id, "Writer stopped");
                break;
            }

            frame = stream.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        if !forwarded(&session, session.send_text(text).await) {
                            break;
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        if !forwarded(&session, session.send_binary(data.len()).await) {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!(
                            target: "sfu.gateway",
                            session_id = %session_id,
                            error = %e,
                            "Socket read failed"
                        );
                        break;
                    }
                }
            }
        }
    }

    disconnect_session(&session, session_task).await;

    // The session's outbound sender is gone, so the writer finishes once the
    // queue is flushed.
    if !writer.is_finished()
        && tokio::time::timeout(WRITER_STOP_TIMEOUT, &mut writer)
            .await
            .is_err()
    {
        writer.abort();
    }

    info!(target: "sfu.gateway", session_id = %session_id, "Connection closed");
}

/// Whether a frame reached the session.
fn forwarded(session: &SessionActorHandle, result: Result<(), SfuError>) -> bool {
    match result {
        Ok(()) => true,
        Err(e) => {
            debug!(
                target: "sfu.gateway",
                session_id = %session.session_id(),
                error = %e,
                "Session stopped, closing connection"
            );
            false
        }
    }
}

async fn disconnect_session(session: &SessionActorHandle, mut task: JoinHandle<()>) {
    match tokio::time::timeout(SESSION_STOP_TIMEOUT, session.disconnect()).await {
        Ok(Ok(())) => {}
        // Already stopped (cancelled or panicked).
        Ok(Err(e)) => {
            debug!(
                target: "sfu.gateway",
                session_id = %session.session_id(),
                error = %e,
                "Session already stopped"
            );
        }
        Err(_) => session.cancel(),
    }

    match tokio::time::timeout(SESSION_STOP_TIMEOUT, &mut task).await {
        Ok(Ok(())) => {}
        Ok(Err(join_error)) => {
            if join_error.is_panic() {
                warn!(
                    target: "sfu.gateway",
                    session_id = %session.session_id(),
                    "Session task panicked"
                );
            }
        }
        Err(_) => {
            warn!(
                target: "sfu.gateway",
                session_id = %session.session_id(),
                timeout_secs = SESSION_STOP_TIMEOUT.as_secs(),
                "Session did not stop in time, cancelling"
            );
            session.cancel();
            task.abort();
        }
    }
}

fn spawn_writer(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<ServerMessage>,
    session_id: String,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            let text = match serde_json::to_string(&message) {
                Ok(text) => text,
                Err(e) => {
                    warn!(
                        target: "sfu.gateway",
                        session_id = %session_id,
                        message_type = message.message_type(),
                        error = %e,
                        "Failed to encode server message"
                    );
                    continue;
                }
            };

            if let Err(e) = sink.send(Message::Text(text)).await {
                debug!(
                    target: "sfu.gateway",
                    session_id = %session_id,
                    error = %e,
                    "Socket write failed"
                );
                return;
            }
        }

        let _ = sink.send(Message::Close(None)).await;
    })
}
