//! `SessionActor` - per-connection actor owning one participant's media state.
//!
//! Each `SessionActor`:
//! - Processes the client's signaling messages strictly in arrival order
//! - Owns the transport, producer and consumer maps (no cross-session locks)
//! - Receives room notifications and forwards them to the client
//! - Reacts to transports whose DTLS state reaches `closed` or `failed`
//!
//! A session is in at most one room at a time. Leaving (`EXIT_ROOM`) tears
//! down all media state but keeps the connection; `disconnect` does the same
//! and then stops the actor.

use crate::auth::CallerIdentity;
use crate::config::Config;
use crate::errors::SfuError;
use crate::media::{
    DtlsState, MediaConsumer, MediaKind, MediaProducer, MediaRouter, MediaTransport,
    TransportDirection, TransportSettings,
};
use crate::observability;
use crate::signaling::handler;
use crate::signaling::protocol::ServerMessage;

use super::messages::{
    InboundFrame, ProducerInfo, RoomEvent, RoomMember, RoomReadiness, SessionMessage,
    SessionState,
};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};
use super::registry::RoomRegistryHandle;
use super::room::RoomActorHandle;

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Default channel buffer size for the session mailbox.
const SESSION_CHANNEL_BUFFER: usize = 256;

/// Joins racing a room that is closing retry against its replacement.
const JOIN_ATTEMPTS: usize = 3;

/// Per-session settings.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Bound on waiting for a room's routing context during join.
    pub room_ready_timeout: Duration,
    /// Bound on waiting for space in the client's outbound queue. A session
    /// that hits it is stopped.
    pub outbound_send_timeout: Duration,
    pub transport_settings: TransportSettings,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            room_ready_timeout: Duration::from_secs(10),
            outbound_send_timeout: Duration::from_secs(10),
            transport_settings: TransportSettings::default(),
        }
    }
}

impl From<&Config> for SessionSettings {
    fn from(config: &Config) -> Self {
        Self {
            room_ready_timeout: config.room_ready_timeout(),
            outbound_send_timeout: config.outbound_send_timeout(),
            transport_settings: config.transport_settings(),
        }
    }
}

/// Handle to a `SessionActor`.
#[derive(Clone)]
pub struct SessionActorHandle {
    sender: mpsc::Sender<SessionMessage>,
    cancel_token: CancellationToken,
    session_id: String,
}

impl SessionActorHandle {
    /// Session id, also used as the peer id in room notifications.
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Forward a text frame from the client.
    pub async fn send_text(&self, text: String) -> Result<(), SfuError> {
        self.sender
            .send(SessionMessage::Inbound {
                frame: InboundFrame::Text(text),
            })
            .await
            .map_err(|e| SfuError::Internal(format!("channel send failed: {e}")))
    }

    /// Report a binary frame from the client.
    pub async fn send_binary(&self, len: usize) -> Result<(), SfuError> {
        self.sender
            .send(SessionMessage::Inbound {
                frame: InboundFrame::Binary(len),
            })
            .await
            .map_err(|e| SfuError::Internal(format!("channel send failed: {e}")))
    }

    /// Tear the session down. Resolves once media state is released and the
    /// room has been left.
    pub async fn disconnect(&self) -> Result<(), SfuError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SessionMessage::Disconnect { respond_to: tx })
            .await
            .map_err(|e| SfuError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SfuError::Internal(format!("response receive failed: {e}")))
    }

    pub async fn get_state(&self) -> Result<SessionState, SfuError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SessionMessage::GetState { respond_to: tx })
            .await
            .map_err(|e| SfuError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SfuError::Internal(format!("response receive failed: {e}")))
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransportState {
    Created,
    Connecting,
    Connected,
}

struct TransportEntry {
    transport: Arc<dyn MediaTransport>,
    direction: TransportDirection,
    state: TransportState,
    /// Stops the DTLS watcher task.
    watcher: CancellationToken,
}

struct ProducerEntry {
    producer: Arc<dyn MediaProducer>,
    transport_id: String,
}

struct ConsumerEntry {
    consumer: Arc<dyn MediaConsumer>,
    transport_id: String,
    producer_id: String,
}

struct CurrentRoom {
    room_id: String,
    handle: RoomActorHandle,
    router: Arc<dyn MediaRouter>,
}

/// Terminal DTLS state observed by a transport watcher.
#[derive(Debug)]
struct TransportEvent {
    transport_id: String,
    state: DtlsState,
}

/// The `SessionActor` implementation.
pub struct SessionActor {
    session_id: String,
    identity: CallerIdentity,
    receiver: mpsc::Receiver<SessionMessage>,
    cancel_token: CancellationToken,
    outbound: mpsc::Sender<ServerMessage>,
    registry: RoomRegistryHandle,
    settings: SessionSettings,
    room: Option<CurrentRoom>,
    room_events: Option<mpsc::UnboundedReceiver<RoomEvent>>,
    transport_events_tx: mpsc::UnboundedSender<TransportEvent>,
    transport_events_rx: mpsc::UnboundedReceiver<TransportEvent>,
    transports: HashMap<String, TransportEntry>,
    producers: HashMap<String, ProducerEntry>,
    consumers: HashMap<String, ConsumerEntry>,
    metrics: Arc<ActorMetrics>,
    mailbox: MailboxMonitor,
}

impl SessionActor {
    /// Spawn a session for a verified caller.
    ///
    /// Every message for the client, replies and notifications alike, is
    /// written to `outbound` in the order it is produced.
    pub fn spawn(
        identity: CallerIdentity,
        outbound: mpsc::Sender<ServerMessage>,
        registry: RoomRegistryHandle,
        settings: SessionSettings,
        metrics: Arc<ActorMetrics>,
        cancel_token: CancellationToken,
    ) -> (SessionActorHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(SESSION_CHANNEL_BUFFER);
        let (transport_events_tx, transport_events_rx) = mpsc::unbounded_channel();
        let session_id = Uuid::new_v4().to_string();

        let actor = Self {
            session_id: session_id.clone(),
            identity,
            receiver,
            cancel_token: cancel_token.clone(),
            outbound,
            registry,
            settings,
            room: None,
            room_events: None,
            transport_events_tx,
            transport_events_rx,
            transports: HashMap::new(),
            producers: HashMap::new(),
            consumers: HashMap::new(),
            metrics,
            mailbox: MailboxMonitor::new(ActorType::Session, &session_id),
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = SessionActorHandle {
            sender,
            cancel_token,
            session_id,
        };

        (handle, task_handle)
    }

    /// Run the actor message loop.
    #[instrument(skip_all, name = "sfu.actor.session", fields(session_id = %self.session_id))]
    async fn run(mut self) {
        self.metrics.session_created();
        info!(
            target: "sfu.actor.session",
            session_id = %self.session_id,
            "SessionActor started"
        );

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    debug!(
                        target: "sfu.actor.session",
                        session_id = %self.session_id,
                        "SessionActor received cancellation signal"
                    );
                    self.leave_room().await;
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(SessionMessage::Disconnect { respond_to }) => {
                            self.leave_room().await;
                            let _ = respond_to.send(());
                            break;
                        }
                        Some(message) => {
                            self.mailbox.record_enqueue();
                            self.handle_message(message).await;
                            self.mailbox.record_dequeue();
                            self.metrics.record_message_processed();
                        }
                        None => {
                            self.leave_room().await;
                            break;
                        }
                    }
                }

                event = next_room_event(&mut self.room_events) => {
                    self.handle_room_event(event).await;
                }

                Some(event) = self.transport_events_rx.recv() => {
                    self.handle_transport_event(event).await;
                }
            }
        }

        self.metrics.session_closed();
        info!(
            target: "sfu.actor.session",
            session_id = %self.session_id,
            messages_processed = self.mailbox.messages_processed(),
            "SessionActor stopped"
        );
    }

    async fn handle_message(&mut self, message: SessionMessage) {
        match message {
            SessionMessage::Inbound { frame } => {
                handler::handle_frame(self, frame).await;
            }
            SessionMessage::GetState { respond_to } => {
                let _ = respond_to.send(self.state());
            }
            // Handled in the run loop.
            SessionMessage::Disconnect { respond_to } => {
                let _ = respond_to.send(());
            }
        }
    }

    #[must_use]
    pub(crate) fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Write a message to the client. A closed connection is not an error:
    /// the gateway disconnects the session shortly after.
    ///
    /// A client that leaves the queue full past `outbound_send_timeout` is
    /// dropped: the session cancels itself and leaves its room, and the
    /// gateway closes the socket.
    pub(crate) async fn send(&self, message: ServerMessage) {
        if self.cancel_token.is_cancelled() {
            return;
        }

        let message_type = message.message_type();
        match self
            .outbound
            .send_timeout(message, self.settings.outbound_send_timeout)
            .await
        {
            Ok(()) => {}
            Err(mpsc::error::SendTimeoutError::Closed(_)) => {
                debug!(
                    target: "sfu.actor.session",
                    session_id = %self.session_id,
                    message_type,
                    "Outbound channel closed, dropping message"
                );
            }
            Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                warn!(
                    target: "sfu.actor.session",
                    session_id = %self.session_id,
                    message_type,
                    timeout = ?self.settings.outbound_send_timeout,
                    "Client is not reading, dropping session"
                );
                observability::record_slow_client_dropped();
                self.cancel_token.cancel();
            }
        }
    }

    fn current_room(&self) -> Result<&CurrentRoom, SfuError> {
        self.room.as_ref().ok_or(SfuError::NotInRoom)
    }

    // ------------------------------------------------------------------------
    // Signaling operations
    // ------------------------------------------------------------------------

    /// Join `room_id`, creating the room if needed.
    pub(crate) async fn join_room(&mut self, room_id: String) -> Result<ServerMessage, SfuError> {
        if let Some(room) = &self.room {
            return Err(SfuError::AlreadyInRoom(room.room_id.clone()));
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let member = RoomMember {
            session_id: self.session_id.clone(),
            user_id: self.identity.id.clone(),
            display_name: self.identity.display_name.clone(),
            events: events_tx,
        };

        for attempt in 1..=JOIN_ATTEMPTS {
            let room = self.registry.get_or_create_room(room_id.clone()).await?;

            let joined = match room.wait_ready(self.settings.room_ready_timeout).await {
                Ok(()) => room.join(member.clone()).await,
                Err(e) => Err(e),
            };

            match joined {
                Ok(joined) => {
                    info!(
                        target: "sfu.actor.session",
                        session_id = %self.session_id,
                        room_id = %room_id,
                        peer_producers = joined.producers.len(),
                        "Joined room"
                    );

                    self.room = Some(CurrentRoom {
                        room_id: room_id.clone(),
                        handle: room,
                        router: joined.router,
                    });
                    self.room_events = Some(events_rx);

                    return Ok(ServerMessage::RoomJoined {
                        room_id,
                        rtp_capabilities: joined.rtp_capabilities,
                        producers: joined.producers,
                    });
                }
                // The room emptied and closed between lookup and join; its
                // replacement is created on the next lookup.
                Err(SfuError::RoomUnavailable(reason))
                    if attempt < JOIN_ATTEMPTS
                        && room.is_closed()
                        && room.readiness() == RoomReadiness::Ready =>
                {
                    debug!(
                        target: "sfu.actor.session",
                        session_id = %self.session_id,
                        room_id = %room_id,
                        attempt,
                        reason = %reason,
                        "Room closed during join, retrying"
                    );
                }
                Err(e) => return Err(e),
            }
        }

        Err(SfuError::RoomUnavailable(format!(
            "room {room_id} closed during join"
        )))
    }

    /// Create a WebRTC transport on the current room's router.
    pub(crate) async fn create_transport(
        &mut self,
        direction: TransportDirection,
    ) -> Result<ServerMessage, SfuError> {
        let router = Arc::clone(&self.current_room()?.router);

        let transport = router
            .create_webrtc_transport(&self.settings.transport_settings)
            .await?;
        let transport_id = transport.id();
        let transport_options = transport.options();
        let max_incoming_bitrate = transport.max_incoming_bitrate();

        let watcher = self.cancel_token.child_token();
        spawn_dtls_watcher(
            transport_id.clone(),
            transport.dtls_state(),
            self.transport_events_tx.clone(),
            watcher.clone(),
        );

        self.transports.insert(
            transport_id.clone(),
            TransportEntry {
                transport,
                direction,
                state: TransportState::Created,
                watcher,
            },
        );

        debug!(
            target: "sfu.actor.session",
            session_id = %self.session_id,
            transport_id = %transport_id,
            direction = direction.as_str(),
            max_incoming_bitrate = ?max_incoming_bitrate,
            "Transport created"
        );

        Ok(match direction {
            TransportDirection::Send => ServerMessage::SendTransportCreated { transport_options },
            TransportDirection::Receive => {
                ServerMessage::ReceiveTransportCreated { transport_options }
            }
        })
    }

    /// Complete the DTLS handshake of a transport created by this session.
    pub(crate) async fn connect_transport(
        &mut self,
        transport_id: String,
        dtls_parameters: Value,
        direction: TransportDirection,
    ) -> Result<ServerMessage, SfuError> {
        self.current_room()?;

        let entry = self
            .transports
            .get_mut(&transport_id)
            .ok_or_else(|| SfuError::TransportNotFound(transport_id.clone()))?;

        if entry.direction != direction {
            return Err(SfuError::Protocol(format!(
                "transport {transport_id} is a {} transport",
                entry.direction.as_str()
            )));
        }
        if entry.state != TransportState::Created {
            return Err(SfuError::InvalidState(format!(
                "transport {transport_id} is already connected"
            )));
        }

        entry.state = TransportState::Connecting;
        let transport = Arc::clone(&entry.transport);

        let result = transport.connect(dtls_parameters).await;

        let next_state = if result.is_ok() {
            TransportState::Connected
        } else {
            TransportState::Created
        };
        if let Some(entry) = self.transports.get_mut(&transport_id) {
            entry.state = next_state;
        }
        result?;

        debug!(
            target: "sfu.actor.session",
            session_id = %self.session_id,
            transport_id = %transport_id,
            "Transport connected"
        );

        Ok(ServerMessage::TransportConnected { transport_id })
    }

    /// A connected transport of the given direction.
    fn connected_transport(
        &self,
        transport_id: &str,
        direction: TransportDirection,
    ) -> Result<Arc<dyn MediaTransport>, SfuError> {
        let entry = self
            .transports
            .get(transport_id)
            .ok_or_else(|| SfuError::TransportNotFound(transport_id.to_string()))?;

        if entry.direction != direction {
            return Err(SfuError::Protocol(format!(
                "transport {transport_id} is not a {} transport",
                direction.as_str()
            )));
        }
        if entry.state != TransportState::Connected {
            return Err(SfuError::InvalidState(format!(
                "transport {transport_id} is not connected"
            )));
        }

        Ok(Arc::clone(&entry.transport))
    }

    /// Open a producer on a connected send transport and announce it.
    pub(crate) async fn produce(
        &mut self,
        transport_id: String,
        kind: MediaKind,
        rtp_parameters: Value,
    ) -> Result<ServerMessage, SfuError> {
        let room = self.current_room()?.handle.clone();
        let transport = self.connected_transport(&transport_id, TransportDirection::Send)?;

        let producer = transport.produce(kind, rtp_parameters).await?;
        let producer_id = producer.id();

        let info = ProducerInfo {
            producer_id: producer_id.clone(),
            peer_id: self.session_id.clone(),
            kind,
        };
        if let Err(e) = room.producer_opened(self.session_id.clone(), info).await {
            producer.close();
            return Err(e);
        }

        self.producers.insert(
            producer_id.clone(),
            ProducerEntry {
                producer,
                transport_id,
            },
        );
        observability::record_producer_created(kind.as_str());

        info!(
            target: "sfu.actor.session",
            session_id = %self.session_id,
            producer_id = %producer_id,
            kind = %kind,
            "Producer created"
        );

        Ok(ServerMessage::ProducerCreated { producer_id, kind })
    }

    /// Create a paused consumer for a producer in the room.
    pub(crate) async fn consume(
        &mut self,
        transport_id: String,
        producer_id: String,
        rtp_capabilities: Value,
    ) -> Result<ServerMessage, SfuError> {
        let (room, router) = {
            let current = self.current_room()?;
            (current.handle.clone(), Arc::clone(&current.router))
        };
        let transport = self.connected_transport(&transport_id, TransportDirection::Receive)?;

        if room.find_producer(producer_id.clone()).await?.is_none() {
            return Err(SfuError::ProducerNotFound(producer_id));
        }
        if !router.can_consume(&producer_id, &rtp_capabilities) {
            // The owner may have closed it since the lookup.
            if room.find_producer(producer_id.clone()).await?.is_none() {
                return Err(SfuError::ProducerNotFound(producer_id));
            }
            return Err(SfuError::CapabilityMismatch(producer_id));
        }

        let consumer = transport
            .consume(&producer_id, rtp_capabilities, true)
            .await?;
        let consumer_id = consumer.id();
        let kind = consumer.kind();
        let rtp_parameters = consumer.rtp_parameters();

        self.consumers.insert(
            consumer_id.clone(),
            ConsumerEntry {
                consumer,
                transport_id,
                producer_id: producer_id.clone(),
            },
        );

        debug!(
            target: "sfu.actor.session",
            session_id = %self.session_id,
            consumer_id = %consumer_id,
            producer_id = %producer_id,
            "Consumer created (paused)"
        );

        Ok(ServerMessage::MediaConsumed {
            consumer_id,
            producer_id,
            kind,
            rtp_parameters,
        })
    }

    /// Resume a paused consumer. Unknown ids are logged and ignored.
    pub(crate) async fn resume_consumer(
        &mut self,
        consumer_id: String,
    ) -> Result<Option<ServerMessage>, SfuError> {
        let Some(consumer) = self
            .consumers
            .get(&consumer_id)
            .map(|entry| Arc::clone(&entry.consumer))
        else {
            warn!(
                target: "sfu.actor.session",
                session_id = %self.session_id,
                consumer_id = %consumer_id,
                "Resume for unknown consumer ignored"
            );
            return Ok(None);
        };

        if consumer.is_closed() {
            warn!(
                target: "sfu.actor.session",
                session_id = %self.session_id,
                consumer_id = %consumer_id,
                "Resume for closed consumer ignored"
            );
            return Ok(None);
        }

        if consumer.is_paused() {
            consumer.resume().await?;
        }

        Ok(Some(ServerMessage::ConsumerResumed { consumer_id }))
    }

    /// Close one of this session's producers.
    ///
    /// The acknowledgement is the room's `PRODUCER_CLOSED` notification,
    /// which reaches every member including this one. Unknown ids are
    /// logged and ignored. The room forgets the producer before the engine
    /// closes it, so a racing `CONSUME_MEDIA` sees `NOT_FOUND`.
    pub(crate) async fn close_producer(
        &mut self,
        producer_id: String,
    ) -> Result<Option<ServerMessage>, SfuError> {
        let Some(entry) = self.producers.remove(&producer_id) else {
            warn!(
                target: "sfu.actor.session",
                session_id = %self.session_id,
                producer_id = %producer_id,
                "Close for unknown producer ignored"
            );
            return Ok(None);
        };

        let announced = match self.room.as_ref().map(|r| r.handle.clone()) {
            Some(room) => room
                .producer_closed(self.session_id.clone(), producer_id.clone())
                .await
                .unwrap_or(false),
            None => false,
        };

        entry.producer.close();
        info!(
            target: "sfu.actor.session",
            session_id = %self.session_id,
            producer_id = %producer_id,
            "Producer closed"
        );

        if announced {
            return Ok(None);
        }

        // Room no longer knows the producer; acknowledge locally.
        let consumer_ids = self.close_consumers(|c| c.producer_id == producer_id);
        Ok(Some(ServerMessage::ProducerClosed {
            producer_id,
            peer_id: self.session_id.clone(),
            consumer_ids,
        }))
    }

    /// Relay a chat message to the other members.
    pub(crate) async fn chat(&mut self, text: String) -> Result<Option<ServerMessage>, SfuError> {
        let room = self.current_room()?.handle.clone();
        room.chat(self.session_id.clone(), text).await?;
        Ok(None)
    }

    /// Leave the current room and close all media state.
    ///
    /// The room drops this member's producers before the engine closes
    /// them. Returns the room left, or `None` if the session was not in one.
    pub(crate) async fn leave_room(&mut self) -> Option<String> {
        let room = self.room.take()?;
        self.room_events = None;

        let left = room.handle.leave(self.session_id.clone()).await;

        let consumer_ids = self.close_consumers(|_| true);

        let producer_count = self.producers.len();
        for (_, entry) in self.producers.drain() {
            entry.producer.close();
        }

        let transport_count = self.transports.len();
        for (_, entry) in self.transports.drain() {
            entry.watcher.cancel();
            entry.transport.close();
        }

        match left {
            Ok(outcome) => {
                if outcome.room_empty {
                    if let Err(e) = self
                        .registry
                        .remove_room_if_closed(
                            room.room_id.clone(),
                            room.handle.instance_id().to_string(),
                        )
                        .await
                    {
                        debug!(
                            target: "sfu.actor.session",
                            session_id = %self.session_id,
                            room_id = %room.room_id,
                            error = %e,
                            "Registry unavailable while evicting empty room"
                        );
                    }
                }
            }
            Err(e) => {
                debug!(
                    target: "sfu.actor.session",
                    session_id = %self.session_id,
                    room_id = %room.room_id,
                    error = %e,
                    "Room unavailable during leave"
                );
            }
        }

        info!(
            target: "sfu.actor.session",
            session_id = %self.session_id,
            room_id = %room.room_id,
            transports = transport_count,
            producers = producer_count,
            consumers = consumer_ids.len(),
            "Left room"
        );

        Some(room.room_id)
    }

    // ------------------------------------------------------------------------
    // Room and transport events
    // ------------------------------------------------------------------------

    async fn handle_room_event(&mut self, event: RoomEvent) {
        let message = match event {
            RoomEvent::NewProducer(info) => ServerMessage::NewPeerProducer {
                producer_id: info.producer_id,
                peer_id: info.peer_id,
                kind: info.kind,
            },
            RoomEvent::ProducerClosed(info) => {
                let consumer_ids = self.close_consumers(|c| c.producer_id == info.producer_id);
                ServerMessage::ProducerClosed {
                    producer_id: info.producer_id,
                    peer_id: info.peer_id,
                    consumer_ids,
                }
            }
            RoomEvent::PeerLeft {
                peer_id,
                producer_ids,
            } => {
                let consumer_ids = self.close_consumers(|c| producer_ids.contains(&c.producer_id));
                ServerMessage::PeerLeft {
                    peer_id,
                    producer_ids,
                    consumer_ids,
                }
            }
            RoomEvent::Chat {
                peer_id,
                user_id,
                display_name,
                text,
            } => ServerMessage::Message {
                peer_id,
                user_id,
                display_name,
                text,
            },
        };

        self.send(message).await;
    }

    /// Close a transport whose DTLS state went terminal, along with
    /// everything riding on it.
    async fn handle_transport_event(&mut self, event: TransportEvent) {
        let Some(entry) = self.transports.remove(&event.transport_id) else {
            return;
        };
        entry.watcher.cancel();

        warn!(
            target: "sfu.actor.session",
            session_id = %self.session_id,
            transport_id = %event.transport_id,
            dtls_state = ?event.state,
            "Transport closed by DTLS state change"
        );

        let mut producer_ids: Vec<String> = self
            .producers
            .iter()
            .filter(|(_, p)| p.transport_id == event.transport_id)
            .map(|(id, _)| id.clone())
            .collect();
        producer_ids.sort();

        let room = self.room.as_ref().map(|r| r.handle.clone());
        for producer_id in &producer_ids {
            if let Some(room) = &room {
                let _ = room
                    .producer_closed(self.session_id.clone(), producer_id.clone())
                    .await;
            }
            if let Some(producer) = self.producers.remove(producer_id) {
                producer.producer.close();
            }
        }

        let consumer_ids = self.close_consumers(|c| c.transport_id == event.transport_id);
        entry.transport.close();

        self.send(ServerMessage::TransportClosed {
            transport_id: event.transport_id,
            producer_ids,
            consumer_ids,
        })
        .await;
    }

    /// Close and forget every consumer matching `predicate`. Returns the
    /// closed ids, sorted.
    fn close_consumers<F>(&mut self, predicate: F) -> Vec<String>
    where
        F: Fn(&ConsumerEntry) -> bool,
    {
        let mut closed: Vec<String> = self
            .consumers
            .iter()
            .filter(|(_, entry)| predicate(entry))
            .map(|(id, _)| id.clone())
            .collect();
        closed.sort();

        for consumer_id in &closed {
            if let Some(entry) = self.consumers.remove(consumer_id) {
                entry.consumer.close();
            }
        }
        closed
    }

    fn state(&self) -> SessionState {
        SessionState {
            session_id: self.session_id.clone(),
            user_id: self.identity.id.clone(),
            room_id: self.room.as_ref().map(|r| r.room_id.clone()),
            transport_count: self.transports.len(),
            producer_count: self.producers.len(),
            consumer_count: self.consumers.len(),
            paused_consumer_count: self
                .consumers
                .values()
                .filter(|c| c.consumer.is_paused())
                .count(),
        }
    }
}

/// Next room notification; pending while not in a room.
async fn next_room_event(events: &mut Option<mpsc::UnboundedReceiver<RoomEvent>>) -> RoomEvent {
    if let Some(rx) = events {
        if let Some(event) = rx.recv().await {
            return event;
        }
    }
    std::future::pending().await
}

/// Watch a transport's DTLS state and report when it turns terminal.
fn spawn_dtls_watcher(
    transport_id: String,
    mut dtls_state: watch::Receiver<DtlsState>,
    events: mpsc::UnboundedSender<TransportEvent>,
    cancel_token: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            let state = *dtls_state.borrow_and_update();
            if state.is_terminal() {
                let _ = events.send(TransportEvent {
                    transport_id,
                    state,
                });
                return;
            }

            tokio::select! {
                () = cancel_token.cancelled() => return,
                changed = dtls_state.changed() => {
                    if changed.is_err() {
                        let _ = events.send(TransportEvent {
                            transport_id,
                            state: DtlsState::Closed,
                        });
                        return;
                    }
                }
            }
        }
    });
}
