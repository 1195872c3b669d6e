//! `RoomActor` - per-room actor that owns membership and producer announcements.
//!
//! Each `RoomActor`:
//! - Creates its routing context on the assigned worker, once, at start-up
//! - Publishes readiness on a `watch` channel (`Initializing | Ready | Failed`)
//! - Serializes joins, leaves and producer announcements for its room
//! - Fans notifications out to members over unbounded per-session channels
//!
//! # Lifecycle
//!
//! 1. Spawned by the registry on the first join for an unseen room id
//! 2. Becomes `Ready` once the routing context exists, or `Failed` on error
//!    or timeout (every queued and later request then gets `RoomUnavailable`)
//! 3. Closes itself when its last member leaves: the routing context is
//!    released, the token is cancelled and the registry evicts the entry

use crate::errors::SfuError;
use crate::media::{MediaRouter, MediaWorker, RtpCodecCapability};
use crate::observability;

use super::messages::{
    JoinedRoom, LeaveOutcome, ProducerInfo, RoomEvent, RoomMember, RoomMessage, RoomReadiness,
    RoomState,
};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};
use super::registry::RoomSettings;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Default channel buffer size for the room mailbox.
const ROOM_CHANNEL_BUFFER: usize = 500;

fn room_closed() -> SfuError {
    SfuError::RoomUnavailable("room closed".to_string())
}

/// Handle to a `RoomActor`.
#[derive(Clone)]
pub struct RoomActorHandle {
    sender: mpsc::Sender<RoomMessage>,
    cancel_token: CancellationToken,
    room_id: String,
    instance_id: String,
    ready_rx: watch::Receiver<RoomReadiness>,
}

impl RoomActorHandle {
    #[must_use]
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Unique id of this room instance. A room id reused after the room
    /// closed gets a new instance.
    #[must_use]
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    #[must_use]
    pub fn readiness(&self) -> RoomReadiness {
        self.ready_rx.borrow().clone()
    }

    /// Whether the room has stopped accepting requests.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.cancel_token.is_cancelled() || self.sender.is_closed()
    }

    /// Wait until the routing context is ready.
    ///
    /// Fails with `RoomUnavailable` if initialization failed, the room
    /// closed, or `timeout` elapsed first.
    pub async fn wait_ready(&self, timeout: Duration) -> Result<(), SfuError> {
        let mut ready_rx = self.ready_rx.clone();
        let wait = async move {
            ready_rx
                .wait_for(|r| *r != RoomReadiness::Initializing)
                .await
                .map(|r| (*r).clone())
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(Ok(RoomReadiness::Ready)) => Ok(()),
            Ok(Ok(RoomReadiness::Failed(reason))) => Err(SfuError::RoomUnavailable(reason)),
            Ok(Ok(RoomReadiness::Initializing) | Err(_)) => Err(room_closed()),
            Err(_) => Err(SfuError::RoomUnavailable(
                "timed out waiting for room to become ready".to_string(),
            )),
        }
    }

    pub async fn join(&self, member: RoomMember) -> Result<JoinedRoom, SfuError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RoomMessage::Join {
                member,
                respond_to: tx,
            })
            .await
            .map_err(|_| room_closed())?;

        rx.await.map_err(|_| room_closed())?
    }

    pub async fn leave(&self, session_id: String) -> Result<LeaveOutcome, SfuError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RoomMessage::Leave {
                session_id,
                respond_to: tx,
            })
            .await
            .map_err(|_| room_closed())?;

        rx.await.map_err(|_| room_closed())?
    }

    pub async fn producer_opened(
        &self,
        session_id: String,
        producer: ProducerInfo,
    ) -> Result<(), SfuError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RoomMessage::ProducerOpened {
                session_id,
                producer,
                respond_to: tx,
            })
            .await
            .map_err(|_| room_closed())?;

        rx.await.map_err(|_| room_closed())?
    }

    /// Announce a closed producer. Returns `false` if `session_id` did not
    /// own it.
    pub async fn producer_closed(
        &self,
        session_id: String,
        producer_id: String,
    ) -> Result<bool, SfuError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RoomMessage::ProducerClosed {
                session_id,
                producer_id,
                respond_to: tx,
            })
            .await
            .map_err(|_| room_closed())?;

        rx.await.map_err(|_| room_closed())?
    }

    pub async fn list_peer_producers(
        &self,
        excluding: String,
    ) -> Result<Vec<ProducerInfo>, SfuError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RoomMessage::ListPeerProducers {
                excluding,
                respond_to: tx,
            })
            .await
            .map_err(|_| room_closed())?;

        rx.await.map_err(|_| room_closed())?
    }

    pub async fn find_producer(&self, producer_id: String) -> Result<Option<ProducerInfo>, SfuError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RoomMessage::FindProducer {
                producer_id,
                respond_to: tx,
            })
            .await
            .map_err(|_| room_closed())?;

        rx.await.map_err(|_| room_closed())?
    }

    pub async fn chat(&self, session_id: String, text: String) -> Result<(), SfuError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RoomMessage::Chat {
                session_id,
                text,
                respond_to: tx,
            })
            .await
            .map_err(|_| room_closed())?;

        rx.await.map_err(|_| room_closed())?
    }

    pub async fn get_state(&self) -> Result<RoomState, SfuError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RoomMessage::GetState { respond_to: tx })
            .await
            .map_err(|_| room_closed())?;

        rx.await.map_err(|_| room_closed())
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

/// Member bookkeeping inside the room.
struct Member {
    user_id: String,
    display_name: Option<String>,
    events: mpsc::UnboundedSender<RoomEvent>,
}

/// The `RoomActor` implementation.
pub struct RoomActor {
    room_id: String,
    instance_id: String,
    worker_index: usize,
    worker: Arc<dyn MediaWorker>,
    codecs: Vec<RtpCodecCapability>,
    ready_timeout: Duration,
    receiver: mpsc::Receiver<RoomMessage>,
    cancel_token: CancellationToken,
    ready_tx: watch::Sender<RoomReadiness>,
    router: Option<Arc<dyn MediaRouter>>,
    /// Members by session id.
    members: HashMap<String, Member>,
    /// Open producers in announcement order.
    producers: Vec<ProducerInfo>,
    created_at: i64,
    closed: bool,
    metrics: Arc<ActorMetrics>,
    mailbox: MailboxMonitor,
}

impl RoomActor {
    /// Spawn a room on `worker` and return its handle and task.
    pub fn spawn(
        room_id: String,
        worker_index: usize,
        worker: Arc<dyn MediaWorker>,
        settings: RoomSettings,
        cancel_token: CancellationToken,
        metrics: Arc<ActorMetrics>,
    ) -> (RoomActorHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(ROOM_CHANNEL_BUFFER);
        let (ready_tx, ready_rx) = watch::channel(RoomReadiness::Initializing);
        let instance_id = Uuid::new_v4().to_string();

        let actor = Self {
            room_id: room_id.clone(),
            instance_id: instance_id.clone(),
            worker_index,
            worker,
            codecs: settings.codecs,
            ready_timeout: settings.ready_timeout,
            receiver,
            cancel_token: cancel_token.clone(),
            ready_tx,
            router: None,
            members: HashMap::new(),
            producers: Vec::new(),
            created_at: chrono::Utc::now().timestamp(),
            closed: false,
            metrics,
            mailbox: MailboxMonitor::new(ActorType::Room, &room_id),
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = RoomActorHandle {
            sender,
            cancel_token,
            room_id,
            instance_id,
            ready_rx,
        };

        (handle, task_handle)
    }

    /// Run the actor message loop.
    #[instrument(skip_all, name = "sfu.actor.room", fields(room_id = %self.room_id))]
    async fn run(mut self) {
        info!(
            target: "sfu.actor.room",
            room_id = %self.room_id,
            worker_index = self.worker_index,
            "RoomActor started"
        );

        let close_reason = match self.initialize().await {
            Ok(()) => {
                self.message_loop().await;
                "room closed".to_string()
            }
            Err(reason) => reason,
        };

        self.close_room();
        self.reject_pending(&close_reason).await;

        info!(
            target: "sfu.actor.room",
            room_id = %self.room_id,
            messages_processed = self.mailbox.messages_processed(),
            "RoomActor stopped"
        );
    }

    /// Create the routing context, bounded by the ready timeout.
    async fn initialize(&mut self) -> Result<(), String> {
        let started = Instant::now();

        let result = tokio::select! {
            () = self.cancel_token.cancelled() => {
                Err("room cancelled during initialization".to_string())
            }
            result = tokio::time::timeout(
                self.ready_timeout,
                self.worker.create_router(&self.codecs),
            ) => match result {
                Ok(Ok(router)) => Ok(router),
                Ok(Err(e)) => Err(format!("routing context creation failed: {e}")),
                Err(_) => Err("routing context creation timed out".to_string()),
            },
        };

        match result {
            Ok(router) => {
                debug!(
                    target: "sfu.actor.room",
                    room_id = %self.room_id,
                    router_id = %router.id(),
                    elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                    "Routing context ready"
                );
                observability::record_room_ready_duration(started.elapsed());
                self.router = Some(router);
                self.ready_tx.send_replace(RoomReadiness::Ready);
                Ok(())
            }
            Err(reason) => {
                warn!(
                    target: "sfu.actor.room",
                    room_id = %self.room_id,
                    worker_index = self.worker_index,
                    reason = %reason,
                    "Room initialization failed"
                );
                self.ready_tx
                    .send_replace(RoomReadiness::Failed(reason.clone()));
                Err(reason)
            }
        }
    }

    async fn message_loop(&mut self) {
        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    debug!(
                        target: "sfu.actor.room",
                        room_id = %self.room_id,
                        "RoomActor received cancellation signal"
                    );
                    break;
                }

                msg = self.receiver.recv() => {
                    let Some(message) = msg else {
                        break;
                    };
                    self.mailbox.record_enqueue();
                    self.handle_message(message);
                    self.mailbox.record_dequeue();
                    self.metrics.record_message_processed();

                    if self.closed {
                        break;
                    }
                }
            }
        }
    }

    fn handle_message(&mut self, message: RoomMessage) {
        match message {
            RoomMessage::Join { member, respond_to } => {
                let _ = respond_to.send(self.join(member));
            }
            RoomMessage::Leave {
                session_id,
                respond_to,
            } => {
                let _ = respond_to.send(Ok(self.leave(&session_id)));
            }
            RoomMessage::ProducerOpened {
                session_id,
                producer,
                respond_to,
            } => {
                let _ = respond_to.send(self.producer_opened(&session_id, producer));
            }
            RoomMessage::ProducerClosed {
                session_id,
                producer_id,
                respond_to,
            } => {
                let _ = respond_to.send(Ok(self.producer_closed(&session_id, &producer_id)));
            }
            RoomMessage::ListPeerProducers {
                excluding,
                respond_to,
            } => {
                let _ = respond_to.send(Ok(self.peer_producers(&excluding)));
            }
            RoomMessage::FindProducer {
                producer_id,
                respond_to,
            } => {
                let found = self
                    .producers
                    .iter()
                    .find(|p| p.producer_id == producer_id)
                    .cloned();
                let _ = respond_to.send(Ok(found));
            }
            RoomMessage::Chat {
                session_id,
                text,
                respond_to,
            } => {
                let _ = respond_to.send(self.chat(&session_id, text));
            }
            RoomMessage::GetState { respond_to } => {
                let _ = respond_to.send(self.state());
            }
        }
    }

    fn join(&mut self, member: RoomMember) -> Result<JoinedRoom, SfuError> {
        let router = self
            .router
            .clone()
            .ok_or_else(|| SfuError::RoomUnavailable("room is not ready".to_string()))?;

        if self.members.contains_key(&member.session_id) {
            return Err(SfuError::AlreadyInRoom(self.room_id.clone()));
        }

        let producers = self.peer_producers(&member.session_id);
        self.members.insert(
            member.session_id.clone(),
            Member {
                user_id: member.user_id,
                display_name: member.display_name,
                events: member.events,
            },
        );

        info!(
            target: "sfu.actor.room",
            room_id = %self.room_id,
            session_id = %member.session_id,
            members = self.members.len(),
            existing_producers = producers.len(),
            "Member joined"
        );

        Ok(JoinedRoom {
            rtp_capabilities: router.rtp_capabilities(),
            router,
            producers,
        })
    }

    /// Remove a member. Idempotent: an unknown member yields an empty outcome.
    fn leave(&mut self, session_id: &str) -> LeaveOutcome {
        if self.members.remove(session_id).is_none() {
            return LeaveOutcome {
                producer_ids: Vec::new(),
                room_empty: self.members.is_empty(),
            };
        }

        let mut producer_ids = Vec::new();
        self.producers.retain(|p| {
            if p.peer_id == session_id {
                producer_ids.push(p.producer_id.clone());
                false
            } else {
                true
            }
        });

        self.broadcast(
            Some(session_id),
            &RoomEvent::PeerLeft {
                peer_id: session_id.to_string(),
                producer_ids: producer_ids.clone(),
            },
        );

        info!(
            target: "sfu.actor.room",
            room_id = %self.room_id,
            session_id = %session_id,
            producers_closed = producer_ids.len(),
            members = self.members.len(),
            "Member left"
        );

        let room_empty = self.members.is_empty();
        if room_empty {
            self.close_room();
        }

        LeaveOutcome {
            producer_ids,
            room_empty,
        }
    }

    fn producer_opened(&mut self, session_id: &str, producer: ProducerInfo) -> Result<(), SfuError> {
        if !self.members.contains_key(session_id) {
            return Err(SfuError::NotInRoom);
        }

        debug!(
            target: "sfu.actor.room",
            room_id = %self.room_id,
            session_id = %session_id,
            producer_id = %producer.producer_id,
            kind = %producer.kind,
            "Producer opened"
        );

        self.broadcast(Some(session_id), &RoomEvent::NewProducer(producer.clone()));
        self.producers.push(producer);
        Ok(())
    }

    fn producer_closed(&mut self, session_id: &str, producer_id: &str) -> bool {
        let Some(position) = self
            .producers
            .iter()
            .position(|p| p.producer_id == producer_id && p.peer_id == session_id)
        else {
            return false;
        };

        let producer = self.producers.remove(position);
        debug!(
            target: "sfu.actor.room",
            room_id = %self.room_id,
            session_id = %session_id,
            producer_id = %producer_id,
            "Producer closed"
        );
        self.broadcast(None, &RoomEvent::ProducerClosed(producer));
        true
    }

    fn peer_producers(&self, excluding: &str) -> Vec<ProducerInfo> {
        self.producers
            .iter()
            .filter(|p| p.peer_id != excluding)
            .cloned()
            .collect()
    }

    fn chat(&self, session_id: &str, text: String) -> Result<(), SfuError> {
        let member = self.members.get(session_id).ok_or(SfuError::NotInRoom)?;

        self.broadcast(
            Some(session_id),
            &RoomEvent::Chat {
                peer_id: session_id.to_string(),
                user_id: member.user_id.clone(),
                display_name: member.display_name.clone(),
                text,
            },
        );
        Ok(())
    }

    /// Send `event` to every member except `excluding`.
    fn broadcast(&self, excluding: Option<&str>, event: &RoomEvent) {
        for (session_id, member) in &self.members {
            if Some(session_id.as_str()) == excluding {
                continue;
            }
            if member.events.send(event.clone()).is_err() {
                debug!(
                    target: "sfu.actor.room",
                    room_id = %self.room_id,
                    session_id = %session_id,
                    "Member event channel closed"
                );
            }
        }
    }

    fn state(&self) -> RoomState {
        RoomState {
            room_id: self.room_id.clone(),
            instance_id: self.instance_id.clone(),
            worker_index: self.worker_index,
            readiness: self.ready_tx.borrow().clone(),
            members: self.members.keys().cloned().collect(),
            producer_count: self.producers.len(),
            created_at: self.created_at,
            is_closed: self.closed,
        }
    }

    /// Release the routing context and mark the room closed. Idempotent.
    fn close_room(&mut self) {
        if let Some(router) = self.router.take() {
            router.close();
            info!(
                target: "sfu.actor.room",
                room_id = %self.room_id,
                "Routing context released"
            );
        }
        self.closed = true;
        self.cancel_token.cancel();
    }

    /// Answer everything still queued, and anything sent before the
    /// receiver closes, with `RoomUnavailable`.
    async fn reject_pending(&mut self, reason: &str) {
        self.receiver.close();

        while let Some(message) = self.receiver.recv().await {
            let unavailable = || SfuError::RoomUnavailable(reason.to_string());
            match message {
                RoomMessage::Join { respond_to, .. } => {
                    let _ = respond_to.send(Err(unavailable()));
                }
                RoomMessage::Leave { respond_to, .. } => {
                    // Nothing to leave: membership went with the room.
                    let _ = respond_to.send(Ok(LeaveOutcome {
                        producer_ids: Vec::new(),
                        room_empty: true,
                    }));
                }
                RoomMessage::ProducerOpened { respond_to, .. }
                | RoomMessage::Chat { respond_to, .. } => {
                    let _ = respond_to.send(Err(unavailable()));
                }
                RoomMessage::ProducerClosed { respond_to, .. } => {
                    let _ = respond_to.send(Ok(false));
                }
                RoomMessage::ListPeerProducers { respond_to, .. } => {
                    let _ = respond_to.send(Err(unavailable()));
                }
                RoomMessage::FindProducer { respond_to, .. } => {
                    let _ = respond_to.send(Ok(None));
                }
                RoomMessage::GetState { respond_to } => {
                    let _ = respond_to.send(self.state());
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::media::local::LocalEngine;
    use crate::media::{MediaEngine, MediaKind};

    const READY: Duration = Duration::from_secs(5);

    async fn spawn_room(engine: &LocalEngine, settings: RoomSettings) -> RoomActorHandle {
        let worker = engine.create_worker(0).await.unwrap();
        let (handle, _task) = RoomActor::spawn(
            "room-1".to_string(),
            0,
            worker,
            settings,
            CancellationToken::new(),
            ActorMetrics::new(),
        );
        handle
    }

    fn member(session_id: &str) -> (RoomMember, mpsc::UnboundedReceiver<RoomEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            RoomMember {
                session_id: session_id.to_string(),
                user_id: format!("user-{session_id}"),
                display_name: Some(session_id.to_uppercase()),
                events,
            },
            rx,
        )
    }

    fn producer(id: &str, peer: &str) -> ProducerInfo {
        ProducerInfo {
            producer_id: id.to_string(),
            peer_id: peer.to_string(),
            kind: MediaKind::Video,
        }
    }

    #[tokio::test]
    async fn test_room_becomes_ready() {
        let engine = LocalEngine::new();
        let room = spawn_room(&engine, RoomSettings::default()).await;

        room.wait_ready(READY).await.unwrap();
        assert_eq!(room.readiness(), RoomReadiness::Ready);
        assert!(!room.is_closed());
    }

    #[tokio::test]
    async fn test_join_returns_capabilities_and_peer_producers() {
        let engine = LocalEngine::new();
        let room = spawn_room(&engine, RoomSettings::default()).await;
        room.wait_ready(READY).await.unwrap();

        let (a, _a_rx) = member("a");
        let joined = room.join(a).await.unwrap();
        assert!(joined.producers.is_empty());
        assert!(joined.rtp_capabilities.get("codecs").is_some());

        room.producer_opened("a".to_string(), producer("p1", "a"))
            .await
            .unwrap();

        let (b, _b_rx) = member("b");
        let joined = room.join(b).await.unwrap();
        assert_eq!(joined.producers, vec![producer("p1", "a")]);
    }

    #[tokio::test]
    async fn test_duplicate_join_rejected() {
        let engine = LocalEngine::new();
        let room = spawn_room(&engine, RoomSettings::default()).await;
        room.wait_ready(READY).await.unwrap();

        let (a, _rx) = member("a");
        room.join(a.clone()).await.unwrap();
        assert!(matches!(
            room.join(a).await,
            Err(SfuError::AlreadyInRoom(_))
        ));
    }

    #[tokio::test]
    async fn test_new_producer_announced_to_others_only() {
        let engine = LocalEngine::new();
        let room = spawn_room(&engine, RoomSettings::default()).await;
        room.wait_ready(READY).await.unwrap();

        let (a, mut a_rx) = member("a");
        let (b, mut b_rx) = member("b");
        room.join(a).await.unwrap();
        room.join(b).await.unwrap();

        room.producer_opened("a".to_string(), producer("p1", "a"))
            .await
            .unwrap();

        assert_eq!(
            b_rx.try_recv().unwrap(),
            RoomEvent::NewProducer(producer("p1", "a"))
        );
        assert!(a_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_producer_closed_reaches_every_member() {
        let engine = LocalEngine::new();
        let room = spawn_room(&engine, RoomSettings::default()).await;
        room.wait_ready(READY).await.unwrap();

        let (a, mut a_rx) = member("a");
        let (b, mut b_rx) = member("b");
        room.join(a).await.unwrap();
        room.join(b).await.unwrap();
        room.producer_opened("a".to_string(), producer("p1", "a"))
            .await
            .unwrap();
        let _ = b_rx.try_recv();

        // Only the owner may close.
        assert!(!room
            .producer_closed("b".to_string(), "p1".to_string())
            .await
            .unwrap());
        assert!(room
            .producer_closed("a".to_string(), "p1".to_string())
            .await
            .unwrap());

        let expected = RoomEvent::ProducerClosed(producer("p1", "a"));
        assert_eq!(a_rx.try_recv().unwrap(), expected);
        assert_eq!(b_rx.try_recv().unwrap(), expected);
        assert!(b_rx.try_recv().is_err(), "exactly one notification");

        assert!(room
            .find_producer("p1".to_string())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_leave_bundles_producers_in_one_event() {
        let engine = LocalEngine::new();
        let room = spawn_room(&engine, RoomSettings::default()).await;
        room.wait_ready(READY).await.unwrap();

        let (a, _a_rx) = member("a");
        let (b, mut b_rx) = member("b");
        room.join(a).await.unwrap();
        room.join(b).await.unwrap();
        for id in ["p1", "p2", "p3"] {
            room.producer_opened("a".to_string(), producer(id, "a"))
                .await
                .unwrap();
        }
        while b_rx.try_recv().is_ok() {}

        let outcome = room.leave("a".to_string()).await.unwrap();
        assert_eq!(outcome.producer_ids, vec!["p1", "p2", "p3"]);
        assert!(!outcome.room_empty);

        assert_eq!(
            b_rx.try_recv().unwrap(),
            RoomEvent::PeerLeft {
                peer_id: "a".to_string(),
                producer_ids: vec!["p1".to_string(), "p2".to_string(), "p3".to_string()],
            }
        );
        assert!(b_rx.try_recv().is_err());

        let peers = room.list_peer_producers("b".to_string()).await.unwrap();
        assert!(peers.is_empty());
    }

    #[tokio::test]
    async fn test_last_leave_closes_room() {
        let engine = LocalEngine::new();
        let room = spawn_room(&engine, RoomSettings::default()).await;
        room.wait_ready(READY).await.unwrap();

        let (a, _rx) = member("a");
        room.join(a).await.unwrap();

        let outcome = room.leave("a".to_string()).await.unwrap();
        assert!(outcome.room_empty);
        assert!(room.is_closed());

        let (b, _rx) = member("b");
        assert!(matches!(
            room.join(b).await,
            Err(SfuError::RoomUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_leave_unknown_member_is_noop() {
        let engine = LocalEngine::new();
        let room = spawn_room(&engine, RoomSettings::default()).await;
        room.wait_ready(READY).await.unwrap();

        let (a, _rx) = member("a");
        room.join(a).await.unwrap();

        let outcome = room.leave("ghost".to_string()).await.unwrap();
        assert_eq!(outcome, LeaveOutcome::default());
        assert!(!room.is_closed());
    }

    #[tokio::test]
    async fn test_initialization_failure_rejects_joins() {
        let engine = LocalEngine::new().with_failing_routers();
        let room = spawn_room(&engine, RoomSettings::default()).await;

        let err = room.wait_ready(READY).await.unwrap_err();
        assert!(matches!(err, SfuError::RoomUnavailable(_)));
        assert!(matches!(room.readiness(), RoomReadiness::Failed(_)));

        let (a, _rx) = member("a");
        assert!(matches!(
            room.join(a).await,
            Err(SfuError::RoomUnavailable(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_initialization_timeout() {
        let engine = LocalEngine::new().with_router_delay(Duration::from_secs(60));
        let settings = RoomSettings {
            ready_timeout: Duration::from_secs(2),
            ..RoomSettings::default()
        };
        let room = spawn_room(&engine, settings).await;

        let err = room.wait_ready(Duration::from_secs(30)).await.unwrap_err();
        assert!(matches!(err, SfuError::RoomUnavailable(ref r) if r.contains("timed out")));
        assert!(matches!(room.readiness(), RoomReadiness::Failed(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_queued_during_initialization_waits() {
        let engine = LocalEngine::new().with_router_delay(Duration::from_millis(500));
        let room = spawn_room(&engine, RoomSettings::default()).await;
        assert_eq!(room.readiness(), RoomReadiness::Initializing);

        // Sent before the router exists; answered once it does.
        let (a, _rx) = member("a");
        let joined = room.join(a).await.unwrap();
        assert!(joined.rtp_capabilities.get("codecs").is_some());
        assert_eq!(room.readiness(), RoomReadiness::Ready);
    }

    #[tokio::test]
    async fn test_chat_relayed_to_others() {
        let engine = LocalEngine::new();
        let room = spawn_room(&engine, RoomSettings::default()).await;
        room.wait_ready(READY).await.unwrap();

        let (a, mut a_rx) = member("a");
        let (b, mut b_rx) = member("b");
        room.join(a).await.unwrap();
        room.join(b).await.unwrap();

        room.chat("a".to_string(), "hello".to_string())
            .await
            .unwrap();

        assert_eq!(
            b_rx.try_recv().unwrap(),
            RoomEvent::Chat {
                peer_id: "a".to_string(),
                user_id: "user-a".to_string(),
                display_name: Some("A".to_string()),
                text: "hello".to_string(),
            }
        );
        assert!(a_rx.try_recv().is_err());

        assert!(matches!(
            room.chat("ghost".to_string(), "hi".to_string()).await,
            Err(SfuError::NotInRoom)
        ));
    }

    #[tokio::test]
    async fn test_get_state() {
        let engine = LocalEngine::new();
        let room = spawn_room(&engine, RoomSettings::default()).await;
        room.wait_ready(READY).await.unwrap();

        let (a, _rx) = member("a");
        room.join(a).await.unwrap();
        room.producer_opened("a".to_string(), producer("p1", "a"))
            .await
            .unwrap();

        let state = room.get_state().await.unwrap();
        assert_eq!(state.room_id, "room-1");
        assert_eq!(state.instance_id, room.instance_id());
        assert_eq!(state.members, vec!["a".to_string()]);
        assert_eq!(state.producer_count, 1);
        assert!(!state.is_closed);
    }
}
