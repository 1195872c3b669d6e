//! `RoomRegistryActor` - singleton supervisor for room actors.
//!
//! The registry is the top-level actor of the SFU:
//!
//! - Maps room ids to live `RoomActor`s, creating them on first join
//! - Assigns each new room to a worker from the pool (round-robin)
//! - Evicts rooms that closed, so a reused id gets a fresh instance
//! - Monitors child actor health (panic detection via `JoinHandle`)
//!
//! # Graceful Shutdown
//!
//! On shutdown the registry:
//! 1. Stops accepting new rooms
//! 2. Cancels every room (each releases its routing context)
//! 3. Waits for the room tasks to finish, bounded per room

use crate::config::Config;
use crate::errors::SfuError;
use crate::media::{default_media_codecs, RtpCodecCapability};
use crate::worker_pool::WorkerPool;

use super::messages::{RegistryMessage, RegistryStatus};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};
use super::room::{RoomActor, RoomActorHandle};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Default channel buffer size for the registry mailbox.
const REGISTRY_CHANNEL_BUFFER: usize = 1000;

/// How often room tasks are checked when the mailbox is idle.
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Bound on waiting for one room task during eviction or shutdown.
const ROOM_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Settings handed to every new room.
#[derive(Debug, Clone)]
pub struct RoomSettings {
    /// Bound on routing context creation.
    pub ready_timeout: Duration,
    /// Codecs every router is created with.
    pub codecs: Vec<RtpCodecCapability>,
}

impl Default for RoomSettings {
    fn default() -> Self {
        Self {
            ready_timeout: Duration::from_secs(10),
            codecs: default_media_codecs(),
        }
    }
}

impl From<&Config> for RoomSettings {
    fn from(config: &Config) -> Self {
        Self {
            ready_timeout: config.room_ready_timeout(),
            codecs: default_media_codecs(),
        }
    }
}

/// Handle to the `RoomRegistryActor`.
#[derive(Clone)]
pub struct RoomRegistryHandle {
    sender: mpsc::Sender<RegistryMessage>,
    cancel_token: CancellationToken,
}

impl RoomRegistryHandle {
    /// Spawn the registry actor and return a handle to it.
    ///
    /// Rooms run under child tokens of `cancel_token`.
    #[must_use]
    pub fn new(
        pool: Arc<WorkerPool>,
        settings: RoomSettings,
        metrics: Arc<ActorMetrics>,
        cancel_token: CancellationToken,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(REGISTRY_CHANNEL_BUFFER);

        let actor = RoomRegistryActor {
            receiver,
            cancel_token: cancel_token.clone(),
            pool,
            settings,
            rooms: HashMap::new(),
            accepting_new: true,
            metrics,
            mailbox: MailboxMonitor::new(ActorType::Registry, "registry"),
        };

        tokio::spawn(actor.run());

        Self {
            sender,
            cancel_token,
        }
    }

    /// Return the live room for `room_id`, creating it on a pool worker if
    /// none exists. The returned room may still be initializing.
    pub async fn get_or_create_room(&self, room_id: String) -> Result<RoomActorHandle, SfuError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::GetOrCreateRoom {
                room_id,
                respond_to: tx,
            })
            .await
            .map_err(|e| SfuError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SfuError::Internal(format!("response receive failed: {e}")))?
    }

    /// Evict `room_id` if it is still `instance_id` and has closed.
    ///
    /// Returns whether an entry was evicted.
    pub async fn remove_room_if_closed(
        &self,
        room_id: String,
        instance_id: String,
    ) -> Result<bool, SfuError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::RemoveRoomIfClosed {
                room_id,
                instance_id,
                respond_to: tx,
            })
            .await
            .map_err(|e| SfuError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SfuError::Internal(format!("response receive failed: {e}")))
    }

    pub async fn get_status(&self) -> Result<RegistryStatus, SfuError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::GetStatus { respond_to: tx })
            .await
            .map_err(|e| SfuError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SfuError::Internal(format!("response receive failed: {e}")))
    }

    /// Close every room and stop the registry. Resolves once all room
    /// tasks have finished or timed out.
    pub async fn shutdown(&self) -> Result<(), SfuError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::Shutdown { respond_to: tx })
            .await
            .map_err(|e| SfuError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SfuError::Internal(format!("response receive failed: {e}")))
    }

    /// Cancel the actor (for immediate shutdown).
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

/// Internal state for a managed room.
struct ManagedRoom {
    handle: RoomActorHandle,
    task_handle: JoinHandle<()>,
    worker_index: usize,
    created_at: i64,
}

/// The `RoomRegistryActor` implementation.
pub struct RoomRegistryActor {
    receiver: mpsc::Receiver<RegistryMessage>,
    cancel_token: CancellationToken,
    pool: Arc<WorkerPool>,
    settings: RoomSettings,
    /// Managed rooms by id.
    rooms: HashMap<String, ManagedRoom>,
    accepting_new: bool,
    metrics: Arc<ActorMetrics>,
    mailbox: MailboxMonitor,
}

impl RoomRegistryActor {
    /// Run the actor message loop.
    #[instrument(skip_all, name = "sfu.actor.registry")]
    async fn run(mut self) {
        info!(
            target: "sfu.actor.registry",
            workers = self.pool.worker_count(),
            "RoomRegistryActor started"
        );

        let mut health_check = tokio::time::interval(HEALTH_CHECK_INTERVAL);
        health_check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            // Check for terminated room actors
            self.check_room_health().await;

            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "sfu.actor.registry",
                        "RoomRegistryActor received cancellation signal"
                    );
                    self.graceful_shutdown().await;
                    break;
                }

                _ = health_check.tick() => {}

                msg = self.receiver.recv() => {
                    match msg {
                        Some(RegistryMessage::Shutdown { respond_to }) => {
                            self.mailbox.record_enqueue();
                            self.graceful_shutdown().await;
                            self.mailbox.record_dequeue();
                            let _ = respond_to.send(());
                            break;
                        }
                        Some(message) => {
                            self.mailbox.record_enqueue();
                            self.handle_message(message);
                            self.mailbox.record_dequeue();
                            self.metrics.record_message_processed();
                        }
                        None => {
                            info!(
                                target: "sfu.actor.registry",
                                "RoomRegistryActor channel closed, exiting"
                            );
                            self.graceful_shutdown().await;
                            break;
                        }
                    }
                }
            }
        }

        info!(
            target: "sfu.actor.registry",
            rooms_remaining = self.rooms.len(),
            messages_processed = self.mailbox.messages_processed(),
            "RoomRegistryActor stopped"
        );
    }

    fn handle_message(&mut self, message: RegistryMessage) {
        match message {
            RegistryMessage::GetOrCreateRoom {
                room_id,
                respond_to,
            } => {
                let result = self.get_or_create_room(room_id);
                let _ = respond_to.send(result);
            }

            RegistryMessage::RemoveRoomIfClosed {
                room_id,
                instance_id,
                respond_to,
            } => {
                let removed = self.remove_room_if_closed(&room_id, &instance_id);
                let _ = respond_to.send(removed);
            }

            RegistryMessage::GetStatus { respond_to } => {
                let _ = respond_to.send(self.get_status());
            }

            // Handled in the run loop.
            RegistryMessage::Shutdown { respond_to } => {
                let _ = respond_to.send(());
            }
        }
    }

    fn get_or_create_room(&mut self, room_id: String) -> Result<RoomActorHandle, SfuError> {
        if !self.accepting_new {
            return Err(SfuError::RoomUnavailable(
                "service is shutting down".to_string(),
            ));
        }

        if room_id.trim().is_empty() {
            return Err(SfuError::Protocol("roomId must not be empty".to_string()));
        }

        if let Some(managed) = self.rooms.get(&room_id) {
            if !managed.handle.is_closed() && !managed.task_handle.is_finished() {
                return Ok(managed.handle.clone());
            }
            // Closed rooms are replaced, never reopened.
            self.evict(&room_id);
        }

        let (worker_index, worker) = self.pool.acquire_worker()?;

        let (handle, task_handle) = RoomActor::spawn(
            room_id.clone(),
            worker_index,
            worker,
            self.settings.clone(),
            self.cancel_token.child_token(),
            Arc::clone(&self.metrics),
        );

        self.rooms.insert(
            room_id.clone(),
            ManagedRoom {
                handle: handle.clone(),
                task_handle,
                worker_index,
                created_at: chrono::Utc::now().timestamp(),
            },
        );
        self.metrics.room_created();

        info!(
            target: "sfu.actor.registry",
            room_id = %room_id,
            instance_id = %handle.instance_id(),
            worker_index,
            total_rooms = self.rooms.len(),
            "Room actor created"
        );

        Ok(handle)
    }

    fn remove_room_if_closed(&mut self, room_id: &str, instance_id: &str) -> bool {
        let matches = self.rooms.get(room_id).is_some_and(|managed| {
            managed.handle.instance_id() == instance_id && managed.handle.is_closed()
        });

        if matches {
            self.evict(room_id);
        }
        matches
    }

    /// Remove a room entry and reap its task in the background.
    fn evict(&mut self, room_id: &str) {
        let Some(managed) = self.rooms.remove(room_id) else {
            return;
        };

        managed.handle.cancel();
        self.metrics.room_removed();

        let room_id_owned = room_id.to_string();
        tokio::spawn(async move {
            match tokio::time::timeout(ROOM_STOP_TIMEOUT, managed.task_handle).await {
                Ok(Ok(())) => {
                    debug!(
                        target: "sfu.actor.registry",
                        room_id = %room_id_owned,
                        "Room actor task completed cleanly"
                    );
                }
                Ok(Err(e)) => {
                    warn!(
                        target: "sfu.actor.registry",
                        room_id = %room_id_owned,
                        error = ?e,
                        "Room actor task panicked during removal"
                    );
                }
                Err(_) => {
                    warn!(
                        target: "sfu.actor.registry",
                        room_id = %room_id_owned,
                        "Room actor task cleanup timed out"
                    );
                }
            }
        });

        info!(
            target: "sfu.actor.registry",
            room_id = %room_id,
            worker_index = managed.worker_index,
            lifetime_secs = chrono::Utc::now().timestamp() - managed.created_at,
            total_rooms = self.rooms.len(),
            "Room actor removed"
        );
    }

    fn get_status(&self) -> RegistryStatus {
        RegistryStatus {
            room_count: self.rooms.len(),
            session_count: self.metrics.session_count(),
            worker_count: self.pool.worker_count(),
            live_worker_count: self.pool.live_worker_count(),
            is_draining: !self.accepting_new,
            mailbox_depth: self.mailbox.current_depth(),
        }
    }

    async fn graceful_shutdown(&mut self) {
        info!(
            target: "sfu.actor.registry",
            room_count = self.rooms.len(),
            "Performing graceful shutdown"
        );

        self.accepting_new = false;

        for managed in self.rooms.values() {
            managed.handle.cancel();
        }

        for (room_id, managed) in self.rooms.drain() {
            match tokio::time::timeout(ROOM_STOP_TIMEOUT, managed.task_handle).await {
                Ok(Ok(())) => {
                    debug!(
                        target: "sfu.actor.registry",
                        room_id = %room_id,
                        "Room actor completed cleanly"
                    );
                }
                Ok(Err(e)) => {
                    warn!(
                        target: "sfu.actor.registry",
                        room_id = %room_id,
                        error = ?e,
                        "Room actor task panicked during shutdown"
                    );
                }
                Err(_) => {
                    warn!(
                        target: "sfu.actor.registry",
                        room_id = %room_id,
                        "Room actor shutdown timed out"
                    );
                }
            }
            self.metrics.room_removed();
        }

        info!(
            target: "sfu.actor.registry",
            "Graceful shutdown complete"
        );
    }

    /// Reap room tasks that finished on their own.
    async fn check_room_health(&mut self) {
        let finished: Vec<String> = self
            .rooms
            .iter()
            .filter(|(_, managed)| managed.task_handle.is_finished())
            .map(|(room_id, _)| room_id.clone())
            .collect();

        for room_id in finished {
            let Some(managed) = self.rooms.remove(&room_id) else {
                continue;
            };

            match managed.task_handle.await {
                Ok(()) => {
                    debug!(
                        target: "sfu.actor.registry",
                        room_id = %room_id,
                        "Room actor exited"
                    );
                }
                Err(join_error) => {
                    if join_error.is_panic() {
                        error!(
                            target: "sfu.actor.registry",
                            room_id = %room_id,
                            error = ?join_error,
                            "Room actor panicked"
                        );
                        self.metrics.record_panic(ActorType::Room);
                    }
                }
            }

            self.metrics.room_removed();
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::actors::messages::{RoomMember, RoomReadiness};
    use crate::media::local::LocalEngine;
    use crate::worker_pool::WorkerPoolSettings;

    async fn registry_with(engine: LocalEngine, workers: usize) -> RoomRegistryHandle {
        let root = CancellationToken::new();
        let pool = WorkerPool::initialize(
            Arc::new(engine),
            workers,
            WorkerPoolSettings::default(),
            root.clone(),
        )
        .await
        .unwrap();
        RoomRegistryHandle::new(pool, RoomSettings::default(), ActorMetrics::new(), root)
    }

    fn member(session_id: &str) -> RoomMember {
        let (events, _rx) = mpsc::unbounded_channel();
        RoomMember {
            session_id: session_id.to_string(),
            user_id: "user".to_string(),
            display_name: None,
            events,
        }
    }

    #[tokio::test]
    async fn test_get_or_create_returns_same_room() {
        let registry = registry_with(LocalEngine::new(), 1).await;

        let first = registry.get_or_create_room("r1".to_string()).await.unwrap();
        let second = registry.get_or_create_room("r1".to_string()).await.unwrap();
        assert_eq!(first.instance_id(), second.instance_id());

        let status = registry.get_status().await.unwrap();
        assert_eq!(status.room_count, 1);
        assert_eq!(status.worker_count, 1);

        registry.cancel();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_creation_converges_on_one_room() {
        let engine = Arc::new(LocalEngine::new().with_router_delay(Duration::from_millis(50)));
        let root = CancellationToken::new();
        let pool = WorkerPool::initialize(
            Arc::clone(&engine) as Arc<dyn crate::media::MediaEngine>,
            2,
            WorkerPoolSettings::default(),
            root.clone(),
        )
        .await
        .unwrap();
        let registry =
            RoomRegistryHandle::new(pool, RoomSettings::default(), ActorMetrics::new(), root);

        let tasks: Vec<_> = (0..32)
            .map(|_| {
                let registry = registry.clone();
                tokio::spawn(async move {
                    let room = registry.get_or_create_room("same".to_string()).await.unwrap();
                    room.wait_ready(Duration::from_secs(5)).await.unwrap();
                    room.instance_id().to_string()
                })
            })
            .collect();

        let mut instances = Vec::new();
        for task in tasks {
            instances.push(task.await.unwrap());
        }
        instances.sort();
        instances.dedup();
        assert_eq!(instances.len(), 1, "every caller must get the same room");

        assert_eq!(registry.get_status().await.unwrap().room_count, 1);
        let routers: u64 = (0..2)
            .map(|i| engine.worker(i).unwrap().routers_created())
            .sum();
        assert_eq!(routers, 1);

        registry.cancel();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_creation_of_distinct_rooms_is_balanced() {
        let engine = Arc::new(LocalEngine::new().with_router_delay(Duration::from_millis(10)));
        let root = CancellationToken::new();
        let pool = WorkerPool::initialize(
            Arc::clone(&engine) as Arc<dyn crate::media::MediaEngine>,
            2,
            WorkerPoolSettings::default(),
            root.clone(),
        )
        .await
        .unwrap();
        let registry =
            RoomRegistryHandle::new(pool, RoomSettings::default(), ActorMetrics::new(), root);

        let tasks: Vec<_> = (0..16)
            .map(|i| {
                let registry = registry.clone();
                tokio::spawn(async move {
                    let room = registry.get_or_create_room(format!("room-{i}")).await.unwrap();
                    room.wait_ready(Duration::from_secs(5)).await.unwrap();
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(registry.get_status().await.unwrap().room_count, 16);
        assert_eq!(engine.worker(0).unwrap().routers_created(), 8);
        assert_eq!(engine.worker(1).unwrap().routers_created(), 8);

        registry.cancel();
    }

    #[tokio::test]
    async fn test_rooms_spread_across_workers() {
        let registry = registry_with(LocalEngine::new(), 2).await;

        let mut indexes = Vec::new();
        for room in ["a", "b", "c", "d"] {
            let handle = registry.get_or_create_room(room.to_string()).await.unwrap();
            handle.wait_ready(Duration::from_secs(5)).await.unwrap();
            indexes.push(handle.get_state().await.unwrap().worker_index);
        }
        assert_eq!(indexes, vec![0, 1, 0, 1]);

        registry.cancel();
    }

    #[tokio::test]
    async fn test_empty_room_id_rejected() {
        let registry = registry_with(LocalEngine::new(), 1).await;

        let result = registry.get_or_create_room("  ".to_string()).await;
        assert!(matches!(result, Err(SfuError::Protocol(_))));

        registry.cancel();
    }

    #[tokio::test]
    async fn test_closed_room_replaced_with_new_instance() {
        let registry = registry_with(LocalEngine::new(), 1).await;

        let room = registry.get_or_create_room("r1".to_string()).await.unwrap();
        room.wait_ready(Duration::from_secs(5)).await.unwrap();
        room.join(member("s1")).await.unwrap();
        let outcome = room.leave("s1".to_string()).await.unwrap();
        assert!(outcome.room_empty);

        let reopened = registry.get_or_create_room("r1".to_string()).await.unwrap();
        assert_ne!(reopened.instance_id(), room.instance_id());
        reopened.wait_ready(Duration::from_secs(5)).await.unwrap();

        registry.cancel();
    }

    #[tokio::test]
    async fn test_remove_room_if_closed_checks_instance() {
        let registry = registry_with(LocalEngine::new(), 1).await;

        let room = registry.get_or_create_room("r1".to_string()).await.unwrap();
        room.wait_ready(Duration::from_secs(5)).await.unwrap();

        // Still open: nothing evicted.
        let removed = registry
            .remove_room_if_closed("r1".to_string(), room.instance_id().to_string())
            .await
            .unwrap();
        assert!(!removed);

        room.join(member("s1")).await.unwrap();
        room.leave("s1".to_string()).await.unwrap();

        let stale = registry
            .remove_room_if_closed("r1".to_string(), "some-other-instance".to_string())
            .await
            .unwrap();
        assert!(!stale);

        let removed = registry
            .remove_room_if_closed("r1".to_string(), room.instance_id().to_string())
            .await
            .unwrap();
        assert!(removed);
        assert_eq!(registry.get_status().await.unwrap().room_count, 0);

        registry.cancel();
    }

    #[tokio::test]
    async fn test_failed_room_reported_and_replaced() {
        let registry = registry_with(LocalEngine::new().with_failing_routers(), 1).await;

        let room = registry.get_or_create_room("r1".to_string()).await.unwrap();
        assert!(room.wait_ready(Duration::from_secs(5)).await.is_err());
        assert!(matches!(room.readiness(), RoomReadiness::Failed(_)));

        let retry = registry.get_or_create_room("r1".to_string()).await.unwrap();
        assert_ne!(retry.instance_id(), room.instance_id());

        registry.cancel();
    }

    #[tokio::test]
    async fn test_dead_worker_pool_rejects_rooms() {
        let engine = Arc::new(LocalEngine::new());
        let root = CancellationToken::new();
        let pool = WorkerPool::initialize(
            Arc::clone(&engine) as Arc<dyn crate::media::MediaEngine>,
            1,
            WorkerPoolSettings::default(),
            root.clone(),
        )
        .await
        .unwrap();
        let registry =
            RoomRegistryHandle::new(pool, RoomSettings::default(), ActorMetrics::new(), root);

        assert!(engine.kill_worker(0));
        let result = registry.get_or_create_room("r1".to_string()).await;
        assert!(matches!(result, Err(SfuError::WorkerFatal(_))));

        registry.cancel();
    }

    #[tokio::test]
    async fn test_shutdown_closes_rooms() {
        let registry = registry_with(LocalEngine::new(), 1).await;

        let room = registry.get_or_create_room("r1".to_string()).await.unwrap();
        room.wait_ready(Duration::from_secs(5)).await.unwrap();

        registry.shutdown().await.unwrap();
        assert!(room.is_closed());

        // The actor has exited; further requests fail.
        assert!(registry.get_or_create_room("r2".to_string()).await.is_err());
    }

    #[tokio::test]
    async fn test_cancellation_token() {
        let registry = registry_with(LocalEngine::new(), 1).await;

        let room = registry.get_or_create_room("r1".to_string()).await.unwrap();
        room.wait_ready(Duration::from_secs(5)).await.unwrap();
        assert!(!registry.is_cancelled());
        assert!(!room.is_cancelled());

        registry.cancel();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(registry.is_cancelled());
        assert!(room.is_cancelled(), "room tokens are children of the registry token");
    }
}
