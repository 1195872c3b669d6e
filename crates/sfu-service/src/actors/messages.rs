//! Message types for the registry, room and session actors.
//!
//! Request messages carry a `respond_to` oneshot; room-to-session
//! notifications travel as [`RoomEvent`]s on per-session unbounded channels.

use crate::errors::SfuError;
use crate::media::{MediaKind, MediaRouter};

use super::room::RoomActorHandle;

use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

// ============================================================================
// Registry
// ============================================================================

pub enum RegistryMessage {
    /// Return the live room for `room_id`, creating it if needed.
    GetOrCreateRoom {
        room_id: String,
        respond_to: oneshot::Sender<Result<RoomActorHandle, SfuError>>,
    },

    /// Evict the room if it is the given instance and has closed.
    RemoveRoomIfClosed {
        room_id: String,
        instance_id: String,
        respond_to: oneshot::Sender<bool>,
    },

    GetStatus {
        respond_to: oneshot::Sender<RegistryStatus>,
    },

    /// Stop accepting rooms, cancel every room and wait for them to stop.
    Shutdown {
        respond_to: oneshot::Sender<()>,
    },
}

/// Registry status snapshot.
#[derive(Debug, Clone)]
pub struct RegistryStatus {
    pub room_count: usize,
    pub session_count: usize,
    pub worker_count: usize,
    pub live_worker_count: usize,
    pub is_draining: bool,
    pub mailbox_depth: usize,
}

// ============================================================================
// Room
// ============================================================================

pub enum RoomMessage {
    Join {
        member: RoomMember,
        respond_to: oneshot::Sender<Result<JoinedRoom, SfuError>>,
    },

    Leave {
        session_id: String,
        respond_to: oneshot::Sender<Result<LeaveOutcome, SfuError>>,
    },

    /// A member opened a producer; announced to every other member.
    ProducerOpened {
        session_id: String,
        producer: ProducerInfo,
        respond_to: oneshot::Sender<Result<(), SfuError>>,
    },

    /// A member closed a producer; announced to every member.
    /// Answers `false` if the member did not own the producer.
    ProducerClosed {
        session_id: String,
        producer_id: String,
        respond_to: oneshot::Sender<Result<bool, SfuError>>,
    },

    ListPeerProducers {
        excluding: String,
        respond_to: oneshot::Sender<Result<Vec<ProducerInfo>, SfuError>>,
    },

    FindProducer {
        producer_id: String,
        respond_to: oneshot::Sender<Result<Option<ProducerInfo>, SfuError>>,
    },

    /// Relay a chat message to every other member.
    Chat {
        session_id: String,
        text: String,
        respond_to: oneshot::Sender<Result<(), SfuError>>,
    },

    GetState {
        respond_to: oneshot::Sender<RoomState>,
    },
}

/// A session as seen by its room.
#[derive(Debug, Clone)]
pub struct RoomMember {
    pub session_id: String,
    pub user_id: String,
    pub display_name: Option<String>,
    pub events: mpsc::UnboundedSender<RoomEvent>,
}

/// An open producer announced in a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerInfo {
    pub producer_id: String,
    /// Session id of the producing member.
    pub peer_id: String,
    pub kind: MediaKind,
}

/// Successful join.
pub struct JoinedRoom {
    pub router: Arc<dyn MediaRouter>,
    pub rtp_capabilities: Value,
    /// Producers already open in the room, excluding the joiner's.
    pub producers: Vec<ProducerInfo>,
}

/// Result of a leave.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeaveOutcome {
    /// Producers the member still owned, announced in one `PeerLeft`.
    pub producer_ids: Vec<String>,
    /// Whether the room closed because it became empty.
    pub room_empty: bool,
}

/// Routing context readiness.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomReadiness {
    Initializing,
    Ready,
    Failed(String),
}

/// Room state snapshot.
#[derive(Debug, Clone)]
pub struct RoomState {
    pub room_id: String,
    pub instance_id: String,
    pub worker_index: usize,
    pub readiness: RoomReadiness,
    /// Member session ids.
    pub members: Vec<String>,
    pub producer_count: usize,
    pub created_at: i64,
    pub is_closed: bool,
}

/// Notification from a room to one of its members.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomEvent {
    NewProducer(ProducerInfo),
    ProducerClosed(ProducerInfo),
    PeerLeft {
        peer_id: String,
        producer_ids: Vec<String>,
    },
    Chat {
        peer_id: String,
        user_id: String,
        display_name: Option<String>,
        text: String,
    },
}

// ============================================================================
// Session
// ============================================================================

pub enum SessionMessage {
    /// A frame read from the client's socket.
    Inbound { frame: InboundFrame },

    /// Tear down all media state, leave the room and stop.
    Disconnect { respond_to: oneshot::Sender<()> },

    GetState {
        respond_to: oneshot::Sender<SessionState>,
    },
}

/// Raw client frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    Text(String),
    /// Binary frames are not part of the protocol; only the size is kept.
    Binary(usize),
}

/// Session state snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionState {
    pub session_id: String,
    pub user_id: String,
    pub room_id: Option<String>,
    pub transport_count: usize,
    pub producer_count: usize,
    pub consumer_count: usize,
    /// Consumers still paused.
    pub paused_consumer_count: usize,
}
