//! Actor hierarchy for the SFU.
//!
//! ```text
//! RoomRegistryActor (singleton per process)
//! └── supervises N RoomActors
//!     └── RoomActor (one per active room, owns the router)
//!         └── member SessionActors (one per WebSocket connection)
//! ```
//!
//! - **Single owner per room**: membership and the producer index live in
//!   one task; sessions talk to it by message.
//! - **CancellationToken propagation**: the registry hands each room a child
//!   token of the service root token.
//! - **Mailbox monitoring**: depth thresholds with metrics per actor type.
//!
//! # Modules
//!
//! - [`registry`] - `RoomRegistryActor`, room lookup and lifecycle
//! - [`room`] - `RoomActor`, membership, producer index and notifications
//! - [`session`] - `SessionActor`, one participant's transports and streams
//! - [`messages`] - Message types for actor communication
//! - [`metrics`] - Mailbox monitoring and actor metrics

pub mod messages;
pub mod metrics;
pub mod registry;
pub mod room;
pub mod session;

pub use messages::*;
pub use metrics::{ActorMetrics, ActorType, MailboxMonitor};
pub use registry::{RoomRegistryActor, RoomRegistryHandle, RoomSettings};
pub use room::{RoomActor, RoomActorHandle};
pub use session::{SessionActor, SessionActorHandle, SessionSettings};
