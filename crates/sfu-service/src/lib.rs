//! SFU Service Library
//!
//! Signaling and session orchestration for a selective forwarding unit:
//!
//! - WebSocket gateway with bearer-token authentication
//! - Room registry and per-room actors owning membership and routing contexts
//! - Per-connection session actors owning transports, producers and consumers
//! - A pool of media workers with round-robin room placement
//!
//! # Architecture
//!
//! ```text
//! Gateway (axum /ws)
//! └── SessionActor (one per connection)
//!         │ get_or_create_room
//!         ▼
//! RoomRegistryActor (singleton)
//! └── RoomActor (one per active room) ── router on a pooled MediaWorker
//! ```
//!
//! Media forwarding itself is delegated to a [`media::MediaEngine`]: the
//! in-process `LocalEngine` by default, or mediasoup with the `mediasoup`
//! feature.
//!
//! # Modules
//!
//! - [`actors`] - Registry, room and session actors
//! - [`auth`] - Client token verification
//! - [`config`] - Service configuration from environment
//! - [`errors`] - Error types with signaling error codes
//! - [`gateway`] - WebSocket endpoint
//! - [`media`] - Media engine seam and implementations
//! - [`observability`] - Metrics and health endpoints
//! - [`signaling`] - Wire messages and per-session dispatch
//! - [`worker_pool`] - Media worker pool

pub mod actors;
pub mod auth;
pub mod config;
pub mod errors;
pub mod gateway;
pub mod media;
pub mod observability;
pub mod signaling;
pub mod worker_pool;
