//! SFU service error types.
//!
//! Error types map to the wire-level `ERROR` codes sent to clients.
//! Internal details are logged server-side but never exposed to clients.

use crate::media::MediaError;
use thiserror::Error;

/// SFU service error type.
///
/// Maps to signaling error codes:
/// - `AuthRejected`: `UNAUTHORIZED`
/// - `Protocol`, `NotInRoom`, `AlreadyInRoom`, `InvalidState`: `PROTOCOL_ERROR`
/// - `TransportNotFound`, `ProducerNotFound`: `NOT_FOUND`
/// - `CapabilityMismatch`: `CAPABILITY_MISMATCH`
/// - `RoomUnavailable`, `WorkerPoolEmpty`: `ROOM_UNAVAILABLE`
/// - `WorkerFatal`, `Config`, `Internal`: `INTERNAL_ERROR`
/// - `Media`: depends on the underlying engine failure
#[derive(Debug, Error)]
pub enum SfuError {
    /// Bad or missing credential at connect time.
    #[error("Authentication rejected: {0}")]
    AuthRejected(String),

    /// Malformed or out-of-sequence signaling message.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Operation requires the session to be in a room.
    #[error("Session is not in a room")]
    NotInRoom,

    /// Session tried to join a second room.
    #[error("Session is already in room {0}")]
    AlreadyInRoom(String),

    /// Room failed to initialize, closed, or timed out becoming ready.
    #[error("Room unavailable: {0}")]
    RoomUnavailable(String),

    /// Transport id unknown to the session.
    #[error("Transport not found: {0}")]
    TransportNotFound(String),

    /// Producer id unknown to the room.
    #[error("Producer not found: {0}")]
    ProducerNotFound(String),

    /// Receiver capabilities cannot consume the producer.
    #[error("Capabilities cannot consume producer {0}")]
    CapabilityMismatch(String),

    /// Transport or consumer is in the wrong state for the request.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Media engine operation failed.
    #[error("Media engine error: {0}")]
    Media(#[from] MediaError),

    /// No workers available in the pool.
    #[error("Worker pool is empty")]
    WorkerPoolEmpty,

    /// A media worker died or could not be started.
    #[error("Media worker failure: {0}")]
    WorkerFatal(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error (channel failures, actor shutdown).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SfuError {
    /// Returns the signaling error code for this error.
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            SfuError::AuthRejected(_) => "UNAUTHORIZED",
            SfuError::Protocol(_)
            | SfuError::NotInRoom
            | SfuError::AlreadyInRoom(_)
            | SfuError::InvalidState(_) => "PROTOCOL_ERROR",
            SfuError::TransportNotFound(_) | SfuError::ProducerNotFound(_) => "NOT_FOUND",
            SfuError::CapabilityMismatch(_) => "CAPABILITY_MISMATCH",
            SfuError::RoomUnavailable(_) | SfuError::WorkerPoolEmpty => "ROOM_UNAVAILABLE",
            SfuError::Media(e) => match e {
                MediaError::InvalidParameters(_) => "PROTOCOL_ERROR",
                MediaError::Incompatible(_) => "CAPABILITY_MISMATCH",
                MediaError::UnknownProducer(_) => "NOT_FOUND",
                _ => "INTERNAL_ERROR",
            },
            SfuError::WorkerFatal(_) | SfuError::Config(_) | SfuError::Internal(_) => {
                "INTERNAL_ERROR"
            }
        }
    }

    /// Returns a client-safe error message (no internal details).
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            SfuError::AuthRejected(_) => "Invalid or expired token".to_string(),
            SfuError::Protocol(msg) | SfuError::InvalidState(msg) => msg.clone(),
            SfuError::NotInRoom => "Join a room first".to_string(),
            SfuError::AlreadyInRoom(_) => "Already in a room".to_string(),
            SfuError::RoomUnavailable(_) | SfuError::WorkerPoolEmpty => {
                "Room is unavailable, please retry".to_string()
            }
            SfuError::TransportNotFound(_) => "Transport not found".to_string(),
            SfuError::ProducerNotFound(_) => "Producer not found".to_string(),
            SfuError::CapabilityMismatch(_) => {
                "Receive capabilities are incompatible with this producer".to_string()
            }
            SfuError::Media(e) => match e {
                MediaError::InvalidParameters(msg) => format!("Invalid parameters: {msg}"),
                MediaError::Incompatible(_) => {
                    "Receive capabilities are incompatible with this producer".to_string()
                }
                MediaError::UnknownProducer(_) => "Producer not found".to_string(),
                _ => "An internal error occurred".to_string(),
            },
            SfuError::WorkerFatal(_) | SfuError::Config(_) | SfuError::Internal(_) => {
                "An internal error occurred".to_string()
            }
        }
    }
}
