//! Media engine abstraction.
//!
//! The orchestration layer talks to the media engine only through the traits
//! in this module. Negotiation parameters (RTP capabilities, RTP parameters,
//! DTLS and ICE data) cross the boundary as opaque JSON values so the
//! signaling layer never depends on a concrete engine's types.
//!
//! Two backends exist:
//! - [`local::LocalEngine`]: in-process bookkeeping engine (no RTP forwarding)
//! - `mediasoup::MediasoupEngine`: mediasoup workers (feature `mediasoup`)

pub mod local;
#[cfg(feature = "mediasoup")]
pub mod mediasoup;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

/// Media track kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Direction of a WebRTC transport from the client's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportDirection {
    /// Carries the session's outbound media (producers).
    Send,
    /// Carries media destined for the session (consumers).
    Receive,
}

impl TransportDirection {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            TransportDirection::Send => "send",
            TransportDirection::Receive => "receive",
        }
    }
}

/// DTLS state reported by the engine for a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DtlsState {
    New,
    Connecting,
    Connected,
    Failed,
    Closed,
}

impl DtlsState {
    /// Whether the transport can no longer carry media.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, DtlsState::Failed | DtlsState::Closed)
    }
}

/// Codec a router is able to route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecCapability {
    pub kind: MediaKind,
    pub mime_type: String,
    pub clock_rate: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

/// Router codec list: Opus audio and VP8 video.
#[must_use]
pub fn default_media_codecs() -> Vec<RtpCodecCapability> {
    let mut vp8_parameters = Map::new();
    vp8_parameters.insert("x-google-start-bitrate".to_string(), json!(1000));

    vec![
        RtpCodecCapability {
            kind: MediaKind::Audio,
            mime_type: "audio/opus".to_string(),
            clock_rate: 48000,
            channels: Some(2),
            parameters: Map::new(),
        },
        RtpCodecCapability {
            kind: MediaKind::Video,
            mime_type: "video/VP8".to_string(),
            clock_rate: 90000,
            channels: None,
            parameters: vp8_parameters,
        },
    ]
}

/// Listen settings applied to every WebRTC transport.
#[derive(Debug, Clone)]
pub struct TransportSettings {
    pub listen_ip: IpAddr,
    pub announced_ip: Option<String>,
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
    pub initial_available_outgoing_bitrate: u32,
    pub max_incoming_bitrate: Option<u32>,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            listen_ip: IpAddr::from([0, 0, 0, 0]),
            announced_ip: Some("127.0.0.1".to_string()),
            rtc_min_port: 10000,
            rtc_max_port: 10100,
            initial_available_outgoing_bitrate: 1_000_000,
            max_incoming_bitrate: None,
        }
    }
}

/// Connection parameters the client needs to set up its side of a transport.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportOptions {
    pub id: String,
    pub ice_parameters: Value,
    pub ice_candidates: Value,
    pub dtls_parameters: Value,
}

/// Worker process resource usage snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerResourceUsage {
    /// User CPU time used (ms).
    pub user_cpu_ms: u64,
    /// System CPU time used (ms).
    pub system_cpu_ms: u64,
    /// Maximum resident set size (KiB).
    pub max_rss_kb: u64,
}

/// Media engine errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MediaError {
    #[error("Failed to spawn worker: {0}")]
    WorkerSpawn(String),

    #[error("Worker closed")]
    WorkerClosed,

    #[error("Router closed")]
    RouterClosed,

    #[error("Transport closed")]
    TransportClosed,

    #[error("Unknown producer: {0}")]
    UnknownProducer(String),

    #[error("Incompatible capabilities: {0}")]
    Incompatible(String),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Engine error: {0}")]
    Engine(String),
}

/// Factory for media workers.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Engine name for logging.
    fn name(&self) -> &'static str;

    /// Start one worker. `index` is the worker's position in the pool.
    async fn create_worker(&self, index: usize) -> Result<Arc<dyn MediaWorker>, MediaError>;
}

/// One media-processing worker.
#[async_trait]
pub trait MediaWorker: Send + Sync {
    fn id(&self) -> String;

    /// Liveness channel: `true` while the worker runs, flips to `false` when it dies.
    fn liveness(&self) -> watch::Receiver<bool>;

    fn is_alive(&self) -> bool {
        let liveness = self.liveness();
        let alive = *liveness.borrow();
        alive
    }

    async fn resource_usage(&self) -> Result<WorkerResourceUsage, MediaError>;

    /// Create a routing context for one room.
    async fn create_router(
        &self,
        codecs: &[RtpCodecCapability],
    ) -> Result<Arc<dyn MediaRouter>, MediaError>;
}

/// Per-room routing context.
#[async_trait]
pub trait MediaRouter: Send + Sync {
    fn id(&self) -> String;

    /// RTP capabilities clients need to load their device.
    fn rtp_capabilities(&self) -> Value;

    /// Whether a receiver with `rtp_capabilities` can consume `producer_id`.
    fn can_consume(&self, producer_id: &str, rtp_capabilities: &Value) -> bool;

    async fn create_webrtc_transport(
        &self,
        settings: &TransportSettings,
    ) -> Result<Arc<dyn MediaTransport>, MediaError>;

    /// Close the router and every transport created on it.
    fn close(&self);
}

/// A negotiated WebRTC transport.
#[async_trait]
pub trait MediaTransport: Send + Sync {
    fn id(&self) -> String;

    fn options(&self) -> TransportOptions;

    /// DTLS state channel; changes are observed asynchronously.
    fn dtls_state(&self) -> watch::Receiver<DtlsState>;

    /// Incoming bitrate cap in effect on this transport, if any.
    fn max_incoming_bitrate(&self) -> Option<u32>;

    /// Complete the DTLS handshake with the client's parameters.
    async fn connect(&self, dtls_parameters: Value) -> Result<(), MediaError>;

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: Value,
    ) -> Result<Arc<dyn MediaProducer>, MediaError>;

    async fn consume(
        &self,
        producer_id: &str,
        rtp_capabilities: Value,
        paused: bool,
    ) -> Result<Arc<dyn MediaConsumer>, MediaError>;

    /// Close the transport and everything riding on it.
    fn close(&self);
}

/// An outbound track.
pub trait MediaProducer: Send + Sync {
    fn id(&self) -> String;
    fn kind(&self) -> MediaKind;
    /// Close the producer and every consumer created from it.
    fn close(&self);
}

/// An inbound track sourced from a producer.
#[async_trait]
pub trait MediaConsumer: Send + Sync {
    fn id(&self) -> String;
    fn producer_id(&self) -> String;
    fn kind(&self) -> MediaKind;
    fn rtp_parameters(&self) -> Value;
    fn is_paused(&self) -> bool;
    fn is_closed(&self) -> bool;
    async fn resume(&self) -> Result<(), MediaError>;
    fn close(&self);
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_default_codecs() {
        let codecs = default_media_codecs();
        assert_eq!(codecs.len(), 2);

        let opus = codecs.first().unwrap();
        assert_eq!(opus.mime_type, "audio/opus");
        assert_eq!(opus.clock_rate, 48000);
        assert_eq!(opus.channels, Some(2));

        let vp8 = codecs.get(1).unwrap();
        assert_eq!(vp8.mime_type, "video/VP8");
        assert_eq!(vp8.clock_rate, 90000);
        assert_eq!(
            vp8.parameters.get("x-google-start-bitrate"),
            Some(&json!(1000))
        );
    }

    #[test]
    fn test_media_kind_serde() {
        assert_eq!(serde_json::to_value(MediaKind::Video).unwrap(), json!("video"));
        let kind: MediaKind = serde_json::from_value(json!("audio")).unwrap();
        assert_eq!(kind, MediaKind::Audio);
        assert!(serde_json::from_value::<MediaKind>(json!("data")).is_err());
    }

    #[test]
    fn test_transport_options_serialize_camel_case() {
        let options = TransportOptions {
            id: "t1".to_string(),
            ice_parameters: json!({}),
            ice_candidates: json!([]),
            dtls_parameters: json!({}),
        };
        let value = serde_json::to_value(&options).unwrap();
        assert!(value.get("iceParameters").is_some());
        assert!(value.get("iceCandidates").is_some());
        assert!(value.get("dtlsParameters").is_some());
    }

    #[test]
    fn test_dtls_terminal_states() {
        assert!(DtlsState::Closed.is_terminal());
        assert!(DtlsState::Failed.is_terminal());
        assert!(!DtlsState::Connected.is_terminal());
    }
}
