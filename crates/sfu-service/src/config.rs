//! SFU service configuration.
//!
//! Configuration is loaded from environment variables. All sensitive
//! fields are redacted in Debug output.

use crate::media::TransportSettings;
use secrecy::{ExposeSecret, SecretString};
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Default WebSocket gateway bind address.
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:8080";

/// Default health endpoint bind address.
pub const DEFAULT_HEALTH_BIND_ADDRESS: &str = "0.0.0.0:8081";

/// Default RTC port range.
pub const DEFAULT_RTC_MIN_PORT: u16 = 10000;
pub const DEFAULT_RTC_MAX_PORT: u16 = 10100;

/// Default transport listen IP.
pub const DEFAULT_LISTEN_IP: &str = "0.0.0.0";

/// Default IP announced in ICE candidates.
pub const DEFAULT_ANNOUNCED_IP: &str = "127.0.0.1";

/// Default initial available outgoing bitrate (bps).
pub const DEFAULT_INITIAL_OUTGOING_BITRATE: u32 = 1_000_000;

/// Default timeout for a room's routing context to become ready.
pub const DEFAULT_ROOM_READY_TIMEOUT_SECONDS: u64 = 10;

/// Default bound on a session waiting for room in its client's outbound queue.
pub const DEFAULT_OUTBOUND_SEND_TIMEOUT_SECONDS: u64 = 10;

/// Default delay between a worker dying and the service shutting down.
pub const DEFAULT_WORKER_DEATH_GRACE_SECONDS: u64 = 2;

/// Default period for worker resource usage logging.
pub const DEFAULT_WORKER_USAGE_LOG_INTERVAL_SECONDS: u64 = 120;

/// Default maximum inbound WebSocket message size.
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 64 * 1024;

/// Which media engine backs the worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaEngineKind {
    /// In-process engine that does signaling bookkeeping without RTP forwarding.
    Local,
    /// mediasoup worker threads (requires the `mediasoup` feature).
    Mediasoup,
}

impl MediaEngineKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            MediaEngineKind::Local => "local",
            MediaEngineKind::Mediasoup => "mediasoup",
        }
    }
}

impl FromStr for MediaEngineKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(MediaEngineKind::Local),
            "mediasoup" => Ok(MediaEngineKind::Mediasoup),
            other => Err(format!("unknown media engine '{other}'")),
        }
    }
}

/// SFU service configuration.
///
/// Loaded from environment variables with sensible defaults.
/// Sensitive fields are redacted in Debug output.
#[derive(Clone)]
pub struct Config {
    /// HS256 secret used to verify client tokens.
    /// Protected by `SecretString` to prevent accidental logging.
    pub jwt_secret: SecretString,

    /// WebSocket gateway bind address (default: "0.0.0.0:8080").
    pub bind_address: String,

    /// Health endpoint bind address (default: "0.0.0.0:8081").
    pub health_bind_address: String,

    /// Media engine backend (default: local).
    pub media_engine: MediaEngineKind,

    /// Number of media workers (default: available parallelism).
    pub num_workers: usize,

    /// Lowest RTC port handed to transports.
    pub rtc_min_port: u16,

    /// Highest RTC port handed to transports.
    pub rtc_max_port: u16,

    /// IP transports listen on.
    pub listen_ip: IpAddr,

    /// IP or hostname announced in ICE candidates.
    pub announced_ip: String,

    /// Initial available outgoing bitrate for new transports (bps).
    pub initial_outgoing_bitrate: u32,

    /// Max incoming bitrate applied to each transport, if set.
    pub max_incoming_bitrate: Option<u32>,

    /// Timeout for a room's routing context to become ready.
    pub room_ready_timeout_seconds: u64,

    /// How long a full outbound queue may block a session before it is dropped.
    pub outbound_send_timeout_seconds: u64,

    /// Delay between a worker dying and service shutdown.
    pub worker_death_grace_seconds: u64,

    /// Period for worker resource usage logging.
    pub worker_usage_log_interval_seconds: u64,

    /// Maximum inbound WebSocket message size in bytes.
    pub max_message_bytes: usize,
}

/// Custom Debug implementation that redacts sensitive fields.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("jwt_secret", &"[REDACTED]")
            .field("bind_address", &self.bind_address)
            .field("health_bind_address", &self.health_bind_address)
            .field("media_engine", &self.media_engine)
            .field("num_workers", &self.num_workers)
            .field("rtc_min_port", &self.rtc_min_port)
            .field("rtc_max_port", &self.rtc_max_port)
            .field("listen_ip", &self.listen_ip)
            .field("announced_ip", &self.announced_ip)
            .field("initial_outgoing_bitrate", &self.initial_outgoing_bitrate)
            .field("max_incoming_bitrate", &self.max_incoming_bitrate)
            .field(
                "room_ready_timeout_seconds",
                &self.room_ready_timeout_seconds,
            )
            .field(
                "outbound_send_timeout_seconds",
                &self.outbound_send_timeout_seconds,
            )
            .field(
                "worker_death_grace_seconds",
                &self.worker_death_grace_seconds,
            )
            .field(
                "worker_usage_log_interval_seconds",
                &self.worker_usage_log_interval_seconds,
            )
            .field("max_message_bytes", &self.max_message_bytes)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let jwt_secret = SecretString::from(
            vars.get("SFU_JWT_SECRET")
                .ok_or_else(|| ConfigError::MissingEnvVar("SFU_JWT_SECRET".to_string()))?
                .clone(),
        );
        if jwt_secret.expose_secret().is_empty() {
            return Err(ConfigError::InvalidValue(
                "SFU_JWT_SECRET must not be empty".to_string(),
            ));
        }

        let bind_address = vars
            .get("SFU_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string());

        let health_bind_address = vars
            .get("SFU_HEALTH_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_HEALTH_BIND_ADDRESS.to_string());

        let media_engine = parse_var(vars, "SFU_MEDIA_ENGINE", MediaEngineKind::Local)?;

        let default_workers = std::thread::available_parallelism()
            .map(std::num::NonZeroUsize::get)
            .unwrap_or(1);
        let num_workers: usize = parse_var(vars, "SFU_NUM_WORKERS", default_workers)?;
        if num_workers == 0 {
            return Err(ConfigError::InvalidValue(
                "SFU_NUM_WORKERS must be at least 1".to_string(),
            ));
        }

        let rtc_min_port: u16 = parse_var(vars, "SFU_RTC_MIN_PORT", DEFAULT_RTC_MIN_PORT)?;
        let rtc_max_port: u16 = parse_var(vars, "SFU_RTC_MAX_PORT", DEFAULT_RTC_MAX_PORT)?;
        if rtc_min_port > rtc_max_port {
            return Err(ConfigError::InvalidValue(format!(
                "SFU_RTC_MIN_PORT ({rtc_min_port}) must not exceed SFU_RTC_MAX_PORT ({rtc_max_port})"
            )));
        }

        let default_listen_ip: IpAddr = [0, 0, 0, 0].into();
        let listen_ip = parse_var(vars, "SFU_LISTEN_IP", default_listen_ip)?;

        let announced_ip = vars
            .get("SFU_ANNOUNCED_IP")
            .cloned()
            .unwrap_or_else(|| DEFAULT_ANNOUNCED_IP.to_string());

        let initial_outgoing_bitrate = parse_var(
            vars,
            "SFU_INITIAL_OUTGOING_BITRATE",
            DEFAULT_INITIAL_OUTGOING_BITRATE,
        )?;

        let max_incoming_bitrate = match vars.get("SFU_MAX_INCOMING_BITRATE") {
            Some(value_str) => Some(value_str.parse::<u32>().map_err(|e| {
                ConfigError::InvalidValue(format!(
                    "SFU_MAX_INCOMING_BITRATE must be a valid positive integer, got '{value_str}': {e}"
                ))
            })?),
            None => None,
        };

        let room_ready_timeout_seconds = parse_var(
            vars,
            "SFU_ROOM_READY_TIMEOUT_SECONDS",
            DEFAULT_ROOM_READY_TIMEOUT_SECONDS,
        )?;
        if room_ready_timeout_seconds == 0 {
            return Err(ConfigError::InvalidValue(
                "SFU_ROOM_READY_TIMEOUT_SECONDS must be at least 1".to_string(),
            ));
        }

        let outbound_send_timeout_seconds = parse_var(
            vars,
            "SFU_OUTBOUND_SEND_TIMEOUT_SECONDS",
            DEFAULT_OUTBOUND_SEND_TIMEOUT_SECONDS,
        )?;
        if outbound_send_timeout_seconds == 0 {
            return Err(ConfigError::InvalidValue(
                "SFU_OUTBOUND_SEND_TIMEOUT_SECONDS must be at least 1".to_string(),
            ));
        }

        let worker_death_grace_seconds = parse_var(
            vars,
            "SFU_WORKER_DEATH_GRACE_SECONDS",
            DEFAULT_WORKER_DEATH_GRACE_SECONDS,
        )?;

        let worker_usage_log_interval_seconds = parse_var(
            vars,
            "SFU_WORKER_USAGE_LOG_INTERVAL_SECONDS",
            DEFAULT_WORKER_USAGE_LOG_INTERVAL_SECONDS,
        )?;
        if worker_usage_log_interval_seconds == 0 {
            return Err(ConfigError::InvalidValue(
                "SFU_WORKER_USAGE_LOG_INTERVAL_SECONDS must be at least 1".to_string(),
            ));
        }

        let max_message_bytes =
            parse_var(vars, "SFU_MAX_MESSAGE_BYTES", DEFAULT_MAX_MESSAGE_BYTES)?;

        Ok(Config {
            jwt_secret,
            bind_address,
            health_bind_address,
            media_engine,
            num_workers,
            rtc_min_port,
            rtc_max_port,
            listen_ip,
            announced_ip,
            initial_outgoing_bitrate,
            max_incoming_bitrate,
            room_ready_timeout_seconds,
            outbound_send_timeout_seconds,
            worker_death_grace_seconds,
            worker_usage_log_interval_seconds,
            max_message_bytes,
        })
    }

    /// Transport listen settings derived from this configuration.
    #[must_use]
    pub fn transport_settings(&self) -> TransportSettings {
        TransportSettings {
            listen_ip: self.listen_ip,
            announced_ip: Some(self.announced_ip.clone()),
            rtc_min_port: self.rtc_min_port,
            rtc_max_port: self.rtc_max_port,
            initial_available_outgoing_bitrate: self.initial_outgoing_bitrate,
            max_incoming_bitrate: self.max_incoming_bitrate,
        }
    }

    #[must_use]
    pub fn room_ready_timeout(&self) -> Duration {
        Duration::from_secs(self.room_ready_timeout_seconds)
    }

    #[must_use]
    pub fn outbound_send_timeout(&self) -> Duration {
        Duration::from_secs(self.outbound_send_timeout_seconds)
    }
}

/// Parse an optional variable, falling back to `default` when unset.
fn parse_var<T>(vars: &HashMap<String, String>, name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match vars.get(name) {
        Some(value_str) => value_str.parse().map_err(|e| {
            ConfigError::InvalidValue(format!("{name} is invalid, got '{value_str}': {e}"))
        }),
        None => Ok(default),
    }
}
