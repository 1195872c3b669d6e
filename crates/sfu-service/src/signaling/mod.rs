//! Client signaling: JSON message types and per-session dispatch.

pub(crate) mod handler;
pub mod protocol;

pub use protocol::{parse_client_message, ClientMessage, ParseError, ServerMessage};
