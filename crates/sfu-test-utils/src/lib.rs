//! # SFU Test Utilities
//!
//! Shared test utilities for the SFU service.
//!
//! This crate provides:
//! - Token builders (`TestTokenBuilder`)
//! - Server test harness (`TestSfuServer` for E2E tests)
//! - WebSocket signaling client (`SignalingClient`)
//! - Negotiation parameter fixtures
//!
//! ## Usage
//!
//! ```rust,ignore
//! use sfu_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() -> anyhow::Result<()> {
//!     let server = TestSfuServer::spawn().await?;
//!     let mut alice = SignalingClient::connect(&server.ws_url_for("alice")).await?;
//!
//!     alice.send(json!({"type": "JOIN_ROOM", "roomId": "r1"})).await?;
//!     let joined = alice.recv_type("ROOM_JOINED").await?;
//!     assert_eq!(joined["producers"], json!([]));
//!     Ok(())
//! }
//! ```

pub mod fixtures;
pub mod server_harness;
pub mod token_builders;
pub mod ws_client;

// Re-export commonly used items
pub use fixtures::*;
pub use server_harness::*;
pub use token_builders::*;
pub use ws_client::*;
