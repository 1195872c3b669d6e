//! End-to-end signaling flows through the WebSocket gateway.
//!
//! Every test runs a real gateway on `127.0.0.1:0` backed by the in-process
//! media engine, driven by `tokio-tungstenite` clients.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]

use serde_json::json;
use sfu_test_utils::{string_field, SignalingClient, TestSfuServer};
use std::time::Duration;

const QUIET: Duration = Duration::from_millis(200);
const SETTLE: Duration = Duration::from_secs(5);

/// Two peers join, one produces, the other consumes and resumes; both
/// leave and the room is removed.
#[tokio::test]
async fn test_two_peer_scenario() -> Result<(), anyhow::Error> {
    let server = TestSfuServer::spawn().await?;
    let mut alice = SignalingClient::connect(&server.ws_url_for("alice")).await?;
    let mut bob = SignalingClient::connect(&server.ws_url_for("bob")).await?;

    let joined = alice.join_room("r1").await?;
    assert_eq!(joined["roomId"], "r1");
    assert_eq!(joined["producers"], json!([]));
    assert!(joined["rtpCapabilities"]["codecs"].is_array());
    assert_eq!(server.room_count().await, 1);

    let joined = bob.join_room("r1").await?;
    assert_eq!(joined["producers"], json!([]));
    alice.expect_silence(QUIET).await?;

    let send_transport = alice.open_send_transport().await?;
    let producer_id = alice.produce_video(&send_transport).await?;

    let announced = bob.recv_type("NEW_PEER_PRODUCER").await?;
    assert_eq!(announced["producerId"], producer_id);
    assert_eq!(announced["kind"], "video");
    let alice_peer_id = string_field(&announced, "peerId")?;

    let recv_transport = bob.open_receive_transport().await?;
    let consumed = bob.consume(&recv_transport, &producer_id).await?;
    assert_eq!(consumed["producerId"], producer_id);
    assert_eq!(consumed["kind"], "video");
    assert!(consumed["rtpParameters"]["codecs"].is_array());
    let consumer_id = string_field(&consumed, "consumerId")?;

    let resumed = bob
        .request(
            json!({"type": "RESUME", "consumerId": consumer_id}),
            "CONSUMER_RESUMED",
        )
        .await?;
    assert_eq!(resumed["consumerId"], consumer_id);

    alice.close().await?;

    let left = bob.recv_type("PEER_LEFT").await?;
    assert_eq!(left["peerId"], alice_peer_id);
    assert_eq!(left["producerIds"], json!([producer_id]));
    assert_eq!(left["consumerIds"], json!([consumer_id]));
    assert_eq!(server.room_count().await, 1, "bob keeps the room alive");

    bob.close().await?;
    assert!(server.wait_for_room_count(0, SETTLE).await);
    assert!(server.wait_for_session_count(0, SETTLE).await);

    Ok(())
}

#[tokio::test]
async fn test_late_joiner_receives_existing_producers() -> Result<(), anyhow::Error> {
    let server = TestSfuServer::spawn().await?;
    let mut alice = SignalingClient::connect(&server.ws_url_for("alice")).await?;

    alice.join_room("r1").await?;
    let transport = alice.open_send_transport().await?;
    let producer_id = alice.produce_video(&transport).await?;

    let mut bob = SignalingClient::connect(&server.ws_url_for("bob")).await?;
    let joined = bob.join_room("r1").await?;

    let producers = joined["producers"].as_array().unwrap();
    assert_eq!(producers.len(), 1);
    assert_eq!(producers[0]["producerId"], producer_id);
    assert_eq!(producers[0]["kind"], "video");

    Ok(())
}

#[tokio::test]
async fn test_rooms_are_isolated() -> Result<(), anyhow::Error> {
    let server = TestSfuServer::spawn().await?;
    let mut alice = SignalingClient::connect(&server.ws_url_for("alice")).await?;
    let mut bob = SignalingClient::connect(&server.ws_url_for("bob")).await?;

    alice.join_room("r1").await?;
    bob.join_room("r2").await?;
    assert_eq!(server.room_count().await, 2);

    let transport = alice.open_send_transport().await?;
    alice.produce_video(&transport).await?;
    bob.expect_silence(QUIET).await?;

    Ok(())
}

#[tokio::test]
async fn test_rooms_spread_across_workers_round_robin() -> Result<(), anyhow::Error> {
    let server = TestSfuServer::spawn().await?;

    let mut clients = Vec::new();
    for i in 0..4 {
        let mut client =
            SignalingClient::connect(&server.ws_url_for(&format!("user-{i}"))).await?;
        client.join_room(&format!("room-{i}")).await?;
        clients.push(client);
    }

    let engine = server.engine();
    assert_eq!(engine.worker(0).unwrap().routers_created(), 2);
    assert_eq!(engine.worker(1).unwrap().routers_created(), 2);

    Ok(())
}

#[tokio::test]
async fn test_exit_room_keeps_connection_open() -> Result<(), anyhow::Error> {
    let server = TestSfuServer::spawn().await?;
    let mut alice = SignalingClient::connect(&server.ws_url_for("alice")).await?;
    let mut bob = SignalingClient::connect(&server.ws_url_for("bob")).await?;

    alice.join_room("r1").await?;
    bob.join_room("r1").await?;

    let transport = alice.open_send_transport().await?;
    let producer_id = alice.produce_video(&transport).await?;
    bob.recv_type("NEW_PEER_PRODUCER").await?;

    let exited = alice
        .request(json!({"type": "EXIT_ROOM"}), "ROOM_EXITED")
        .await?;
    assert_eq!(exited["roomId"], "r1");

    let left = bob.recv_type("PEER_LEFT").await?;
    assert_eq!(left["producerIds"], json!([producer_id]));

    // Same connection, new room.
    let joined = alice.join_room("r2").await?;
    assert_eq!(joined["roomId"], "r2");
    assert_eq!(server.room_count().await, 2);

    Ok(())
}

#[tokio::test]
async fn test_second_join_rejected() -> Result<(), anyhow::Error> {
    let server = TestSfuServer::spawn().await?;
    let mut alice = SignalingClient::connect(&server.ws_url_for("alice")).await?;

    alice.join_room("r1").await?;
    let error = alice
        .request(json!({"type": "JOIN_ROOM", "roomId": "r2"}), "ERROR")
        .await?;
    assert_eq!(error["code"], "PROTOCOL_ERROR");
    assert_eq!(error["requestType"], "JOIN_ROOM");
    assert_eq!(server.room_count().await, 1);

    Ok(())
}

#[tokio::test]
async fn test_chat_reaches_other_members() -> Result<(), anyhow::Error> {
    let server = TestSfuServer::spawn().await?;
    let mut alice =
        SignalingClient::connect(&server.ws_url(&server.token_for("alice", Some("Alice")))).await?;
    let mut bob = SignalingClient::connect(&server.ws_url_for("bob")).await?;

    alice.join_room("r1").await?;
    bob.join_room("r1").await?;

    alice
        .send(json!({"type": "MESSAGE", "message": "hello"}))
        .await?;

    let message = bob.recv_type("MESSAGE").await?;
    assert_eq!(message["userId"], "alice");
    assert_eq!(message["displayName"], "Alice");
    assert_eq!(message["text"], "hello");
    alice.expect_silence(QUIET).await?;

    Ok(())
}
