//! Malformed and out-of-sequence client messages.
//!
//! Each is answered with one `ERROR` and the connection stays usable.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]

use serde_json::{json, Value};
use sfu_test_utils::{
    incompatible_capabilities, video_rtp_parameters, SignalingClient, TestSfuServer,
};
use std::time::Duration;

const QUIET: Duration = Duration::from_millis(200);

async fn connect(server: &TestSfuServer, user: &str) -> SignalingClient {
    SignalingClient::connect(&server.ws_url_for(user))
        .await
        .unwrap()
}

async fn expect_error(client: &mut SignalingClient, code: &str) -> Value {
    let error = client.recv_type("ERROR").await.unwrap();
    assert_eq!(error["code"], code, "unexpected error {error}");
    error
}

#[tokio::test]
async fn test_malformed_json() {
    let server = TestSfuServer::spawn().await.unwrap();
    let mut client = connect(&server, "alice").await;

    client.send_raw("{not json".to_string()).await.unwrap();
    let error = expect_error(&mut client, "PROTOCOL_ERROR").await;
    assert!(error.get("requestType").is_none());

    // Still serving.
    client.join_room("r1").await.unwrap();
}

#[tokio::test]
async fn test_non_object_and_missing_type() {
    let server = TestSfuServer::spawn().await.unwrap();
    let mut client = connect(&server, "alice").await;

    client.send(json!(["JOIN_ROOM"])).await.unwrap();
    expect_error(&mut client, "PROTOCOL_ERROR").await;

    client.send(json!({"roomId": "r1"})).await.unwrap();
    expect_error(&mut client, "PROTOCOL_ERROR").await;
}

#[tokio::test]
async fn test_unknown_type_named_in_error() {
    let server = TestSfuServer::spawn().await.unwrap();
    let mut client = connect(&server, "alice").await;

    client.send(json!({"type": "DANCE"})).await.unwrap();
    let error = expect_error(&mut client, "PROTOCOL_ERROR").await;
    assert_eq!(error["requestType"], "DANCE");
}

#[tokio::test]
async fn test_missing_and_mistyped_fields() {
    let server = TestSfuServer::spawn().await.unwrap();
    let mut client = connect(&server, "alice").await;

    client.send(json!({"type": "JOIN_ROOM"})).await.unwrap();
    let error = expect_error(&mut client, "PROTOCOL_ERROR").await;
    assert_eq!(error["requestType"], "JOIN_ROOM");

    client
        .send(json!({"type": "JOIN_ROOM", "roomId": 7}))
        .await
        .unwrap();
    expect_error(&mut client, "PROTOCOL_ERROR").await;

    client
        .send(json!({"type": "JOIN_ROOM", "roomId": ""}))
        .await
        .unwrap();
    expect_error(&mut client, "PROTOCOL_ERROR").await;

    assert_eq!(server.room_count().await, 0);
}

#[tokio::test]
async fn test_binary_frame_rejected() {
    let server = TestSfuServer::spawn().await.unwrap();
    let mut client = connect(&server, "alice").await;

    client.send_binary(vec![1, 2, 3]).await.unwrap();
    expect_error(&mut client, "PROTOCOL_ERROR").await;

    client.join_room("r1").await.unwrap();
}

#[tokio::test]
async fn test_media_requests_before_join() {
    let server = TestSfuServer::spawn().await.unwrap();
    let mut client = connect(&server, "alice").await;

    for request in [
        json!({"type": "REQUEST_SEND_TRANSPORT"}),
        json!({"type": "REQUEST_RECEIVE_TRANSPORT"}),
        json!({
            "type": "PRODUCE_MEDIA",
            "transportId": "t1",
            "kind": "video",
            "rtpParameters": video_rtp_parameters(),
        }),
        json!({"type": "MESSAGE", "message": "hi"}),
    ] {
        let request_type = request["type"].clone();
        client.send(request).await.unwrap();
        let error = expect_error(&mut client, "PROTOCOL_ERROR").await;
        assert_eq!(error["requestType"], request_type);
    }
}

#[tokio::test]
async fn test_unknown_transport() {
    let server = TestSfuServer::spawn().await.unwrap();
    let mut client = connect(&server, "alice").await;
    client.join_room("r1").await.unwrap();

    client
        .send(json!({
            "type": "PRODUCE_MEDIA",
            "transportId": "missing",
            "kind": "video",
            "rtpParameters": video_rtp_parameters(),
        }))
        .await
        .unwrap();
    let error = expect_error(&mut client, "NOT_FOUND").await;
    assert_eq!(error["message"], "Transport not found");
}

#[tokio::test]
async fn test_consume_unknown_producer_and_incompatible_capabilities() {
    let server = TestSfuServer::spawn().await.unwrap();
    let mut alice = connect(&server, "alice").await;
    let mut bob = connect(&server, "bob").await;
    alice.join_room("r1").await.unwrap();
    bob.join_room("r1").await.unwrap();

    let send = alice.open_send_transport().await.unwrap();
    let producer_id = alice.produce_video(&send).await.unwrap();
    bob.recv_type("NEW_PEER_PRODUCER").await.unwrap();

    let recv = bob.open_receive_transport().await.unwrap();

    bob.send(json!({
        "type": "CONSUME_MEDIA",
        "transportId": recv,
        "producerId": "missing",
        "rtpCapabilities": incompatible_capabilities(),
    }))
    .await
    .unwrap();
    expect_error(&mut bob, "NOT_FOUND").await;

    bob.send(json!({
        "type": "CONSUME_MEDIA",
        "transportId": recv,
        "producerId": producer_id,
        "rtpCapabilities": incompatible_capabilities(),
    }))
    .await
    .unwrap();
    let error = expect_error(&mut bob, "CAPABILITY_MISMATCH").await;
    assert_eq!(error["requestType"], "CONSUME_MEDIA");

    // The failure stays with bob.
    alice.expect_silence(QUIET).await.unwrap();
}

#[tokio::test]
async fn test_resume_and_close_unknown_ids_are_silent() {
    let server = TestSfuServer::spawn().await.unwrap();
    let mut client = connect(&server, "alice").await;
    client.join_room("r1").await.unwrap();

    client
        .send(json!({"type": "RESUME", "consumerId": "ghost"}))
        .await
        .unwrap();
    client
        .send(json!({"type": "CLOSE_PRODUCER", "producerId": "ghost"}))
        .await
        .unwrap();
    client.expect_silence(QUIET).await.unwrap();

    client.open_send_transport().await.unwrap();
}

#[tokio::test]
async fn test_oversized_chat_rejected() {
    let server = TestSfuServer::spawn().await.unwrap();
    let mut alice = connect(&server, "alice").await;
    let mut bob = connect(&server, "bob").await;
    alice.join_room("r1").await.unwrap();
    bob.join_room("r1").await.unwrap();

    alice
        .send(json!({"type": "MESSAGE", "message": "x".repeat(4097)}))
        .await
        .unwrap();
    expect_error(&mut alice, "PROTOCOL_ERROR").await;
    bob.expect_silence(QUIET).await.unwrap();
}

#[tokio::test]
async fn test_connect_transport_twice() {
    let server = TestSfuServer::spawn().await.unwrap();
    let mut client = connect(&server, "alice").await;
    client.join_room("r1").await.unwrap();

    let transport = client.open_send_transport().await.unwrap();
    client
        .send(json!({
            "type": "CONNECT_PRODUCER_TRANSPORT",
            "transportId": transport,
            "dtlsParameters": sfu_test_utils::dtls_parameters(),
        }))
        .await
        .unwrap();
    expect_error(&mut client, "PROTOCOL_ERROR").await;
}
