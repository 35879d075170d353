// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Black-box end-to-end scenarios against the real `clawline` binary:
//! pairing handshake, auth/replay, message fan-out across multiple
//! devices of the same user, admin-stream enforcement, and the stream
//! catalog's create/delete surface.

use std::time::Duration;

use clawline_specs::{new_device_id, ClawlineProcess};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

const TIMEOUT: Duration = Duration::from_secs(5);

type Ws = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

async fn connect(proc: &ClawlineProcess) -> Ws {
    let (ws, _) = tokio::time::timeout(TIMEOUT, tokio_tungstenite::connect_async(proc.ws_url()))
        .await
        .expect("connect timed out")
        .expect("connect failed");
    ws
}

async fn send_json(ws: &mut Ws, value: Value) {
    ws.send(WsMessage::Text(value.to_string().into())).await.expect("send");
}

async fn recv_json(ws: &mut Ws) -> Value {
    loop {
        let msg = tokio::time::timeout(TIMEOUT, ws.next())
            .await
            .expect("recv timed out")
            .expect("stream closed")
            .expect("ws error");
        match msg {
            WsMessage::Text(text) => return serde_json::from_str(&text).expect("valid json frame"),
            WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

/// Pair a fresh device end to end: send `pair_request`, approve it out of
/// band the way an operator tool would, then wait for the pending socket
/// to resolve with the issued token.
async fn pair_and_wait_for_token(proc: &ClawlineProcess, device_id: &str, user_id: &str, is_admin: bool) -> String {
    let mut ws = connect(proc).await;
    send_json(
        &mut ws,
        json!({
            "type": "pair_request",
            "protocolVersion": 1,
            "deviceId": device_id,
            "deviceInfo": {"platform": "ios", "model": "iPhone"},
        }),
    )
    .await;

    let first = recv_json(&mut ws).await;
    assert_eq!(first["type"], "pair_result");
    if first["success"] == true {
        return first["token"].as_str().expect("token present").to_owned();
    }

    proc.approve_device(device_id, user_id, is_admin).expect("approve");
    let resolved = recv_json(&mut ws).await;
    assert_eq!(resolved["type"], "pair_result");
    assert_eq!(resolved["success"], true);
    resolved["token"].as_str().expect("token present").to_owned()
}

async fn authenticate(ws: &mut Ws, device_id: &str, token: &str) -> Value {
    send_json(
        ws,
        json!({
            "type": "auth",
            "protocolVersion": 1,
            "deviceId": device_id,
            "token": token,
        }),
    )
    .await;
    let auth_result = recv_json(ws).await;
    assert_eq!(auth_result["type"], "auth_result");
    assert_eq!(auth_result["success"], true);
    auth_result
}

/// Drain the `stream_snapshot` frame that always follows a successful
/// `auth_result` (spec §4.4).
async fn drain_snapshot(ws: &mut Ws) -> Value {
    let snapshot = recv_json(ws).await;
    assert_eq!(snapshot["type"], "stream_snapshot");
    snapshot
}

#[tokio::test]
async fn bootstrap_pair_then_auth_yields_session_and_snapshot() {
    let proc = ClawlineProcess::start().expect("spawn");
    proc.wait_healthy(TIMEOUT).await.expect("healthy");

    let device_id = new_device_id();
    let token = pair_and_wait_for_token(&proc, &device_id, "flynn", true).await;

    let mut ws = connect(&proc).await;
    let auth_result = authenticate(&mut ws, &device_id, &token).await;
    assert_eq!(auth_result["userId"], "flynn");
    assert_eq!(auth_result["isAdmin"], true);
    assert_eq!(auth_result["replayCount"], 0);

    let snapshot = drain_snapshot(&mut ws).await;
    let streams = snapshot["streams"].as_array().expect("streams array");
    assert!(streams.iter().any(|s| s["kind"] == "main" && s["isBuiltIn"] == true));
}

#[tokio::test]
async fn message_round_trip_fans_out_to_second_device_of_same_user() {
    let proc = ClawlineProcess::start().expect("spawn");
    proc.wait_healthy(TIMEOUT).await.expect("healthy");

    let device_a = new_device_id();
    let token_a = pair_and_wait_for_token(&proc, &device_a, "flynn", false).await;
    let mut ws_a = connect(&proc).await;
    authenticate(&mut ws_a, &device_a, &token_a).await;
    drain_snapshot(&mut ws_a).await;

    let device_b = new_device_id();
    let token_b = pair_and_wait_for_token(&proc, &device_b, "flynn", false).await;
    let mut ws_b = connect(&proc).await;
    authenticate(&mut ws_b, &device_b, &token_b).await;
    drain_snapshot(&mut ws_b).await;

    send_json(
        &mut ws_a,
        json!({
            "type": "message",
            "id": "c_1",
            "content": "hello from device a",
            "sessionKey": "agent:main:clawline:flynn:main",
        }),
    )
    .await;

    let ack = recv_json(&mut ws_a).await;
    assert_eq!(ack["type"], "ack");
    assert_eq!(ack["id"], "c_1");

    let echoed = recv_json(&mut ws_b).await;
    assert_eq!(echoed["type"], "message");
    assert_eq!(echoed["content"], "hello from device a");
    assert_eq!(echoed["role"], "user");
}

#[tokio::test]
async fn non_admin_posting_to_admin_stream_is_rejected() {
    let proc = ClawlineProcess::start().expect("spawn");
    proc.wait_healthy(TIMEOUT).await.expect("healthy");

    let device_id = new_device_id();
    let token = pair_and_wait_for_token(&proc, &device_id, "flynn", false).await;
    let mut ws = connect(&proc).await;
    authenticate(&mut ws, &device_id, &token).await;
    drain_snapshot(&mut ws).await;

    send_json(
        &mut ws,
        json!({
            "type": "message",
            "id": "c_1",
            "content": "shouldn't be allowed",
            "sessionKey": "agent:main:clawline:admin:global_dm",
        }),
    )
    .await;

    let error = recv_json(&mut ws).await;
    assert_eq!(error["type"], "error");
    assert_eq!(error["code"], "forbidden");
}

#[tokio::test]
async fn stream_create_is_idempotent_and_visible_in_snapshot_on_reconnect() {
    let proc = ClawlineProcess::start().expect("spawn");
    proc.wait_healthy(TIMEOUT).await.expect("healthy");

    let device_id = new_device_id();
    let token = pair_and_wait_for_token(&proc, &device_id, "flynn", false).await;

    let client = reqwest::Client::new();
    let body = json!({"displayName": "Scratchpad", "idempotencyKey": "idem-1"});

    let first = client
        .post(format!("{}/api/streams", proc.base_url()))
        .bearer_auth(&token)
        .json(&body)
        .send()
        .await
        .expect("create request");
    assert_eq!(first.status(), reqwest::StatusCode::CREATED);
    let first_body: Value = first.json().await.expect("json body");
    let session_key = first_body["sessionKey"].as_str().expect("sessionKey").to_owned();

    let replay = client
        .post(format!("{}/api/streams", proc.base_url()))
        .bearer_auth(&token)
        .json(&body)
        .send()
        .await
        .expect("replay request");
    assert_eq!(replay.status(), reqwest::StatusCode::OK);
    let replay_body: Value = replay.json().await.expect("json body");
    assert_eq!(replay_body["sessionKey"], session_key);

    let mut ws = connect(&proc).await;
    authenticate(&mut ws, &device_id, &token).await;
    let snapshot = drain_snapshot(&mut ws).await;
    let streams = snapshot["streams"].as_array().expect("streams array");
    assert!(streams.iter().any(|s| s["sessionKey"] == session_key));
}

#[tokio::test]
async fn deleting_a_stream_requires_the_user_action_header_and_purges_it() {
    let proc = ClawlineProcess::start().expect("spawn");
    proc.wait_healthy(TIMEOUT).await.expect("healthy");

    let device_id = new_device_id();
    let token = pair_and_wait_for_token(&proc, &device_id, "flynn", false).await;

    let client = reqwest::Client::new();
    let create_body = json!({"displayName": "Scratchpad", "idempotencyKey": "idem-2"});
    let created = client
        .post(format!("{}/api/streams", proc.base_url()))
        .bearer_auth(&token)
        .json(&create_body)
        .send()
        .await
        .expect("create request");
    let created_body: Value = created.json().await.expect("json body");
    let session_key = created_body["sessionKey"].as_str().expect("sessionKey").to_owned();
    let encoded_key = session_key.replace(':', "%3A");

    let without_header = client
        .delete(format!("{}/api/streams/{}", proc.base_url(), encoded_key))
        .bearer_auth(&token)
        .send()
        .await
        .expect("delete without header");
    assert_eq!(without_header.status(), reqwest::StatusCode::PRECONDITION_REQUIRED);

    let deleted = client
        .delete(format!("{}/api/streams/{}", proc.base_url(), encoded_key))
        .bearer_auth(&token)
        .header("x-clawline-user-action", "delete_stream")
        .send()
        .await
        .expect("delete with header");
    assert_eq!(deleted.status(), reqwest::StatusCode::OK);
    let deleted_body: Value = deleted.json().await.expect("json body");
    assert_eq!(deleted_body["deletedSessionKey"], session_key);

    let list = client
        .get(format!("{}/api/streams", proc.base_url()))
        .bearer_auth(&token)
        .send()
        .await
        .expect("list request");
    let list_body: Value = list.json().await.expect("json body");
    let streams = list_body["streams"].as_array().expect("streams array");
    assert!(!streams.iter().any(|s| s["sessionKey"] == session_key));
}

#[tokio::test]
async fn replay_after_reconnect_returns_prior_message() {
    let proc = ClawlineProcess::start().expect("spawn");
    proc.wait_healthy(TIMEOUT).await.expect("healthy");

    let device_id = new_device_id();
    let token = pair_and_wait_for_token(&proc, &device_id, "flynn", false).await;

    let mut ws = connect(&proc).await;
    authenticate(&mut ws, &device_id, &token).await;
    drain_snapshot(&mut ws).await;

    send_json(
        &mut ws,
        json!({
            "type": "message",
            "id": "c_1",
            "content": "remember this",
            "sessionKey": "agent:main:clawline:flynn:main",
        }),
    )
    .await;
    let ack = recv_json(&mut ws).await;
    assert_eq!(ack["type"], "ack");
    drop(ws);

    let mut ws2 = connect(&proc).await;
    let auth_result = authenticate(&mut ws2, &device_id, &token).await;
    assert_eq!(auth_result["replayCount"], 1);

    let replayed = recv_json(&mut ws2).await;
    assert_eq!(replayed["type"], "message");
    assert_eq!(replayed["content"], "remember this");

    drain_snapshot(&mut ws2).await;
}

#[tokio::test]
async fn revoked_device_is_rejected_on_next_auth() {
    let proc = ClawlineProcess::start().expect("spawn");
    proc.wait_healthy(TIMEOUT).await.expect("healthy");

    let device_id = new_device_id();
    let token = pair_and_wait_for_token(&proc, &device_id, "flynn", false).await;
    proc.revoke_device(&device_id).expect("revoke");

    // Give the pairing watcher a moment to pick up the denylist edit.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut ws = connect(&proc).await;
    send_json(
        &mut ws,
        json!({
            "type": "auth",
            "protocolVersion": 1,
            "deviceId": device_id,
            "token": token,
        }),
    )
    .await;
    let auth_result = recv_json(&mut ws).await;
    assert_eq!(auth_result["type"], "auth_result");
    assert_eq!(auth_result["success"], false);
}
