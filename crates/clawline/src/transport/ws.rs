// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! WebSocket upgrade handler and per-connection event loop (spec §4.1
//! "pair_request over the socket", §4.4 "Auth / replay", §4.6 "message
//! frames").

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::attachments::strip_unsupported_attachments;
use crate::db;
use crate::db::streams::StreamKind;
use crate::error::ErrorCode;
use crate::event_log::{self, ReplayResult};
use crate::fanout::MessagePayload;
use crate::ids;
use crate::ingestion;
use crate::pairing::{PairOutcome, PairingEvent};
use crate::session::{Session, SessionRegistry};
use crate::stream_catalog;
use crate::transport::state::AppState;
use crate::transport::ws_msg::{AuthResult, ClientMessage, PairResult, ServerMessage};

const PROTOCOL_VERSION: u32 = 1;

type WsSink = SplitSink<WebSocket, Message>;
type WsStream = SplitStream<WebSocket>;

fn epoch_secs() -> i64 {
    std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default().as_secs() as i64
}

pub async fn ws_handler(State(state): State<Arc<AppState>>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(state, socket))
}

async fn send_json(tx: &mut WsSink, message: &ServerMessage) -> Result<(), axum::Error> {
    let text = serde_json::to_string(message).unwrap_or_else(|_| "{}".to_owned());
    tx.send(Message::Text(text.into())).await
}

async fn handle_connection(state: Arc<AppState>, socket: WebSocket) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let Some((session, mut outbox_rx)) = negotiate(&state, &mut ws_tx, &mut ws_rx).await else {
        return;
    };

    let device_id = session.device_id.clone();
    let cancel = session.cancel.clone();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let frame = CloseFrame { code: 4001, reason: "session_replaced".into() };
                let _ = ws_tx.send(Message::Close(Some(frame))).await;
                break;
            }
            outgoing = outbox_rx.recv() => {
                match outgoing {
                    Some(message) => {
                        if send_json(&mut ws_tx, &message).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            incoming = ws_rx.next() => {
                let incoming = match incoming {
                    Some(Ok(m)) => m,
                    Some(Err(_)) | None => break,
                };
                match incoming {
                    Message::Text(text) => {
                        if handle_authenticated_frame(&state, &session, &text, &mut ws_tx).await.is_err() {
                            break;
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        }
    }

    state.sessions.deregister(&device_id).await;
}

/// Pre-auth phase: accept `pair_request` and `auth` frames until an `auth`
/// frame produces a registered session, or the socket closes first.
async fn negotiate(
    state: &Arc<AppState>,
    ws_tx: &mut WsSink,
    ws_rx: &mut WsStream,
) -> Option<(Arc<Session>, mpsc::UnboundedReceiver<ServerMessage>)> {
    loop {
        let text = match ws_rx.next().await {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(_))) | None => return None,
            Some(Err(_)) => return None,
            Some(Ok(_)) => continue,
        };

        let client_msg: ClientMessage = match serde_json::from_str(&text) {
            Ok(m) => m,
            Err(_) => {
                let _ = send_json(
                    ws_tx,
                    &ServerMessage::Error { code: ErrorCode::InvalidMessage.as_str().to_owned(), message: "invalid message".to_owned(), message_id: None },
                )
                .await;
                continue;
            }
        };

        match client_msg {
            ClientMessage::PairRequest { protocol_version, device_id, device_info, claimed_name } => {
                if !handle_pair_request(state, ws_tx, ws_rx, protocol_version, device_id, device_info, claimed_name).await {
                    return None;
                }
            }
            ClientMessage::Auth { protocol_version, device_id, token, last_message_id, client_features } => {
                return handle_auth(state, ws_tx, protocol_version, device_id, token, last_message_id, client_features).await;
            }
            _ => {
                let _ = send_json(
                    ws_tx,
                    &ServerMessage::Error {
                        code: ErrorCode::AuthFailed.as_str().to_owned(),
                        message: "must pair_request or auth before sending other frames".to_owned(),
                        message_id: None,
                    },
                )
                .await;
            }
        }
    }
}

/// Handle one `pair_request` frame, including the wait for operator
/// approval when the device lands in `Pending` (spec §4.1). Returns
/// `false` if the connection should be torn down.
async fn handle_pair_request(
    state: &Arc<AppState>,
    ws_tx: &mut WsSink,
    ws_rx: &mut WsStream,
    protocol_version: u32,
    device_id: String,
    device_info: crate::pairing::store::DeviceInfo,
    claimed_name: Option<String>,
) -> bool {
    if protocol_version != PROTOCOL_VERSION {
        let _ = send_json(ws_tx, &ServerMessage::PairResult(PairResult::failure("unsupported_protocol_version"))).await;
        return false;
    }
    if !ids::is_valid_device_id(&device_id) {
        let _ = send_json(ws_tx, &ServerMessage::PairResult(PairResult::failure("invalid_device_id"))).await;
        return false;
    }
    if !state.pair_limiter.check(&device_id, std::time::Instant::now()) {
        let _ = send_json(ws_tx, &ServerMessage::PairResult(PairResult::failure("rate_limited"))).await;
        return false;
    }

    let mut outcome = match state.pairing.handle_pair_request(
        &device_id,
        device_info,
        claimed_name,
        state.config.reissue_grace_seconds as i64,
        state.config.max_pending_requests as u32,
        db::epoch_ms(),
        epoch_secs(),
    ) {
        Ok(outcome) => outcome,
        Err(e) => {
            warn!(error = %e, "pair_request handling failed");
            let _ = send_json(ws_tx, &ServerMessage::PairResult(PairResult::failure("server_error"))).await;
            return false;
        }
    };

    if matches!(outcome, PairOutcome::Pending) {
        match wait_for_approval(state, ws_rx, &device_id).await {
            ApprovalWait::Resolved => {
                outcome = match state.pairing.handle_pair_request(
                    &device_id,
                    crate::pairing::store::DeviceInfo { platform: "unknown".to_owned(), model: "unknown".to_owned(), os_version: None, app_version: None },
                    None,
                    state.config.reissue_grace_seconds as i64,
                    state.config.max_pending_requests as u32,
                    db::epoch_ms(),
                    epoch_secs(),
                ) {
                    Ok(o) => o,
                    Err(_) => PairOutcome::Rejected,
                };
            }
            ApprovalWait::TimedOut => {
                let _ = send_json(ws_tx, &ServerMessage::PairResult(PairResult::failure("timed_out"))).await;
                return false;
            }
            ApprovalWait::Disconnected => return false,
        }
    }

    match outcome {
        PairOutcome::Issued { token, user_id, .. } => {
            let _ = send_json(ws_tx, &ServerMessage::PairResult(PairResult::success(token, user_id))).await;
            true
        }
        PairOutcome::Pending => {
            let _ = send_json(ws_tx, &ServerMessage::PairResult(PairResult::failure("pending"))).await;
            true
        }
        PairOutcome::RateLimited => {
            let _ = send_json(ws_tx, &ServerMessage::PairResult(PairResult::failure("rate_limited"))).await;
            false
        }
        PairOutcome::Rejected => {
            let _ = send_json(ws_tx, &ServerMessage::PairResult(PairResult::failure("rejected"))).await;
            false
        }
    }
}

enum ApprovalWait {
    Resolved,
    TimedOut,
    Disconnected,
}

/// Hold a pending socket open while watching for an operator decision on
/// `device_id`, bounded by `pendingSocketTimeoutSeconds` (spec §4.1).
async fn wait_for_approval(state: &Arc<AppState>, ws_rx: &mut WsStream, device_id: &str) -> ApprovalWait {
    let mut events = state.pairing.subscribe();
    let timeout = tokio::time::sleep(Duration::from_secs(state.config.pending_socket_timeout_seconds));
    tokio::pin!(timeout);

    loop {
        tokio::select! {
            _ = &mut timeout => return ApprovalWait::TimedOut,
            event = events.recv() => {
                match event {
                    Ok(PairingEvent::AllowlistChanged { device_id: changed }) if changed == device_id || changed.is_empty() => {
                        return ApprovalWait::Resolved;
                    }
                    Ok(PairingEvent::DenylistChanged { device_id: changed }) if changed == device_id => {
                        return ApprovalWait::Resolved;
                    }
                    Ok(_) => continue,
                    Err(_) => continue,
                }
            }
            frame = ws_rx.next() => {
                match frame {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return ApprovalWait::Disconnected,
                    _ => continue,
                }
            }
        }
    }
}

/// Handle the `auth` frame: verify the token, seed built-in streams,
/// register the session, and push `auth_result` plus the replay window
/// (spec §4.4).
async fn handle_auth(
    state: &Arc<AppState>,
    ws_tx: &mut WsSink,
    protocol_version: u32,
    device_id: String,
    token: String,
    last_message_id: Option<String>,
    client_features: Vec<String>,
) -> Option<(Arc<Session>, mpsc::UnboundedReceiver<ServerMessage>)> {
    if protocol_version != PROTOCOL_VERSION {
        let _ = send_json(ws_tx, &ServerMessage::AuthResult(AuthResult::failure("unsupported_protocol_version"))).await;
        return None;
    }

    let claims = match state.pairing.verify_token(&token, epoch_secs()) {
        Some(c) => c,
        None => {
            let _ = send_json(ws_tx, &ServerMessage::AuthResult(AuthResult::failure("invalid_token"))).await;
            return None;
        }
    };
    if claims.device_id != device_id {
        let _ = send_json(ws_tx, &ServerMessage::AuthResult(AuthResult::failure("device_mismatch"))).await;
        return None;
    }
    if state.pairing.is_denylisted(&device_id) {
        let _ = send_json(ws_tx, &ServerMessage::AuthResult(AuthResult::failure("revoked"))).await;
        return None;
    }

    let now_ms = db::epoch_ms();
    if let Err(e) = stream_catalog::ensure_seeded(
        &state.pool,
        &claims.subject,
        claims.is_admin,
        state.config.dm_scope_enabled,
        &state.config.admin_global_stream_key,
        &state.config.agent_id,
        now_ms,
    )
    .await
    {
        warn!(error = %e, "failed to seed built-in streams");
        let _ = send_json(ws_tx, &ServerMessage::AuthResult(AuthResult::failure("server_error"))).await;
        return None;
    }

    let streams = match stream_catalog::list_for_user(&state.pool, &claims.subject).await {
        Ok(rows) => rows,
        Err(e) => {
            warn!(error = %e, "failed to list streams for auth");
            let _ = send_json(ws_tx, &ServerMessage::AuthResult(AuthResult::failure("server_error"))).await;
            return None;
        }
    };

    let user_stream_keys: Vec<String> = streams.iter().map(|s| s.session_key.clone()).collect();
    let visible = SessionRegistry::compute_visible_stream_keys(&user_stream_keys, &state.config.admin_global_stream_key, claims.is_admin);
    let default_stream_key = streams
        .iter()
        .find(|s| s.kind() == StreamKind::Main)
        .map(|s| s.session_key.clone())
        .unwrap_or_else(|| ids::build_stream_key(&state.config.agent_id, &claims.subject, "main"));

    let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
    let session = Arc::new(Session {
        device_id: device_id.clone(),
        session_id: format!("sess_{}", uuid::Uuid::new_v4()),
        user_id: claims.subject.clone(),
        is_admin: tokio::sync::RwLock::new(claims.is_admin),
        visible_stream_keys: tokio::sync::RwLock::new(visible.clone()),
        default_stream_key: tokio::sync::RwLock::new(default_stream_key),
        client_features,
        outbox: outbox_tx,
        cancel: CancellationToken::new(),
    });

    if let Some(evicted) = state.sessions.register(session.clone()).await {
        evicted.send(ServerMessage::Error {
            code: ErrorCode::AuthFailed.as_str().to_owned(),
            message: "session replaced by a newer connection".to_owned(),
            message_id: None,
        });
    }

    let replay = match event_log::replay(
        &state.pool,
        &claims.subject,
        last_message_id.as_deref(),
        state.config.max_replay_messages,
        &state.config.admin_global_stream_key,
        claims.is_admin,
    )
    .await
    {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "replay lookup failed, treating as history reset");
            ReplayResult { events: vec![], history_reset: true, truncated: false }
        }
    };

    let auth_result = ServerMessage::AuthResult(AuthResult::Success {
        success: true,
        user_id: claims.subject.clone(),
        session_id: session.session_id.clone(),
        is_admin: claims.is_admin,
        replay_count: replay.events.len(),
        replay_truncated: replay.truncated,
        history_reset: replay.history_reset,
        features: session.client_features.clone(),
        dm_scope: state.config.dm_scope_enabled,
        session_keys: visible,
    });

    if send_json(ws_tx, &auth_result).await.is_err() {
        state.sessions.deregister(&device_id).await;
        return None;
    }

    for row in &replay.events {
        if row.event_type != "message" {
            continue;
        }
        let payload = match MessagePayload::from_event_row(row) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, event_id = %row.id, "skipping unparsable replay event");
                continue;
            }
        };
        let attachments = strip_unsupported_attachments(payload.attachments.clone(), session.has_feature("terminal_bubbles_v1"));
        let message = ServerMessage::Message {
            id: payload.id,
            role: payload.role,
            session_key: payload.session_key,
            timestamp: payload.timestamp,
            streaming: payload.streaming,
            content: payload.content,
            attachments,
            device_id: payload.device_id,
        };
        if send_json(ws_tx, &message).await.is_err() {
            state.sessions.deregister(&device_id).await;
            return None;
        }
    }

    let snapshot = ServerMessage::StreamSnapshot { streams: streams.iter().map(crate::transport::http::to_summary).collect() };
    if send_json(ws_tx, &snapshot).await.is_err() {
        state.sessions.deregister(&device_id).await;
        return None;
    }

    Some((session, outbox_rx))
}

/// Handle a single post-auth frame: `message` goes through the ingestion
/// pipeline, `interactive-callback` is acknowledged (no server-side
/// behaviour is specified beyond delivery), anything else is rejected.
async fn handle_authenticated_frame(state: &Arc<AppState>, session: &Arc<Session>, text: &str, ws_tx: &mut WsSink) -> Result<(), ()> {
    let client_msg: ClientMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(_) => {
            let _ = send_json(
                ws_tx,
                &ServerMessage::Error { code: ErrorCode::InvalidMessage.as_str().to_owned(), message: "invalid message".to_owned(), message_id: None },
            )
            .await;
            return Ok(());
        }
    };

    match client_msg {
        ClientMessage::Message { id, content, session_key, attachments } => {
            if let Err(err) = ingestion::handle_inbound(
                &state.ingestion,
                &state.pool,
                session,
                &state.message_limiter,
                state.config.max_message_bytes,
                state.config.max_inline_bytes,
                &state.config.admin_global_stream_key,
                id.clone(),
                content,
                session_key,
                attachments,
            )
            .await
            {
                session.send(ServerMessage::Error { code: err.code.as_str().to_owned(), message: err.message, message_id: Some(id) });
            }
        }
        ClientMessage::InteractiveCallback { message_id, .. } => {
            session.send(ServerMessage::Ack { id: message_id });
        }
        ClientMessage::PairRequest { .. } | ClientMessage::Auth { .. } => {
            session.send(ServerMessage::Error {
                code: ErrorCode::InvalidMessage.as_str().to_owned(),
                message: "already authenticated".to_owned(),
                message_id: None,
            });
        }
    }

    Ok(())
}
