// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Outbound Send: a service-authenticated HTTP surface that lets the
//! backend agent runtime push an assistant message directly into a
//! user's event log, bypassing the per-device ingestion queue (spec §1
//! "backend agent runtime" integration point; not modelled as a client
//! WebSocket frame since no device originates it).

use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::assets;
use crate::attachments::{self, NormalizedAttachment};
use crate::db;
use crate::error::{ApiError, ErrorCode};
use crate::fanout::{self, MessagePayload};
use crate::ids;
use crate::transport::state::AppState;
use crate::transport::ws_msg::Attachment;

#[derive(Debug, Deserialize)]
pub struct OutboundMessageRequest {
    #[serde(rename = "userId")]
    user_id: String,
    #[serde(rename = "sessionKey")]
    session_key: Option<String>,
    role: String,
    content: String,
    #[serde(default)]
    attachments: Vec<Attachment>,
}

#[derive(Debug, Serialize)]
pub struct OutboundMessageResponse {
    #[serde(rename = "serverEventId")]
    server_event_id: String,
    #[serde(rename = "serverSequence")]
    server_sequence: i64,
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    let mut acc = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        acc |= x ^ y;
    }
    acc == 0
}

fn validate_outbound_token(headers: &HeaderMap, expected: Option<&str>) -> Result<(), ApiError> {
    let Some(expected) = expected else {
        return Err(ApiError::new(ErrorCode::ServerError, "outbound surface is not configured"));
    };
    let header = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::new(ErrorCode::AuthFailed, "missing authorization header"))?;
    let token = header
        .strip_prefix("Bearer ")
        .ok_or_else(|| ApiError::new(ErrorCode::AuthFailed, "expected a bearer token"))?;
    if constant_time_eq(token, expected) {
        Ok(())
    } else {
        Err(ApiError::new(ErrorCode::AuthFailed, "invalid outbound token"))
    }
}

/// `POST /api/outbound/messages`.
pub async fn send_message(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<OutboundMessageRequest>,
) -> impl IntoResponse {
    match handle(&state, &headers, req).await {
        Ok(body) => (StatusCode::ACCEPTED, Json(body)).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn handle(state: &AppState, headers: &HeaderMap, req: OutboundMessageRequest) -> Result<OutboundMessageResponse, ApiError> {
    validate_outbound_token(headers, state.config.outbound_token.as_deref())?;

    if req.role != "assistant" {
        return Err(ApiError::new(ErrorCode::InvalidMessage, "outbound messages must have role \"assistant\""));
    }
    if req.content.len() > state.config.max_message_bytes {
        return Err(ApiError::new(ErrorCode::PayloadTooLarge, "content exceeds maxMessageBytes"));
    }

    let session_key = match req.session_key {
        Some(key) => ids::rewrite_legacy_stream_key(&key),
        None => ids::build_stream_key(&state.config.agent_id, &req.user_id, "main"),
    };
    let Some(parts) = ids::parse_stream_key(&session_key) else {
        return Err(ApiError::new(ErrorCode::InvalidMessage, "malformed sessionKey"));
    };

    let mut attachment_refs = Vec::with_capacity(req.attachments.len());
    let now_ms = db::epoch_ms();
    for attachment in &req.attachments {
        match attachments::normalize(attachment, &parts, state.config.max_inline_bytes)? {
            NormalizedAttachment::NewAsset { mime_type, bytes } => {
                let asset_id = assets::store_new(&state.config.assets_dir(), &state.config.tmp_dir(), &bytes)
                    .await
                    .map_err(server_error)?;
                let mut tx = state.pool.begin().await.map_err(server_error)?;
                db::assets::insert(&mut tx, &asset_id, &req.user_id, &mime_type, bytes.len() as i64, "outbound", now_ms)
                    .await
                    .map_err(server_error)?;
                tx.commit().await.map_err(server_error)?;
                attachment_refs.push(Attachment::Asset { asset_id });
            }
            NormalizedAttachment::ExistingAsset { asset_id } => {
                let owned = db::assets::find_owned(&state.pool, &req.user_id, &asset_id).await.map_err(server_error)?;
                if owned.is_none() {
                    return Err(ApiError::new(ErrorCode::AssetNotFound, "referenced asset not found"));
                }
                attachment_refs.push(Attachment::Asset { asset_id });
            }
        }
    }

    let event_id = ids::new_server_event_id();
    let payload = MessagePayload {
        id: event_id.clone(),
        role: "assistant".to_owned(),
        session_key: session_key.clone(),
        timestamp: now_ms,
        streaming: false,
        content: req.content,
        attachments: attachment_refs,
        device_id: None,
    };
    let payload_json = payload.to_payload_json().map_err(server_error)?;

    let mut tx = state.pool.begin().await.map_err(server_error)?;
    let event = db::events::append(&mut tx, &event_id, &req.user_id, &session_key, "message", None, &payload_json)
        .await
        .map_err(server_error)?;
    tx.commit().await.map_err(server_error)?;

    fanout::deliver_message(&state.sessions, &req.user_id, &payload, &state.config.admin_global_stream_key).await;

    Ok(OutboundMessageResponse { server_event_id: event_id, server_sequence: event.sequence })
}

fn server_error(e: impl std::fmt::Display) -> ApiError {
    ApiError::new(ErrorCode::ServerError, e.to_string())
}
