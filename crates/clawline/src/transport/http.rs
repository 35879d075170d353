// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Stream Catalog HTTP API (spec §4.3, §4.9): list/create/rename/delete
//! over plain REST, guarded by the device-token bearer middleware in
//! `transport::auth`.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::{Extension, Json};
use serde::{Deserialize, Serialize};

use crate::assets;
use crate::db::streams::StreamRow;
use crate::error::{ApiError, ErrorCode};
use crate::fanout;
use crate::pairing::token::TokenClaims;
use crate::stream_catalog;
use crate::transport::state::AppState;
use crate::transport::ws_msg::StreamSummary;

#[derive(Debug, Serialize)]
pub struct VersionResponse {
    #[serde(rename = "protocolVersion")]
    protocol_version: u32,
}

pub async fn version() -> impl IntoResponse {
    Json(VersionResponse { protocol_version: 1 })
}

pub(crate) fn to_summary(row: &StreamRow) -> StreamSummary {
    StreamSummary {
        session_key: row.session_key.clone(),
        display_name: row.display_name.clone(),
        kind: row.kind.clone(),
        order_index: row.order_index,
        is_built_in: row.is_built_in,
    }
}

#[derive(Debug, Serialize)]
pub struct StreamListResponse {
    streams: Vec<StreamSummary>,
}

/// `GET /api/streams`.
pub async fn list_streams(State(state): State<Arc<AppState>>, Extension(claims): Extension<TokenClaims>) -> impl IntoResponse {
    match stream_catalog::list_for_user(&state.pool, &claims.subject).await {
        Ok(rows) => Json(StreamListResponse { streams: rows.iter().map(to_summary).collect() }).into_response(),
        Err(e) => ApiError::new(ErrorCode::ServerError, e.to_string()).into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateStreamRequest {
    #[serde(rename = "displayName")]
    display_name: String,
    #[serde(rename = "idempotencyKey")]
    idempotency_key: String,
}

/// `POST /api/streams`.
pub async fn create_stream(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<TokenClaims>,
    Json(req): Json<CreateStreamRequest>,
) -> impl IntoResponse {
    let now_ms = crate::db::epoch_ms();
    let outcome = stream_catalog::create_stream(
        &state.pool,
        &claims.subject,
        &state.config.agent_id,
        &req.display_name,
        &req.idempotency_key,
        state.config.max_display_name_bytes,
        state.config.max_streams_per_user,
        now_ms,
    )
    .await;

    match outcome {
        Ok(outcome) => {
            if !outcome.replayed {
                fanout::deliver_stream_created(&state.sessions, &claims.subject, to_summary(&outcome.stream)).await;
            }
            let status = if outcome.replayed { StatusCode::OK } else { StatusCode::CREATED };
            (status, Json(to_summary(&outcome.stream))).into_response()
        }
        Err(e) => e.into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct RenameStreamRequest {
    #[serde(rename = "displayName")]
    display_name: String,
}

/// Percent-decode a path segment, repeating up to `max_passes` times so a
/// stream key that arrived double- or triple-encoded (`%2520...`) still
/// resolves to its canonical `agent:...:clawline:...` form.
fn decode_path_segment(raw: &str, max_passes: u32) -> String {
    let mut current = raw.to_owned();
    for _ in 0..max_passes {
        let decoded = percent_decode_once(&current);
        if decoded == current {
            break;
        }
        current = decoded;
    }
    current
}

fn percent_decode_once(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let (Some(hi), Some(lo)) = (hex_val(bytes[i + 1]), hex_val(bytes[i + 2])) {
                out.push((hi << 4) | lo);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8(out).unwrap_or_else(|_| s.to_owned())
}

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// `PATCH /api/streams/:sessionKey`.
pub async fn rename_stream(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<TokenClaims>,
    Path(session_key): Path<String>,
    Json(req): Json<RenameStreamRequest>,
) -> impl IntoResponse {
    let session_key = decode_path_segment(&session_key, 4);
    let now_ms = crate::db::epoch_ms();
    let result = stream_catalog::rename_stream(
        &state.pool,
        &claims.subject,
        &session_key,
        &req.display_name,
        state.config.max_display_name_bytes,
        now_ms,
    )
    .await;

    match result {
        Ok(row) => {
            fanout::deliver_stream_updated(&state.sessions, &claims.subject, to_summary(&row)).await;
            Json(to_summary(&row)).into_response()
        }
        Err(e) => e.into_response(),
    }
}

/// `DELETE /api/streams/:sessionKey`. Requires the
/// `x-clawline-user-action: delete_stream` confirmation header (spec
/// §4.3) to guard against an automated client deleting a stream without
/// direct user intent.
pub async fn delete_stream(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<TokenClaims>,
    Path(session_key): Path<String>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let confirmed = headers.get("x-clawline-user-action").and_then(|v| v.to_str().ok()) == Some("delete_stream");
    if !confirmed {
        return ApiError::new(ErrorCode::StreamDeleteRequiresUserAction, "missing x-clawline-user-action: delete_stream header")
            .into_response();
    }

    let session_key = decode_path_segment(&session_key, 4);
    let idempotency_key = headers.get("idempotency-key").and_then(|v| v.to_str().ok()).map(str::to_owned);
    let now_ms = crate::db::epoch_ms();

    let result = stream_catalog::delete_stream(&state.pool, &claims.subject, &session_key, idempotency_key.as_deref(), now_ms).await;

    match result {
        Ok(outcome) => {
            for asset_id in &outcome.orphaned_asset_ids {
                if let Err(e) = assets::delete(&state.config.assets_dir(), asset_id).await {
                    tracing::warn!(error = %e, asset_id, "failed to remove orphaned asset file after stream delete");
                }
            }
            fanout::deliver_stream_deleted(&state.sessions, &claims.subject, &outcome.deleted_session_key).await;
            Json(DeleteStreamResponse { deleted_session_key: outcome.deleted_session_key.clone() }).into_response()
        }
        Err(e) => e.into_response(),
    }
}

#[derive(Debug, Serialize)]
pub struct DeleteStreamResponse {
    #[serde(rename = "deletedSessionKey")]
    deleted_session_key: String,
}
