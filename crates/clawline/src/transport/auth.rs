// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Bearer-token auth middleware for the Stream Catalog HTTP surface.
//! `/ws` negotiates its own auth via the `auth` frame; `/version` and the
//! Outbound Send surface are exempt (the latter uses its own service
//! token, checked in `outbound::send_message`).

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use std::sync::Arc;

use crate::error::{ErrorCode, ErrorResponse};
use crate::pairing::token::TokenClaims;
use crate::transport::state::AppState;

fn epoch_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

fn unauthorized(message: &str) -> Response {
    let body = ErrorResponse {
        error: crate::error::ErrorBody { code: ErrorCode::AuthFailed.as_str().to_owned(), message: message.to_owned() },
    };
    (StatusCode::UNAUTHORIZED, Json(body)).into_response()
}

/// Axum middleware enforcing device-token bearer auth on the Stream
/// Catalog HTTP routes. Skips `/version`, `/ws`, and the Outbound Send
/// surface, which authenticate themselves.
pub async fn auth_layer(State(state): State<Arc<AppState>>, req: Request, next: Next) -> Response {
    let path = req.uri().path();
    if path == "/version" || path == "/ws" || path.starts_with("/api/outbound/") {
        return next.run(req).await;
    }

    let token = match req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
    {
        Some(token) => token,
        None => return unauthorized("missing bearer token"),
    };

    let claims: TokenClaims = match state.pairing.verify_token(token, epoch_secs()) {
        Some(claims) => claims,
        None => return unauthorized("invalid or expired token"),
    };

    if state.pairing.is_denylisted(&claims.device_id) {
        return unauthorized("device has been revoked");
    }

    let mut req = req;
    req.extensions_mut().insert(claims);
    next.run(req).await
}
