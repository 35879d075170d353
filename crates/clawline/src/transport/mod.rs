// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! API contract types and server implementation for HTTP and WebSocket transports.

pub mod auth;
pub mod http;
pub mod state;
pub mod ws;
pub mod ws_msg;

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::middleware;
use axum::routing::{get, patch, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::outbound;
use state::AppState;

/// Body size cap for the Stream Catalog HTTP surface (spec §4.9: "body
/// size capped at 16 KB").
const STREAM_API_BODY_LIMIT_BYTES: usize = 16 * 1024;

/// Build the axum `Router` with every HTTP and WebSocket route, the
/// bearer-auth middleware, and CORS permissive enough for a localhost
/// client running from an arbitrary origin (spec §1 "localhost-first").
pub fn build_router(state: Arc<AppState>) -> Router {
    let stream_routes = Router::new()
        .route("/api/streams", get(http::list_streams).post(http::create_stream))
        .route("/api/streams/{sessionKey}", patch(http::rename_stream).delete(http::delete_stream))
        .layer(DefaultBodyLimit::max(STREAM_API_BODY_LIMIT_BYTES));

    Router::new()
        .route("/version", get(http::version))
        .route("/ws", get(ws::ws_handler))
        .merge(stream_routes)
        .route("/api/outbound/messages", post(outbound::send_message))
        .layer(middleware::from_fn_with_state(state.clone(), auth::auth_layer))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
