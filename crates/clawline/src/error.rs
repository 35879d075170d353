// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Unified error taxonomy shared across the WebSocket and HTTP transports.

use std::fmt;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

/// Machine-readable error codes from spec §7.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidMessage,
    PayloadTooLarge,
    RateLimited,
    AuthFailed,
    TokenRevoked,
    DeviceNotApproved,
    AssetNotFound,
    StreamNotFound,
    Forbidden,
    StreamLimitReached,
    BuiltInStreamRenameForbidden,
    BuiltInStreamDeleteForbidden,
    LastStreamDeleteForbidden,
    StreamDeleteRequiresUserAction,
    IdempotencyKeyReused,
    WriteQueueFull,
    ServerError,
}

impl ErrorCode {
    pub fn http_status(&self) -> StatusCode {
        match self {
            Self::InvalidMessage => StatusCode::BAD_REQUEST,
            Self::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::AuthFailed => StatusCode::UNAUTHORIZED,
            Self::TokenRevoked => StatusCode::UNAUTHORIZED,
            Self::DeviceNotApproved => StatusCode::FORBIDDEN,
            Self::AssetNotFound => StatusCode::NOT_FOUND,
            Self::StreamNotFound => StatusCode::NOT_FOUND,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::StreamLimitReached => StatusCode::CONFLICT,
            Self::BuiltInStreamRenameForbidden => StatusCode::CONFLICT,
            Self::BuiltInStreamDeleteForbidden => StatusCode::CONFLICT,
            Self::LastStreamDeleteForbidden => StatusCode::CONFLICT,
            Self::StreamDeleteRequiresUserAction => StatusCode::PRECONDITION_REQUIRED,
            Self::IdempotencyKeyReused => StatusCode::CONFLICT,
            Self::WriteQueueFull => StatusCode::SERVICE_UNAVAILABLE,
            Self::ServerError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidMessage => "invalid_message",
            Self::PayloadTooLarge => "payload_too_large",
            Self::RateLimited => "rate_limited",
            Self::AuthFailed => "auth_failed",
            Self::TokenRevoked => "token_revoked",
            Self::DeviceNotApproved => "device_not_approved",
            Self::AssetNotFound => "asset_not_found",
            Self::StreamNotFound => "stream_not_found",
            Self::Forbidden => "forbidden",
            Self::StreamLimitReached => "stream_limit_reached",
            Self::BuiltInStreamRenameForbidden => "built_in_stream_rename_forbidden",
            Self::BuiltInStreamDeleteForbidden => "built_in_stream_delete_forbidden",
            Self::LastStreamDeleteForbidden => "last_stream_delete_forbidden",
            Self::StreamDeleteRequiresUserAction => "stream_delete_requires_user_action",
            Self::IdempotencyKeyReused => "idempotency_key_reused",
            Self::WriteQueueFull => "write_queue_full",
            Self::ServerError => "server_error",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `{error:{code, message}}` envelope used by the HTTP surface.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

/// An [`ErrorCode`] paired with a human-readable message, ready to render
/// on either transport.
#[derive(Debug, Clone)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code.as_str(), self.message)
    }
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.code.http_status();
        let body = ErrorResponse {
            error: ErrorBody { code: self.code.as_str().to_owned(), message: self.message },
        };
        (status, Json(body)).into_response()
    }
}
