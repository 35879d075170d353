// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Fan-out / Delivery (spec §4.8): route a persisted event to every
//! session subscribed to its stream key, with per-session normalisation.

use serde::{Deserialize, Serialize};

use crate::attachments::strip_unsupported_attachments;
use crate::db::events::EventRow;
use crate::session::{Session, SessionRegistry};
use crate::transport::ws_msg::{Attachment, ServerMessage, StreamSummary};

/// A persisted message event, ready to fan out.
#[derive(Debug, Clone)]
pub struct MessagePayload {
    pub id: String,
    pub role: String,
    pub session_key: String,
    pub timestamp: i64,
    pub streaming: bool,
    pub content: String,
    pub attachments: Vec<Attachment>,
    pub device_id: Option<String>,
}

/// The wire-shaped form of [`MessagePayload`] stored as an event's
/// `payload_json` (spec §4.2: the event log is the durable source for
/// replay, so its payload mirrors the `message` frame exactly).
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredMessage {
    role: String,
    #[serde(rename = "sessionKey")]
    session_key: String,
    streaming: bool,
    content: String,
    #[serde(default)]
    attachments: Vec<Attachment>,
    #[serde(rename = "deviceId", default, skip_serializing_if = "Option::is_none")]
    device_id: Option<String>,
}

impl MessagePayload {
    /// Serialize everything but `id`/`timestamp` (the event row already
    /// carries those as `id`/`timestamp_ms`).
    pub fn to_payload_json(&self) -> anyhow::Result<String> {
        let stored = StoredMessage {
            role: self.role.clone(),
            session_key: self.session_key.clone(),
            streaming: self.streaming,
            content: self.content.clone(),
            attachments: self.attachments.clone(),
            device_id: self.device_id.clone(),
        };
        Ok(serde_json::to_string(&stored)?)
    }

    /// Reconstruct a `MessagePayload` from a stored `message`-type event
    /// row, for replay-on-auth (spec §4.4) and the stream-catalog purge
    /// path's asset bookkeeping.
    pub fn from_event_row(row: &EventRow) -> anyhow::Result<Self> {
        let stored: StoredMessage = serde_json::from_str(&row.payload_json)?;
        Ok(Self {
            id: row.id.clone(),
            role: stored.role,
            session_key: stored.session_key,
            timestamp: row.timestamp_ms,
            streaming: stored.streaming,
            content: stored.content,
            attachments: stored.attachments,
            device_id: stored.device_id,
        })
    }
}

/// Per-session normalisation of a message payload (spec §4.8): drop it
/// outright if it's on the admin stream and the session isn't admin;
/// otherwise strip attachment kinds the session hasn't negotiated.
async fn normalize_for_session(payload: &MessagePayload, session: &Session, admin_global_stream_key: &str) -> Option<ServerMessage> {
    if payload.session_key == admin_global_stream_key && !*session.is_admin.read().await {
        return None;
    }

    let attachments = strip_unsupported_attachments(payload.attachments.clone(), session.has_feature("terminal_bubbles_v1"));

    Some(ServerMessage::Message {
        id: payload.id.clone(),
        role: payload.role.clone(),
        session_key: payload.session_key.clone(),
        timestamp: payload.timestamp,
        streaming: payload.streaming,
        content: payload.content.clone(),
        attachments,
        device_id: payload.device_id.clone(),
    })
}

/// Deliver `payload` to every live session belonging to `user_id`
/// subscribed to its stream key.
pub async fn deliver_message(
    registry: &SessionRegistry,
    user_id: &str,
    payload: &MessagePayload,
    admin_global_stream_key: &str,
) {
    for session in registry.sessions_for_user(user_id).await {
        let visible = session.visible_stream_keys.read().await;
        if !visible.contains(&payload.session_key) {
            continue;
        }
        drop(visible);

        if let Some(message) = normalize_for_session(payload, &session, admin_global_stream_key).await {
            session.send(message);
        }
    }
}

/// Typing/activity signal (spec §4.6 "Typing signal"), ephemeral and
/// never persisted.
pub async fn deliver_activity(registry: &SessionRegistry, user_id: &str, session_key: &str, message_id: &str, is_active: bool) {
    let payload = serde_json::json!({
        "isActive": is_active,
        "messageId": message_id,
        "sessionKey": session_key,
    });
    for session in registry.sessions_for_user(user_id).await {
        session.send(ServerMessage::Event { event: "activity".to_owned(), payload: payload.clone() });
    }
}

pub async fn deliver_stream_created(registry: &SessionRegistry, user_id: &str, stream: StreamSummary) {
    for session in registry.sessions_for_user(user_id).await {
        session.send(ServerMessage::StreamCreated { stream: stream.clone() });
    }
}

pub async fn deliver_stream_updated(registry: &SessionRegistry, user_id: &str, stream: StreamSummary) {
    for session in registry.sessions_for_user(user_id).await {
        session.send(ServerMessage::StreamUpdated { stream: stream.clone() });
    }
}

pub async fn deliver_stream_deleted(registry: &SessionRegistry, user_id: &str, session_key: &str) {
    for session in registry.sessions_for_user(user_id).await {
        session.send(ServerMessage::StreamDeleted { session_key: session_key.to_owned() });
    }
}
