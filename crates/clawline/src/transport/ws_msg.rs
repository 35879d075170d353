// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! WebSocket wire message types (spec §6 "WebSocket protocol").

use serde::{Deserialize, Serialize};

use crate::pairing::store::DeviceInfo;

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    PairRequest {
        #[serde(rename = "protocolVersion")]
        protocol_version: u32,
        #[serde(rename = "deviceId")]
        device_id: String,
        #[serde(rename = "deviceInfo")]
        device_info: DeviceInfo,
        #[serde(rename = "claimedName")]
        claimed_name: Option<String>,
    },
    Auth {
        #[serde(rename = "protocolVersion")]
        protocol_version: u32,
        #[serde(rename = "deviceId")]
        device_id: String,
        token: String,
        #[serde(rename = "lastMessageId")]
        last_message_id: Option<String>,
        #[serde(rename = "clientFeatures", default)]
        client_features: Vec<String>,
    },
    Message {
        id: String,
        content: String,
        #[serde(rename = "sessionKey")]
        session_key: Option<String>,
        #[serde(default)]
        attachments: Vec<Attachment>,
    },
    #[serde(rename = "interactive-callback")]
    InteractiveCallback {
        #[serde(rename = "messageId")]
        message_id: String,
        payload: CallbackPayload,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallbackPayload {
    pub action: String,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Attachment {
    Image {
        #[serde(rename = "mimeType")]
        mime_type: String,
        data: String,
    },
    Document {
        #[serde(rename = "mimeType")]
        mime_type: String,
        data: String,
    },
    Asset {
        #[serde(rename = "assetId")]
        asset_id: String,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    PairResult(PairResult),
    AuthResult(AuthResult),
    SessionInfo {
        #[serde(rename = "userId")]
        user_id: String,
        #[serde(rename = "isAdmin")]
        is_admin: bool,
        #[serde(rename = "dmScope")]
        dm_scope: bool,
        #[serde(rename = "sessionKeys")]
        session_keys: Vec<String>,
    },
    StreamSnapshot {
        streams: Vec<StreamSummary>,
    },
    StreamCreated {
        stream: StreamSummary,
    },
    StreamUpdated {
        stream: StreamSummary,
    },
    StreamDeleted {
        #[serde(rename = "sessionKey")]
        session_key: String,
    },
    Message {
        id: String,
        role: String,
        #[serde(rename = "sessionKey")]
        session_key: String,
        timestamp: i64,
        streaming: bool,
        content: String,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        attachments: Vec<Attachment>,
        #[serde(rename = "deviceId", skip_serializing_if = "Option::is_none")]
        device_id: Option<String>,
    },
    Ack {
        id: String,
    },
    Event {
        event: String,
        payload: serde_json::Value,
    },
    Error {
        code: String,
        message: String,
        #[serde(rename = "messageId", skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum PairResult {
    Success {
        success: bool,
        token: String,
        #[serde(rename = "userId")]
        user_id: String,
    },
    Failure {
        success: bool,
        reason: &'static str,
    },
}

impl PairResult {
    pub fn success(token: String, user_id: String) -> Self {
        Self::Success { success: true, token, user_id }
    }

    pub fn failure(reason: &'static str) -> Self {
        Self::Failure { success: false, reason }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum AuthResult {
    Success {
        success: bool,
        #[serde(rename = "userId")]
        user_id: String,
        #[serde(rename = "sessionId")]
        session_id: String,
        #[serde(rename = "isAdmin")]
        is_admin: bool,
        #[serde(rename = "replayCount")]
        replay_count: usize,
        #[serde(rename = "replayTruncated")]
        replay_truncated: bool,
        #[serde(rename = "historyReset")]
        history_reset: bool,
        features: Vec<String>,
        #[serde(rename = "dmScope")]
        dm_scope: bool,
        #[serde(rename = "sessionKeys")]
        session_keys: Vec<String>,
    },
    Failure {
        success: bool,
        reason: &'static str,
    },
}

impl AuthResult {
    pub fn failure(reason: &'static str) -> Self {
        Self::Failure { success: false, reason }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamSummary {
    #[serde(rename = "sessionKey")]
    pub session_key: String,
    #[serde(rename = "displayName")]
    pub display_name: String,
    pub kind: String,
    #[serde(rename = "orderIndex")]
    pub order_index: i64,
    #[serde(rename = "isBuiltIn")]
    pub is_built_in: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_request_deserializes_from_wire_shape() {
        let json = r#"{"type":"pair_request","protocolVersion":1,"deviceId":"00000000-0000-4000-8000-000000000001","deviceInfo":{"platform":"ios","model":"iPhone"}}"#;
        let msg: ClientMessage = serde_json::from_str(json).expect("parse");
        assert!(matches!(msg, ClientMessage::PairRequest { protocol_version: 1, .. }));
    }

    #[test]
    fn message_frame_round_trips_session_key() {
        let json = r#"{"type":"message","id":"c_1","content":"hi","sessionKey":"agent:main:clawline:flynn:main"}"#;
        let msg: ClientMessage = serde_json::from_str(json).expect("parse");
        match msg {
            ClientMessage::Message { session_key, .. } => {
                assert_eq!(session_key.as_deref(), Some("agent:main:clawline:flynn:main"));
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn pair_result_success_serializes_tagged() {
        let msg = ServerMessage::PairResult(PairResult::success("tok".to_owned(), "flynn".to_owned()));
        let json = serde_json::to_string(&msg).expect("serialize");
        assert!(json.contains("\"type\":\"pair_result\""));
        assert!(json.contains("\"success\":true"));
    }

    #[test]
    fn error_frame_omits_message_id_when_absent() {
        let msg = ServerMessage::Error { code: "auth_failed".to_owned(), message: "nope".to_owned(), message_id: None };
        let json = serde_json::to_string(&msg).expect("serialize");
        assert!(!json.contains("messageId"));
    }
}
