// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Session Manager (spec §4.4): the live WebSocket session registry.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

use crate::transport::ws_msg::ServerMessage;

/// A live, authenticated WebSocket session.
pub struct Session {
    pub device_id: String,
    pub session_id: String,
    pub user_id: String,
    pub is_admin: RwLock<bool>,
    pub visible_stream_keys: RwLock<Vec<String>>,
    pub default_stream_key: RwLock<String>,
    /// Client-negotiated features from the `auth` frame (spec §4.4:
    /// `session_info` is mandatory, `terminal_bubbles_v1` is opt-in).
    /// Fixed for the socket's lifetime; a reconnect re-negotiates via a
    /// fresh `Session`.
    pub client_features: Vec<String>,
    pub outbox: mpsc::UnboundedSender<ServerMessage>,
    pub cancel: CancellationToken,
}

impl Session {
    /// Push a frame to this session. Silently drops if the connection's
    /// receiving end is already gone (connection closing concurrently).
    pub fn send(&self, message: ServerMessage) {
        let _ = self.outbox.send(message);
    }

    pub fn has_feature(&self, name: &str) -> bool {
        self.client_features.iter().any(|f| f == name)
    }
}

/// Registers every live session by device id, with a derived per-user
/// index for fan-out. Registering a session for a device id already
/// present evicts (and cancels) the prior one — "replacement closes
/// predecessor" (spec §4.4).
#[derive(Default)]
pub struct SessionRegistry {
    by_device: RwLock<HashMap<String, Arc<Session>>>,
    by_user: RwLock<HashMap<String, Vec<Arc<Session>>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `session`, evicting and cancelling any prior session for
    /// the same device. Returns the evicted session, if any, so the
    /// caller can close its socket with a `session_replaced` code.
    pub async fn register(&self, session: Arc<Session>) -> Option<Arc<Session>> {
        let evicted = {
            let mut by_device = self.by_device.write().await;
            by_device.insert(session.device_id.clone(), session.clone())
        };

        if let Some(ref prior) = evicted {
            prior.cancel.cancel();
            self.remove_from_user_index(&prior.user_id, &prior.device_id).await;
        }

        let mut by_user = self.by_user.write().await;
        by_user.entry(session.user_id.clone()).or_default().push(session);

        evicted
    }

    pub async fn deregister(&self, device_id: &str) {
        let removed = self.by_device.write().await.remove(device_id);
        if let Some(session) = removed {
            self.remove_from_user_index(&session.user_id, device_id).await;
        }
    }

    async fn remove_from_user_index(&self, user_id: &str, device_id: &str) {
        let mut by_user = self.by_user.write().await;
        if let Some(sessions) = by_user.get_mut(user_id) {
            sessions.retain(|s| s.device_id != device_id);
            if sessions.is_empty() {
                by_user.remove(user_id);
            }
        }
    }

    pub async fn sessions_for_user(&self, user_id: &str) -> Vec<Arc<Session>> {
        self.by_user.read().await.get(user_id).cloned().unwrap_or_default()
    }

    pub async fn session_for_device(&self, device_id: &str) -> Option<Arc<Session>> {
        self.by_device.read().await.get(device_id).cloned()
    }

    /// Compute the set of stream keys visible to a session: every stream
    /// in the user's catalog, plus the shared admin stream iff the
    /// session is an administrator (spec §4.3/§4.4).
    pub fn compute_visible_stream_keys(
        user_streams: &[String],
        admin_global_stream_key: &str,
        is_admin: bool,
    ) -> Vec<String> {
        let mut keys: Vec<String> = user_streams.to_vec();
        if is_admin && !keys.iter().any(|k| k == admin_global_stream_key) {
            keys.push(admin_global_stream_key.to_owned());
        }
        keys
    }

    /// Recompute admin flag, visible streams, and default stream for a
    /// live device when the allowlist flips its `isAdmin` bit, then push
    /// a fresh `session_info`/`stream_snapshot` pair (spec §4.4).
    pub async fn reconcile_admin_flag(
        &self,
        device_id: &str,
        is_admin: bool,
        user_streams: &[String],
        admin_global_stream_key: &str,
        dm_scope_enabled: bool,
    ) {
        let Some(session) = self.session_for_device(device_id).await else { return };

        *session.is_admin.write().await = is_admin;
        let visible = Self::compute_visible_stream_keys(user_streams, admin_global_stream_key, is_admin);
        *session.visible_stream_keys.write().await = visible.clone();

        session.send(ServerMessage::SessionInfo {
            user_id: session.user_id.clone(),
            is_admin,
            dm_scope: dm_scope_enabled,
            session_keys: visible,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_session(device_id: &str, user_id: &str) -> Arc<Session> {
        let (tx, _rx) = mpsc::unbounded_channel();
        Arc::new(Session {
            device_id: device_id.to_owned(),
            session_id: format!("sess-{device_id}"),
            user_id: user_id.to_owned(),
            is_admin: RwLock::new(false),
            visible_stream_keys: RwLock::new(vec![]),
            default_stream_key: RwLock::new("agent:main:clawline:flynn:main".to_owned()),
            client_features: vec![],
            outbox: tx,
            cancel: CancellationToken::new(),
        })
    }

    #[tokio::test]
    async fn registering_same_device_evicts_predecessor() {
        let registry = SessionRegistry::new();
        let first = sample_session("dev-1", "flynn");
        let first_cancel = first.cancel.clone();
        registry.register(first).await;

        let second = sample_session("dev-1", "flynn");
        let evicted = registry.register(second).await;

        assert!(evicted.is_some());
        assert!(first_cancel.is_cancelled());

        let sessions = registry.sessions_for_user("flynn").await;
        assert_eq!(sessions.len(), 1);
    }

    #[tokio::test]
    async fn sessions_for_user_aggregates_multiple_devices() {
        let registry = SessionRegistry::new();
        registry.register(sample_session("dev-1", "flynn")).await;
        registry.register(sample_session("dev-2", "flynn")).await;

        let sessions = registry.sessions_for_user("flynn").await;
        assert_eq!(sessions.len(), 2);
    }

    #[tokio::test]
    async fn deregister_drops_from_both_indices() {
        let registry = SessionRegistry::new();
        registry.register(sample_session("dev-1", "flynn")).await;
        registry.deregister("dev-1").await;

        assert!(registry.session_for_device("dev-1").await.is_none());
        assert!(registry.sessions_for_user("flynn").await.is_empty());
    }

    #[test]
    fn visible_stream_keys_add_admin_stream_only_for_admins() {
        let streams = vec!["agent:main:clawline:flynn:main".to_owned()];
        let admin_key = "agent:main:clawline:admin:global_dm";

        let non_admin = SessionRegistry::compute_visible_stream_keys(&streams, admin_key, false);
        assert!(!non_admin.contains(&admin_key.to_owned()));

        let admin = SessionRegistry::compute_visible_stream_keys(&streams, admin_key, true);
        assert!(admin.contains(&admin_key.to_owned()));
    }
}
