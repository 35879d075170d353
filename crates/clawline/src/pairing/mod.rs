// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Pairing & Token Store (spec §4.1): the allowlist/pending/denylist state
//! machine and bearer-token issuance.

pub mod store;
pub mod token;
pub mod watch;

use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::Instant;

use tokio::sync::broadcast;
use tracing::info;

use crate::ids::{generate_user_id, normalize_user_id};
use store::{Allowlist, AllowlistEntry, Denylist, DeviceInfo, Pending, PendingEntry};
use token::{TokenClaims, TokenSigner};

/// Broadcast when the allowlist or denylist changes, either via a live
/// `pair_request` or an external file edit reconciled by [`watch::run`].
/// Pending-socket handlers in the transport layer select on this to learn
/// when their device has been approved or revoked.
#[derive(Debug, Clone)]
pub enum PairingEvent {
    AllowlistChanged { device_id: String },
    DenylistChanged { device_id: String },
}

#[derive(Debug)]
pub enum PairOutcome {
    Issued { token: String, user_id: String, is_admin: bool },
    Pending,
    RateLimited,
    Rejected,
}

pub struct PairingStore {
    state_dir: PathBuf,
    allowlist: RwLock<Allowlist>,
    pending: RwLock<Pending>,
    denylist: RwLock<Denylist>,
    signer: TokenSigner,
    events: broadcast::Sender<PairingEvent>,
}

impl PairingStore {
    pub fn open(state_dir: &Path, jwt_key_path: &Path) -> anyhow::Result<Self> {
        let allowlist: Allowlist = store::load(&allowlist_path(state_dir))?;
        let pending: Pending = store::load(&pending_path(state_dir))?;
        let denylist: Denylist = store::load(&denylist_path(state_dir))?;
        let signer = TokenSigner::load_or_create(jwt_key_path)?;
        let (events, _) = broadcast::channel(256);

        Ok(Self {
            state_dir: state_dir.to_owned(),
            allowlist: RwLock::new(allowlist),
            pending: RwLock::new(pending),
            denylist: RwLock::new(denylist),
            signer,
            events,
        })
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PairingEvent> {
        self.events.subscribe()
    }

    pub fn allowlist_entry(&self, device_id: &str) -> Option<AllowlistEntry> {
        self.allowlist.read().unwrap_or_else(|e| e.into_inner()).entries.get(device_id).cloned()
    }

    pub fn is_denylisted(&self, device_id: &str) -> bool {
        self.denylist.read().unwrap_or_else(|e| e.into_inner()).entries.contains_key(device_id)
    }

    /// Re-read all three files from disk. On a parse failure the
    /// in-memory state is left untouched (spec §7: watcher-driven reloads
    /// must not surface errors to live clients).
    pub fn reconcile_from_disk(&self) -> anyhow::Result<()> {
        let allowlist: Allowlist = store::load(&allowlist_path(&self.state_dir))?;
        let pending: Pending = store::load(&pending_path(&self.state_dir))?;
        let denylist: Denylist = store::load(&denylist_path(&self.state_dir))?;

        *self.allowlist.write().unwrap_or_else(|e| e.into_inner()) = allowlist;
        *self.pending.write().unwrap_or_else(|e| e.into_inner()) = pending;
        *self.denylist.write().unwrap_or_else(|e| e.into_inner()) = denylist;

        let _ = self.events.send(PairingEvent::AllowlistChanged { device_id: String::new() });
        Ok(())
    }

    /// Verify a previously issued token. Enforces `exp` if present and
    /// checks the subject against the allowlist-recorded `userId` via
    /// constant-time comparison (spec §4.1).
    pub fn verify_token(&self, token: &str, now_epoch_secs: i64) -> Option<TokenClaims> {
        let claims = self.signer.verify(token, now_epoch_secs).ok()?;
        let allowlist = self.allowlist.read().unwrap_or_else(|e| e.into_inner());
        let entry = allowlist.entries.get(&claims.device_id)?;
        if ring::constant_time::verify_slices(claims.subject.as_bytes(), entry.user_id.as_bytes()).is_err() {
            return None;
        }
        Some(claims)
    }

    /// Run the pair-request state machine (spec §4.1 steps 4-7; steps 1-3
    /// — protocol version, deviceId format, and the rate-limit check —
    /// are applied by the caller before reaching here, since they don't
    /// need the allowlist).
    pub fn handle_pair_request(
        &self,
        device_id: &str,
        device_info: DeviceInfo,
        claimed_name: Option<String>,
        reissue_grace_seconds: i64,
        max_pending_requests: u32,
        now_ms: i64,
        now_epoch_secs: i64,
    ) -> anyhow::Result<PairOutcome> {
        if self.is_denylisted(device_id) {
            return Ok(PairOutcome::Rejected);
        }
        if !device_info.is_valid() {
            return Ok(PairOutcome::Rejected);
        }

        let existing = self.allowlist_entry(device_id);

        match existing {
            Some(entry) => {
                let switched_account = claimed_name
                    .as_deref()
                    .map(|name| normalize_user_id(name) != entry.user_id)
                    .unwrap_or(false);

                if switched_account {
                    self.upsert_pending(device_id, claimed_name, device_info, now_ms)?;
                    info!(device_id, "pair_request: account switch detected, holding for operator approval");
                    return Ok(PairOutcome::Pending);
                }

                let delivered_never_seen = entry.token_delivered && entry.last_seen_at.is_none();
                let age_ms = now_ms - entry.created_at;
                let outside_grace = age_ms > reissue_grace_seconds * 1000;

                if delivered_never_seen && outside_grace {
                    self.upsert_pending(device_id, claimed_name, device_info, now_ms)?;
                    info!(device_id, "pair_request: delivered token never used past reissue grace, returning to pending");
                    return Ok(PairOutcome::Pending);
                }

                let (token, is_admin, user_id) = self.reissue_token(&entry, now_ms, now_epoch_secs)?;
                Ok(PairOutcome::Issued { token, user_id, is_admin })
            }
            None => {
                let current_pending = self.pending.read().unwrap_or_else(|e| e.into_inner()).entries.len();
                let already_pending =
                    self.pending.read().unwrap_or_else(|e| e.into_inner()).entries.contains_key(device_id);
                let projected = current_pending + usize::from(!already_pending);

                if projected > max_pending_requests as usize {
                    return Ok(PairOutcome::RateLimited);
                }

                self.upsert_pending(device_id, claimed_name, device_info, now_ms)?;
                info!(device_id, "pair_request: new device held pending operator approval");
                Ok(PairOutcome::Pending)
            }
        }
    }

    fn upsert_pending(
        &self,
        device_id: &str,
        claimed_name: Option<String>,
        device_info: DeviceInfo,
        now_ms: i64,
    ) -> anyhow::Result<()> {
        let mut pending = self.pending.write().unwrap_or_else(|e| e.into_inner());
        pending.entries.entry(device_id.to_owned()).or_insert_with(|| PendingEntry {
            device_id: device_id.to_owned(),
            claimed_name,
            device_info,
            requested_at: now_ms,
        });
        store::save(&pending_path(&self.state_dir), &*pending)?;
        Ok(())
    }

    fn reissue_token(
        &self,
        entry: &AllowlistEntry,
        now_ms: i64,
        now_epoch_secs: i64,
    ) -> anyhow::Result<(String, bool, String)> {
        let claims = TokenClaims {
            subject: entry.user_id.clone(),
            device_id: entry.device_id.clone(),
            is_admin: entry.is_admin,
            issued_at: now_epoch_secs,
            exp: None,
        };
        let token = self.signer.issue(&claims)?;

        let mut allowlist = self.allowlist.write().unwrap_or_else(|e| e.into_inner());
        if let Some(stored) = allowlist.entries.get_mut(&entry.device_id) {
            stored.token_delivered = true;
            stored.last_seen_at = Some(now_ms);
        }
        store::save(&allowlist_path(&self.state_dir), &*allowlist)?;

        Ok((token, entry.is_admin, entry.user_id.clone()))
    }

    /// Approve a pending device, granting it a user id (operator action,
    /// surfaced over the admin HTTP surface or a direct file edit).
    pub fn approve(&self, device_id: &str, user_id: Option<String>, is_admin: bool, now_ms: i64) -> anyhow::Result<AllowlistEntry> {
        let mut pending = self.pending.write().unwrap_or_else(|e| e.into_inner());
        let pending_entry = pending.entries.remove(device_id);
        store::save(&pending_path(&self.state_dir), &*pending)?;
        drop(pending);

        let device_info = pending_entry
            .as_ref()
            .map(|p| p.device_info.clone())
            .unwrap_or_else(|| DeviceInfo { platform: "unknown".to_owned(), model: "unknown".to_owned(), os_version: None, app_version: None });
        let claimed_name = pending_entry.as_ref().and_then(|p| p.claimed_name.clone());
        let resolved_user_id = user_id
            .or_else(|| claimed_name.as_deref().map(normalize_user_id))
            .unwrap_or_else(generate_user_id);

        let entry = AllowlistEntry {
            device_id: device_id.to_owned(),
            user_id: resolved_user_id,
            is_admin,
            claimed_name,
            device_info,
            token_delivered: false,
            created_at: now_ms,
            last_seen_at: None,
        };

        let mut allowlist = self.allowlist.write().unwrap_or_else(|e| e.into_inner());
        allowlist.entries.insert(device_id.to_owned(), entry.clone());
        store::save(&allowlist_path(&self.state_dir), &*allowlist)?;
        drop(allowlist);

        let _ = self.events.send(PairingEvent::AllowlistChanged { device_id: device_id.to_owned() });
        Ok(entry)
    }

    pub fn revoke(&self, device_id: &str) -> anyhow::Result<()> {
        let mut denylist = self.denylist.write().unwrap_or_else(|e| e.into_inner());
        denylist.entries.insert(device_id.to_owned(), store::DenylistEntry { device_id: device_id.to_owned() });
        store::save(&denylist_path(&self.state_dir), &*denylist)?;
        drop(denylist);

        let _ = self.events.send(PairingEvent::DenylistChanged { device_id: device_id.to_owned() });
        Ok(())
    }
}

pub fn allowlist_path(state_dir: &Path) -> PathBuf {
    state_dir.join("allowlist.json")
}

pub fn pending_path(state_dir: &Path) -> PathBuf {
    state_dir.join("pending.json")
}

pub fn denylist_path(state_dir: &Path) -> PathBuf {
    state_dir.join("denylist.json")
}

/// Monotonic instant for sliding-window rate-limit checks at the call
/// site; kept separate from wall-clock `now_ms`/`now_epoch_secs` used for
/// persisted timestamps and token claims.
pub fn monotonic_now() -> Instant {
    Instant::now()
}
