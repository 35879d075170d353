// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Test harness for end-to-end binary smoke tests.
//!
//! Spawns the real `clawline` binary as a subprocess, pointed at isolated
//! temp directories for pairing state and media, and exercises it over
//! its HTTP and WebSocket surfaces.

use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Once;
use std::time::Duration;

use serde::Serialize;

static CRYPTO_INIT: Once = Once::new();

/// Install the ring crypto provider for reqwest/rustls.
/// Safe to call multiple times — only the first call has effect.
pub fn ensure_crypto() {
    CRYPTO_INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Resolve the path to the compiled `clawline` binary.
pub fn clawline_binary() -> PathBuf {
    let manifest = Path::new(env!("CARGO_MANIFEST_DIR"));
    // tests/specs → tests → workspace root
    let workspace = manifest.parent().and_then(|p| p.parent()).unwrap_or(manifest);
    workspace.join("target").join("debug").join("clawline")
}

/// Find a free TCP port by binding to :0 then releasing.
pub fn free_port() -> anyhow::Result<u16> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

/// A running `clawline` process, with its pairing state and media
/// directories kept alive for the duration of the test. Killed on drop.
pub struct ClawlineProcess {
    child: Child,
    port: u16,
    state_dir: tempfile::TempDir,
    _media_dir: tempfile::TempDir,
}

/// Builder for configuring a spawned [`ClawlineProcess`].
pub struct ClawlineBuilder {
    outbound_token: Option<String>,
    dm_scope_enabled: bool,
    max_pending_requests: Option<u32>,
    max_pair_per_minute: Option<u32>,
    max_messages_per_second: Option<u32>,
}

impl Default for ClawlineBuilder {
    fn default() -> Self {
        Self {
            outbound_token: None,
            dm_scope_enabled: false,
            max_pending_requests: None,
            max_pair_per_minute: None,
            max_messages_per_second: None,
        }
    }
}

impl ClawlineBuilder {
    pub fn outbound_token(mut self, token: &str) -> Self {
        self.outbound_token = Some(token.to_owned());
        self
    }

    pub fn dm_scope_enabled(mut self) -> Self {
        self.dm_scope_enabled = true;
        self
    }

    pub fn max_pending_requests(mut self, n: u32) -> Self {
        self.max_pending_requests = Some(n);
        self
    }

    pub fn max_pair_per_minute(mut self, n: u32) -> Self {
        self.max_pair_per_minute = Some(n);
        self
    }

    pub fn max_messages_per_second(mut self, n: u32) -> Self {
        self.max_messages_per_second = Some(n);
        self
    }

    pub fn spawn(self) -> anyhow::Result<ClawlineProcess> {
        ensure_crypto();
        let binary = clawline_binary();
        anyhow::ensure!(binary.exists(), "clawline binary not found at {}", binary.display());

        let port = free_port()?;
        let state_dir = tempfile::tempdir()?;
        let media_dir = tempfile::tempdir()?;

        let mut args: Vec<String> = vec![
            "--host".into(),
            "127.0.0.1".into(),
            "--port".into(),
            port.to_string(),
            "--state-dir".into(),
            state_dir.path().to_string_lossy().into_owned(),
            "--media-dir".into(),
            media_dir.path().to_string_lossy().into_owned(),
            "--log-format".into(),
            "text".into(),
            "--log-level".into(),
            "warn".into(),
        ];

        if let Some(ref token) = self.outbound_token {
            args.extend(["--outbound-token".into(), token.clone()]);
        }
        if self.dm_scope_enabled {
            args.extend(["--dm-scope-enabled".into(), "true".into()]);
        }
        if let Some(n) = self.max_pending_requests {
            args.extend(["--max-pending-requests".into(), n.to_string()]);
        }
        if let Some(n) = self.max_pair_per_minute {
            args.extend(["--max-pair-per-minute".into(), n.to_string()]);
        }
        if let Some(n) = self.max_messages_per_second {
            args.extend(["--max-messages-per-second".into(), n.to_string()]);
        }

        let child = Command::new(&binary).args(&args).stdout(Stdio::null()).stderr(Stdio::null()).spawn()?;

        Ok(ClawlineProcess { child, port, state_dir, _media_dir: media_dir })
    }
}

impl ClawlineProcess {
    pub fn build() -> ClawlineBuilder {
        ClawlineBuilder::default()
    }

    pub fn start() -> anyhow::Result<Self> {
        Self::build().spawn()
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn state_dir(&self) -> &Path {
        self.state_dir.path()
    }

    /// Base URL for HTTP requests.
    pub fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    /// WebSocket URL.
    pub fn ws_url(&self) -> String {
        format!("ws://127.0.0.1:{}/ws", self.port)
    }

    /// Poll `/version` until it responds, or time out.
    pub async fn wait_healthy(&self, timeout: Duration) -> anyhow::Result<()> {
        let client = reqwest::Client::new();
        let url = format!("{}/version", self.base_url());
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if tokio::time::Instant::now() > deadline {
                anyhow::bail!("clawline did not become healthy within {timeout:?}");
            }
            if let Ok(resp) = client.get(&url).send().await {
                if resp.status().is_success() {
                    return Ok(());
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Directly approve a pending device via the operator-facing
    /// allowlist file, bypassing any admin HTTP surface. Mirrors the
    /// out-of-band approval path an operator tool would take.
    pub fn approve_device(&self, device_id: &str, user_id: &str, is_admin: bool) -> anyhow::Result<()> {
        let allowlist_path = self.state_dir.path().join("allowlist.json");
        let pending_path = self.state_dir.path().join("pending.json");

        let mut pending: serde_json::Value = read_json_or_default(&pending_path)?;
        if let Some(entries) = pending.get_mut("entries").and_then(|v| v.as_object_mut()) {
            entries.remove(device_id);
        }
        write_json(&pending_path, &pending)?;

        let mut allowlist: serde_json::Value = read_json_or_default(&allowlist_path)?;
        let entries = allowlist
            .as_object_mut()
            .and_then(|o| o.get_mut("entries"))
            .and_then(|v| v.as_object_mut());
        if let Some(entries) = entries {
            entries.insert(
                device_id.to_owned(),
                serde_json::json!({
                    "deviceId": device_id,
                    "userId": user_id,
                    "isAdmin": is_admin,
                    "claimedName": user_id,
                    "deviceInfo": {"platform": "ios", "model": "iPhone"},
                    "tokenDelivered": false,
                    "createdAt": 0,
                    "lastSeenAt": null,
                }),
            );
        } else {
            allowlist = serde_json::json!({
                "entries": {
                    device_id: {
                        "deviceId": device_id,
                        "userId": user_id,
                        "isAdmin": is_admin,
                        "claimedName": user_id,
                        "deviceInfo": {"platform": "ios", "model": "iPhone"},
                        "tokenDelivered": false,
                        "createdAt": 0,
                        "lastSeenAt": null,
                    }
                }
            });
        }
        write_json(&allowlist_path, &allowlist)?;

        Ok(())
    }

    /// Revoke a device by writing it directly into the denylist file.
    pub fn revoke_device(&self, device_id: &str) -> anyhow::Result<()> {
        let denylist_path = self.state_dir.path().join("denylist.json");
        let mut denylist: serde_json::Value = read_json_or_default(&denylist_path)?;
        let entries = denylist.as_object_mut().and_then(|o| o.get_mut("entries")).and_then(|v| v.as_object_mut());
        if let Some(entries) = entries {
            entries.insert(device_id.to_owned(), serde_json::json!({"deviceId": device_id}));
        } else {
            denylist = serde_json::json!({"entries": {device_id: {"deviceId": device_id}}});
        }
        write_json(&denylist_path, &denylist)?;
        Ok(())
    }

    /// Wait for the process to exit within `timeout`.
    pub async fn wait_exit(&mut self, timeout: Duration) -> anyhow::Result<std::process::ExitStatus> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if tokio::time::Instant::now() > deadline {
                anyhow::bail!("clawline did not exit within {timeout:?}");
            }
            if let Some(status) = self.child.try_wait()? {
                return Ok(status);
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

impl Drop for ClawlineProcess {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn read_json_or_default(path: &Path) -> anyhow::Result<serde_json::Value> {
    match std::fs::read_to_string(path) {
        Ok(contents) => Ok(serde_json::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(serde_json::json!({"entries": {}})),
        Err(e) => Err(e.into()),
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(value)?)?;
    Ok(())
}

/// A fresh, well-formed device id (random UUIDv4) for a test client.
pub fn new_device_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
