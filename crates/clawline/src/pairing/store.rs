// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Allowlist, pending-request, and denylist persistence (spec §4.1).
//!
//! Each list is a JSON file written atomically (write to `.tmp`, then
//! rename). In-memory copies are the source of truth for request
//! handling; external edits are picked up by [`super::watch`].

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Client-reported device attributes (spec §3 `Device`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub platform: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_version: Option<String>,
}

impl DeviceInfo {
    /// `platform` and `model` must be non-empty and ≤64 bytes each
    /// (spec §4.1 step 5).
    pub fn is_valid(&self) -> bool {
        !self.platform.is_empty()
            && self.platform.len() <= 64
            && !self.model.is_empty()
            && self.model.len() <= 64
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllowlistEntry {
    pub device_id: String,
    pub user_id: String,
    pub is_admin: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_name: Option<String>,
    pub device_info: DeviceInfo,
    pub token_delivered: bool,
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingEntry {
    pub device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_name: Option<String>,
    pub device_info: DeviceInfo,
    pub requested_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DenylistEntry {
    pub device_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Allowlist {
    pub entries: HashMap<String, AllowlistEntry>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Pending {
    pub entries: HashMap<String, PendingEntry>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Denylist {
    pub entries: HashMap<String, DenylistEntry>,
}

/// Load a JSON-backed list, returning the default (empty) value if the
/// file doesn't exist yet.
pub fn load<T: Default + for<'de> Deserialize<'de>>(path: &Path) -> anyhow::Result<T> {
    match std::fs::read_to_string(path) {
        Ok(contents) => Ok(serde_json::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(e) => Err(e.into()),
    }
}

/// Persist a JSON-backed list atomically (write `.tmp`, then rename).
pub fn save<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(value)?;
    let tmp_path = path.with_extension("tmp");
    std::fs::write(&tmp_path, json)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_info_rejects_empty_or_oversized_fields() {
        let valid = DeviceInfo {
            platform: "ios".to_owned(),
            model: "iPhone".to_owned(),
            os_version: None,
            app_version: None,
        };
        assert!(valid.is_valid());

        let empty_model = DeviceInfo { model: String::new(), ..valid.clone() };
        assert!(!empty_model.is_valid());

        let oversized = DeviceInfo { model: "x".repeat(65), ..valid };
        assert!(!oversized.is_valid());
    }

    #[test]
    fn missing_file_loads_default() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("allowlist.json");
        let allowlist: Allowlist = load(&path).expect("load");
        assert!(allowlist.entries.is_empty());
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("allowlist.json");

        let mut allowlist = Allowlist::default();
        allowlist.entries.insert(
            "dev-1".to_owned(),
            AllowlistEntry {
                device_id: "dev-1".to_owned(),
                user_id: "flynn".to_owned(),
                is_admin: true,
                claimed_name: Some("Flynn".to_owned()),
                device_info: DeviceInfo {
                    platform: "ios".to_owned(),
                    model: "iPhone".to_owned(),
                    os_version: None,
                    app_version: None,
                },
                token_delivered: true,
                created_at: 0,
                last_seen_at: None,
            },
        );
        save(&path, &allowlist).expect("save");

        let reloaded: Allowlist = load(&path).expect("load");
        assert!(reloaded.entries.contains_key("dev-1"));
        assert!(reloaded.entries["dev-1"].is_admin);
    }
}
