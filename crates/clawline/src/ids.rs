// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! ID formats and the stream-key grammar (spec §6 "ID formats (regex contracts)").

use std::sync::LazyLock;

use rand::RngCore;
use regex::Regex;
use uuid::Uuid;

static UUID_V4_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^[0-9a-f]{8}-[0-9a-f]{4}-4[0-9a-f]{3}-[89ab][0-9a-f]{3}-[0-9a-f]{12}$",
    )
    .expect("static regex")
});

static ASSET_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^a_[0-9a-f]{8}-[0-9a-f]{4}-4[0-9a-f]{3}-[89ab][0-9a-f]{3}-[0-9a-f]{12}$",
    )
    .expect("static regex")
});

static CUSTOM_SUFFIX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^s_[0-9a-f]{8}$").expect("static regex"));

/// Legacy DM stream-key shape (`agent:*:clawline:dm:<user>`), recognised and
/// rewritten to the current grammar on read (spec §9, Open Question c).
static LEGACY_DM_KEY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^agent:([^:]+):clawline:dm:(.+)$").expect("static regex"));

/// Current stream-key grammar: `agent:<agentId>:clawline:<userId>:<suffix>`.
static STREAM_KEY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^agent:([^:]+):clawline:([^:]+):(main|dm|s_[0-9a-f]{8})$").expect("static regex")
});

pub fn is_valid_device_id(s: &str) -> bool {
    UUID_V4_RE.is_match(s)
}

pub fn is_valid_asset_id(s: &str) -> bool {
    ASSET_ID_RE.is_match(s)
}

pub fn new_asset_id() -> String {
    format!("a_{}", Uuid::new_v4())
}

pub fn new_server_event_id() -> String {
    format!("s_{}", Uuid::new_v4())
}

/// Client message ids are `c_` + arbitrary non-empty content.
pub fn is_valid_client_id(s: &str) -> bool {
    s.starts_with("c_") && s.len() > 2
}

/// Random 4-byte-hex suffix for a custom stream, e.g. `s_a1b2c3d4`.
pub fn new_custom_suffix() -> String {
    let mut bytes = [0u8; 4];
    rand::rng().fill_bytes(&mut bytes);
    format!("s_{}", hex_encode(&bytes))
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{b:02x}"));
    }
    s
}

pub fn is_valid_custom_suffix(s: &str) -> bool {
    CUSTOM_SUFFIX_RE.is_match(s)
}

/// A parsed stream key: `agent:<agent_id>:clawline:<user_id>:<suffix>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamKeyParts {
    pub agent_id: String,
    pub user_id: String,
    pub suffix: String,
}

/// Parse a stream key, rewriting the legacy `agent:*:clawline:dm:<user>`
/// shape to the current grammar first (spec §9c: recognise, don't purge).
pub fn parse_stream_key(key: &str) -> Option<StreamKeyParts> {
    let normalized = rewrite_legacy_stream_key(key);
    let caps = STREAM_KEY_RE.captures(&normalized)?;
    Some(StreamKeyParts {
        agent_id: caps[1].to_owned(),
        user_id: caps[2].to_owned(),
        suffix: caps[3].to_owned(),
    })
}

/// Rewrite `agent:<agent>:clawline:dm:<user>` to
/// `agent:<agent>:clawline:<user>:dm`, otherwise pass through unchanged.
pub fn rewrite_legacy_stream_key(key: &str) -> String {
    if let Some(caps) = LEGACY_DM_KEY_RE.captures(key) {
        format!("agent:{}:clawline:{}:dm", &caps[1], &caps[2])
    } else {
        key.to_owned()
    }
}

pub fn build_stream_key(agent_id: &str, user_id: &str, suffix: &str) -> String {
    format!("agent:{agent_id}:clawline:{user_id}:{suffix}")
}

/// Normalise a `claimedName` into a `userId`: ASCII-lowercased,
/// non-alphanumerics collapsed to `_`, truncated to 48 bytes (spec §3).
pub fn normalize_user_id(claimed_name: &str) -> String {
    let mut out = String::with_capacity(claimed_name.len());
    let mut last_was_sep = false;
    for ch in claimed_name.chars() {
        let lower = ch.to_ascii_lowercase();
        if lower.is_ascii_alphanumeric() {
            out.push(lower);
            last_was_sep = false;
        } else if !last_was_sep && !out.is_empty() {
            out.push('_');
            last_was_sep = true;
        }
    }
    while out.ends_with('_') {
        out.pop();
    }
    if out.len() > 48 {
        out.truncate(48);
        while !out.is_char_boundary(out.len()) {
            out.pop();
        }
    }
    out
}

/// Generate a fresh, random `userId` for a device with no `claimedName`.
pub fn generate_user_id() -> String {
    format!("user_{}", Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_id_must_be_uuidv4() {
        assert!(is_valid_device_id("00000000-0000-4000-8000-000000000001"));
        assert!(!is_valid_device_id("not-a-uuid"));
        assert!(!is_valid_device_id("00000000-0000-1000-8000-000000000001"));
    }

    #[test]
    fn asset_id_requires_a_prefix() {
        let id = new_asset_id();
        assert!(is_valid_asset_id(&id));
        assert!(!is_valid_asset_id("00000000-0000-4000-8000-000000000001"));
    }

    #[test]
    fn client_id_just_needs_c_prefix_and_body() {
        assert!(is_valid_client_id("c_1"));
        assert!(!is_valid_client_id("c_"));
        assert!(!is_valid_client_id("x_1"));
    }

    #[test]
    fn stream_key_roundtrips() {
        let key = build_stream_key("main", "flynn", "main");
        let parts = parse_stream_key(&key).expect("parses");
        assert_eq!(parts.user_id, "flynn");
        assert_eq!(parts.suffix, "main");
    }

    #[test]
    fn legacy_dm_key_is_rewritten() {
        let legacy = "agent:main:clawline:dm:flynn";
        let parts = parse_stream_key(legacy).expect("parses legacy key");
        assert_eq!(parts.user_id, "flynn");
        assert_eq!(parts.suffix, "dm");
    }

    #[test]
    fn custom_suffix_is_well_formed() {
        let suffix = new_custom_suffix();
        assert!(is_valid_custom_suffix(&suffix));
    }

    #[test]
    fn normalize_user_id_collapses_and_lowercases() {
        assert_eq!(normalize_user_id("Flynn"), "flynn");
        assert_eq!(normalize_user_id("Kevin Flynn!!"), "kevin_flynn");
        assert_eq!(normalize_user_id("  leading"), "leading");
    }

    #[test]
    fn normalize_user_id_caps_at_48_bytes() {
        let long = "a".repeat(100);
        let norm = normalize_user_id(&long);
        assert!(norm.len() <= 48);
    }
}
