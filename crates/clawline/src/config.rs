// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::PathBuf;

use clap::Parser;

/// Realtime message gateway between personal client devices and a backend
/// agent runtime.
#[derive(Debug, Clone, Parser)]
#[command(name = "clawline", version, about)]
pub struct Config {
    /// Host address to bind to.
    #[arg(long, env = "CLAWLINE_HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// HTTP/WebSocket port to listen on.
    #[arg(long, env = "CLAWLINE_PORT", default_value = "18800")]
    pub port: u16,

    /// Directory holding allowlist.json, pending.json, denylist.json,
    /// jwt.key, and the durable SQLite store.
    #[arg(long, env = "CLAWLINE_STATE_DIR", default_value = "./clawline-state")]
    pub state_dir: PathBuf,

    /// Directory holding `assets/<assetId>` files and a `tmp/` scratch dir.
    #[arg(long, env = "CLAWLINE_MEDIA_DIR", default_value = "./clawline-media")]
    pub media_dir: PathBuf,

    /// Log format: "json" or "text".
    #[arg(long, env = "CLAWLINE_LOG_FORMAT", default_value = "json")]
    pub log_format: String,

    /// Bearer token required for the Outbound Send HTTP surface.
    #[arg(long, env = "CLAWLINE_OUTBOUND_TOKEN")]
    pub outbound_token: Option<String>,

    /// Opaque deployment-level stream key shared by all administrators.
    #[arg(long, env = "CLAWLINE_ADMIN_STREAM_KEY", default_value = "agent:main:clawline:admin:global_dm")]
    pub admin_global_stream_key: String,

    /// Identifier of the backend agent runtime this gateway fronts; the
    /// `<agentId>` component of every stream key it mints.
    #[arg(long, env = "CLAWLINE_AGENT_ID", default_value = "main")]
    pub agent_id: String,

    /// Log level filter (passed to `tracing_subscriber::EnvFilter` unless
    /// `RUST_LOG` is set).
    #[arg(long, env = "CLAWLINE_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Whether deployments seed a separate `dm` built-in stream per user.
    #[arg(long, env = "CLAWLINE_DM_SCOPE_ENABLED", default_value = "false")]
    pub dm_scope_enabled: bool,

    /// Maximum bytes for a message's `content` field.
    #[arg(long, env = "CLAWLINE_MAX_MESSAGE_BYTES", default_value = "65536")]
    pub max_message_bytes: usize,

    /// Maximum bytes for an inline (base64-decoded) attachment.
    #[arg(long, env = "CLAWLINE_MAX_INLINE_BYTES", default_value = "262144")]
    pub max_inline_bytes: usize,

    /// Maximum events replayed on reconnect.
    #[arg(long, env = "CLAWLINE_MAX_REPLAY_MESSAGES", default_value = "500")]
    pub max_replay_messages: u32,

    /// Per-device inbound message rate (messages/second).
    #[arg(long, env = "CLAWLINE_MAX_MESSAGES_PER_SECOND", default_value = "5")]
    pub max_messages_per_second: u32,

    /// Per-device pair_request rate (requests/minute).
    #[arg(long, env = "CLAWLINE_MAX_PAIR_PER_MINUTE", default_value = "5")]
    pub max_pair_per_minute: u32,

    /// Cap on outstanding pending pairing requests.
    #[arg(long, env = "CLAWLINE_MAX_PENDING_REQUESTS", default_value = "100")]
    pub max_pending_requests: usize,

    /// Bearer token lifetime in seconds (default: one year).
    #[arg(long, env = "CLAWLINE_TOKEN_TTL_SECONDS", default_value = "31536000")]
    pub token_ttl_seconds: u64,

    /// Grace window for reissuing a token to a known, unseen device.
    #[arg(long, env = "CLAWLINE_REISSUE_GRACE_SECONDS", default_value = "600")]
    pub reissue_grace_seconds: u64,

    /// TTL for a pending pairing entry before it is pruned.
    #[arg(long, env = "CLAWLINE_PENDING_TTL_SECONDS", default_value = "300")]
    pub pending_ttl_seconds: u64,

    /// How long a pending socket is held open awaiting operator action.
    #[arg(long, env = "CLAWLINE_PENDING_SOCKET_TIMEOUT_SECONDS", default_value = "300")]
    pub pending_socket_timeout_seconds: u64,

    /// Retention window for stream-catalog idempotency records, in seconds
    /// (default: 7 days).
    #[arg(long, env = "CLAWLINE_STREAM_IDEMPOTENCY_RETENTION_SECONDS", default_value = "604800")]
    pub stream_idempotency_retention_seconds: u64,

    /// Maximum displayName byte length for a stream.
    #[arg(long, env = "CLAWLINE_MAX_DISPLAY_NAME_BYTES", default_value = "80")]
    pub max_display_name_bytes: usize,

    /// Maximum visible (non-deleted) streams a single user may own.
    #[arg(long, env = "CLAWLINE_MAX_STREAMS_PER_USER", default_value = "50")]
    pub max_streams_per_user: usize,

    /// Depth of the bounded durable-write queue before `write_queue_full`.
    #[arg(long, env = "CLAWLINE_MAX_WRITE_QUEUE_DEPTH", default_value = "1024")]
    pub max_write_queue_depth: usize,

    /// Maximum bytes fetched for a single reply-dispatcher media URL.
    #[arg(long, env = "CLAWLINE_MAX_UPLOAD_BYTES", default_value = "8388608")]
    pub max_upload_bytes: usize,

    /// Deadline, in seconds, for a single media fetch.
    #[arg(long, env = "CLAWLINE_MEDIA_FETCH_TIMEOUT_SECONDS", default_value = "30")]
    pub media_fetch_timeout_seconds: u64,
}

impl Config {
    /// Validate cross-field invariants after parsing.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_message_bytes == 0 {
            anyhow::bail!("--max-message-bytes must be non-zero");
        }
        if self.max_inline_bytes == 0 {
            anyhow::bail!("--max-inline-bytes must be non-zero");
        }
        if self.stream_idempotency_retention_seconds == 0 {
            anyhow::bail!("--stream-idempotency-retention-seconds must be non-zero");
        }
        if self.max_streams_per_user == 0 {
            anyhow::bail!("--max-streams-per-user must be non-zero");
        }
        Ok(())
    }

    pub fn sqlite_path(&self) -> PathBuf {
        self.state_dir.join("clawline.sqlite3")
    }

    pub fn allowlist_path(&self) -> PathBuf {
        self.state_dir.join("allowlist.json")
    }

    pub fn pending_path(&self) -> PathBuf {
        self.state_dir.join("pending.json")
    }

    pub fn denylist_path(&self) -> PathBuf {
        self.state_dir.join("denylist.json")
    }

    pub fn jwt_key_path(&self) -> PathBuf {
        self.state_dir.join("jwt.key")
    }

    pub fn assets_dir(&self) -> PathBuf {
        self.media_dir.join("assets")
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.media_dir.join("tmp")
    }
}
