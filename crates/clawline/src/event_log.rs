// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Event Log business logic (spec §4.2, §4.4 "Replay on auth"): resolving
//! `lastMessageId` into a replay window against the durable store.

use sqlx::SqlitePool;

use crate::db::events::{self, EventRow};

pub struct ReplayResult {
    pub events: Vec<EventRow>,
    pub history_reset: bool,
    pub truncated: bool,
}

/// Compute the replay set for a freshly authenticated session (spec §4.4):
/// if `last_message_id` resolves to a known event, replay everything after
/// it, capped at `max_replay`; otherwise replay the newest `max_replay`
/// events and flag `historyReset`. Events tagged with `admin_global_stream_key`
/// are dropped for non-admin sessions before the cap is applied.
pub async fn replay(
    pool: &SqlitePool,
    user_id: &str,
    last_message_id: Option<&str>,
    max_replay: u32,
    admin_global_stream_key: &str,
    is_admin: bool,
) -> anyhow::Result<ReplayResult> {
    let (mut rows, history_reset, is_tail) = match last_message_id {
        Some(id) => match events::find_by_id(pool, user_id, id).await? {
            Some(anchor) => {
                let rows = events::after_sequence(pool, user_id, anchor.sequence, max_replay + 1).await?;
                (rows, false, false)
            }
            None => (events::tail_messages(pool, user_id, max_replay + 1).await?, true, true),
        },
        None => (events::tail_messages(pool, user_id, max_replay + 1).await?, true, true),
    };

    if !is_admin {
        rows.retain(|e| e.session_key != admin_global_stream_key);
    }

    let truncated = rows.len() as u32 > max_replay;
    if is_tail {
        // `rows` is oldest-to-newest; an over-sized tail window must drop
        // its oldest entries to keep the true tail, not the back.
        let excess = rows.len().saturating_sub(max_replay as usize);
        rows.drain(0..excess);
    } else {
        rows.truncate(max_replay as usize);
    }

    Ok(ReplayResult { events: rows, history_reset, truncated })
}
