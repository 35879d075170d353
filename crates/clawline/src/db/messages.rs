// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Inbound message idempotency records (spec §3 `UserMessageRecord`, §4.6).

use sqlx::{FromRow, Sqlite, SqlitePool, Transaction};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamingState {
    Finalized,
    Active,
    Failed,
    Queued,
}

impl StreamingState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Finalized => "finalized",
            Self::Active => "active",
            Self::Failed => "failed",
            Self::Queued => "queued",
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct MessageRecordRow {
    pub device_id: String,
    pub client_id: String,
    pub user_id: String,
    pub server_event_id: String,
    pub server_sequence: i64,
    pub content_hash: String,
    pub attachments_hash: String,
    pub streaming_state: String,
    pub ack_sent: bool,
    pub timestamp_ms: i64,
}

impl MessageRecordRow {
    pub fn streaming_state(&self) -> StreamingState {
        match self.streaming_state.as_str() {
            "finalized" => StreamingState::Finalized,
            "active" => StreamingState::Active,
            "failed" => StreamingState::Failed,
            _ => StreamingState::Queued,
        }
    }
}

pub async fn find(
    pool: &SqlitePool,
    device_id: &str,
    client_id: &str,
) -> sqlx::Result<Option<MessageRecordRow>> {
    sqlx::query_as("SELECT * FROM message_records WHERE device_id = ? AND client_id = ?")
        .bind(device_id)
        .bind(client_id)
        .fetch_optional(pool)
        .await
}

#[allow(clippy::too_many_arguments)]
pub async fn insert(
    tx: &mut Transaction<'_, Sqlite>,
    device_id: &str,
    client_id: &str,
    user_id: &str,
    server_event_id: &str,
    server_sequence: i64,
    content_hash: &str,
    attachments_hash: &str,
    streaming_state: StreamingState,
    now_ms: i64,
) -> sqlx::Result<()> {
    sqlx::query(
        "INSERT INTO message_records (device_id, client_id, user_id, server_event_id, server_sequence, content_hash, attachments_hash, streaming_state, ack_sent, timestamp_ms)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0, ?)",
    )
    .bind(device_id)
    .bind(client_id)
    .bind(user_id)
    .bind(server_event_id)
    .bind(server_sequence)
    .bind(content_hash)
    .bind(attachments_hash)
    .bind(streaming_state.as_str())
    .bind(now_ms)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

pub async fn mark_ack_sent(pool: &SqlitePool, device_id: &str, client_id: &str) -> sqlx::Result<()> {
    sqlx::query("UPDATE message_records SET ack_sent = 1 WHERE device_id = ? AND client_id = ?")
        .bind(device_id)
        .bind(client_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn set_streaming_state(
    pool: &SqlitePool,
    device_id: &str,
    client_id: &str,
    state: StreamingState,
) -> sqlx::Result<()> {
    sqlx::query("UPDATE message_records SET streaming_state = ? WHERE device_id = ? AND client_id = ?")
        .bind(state.as_str())
        .bind(device_id)
        .bind(client_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn link_asset(
    tx: &mut Transaction<'_, Sqlite>,
    device_id: &str,
    client_id: &str,
    asset_id: &str,
) -> sqlx::Result<()> {
    sqlx::query("INSERT OR IGNORE INTO message_assets (device_id, client_id, asset_id) VALUES (?, ?, ?)")
        .bind(device_id)
        .bind(client_id)
        .bind(asset_id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// Delete every message record (and its asset links, via cascade) whose
/// event belongs to `(user_id, session_key)`. Returns the distinct asset
/// ids that were linked, so the caller can determine which became
/// unreferenced (spec §4.3 stream-delete purge).
pub async fn delete_for_stream(
    tx: &mut Transaction<'_, Sqlite>,
    user_id: &str,
    session_key: &str,
) -> sqlx::Result<Vec<String>> {
    let asset_ids: Vec<String> = sqlx::query_scalar(
        "SELECT DISTINCT ma.asset_id
         FROM message_assets ma
         JOIN message_records mr ON mr.device_id = ma.device_id AND mr.client_id = ma.client_id
         JOIN events e ON e.id = mr.server_event_id
         WHERE e.user_id = ? AND e.session_key = ?",
    )
    .bind(user_id)
    .bind(session_key)
    .fetch_all(&mut **tx)
    .await?;

    sqlx::query(
        "DELETE FROM message_records WHERE (device_id, client_id) IN (
            SELECT mr.device_id, mr.client_id FROM message_records mr
            JOIN events e ON e.id = mr.server_event_id
            WHERE e.user_id = ? AND e.session_key = ?
        )",
    )
    .bind(user_id)
    .bind(session_key)
    .execute(&mut **tx)
    .await?;

    Ok(asset_ids)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_pool() -> SqlitePool {
        let pool = SqlitePool::connect("sqlite::memory:").await.expect("connect");
        sqlx::migrate!("./migrations").run(&pool).await.expect("migrate");
        pool
    }

    #[tokio::test]
    async fn insert_and_find_round_trips() {
        let pool = memory_pool().await;
        let mut tx = pool.begin().await.expect("begin");
        crate::db::events::append(
            &mut tx,
            "s_1",
            "flynn",
            "agent:main:clawline:flynn:main",
            "message",
            Some("d1"),
            "{}",
        )
        .await
        .expect("event");
        insert(&mut tx, "d1", "c_1", "flynn", "s_1", 1, "hash-a", "hash-b", StreamingState::Active, 0)
            .await
            .expect("insert");
        tx.commit().await.expect("commit");

        let found = find(&pool, "d1", "c_1").await.expect("find").expect("present");
        assert_eq!(found.server_event_id, "s_1");
        assert!(!found.ack_sent);
    }

    #[tokio::test]
    async fn mark_ack_sent_updates_flag() {
        let pool = memory_pool().await;
        let mut tx = pool.begin().await.expect("begin");
        crate::db::events::append(
            &mut tx,
            "s_1",
            "flynn",
            "agent:main:clawline:flynn:main",
            "message",
            Some("d1"),
            "{}",
        )
        .await
        .expect("event");
        insert(&mut tx, "d1", "c_1", "flynn", "s_1", 1, "hash-a", "hash-b", StreamingState::Active, 0)
            .await
            .expect("insert");
        tx.commit().await.expect("commit");

        mark_ack_sent(&pool, "d1", "c_1").await.expect("mark");
        let found = find(&pool, "d1", "c_1").await.expect("find").expect("present");
        assert!(found.ack_sent);
    }
}
