// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Append-only per-user event log (spec §4.2).

use sqlx::{FromRow, Sqlite, SqlitePool, Transaction};

use crate::db::epoch_ms;

#[derive(Debug, Clone, FromRow)]
pub struct EventRow {
    pub id: String,
    pub user_id: String,
    pub session_key: String,
    pub sequence: i64,
    pub event_type: String,
    pub originating_device_id: Option<String>,
    pub payload_json: String,
    pub payload_bytes: i64,
    pub timestamp_ms: i64,
}

/// Allocate the next dense, monotonic sequence number for `user_id` within
/// an open transaction.
async fn allocate_sequence(tx: &mut Transaction<'_, Sqlite>, user_id: &str) -> sqlx::Result<i64> {
    sqlx::query("INSERT INTO user_sequences (user_id, next_sequence) VALUES (?, 2) ON CONFLICT(user_id) DO UPDATE SET next_sequence = next_sequence + 1")
        .bind(user_id)
        .execute(&mut **tx)
        .await?;

    let seq: i64 =
        sqlx::query_scalar("SELECT next_sequence - 1 FROM user_sequences WHERE user_id = ?")
            .bind(user_id)
            .fetch_one(&mut **tx)
            .await?;
    Ok(seq)
}

/// Append a new event for `user_id`, allocating its sequence number inside
/// the same transaction as the caller's other writes (ingestion persists
/// the event and its message row atomically, spec §4.6 step 6).
pub async fn append(
    tx: &mut Transaction<'_, Sqlite>,
    id: &str,
    user_id: &str,
    session_key: &str,
    event_type: &str,
    originating_device_id: Option<&str>,
    payload_json: &str,
) -> sqlx::Result<EventRow> {
    let sequence = allocate_sequence(tx, user_id).await?;
    let timestamp_ms = epoch_ms();
    let payload_bytes = payload_json.len() as i64;

    sqlx::query(
        "INSERT INTO events (id, user_id, session_key, sequence, event_type, originating_device_id, payload_json, payload_bytes, timestamp_ms)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(id)
    .bind(user_id)
    .bind(session_key)
    .bind(sequence)
    .bind(event_type)
    .bind(originating_device_id)
    .bind(payload_json)
    .bind(payload_bytes)
    .bind(timestamp_ms)
    .execute(&mut **tx)
    .await?;

    Ok(EventRow {
        id: id.to_owned(),
        user_id: user_id.to_owned(),
        session_key: session_key.to_owned(),
        sequence,
        event_type: event_type.to_owned(),
        originating_device_id: originating_device_id.map(str::to_owned),
        payload_json: payload_json.to_owned(),
        payload_bytes,
        timestamp_ms,
    })
}

/// Tail (N newest) `message` events for a user, returned oldest-to-newest.
pub async fn tail_messages(pool: &SqlitePool, user_id: &str, limit: u32) -> sqlx::Result<Vec<EventRow>> {
    let mut rows: Vec<EventRow> = sqlx::query_as(
        "SELECT * FROM events WHERE user_id = ? AND event_type = 'message' ORDER BY sequence DESC LIMIT ?",
    )
    .bind(user_id)
    .bind(limit as i64)
    .fetch_all(pool)
    .await?;
    rows.reverse();
    Ok(rows)
}

/// All events for a user after `after_sequence`, oldest-to-newest, capped
/// at `limit` (incremental replay, spec §4.2).
pub async fn after_sequence(
    pool: &SqlitePool,
    user_id: &str,
    after_sequence: i64,
    limit: u32,
) -> sqlx::Result<Vec<EventRow>> {
    sqlx::query_as(
        "SELECT * FROM events WHERE user_id = ? AND sequence > ? ORDER BY sequence ASC LIMIT ?",
    )
    .bind(user_id)
    .bind(after_sequence)
    .bind(limit as i64)
    .fetch_all(pool)
    .await
}

/// All events for a user after `after_timestamp_ms`, oldest-to-newest
/// (cross-user anchor resolution; unused in single-user mode but part of
/// the contract per spec §4.2).
pub async fn after_timestamp(
    pool: &SqlitePool,
    user_id: &str,
    after_timestamp_ms: i64,
    limit: u32,
) -> sqlx::Result<Vec<EventRow>> {
    sqlx::query_as(
        "SELECT * FROM events WHERE user_id = ? AND timestamp_ms > ? ORDER BY timestamp_ms ASC LIMIT ?",
    )
    .bind(user_id)
    .bind(after_timestamp_ms)
    .bind(limit as i64)
    .fetch_all(pool)
    .await
}

/// Look up a single event by its server-assigned id, scoped to `user_id`.
pub async fn find_by_id(pool: &SqlitePool, user_id: &str, event_id: &str) -> sqlx::Result<Option<EventRow>> {
    sqlx::query_as("SELECT * FROM events WHERE user_id = ? AND id = ?")
        .bind(user_id)
        .bind(event_id)
        .fetch_optional(pool)
        .await
}

/// Delete every event belonging to `(user_id, session_key)`, used by the
/// stream-delete purge (spec §4.3).
pub async fn delete_for_stream(
    tx: &mut Transaction<'_, Sqlite>,
    user_id: &str,
    session_key: &str,
) -> sqlx::Result<u64> {
    let result = sqlx::query("DELETE FROM events WHERE user_id = ? AND session_key = ?")
        .bind(user_id)
        .bind(session_key)
        .execute(&mut **tx)
        .await?;
    Ok(result.rows_affected())
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
    async fn sequence_is_dense_and_monotonic() {
        let pool = memory_pool().await;
        let mut tx = pool.begin().await.expect("begin");
        let a = append(&mut tx, "s_1", "flynn", "agent:main:clawline:flynn:main", "message", None, "{}")
            .await
            .expect("append a");
        let b = append(&mut tx, "s_2", "flynn", "agent:main:clawline:flynn:main", "message", None, "{}")
            .await
            .expect("append b");
        tx.commit().await.expect("commit");

        assert_eq!(a.sequence, 1);
        assert_eq!(b.sequence, 2);
    }

    #[tokio::test]
    async fn tail_messages_excludes_non_message_events() {
        let pool = memory_pool().await;
        let mut tx = pool.begin().await.expect("begin");
        append(&mut tx, "s_1", "flynn", "agent:main:clawline:flynn:main", "message", None, "{}")
            .await
            .expect("msg");
        append(&mut tx, "s_2", "flynn", "agent:main:clawline:flynn:main", "activity", None, "{}")
            .await
            .expect("activity");
        tx.commit().await.expect("commit");

        let tail = tail_messages(&pool, "flynn", 10).await.expect("tail");
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].id, "s_1");
    }

    #[tokio::test]
    async fn after_sequence_is_ordered_oldest_first() {
        let pool = memory_pool().await;
        let mut tx = pool.begin().await.expect("begin");
        for i in 0..3 {
            append(
                &mut tx,
                &format!("s_{i}"),
                "flynn",
                "agent:main:clawline:flynn:main",
                "message",
                None,
                "{}",
            )
            .await
            .expect("append");
        }
        tx.commit().await.expect("commit");

        let rows = after_sequence(&pool, "flynn", 1, 10).await.expect("after");
        assert_eq!(rows.len(), 2);
        assert!(rows[0].sequence < rows[1].sequence);
    }
}
