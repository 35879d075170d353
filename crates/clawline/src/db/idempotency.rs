// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Stream-catalog idempotency memos (spec §4.3 create/delete replay).

use sqlx::{FromRow, Sqlite, SqlitePool, Transaction};

#[derive(Debug, Clone, FromRow)]
pub struct IdempotencyRow {
    pub user_id: String,
    pub idempotency_key: String,
    pub operation: String,
    pub request_fingerprint: String,
    pub status: i64,
    pub response_body: String,
    pub created_at: i64,
}

pub async fn find(
    pool: &SqlitePool,
    user_id: &str,
    idempotency_key: &str,
    operation: &str,
) -> sqlx::Result<Option<IdempotencyRow>> {
    sqlx::query_as(
        "SELECT * FROM idempotency_records WHERE user_id = ? AND idempotency_key = ? AND operation = ?",
    )
    .bind(user_id)
    .bind(idempotency_key)
    .bind(operation)
    .fetch_optional(pool)
    .await
}

#[allow(clippy::too_many_arguments)]
pub async fn insert(
    tx: &mut Transaction<'_, Sqlite>,
    user_id: &str,
    idempotency_key: &str,
    operation: &str,
    request_fingerprint: &str,
    status: i64,
    response_body: &str,
    now_ms: i64,
) -> sqlx::Result<()> {
    sqlx::query(
        "INSERT INTO idempotency_records (user_id, idempotency_key, operation, request_fingerprint, status, response_body, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(user_id)
    .bind(idempotency_key)
    .bind(operation)
    .bind(request_fingerprint)
    .bind(status)
    .bind(response_body)
    .bind(now_ms)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Delete memos older than the retention window (spec §3 7-day default).
pub async fn prune_older_than(pool: &SqlitePool, before_ms: i64) -> sqlx::Result<u64> {
    let result = sqlx::query("DELETE FROM idempotency_records WHERE created_at < ?")
        .bind(before_ms)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}
