// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Stream catalog storage (spec §4.3).

use serde::{Deserialize, Serialize};
use sqlx::{FromRow, Sqlite, SqlitePool, Transaction};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Main,
    Dm,
    GlobalDm,
    Custom,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Main => "main",
            Self::Dm => "dm",
            Self::GlobalDm => "global_dm",
            Self::Custom => "custom",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "main" => Self::Main,
            "dm" => Self::Dm,
            "global_dm" => Self::GlobalDm,
            _ => Self::Custom,
        }
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct StreamRow {
    pub user_id: String,
    pub session_key: String,
    pub display_name: String,
    pub kind: String,
    pub order_index: i64,
    pub is_built_in: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

impl StreamRow {
    pub fn kind(&self) -> StreamKind {
        StreamKind::from_str(&self.kind)
    }
}

/// All streams for a user, sorted `(orderIndex, sessionKey)` per spec §4.3.
pub async fn list_for_user(pool: &SqlitePool, user_id: &str) -> sqlx::Result<Vec<StreamRow>> {
    sqlx::query_as(
        "SELECT * FROM stream_sessions WHERE user_id = ? ORDER BY order_index ASC, session_key ASC",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await
}

pub async fn get(pool: &SqlitePool, user_id: &str, session_key: &str) -> sqlx::Result<Option<StreamRow>> {
    sqlx::query_as("SELECT * FROM stream_sessions WHERE user_id = ? AND session_key = ?")
        .bind(user_id)
        .bind(session_key)
        .fetch_optional(pool)
        .await
}

async fn max_order_index(tx: &mut Transaction<'_, Sqlite>, user_id: &str) -> sqlx::Result<i64> {
    let max: Option<i64> =
        sqlx::query_scalar("SELECT MAX(order_index) FROM stream_sessions WHERE user_id = ?")
            .bind(user_id)
            .fetch_one(&mut **tx)
            .await?;
    Ok(max.unwrap_or(-1))
}

/// Insert a stream at the next free `orderIndex`. The caller retries once
/// on a unique-constraint race (spec §4.3 "On ordering race, retries once
/// with a recomputed max").
pub async fn insert(
    tx: &mut Transaction<'_, Sqlite>,
    user_id: &str,
    session_key: &str,
    display_name: &str,
    kind: StreamKind,
    is_built_in: bool,
    now_ms: i64,
) -> sqlx::Result<StreamRow> {
    let order_index = max_order_index(tx, user_id).await? + 1;

    sqlx::query(
        "INSERT INTO stream_sessions (user_id, session_key, display_name, kind, order_index, is_built_in, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(user_id)
    .bind(session_key)
    .bind(display_name)
    .bind(kind.as_str())
    .bind(order_index)
    .bind(is_built_in)
    .bind(now_ms)
    .bind(now_ms)
    .execute(&mut **tx)
    .await?;

    Ok(StreamRow {
        user_id: user_id.to_owned(),
        session_key: session_key.to_owned(),
        display_name: display_name.to_owned(),
        kind: kind.as_str().to_owned(),
        order_index,
        is_built_in,
        created_at: now_ms,
        updated_at: now_ms,
    })
}

pub async fn update_display_name(
    tx: &mut Transaction<'_, Sqlite>,
    user_id: &str,
    session_key: &str,
    display_name: &str,
    now_ms: i64,
) -> sqlx::Result<bool> {
    let result = sqlx::query(
        "UPDATE stream_sessions SET display_name = ?, updated_at = ? WHERE user_id = ? AND session_key = ?",
    )
    .bind(display_name)
    .bind(now_ms)
    .bind(user_id)
    .bind(session_key)
    .execute(&mut **tx)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn delete(
    tx: &mut Transaction<'_, Sqlite>,
    user_id: &str,
    session_key: &str,
) -> sqlx::Result<bool> {
    let result = sqlx::query("DELETE FROM stream_sessions WHERE user_id = ? AND session_key = ?")
        .bind(user_id)
        .bind(session_key)
        .execute(&mut **tx)
        .await?;
    Ok(result.rows_affected() > 0)
}
