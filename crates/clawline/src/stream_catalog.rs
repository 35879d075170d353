// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Stream Catalog business logic (spec §4.3, §4.9): built-in seeding,
//! idempotent create/rename/delete, and the stream-delete purge.

use sha2::{Digest, Sha256};
use sqlx::SqlitePool;

use crate::db;
use crate::db::streams::{StreamKind, StreamRow};
use crate::error::{ApiError, ErrorCode};
use crate::ids;

pub struct CreateOutcome {
    pub stream: StreamRow,
    pub replayed: bool,
}

pub struct DeleteOutcome {
    pub deleted_session_key: String,
    /// Asset ids that became unreferenced by this purge; the caller
    /// deletes their backing files after the transaction commits (spec
    /// §4.3: "asset-file removal happens after the DB transaction commits").
    pub orphaned_asset_ids: Vec<String>,
}

/// Seed the built-in streams for a user on first observation: `main`
/// always, `dm` when the deployment has separate DM scope, `global_dm`
/// when the user is an administrator (spec §4.3).
pub async fn ensure_seeded(
    pool: &SqlitePool,
    user_id: &str,
    is_admin: bool,
    dm_scope_enabled: bool,
    admin_global_stream_key: &str,
    agent_id: &str,
    now_ms: i64,
) -> anyhow::Result<()> {
    let existing = db::streams::list_for_user(pool, user_id).await?;
    let has = |suffix: &str| existing.iter().any(|s| s.session_key.ends_with(&format!(":{suffix}")));

    let mut tx = pool.begin().await?;

    if !existing.iter().any(|s| s.kind() == StreamKind::Main) {
        let key = ids::build_stream_key(agent_id, user_id, "main");
        db::streams::insert(&mut tx, user_id, &key, "Main", StreamKind::Main, true, now_ms).await?;
    }

    if dm_scope_enabled && !has("dm") {
        let key = ids::build_stream_key(agent_id, user_id, "dm");
        db::streams::insert(&mut tx, user_id, &key, "Direct Messages", StreamKind::Dm, true, now_ms).await?;
    }

    if is_admin && db::streams::get(pool, user_id, admin_global_stream_key).await?.is_none() {
        db::streams::insert(&mut tx, user_id, admin_global_stream_key, "Admin", StreamKind::GlobalDm, true, now_ms)
            .await?;
    }

    tx.commit().await?;
    Ok(())
}

pub async fn list_for_user(pool: &SqlitePool, user_id: &str) -> anyhow::Result<Vec<StreamRow>> {
    db::streams::list_for_user(pool, user_id).await.map_err(Into::into)
}

fn sanitize_display_name(raw: &str, max_bytes: usize) -> String {
    let stripped: String = raw.chars().filter(|c| !c.is_control()).collect();
    let trimmed = stripped.trim();
    let mut out = trimmed.to_owned();
    if out.len() > max_bytes {
        out.truncate(max_bytes);
        while !out.is_char_boundary(out.len()) {
            out.pop();
        }
    }
    out
}

fn fingerprint(display_name: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(display_name.as_bytes());
    format!("{:x}", hasher.finalize())
}

const CREATE_OPERATION: &str = "create_stream";
const DELETE_OPERATION: &str = "delete_stream";

/// Create a stream (spec §4.3 "Create"). Idempotent on `idempotencyKey`:
/// a replay with the same fingerprint returns the prior result; a replay
/// with a different fingerprint fails `idempotency_key_reused`.
pub async fn create_stream(
    pool: &SqlitePool,
    user_id: &str,
    agent_id: &str,
    display_name: &str,
    idempotency_key: &str,
    max_display_name_bytes: usize,
    max_streams_per_user: usize,
    now_ms: i64,
) -> Result<CreateOutcome, ApiError> {
    let sanitized = sanitize_display_name(display_name, max_display_name_bytes);
    let fp = fingerprint(&sanitized);

    if let Some(prior) = db::idempotency::find(pool, user_id, idempotency_key, CREATE_OPERATION)
        .await
        .map_err(server_error)?
    {
        if prior.request_fingerprint != fp {
            return Err(ApiError::new(ErrorCode::IdempotencyKeyReused, "idempotencyKey reused with a different request"));
        }
        let stream: StreamRow = serde_json::from_str(&prior.response_body).map_err(server_error)?;
        return Ok(CreateOutcome { stream, replayed: true });
    }

    let visible_count = db::streams::list_for_user(pool, user_id).await.map_err(server_error)?.len();
    if visible_count >= max_streams_per_user {
        return Err(ApiError::new(ErrorCode::StreamLimitReached, "visible stream count at cap"));
    }

    let stream = insert_with_retry(pool, user_id, agent_id, &sanitized, now_ms).await?;

    let mut tx = pool.begin().await.map_err(server_error)?;
    let body = serde_json::to_string(&stream).map_err(server_error)?;
    db::idempotency::insert(&mut tx, user_id, idempotency_key, CREATE_OPERATION, &fp, 201, &body, now_ms)
        .await
        .map_err(server_error)?;
    tx.commit().await.map_err(server_error)?;

    Ok(CreateOutcome { stream, replayed: false })
}

/// Generate a fresh custom suffix and insert; retries once on a unique
/// collision (spec §4.3: "On ordering race, retries once with a
/// recomputed max").
async fn insert_with_retry(
    pool: &SqlitePool,
    user_id: &str,
    agent_id: &str,
    display_name: &str,
    now_ms: i64,
) -> Result<StreamRow, ApiError> {
    for _ in 0..2 {
        let suffix = ids::new_custom_suffix();
        let key = ids::build_stream_key(agent_id, user_id, &suffix);

        if db::streams::get(pool, user_id, &key).await.map_err(server_error)?.is_some() {
            continue;
        }

        let mut tx = pool.begin().await.map_err(server_error)?;
        match db::streams::insert(&mut tx, user_id, &key, display_name, StreamKind::Custom, false, now_ms).await {
            Ok(row) => {
                tx.commit().await.map_err(server_error)?;
                return Ok(row);
            }
            Err(_) => continue,
        }
    }
    Err(ApiError::new(ErrorCode::ServerError, "failed to allocate a unique stream key"))
}

/// Rename a stream (spec §4.3 "Rename").
pub async fn rename_stream(
    pool: &SqlitePool,
    user_id: &str,
    session_key: &str,
    display_name: &str,
    max_display_name_bytes: usize,
    now_ms: i64,
) -> Result<StreamRow, ApiError> {
    let existing = db::streams::get(pool, user_id, session_key).await.map_err(server_error)?;
    let Some(existing) = existing else {
        return Err(ApiError::new(ErrorCode::StreamNotFound, "stream does not belong to caller"));
    };
    if existing.is_built_in {
        return Err(ApiError::new(ErrorCode::BuiltInStreamRenameForbidden, "built-in streams cannot be renamed"));
    }

    let sanitized = sanitize_display_name(display_name, max_display_name_bytes);

    let mut tx = pool.begin().await.map_err(server_error)?;
    db::streams::update_display_name(&mut tx, user_id, session_key, &sanitized, now_ms)
        .await
        .map_err(server_error)?;
    tx.commit().await.map_err(server_error)?;

    db::streams::get(pool, user_id, session_key)
        .await
        .map_err(server_error)?
        .ok_or_else(|| ApiError::new(ErrorCode::ServerError, "stream vanished after rename"))
}

/// Delete a stream and purge its messages/events/assets (spec §4.3
/// "Delete"). The HTTP layer is responsible for enforcing the
/// `x-clawline-user-action: delete_stream` confirmation header before
/// calling this.
pub async fn delete_stream(
    pool: &SqlitePool,
    user_id: &str,
    session_key: &str,
    idempotency_key: Option<&str>,
    now_ms: i64,
) -> Result<DeleteOutcome, ApiError> {
    if let Some(key) = idempotency_key {
        if let Some(prior) = db::idempotency::find(pool, user_id, key, DELETE_OPERATION).await.map_err(server_error)? {
            if prior.request_fingerprint != session_key {
                return Err(ApiError::new(ErrorCode::IdempotencyKeyReused, "idempotencyKey reused with a different request"));
            }
            return Ok(DeleteOutcome { deleted_session_key: session_key.to_owned(), orphaned_asset_ids: vec![] });
        }
    }

    let existing = db::streams::get(pool, user_id, session_key).await.map_err(server_error)?;
    let Some(existing) = existing else {
        return Err(ApiError::new(ErrorCode::StreamNotFound, "stream does not belong to caller"));
    };
    if existing.is_built_in {
        return Err(ApiError::new(ErrorCode::BuiltInStreamDeleteForbidden, "built-in streams cannot be deleted"));
    }

    let visible_count = db::streams::list_for_user(pool, user_id).await.map_err(server_error)?.len();
    if visible_count <= 1 {
        return Err(ApiError::new(ErrorCode::LastStreamDeleteForbidden, "at least one visible stream must remain"));
    }

    let mut tx = pool.begin().await.map_err(server_error)?;
    let linked_assets = db::messages::delete_for_stream(&mut tx, user_id, session_key).await.map_err(server_error)?;
    db::events::delete_for_stream(&mut tx, user_id, session_key).await.map_err(server_error)?;
    db::streams::delete(&mut tx, user_id, session_key).await.map_err(server_error)?;

    let orphaned = db::assets::unreferenced(&mut tx, &linked_assets).await.map_err(server_error)?;
    for asset_id in &orphaned {
        db::assets::delete(&mut tx, asset_id).await.map_err(server_error)?;
    }

    if let Some(key) = idempotency_key {
        db::idempotency::insert(&mut tx, user_id, key, DELETE_OPERATION, session_key, 200, "{}", now_ms)
            .await
            .map_err(server_error)?;
    }

    tx.commit().await.map_err(server_error)?;

    Ok(DeleteOutcome { deleted_session_key: session_key.to_owned(), orphaned_asset_ids: orphaned })
}

fn server_error(e: impl std::fmt::Display) -> ApiError {
    ApiError::new(ErrorCode::ServerError, e.to_string())
}
