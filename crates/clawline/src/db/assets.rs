// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Asset metadata storage (spec §3 `Asset`, §4.6/§4.7).

use sqlx::{FromRow, Sqlite, SqlitePool, Transaction};

#[derive(Debug, Clone, FromRow)]
pub struct AssetRow {
    pub asset_id: String,
    pub user_id: String,
    pub mime_type: String,
    pub size: i64,
    pub created_at: i64,
    pub uploader_device_id: String,
}

pub async fn insert(
    tx: &mut Transaction<'_, Sqlite>,
    asset_id: &str,
    user_id: &str,
    mime_type: &str,
    size: i64,
    uploader_device_id: &str,
    now_ms: i64,
) -> sqlx::Result<AssetRow> {
    sqlx::query(
        "INSERT INTO assets (asset_id, user_id, mime_type, size, created_at, uploader_device_id)
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(asset_id)
    .bind(user_id)
    .bind(mime_type)
    .bind(size)
    .bind(now_ms)
    .bind(uploader_device_id)
    .execute(&mut **tx)
    .await?;

    Ok(AssetRow {
        asset_id: asset_id.to_owned(),
        user_id: user_id.to_owned(),
        mime_type: mime_type.to_owned(),
        size,
        created_at: now_ms,
        uploader_device_id: uploader_device_id.to_owned(),
    })
}

/// Fetch an asset, scoped to its owning user so a device cannot reference
/// another user's upload (spec §4.7 ownership check).
pub async fn find_owned(pool: &SqlitePool, user_id: &str, asset_id: &str) -> sqlx::Result<Option<AssetRow>> {
    sqlx::query_as("SELECT * FROM assets WHERE user_id = ? AND asset_id = ?")
        .bind(user_id)
        .bind(asset_id)
        .fetch_optional(pool)
        .await
}

/// Given a set of candidate asset ids (just unlinked from a purged
/// stream), return the subset that no `message_assets` row still
/// references — these are safe to delete, file and row alike.
pub async fn unreferenced(
    tx: &mut Transaction<'_, Sqlite>,
    candidate_asset_ids: &[String],
) -> sqlx::Result<Vec<String>> {
    let mut orphaned = Vec::new();
    for asset_id in candidate_asset_ids {
        let still_referenced: Option<i64> =
            sqlx::query_scalar("SELECT 1 FROM message_assets WHERE asset_id = ? LIMIT 1")
                .bind(asset_id)
                .fetch_optional(&mut **tx)
                .await?;
        if still_referenced.is_none() {
            orphaned.push(asset_id.clone());
        }
    }
    Ok(orphaned)
}

pub async fn delete(tx: &mut Transaction<'_, Sqlite>, asset_id: &str) -> sqlx::Result<()> {
    sqlx::query("DELETE FROM assets WHERE asset_id = ?")
        .bind(asset_id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// Assets older than `before_ms` with no remaining `message_assets` row,
/// candidates for the background TTL sweep (spec §3 asset lifecycle).
pub async fn unreferenced_older_than(pool: &SqlitePool, before_ms: i64) -> sqlx::Result<Vec<AssetRow>> {
    sqlx::query_as(
        "SELECT a.* FROM assets a
         WHERE a.created_at < ?
           AND NOT EXISTS (SELECT 1 FROM message_assets ma WHERE ma.asset_id = a.asset_id)",
    )
    .bind(before_ms)
    .fetch_all(pool)
    .await
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
    async fn find_owned_rejects_cross_user_lookup() {
        let pool = memory_pool().await;
        let mut tx = pool.begin().await.expect("begin");
        insert(&mut tx, "a_1", "flynn", "image/png", 10, "d1", 0).await.expect("insert");
        tx.commit().await.expect("commit");

        let owned = find_owned(&pool, "flynn", "a_1").await.expect("lookup");
        assert!(owned.is_some());
        let not_owned = find_owned(&pool, "tron", "a_1").await.expect("lookup");
        assert!(not_owned.is_none());
    }

    #[tokio::test]
    async fn unreferenced_excludes_linked_assets() {
        let pool = memory_pool().await;
        let mut tx = pool.begin().await.expect("begin");
        insert(&mut tx, "a_1", "flynn", "image/png", 10, "d1", 0).await.expect("insert asset");
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
        crate::db::messages::insert(
            &mut tx,
            "d1",
            "c_1",
            "flynn",
            "s_1",
            1,
            "hash-a",
            "hash-b",
            crate::db::messages::StreamingState::Active,
            0,
        )
        .await
        .expect("message");
        crate::db::messages::link_asset(&mut tx, "d1", "c_1", "a_1").await.expect("link");

        let candidates = vec!["a_1".to_owned()];
        let orphaned = unreferenced(&mut tx, &candidates).await.expect("unreferenced");
        assert!(orphaned.is_empty());
        tx.commit().await.expect("commit");
    }
}
