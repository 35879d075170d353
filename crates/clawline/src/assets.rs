// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Asset blob storage: the on-disk half of the `Asset` entity (spec §3,
//! §4.6/§4.7). Metadata lives in `db::assets`; this module owns the bytes.

use std::path::{Path, PathBuf};

use tokio::fs;

use crate::db::assets::AssetRow;
use crate::error::{ApiError, ErrorCode};
use crate::ids::new_asset_id;

/// Where an asset's bytes live under the media directory:
/// `<media_dir>/assets/<assetId>`.
pub fn blob_path(assets_dir: &Path, asset_id: &str) -> PathBuf {
    assets_dir.join(asset_id)
}

/// Write `bytes` for a brand-new asset id, atomically (write to `tmp_dir`,
/// then rename into place), grounded on the same tmp+rename discipline
/// used for the pairing state files.
pub async fn store_new(assets_dir: &Path, tmp_dir: &Path, bytes: &[u8]) -> anyhow::Result<String> {
    fs::create_dir_all(assets_dir).await?;
    fs::create_dir_all(tmp_dir).await?;

    let asset_id = new_asset_id();
    let tmp_path = tmp_dir.join(format!("{asset_id}.tmp"));
    fs::write(&tmp_path, bytes).await?;
    fs::rename(&tmp_path, blob_path(assets_dir, &asset_id)).await?;

    Ok(asset_id)
}

/// Read an asset's bytes, having already confirmed DB ownership via
/// `db::assets::find_owned`.
pub async fn read(assets_dir: &Path, row: &AssetRow) -> Result<Vec<u8>, ApiError> {
    fs::read(blob_path(assets_dir, &row.asset_id))
        .await
        .map_err(|_| ApiError::new(ErrorCode::AssetNotFound, "asset file missing from disk"))
}

/// Remove an asset's backing file. Best-effort: a missing file is not an
/// error, since the DB row is the source of truth for "does this asset
/// still exist" and the purge path may race a prior partial cleanup.
pub async fn delete(assets_dir: &Path, asset_id: &str) -> anyhow::Result<()> {
    match fs::remove_file(blob_path(assets_dir, asset_id)).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn store_new_then_read_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let assets_dir = dir.path().join("assets");
        let tmp_dir = dir.path().join("tmp");

        let asset_id = store_new(&assets_dir, &tmp_dir, b"hello").await.expect("store");
        let row = AssetRow {
            asset_id: asset_id.clone(),
            user_id: "flynn".to_owned(),
            mime_type: "image/png".to_owned(),
            size: 5,
            created_at: 0,
            uploader_device_id: "d1".to_owned(),
        };

        let bytes = read(&assets_dir, &row).await.expect("read");
        assert_eq!(bytes, b"hello");
    }

    #[tokio::test]
    async fn delete_missing_file_is_not_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let assets_dir = dir.path().join("assets");
        fs::create_dir_all(&assets_dir).await.expect("mkdir");

        delete(&assets_dir, "a_00000000-0000-4000-8000-000000000001").await.expect("delete absent is ok");
    }
}
