//! Persistent asset cache.
//!
//! Completed assets are written under a root directory keyed by their id:
//!   {root}/{hex[0..2]}/{hex}        asset bytes
//!   {root}/{hex[0..2]}/{hex}.name   asset name
//!
//! Files are immutable. An id that exists on disk is never rewritten, and a
//! file whose bytes no longer hash to its id is treated as missing.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use bytes::Bytes;
use memmap2::Mmap;
use tavern_core::AssetId;

use crate::asset_store::Asset;

#[derive(Debug, Clone)]
pub struct DiskAssetCache {
    root: PathBuf,
}

impl DiskAssetCache {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("failed to create asset cache root: {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn has(&self, id: &AssetId) -> bool {
        self.asset_path(id).exists()
    }

    /// Load a cached asset. `None` if absent or if the file is damaged.
    pub fn get(&self, id: &AssetId) -> Result<Option<Asset>> {
        let path = self.asset_path(id);
        if !path.exists() {
            return Ok(None);
        }

        let file = fs::File::open(&path)
            .with_context(|| format!("failed to open cached asset: {}", path.display()))?;
        let bytes = if file.metadata().map(|m| m.len()).unwrap_or(0) == 0 {
            Bytes::new()
        } else {
            // Safety: opened read-only and the mapping is copied out before
            // it is dropped; cache files are never modified in place.
            let mmap = unsafe {
                Mmap::map(&file)
                    .with_context(|| format!("failed to mmap cached asset: {}", path.display()))?
            };
            Bytes::copy_from_slice(&mmap)
        };
        let name = fs::read_to_string(name_path(&path)).unwrap_or_default();

        match Asset::verified(*id, name, bytes) {
            Ok(asset) => Ok(Some(asset)),
            Err(e) => {
                tracing::warn!(asset = %id.short(), error = %e, "damaged cache entry discarded");
                let _ = fs::remove_file(&path);
                let _ = fs::remove_file(name_path(&path));
                Ok(None)
            }
        }
    }

    /// Write `asset` unless it is already cached. Writes go to a temp file
    /// that is renamed into place, so readers never see a partial file.
    pub fn put(&self, asset: &Asset) -> Result<()> {
        let path = self.asset_path(&asset.id());
        if path.exists() {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create cache dir: {}", parent.display()))?;
        }

        fs::write(name_path(&path), asset.name())
            .with_context(|| format!("failed to write asset name for {}", path.display()))?;

        let tmp_path = path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp_path)
                .with_context(|| format!("failed to create temp file: {}", tmp_path.display()))?;
            file.write_all(asset.bytes())
                .context("failed to write asset bytes")?;
            file.sync_all().context("failed to sync asset to disk")?;
        }
        fs::rename(&tmp_path, &path).with_context(|| {
            format!("failed to rename {} to {}", tmp_path.display(), path.display())
        })?;

        tracing::trace!(asset = %asset.id().short(), name = asset.name(), "asset cached on disk");
        Ok(())
    }

    /// Number of cached assets.
    pub fn count(&self) -> usize {
        let mut total = 0;
        if let Ok(entries) = fs::read_dir(&self.root) {
            for entry in entries.flatten() {
                if let Ok(files) = fs::read_dir(entry.path()) {
                    total += files
                        .flatten()
                        .filter(|f| f.path().extension().is_none())
                        .count();
                }
            }
        }
        total
    }

    pub fn clear(&self) {
        if let Ok(entries) = fs::read_dir(&self.root) {
            for entry in entries.flatten() {
                let _ = fs::remove_dir_all(entry.path());
            }
        }
    }

    fn asset_path(&self, id: &AssetId) -> PathBuf {
        let hex = hex::encode(id.as_bytes());
        self.root.join(&hex[0..2]).join(hex)
    }
}

fn name_path(asset_path: &Path) -> PathBuf {
    asset_path.with_extension("name")
}
