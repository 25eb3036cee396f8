//! Block-level bucket operations
//!
//! Bucket layout per block: `<id>/meta.json`, `<id>/index`,
//! `<id>/chunks/*`, plus the optional mark sidecars. This module is the only
//! place that writes marks or whole blocks; everything else goes through it.

use super::marks::{DeletionMark, Marker, MarkerError, NoCompactMark};
use super::{BlockId, BlockMeta};
use crate::compactor::telemetry;
use crate::{Error, Result};

use futures::TryStreamExt;
use object_store::path::Path as StorePath;
use object_store::ObjectStore;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Budget for mark writes that must complete even while shutting down.
/// Leaving a retired block unmarked grows the bucket monotonically, so mark
/// writes run to completion on a fresh timeout instead of inheriting the
/// iteration's cancellation.
pub const DETACHED_MARK_TIMEOUT: Duration = Duration::from_secs(5 * 60);

const META_FILENAME: &str = "meta.json";

/// Bucket accessor for whole-block operations.
#[derive(Clone)]
pub struct BlockStore {
    bucket: Arc<dyn ObjectStore>,
}

impl BlockStore {
    pub fn new(bucket: Arc<dyn ObjectStore>) -> Self {
        Self { bucket }
    }

    pub fn bucket(&self) -> &Arc<dyn ObjectStore> {
        &self.bucket
    }

    fn meta_path(id: BlockId) -> StorePath {
        StorePath::from(format!("{id}/{META_FILENAME}"))
    }

    fn marker_path<M: Marker>(id: BlockId) -> StorePath {
        StorePath::from(format!("{}/{}", id, M::FILENAME))
    }

    /// List the IDs of all block directories in the bucket. Prefixes that do
    /// not parse as block IDs are ignored.
    pub async fn list_blocks(&self) -> Result<Vec<BlockId>> {
        let listing = self.bucket.list_with_delimiter(None).await?;
        let mut ids = Vec::with_capacity(listing.common_prefixes.len());
        for prefix in listing.common_prefixes {
            if let Ok(id) = prefix.as_ref().parse::<BlockId>() {
                ids.push(id);
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    /// Read and parse `<id>/meta.json`. `Ok(None)` means the block exists
    /// without a readable meta, i.e. it is partial.
    pub async fn read_meta(&self, id: BlockId) -> Result<Option<BlockMeta>> {
        match self.bucket.get(&Self::meta_path(id)).await {
            Ok(result) => {
                let bytes = result.bytes().await?;
                Ok(Some(BlockMeta::from_json(&bytes)?))
            }
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Download all files of a block into `dest`, preserving the in-bucket
    /// layout (`dest/index`, `dest/chunks/...`).
    pub async fn download_block(&self, id: BlockId, dest: &Path) -> Result<()> {
        let prefix = StorePath::from(id.to_string());
        let objects: Vec<_> = self
            .bucket
            .list(Some(&prefix))
            .try_collect()
            .await
            .map_err(Error::from)?;
        if objects.is_empty() {
            return Err(Error::InvalidMeta(format!("block {id} not found in bucket")));
        }

        tokio::fs::create_dir_all(dest).await?;
        for object in objects {
            let rel = object
                .location
                .as_ref()
                .strip_prefix(&format!("{id}/"))
                .ok_or_else(|| {
                    Error::Internal(format!("unexpected listing entry {}", object.location))
                })?
                .to_string();
            let local = dest.join(&rel);
            if let Some(parent) = local.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let bytes = self.bucket.get(&object.location).await?.bytes().await?;
            tokio::fs::write(&local, &bytes).await?;
        }
        debug!(block = %id, dest = %dest.display(), "downloaded block");
        Ok(())
    }

    /// Upload a local block directory as `<id>/...`. Data files go first and
    /// `meta.json` last, so an interrupted upload is observable as a partial
    /// block rather than a corrupt one.
    pub async fn upload_block(&self, id: BlockId, dir: &Path) -> Result<()> {
        let files = collect_files(dir)?;
        let meta_local = dir.join(META_FILENAME);
        if !files.contains(&meta_local) {
            return Err(Error::InvalidMeta(format!(
                "block dir {} has no meta.json",
                dir.display()
            )));
        }

        for file in files.iter().filter(|f| **f != meta_local) {
            self.upload_file(id, dir, file).await?;
        }
        self.upload_file(id, dir, &meta_local).await?;
        telemetry::record_block_uploaded();
        Ok(())
    }

    async fn upload_file(&self, id: BlockId, dir: &Path, file: &Path) -> Result<()> {
        let rel = file
            .strip_prefix(dir)
            .map_err(|e| Error::Internal(format!("path outside block dir: {e}")))?;
        let key = StorePath::from(format!("{}/{}", id, rel.display()));
        let bytes = tokio::fs::read(file).await?;
        self.bucket.put(&key, bytes::Bytes::from(bytes).into()).await?;
        Ok(())
    }

    /// Write the deletion mark for `id`. Idempotent: an existing mark is left
    /// in place and reported as `Ok(false)`.
    pub async fn mark_for_deletion(&self, id: BlockId, reason: &str) -> Result<bool> {
        if self.marker_exists::<DeletionMark>(id).await? {
            debug!(block = %id, "block already marked for deletion");
            return Ok(false);
        }
        let mark = DeletionMark::new(id, reason);
        self.put_marker(id, &mark).await?;
        telemetry::record_block_marked_for_deletion();
        info!(block = %id, reason, "marked block for deletion");
        Ok(true)
    }

    /// Write the no-compact mark for `id`. Idempotent like
    /// [`Self::mark_for_deletion`].
    pub async fn mark_for_no_compact(&self, id: BlockId, reason: &str) -> Result<bool> {
        if self.marker_exists::<NoCompactMark>(id).await? {
            debug!(block = %id, "block already marked no-compact");
            return Ok(false);
        }
        let mark = NoCompactMark::new(id, reason);
        self.put_marker(id, &mark).await?;
        telemetry::record_block_marked_no_compact(reason);
        info!(block = %id, reason, "marked block for no compaction");
        Ok(true)
    }

    /// [`Self::mark_for_deletion`] under [`DETACHED_MARK_TIMEOUT`], ignoring
    /// any ambient cancellation.
    pub async fn mark_for_deletion_detached(&self, id: BlockId, reason: &str) -> Result<bool> {
        tokio::time::timeout(DETACHED_MARK_TIMEOUT, self.mark_for_deletion(id, reason))
            .await
            .map_err(|_| Error::Timeout)?
    }

    async fn put_marker<M: Marker + serde::Serialize>(&self, id: BlockId, mark: &M) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(mark)?;
        self.bucket
            .put(&Self::marker_path::<M>(id), bytes::Bytes::from(bytes).into())
            .await?;
        Ok(())
    }

    async fn marker_exists<M: Marker>(&self, id: BlockId) -> Result<bool> {
        // A garbage marker still counts as present; overwriting an
        // operator-written file is worse than re-reporting it.
        match self.bucket.head(&Self::marker_path::<M>(id)).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Read a marker for `id`, mapped through [`MarkerError`].
    pub async fn read_marker<M: Marker>(&self, id: BlockId) -> std::result::Result<M, MarkerError> {
        super::marks::read_marker(self.bucket.as_ref(), id).await
    }
}

fn collect_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        for entry in std::fs::read_dir(&current)? {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                stack.push(path);
            } else {
                files.push(path);
            }
        }
    }
    files.sort();
    Ok(files)
}
