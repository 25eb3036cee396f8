//! Repair of blocks with chunks crossing the block time range (the
//! repairable tsdb#347 corruption class): download the broken block, rewrite
//! it without the offending chunks, upload the rewritten block, and retire
//! the original.

use super::errors::{retry, CompactionError};
use super::runner::read_local_meta;
use super::BlockMerger;
use crate::block::{BlockId, BlockStore};
use crate::Error;

use std::path::Path;
use tracing::{info, warn};

/// Run the repair for an [`CompactionError::Issue347`] failure. On success
/// the rewritten block is in the bucket and the broken one is marked for
/// deletion; the caller re-runs the iteration to pick the new block up.
pub async fn repair_issue347(
    store: &BlockStore,
    merger: &dyn BlockMerger,
    err: &CompactionError,
) -> Result<(), CompactionError> {
    let Some(id) = err.issue347_block() else {
        return Err(CompactionError::from(Error::Internal(format!(
            "given error is not repairable: {err}"
        ))));
    };

    info!(block = %id, cause = %err, "repairing block with chunks outside its time range");

    let tmpdir = std::env::temp_dir().join(format!(
        "repair-issue-347-{}-{}",
        id,
        uuid::Uuid::new_v4()
    ));
    let result = repair_in(store, merger, id, &tmpdir).await;
    if let Err(e) = tokio::fs::remove_dir_all(&tmpdir).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(tmpdir = %tmpdir.display(), error = %e, "failed to remove repair tmpdir");
        }
    }
    result
}

async fn repair_in(
    store: &BlockStore,
    merger: &dyn BlockMerger,
    id: BlockId,
    tmpdir: &Path,
) -> Result<(), CompactionError> {
    let bdir = tmpdir.join(id.to_string());
    store
        .download_block(id, &bdir)
        .await
        .map_err(|e| retry(e.wrap(format!("download block {id}"))))?;

    let meta = read_local_meta(&bdir)
        .await
        .map_err(|e| CompactionError::from(e.wrap(format!("read meta from {}", bdir.display()))))?;

    let repaired = merger
        .write(tmpdir, &bdir, meta.min_time, meta.max_time, &meta)
        .await
        .map_err(|e| CompactionError::from(e.wrap(format!("repair failed for block {id}"))))?
        .ok_or_else(|| {
            CompactionError::from(Error::Merge(format!("repair of block {id} produced no block")))
        })?;

    let repaired_dir = tmpdir.join(repaired.to_string());
    merger
        .verify_index(&repaired_dir, meta.min_time, meta.max_time)
        .await
        .map_err(|e| CompactionError::from(e.wrap(format!("repaired block is invalid {repaired}"))))?;

    info!(new_block = %repaired, "uploading repaired block");
    store
        .upload_block(repaired, &repaired_dir)
        .await
        .map_err(|e| retry(e.wrap(format!("upload of {repaired} failed"))))?;

    info!(block = %id, "deleting broken block");
    store
        .mark_for_deletion_detached(id, "source of repaired block")
        .await
        .map_err(|e| {
            CompactionError::from(e.wrap(format!("marking old block {id} for deletion has failed")))
        })?;
    Ok(())
}
