//! Single-job execution: download, verify, merge, upload, retire.

use super::errors::{halt, issue347, out_of_order_chunks, retry, CompactionError};
use super::grouping::Job;
use super::planner::Planner;
use super::telemetry;
use super::BlockMerger;
use crate::block::{self, BlockId, BlockMeta, BlockStore, format_shard_id_label, SHARD_ID_LABEL};
use crate::Error;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Result of one job run.
#[derive(Debug, Default)]
pub struct JobOutcome {
    /// The iteration made progress and the scheduler must run another full
    /// pass even if no queued jobs remain.
    pub reschedule: bool,
    /// IDs of the uploaded output blocks.
    pub new_blocks: Vec<BlockId>,
}

/// Executes one compaction job end to end against its work directory
/// `<compact_dir>/<job key>/`.
pub struct JobRunner {
    store: BlockStore,
    merger: Arc<dyn BlockMerger>,
    planner: Arc<dyn Planner>,
    compact_dir: PathBuf,
}

impl JobRunner {
    pub fn new(
        store: BlockStore,
        merger: Arc<dyn BlockMerger>,
        planner: Arc<dyn Planner>,
        compact_dir: PathBuf,
    ) -> Self {
        Self {
            store,
            merger,
            planner,
            compact_dir,
        }
    }

    pub async fn run(&self, token: &CancellationToken, job: &Job) -> Result<JobOutcome, CompactionError> {
        let begin = Instant::now();
        let job_dir = self.compact_dir.join(job.key());

        let result = self.run_inner(token, job, &job_dir).await;
        let elapsed = begin.elapsed();
        info!(
            group = job.key(),
            success = result.is_ok(),
            duration_ms = elapsed.as_millis() as u64,
            "compaction job finished"
        );

        // The work directory is kept on failure, both for inspection and so
        // the next run does not have to download everything again.
        if result.is_ok() {
            if let Err(e) = tokio::fs::remove_dir_all(&job_dir).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    error!(
                        group = job.key(),
                        path = %job_dir.display(),
                        error = %e,
                        "failed to remove compaction job work directory"
                    );
                }
            }
        }
        result
    }

    async fn run_inner(
        &self,
        token: &CancellationToken,
        job: &Job,
        job_dir: &Path,
    ) -> Result<JobOutcome, CompactionError> {
        create_work_dir(job_dir)
            .await
            .map_err(|e| CompactionError::from(e.wrap("create compaction job dir")))?;

        let plan = self
            .planner
            .plan(job.metas())
            .await
            .map_err(|e| CompactionError::from(e.wrap("plan compaction")))?;
        if plan.is_empty() {
            return Ok(JobOutcome::default());
        }

        info!(
            group = job.key(),
            blocks = plan.len(),
            min_time = block::min_time(&plan).unwrap_or_default(),
            max_time = block::max_time(&plan).unwrap_or_default(),
            "compaction available and planned; downloading blocks"
        );

        let begin = Instant::now();
        self.download_and_verify(token, job_dir, &plan).await?;
        info!(
            group = job.key(),
            blocks = plan.len(),
            duration_ms = begin.elapsed().as_millis() as u64,
            "downloaded and verified blocks; compacting blocks"
        );

        let input_dirs: Vec<PathBuf> = plan
            .iter()
            .map(|m| job_dir.join(m.id.to_string()))
            .collect();

        if token.is_cancelled() {
            return Err(retry(Error::Cancelled));
        }

        let begin = Instant::now();
        let outputs: Vec<Option<BlockId>> = if job.use_splitting() {
            self.merger
                .compact_with_splitting(job_dir, &input_dirs, job.splitting_shards())
                .await
        } else {
            self.merger
                .compact(job_dir, &input_dirs)
                .await
                .map(|id| vec![id])
        }
        // Inputs already passed integrity checks, so a merge failure is a
        // logic or resource bug.
        .map_err(|e| halt(e.wrap("compact blocks")))?;

        if outputs.iter().all(Option::is_none) {
            // The merged result would have no samples: prune empty inputs
            // and let the next pass converge.
            info!(group = job.key(), "compacted block would have no samples, deleting source blocks");
            for meta in plan.iter().filter(|m| m.stats.num_samples == 0) {
                if let Err(e) = self.retire_input(job_dir, meta.id).await {
                    warn!(
                        block = %meta.id,
                        error = %e,
                        "failed to mark for deletion an empty block found during compaction"
                    );
                }
            }
            return Ok(JobOutcome {
                reschedule: true,
                new_blocks: vec![],
            });
        }

        info!(
            group = job.key(),
            new = ?outputs.iter().flatten().collect::<Vec<_>>(),
            duration_ms = begin.elapsed().as_millis() as u64,
            "compacted blocks"
        );

        let begin = Instant::now();
        let new_blocks = self.finalize_and_upload(token, job, job_dir, &outputs).await?;
        info!(
            group = job.key(),
            blocks = new_blocks.len(),
            duration_ms = begin.elapsed().as_millis() as u64,
            "uploaded all blocks"
        );

        // Only now that the outputs are uploaded and verified is it safe to
        // retire the inputs; inputs and outputs coexist until the marks land.
        for meta in &plan {
            self.retire_input(job_dir, meta.id)
                .await
                .map_err(|e| retry(e.wrap("mark old block for deletion from bucket")))?;
            telemetry::record_garbage_collected_block();
        }

        Ok(JobOutcome {
            reschedule: true,
            new_blocks,
        })
    }

    /// Download every planned block concurrently and classify its index
    /// health. The first failure in plan order wins.
    async fn download_and_verify(
        &self,
        token: &CancellationToken,
        job_dir: &Path,
        plan: &[BlockMeta],
    ) -> Result<(), CompactionError> {
        let mut tasks: JoinSet<(usize, Result<(), CompactionError>)> = JoinSet::new();
        for (ix, meta) in plan.iter().enumerate() {
            let store = self.store.clone();
            let merger = Arc::clone(&self.merger);
            let meta = meta.clone();
            let bdir = job_dir.join(meta.id.to_string());
            let token = token.clone();
            tasks.spawn(async move {
                (ix, download_one(&store, merger.as_ref(), &token, &meta, &bdir).await)
            });
        }

        let mut failures: Vec<(usize, CompactionError)> = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((ix, Err(e))) => failures.push((ix, e)),
                Err(e) => failures.push((
                    usize::MAX,
                    CompactionError::from(Error::Internal(format!("download task panicked: {e}"))),
                )),
            }
        }

        failures.sort_by_key(|(ix, _)| *ix);
        match failures.into_iter().next() {
            Some((_, e)) => Err(e),
            None => Ok(()),
        }
    }

    async fn finalize_and_upload(
        &self,
        token: &CancellationToken,
        job: &Job,
        job_dir: &Path,
        outputs: &[Option<BlockId>],
    ) -> Result<Vec<BlockId>, CompactionError> {
        let mut tasks: JoinSet<(usize, Result<Option<BlockId>, CompactionError>)> = JoinSet::new();
        for (shard_ix, out) in outputs.iter().enumerate() {
            let Some(out_id) = *out else {
                if job.use_splitting() {
                    info!(
                        group = job.key(),
                        shard_id = format_shard_id_label(shard_ix as u64, job.splitting_shards()),
                        "compaction produced an empty block"
                    );
                } else {
                    info!(group = job.key(), "compaction produced an empty block");
                }
                continue;
            };

            let store = self.store.clone();
            let merger = Arc::clone(&self.merger);
            let job = job.clone();
            let out_dir = job_dir.join(out_id.to_string());
            let token = token.clone();
            tasks.spawn(async move {
                let result =
                    finalize_one(&store, merger.as_ref(), &token, &job, shard_ix, out_id, &out_dir)
                        .await
                        .map(|()| Some(out_id));
                (shard_ix, result)
            });
        }

        let mut finished: Vec<(usize, Result<Option<BlockId>, CompactionError>)> = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(entry) => finished.push(entry),
                Err(e) => finished.push((
                    usize::MAX,
                    Err(CompactionError::from(Error::Internal(format!(
                        "upload task panicked: {e}"
                    )))),
                )),
            }
        }
        finished.sort_by_key(|(ix, _)| *ix);

        let mut new_blocks = Vec::new();
        for (_, result) in finished {
            if let Some(id) = result? {
                new_blocks.push(id);
            }
        }
        Ok(new_blocks)
    }

    /// Remove the local copy of a retired input and mark it for deletion in
    /// the bucket. The mark runs on its own timeout; see
    /// [`crate::block::DETACHED_MARK_TIMEOUT`].
    async fn retire_input(&self, job_dir: &Path, id: BlockId) -> crate::Result<()> {
        let local = job_dir.join(id.to_string());
        if let Err(e) = tokio::fs::remove_dir_all(&local).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(Error::from(e).wrap(format!("remove old block dir {id}")));
            }
        }
        info!(block = %id, "marking compacted block for deletion");
        self.store
            .mark_for_deletion_detached(id, "source of compacted block")
            .await?;
        Ok(())
    }
}

async fn download_one(
    store: &BlockStore,
    merger: &dyn BlockMerger,
    token: &CancellationToken,
    meta: &BlockMeta,
    bdir: &Path,
) -> Result<(), CompactionError> {
    if token.is_cancelled() {
        return Err(retry(Error::Cancelled));
    }

    store
        .download_block(meta.id, bdir)
        .await
        .map_err(|e| retry(e.wrap(format!("download block {}", meta.id))))?;

    let stats = merger
        .gather_index_health(bdir, meta)
        .await
        .map_err(|e| CompactionError::from(e.wrap(format!("gather index issues for block {}", meta.id))))?;

    if let Err(e) = stats.critical_err(meta.id) {
        return Err(halt(e.wrap(format!(
            "block with not healthy index found {}; compaction level {}; labels {:?}",
            bdir.display(),
            meta.compaction.level,
            meta.labels
        ))));
    }
    if let Err(e) = stats.out_of_order_chunks_err(meta.id) {
        return Err(out_of_order_chunks(
            meta.id,
            e.wrap(format!("blocks with out-of-order chunks are dropped from compaction: {}", bdir.display())),
        ));
    }
    if let Err(e) = stats.issue_347_err(meta.id) {
        return Err(issue347(
            meta.id,
            e.wrap(format!("invalid, but repairable block {}", bdir.display())),
        ));
    }
    if let Err(e) = stats.outside_chunks_err(meta.id) {
        return Err(CompactionError::from(e.wrap(format!("block id {}", meta.id))));
    }
    Ok(())
}

async fn finalize_one(
    store: &BlockStore,
    merger: &dyn BlockMerger,
    token: &CancellationToken,
    job: &Job,
    shard_ix: usize,
    out_id: BlockId,
    out_dir: &Path,
) -> Result<(), CompactionError> {
    if token.is_cancelled() {
        return Err(retry(Error::Cancelled));
    }

    let mut meta = read_local_meta(out_dir)
        .await
        .map_err(|e| CompactionError::from(e.wrap(format!("failed to finalize the block {}", out_dir.display()))))?;

    meta.labels = job.labels().clone();
    if job.use_splitting() {
        meta.labels.insert(
            SHARD_ID_LABEL.to_string(),
            format_shard_id_label(shard_ix as u64, job.splitting_shards()),
        );
    }
    meta.resolution = job.resolution();
    write_local_meta(out_dir, &meta)
        .await
        .map_err(|e| CompactionError::from(e.wrap(format!("failed to finalize the block {}", out_dir.display()))))?;

    let tombstones = out_dir.join("tombstones");
    if let Err(e) = tokio::fs::remove_file(&tombstones).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            return Err(CompactionError::from(Error::from(e).wrap("remove tombstones")));
        }
    }

    merger
        .verify_index(out_dir, meta.min_time, meta.max_time)
        .await
        .map_err(|e| halt(e.wrap(format!("invalid result block {}", out_dir.display()))))?;

    store
        .upload_block(out_id, out_dir)
        .await
        .map_err(|e| retry(e.wrap(format!("upload of {out_id} failed"))))?;

    info!(
        result_block = %out_id,
        external_labels = ?meta.labels,
        "uploaded block"
    );
    Ok(())
}

async fn create_work_dir(dir: &Path) -> crate::Result<()> {
    let mut builder = tokio::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    builder.mode(0o750);
    builder.create(dir).await?;
    Ok(())
}

pub(super) async fn read_local_meta(dir: &Path) -> crate::Result<BlockMeta> {
    let bytes = tokio::fs::read(dir.join("meta.json")).await?;
    BlockMeta::from_json(&bytes)
}

pub(super) async fn write_local_meta(dir: &Path, meta: &BlockMeta) -> crate::Result<()> {
    tokio::fs::write(dir.join("meta.json"), meta.to_json()?).await?;
    Ok(())
}
