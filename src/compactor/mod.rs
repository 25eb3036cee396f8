//! Bucket compaction engine
//!
//! The compactor discovers blocks in the bucket, groups them into jobs that
//! are safe to merge concurrently, and drives each job through download,
//! merge, upload, and retirement of the inputs:
//!
//! - Syncing and garbage collection of superseded blocks ([`Syncer`])
//! - Job grouping by (resolution, external labels) ([`grouping`])
//! - Per-job planning and execution ([`planner`], [`runner`])
//! - The outer scheduling loop with a worker pool ([`BucketCompactor`])
//!
//! The TSDB byte format stays behind the [`BlockMerger`] capability and
//! multi-instance job assignment behind [`OwnershipOracle`].

pub mod errors;
pub mod fetch;
pub mod filters;
pub mod grouping;
pub mod planner;
pub mod repair;
pub mod runner;
mod sync;
pub(crate) mod telemetry;

pub use errors::CompactionError;
pub use grouping::{DefaultGrouper, Grouper, Job};
pub use planner::{Planner, SimplePlanner};
pub use runner::{JobOutcome, JobRunner};
pub use sync::Syncer;

use fetch::{BucketMetaFetcher, IgnoreDeletionMarkFilter, MetaFilter, MinAgeFilter};
use filters::{DeduplicateFilter, NoCompactionMarkFilter};
use grouping::sort_jobs_by_key;

use crate::block::{BlockId, BlockMeta, BlockStore, IndexHealthStats, OUT_OF_ORDER_CHUNKS_REASON};
use crate::{Error, Result};

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Merges block bytes on local disk. Implementations own the TSDB block
/// format; the engine never looks inside index or chunk files itself.
///
/// Contract for merge outputs: the produced block directory contains a
/// complete block whose meta lists `sources` as the union of the inputs'
/// sources and `compaction.level` as one above the highest input level.
#[async_trait]
pub trait BlockMerger: Send + Sync {
    /// Merge `input_dirs` into one block under `dest`, returning its ID, or
    /// `None` when the merged result would hold zero samples.
    async fn compact(&self, dest: &Path, input_dirs: &[PathBuf]) -> Result<Option<BlockId>>;

    /// Merge `input_dirs` and split the result by series hash into `shards`
    /// blocks. Slot `i` of the result is `None` iff shard `i` holds zero
    /// samples.
    async fn compact_with_splitting(
        &self,
        dest: &Path,
        input_dirs: &[PathBuf],
        shards: u64,
    ) -> Result<Vec<Option<BlockId>>>;

    /// Rewrite the block in `source` under `dest`, dropping data outside
    /// `[min_time, max_time]`; used by the issue-347 repair. `None` when the
    /// rewrite would be empty.
    async fn write(
        &self,
        dest: &Path,
        source: &Path,
        min_time: i64,
        max_time: i64,
        parent: &BlockMeta,
    ) -> Result<Option<BlockId>>;

    /// Gather index health statistics for a downloaded block.
    async fn gather_index_health(
        &self,
        block_dir: &Path,
        meta: &BlockMeta,
    ) -> Result<IndexHealthStats>;

    /// Verify a block's index against its claimed time range.
    async fn verify_index(&self, block_dir: &Path, min_time: i64, max_time: i64) -> Result<()>;
}

/// Answers whether this instance is responsible for a job. Consulted once
/// when jobs are built and again in the worker immediately before execution,
/// because rebalancing can move a job in between.
#[async_trait]
pub trait OwnershipOracle: Send + Sync {
    async fn owns(&self, job: &Job) -> Result<bool>;
}

/// Oracle for single-instance deployments: owns every job.
#[derive(Debug, Default)]
pub struct OwnEverything;

#[async_trait]
impl OwnershipOracle for OwnEverything {
    async fn owns(&self, _job: &Job) -> Result<bool> {
        Ok(true)
    }
}

/// Compactor configuration
#[derive(Debug, Clone)]
pub struct CompactorConfig {
    /// Worker pool size per iteration
    pub concurrency: usize,
    /// Fan-out for bucket metadata and marker probes
    pub block_sync_concurrency: usize,
    /// Apply a no-compact mark to blocks with out-of-order chunks instead
    /// of failing the job
    pub skip_blocks_with_out_of_order_chunks: bool,
    /// Wall-clock budget per `compact` call; zero = unbounded
    pub max_compaction_time: Duration,
    /// Local working root; job directories live underneath
    pub compact_dir: PathBuf,
    /// Ignore blocks younger than this, so blocks still settling into the
    /// bucket are left alone
    pub min_block_age: Duration,
}

impl Default for CompactorConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            block_sync_concurrency: 20,
            skip_blocks_with_out_of_order_chunks: false,
            max_compaction_time: Duration::ZERO,
            compact_dir: PathBuf::from("./compact"),
            min_block_age: Duration::ZERO,
        }
    }
}

impl CompactorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(Error::Config(
                "compaction concurrency must be > 0".to_string(),
            ));
        }
        if self.block_sync_concurrency == 0 {
            return Err(Error::Config(
                "block sync concurrency must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Wire the standard filter chain and the syncer around it. The chain order
/// is fixed: min-age, deletion-mark, no-compact, dedup.
pub fn standard_syncer(store: &BlockStore, config: &CompactorConfig) -> Arc<Syncer> {
    let dedup = Arc::new(DeduplicateFilter::new());
    let deletion_marks = Arc::new(IgnoreDeletionMarkFilter::new(
        store.clone(),
        config.block_sync_concurrency,
    ));
    let no_compact = Arc::new(NoCompactionMarkFilter::new(
        store.clone(),
        config.block_sync_concurrency,
        true,
    ));
    let filters: Vec<Arc<dyn MetaFilter>> = vec![
        Arc::new(MinAgeFilter::new(config.min_block_age)),
        deletion_marks.clone(),
        no_compact,
        dedup.clone(),
    ];
    let fetcher = Arc::new(BucketMetaFetcher::new(
        store.clone(),
        filters,
        config.block_sync_concurrency,
    ));
    Arc::new(Syncer::new(store.clone(), fetcher, dedup, deletion_marks))
}

/// Compacts blocks in a bucket until a full pass produces no more work or
/// the wall-clock budget expires.
pub struct BucketCompactor {
    config: CompactorConfig,
    store: BlockStore,
    syncer: Arc<Syncer>,
    grouper: Arc<dyn Grouper>,
    merger: Arc<dyn BlockMerger>,
    runner: Arc<JobRunner>,
    ownership: Arc<dyn OwnershipOracle>,
    sort_jobs: fn(&mut [Job]),
}

impl BucketCompactor {
    pub fn new(
        config: CompactorConfig,
        store: BlockStore,
        syncer: Arc<Syncer>,
        grouper: Arc<dyn Grouper>,
        planner: Arc<dyn Planner>,
        merger: Arc<dyn BlockMerger>,
        ownership: Arc<dyn OwnershipOracle>,
    ) -> Result<Self> {
        config.validate()?;
        let runner = Arc::new(JobRunner::new(
            store.clone(),
            Arc::clone(&merger),
            planner,
            config.compact_dir.clone(),
        ));
        Ok(Self {
            config,
            store,
            syncer,
            grouper,
            merger,
            runner,
            ownership,
            sort_jobs: sort_jobs_by_key,
        })
    }

    /// Override the job dispatch order; defaults to ascending key.
    pub fn with_jobs_order(mut self, sort_jobs: fn(&mut [Job])) -> Self {
        self.sort_jobs = sort_jobs;
        self
    }

    pub fn syncer(&self) -> &Arc<Syncer> {
        &self.syncer
    }

    /// Run compaction over the bucket. Returns once a full pass leaves
    /// nothing reschedulable, the time budget expires, or an error escapes
    /// an iteration.
    pub async fn compact(
        &self,
        shutdown: &CancellationToken,
    ) -> std::result::Result<(), CompactionError> {
        let deadline = (!self.config.max_compaction_time.is_zero())
            .then(|| Instant::now() + self.config.max_compaction_time);

        let result = self.compact_loop(shutdown, deadline).await;

        // Keep the working directory when an error occurred: the next run
        // may not have to download everything again.
        if result.is_ok() {
            if let Err(e) = tokio::fs::remove_dir_all(&self.config.compact_dir).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    error!(
                        path = %self.config.compact_dir.display(),
                        error = %e,
                        "failed to remove compaction work directory"
                    );
                }
            }
        }
        result
    }

    async fn compact_loop(
        &self,
        shutdown: &CancellationToken,
        deadline: Option<Instant>,
    ) -> std::result::Result<(), CompactionError> {
        loop {
            let iter_token = shutdown.child_token();
            let (job_tx, job_rx) = mpsc::channel::<Job>(1);
            let job_rx = Arc::new(tokio::sync::Mutex::new(job_rx));
            let (err_tx, mut err_rx) = mpsc::channel::<CompactionError>(self.config.concurrency);
            let finished_all_jobs = Arc::new(AtomicBool::new(true));

            let mut workers: JoinSet<()> = JoinSet::new();
            for _ in 0..self.config.concurrency {
                workers.spawn(worker_loop(WorkerContext {
                    runner: Arc::clone(&self.runner),
                    store: self.store.clone(),
                    merger: Arc::clone(&self.merger),
                    ownership: Arc::clone(&self.ownership),
                    token: iter_token.clone(),
                    skip_out_of_order: self.config.skip_blocks_with_out_of_order_chunks,
                    job_rx: Arc::clone(&job_rx),
                    err_tx: err_tx.clone(),
                    finished_all_jobs: Arc::clone(&finished_all_jobs),
                }));
            }

            info!("start sync of metas");
            self.syncer.sync_metas().await.map_err(|e| e.context("sync"))?;

            info!("start of GC");
            // Blocks compacted by previous runs are normally collected as
            // they retire; after a crash this pass resolves the leftovers.
            self.syncer
                .garbage_collect(&iter_token)
                .await
                .map_err(|e| e.context("garbage"))?;

            let jobs = self
                .grouper
                .groups(&self.syncer.metas())
                .map_err(|e| CompactionError::from(e).context("build compaction jobs"))?;

            // Cheaper to drop unowned jobs here than to hand them to a
            // worker; the worker still re-checks before running.
            let mut jobs = self.filter_own_jobs(jobs).await;
            (self.sort_jobs)(&mut jobs);

            self.clean_stray_paths(&jobs);

            info!(jobs = jobs.len(), "start of compactions");

            let mut job_errs: Vec<CompactionError> = Vec::new();
            let mut max_time_reached = false;
            for job in jobs {
                tokio::select! {
                    Some(e) = err_rx.recv() => {
                        job_errs.push(e);
                        break;
                    }
                    res = job_tx.send(job) => {
                        if res.is_err() {
                            break;
                        }
                    }
                    _ = sleep_until_opt(deadline) => {
                        max_time_reached = true;
                        info!("max compaction time reached, no more compactions will be started");
                        break;
                    }
                }
            }

            drop(job_tx);
            while workers.join_next().await.is_some() {}
            drop(err_tx);
            while let Some(e) = err_rx.recv().await {
                job_errs.push(e);
            }
            iter_token.cancel();

            if let Some(err) = CompactionError::from_errors(job_errs) {
                return Err(err);
            }
            if max_time_reached || finished_all_jobs.load(Ordering::Acquire) {
                break;
            }
        }
        info!("compaction iterations done");
        Ok(())
    }

    async fn filter_own_jobs(&self, jobs: Vec<Job>) -> Vec<Job> {
        let mut owned = Vec::with_capacity(jobs.len());
        for job in jobs {
            match self.ownership.owns(&job).await {
                Ok(true) => owned.push(job),
                Ok(false) => {}
                Err(e) => {
                    info!(
                        group = job.key(),
                        error = %e,
                        "skipped compaction job because unable to check ownership"
                    );
                }
            }
        }
        owned
    }

    /// Delete everything under `compact_dir` that does not belong to a
    /// surviving job. Failures only cost disk space, so they are logged and
    /// skipped.
    fn clean_stray_paths(&self, jobs: &[Job]) {
        let keep: HashMap<String, HashSet<String>> = jobs
            .iter()
            .map(|job| {
                (
                    job.key().to_string(),
                    job.ids().map(|id| id.to_string()).collect(),
                )
            })
            .collect();

        let entries = match std::fs::read_dir(&self.config.compact_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
            Err(e) => {
                warn!(
                    dir = %self.config.compact_dir.display(),
                    error = %e,
                    "failed listing compaction work directory, continuing"
                );
                return;
            }
        };

        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            let path = entry.path();
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);

            let result = match (is_dir, keep.get(&name)) {
                (false, _) => std::fs::remove_file(&path),
                (true, None) => std::fs::remove_dir_all(&path),
                (true, Some(block_ids)) => {
                    remove_stray_children(&path, block_ids);
                    Ok(())
                }
            };
            if let Err(e) = result {
                warn!(
                    path = %path.display(),
                    error = %e,
                    "failed deleting stray compaction path, some disk space may leak; continuing"
                );
            }
        }
    }
}

fn remove_stray_children(job_dir: &Path, keep: &HashSet<String>) {
    let Ok(entries) = std::fs::read_dir(job_dir) else {
        return;
    };
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        if keep.contains(&name) {
            continue;
        }
        let path = entry.path();
        let result = if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            std::fs::remove_dir_all(&path)
        } else {
            std::fs::remove_file(&path)
        };
        if let Err(e) = result {
            warn!(
                path = %path.display(),
                error = %e,
                "failed deleting stray compaction path, some disk space may leak; continuing"
            );
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

struct WorkerContext {
    runner: Arc<JobRunner>,
    store: BlockStore,
    merger: Arc<dyn BlockMerger>,
    ownership: Arc<dyn OwnershipOracle>,
    token: CancellationToken,
    skip_out_of_order: bool,
    job_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Job>>>,
    err_tx: mpsc::Sender<CompactionError>,
    finished_all_jobs: Arc<AtomicBool>,
}

/// Pool worker: run jobs until the channel closes or a job fails in a way
/// the worker cannot recover on its own.
async fn worker_loop(ctx: WorkerContext) {
    loop {
        let job = { ctx.job_rx.lock().await.recv().await };
        let Some(job) = job else { return };

        // Ownership may have moved since the jobs were filtered; another
        // instance picks the job up if it did.
        match ctx.ownership.owns(&job).await {
            Ok(true) => {}
            Ok(false) => {
                info!(
                    group = job.key(),
                    "skipped compaction because the job is not owned by this instance anymore"
                );
                continue;
            }
            Err(e) => {
                info!(
                    group = job.key(),
                    error = %e,
                    "skipped compaction because unable to check whether the job is owned by this instance"
                );
                continue;
            }
        }

        telemetry::record_run_started();

        let err = match ctx.runner.run(&ctx.token, &job).await {
            Ok(outcome) => {
                telemetry::record_run_completed();
                if !outcome.new_blocks.is_empty() {
                    telemetry::record_group_compaction();
                }
                if outcome.reschedule {
                    ctx.finished_all_jobs.store(false, Ordering::Release);
                }
                continue;
            }
            Err(e) => e,
        };

        telemetry::record_run_failed();

        if err.issue347_block().is_some() {
            match repair::repair_issue347(&ctx.store, ctx.merger.as_ref(), &err).await {
                Ok(()) => {
                    ctx.finished_all_jobs.store(false, Ordering::Release);
                    continue;
                }
                Err(repair_err) => {
                    warn!(group = job.key(), error = %repair_err, "block repair failed");
                }
            }
        }

        if ctx.skip_out_of_order {
            if let Some(block) = err.out_of_order_block() {
                match ctx
                    .store
                    .mark_for_no_compact(block, OUT_OF_ORDER_CHUNKS_REASON)
                    .await
                {
                    Ok(_) => {
                        ctx.finished_all_jobs.store(false, Ordering::Release);
                        continue;
                    }
                    Err(mark_err) => {
                        warn!(block = %block, error = %mark_err, "failed to apply no-compact mark");
                    }
                }
            }
        }

        let _ = ctx
            .err_tx
            .send(err.context(format!("group {}", job.key())))
            .await;
        return;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_validation() {
        assert!(CompactorConfig::default().validate().is_ok());

        let zero_workers = CompactorConfig {
            concurrency: 0,
            ..Default::default()
        };
        assert!(zero_workers.validate().is_err());

        let zero_sync = CompactorConfig {
            block_sync_concurrency: 0,
            ..Default::default()
        };
        assert!(zero_sync.validate().is_err());
    }
}
