//! Bucket meta synchronization and garbage collection
//!
//! The syncer owns the engine's view of the bucket: a snapshot of block
//! metas plus the partial-block map, both replaced wholesale by `sync_metas`
//! and trimmed in place by `garbage_collect`. The snapshot is the only
//! shared mutable state between the scheduler and its workers; writes happen
//! only from the scheduler, reads take a clone.

use super::errors::{retry, CompactionError};
use super::fetch::{IgnoreDeletionMarkFilter, MetaFetcher};
use super::filters::DeduplicateFilter;
use super::telemetry;
use crate::block::{BlockId, BlockMeta, BlockStore};
use crate::Error;

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Default)]
struct SyncState {
    blocks: HashMap<BlockId, BlockMeta>,
    partial: HashMap<BlockId, String>,
}

/// Synchronizes block metas from the bucket and garbage-collects blocks
/// whose data is fully covered by a higher-level compaction.
pub struct Syncer {
    store: BlockStore,
    fetcher: Arc<dyn MetaFetcher>,
    dedup_filter: Arc<DeduplicateFilter>,
    deletion_mark_filter: Arc<IgnoreDeletionMarkFilter>,
    state: Mutex<SyncState>,
}

impl Syncer {
    pub fn new(
        store: BlockStore,
        fetcher: Arc<dyn MetaFetcher>,
        dedup_filter: Arc<DeduplicateFilter>,
        deletion_mark_filter: Arc<IgnoreDeletionMarkFilter>,
    ) -> Self {
        Self {
            store,
            fetcher,
            dedup_filter,
            deletion_mark_filter,
            state: Mutex::new(SyncState::default()),
        }
    }

    /// Replace the snapshot with a fresh fetch. Fetch failures are
    /// transient by definition and surface as retriable.
    pub async fn sync_metas(&self) -> Result<(), CompactionError> {
        let fetched = self
            .fetcher
            .fetch()
            .await
            .map_err(retry)?;

        let mut state = self.state.lock();
        state.blocks = fetched.metas;
        state.partial = fetched
            .partial
            .into_iter()
            .map(|(id, err)| (id, err.to_string()))
            .collect();
        Ok(())
    }

    /// Current snapshot of compactable block metas.
    pub fn metas(&self) -> HashMap<BlockId, BlockMeta> {
        self.state.lock().blocks.clone()
    }

    /// Blocks whose files were present but whose meta could not be read at
    /// the last sync, with the reason.
    pub fn partial(&self) -> HashMap<BlockId, String> {
        self.state.lock().partial.clone()
    }

    /// Mark every duplicate block for deletion and drop it from the
    /// snapshot so the current pass does not plan around ghosts.
    ///
    /// Any failure aborts the collection and is retriable: marks already
    /// written stay written, and re-marking is idempotent.
    pub async fn garbage_collect(&self, token: &CancellationToken) -> Result<(), CompactionError> {
        let begin = Instant::now();

        let deletion_marked = self.deletion_mark_filter.deletion_mark_blocks();
        let garbage: Vec<BlockId> = self
            .dedup_filter
            .duplicate_ids()
            .into_iter()
            .filter(|id| !deletion_marked.contains_key(id))
            .collect();

        for id in garbage {
            if token.is_cancelled() {
                return Err(retry(Error::Cancelled));
            }

            info!(block = %id, "marking outdated block for deletion");
            // The mark write runs on its own timeout so a shutdown signal
            // mid-GC cannot leave it half-written.
            if let Err(e) = self.store.mark_for_deletion_detached(id, "outdated block").await {
                telemetry::record_garbage_collection_failure();
                return Err(retry(e.wrap(format!("mark block {id} for deletion"))));
            }

            self.state.lock().blocks.remove(&id);
            telemetry::record_garbage_collected_block();
        }

        telemetry::record_garbage_collection(begin.elapsed().as_secs_f64());
        Ok(())
    }
}
