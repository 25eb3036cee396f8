//! Block metadata fetching
//!
//! `BucketMetaFetcher` builds a fresh snapshot of every block's descriptor
//! on each call: list the bucket, read each `meta.json`, surface blocks
//! without a readable meta as partial, then run the configured filter chain.
//! The standard chain order is min-age, deletion-mark, no-compact, dedup;
//! deletion marks must be honored before dedup so a block already marked for
//! deletion cannot make a sibling look like a duplicate of a phantom.

use crate::block::{BlockId, BlockMeta, BlockStore, DeletionMark, MarkerError};
use crate::{Error, Result};

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Result of one metadata fetch. `partial` holds blocks that are visible in
/// the bucket but have no readable `meta.json`; they are never compaction
/// candidates.
#[derive(Debug, Default)]
pub struct FetchedMetas {
    pub metas: HashMap<BlockId, BlockMeta>,
    pub partial: HashMap<BlockId, Error>,
}

/// Source of block metadata snapshots.
#[async_trait]
pub trait MetaFetcher: Send + Sync {
    async fn fetch(&self) -> Result<FetchedMetas>;
}

/// A filter applied to a fetched meta map, in place.
#[async_trait]
pub trait MetaFilter: Send + Sync {
    async fn filter(&self, metas: &mut HashMap<BlockId, BlockMeta>) -> Result<()>;
}

/// Fetches metas straight from the bucket and applies a filter chain.
pub struct BucketMetaFetcher {
    store: BlockStore,
    filters: Vec<Arc<dyn MetaFilter>>,
    concurrency: usize,
}

impl BucketMetaFetcher {
    pub fn new(store: BlockStore, filters: Vec<Arc<dyn MetaFilter>>, concurrency: usize) -> Self {
        Self {
            store,
            filters,
            concurrency: concurrency.max(1),
        }
    }
}

#[async_trait]
impl MetaFetcher for BucketMetaFetcher {
    async fn fetch(&self) -> Result<FetchedMetas> {
        let ids = self.store.list_blocks().await?;

        let mut fetched = FetchedMetas::default();
        let mut reads = stream::iter(ids.into_iter().map(|id| {
            let store = self.store.clone();
            async move { (id, store.read_meta(id).await) }
        }))
        .buffer_unordered(self.concurrency);

        while let Some((id, result)) = reads.next().await {
            match result {
                Ok(Some(meta)) => {
                    fetched.metas.insert(id, meta);
                }
                Ok(None) => {
                    fetched.partial.insert(
                        id,
                        Error::InvalidMeta(format!("block {id} has no meta.json")),
                    );
                }
                // A garbled meta marks the block partial; transport
                // failures abort the snapshot.
                Err(e @ (Error::InvalidMeta(_) | Error::Serialization(_))) => {
                    fetched.partial.insert(id, e);
                }
                Err(e) => return Err(e),
            }
        }
        drop(reads);

        for filter in &self.filters {
            filter.filter(&mut fetched.metas).await?;
        }

        debug!(
            blocks = fetched.metas.len(),
            partial = fetched.partial.len(),
            "fetched block metas"
        );
        Ok(fetched)
    }
}

/// Drops blocks younger than `min_age`, judged by the block ID's embedded
/// creation time. Freshly flushed blocks may still be settling in the
/// bucket and are left for a later pass.
pub struct MinAgeFilter {
    min_age: Duration,
}

impl MinAgeFilter {
    pub fn new(min_age: Duration) -> Self {
        Self { min_age }
    }
}

#[async_trait]
impl MetaFilter for MinAgeFilter {
    async fn filter(&self, metas: &mut HashMap<BlockId, BlockMeta>) -> Result<()> {
        if self.min_age.is_zero() {
            return Ok(());
        }
        let now_ms = chrono::Utc::now().timestamp_millis() as u64;
        let cutoff = now_ms.saturating_sub(self.min_age.as_millis() as u64);
        metas.retain(|id, _| id.timestamp_ms() <= cutoff);
        Ok(())
    }
}

/// Records every block carrying a deletion mark and removes it from the
/// snapshot; such blocks are owned by the retention sweeper now.
pub struct IgnoreDeletionMarkFilter {
    store: BlockStore,
    concurrency: usize,
    marked: Mutex<HashMap<BlockId, DeletionMark>>,
}

impl IgnoreDeletionMarkFilter {
    pub fn new(store: BlockStore, concurrency: usize) -> Self {
        Self {
            store,
            concurrency: concurrency.max(1),
            marked: Mutex::new(HashMap::new()),
        }
    }

    /// Deletion marks seen during the last `filter` call.
    pub fn deletion_mark_blocks(&self) -> HashMap<BlockId, DeletionMark> {
        self.marked.lock().clone()
    }
}

#[async_trait]
impl MetaFilter for IgnoreDeletionMarkFilter {
    async fn filter(&self, metas: &mut HashMap<BlockId, BlockMeta>) -> Result<()> {
        let ids: Vec<BlockId> = metas.keys().copied().collect();
        let mut probes = stream::iter(ids.into_iter().map(|id| {
            let store = self.store.clone();
            async move { (id, store.read_marker::<DeletionMark>(id).await) }
        }))
        .buffer_unordered(self.concurrency);

        let mut marked = HashMap::new();
        while let Some((id, result)) = probes.next().await {
            match result {
                Ok(mark) => {
                    marked.insert(id, mark);
                }
                Err(MarkerError::NotFound) => {}
                Err(MarkerError::Unparseable(e)) => {
                    warn!(block = %id, error = %e, "found partial deletion-mark.json, ignoring");
                }
                Err(MarkerError::Store(e)) => return Err(e.into()),
            }
        }
        drop(probes);

        for id in marked.keys() {
            metas.remove(id);
        }
        *self.marked.lock() = marked;
        Ok(())
    }
}
