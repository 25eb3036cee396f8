//! Dedup and no-compact filters
//!
//! Both run as part of the fetch filter chain and keep their last result
//! queryable: the syncer's garbage collector consumes `duplicate_ids`, and
//! operators consume `no_compact_marked_blocks` through logs.

use super::fetch::MetaFilter;
use super::grouping::group_key;
use crate::block::{BlockId, BlockMeta, BlockStore, MarkerError, NoCompactMark};
use crate::Result;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use tracing::warn;

/// Identifies blocks whose entire source set is covered by another block of
/// the same stream, making them safe to retire.
#[derive(Default)]
pub struct DeduplicateFilter {
    duplicates: Mutex<Vec<BlockId>>,
}

impl DeduplicateFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// IDs classified duplicate by the last `filter` call, sorted ascending.
    pub fn duplicate_ids(&self) -> Vec<BlockId> {
        self.duplicates.lock().clone()
    }
}

/// `b` is covered by `a` when every source of `b` is also a source of `a`.
/// Equal source sets tie-break on (compaction level, id) so exactly one of
/// the pair survives.
fn covered_by(b: &BlockMeta, a: &BlockMeta) -> bool {
    if a.id == b.id || b.compaction.sources.is_empty() {
        return false;
    }
    let a_sources: BTreeSet<&BlockId> = a.compaction.sources.iter().collect();
    let subset = b.compaction.sources.iter().all(|s| a_sources.contains(s));
    if !subset {
        return false;
    }
    if b.compaction.sources.len() == a.compaction.sources.len() {
        (b.compaction.level, b.id) < (a.compaction.level, a.id)
    } else {
        true
    }
}

#[async_trait]
impl MetaFilter for DeduplicateFilter {
    async fn filter(&self, metas: &mut HashMap<BlockId, BlockMeta>) -> Result<()> {
        let mut duplicates: Vec<BlockId> = {
            let mut groups: HashMap<String, Vec<&BlockMeta>> = HashMap::new();
            for meta in metas.values() {
                groups.entry(group_key(meta)).or_default().push(meta);
            }

            groups
                .values()
                .flat_map(|members| {
                    members
                        .iter()
                        .filter(|b| members.iter().any(|a| covered_by(b, a)))
                        .map(|b| b.id)
                })
                .collect()
        };
        duplicates.sort_unstable();

        for id in &duplicates {
            metas.remove(id);
        }
        *self.duplicates.lock() = duplicates;
        Ok(())
    }
}

/// Finds blocks carrying a no-compact mark. When `remove` is set the blocks
/// are dropped from the snapshot in place; otherwise they are only recorded.
pub struct NoCompactionMarkFilter {
    store: BlockStore,
    concurrency: usize,
    remove: bool,
    marked: Mutex<HashMap<BlockId, NoCompactMark>>,
}

impl NoCompactionMarkFilter {
    pub fn new(store: BlockStore, concurrency: usize, remove: bool) -> Self {
        Self {
            store,
            concurrency: concurrency.max(1),
            remove,
            marked: Mutex::new(HashMap::new()),
        }
    }

    /// Blocks found marked during the last `filter` call.
    pub fn no_compact_marked_blocks(&self) -> HashMap<BlockId, NoCompactMark> {
        self.marked.lock().clone()
    }
}

#[async_trait]
impl MetaFilter for NoCompactionMarkFilter {
    async fn filter(&self, metas: &mut HashMap<BlockId, BlockMeta>) -> Result<()> {
        let ids: Vec<BlockId> = metas.keys().copied().collect();
        let mut probes = stream::iter(ids.into_iter().map(|id| {
            let store = self.store.clone();
            async move { (id, store.read_marker::<NoCompactMark>(id).await) }
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
                    warn!(
                        block = %id,
                        error = %e,
                        "found partial no-compact-mark.json; if this repeats for the same block, consider deleting the marker manually"
                    );
                }
                Err(MarkerError::Store(e)) => return Err(e.into()),
            }
        }
        drop(probes);

        if self.remove {
            for id in marked.keys() {
                metas.remove(id);
            }
        }
        *self.marked.lock() = marked;
        Ok(())
    }
}
