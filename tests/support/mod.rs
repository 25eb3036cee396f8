//! Shared harness for the compactor integration suites: an in-memory
//! bucket, a scriptable block merger, and canned ownership oracles.

#![allow(dead_code)]

use strata::block::{
    BlockId, BlockMeta, BlockStats, BlockStore, CompactionInfo, DeletionMark, IndexHealthStats,
    NoCompactMark,
};
use strata::compactor::{
    standard_syncer, BlockMerger, BucketCompactor, CompactorConfig, DefaultGrouper, Grouper, Job,
    OwnershipOracle, SimplePlanner,
};
use strata::Result;

use async_trait::async_trait;
use object_store::memory::InMemory;
use object_store::ObjectStore;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub fn in_memory_store() -> BlockStore {
    BlockStore::new(Arc::new(InMemory::new()))
}

/// A level-1 block descriptor with itself as its only source.
pub fn make_meta(labels: &[(&str, &str)], min_time: i64, max_time: i64, samples: u64) -> BlockMeta {
    let id = BlockId::new();
    BlockMeta {
        id,
        min_time,
        max_time,
        compaction: CompactionInfo {
            level: 1,
            sources: vec![id],
            parents: vec![],
        },
        labels: labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        resolution: 0,
        stats: BlockStats {
            num_samples: samples,
            num_series: 1,
            num_chunks: 1,
        },
        hash_func: None,
        checksums: None,
    }
}

/// Put a complete synthetic block (meta, index, one chunk) into the bucket.
pub async fn seed_block(store: &BlockStore, meta: &BlockMeta) {
    let bucket = store.bucket();
    let prefix = meta.id.to_string();
    bucket
        .put(
            &object_store::path::Path::from(format!("{prefix}/index")),
            bytes::Bytes::from_static(b"index-bytes").into(),
        )
        .await
        .unwrap();
    bucket
        .put(
            &object_store::path::Path::from(format!("{prefix}/chunks/000001")),
            bytes::Bytes::from_static(b"chunk-bytes").into(),
        )
        .await
        .unwrap();
    bucket
        .put(
            &object_store::path::Path::from(format!("{prefix}/meta.json")),
            meta.to_json().unwrap().into(),
        )
        .await
        .unwrap();
}

pub async fn is_marked_for_deletion(store: &BlockStore, id: BlockId) -> bool {
    store.read_marker::<DeletionMark>(id).await.is_ok()
}

pub async fn is_marked_no_compact(store: &BlockStore, id: BlockId) -> bool {
    store.read_marker::<NoCompactMark>(id).await.is_ok()
}

/// Metas of all blocks in the bucket that carry no deletion mark.
pub async fn live_blocks(store: &BlockStore) -> Vec<BlockMeta> {
    let mut live = Vec::new();
    for id in store.list_blocks().await.unwrap() {
        if is_marked_for_deletion(store, id).await {
            continue;
        }
        if let Some(meta) = store.read_meta(id).await.unwrap() {
            live.push(meta);
        }
    }
    live
}

#[derive(Default)]
struct MockState {
    health: HashMap<BlockId, IndexHealthStats>,
    fail_compact: bool,
    fail_output_verify: bool,
    fail_write: bool,
    compact_delay: Duration,
    compact_calls: usize,
}

/// Scriptable [`BlockMerger`]: merges synthetic blocks by summing their
/// stats and uniting their sources, with injectable faults.
#[derive(Clone, Default)]
pub struct MockMerger {
    state: Arc<Mutex<MockState>>,
}

impl MockMerger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report the given index health for a block at download time.
    pub fn set_health(&self, id: BlockId, stats: IndexHealthStats) {
        self.state.lock().health.insert(id, stats);
    }

    pub fn fail_compact(&self) {
        self.state.lock().fail_compact = true;
    }

    pub fn fail_output_verify(&self) {
        self.state.lock().fail_output_verify = true;
    }

    pub fn fail_write(&self) {
        self.state.lock().fail_write = true;
    }

    pub fn set_compact_delay(&self, delay: Duration) {
        self.state.lock().compact_delay = delay;
    }

    pub fn compact_calls(&self) -> usize {
        self.state.lock().compact_calls
    }

    fn read_input_metas(input_dirs: &[PathBuf]) -> Result<Vec<BlockMeta>> {
        input_dirs
            .iter()
            .map(|dir| {
                let bytes = std::fs::read(dir.join("meta.json"))?;
                BlockMeta::from_json(&bytes)
            })
            .collect()
    }

    fn write_block(dest: &Path, meta: &BlockMeta) -> Result<()> {
        let dir = dest.join(meta.id.to_string());
        std::fs::create_dir_all(dir.join("chunks"))?;
        std::fs::write(dir.join("meta.json"), meta.to_json()?)?;
        std::fs::write(dir.join("index"), b"merged-index")?;
        std::fs::write(dir.join("chunks/000001"), b"merged-chunks")?;
        std::fs::write(dir.join("tombstones"), b"")?;
        Ok(())
    }

    fn merged_meta(inputs: &[BlockMeta]) -> BlockMeta {
        let sources: BTreeSet<BlockId> = inputs
            .iter()
            .flat_map(|m| m.compaction.sources.iter().copied())
            .collect();
        BlockMeta {
            id: BlockId::new(),
            min_time: inputs.iter().map(|m| m.min_time).min().unwrap_or(0),
            max_time: inputs.iter().map(|m| m.max_time).max().unwrap_or(0),
            compaction: CompactionInfo {
                level: inputs.iter().map(|m| m.compaction.level).max().unwrap_or(0) + 1,
                sources: sources.into_iter().collect(),
                parents: inputs.iter().map(|m| m.id).collect(),
            },
            labels: BTreeMap::new(),
            resolution: inputs.first().map(|m| m.resolution).unwrap_or(0),
            stats: BlockStats {
                num_samples: inputs.iter().map(|m| m.stats.num_samples).sum(),
                num_series: inputs.iter().map(|m| m.stats.num_series).sum(),
                num_chunks: inputs.iter().map(|m| m.stats.num_chunks).sum(),
            },
            hash_func: None,
            checksums: None,
        }
    }

    async fn pre_compact(&self) -> Result<()> {
        let (delay, fail) = {
            let mut state = self.state.lock();
            state.compact_calls += 1;
            (state.compact_delay, state.fail_compact)
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if fail {
            return Err(strata::Error::Merge("injected merge failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl BlockMerger for MockMerger {
    async fn compact(&self, dest: &Path, input_dirs: &[PathBuf]) -> Result<Option<BlockId>> {
        self.pre_compact().await?;
        let inputs = Self::read_input_metas(input_dirs)?;
        let meta = Self::merged_meta(&inputs);
        if meta.stats.num_samples == 0 {
            return Ok(None);
        }
        Self::write_block(dest, &meta)?;
        Ok(Some(meta.id))
    }

    async fn compact_with_splitting(
        &self,
        dest: &Path,
        input_dirs: &[PathBuf],
        shards: u64,
    ) -> Result<Vec<Option<BlockId>>> {
        self.pre_compact().await?;
        let inputs = Self::read_input_metas(input_dirs)?;
        let all_sources: BTreeSet<BlockId> = inputs
            .iter()
            .flat_map(|m| m.compaction.sources.iter().copied())
            .collect();

        // Deterministic stand-in for series-hash splitting: input i lands
        // in shard i % shards.
        let mut outputs = Vec::with_capacity(shards as usize);
        for shard in 0..shards as usize {
            let members: Vec<BlockMeta> = inputs
                .iter()
                .enumerate()
                .filter(|(ix, _)| ix % shards as usize == shard)
                .map(|(_, m)| m.clone())
                .collect();
            let samples: u64 = members.iter().map(|m| m.stats.num_samples).sum();
            if samples == 0 {
                outputs.push(None);
                continue;
            }
            let mut meta = Self::merged_meta(&members);
            meta.compaction.sources = all_sources.iter().copied().collect();
            meta.compaction.level =
                inputs.iter().map(|m| m.compaction.level).max().unwrap_or(0) + 1;
            Self::write_block(dest, &meta)?;
            outputs.push(Some(meta.id));
        }
        Ok(outputs)
    }

    async fn write(
        &self,
        dest: &Path,
        source: &Path,
        _min_time: i64,
        _max_time: i64,
        _parent: &BlockMeta,
    ) -> Result<Option<BlockId>> {
        if self.state.lock().fail_write {
            return Err(strata::Error::Merge("injected rewrite failure".to_string()));
        }
        let bytes = std::fs::read(source.join("meta.json"))?;
        let mut meta = BlockMeta::from_json(&bytes)?;
        meta.id = BlockId::new();
        Self::write_block(dest, &meta)?;
        Ok(Some(meta.id))
    }

    async fn gather_index_health(
        &self,
        _block_dir: &Path,
        meta: &BlockMeta,
    ) -> Result<IndexHealthStats> {
        Ok(self
            .state
            .lock()
            .health
            .get(&meta.id)
            .copied()
            .unwrap_or_default())
    }

    async fn verify_index(&self, block_dir: &Path, _min_time: i64, _max_time: i64) -> Result<()> {
        if self.state.lock().fail_output_verify {
            return Err(strata::Error::Merge(format!(
                "injected verify failure for {}",
                block_dir.display()
            )));
        }
        if !block_dir.join("meta.json").exists() {
            return Err(strata::Error::InvalidMeta(format!(
                "no block at {}",
                block_dir.display()
            )));
        }
        Ok(())
    }
}

/// Owns only jobs whose key is in the set; `None` owns everything.
pub struct SelectiveOracle {
    pub owned_keys: Option<HashSet<String>>,
}

#[async_trait]
impl OwnershipOracle for SelectiveOracle {
    async fn owns(&self, job: &Job) -> Result<bool> {
        Ok(match &self.owned_keys {
            None => true,
            Some(keys) => keys.contains(job.key()),
        })
    }
}

/// Owns jobs for the first `n` checks, then disowns everything. Exercises
/// the ownership re-check between job filtering and execution.
pub struct CountdownOracle {
    remaining: AtomicI64,
}

impl CountdownOracle {
    pub fn new(n: i64) -> Self {
        Self {
            remaining: AtomicI64::new(n),
        }
    }
}

#[async_trait]
impl OwnershipOracle for CountdownOracle {
    async fn owns(&self, _job: &Job) -> Result<bool> {
        Ok(self.remaining.fetch_sub(1, Ordering::SeqCst) > 0)
    }
}

/// Default grouper, but every job splits its output into `shards`.
pub struct SplittingGrouper {
    pub shards: u64,
}

impl Grouper for SplittingGrouper {
    fn groups(&self, blocks: &HashMap<BlockId, BlockMeta>) -> Result<Vec<Job>> {
        DefaultGrouper
            .groups(blocks)?
            .into_iter()
            .map(|job| job.with_splitting(self.shards))
            .collect()
    }
}

/// Standard wiring: in-memory bucket, mock merger, simple planner.
pub fn build_compactor(
    store: &BlockStore,
    merger: &MockMerger,
    grouper: Arc<dyn Grouper>,
    oracle: Arc<dyn OwnershipOracle>,
    config: CompactorConfig,
) -> BucketCompactor {
    let syncer = standard_syncer(store, &config);
    BucketCompactor::new(
        config,
        store.clone(),
        syncer,
        grouper,
        Arc::new(SimplePlanner),
        Arc::new(merger.clone()),
        oracle,
    )
    .unwrap()
}

/// Config pointing compact_dir into a fresh temp dir kept alive by the
/// returned guard.
pub fn test_config(tmp: &tempfile::TempDir) -> CompactorConfig {
    CompactorConfig {
        concurrency: 2,
        block_sync_concurrency: 8,
        compact_dir: tmp.path().join("compact"),
        ..Default::default()
    }
}
