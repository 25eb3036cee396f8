//! Block model: metadata, integrity stats, and bucket sidecar marks
//!
//! A block is an immutable slice of time-series data living in the object
//! store under `<id>/`. Its descriptor (`meta.json`) is the unit the
//! compactor reasons about; the index and chunk bytes themselves are only
//! touched through the merger capability.

mod marks;
mod store;

pub use marks::{
    read_marker, DeletionMark, Marker, MarkerError, NoCompactMark, OUT_OF_ORDER_CHUNKS_REASON,
};
pub use store::{BlockStore, DETACHED_MARK_TIMEOUT};

use crate::{Error, Result};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Identifier of a stored block. ULIDs sort lexicographically in creation
/// order, so listing a bucket yields blocks oldest-first.
pub type BlockId = ulid::Ulid;

/// Raw (non-downsampled) resolution.
pub const RESOLUTION_RAW: i64 = 0;
/// Five-minute downsample resolution, in milliseconds.
pub const RESOLUTION_5M: i64 = 300_000;
/// One-hour downsample resolution, in milliseconds.
pub const RESOLUTION_1H: i64 = 3_600_000;

/// External label injected on split-compaction outputs.
pub const SHARD_ID_LABEL: &str = "__compactor_shard_id__";

/// Format the value of [`SHARD_ID_LABEL`] for shard `index` out of `total`.
pub fn format_shard_id_label(index: u64, total: u64) -> String {
    format!("{}_of_{}", index + 1, total)
}

/// Hash function used to produce per-file checksums at upload time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashFunc {
    Sha256,
}

/// Compaction lineage of a block.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactionInfo {
    /// Number of merge generations; freshly ingested blocks are level 1.
    pub level: u32,
    /// IDs of all level-1 blocks that contributed to this block, kept
    /// sorted ascending.
    #[serde(default)]
    pub sources: Vec<BlockId>,
    /// Direct parents of the last merge, if any.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parents: Vec<BlockId>,
}

/// Sample-level statistics of a block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockStats {
    pub num_samples: u64,
    #[serde(default)]
    pub num_series: u64,
    #[serde(default)]
    pub num_chunks: u64,
}

/// Immutable descriptor of one stored block (`<id>/meta.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockMeta {
    pub id: BlockId,
    /// Inclusive millisecond bounds of contained samples.
    pub min_time: i64,
    pub max_time: i64,
    pub compaction: CompactionInfo,
    /// External labels identifying the stream (tenant, shard, downsample
    /// lane). Blocks with different label sets never merge.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Downsample resolution in milliseconds; 0 = raw.
    #[serde(default)]
    pub resolution: i64,
    #[serde(default)]
    pub stats: BlockStats,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash_func: Option<HashFunc>,
    /// Per-file checksums, present when `hash_func` is set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksums: Option<BTreeMap<String, String>>,
}

impl BlockMeta {
    /// Parse a `meta.json` payload.
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let meta: BlockMeta = serde_json::from_slice(bytes)?;
        if meta.compaction.level == 0 {
            return Err(Error::InvalidMeta(format!(
                "block {} has compaction level 0",
                meta.id
            )));
        }
        Ok(meta)
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }
}

/// Smallest `min_time` across a set of metas, in milliseconds.
pub fn min_time(metas: &[BlockMeta]) -> Option<i64> {
    metas.iter().map(|m| m.min_time).min()
}

/// Largest `max_time` across a set of metas, in milliseconds.
pub fn max_time(metas: &[BlockMeta]) -> Option<i64> {
    metas.iter().map(|m| m.max_time).max()
}

/// Index health statistics gathered from a downloaded block.
///
/// Produced by the merger capability after download; the runner turns each
/// non-zero category into the corresponding error classification.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexHealthStats {
    /// Series whose chunks are not sorted by time. Unrepairable.
    pub out_of_order_series: u64,
    /// Chunks out of order within an otherwise sorted series.
    pub out_of_order_chunks: u64,
    /// Chunks exactly outside the block time range (the repairable
    /// tsdb#347 corruption class).
    pub issue_347_outside_chunks: u64,
    /// Chunks otherwise outside the block time range (prometheus#5372).
    pub outside_chunks: u64,
}

impl IndexHealthStats {
    /// Unrepairable corruption: the block must halt compaction.
    pub fn critical_err(&self, block: BlockId) -> Result<()> {
        if self.out_of_order_series > 0 {
            return Err(Error::UnhealthyIndex {
                block,
                reason: format!("{} series with out-of-order chunks", self.out_of_order_series),
            });
        }
        Ok(())
    }

    pub fn out_of_order_chunks_err(&self, block: BlockId) -> Result<()> {
        if self.out_of_order_chunks > 0 {
            return Err(Error::UnhealthyIndex {
                block,
                reason: format!("{} out-of-order chunks", self.out_of_order_chunks),
            });
        }
        Ok(())
    }

    pub fn issue_347_err(&self, block: BlockId) -> Result<()> {
        if self.issue_347_outside_chunks > 0 {
            return Err(Error::UnhealthyIndex {
                block,
                reason: format!(
                    "{} chunks outside time range (issue 347)",
                    self.issue_347_outside_chunks
                ),
            });
        }
        Ok(())
    }

    pub fn outside_chunks_err(&self, block: BlockId) -> Result<()> {
        if self.outside_chunks > 0 {
            return Err(Error::UnhealthyIndex {
                block,
                reason: format!("{} chunks outside time range", self.outside_chunks),
            });
        }
        Ok(())
    }
}
