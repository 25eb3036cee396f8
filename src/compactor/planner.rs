//! Compaction planning
//!
//! The planner decides which subset of a job's blocks to merge in the
//! current iteration. Selection policy is deliberately pluggable; the
//! engine only relies on the contract below.

use crate::block::BlockMeta;
use crate::Result;

use async_trait::async_trait;

/// Chooses the blocks to merge next for one job.
#[async_trait]
pub trait Planner: Send + Sync {
    /// `metas_by_min_time` is the job's full block set ordered by min time.
    /// The result must be a subset of the input with order preserved; an
    /// empty result means the job has nothing to do this pass.
    async fn plan(&self, metas_by_min_time: &[BlockMeta]) -> Result<Vec<BlockMeta>>;
}

/// Merges a job's entire block set whenever it holds at least two blocks.
#[derive(Debug, Default)]
pub struct SimplePlanner;

#[async_trait]
impl Planner for SimplePlanner {
    async fn plan(&self, metas_by_min_time: &[BlockMeta]) -> Result<Vec<BlockMeta>> {
        if metas_by_min_time.len() < 2 {
            return Ok(Vec::new());
        }
        Ok(metas_by_min_time.to_vec())
    }
}
