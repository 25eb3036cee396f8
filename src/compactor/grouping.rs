//! Job grouping
//!
//! A job is the unit of compaction work: all known blocks of one stream,
//! identified by `<resolution>@<hash(labels)>`. Blocks with different
//! external labels or resolutions never share a job, which is what makes
//! jobs safe to compact concurrently.

use crate::block::{BlockId, BlockMeta};
use crate::{Error, Result};

use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};

/// Stable key of the group a block belongs to.
pub fn group_key(meta: &BlockMeta) -> String {
    format!("{}@{}", meta.resolution, labels_hash(&meta.labels))
}

fn labels_hash(labels: &BTreeMap<String, String>) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    for (name, value) in labels {
        name.hash(&mut hasher);
        value.hash(&mut hasher);
    }
    hasher.finish()
}

/// One compaction work item covering a single (resolution, label-set) group.
#[derive(Debug, Clone)]
pub struct Job {
    key: String,
    labels: BTreeMap<String, String>,
    resolution: i64,
    metas: Vec<BlockMeta>,
    use_splitting: bool,
    splitting_shards: u64,
}

impl Job {
    pub fn new(key: String, labels: BTreeMap<String, String>, resolution: i64) -> Self {
        Self {
            key,
            labels,
            resolution,
            metas: Vec::new(),
            use_splitting: false,
            splitting_shards: 0,
        }
    }

    /// A job whose output must be split by series hash into `shards` blocks.
    pub fn with_splitting(mut self, shards: u64) -> Result<Self> {
        if shards < 2 {
            return Err(Error::Config(format!(
                "splitting requires at least 2 shards, got {shards}"
            )));
        }
        self.use_splitting = true;
        self.splitting_shards = shards;
        Ok(self)
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn labels(&self) -> &BTreeMap<String, String> {
        &self.labels
    }

    pub fn resolution(&self) -> i64 {
        self.resolution
    }

    /// Constituent metas, ordered by `(min_time, id)` ascending.
    pub fn metas(&self) -> &[BlockMeta] {
        &self.metas
    }

    pub fn ids(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.metas.iter().map(|m| m.id)
    }

    pub fn use_splitting(&self) -> bool {
        self.use_splitting
    }

    pub fn splitting_shards(&self) -> u64 {
        self.splitting_shards
    }

    /// Add a block to the job, keeping the min-time ordering. Rejects blocks
    /// from another stream.
    pub fn append_meta(&mut self, meta: BlockMeta) -> Result<()> {
        if meta.labels != self.labels {
            return Err(Error::InvalidMeta(format!(
                "block {} labels {:?} do not match job {} labels {:?}",
                meta.id, meta.labels, self.key, self.labels
            )));
        }
        if meta.resolution != self.resolution {
            return Err(Error::InvalidMeta(format!(
                "block {} resolution {} does not match job {} resolution {}",
                meta.id, meta.resolution, self.key, self.resolution
            )));
        }
        let at = self
            .metas
            .partition_point(|m| (m.min_time, m.id) <= (meta.min_time, meta.id));
        self.metas.insert(at, meta);
        Ok(())
    }
}

/// Partitions known blocks into independently compactable jobs.
pub trait Grouper: Send + Sync {
    /// Build all jobs from scratch for the given snapshot.
    fn groups(&self, blocks: &HashMap<BlockId, BlockMeta>) -> Result<Vec<Job>>;
}

/// Groups purely by (resolution, external labels); never splits output.
#[derive(Debug, Default)]
pub struct DefaultGrouper;

impl Grouper for DefaultGrouper {
    fn groups(&self, blocks: &HashMap<BlockId, BlockMeta>) -> Result<Vec<Job>> {
        let mut groups: HashMap<String, Job> = HashMap::new();
        for meta in blocks.values() {
            let key = group_key(meta);
            let job = groups.entry(key.clone()).or_insert_with(|| {
                Job::new(key, meta.labels.clone(), meta.resolution)
            });
            job.append_meta(meta.clone())
                .map_err(|e| e.wrap("add block to compaction group"))?;
        }

        let mut jobs: Vec<Job> = groups.into_values().collect();
        sort_jobs_by_key(&mut jobs);
        Ok(jobs)
    }
}

/// Default job dispatch order: ascending key, deterministic across runs.
pub fn sort_jobs_by_key(jobs: &mut [Job]) {
    jobs.sort_by(|a, b| a.key.cmp(&b.key));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{BlockStats, CompactionInfo, RESOLUTION_5M, RESOLUTION_RAW};

    fn meta(min_time: i64, labels: &[(&str, &str)], resolution: i64) -> BlockMeta {
        let id = BlockId::new();
        BlockMeta {
            id,
            min_time,
            max_time: min_time + 1000,
            compaction: CompactionInfo {
                level: 1,
                sources: vec![id],
                parents: vec![],
            },
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            resolution,
            stats: BlockStats {
                num_samples: 10,
                ..Default::default()
            },
            hash_func: None,
            checksums: None,
        }
    }

    #[test]
    fn test_groups_partition_by_labels_and_resolution() {
        let blocks: HashMap<BlockId, BlockMeta> = [
            meta(0, &[("tenant", "a")], RESOLUTION_RAW),
            meta(1000, &[("tenant", "a")], RESOLUTION_RAW),
            meta(0, &[("tenant", "b")], RESOLUTION_RAW),
            meta(0, &[("tenant", "a")], RESOLUTION_5M),
        ]
        .into_iter()
        .map(|m| (m.id, m))
        .collect();

        let jobs = DefaultGrouper.groups(&blocks).unwrap();
        assert_eq!(jobs.len(), 3);

        let tenant_a_raw = jobs
            .iter()
            .find(|j| j.resolution() == RESOLUTION_RAW && j.labels()["tenant"] == "a")
            .unwrap();
        assert_eq!(tenant_a_raw.metas().len(), 2);

        // Deterministic ordering by key.
        let keys: Vec<&str> = jobs.iter().map(|j| j.key()).collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }

    #[test]
    fn test_job_metas_ordered_by_min_time_then_id() {
        let labels = &[("tenant", "a")][..];
        let m1 = meta(2000, labels, RESOLUTION_RAW);
        let m2 = meta(1000, labels, RESOLUTION_RAW);
        let mut m3 = meta(1000, labels, RESOLUTION_RAW);
        // Force a deterministic tie on min_time with a known id ordering.
        m3.min_time = m2.min_time;

        let mut job = Job::new("0@1".to_string(), m1.labels.clone(), RESOLUTION_RAW);
        job.append_meta(m1.clone()).unwrap();
        job.append_meta(m2.clone()).unwrap();
        job.append_meta(m3.clone()).unwrap();

        let order: Vec<(i64, BlockId)> = job.metas().iter().map(|m| (m.min_time, m.id)).collect();
        let mut expected = order.clone();
        expected.sort();
        assert_eq!(order, expected);
    }

    #[test]
    fn test_append_meta_rejects_label_mismatch() {
        let m = meta(0, &[("tenant", "a")], RESOLUTION_RAW);
        let mut job = Job::new("0@1".to_string(), BTreeMap::new(), RESOLUTION_RAW);
        assert!(job.append_meta(m).is_err());
    }

    #[test]
    fn test_append_meta_rejects_resolution_mismatch() {
        let m = meta(0, &[("tenant", "a")], RESOLUTION_5M);
        let mut job = Job::new("0@1".to_string(), m.labels.clone(), RESOLUTION_RAW);
        assert!(job.append_meta(m).is_err());
    }

    #[test]
    fn test_splitting_requires_two_shards() {
        let job = Job::new("0@1".to_string(), BTreeMap::new(), RESOLUTION_RAW);
        assert!(job.clone().with_splitting(1).is_err());
        let split = job.with_splitting(3).unwrap();
        assert!(split.use_splitting());
        assert_eq!(split.splitting_shards(), 3);
    }

    #[test]
    fn test_group_key_stable_for_same_labels() {
        let a = meta(0, &[("tenant", "a"), ("shard", "1")], RESOLUTION_RAW);
        let b = meta(500, &[("tenant", "a"), ("shard", "1")], RESOLUTION_RAW);
        assert_eq!(group_key(&a), group_key(&b));

        let c = meta(0, &[("tenant", "c")], RESOLUTION_RAW);
        assert_ne!(group_key(&a), group_key(&c));
    }
}
