//! Mark sidecars: small JSON records whose presence in the bucket signals a
//! property of a block (deletion pending, do-not-compact).
//!
//! Marks are written by this engine or by operators and are never removed by
//! the engine; an external retention sweeper consumes deletion marks.

use super::BlockId;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// No-compact reason applied when a block is skipped for out-of-order chunks.
pub const OUT_OF_ORDER_CHUNKS_REASON: &str = "block-index-out-of-order-chunk";

/// Errors from reading a marker object.
#[derive(Debug, thiserror::Error)]
pub enum MarkerError {
    /// No marker object exists for the block.
    #[error("marker not found")]
    NotFound,
    /// The marker object exists but cannot be parsed. Callers are expected
    /// to WARN and treat the marker as absent.
    #[error("marker unparseable: {0}")]
    Unparseable(String),
    /// Transient failure reading the marker.
    #[error(transparent)]
    Store(#[from] object_store::Error),
}

/// A mark sidecar associated with a block ID.
pub trait Marker: Serialize + DeserializeOwned + Send + Sync {
    /// File name of the marker inside the block directory.
    const FILENAME: &'static str;

    fn block_id(&self) -> BlockId;
}

/// Signals that the block is superseded and pending deletion by the
/// retention sweeper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeletionMark {
    pub id: BlockId,
    pub deletion_time: DateTime<Utc>,
    pub reason: String,
}

impl DeletionMark {
    pub fn new(id: BlockId, reason: impl Into<String>) -> Self {
        Self {
            id,
            deletion_time: Utc::now(),
            reason: reason.into(),
        }
    }
}

impl Marker for DeletionMark {
    const FILENAME: &'static str = "deletion-mark.json";

    fn block_id(&self) -> BlockId {
        self.id
    }
}

/// Signals that the block must be excluded from compaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoCompactMark {
    pub id: BlockId,
    pub no_compact_time: DateTime<Utc>,
    pub reason: String,
}

impl NoCompactMark {
    pub fn new(id: BlockId, reason: impl Into<String>) -> Self {
        Self {
            id,
            no_compact_time: Utc::now(),
            reason: reason.into(),
        }
    }
}

impl Marker for NoCompactMark {
    const FILENAME: &'static str = "no-compact-mark.json";

    fn block_id(&self) -> BlockId {
        self.id
    }
}

/// Parse a marker payload, distinguishing garbage from transport failures.
pub fn parse_marker<M: Marker>(bytes: &[u8]) -> Result<M, MarkerError> {
    serde_json::from_slice(bytes).map_err(|e| MarkerError::Unparseable(e.to_string()))
}

/// Read a marker for `id` from the store. Returns [`MarkerError::NotFound`]
/// when no marker object exists.
pub async fn read_marker<M: Marker>(
    store: &dyn object_store::ObjectStore,
    id: BlockId,
) -> Result<M, MarkerError> {
    let path = object_store::path::Path::from(format!("{}/{}", id, M::FILENAME));
    match store.get(&path).await {
        Ok(result) => {
            let bytes = result.bytes().await?;
            parse_marker(&bytes)
        }
        Err(object_store::Error::NotFound { .. }) => Err(MarkerError::NotFound),
        Err(e) => Err(MarkerError::Store(e)),
    }
}
