//! Error types for Strata

use crate::block::BlockId;

/// Result type alias for Strata operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for Strata
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Object store errors
    #[error("object store error: {0}")]
    ObjectStore(#[from] object_store::Error),
    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Serialization errors
    #[error("serialization error: {0}")]
    Serialization(String),
    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(String),
    /// Block metadata is missing or inconsistent
    #[error("invalid block meta: {0}")]
    InvalidMeta(String),
    /// A block's index failed a health check that cannot be repaired
    #[error("block {block} has an unhealthy index: {reason}")]
    UnhealthyIndex { block: BlockId, reason: String },
    /// Block merge failed
    #[error("merge error: {0}")]
    Merge(String),
    /// Ownership oracle failure
    #[error("ownership error: {0}")]
    Ownership(String),
    /// Operation was cancelled through the iteration token
    #[error("operation cancelled")]
    Cancelled,
    /// Operation timed out
    #[error("operation timed out")]
    Timeout,
    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
    /// Context wrapper preserving the underlying cause
    #[error("{msg}: {source}")]
    Wrapped {
        msg: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Wrap this error with an additional message, keeping the cause chain.
    pub fn wrap(self, msg: impl Into<String>) -> Self {
        Error::Wrapped {
            msg: msg.into(),
            source: Box::new(self),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
