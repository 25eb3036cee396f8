//! Compaction error classification
//!
//! Every failure crossing a component boundary is tagged with how the
//! scheduler must react: halt the pass, retry the whole loop, run the
//! issue-347 repair, or no-compact-mark an out-of-order block. Tags are
//! plain enum variants carrying their cause, so the scheduler's decision
//! table stays explicit; there is no control-flow-by-unwinding.

use crate::block::BlockId;
use crate::Error;

use std::fmt;

/// A classified compaction failure. Aggregates from a worker pool are
/// `Multi`; `Context` adds a message without touching the classification.
#[derive(Debug, thiserror::Error)]
pub enum CompactionError {
    /// Fundamental inconsistency. Do not retry this iteration; alert.
    #[error("{0}")]
    Halt(#[source] Error),
    /// Transient failure; the outer controller restarts after a backoff.
    #[error("{0}")]
    Retry(#[source] Error),
    /// Repairable chunk-boundary corruption (tsdb issue 347).
    #[error("block {block} is invalid but repairable: {source}")]
    Issue347 {
        block: BlockId,
        #[source]
        source: Error,
    },
    /// Out-of-order chunks; recoverable by a no-compact mark when the
    /// engine is configured to skip such blocks.
    #[error("block {block} has out-of-order chunks: {source}")]
    OutOfOrderChunks {
        block: BlockId,
        #[source]
        source: Error,
    },
    /// Not yet classified; the outer controller treats it like a retry.
    #[error("{0}")]
    Unclassified(#[source] Error),
    /// Aggregate collected from the worker pool after join.
    #[error("{0}")]
    Multi(MultiError),
    /// Message wrapper preserving the inner classification.
    #[error("{msg}: {source}")]
    Context {
        msg: String,
        #[source]
        source: Box<CompactionError>,
    },
}

/// Non-empty list of classified errors.
#[derive(Debug)]
pub struct MultiError(pub Vec<CompactionError>);

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} errors: ", self.0.len())?;
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{err}")?;
        }
        Ok(())
    }
}

impl From<Error> for CompactionError {
    fn from(e: Error) -> Self {
        CompactionError::Unclassified(e)
    }
}

/// Tag an error as halting.
pub fn halt(err: Error) -> CompactionError {
    CompactionError::Halt(err)
}

/// Tag an error as retriable. A halt-classified error stays halt.
pub fn retry(err: impl Into<CompactionError>) -> CompactionError {
    let err = err.into();
    if err.is_halt() {
        return err;
    }
    match err {
        CompactionError::Halt(_) => unreachable!("halt handled above"),
        CompactionError::Retry(e) | CompactionError::Unclassified(e) => CompactionError::Retry(e),
        CompactionError::Issue347 { source, .. }
        | CompactionError::OutOfOrderChunks { source, .. } => CompactionError::Retry(source),
        CompactionError::Multi(MultiError(children)) => {
            CompactionError::Multi(MultiError(children.into_iter().map(retry).collect()))
        }
        CompactionError::Context { msg, source } => CompactionError::Context {
            msg,
            source: Box::new(retry(*source)),
        },
    }
}

/// Tag an error as issue-347 repairable for the given block.
pub fn issue347(block: BlockId, source: Error) -> CompactionError {
    CompactionError::Issue347 { block, source }
}

/// Tag an error as out-of-order chunks for the given block.
pub fn out_of_order_chunks(block: BlockId, source: Error) -> CompactionError {
    CompactionError::OutOfOrderChunks { block, source }
}

impl CompactionError {
    /// Aggregate worker errors; `None` when the list is empty.
    pub fn from_errors(errors: Vec<CompactionError>) -> Option<Self> {
        if errors.is_empty() {
            None
        } else {
            Some(CompactionError::Multi(MultiError(errors)))
        }
    }

    /// Add context without changing the classification.
    pub fn context(self, msg: impl Into<String>) -> Self {
        CompactionError::Context {
            msg: msg.into(),
            source: Box::new(self),
        }
    }

    /// True when this error, or any child of a multi-error, is halting.
    pub fn is_halt(&self) -> bool {
        match self {
            CompactionError::Halt(_) => true,
            CompactionError::Multi(MultiError(children)) => children.iter().any(|e| e.is_halt()),
            CompactionError::Context { source, .. } => source.is_halt(),
            _ => false,
        }
    }

    /// True when this error is retriable; a multi-error is retriable only
    /// when every child is.
    pub fn is_retry(&self) -> bool {
        match self {
            CompactionError::Retry(_) => true,
            CompactionError::Multi(MultiError(children)) => {
                !children.is_empty() && children.iter().all(|e| e.is_retry())
            }
            CompactionError::Context { source, .. } => source.is_retry(),
            _ => false,
        }
    }

    /// The block behind an issue-347 classification, if that is what this is.
    pub fn issue347_block(&self) -> Option<BlockId> {
        match self {
            CompactionError::Issue347 { block, .. } => Some(*block),
            CompactionError::Context { source, .. } => source.issue347_block(),
            CompactionError::Multi(MultiError(children)) => {
                children.iter().find_map(|e| e.issue347_block())
            }
            _ => None,
        }
    }

    /// The block behind an out-of-order-chunks classification, if any.
    pub fn out_of_order_block(&self) -> Option<BlockId> {
        match self {
            CompactionError::OutOfOrderChunks { block, .. } => Some(*block),
            CompactionError::Context { source, .. } => source.out_of_order_block(),
            CompactionError::Multi(MultiError(children)) => {
                children.iter().find_map(|e| e.out_of_order_block())
            }
            _ => None,
        }
    }
}
