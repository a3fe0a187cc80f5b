use crate::backend::CommScope;
use crate::types::{DataType, Rank};

pub type Result<T> = std::result::Result<T, QuorumError>;

#[derive(Debug, thiserror::Error)]
pub enum QuorumError {
    #[error("no communicator configured for {scope} scope")]
    UnsupportedScope { scope: CommScope },

    #[error("unsupported data type: {dtype} for operation {op}")]
    UnsupportedDType { dtype: DataType, op: &'static str },

    #[error("{operation} failed: {reason}")]
    CollectiveFailed {
        operation: &'static str,
        reason: String,
    },

    #[error("duplicate readiness request for tensor {tensor:?} from rank {rank}")]
    DuplicateRequest { tensor: String, rank: Rank },

    #[error("invalid rank {rank}: group size is {group_size}")]
    InvalidRank { rank: Rank, group_size: usize },

    #[error("{operation}: expected {expected} per-participant entries, got {actual}")]
    CountMismatch {
        operation: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("shared window not allocated")]
    WindowNotAllocated,

    #[error("empty entry batch for {operation}")]
    EmptyBatch { operation: &'static str },

    #[error("internal lock poisoned: {0}")]
    LockPoisoned(&'static str),
}
