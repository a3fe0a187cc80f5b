mod allgather;
mod allreduce;
mod broadcast;
mod hierarchical;

pub use allgather::AllgatherOp;
pub use allreduce::AllreduceOp;
pub use broadcast::BroadcastOp;
pub use hierarchical::HierarchicalAllgatherOp;

use crate::config::QuorumConfig;
use crate::types::{OpKind, Rank, TensorEntry};

/// The operation the group has agreed to run, as negotiated through the
/// readiness table.
#[derive(Debug, Clone)]
pub struct OperationRequest {
    pub op: OpKind,
    /// Root rank, for broadcast.
    pub root_rank: Option<Rank>,
}

impl OperationRequest {
    pub fn new(op: OpKind) -> Self {
        Self {
            op,
            root_rank: None,
        }
    }

    pub fn with_root(op: OpKind, root_rank: Rank) -> Self {
        Self {
            op,
            root_rank: Some(root_rank),
        }
    }
}

/// Applicability predicate shared by every operation variant.
///
/// Consulted before scheduling; pure, no side effects. Each variant's
/// `execute` entry point has its own signature (the buffer shapes
/// differ per operation family), so execution is an inherent method on
/// the variant rather than part of this trait.
pub trait CollectiveOp {
    fn enabled(
        &self,
        config: &QuorumConfig,
        entries: &[TensorEntry],
        request: &OperationRequest,
    ) -> bool;
}
