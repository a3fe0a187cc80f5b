//! Cluster topology facts consumed by the hierarchical decomposition.
//!
//! Supplied by the cluster/bootstrap layer; this crate only reads it.

use crate::types::Rank;

pub trait ClusterTopology: Send + Sync {
    /// True when every node runs the same number of ranks with the same
    /// role. Decides whether all local ranks join the cross-node step
    /// or only node-local rank 0.
    fn is_homogeneous(&self) -> bool;

    /// This process's index within its node (0-based).
    fn local_rank(&self) -> Rank;

    /// Number of ranks on this node.
    fn local_size(&self) -> usize;
}

/// Fixed topology facts captured at startup.
#[derive(Debug, Clone)]
pub struct StaticTopology {
    homogeneous: bool,
    local_rank: Rank,
    local_size: usize,
}

impl StaticTopology {
    pub fn new(homogeneous: bool, local_rank: Rank, local_size: usize) -> Self {
        Self {
            homogeneous,
            local_rank,
            local_size,
        }
    }
}

impl ClusterTopology for StaticTopology {
    fn is_homogeneous(&self) -> bool {
        self.homogeneous
    }

    fn local_rank(&self) -> Rank {
        self.local_rank
    }

    fn local_size(&self) -> usize {
        self.local_size
    }
}
