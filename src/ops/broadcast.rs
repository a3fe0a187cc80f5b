use std::sync::Arc;

use super::{CollectiveOp, OperationRequest};
use crate::backend::{CommContext, CommScope};
use crate::config::QuorumConfig;
use crate::error::{QuorumError, Result};
use crate::timeline::Timeline;
use crate::types::TensorEntry;

/// Whole-group broadcast from a designated root. Always applicable.
pub struct BroadcastOp {
    ctx: Arc<CommContext>,
    timeline: Arc<dyn Timeline>,
}

impl BroadcastOp {
    pub fn new(ctx: Arc<CommContext>, timeline: Arc<dyn Timeline>) -> Self {
        Self { ctx, timeline }
    }

    /// Replicate the root's buffer for the first entry to every rank.
    ///
    /// # Safety
    /// `buffer` must be valid for `num_elements` elements of the first
    /// entry's dtype on every rank.
    pub unsafe fn execute(
        &self,
        entries: &[TensorEntry],
        buffer: u64,
        num_elements: usize,
        root_rank: u32,
    ) -> Result<()> {
        let first = entries.first().ok_or(QuorumError::EmptyBatch {
            operation: "broadcast",
        })?;

        self.timeline.activity_start(entries, "BCAST");
        let res = unsafe {
            self.ctx
                .broadcast(buffer, num_elements, first.dtype, root_rank, CommScope::Global)
        };
        self.timeline.activity_end(entries);
        res
    }
}

impl CollectiveOp for BroadcastOp {
    fn enabled(
        &self,
        _config: &QuorumConfig,
        _entries: &[TensorEntry],
        _request: &OperationRequest,
    ) -> bool {
        true
    }
}
