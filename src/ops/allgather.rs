use std::sync::Arc;

use super::{CollectiveOp, OperationRequest};
use crate::backend::{CommContext, CommScope};
use crate::config::QuorumConfig;
use crate::error::Result;
use crate::timeline::Timeline;
use crate::types::{DataType, TensorEntry};

/// Flat whole-group all-gather with per-process counts. Always
/// applicable; the hierarchical variant takes precedence only when its
/// config flag enables it.
pub struct AllgatherOp {
    ctx: Arc<CommContext>,
    timeline: Arc<dyn Timeline>,
}

impl AllgatherOp {
    pub fn new(ctx: Arc<CommContext>, timeline: Arc<dyn Timeline>) -> Self {
        Self { ctx, timeline }
    }

    /// One `allgatherv` over the whole group. `recv_counts`/`displs`
    /// carry one entry per global rank, precomputed by the caller.
    ///
    /// # Safety
    /// `sendbuf` must be valid for `sendcount` elements of `sendty`;
    /// `recvbuf` must be valid for every `displs[i] + recv_counts[i]`
    /// element range of `recvty`.
    #[allow(clippy::too_many_arguments)]
    pub unsafe fn execute(
        &self,
        entries: &[TensorEntry],
        sendbuf: u64,
        sendcount: usize,
        sendty: DataType,
        recvbuf: u64,
        recv_counts: &[usize],
        displs: &[usize],
        recvty: DataType,
    ) -> Result<()> {
        self.timeline.activity_start(entries, "ALLGATHER");
        let res = unsafe {
            self.ctx.allgatherv(
                sendbuf,
                sendcount,
                sendty,
                recvbuf,
                recv_counts,
                displs,
                recvty,
                CommScope::Global,
            )
        };
        self.timeline.activity_end(entries);
        res
    }
}

impl CollectiveOp for AllgatherOp {
    fn enabled(
        &self,
        _config: &QuorumConfig,
        _entries: &[TensorEntry],
        _request: &OperationRequest,
    ) -> bool {
        true
    }
}
