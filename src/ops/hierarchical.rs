use std::sync::{Arc, Mutex};

use super::{CollectiveOp, OperationRequest};
use crate::backend::{CommContext, CommScope};
use crate::config::QuorumConfig;
use crate::error::{QuorumError, Result};
use crate::timeline::Timeline;
use crate::topology::ClusterTopology;
use crate::types::{DataType, TensorEntry};
use crate::window::SharedWindowManager;

/// Hierarchical all-gather: a cross-node gather staged into the
/// per-node shared window, then distributed node-locally.
///
/// On a homogeneous cluster every node-local rank joins the cross-node
/// step through its own cross communicator; otherwise node-local rank 0
/// carries the whole node's data and its siblings skip the step. Either
/// way **every** rank issues the whole-group barrier before reading the
/// window: a skipping rank that diverged in call count would hang the
/// group, and an early reader would see a half-landed transfer.
pub struct HierarchicalAllgatherOp {
    ctx: Arc<CommContext>,
    timeline: Arc<dyn Timeline>,
    topology: Arc<dyn ClusterTopology>,
    windows: Mutex<SharedWindowManager>,
}

impl HierarchicalAllgatherOp {
    pub fn new(
        ctx: Arc<CommContext>,
        timeline: Arc<dyn Timeline>,
        topology: Arc<dyn ClusterTopology>,
    ) -> Self {
        Self {
            ctx,
            timeline,
            topology,
            windows: Mutex::new(SharedWindowManager::new()),
        }
    }

    /// Cross-node gather into the shared window, whole-group barrier,
    /// then copy the staged result out to `recvbuf`.
    ///
    /// `recv_counts`/`displs` describe this rank's cross-scope gather
    /// (one entry per cross-communicator participant, caller-supplied).
    /// `window_bytes` is the full staged size every local rank copies
    /// out; the manager grows the window to fit and reuses it across
    /// calls.
    ///
    /// # Safety
    /// `sendbuf` must be valid for `sendcount` elements of `sendty`;
    /// `recvbuf` must be valid for `window_bytes` bytes.
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
        window_bytes: usize,
    ) -> Result<()> {
        let elem_size = self.ctx.type_size(recvty)?;
        let local_rank = self.topology.local_rank();

        self.timeline.activity_start(entries, "CROSS_ALLGATHER");
        let res = unsafe {
            self.gather_into_window(
                sendbuf,
                sendcount,
                sendty,
                recvbuf,
                recv_counts,
                displs,
                recvty,
                window_bytes,
                elem_size,
                local_rank,
            )
        };
        self.timeline.activity_end(entries);
        res
    }

    #[allow(clippy::too_many_arguments)]
    unsafe fn gather_into_window(
        &self,
        sendbuf: u64,
        sendcount: usize,
        sendty: DataType,
        recvbuf: u64,
        recv_counts: &[usize],
        displs: &[usize],
        recvty: DataType,
        window_bytes: usize,
        elem_size: usize,
        local_rank: u32,
    ) -> Result<()> {
        let mut windows = self
            .windows
            .lock()
            .map_err(|_| QuorumError::LockPoisoned("shared window manager"))?;
        windows.ensure(&self.ctx, CommScope::Local, window_bytes, elem_size, local_rank)?;
        // The staged data lives in node-local rank 0's region.
        let staging = windows.query(&self.ctx, 0)?;

        // Cross-node step. All local ranks participate on a homogeneous
        // cluster; otherwise only node-local rank 0.
        if self.topology.is_homogeneous() || local_rank == 0 {
            unsafe {
                self.ctx.allgatherv(
                    sendbuf,
                    sendcount,
                    sendty,
                    staging.base,
                    recv_counts,
                    displs,
                    recvty,
                    CommScope::Cross,
                )?;
            }
        }

        // Mandatory on the skip path too: no rank may read the window
        // before every cross-node transfer has landed.
        self.ctx.barrier(CommScope::Global)?;

        unsafe {
            std::ptr::copy_nonoverlapping(
                staging.base as *const u8,
                recvbuf as *mut u8,
                window_bytes,
            );
        }
        Ok(())
    }

    /// Free the node's shared window at group shutdown.
    pub fn shutdown(&self) -> Result<()> {
        let mut windows = self
            .windows
            .lock()
            .map_err(|_| QuorumError::LockPoisoned("shared window manager"))?;
        windows.shutdown(&self.ctx, CommScope::Local)
    }
}

impl CollectiveOp for HierarchicalAllgatherOp {
    fn enabled(
        &self,
        config: &QuorumConfig,
        _entries: &[TensorEntry],
        _request: &OperationRequest,
    ) -> bool {
        config.hierarchical_allgather
    }
}
