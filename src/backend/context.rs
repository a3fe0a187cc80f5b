//! The uniform collective adapter: one operation surface over the three
//! communication scopes, implemented against a [`GroupComm`] backend.
//!
//! Every non-success backend result is wrapped as
//! `CollectiveFailed { operation, .. }` and propagates immediately.
//! Nothing here retries: a one-sided retry of a collective call would
//! desynchronize the group, so a backend failure is fatal to the
//! calling process.

use std::sync::Arc;

use super::{
    BackendError, CommHandle, CommScope, GroupComm, ScopeMap, TypeMapper, WindowHandle,
    WindowRegion,
};
use crate::error::{QuorumError, Result};
use crate::types::{DataType, Rank};

pub struct CommContext {
    backend: Arc<dyn GroupComm>,
    scopes: ScopeMap,
    mapper: TypeMapper,
}

fn fail(operation: &'static str) -> impl FnOnce(BackendError) -> QuorumError {
    move |e| QuorumError::CollectiveFailed {
        operation,
        reason: e.to_string(),
    }
}

impl CommContext {
    pub fn new(backend: Arc<dyn GroupComm>, scopes: ScopeMap) -> Self {
        let mapper = TypeMapper::new(backend.clone());
        Self {
            backend,
            scopes,
            mapper,
        }
    }

    pub fn mapper(&self) -> &TypeMapper {
        &self.mapper
    }

    /// This process's rank within `scope`.
    pub fn rank(&self, scope: CommScope) -> Result<Rank> {
        let comm = self.scopes.resolve(scope)?;
        self.backend.group_rank(comm).map_err(fail("group_rank"))
    }

    /// Number of participants in `scope`.
    pub fn size(&self, scope: CommScope) -> Result<usize> {
        let comm = self.scopes.resolve(scope)?;
        self.backend.group_size(comm).map_err(fail("group_size"))
    }

    /// Group-wide elementwise sum over `scope`, replicated to all.
    ///
    /// `sendbuf == None` selects the backend's in-place form: `recvbuf`
    /// already holds this rank's contribution. Half-precision entries
    /// route through the registered custom sum operator.
    ///
    /// # Safety
    /// `recvbuf` (and `sendbuf`, when present) must be valid for
    /// `count` elements of `dtype` for the duration of the call.
    pub unsafe fn allreduce_sum(
        &self,
        sendbuf: Option<u64>,
        recvbuf: u64,
        count: usize,
        dtype: DataType,
        scope: CommScope,
    ) -> Result<()> {
        let comm = self.scopes.resolve(scope)?;
        let ty = self.mapper.to_backend_type(dtype)?;
        let op = self.mapper.sum_op(dtype)?;
        unsafe { self.backend.allreduce(sendbuf, recvbuf, count, ty, op, comm) }
            .map_err(fail("allreduce"))
    }

    /// Variable-count gather over `scope`, replicated to all.
    ///
    /// `recv_counts`/`displs` must hold exactly one entry per
    /// participant in `scope`; this layer validates the lengths but
    /// never infers the values.
    ///
    /// # Safety
    /// `sendbuf` must be valid for `sendcount` elements of `sendty`;
    /// `recvbuf` must be valid for every `displs[i] + recv_counts[i]`
    /// element range of `recvty`.
    #[allow(clippy::too_many_arguments)]
    pub unsafe fn allgatherv(
        &self,
        sendbuf: u64,
        sendcount: usize,
        sendty: DataType,
        recvbuf: u64,
        recv_counts: &[usize],
        displs: &[usize],
        recvty: DataType,
        scope: CommScope,
    ) -> Result<()> {
        let comm = self.scopes.resolve(scope)?;
        let participants = self.backend.group_size(comm).map_err(fail("group_size"))?;
        for len in [recv_counts.len(), displs.len()] {
            if len != participants {
                return Err(QuorumError::CountMismatch {
                    operation: "allgatherv",
                    expected: participants,
                    actual: len,
                });
            }
        }
        let send_tag = self.mapper.to_backend_type(sendty)?;
        let recv_tag = self.mapper.to_backend_type(recvty)?;
        unsafe {
            self.backend.allgatherv(
                sendbuf, sendcount, send_tag, recvbuf, recv_counts, displs, recv_tag, comm,
            )
        }
        .map_err(fail("allgatherv"))
    }

    /// Replicate `root`'s buffer to every other process in `scope`.
    ///
    /// # Safety
    /// `buf` must be valid for `count` elements of `dtype` on every rank.
    pub unsafe fn broadcast(
        &self,
        buf: u64,
        count: usize,
        dtype: DataType,
        root: Rank,
        scope: CommScope,
    ) -> Result<()> {
        let comm = self.scopes.resolve(scope)?;
        let participants = self.backend.group_size(comm).map_err(fail("group_size"))?;
        if root as usize >= participants {
            return Err(QuorumError::InvalidRank {
                rank: root,
                group_size: participants,
            });
        }
        let ty = self.mapper.to_backend_type(dtype)?;
        unsafe { self.backend.broadcast(buf, count, ty, root, comm) }.map_err(fail("broadcast"))
    }

    /// Block until every process in `scope` has entered.
    pub fn barrier(&self, scope: CommScope) -> Result<()> {
        let comm = self.scopes.resolve(scope)?;
        self.backend.barrier(comm).map_err(fail("barrier"))
    }

    /// Collectively allocate a shared window over `scope`.
    pub fn allocate_shared_window(
        &self,
        window_size: usize,
        element_size: usize,
        scope: CommScope,
    ) -> Result<WindowHandle> {
        let comm = self.scopes.resolve(scope)?;
        self.backend
            .allocate_shared(window_size, element_size, comm)
            .map_err(fail("allocate_shared_window"))
    }

    /// Look up `rank`'s region of an allocated window.
    pub fn query_shared_window(&self, window: WindowHandle, rank: Rank) -> Result<WindowRegion> {
        self.backend
            .query_shared(window, rank)
            .map_err(fail("query_shared_window"))
    }

    /// Collectively release a window; the backend fences `scope` first.
    pub fn free_shared_window(&self, window: WindowHandle, scope: CommScope) -> Result<()> {
        let comm = self.scopes.resolve(scope)?;
        self.backend
            .free_shared(window, comm)
            .map_err(fail("free_shared_window"))
    }

    /// Element size of `dtype` in bytes, via backend introspection.
    pub fn type_size(&self, dtype: DataType) -> Result<usize> {
        self.mapper.type_size(dtype)
    }
}
