//! In-process group-communication backend: one OS thread per rank over
//! shared memory.
//!
//! `LocalCluster::launch` builds the full communicator set for a node
//! layout (global, one per node, one cross-node group per node-local
//! index) and hands back one [`LocalEndpoint`] per rank. Collectives
//! rendezvous at a per-group barrier; the barrier leader combines the
//! contributions and fans the result back out before a second barrier
//! releases everyone. That makes every operation blocking and
//! order-matched, the same liveness contract a network backend imposes.
//!
//! This backend exists for tests and single-host runs; it owns no
//! transport.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Barrier, Mutex};

use super::{
    BackendError, BackendResult, CommHandle, CommScope, CustomReduceFn, GroupComm, OpTag,
    ScopeMap, TypeTag, WindowHandle, WindowRegion,
};
use crate::topology::StaticTopology;
use crate::types::Rank;

/// What one rank brings to a rendezvous. Members of a group must issue
/// matching calls, so all slots hold the same variant per operation.
#[derive(Clone)]
enum Contribution {
    Allreduce { sendbuf: Option<u64>, recvbuf: u64 },
    Allgatherv { sendbuf: u64, sendcount: usize, recvbuf: u64 },
    Broadcast { buf: u64 },
    Barrier,
    AllocWindow { bytes: usize },
    FreeWindow,
}

struct Rendezvous {
    contribs: Vec<Option<Contribution>>,
    window: Option<WindowHandle>,
    error: Option<String>,
}

struct GroupShared {
    /// Global ranks, indexed by group rank.
    members: Vec<Rank>,
    barrier: Barrier,
    state: Mutex<Rendezvous>,
}

struct WindowState {
    /// Backing storage; the heap allocation never moves while the
    /// window is live, so region base addresses stay valid.
    _buf: Box<[u8]>,
    regions: Vec<WindowRegion>,
}

struct ClusterShared {
    groups: Vec<GroupShared>,
    windows: Mutex<HashMap<u64, WindowState>>,
    next_window: AtomicU64,
    custom_types: Mutex<HashMap<u32, usize>>,
    custom_ops: Mutex<HashMap<u32, CustomReduceFn>>,
    next_type_tag: AtomicU32,
    next_op_tag: AtomicU32,
}

/// Builder for an in-process cluster.
pub struct LocalCluster;

impl LocalCluster {
    /// Launch endpoints for `ranks_per_node`, e.g. `&[2, 2]` for two
    /// nodes with two ranks each. Global ranks are numbered
    /// contiguously node by node.
    pub fn launch(ranks_per_node: &[usize]) -> Vec<LocalEndpoint> {
        let world: usize = ranks_per_node.iter().sum();
        let nodes = ranks_per_node.len();
        let max_local = ranks_per_node.iter().copied().max().unwrap_or(0);

        let mut groups = Vec::new();
        // Handle 0: global.
        groups.push(make_group((0..world as Rank).collect()));
        // Handles 1..=nodes: one per node.
        let mut start: Rank = 0;
        for &n in ranks_per_node {
            groups.push(make_group((start..start + n as Rank).collect()));
            start += n as Rank;
        }
        // Handles nodes+1..: one cross group per node-local index,
        // holding the rank with that index on every node that has one.
        for j in 0..max_local {
            let mut members = Vec::new();
            let mut node_start: Rank = 0;
            for &n in ranks_per_node {
                if j < n {
                    members.push(node_start + j as Rank);
                }
                node_start += n as Rank;
            }
            groups.push(make_group(members));
        }

        let shared = Arc::new(ClusterShared {
            groups,
            windows: Mutex::new(HashMap::new()),
            next_window: AtomicU64::new(1),
            custom_types: Mutex::new(HashMap::new()),
            custom_ops: Mutex::new(HashMap::new()),
            next_type_tag: AtomicU32::new(TypeTag::CUSTOM_BASE),
            next_op_tag: AtomicU32::new(OpTag::CUSTOM_BASE),
        });

        let homogeneous = ranks_per_node.iter().all(|&n| n == ranks_per_node[0]);
        let mut endpoints = Vec::with_capacity(world);
        let mut node_start: Rank = 0;
        for (node, &n) in ranks_per_node.iter().enumerate() {
            for j in 0..n {
                endpoints.push(LocalEndpoint {
                    shared: shared.clone(),
                    rank: node_start + j as Rank,
                    local_rank: j as Rank,
                    local_size: n,
                    node_count: nodes,
                    node,
                    homogeneous,
                });
            }
            node_start += n as Rank;
        }
        endpoints
    }
}

fn make_group(members: Vec<Rank>) -> GroupShared {
    let n = members.len();
    GroupShared {
        members,
        barrier: Barrier::new(n),
        state: Mutex::new(Rendezvous {
            contribs: vec![None; n],
            window: None,
            error: None,
        }),
    }
}

/// One rank's view of a [`LocalCluster`].
pub struct LocalEndpoint {
    shared: Arc<ClusterShared>,
    rank: Rank,
    local_rank: Rank,
    local_size: usize,
    node_count: usize,
    node: usize,
    homogeneous: bool,
}

impl LocalEndpoint {
    pub fn rank(&self) -> Rank {
        self.rank
    }

    /// Scope map for this rank: global, its node group, and the cross
    /// group for its node-local index.
    pub fn scope_map(&self) -> ScopeMap {
        ScopeMap::new(
            CommHandle(0),
            CommHandle(1 + self.node as u32),
            CommHandle(1 + self.node_count as u32 + self.local_rank),
        )
    }

    /// Topology facts for this rank, as the cluster layer would report.
    pub fn topology(&self) -> StaticTopology {
        StaticTopology::new(self.homogeneous, self.local_rank, self.local_size)
    }

    fn group(&self, comm: CommHandle) -> BackendResult<&GroupShared> {
        self.shared
            .groups
            .get(comm.0 as usize)
            .ok_or_else(|| BackendError::new(format!("unknown communicator {}", comm.0)))
    }

    fn my_slot(&self, group: &GroupShared) -> BackendResult<usize> {
        group
            .members
            .iter()
            .position(|&r| r == self.rank)
            .ok_or_else(|| BackendError::new(format!("rank {} not in communicator", self.rank)))
    }

    /// Rendezvous protocol shared by every collective. The leader runs
    /// `combine` with all contributions present, then everyone observes
    /// the outcome after the release barrier.
    fn collective(
        &self,
        comm: CommHandle,
        contrib: Contribution,
        combine: impl FnOnce(&[Option<Contribution>]) -> BackendResult<Option<WindowHandle>>,
    ) -> BackendResult<Option<WindowHandle>> {
        let group = self.group(comm)?;
        let slot = self.my_slot(group)?;

        {
            let mut st = lock(&group.state, "rendezvous")?;
            st.contribs[slot] = Some(contrib);
        }

        if group.barrier.wait().is_leader() {
            let mut st = lock(&group.state, "rendezvous")?;
            match combine(&st.contribs) {
                Ok(window) => {
                    st.window = window;
                    st.error = None;
                }
                Err(e) => {
                    st.window = None;
                    st.error = Some(e.to_string());
                }
            }
            for c in st.contribs.iter_mut() {
                *c = None;
            }
        }
        group.barrier.wait();

        let st = lock(&group.state, "rendezvous")?;
        if let Some(msg) = &st.error {
            return Err(BackendError::new(msg.clone()));
        }
        Ok(st.window)
    }

    fn size_of(&self, ty: TypeTag) -> BackendResult<usize> {
        if let Some(s) = ty.native_size() {
            return Ok(s);
        }
        lock(&self.shared.custom_types, "custom types")?
            .get(&ty.0)
            .copied()
            .ok_or_else(|| BackendError::new(format!("unknown type tag {}", ty.0)))
    }

    fn lookup_op(&self, op: OpTag) -> BackendResult<CustomReduceFn> {
        lock(&self.shared.custom_ops, "custom ops")?
            .get(&op.0)
            .copied()
            .ok_or_else(|| BackendError::new(format!("unknown operator tag {}", op.0)))
    }
}

fn lock<'a, T>(m: &'a Mutex<T>, what: &str) -> BackendResult<std::sync::MutexGuard<'a, T>> {
    m.lock()
        .map_err(|_| BackendError::new(format!("{what} lock poisoned")))
}

impl GroupComm for LocalEndpoint {
    fn group_rank(&self, comm: CommHandle) -> BackendResult<Rank> {
        let group = self.group(comm)?;
        Ok(self.my_slot(group)? as Rank)
    }

    fn group_size(&self, comm: CommHandle) -> BackendResult<usize> {
        Ok(self.group(comm)?.members.len())
    }

    unsafe fn allreduce(
        &self,
        sendbuf: Option<u64>,
        recvbuf: u64,
        count: usize,
        ty: TypeTag,
        op: OpTag,
        comm: CommHandle,
    ) -> BackendResult<()> {
        let bytes = count * self.size_of(ty)?;
        let custom = if op == OpTag::SUM {
            None
        } else {
            Some(self.lookup_op(op)?)
        };

        self.collective(
            comm,
            Contribution::Allreduce { sendbuf, recvbuf },
            move |contribs| {
                // Snapshot every source before touching any recvbuf:
                // in-place contributions alias their destination.
                let mut acc: Option<Vec<u8>> = None;
                let mut dests = Vec::with_capacity(contribs.len());
                for c in contribs {
                    let Some(Contribution::Allreduce { sendbuf, recvbuf }) = c else {
                        return Err(BackendError::new("mismatched collective calls in group"));
                    };
                    let src_ptr = (*sendbuf).unwrap_or(*recvbuf);
                    let src =
                        unsafe { std::slice::from_raw_parts(src_ptr as *const u8, bytes) };
                    match &mut acc {
                        None => acc = Some(src.to_vec()),
                        Some(a) => match custom {
                            Some(f) => f(a, src),
                            None => accumulate_sum(a, src, ty)?,
                        },
                    }
                    dests.push(*recvbuf);
                }
                let acc = acc.ok_or_else(|| BackendError::new("empty group"))?;
                for dst in dests {
                    unsafe {
                        std::ptr::copy_nonoverlapping(acc.as_ptr(), dst as *mut u8, bytes);
                    }
                }
                Ok(None)
            },
        )?;
        Ok(())
    }

    unsafe fn allgatherv(
        &self,
        sendbuf: u64,
        sendcount: usize,
        sendty: TypeTag,
        recvbuf: u64,
        recv_counts: &[usize],
        displs: &[usize],
        recvty: TypeTag,
        comm: CommHandle,
    ) -> BackendResult<()> {
        let send_size = self.size_of(sendty)?;
        let recv_size = self.size_of(recvty)?;
        let recv_counts = recv_counts.to_vec();
        let displs = displs.to_vec();

        self.collective(
            comm,
            Contribution::Allgatherv {
                sendbuf,
                sendcount,
                recvbuf,
            },
            move |contribs| {
                if recv_counts.len() != contribs.len() || displs.len() != contribs.len() {
                    return Err(BackendError::new("count arrays do not match group size"));
                }
                // Snapshot all send chunks first; recvbuf may alias sendbuf.
                let mut chunks = Vec::with_capacity(contribs.len());
                let mut dests = Vec::with_capacity(contribs.len());
                for (i, c) in contribs.iter().enumerate() {
                    let Some(Contribution::Allgatherv {
                        sendbuf,
                        sendcount,
                        recvbuf,
                    }) = c
                    else {
                        return Err(BackendError::new("mismatched collective calls in group"));
                    };
                    let send_bytes = sendcount * send_size;
                    if send_bytes != recv_counts[i] * recv_size {
                        return Err(BackendError::new(format!(
                            "rank slot {i}: sent {send_bytes} bytes but recv_counts expects {}",
                            recv_counts[i] * recv_size
                        )));
                    }
                    let src =
                        unsafe { std::slice::from_raw_parts(*sendbuf as *const u8, send_bytes) };
                    chunks.push(src.to_vec());
                    dests.push(*recvbuf);
                }
                for dst in dests {
                    for (i, chunk) in chunks.iter().enumerate() {
                        let at = dst + (displs[i] * recv_size) as u64;
                        unsafe {
                            std::ptr::copy_nonoverlapping(
                                chunk.as_ptr(),
                                at as *mut u8,
                                chunk.len(),
                            );
                        }
                    }
                }
                Ok(None)
            },
        )?;
        Ok(())
    }

    unsafe fn broadcast(
        &self,
        buf: u64,
        count: usize,
        ty: TypeTag,
        root: Rank,
        comm: CommHandle,
    ) -> BackendResult<()> {
        let bytes = count * self.size_of(ty)?;
        let root = root as usize;

        self.collective(comm, Contribution::Broadcast { buf }, move |contribs| {
            let Some(Some(Contribution::Broadcast { buf: root_buf })) = contribs.get(root) else {
                return Err(BackendError::new(format!("invalid broadcast root {root}")));
            };
            let data =
                unsafe { std::slice::from_raw_parts(*root_buf as *const u8, bytes) }.to_vec();
            for (i, c) in contribs.iter().enumerate() {
                if i == root {
                    continue;
                }
                let Some(Contribution::Broadcast { buf }) = c else {
                    return Err(BackendError::new("mismatched collective calls in group"));
                };
                unsafe {
                    std::ptr::copy_nonoverlapping(data.as_ptr(), *buf as *mut u8, bytes);
                }
            }
            Ok(None)
        })?;
        Ok(())
    }

    fn barrier(&self, comm: CommHandle) -> BackendResult<()> {
        self.collective(comm, Contribution::Barrier, |_| Ok(None))?;
        Ok(())
    }

    fn allocate_shared(
        &self,
        window_size: usize,
        element_size: usize,
        comm: CommHandle,
    ) -> BackendResult<WindowHandle> {
        if element_size == 0 {
            return Err(BackendError::new("element_size must be non-zero"));
        }
        let shared = self.shared.clone();
        let handle = self.collective(
            comm,
            Contribution::AllocWindow { bytes: window_size },
            move |contribs| {
                let mut sizes = Vec::with_capacity(contribs.len());
                for c in contribs {
                    let Some(Contribution::AllocWindow { bytes }) = c else {
                        return Err(BackendError::new("mismatched collective calls in group"));
                    };
                    sizes.push(*bytes);
                }
                let total: usize = sizes.iter().sum();
                let buf = vec![0u8; total].into_boxed_slice();
                let base = buf.as_ptr() as u64;
                let mut regions = Vec::with_capacity(sizes.len());
                let mut offset = 0usize;
                for size in sizes {
                    regions.push(WindowRegion {
                        base: base + offset as u64,
                        size,
                    });
                    offset += size;
                }
                let id = shared.next_window.fetch_add(1, Ordering::SeqCst);
                lock(&shared.windows, "windows")?
                    .insert(id, WindowState { _buf: buf, regions });
                Ok(Some(WindowHandle(id)))
            },
        )?;
        handle.ok_or_else(|| BackendError::new("window allocation produced no handle"))
    }

    fn query_shared(&self, window: WindowHandle, rank: Rank) -> BackendResult<WindowRegion> {
        let windows = lock(&self.shared.windows, "windows")?;
        let state = windows
            .get(&window.0)
            .ok_or_else(|| BackendError::new(format!("window {} not found", window.0)))?;
        state
            .regions
            .get(rank as usize)
            .copied()
            .ok_or_else(|| BackendError::new(format!("no region for rank {rank}")))
    }

    fn free_shared(&self, window: WindowHandle, comm: CommHandle) -> BackendResult<()> {
        // The rendezvous doubles as the fence: nobody's past read can
        // still be in flight once every member has entered.
        let shared = self.shared.clone();
        self.collective(comm, Contribution::FreeWindow, move |_contribs| {
            lock(&shared.windows, "windows")?
                .remove(&window.0)
                .ok_or_else(|| BackendError::new(format!("window {} not found", window.0)))?;
            Ok(None)
        })?;
        Ok(())
    }

    fn register_custom_type(&self, size_bytes: usize) -> BackendResult<TypeTag> {
        if size_bytes == 0 {
            return Err(BackendError::new("custom type size must be non-zero"));
        }
        let tag = self.shared.next_type_tag.fetch_add(1, Ordering::SeqCst);
        lock(&self.shared.custom_types, "custom types")?.insert(tag, size_bytes);
        Ok(TypeTag(tag))
    }

    fn register_custom_op(&self, f: CustomReduceFn) -> BackendResult<OpTag> {
        let tag = self.shared.next_op_tag.fetch_add(1, Ordering::SeqCst);
        lock(&self.shared.custom_ops, "custom ops")?.insert(tag, f);
        Ok(OpTag(tag))
    }

    fn type_size_of(&self, ty: TypeTag) -> BackendResult<usize> {
        self.size_of(ty)
    }
}

/// Builtin elementwise sum on byte slices interpreted as `ty` elements.
fn accumulate_sum(acc: &mut [u8], src: &[u8], ty: TypeTag) -> BackendResult<()> {
    match ty {
        TypeTag::U8 | TypeTag::BOOL | TypeTag::BYTE => fold::<u8>(acc, src),
        TypeTag::I8 => fold::<i8>(acc, src),
        TypeTag::U16 => fold::<u16>(acc, src),
        TypeTag::I16 => fold::<i16>(acc, src),
        TypeTag::I32 => fold::<i32>(acc, src),
        TypeTag::I64 => fold::<i64>(acc, src),
        TypeTag::F32 => fold::<f32>(acc, src),
        TypeTag::F64 => fold::<f64>(acc, src),
        _ => {
            return Err(BackendError::new(format!(
                "builtin sum not defined for type tag {}",
                ty.0
            )))
        }
    }
    Ok(())
}

/// Alignment-safe little-endian element access plus addition.
trait SumElement: Copy {
    const SIZE: usize;
    fn read_le(bytes: &[u8]) -> Self;
    fn write_le(self, bytes: &mut [u8]);
    fn add(a: Self, b: Self) -> Self;
}

macro_rules! impl_sum_element {
    (int: $($ty:ty),*) => {
        $(
            impl SumElement for $ty {
                const SIZE: usize = std::mem::size_of::<$ty>();
                #[inline]
                fn read_le(bytes: &[u8]) -> Self {
                    Self::from_le_bytes(bytes.try_into().expect("chunk length matches type size"))
                }
                #[inline]
                fn write_le(self, bytes: &mut [u8]) {
                    bytes.copy_from_slice(&self.to_le_bytes());
                }
                #[inline]
                fn add(a: Self, b: Self) -> Self {
                    a.wrapping_add(b)
                }
            }
        )*
    };
    (float: $($ty:ty),*) => {
        $(
            impl SumElement for $ty {
                const SIZE: usize = std::mem::size_of::<$ty>();
                #[inline]
                fn read_le(bytes: &[u8]) -> Self {
                    Self::from_le_bytes(bytes.try_into().expect("chunk length matches type size"))
                }
                #[inline]
                fn write_le(self, bytes: &mut [u8]) {
                    bytes.copy_from_slice(&self.to_le_bytes());
                }
                #[inline]
                fn add(a: Self, b: Self) -> Self {
                    a + b
                }
            }
        )*
    };
}

impl_sum_element!(int: u8, i8, u16, i16, i32, i64);
impl_sum_element!(float: f32, f64);

fn fold<T: SumElement>(acc: &mut [u8], src: &[u8]) {
    for (a, s) in acc
        .chunks_exact_mut(T::SIZE)
        .zip(src.chunks_exact(T::SIZE))
    {
        T::add(T::read_le(a), T::read_le(s)).write_le(a);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::ClusterTopology;

    #[test]
    fn test_launch_layout() {
        let endpoints = LocalCluster::launch(&[2, 2]);
        assert_eq!(endpoints.len(), 4);
        for (i, ep) in endpoints.iter().enumerate() {
            assert_eq!(ep.rank(), i as Rank);
        }
        // Node assignment: ranks 0,1 on node 0; 2,3 on node 1.
        assert_eq!(endpoints[0].node, 0);
        assert_eq!(endpoints[1].node, 0);
        assert_eq!(endpoints[2].node, 1);
        assert_eq!(endpoints[3].node, 1);
        assert_eq!(endpoints[1].local_rank, 1);
        assert_eq!(endpoints[2].local_rank, 0);
        assert!(endpoints[0].topology().is_homogeneous());
    }

    #[test]
    fn test_heterogeneous_layout() {
        let endpoints = LocalCluster::launch(&[2, 1]);
        assert_eq!(endpoints.len(), 3);
        assert!(!endpoints[0].topology().is_homogeneous());
        // Cross group for local index 1 only contains rank 1.
        let cross1 = CommHandle(1 + 2 + 1);
        assert_eq!(endpoints[1].group_size(cross1).unwrap(), 1);
    }

    #[test]
    fn test_group_membership() {
        let endpoints = LocalCluster::launch(&[2, 2]);
        let global = CommHandle(0);
        assert_eq!(endpoints[3].group_size(global).unwrap(), 4);
        assert_eq!(endpoints[3].group_rank(global).unwrap(), 3);

        let node1 = CommHandle(2);
        assert_eq!(endpoints[2].group_size(node1).unwrap(), 2);
        assert_eq!(endpoints[2].group_rank(node1).unwrap(), 0);

        // Rank 0 is not in node 1's communicator.
        assert!(endpoints[0].group_rank(node1).is_err());
        // Unknown communicator handle.
        assert!(endpoints[0].group_rank(CommHandle(99)).is_err());
    }

    #[test]
    fn test_accumulate_sum_f32() {
        let mut acc: Vec<u8> = [1.0f32, 2.0].iter().flat_map(|v| v.to_le_bytes()).collect();
        let src: Vec<u8> = [3.0f32, 4.5].iter().flat_map(|v| v.to_le_bytes()).collect();
        accumulate_sum(&mut acc, &src, TypeTag::F32).unwrap();
        let out: Vec<f32> = acc
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes(c.try_into().unwrap()))
            .collect();
        assert_eq!(out, vec![4.0, 6.5]);
    }

    #[test]
    fn test_accumulate_sum_wraps_integers() {
        let mut acc = vec![250u8];
        accumulate_sum(&mut acc, &[10u8], TypeTag::U8).unwrap();
        assert_eq!(acc, vec![4u8]);
    }

    #[test]
    fn test_custom_tag_lookup() {
        let endpoints = LocalCluster::launch(&[1]);
        let ep = &endpoints[0];
        let ty = ep.register_custom_type(2).unwrap();
        assert_eq!(ep.type_size_of(ty).unwrap(), 2);
        assert!(ep.type_size_of(TypeTag(9999)).is_err());
        assert!(ep.register_custom_type(0).is_err());
    }
}
