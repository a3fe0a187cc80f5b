mod context;
mod dtype;
mod local;
mod scope;

pub use context::CommContext;
pub use dtype::TypeMapper;
pub use local::{LocalCluster, LocalEndpoint};
pub use scope::{CommScope, ScopeMap};

use crate::types::Rank;

/// Opaque handle to one communicator group issued by the backend.
///
/// Handles are process-local, like MPI communicator handles: the same
/// logical group may have different handle values on different ranks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommHandle(pub u32);

/// Backend-native element type tag.
///
/// Tags below [`TypeTag::CUSTOM_BASE`] are the built-in kinds every
/// backend understands; tags at or above it are issued by
/// [`GroupComm::register_custom_type`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeTag(pub u32);

impl TypeTag {
    pub const U8: TypeTag = TypeTag(1);
    pub const I8: TypeTag = TypeTag(2);
    pub const U16: TypeTag = TypeTag(3);
    pub const I16: TypeTag = TypeTag(4);
    pub const I32: TypeTag = TypeTag(5);
    pub const I64: TypeTag = TypeTag(6);
    pub const F32: TypeTag = TypeTag(7);
    pub const F64: TypeTag = TypeTag(8);
    pub const BOOL: TypeTag = TypeTag(9);
    pub const BYTE: TypeTag = TypeTag(10);

    /// First tag value available for registered custom types.
    pub const CUSTOM_BASE: u32 = 0x100;

    /// Element size of a built-in tag. `None` for custom tags, whose
    /// size only the issuing backend knows.
    pub const fn native_size(self) -> Option<usize> {
        match self {
            TypeTag::U8 | TypeTag::I8 | TypeTag::BOOL | TypeTag::BYTE => Some(1),
            TypeTag::U16 | TypeTag::I16 => Some(2),
            TypeTag::I32 | TypeTag::F32 => Some(4),
            TypeTag::I64 | TypeTag::F64 => Some(8),
            _ => None,
        }
    }
}

/// Backend-native reduction operator tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpTag(pub u32);

impl OpTag {
    /// The backend's built-in elementwise sum.
    pub const SUM: OpTag = OpTag(0);

    /// First tag value available for registered custom operators.
    pub const CUSTOM_BASE: u32 = 0x100;
}

/// Opaque token for a collectively allocated shared-memory window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WindowHandle(pub u64);

/// One rank's region of a shared window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowRegion {
    /// Base address of the region, addressable by every rank in the
    /// window's node-local group.
    pub base: u64,
    /// Region size in bytes.
    pub size: usize,
}

/// A custom elementwise reduction kernel registered with the backend.
///
/// Folds `src` into `acc`; both slices hold the same number of elements
/// of the custom type the operator was registered for. Must be
/// associative and commutative: the backend chooses fold order.
pub type CustomReduceFn = fn(acc: &mut [u8], src: &[u8]);

/// Non-success result reported by the group-communication backend.
///
/// Carries the backend's diagnostic only; the adapter layer attaches
/// the failing operation's name when it wraps this into a crate error.
#[derive(Debug, Clone)]
pub struct BackendError(String);

impl BackendError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

impl std::fmt::Display for BackendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for BackendError {}

pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// The raw group-communication backend seam.
///
/// One implementor instance represents one participating process. Every
/// operation is collective over the group named by its `CommHandle` and
/// blocks the calling thread until the local contribution completes.
/// The liveness contract is the caller's: every member of a group must
/// issue matching calls in the same relative order, or the group hangs.
///
/// Buffer arguments are raw addresses because the backend moves bytes
/// it does not own; validity is the caller's responsibility, stated per
/// method.
pub trait GroupComm: Send + Sync {
    /// This process's rank within `comm`.
    fn group_rank(&self, comm: CommHandle) -> BackendResult<Rank>;

    /// Number of participants in `comm`.
    fn group_size(&self, comm: CommHandle) -> BackendResult<usize>;

    /// Elementwise reduction replicated to all members.
    ///
    /// `sendbuf == None` selects the in-place form: `recvbuf` already
    /// holds this rank's contribution.
    ///
    /// # Safety
    /// `recvbuf` (and `sendbuf`, when present) must be valid for
    /// `count` elements of the type named by `ty` for the duration of
    /// the call.
    unsafe fn allreduce(
        &self,
        sendbuf: Option<u64>,
        recvbuf: u64,
        count: usize,
        ty: TypeTag,
        op: OpTag,
        comm: CommHandle,
    ) -> BackendResult<()>;

    /// Variable-count gather replicated to all members.
    ///
    /// `recv_counts` and `displs` have one entry per member of `comm`,
    /// in group-rank order; displacements are in elements of `recvty`.
    ///
    /// # Safety
    /// `sendbuf` must be valid for `sendcount` elements of `sendty`;
    /// `recvbuf` must be valid for every `displs[i] + recv_counts[i]`
    /// element range of `recvty`.
    #[allow(clippy::too_many_arguments)]
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
    ) -> BackendResult<()>;

    /// Replicate `root`'s buffer to every other member.
    ///
    /// # Safety
    /// `buf` must be valid for `count` elements of `ty` on every rank.
    unsafe fn broadcast(
        &self,
        buf: u64,
        count: usize,
        ty: TypeTag,
        root: Rank,
        comm: CommHandle,
    ) -> BackendResult<()>;

    /// Block until every member of `comm` has entered.
    fn barrier(&self, comm: CommHandle) -> BackendResult<()>;

    /// Collectively allocate a shared window over `comm`. Each member
    /// contributes `window_size` bytes; regions are laid out
    /// contiguously in group-rank order.
    fn allocate_shared(
        &self,
        window_size: usize,
        element_size: usize,
        comm: CommHandle,
    ) -> BackendResult<WindowHandle>;

    /// Look up `rank`'s region of an allocated window. Not collective.
    fn query_shared(&self, window: WindowHandle, rank: Rank) -> BackendResult<WindowRegion>;

    /// Collectively release a window. The backend fences `comm` before
    /// freeing, so no member is mid-read when the region goes away.
    fn free_shared(&self, window: WindowHandle, comm: CommHandle) -> BackendResult<()>;

    /// Register a custom element type of `size_bytes` bytes.
    fn register_custom_type(&self, size_bytes: usize) -> BackendResult<TypeTag> {
        let _ = size_bytes;
        Err(BackendError::new("custom types not supported by this backend"))
    }

    /// Register a custom reduction operator.
    fn register_custom_op(&self, f: CustomReduceFn) -> BackendResult<OpTag> {
        let _ = f;
        Err(BackendError::new("custom operators not supported by this backend"))
    }

    /// Element size of a tag, including registered custom tags.
    fn type_size_of(&self, ty: TypeTag) -> BackendResult<usize> {
        ty.native_size()
            .ok_or_else(|| BackendError::new(format!("unknown type tag {}", ty.0)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_native_tag_sizes() {
        assert_eq!(TypeTag::U8.native_size(), Some(1));
        assert_eq!(TypeTag::I16.native_size(), Some(2));
        assert_eq!(TypeTag::F32.native_size(), Some(4));
        assert_eq!(TypeTag::F64.native_size(), Some(8));
        assert_eq!(TypeTag::BOOL.native_size(), Some(1));
        assert_eq!(TypeTag(TypeTag::CUSTOM_BASE).native_size(), None);
    }

    #[test]
    fn test_backend_error_display() {
        let e = BackendError::new("window 3 not found");
        assert_eq!(e.to_string(), "window 3 not found");
    }
}
