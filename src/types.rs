/// Unique identifier for a node (host) in the cluster.
pub type NodeId = u32;

/// Rank of a participant in a communicator group (0-indexed).
pub type Rank = u32;

/// Element types supported for collective operations.
///
/// quorum defines its own type enum so it remains a standalone
/// coordination layer usable with any tensor storage. `Null` is a
/// sentinel for "no data"; it never maps to a backend type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DataType {
    U8 = 0,
    I8 = 1,
    U16 = 2,
    I16 = 3,
    I32 = 4,
    I64 = 5,
    F16 = 6,
    F32 = 7,
    F64 = 8,
    Bool = 9,
    Byte = 10,
    Null = 11,
}

impl DataType {
    /// Size of one element in bytes. `None` for the `Null` sentinel.
    pub const fn size_in_bytes(self) -> Option<usize> {
        match self {
            DataType::U8 | DataType::I8 | DataType::Bool | DataType::Byte => Some(1),
            DataType::U16 | DataType::I16 | DataType::F16 => Some(2),
            DataType::I32 | DataType::F32 => Some(4),
            DataType::I64 | DataType::F64 => Some(8),
            DataType::Null => None,
        }
    }

    /// Human-readable name.
    pub const fn name(self) -> &'static str {
        match self {
            DataType::U8 => "u8",
            DataType::I8 => "i8",
            DataType::U16 => "u16",
            DataType::I16 => "i16",
            DataType::I32 => "i32",
            DataType::I64 => "i64",
            DataType::F16 => "f16",
            DataType::F32 => "f32",
            DataType::F64 => "f64",
            DataType::Bool => "bool",
            DataType::Byte => "byte",
            DataType::Null => "null",
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// The collective operation a participant is asking for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Allreduce,
    Allgather,
    Broadcast,
}

impl std::fmt::Display for OpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OpKind::Allreduce => f.write_str("allreduce"),
            OpKind::Allgather => f.write_str("allgather"),
            OpKind::Broadcast => f.write_str("broadcast"),
        }
    }
}

/// One logical tensor participating in a collective call.
///
/// Buffers are raw addresses into storage owned by the caller; entries
/// live only for the duration of one collective invocation and are
/// never persisted by this layer.
#[derive(Debug, Clone)]
pub struct TensorEntry {
    /// Stable tensor name, shared by all participants.
    pub name: String,
    /// Address of the input buffer.
    pub input: u64,
    /// Address of the output buffer. May equal `input`.
    pub output: u64,
    pub dtype: DataType,
    /// Number of elements, not bytes.
    pub count: usize,
}

impl TensorEntry {
    /// Total byte length of this entry's payload, if the dtype has a size.
    pub fn byte_len(&self) -> Option<usize> {
        self.dtype.size_in_bytes().map(|s| s * self.count)
    }
}
