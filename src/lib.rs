pub mod backend;
pub mod config;
pub mod error;
pub mod ops;
pub mod readiness;
pub mod timeline;
pub mod topology;
pub mod types;
pub mod window;

pub use backend::{
    BackendError, BackendResult, CommContext, CommHandle, CommScope, CustomReduceFn, GroupComm,
    LocalCluster, LocalEndpoint, OpTag, ScopeMap, TypeMapper, TypeTag, WindowHandle, WindowRegion,
};
pub use config::QuorumConfig;
pub use error::{QuorumError, Result};
pub use ops::{
    AllgatherOp, AllreduceOp, BroadcastOp, CollectiveOp, HierarchicalAllgatherOp, OperationRequest,
};
pub use readiness::{
    Coordinator, ParticipantRequest, ReadinessOutcome, ReadinessTable, StallReport,
};
pub use timeline::{NullTimeline, Timeline, TracingTimeline};
pub use topology::{ClusterTopology, StaticTopology};
pub use types::{DataType, NodeId, OpKind, Rank, TensorEntry};
pub use window::SharedWindowManager;
