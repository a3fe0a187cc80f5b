use std::sync::Arc;

use super::{CollectiveOp, OperationRequest};
use crate::backend::{CommContext, CommScope};
use crate::config::QuorumConfig;
use crate::error::{QuorumError, Result};
use crate::timeline::Timeline;
use crate::types::TensorEntry;

/// Plain whole-group all-reduce. Always applicable.
pub struct AllreduceOp {
    ctx: Arc<CommContext>,
    timeline: Arc<dyn Timeline>,
}

impl AllreduceOp {
    pub fn new(ctx: Arc<CommContext>, timeline: Arc<dyn Timeline>) -> Self {
        Self { ctx, timeline }
    }

    /// One `allreduce_sum` over the whole group.
    ///
    /// `buffer`/`num_elements` describe the (possibly fused) reduction
    /// buffer. A separate source is passed only when a single entry has
    /// distinct input and output buffers; with multiple fused entries,
    /// or when the first entry reduces in place, the buffer already
    /// holds this rank's contribution and the in-place form is used.
    ///
    /// # Safety
    /// `buffer` must be valid for `num_elements` elements of the first
    /// entry's dtype; a distinct first-entry input buffer must be valid
    /// for the same extent.
    pub unsafe fn execute(
        &self,
        entries: &[TensorEntry],
        buffer: u64,
        num_elements: usize,
    ) -> Result<()> {
        let first = entries.first().ok_or(QuorumError::EmptyBatch {
            operation: "allreduce",
        })?;
        let sendbuf = if entries.len() > 1 || first.input == first.output {
            None
        } else {
            Some(first.input)
        };

        self.timeline.activity_start(entries, "ALLREDUCE");
        let res = unsafe {
            self.ctx
                .allreduce_sum(sendbuf, buffer, num_elements, first.dtype, CommScope::Global)
        };
        self.timeline.activity_end(entries);
        res
    }
}

impl CollectiveOp for AllreduceOp {
    fn enabled(
        &self,
        _config: &QuorumConfig,
        _entries: &[TensorEntry],
        _request: &OperationRequest,
    ) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{
        BackendError, BackendResult, CommHandle, GroupComm, OpTag, ScopeMap, TypeTag,
        WindowHandle, WindowRegion,
    };
    use crate::timeline::NullTimeline;
    use crate::types::{DataType, OpKind, Rank};
    use std::sync::Mutex;

    /// Records the buffer arguments of each allreduce call.
    #[derive(Default)]
    struct RecordingBackend {
        calls: Mutex<Vec<(Option<u64>, u64, usize, OpTag)>>,
    }

    impl GroupComm for RecordingBackend {
        fn group_rank(&self, _comm: CommHandle) -> BackendResult<Rank> {
            Ok(0)
        }
        fn group_size(&self, _comm: CommHandle) -> BackendResult<usize> {
            Ok(2)
        }
        unsafe fn allreduce(
            &self,
            sendbuf: Option<u64>,
            recvbuf: u64,
            count: usize,
            _ty: TypeTag,
            op: OpTag,
            _comm: CommHandle,
        ) -> BackendResult<()> {
            self.calls
                .lock()
                .map_err(|_| BackendError::new("lock poisoned"))?
                .push((sendbuf, recvbuf, count, op));
            Ok(())
        }
        unsafe fn allgatherv(
            &self,
            _sendbuf: u64,
            _sendcount: usize,
            _sendty: TypeTag,
            _recvbuf: u64,
            _recv_counts: &[usize],
            _displs: &[usize],
            _recvty: TypeTag,
            _comm: CommHandle,
        ) -> BackendResult<()> {
            Ok(())
        }
        unsafe fn broadcast(
            &self,
            _buf: u64,
            _count: usize,
            _ty: TypeTag,
            _root: Rank,
            _comm: CommHandle,
        ) -> BackendResult<()> {
            Ok(())
        }
        fn barrier(&self, _comm: CommHandle) -> BackendResult<()> {
            Ok(())
        }
        fn allocate_shared(
            &self,
            _window_size: usize,
            _element_size: usize,
            _comm: CommHandle,
        ) -> BackendResult<WindowHandle> {
            Ok(WindowHandle(0))
        }
        fn query_shared(&self, _window: WindowHandle, _rank: Rank) -> BackendResult<WindowRegion> {
            Ok(WindowRegion { base: 0, size: 0 })
        }
        fn free_shared(&self, _window: WindowHandle, _comm: CommHandle) -> BackendResult<()> {
            Ok(())
        }
        fn register_custom_type(&self, _size_bytes: usize) -> BackendResult<TypeTag> {
            Ok(TypeTag(TypeTag::CUSTOM_BASE))
        }
        fn register_custom_op(&self, _f: crate::backend::CustomReduceFn) -> BackendResult<OpTag> {
            Ok(OpTag(OpTag::CUSTOM_BASE))
        }
        fn type_size_of(&self, ty: TypeTag) -> BackendResult<usize> {
            ty.native_size()
                .or(if ty.0 >= TypeTag::CUSTOM_BASE { Some(2) } else { None })
                .ok_or_else(|| BackendError::new("unknown tag"))
        }
    }

    fn entry(name: &str, input: u64, output: u64) -> TensorEntry {
        TensorEntry {
            name: name.into(),
            input,
            output,
            dtype: DataType::F32,
            count: 4,
        }
    }

    fn op_with_backend() -> (Arc<RecordingBackend>, AllreduceOp) {
        let backend = Arc::new(RecordingBackend::default());
        let ctx = Arc::new(CommContext::new(
            backend.clone() as Arc<dyn GroupComm>,
            ScopeMap::global_only(CommHandle(0)),
        ));
        (backend, AllreduceOp::new(ctx, Arc::new(NullTimeline)))
    }

    #[test]
    fn test_fused_entries_use_in_place_form() {
        let (backend, op) = op_with_backend();
        // Two fused entries, first one reducing in place.
        let entries = vec![entry("a", 0x1000, 0x1000), entry("b", 0x2000, 0x3000)];
        unsafe { op.execute(&entries, 0x9000, 8).unwrap() };

        let calls = backend.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        let (sendbuf, recvbuf, count, _) = calls[0];
        assert_eq!(sendbuf, None, "fused call must use the in-place form");
        assert_eq!(recvbuf, 0x9000);
        assert_eq!(count, 8);
    }

    #[test]
    fn test_single_inplace_entry_uses_in_place_form() {
        let (backend, op) = op_with_backend();
        let entries = vec![entry("a", 0x1000, 0x1000)];
        unsafe { op.execute(&entries, 0x1000, 4).unwrap() };
        assert_eq!(backend.calls.lock().unwrap()[0].0, None);
    }

    #[test]
    fn test_single_entry_distinct_buffers_passes_source() {
        let (backend, op) = op_with_backend();
        let entries = vec![entry("a", 0x1000, 0x2000)];
        unsafe { op.execute(&entries, 0x2000, 4).unwrap() };

        let calls = backend.calls.lock().unwrap();
        assert_eq!(
            calls[0].0,
            Some(0x1000),
            "distinct buffers must pass an explicit source"
        );
    }

    #[test]
    fn test_f16_routes_custom_operator() {
        let (backend, op) = op_with_backend();
        let mut e = entry("h", 0x1000, 0x1000);
        e.dtype = DataType::F16;
        unsafe { op.execute(&[e], 0x1000, 4).unwrap() };
        let calls = backend.calls.lock().unwrap();
        assert_ne!(calls[0].3, OpTag::SUM, "f16 must not use the builtin sum");
    }

    #[test]
    fn test_empty_batch_rejected() {
        let (_, op) = op_with_backend();
        assert!(matches!(
            unsafe { op.execute(&[], 0, 0) },
            Err(QuorumError::EmptyBatch { .. })
        ));
    }

    #[test]
    fn test_always_enabled() {
        let (_, op) = op_with_backend();
        let cfg = QuorumConfig::default();
        let req = OperationRequest::new(OpKind::Allreduce);
        assert!(op.enabled(&cfg, &[], &req));
    }
}
