//! Coordinator-side readiness negotiation.
//!
//! Every participant declares intent to run an operation on a named
//! tensor by pushing a [`ParticipantRequest`]; the coordinator folds
//! requests into a [`ReadinessTable`] until all participants have
//! reported, at which point the record is consumed and the tensor is
//! ready to schedule. Records that sit incomplete past a threshold are
//! reported as stalls, never dropped: the operation still completes if
//! the stragglers eventually report.
//!
//! The table exists only on the coordinator process and is mutated only
//! by the thread draining the request queue; it is deliberately not
//! shareable state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_queue::SegQueue;
use tracing::warn;

use crate::config::QuorumConfig;
use crate::error::{QuorumError, Result};
use crate::types::{DataType, OpKind, Rank};

/// One process's declaration that a named tensor is ready for a
/// specific operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantRequest {
    pub rank: Rank,
    pub tensor: String,
    pub op: OpKind,
    pub dtype: DataType,
    pub shape: Vec<usize>,
    /// Root rank, for broadcast requests.
    pub root_rank: Option<Rank>,
}

/// Outcome of folding one request into the table.
#[derive(Debug)]
pub enum ReadinessOutcome {
    /// Still waiting for more participants.
    Pending { reported: usize, expected: usize },
    /// Every participant has reported; the record was consumed and the
    /// collected requests are handed over for scheduling.
    Ready(Vec<ParticipantRequest>),
}

struct Record {
    requests: Vec<ParticipantRequest>,
    first_seen: Instant,
}

/// Advisory diagnostic for a record stuck below full participation.
#[derive(Debug, Clone)]
pub struct StallReport {
    pub tensor: String,
    pub reported: usize,
    pub expected: usize,
    pub waited: Duration,
    /// Ranks that have not reported yet.
    pub missing: Vec<Rank>,
}

/// Per-tensor readiness records, keyed by tensor name.
pub struct ReadinessTable {
    records: HashMap<String, Record>,
    expected: usize,
}

impl ReadinessTable {
    /// `expected` is the total participant count; a record is consumed
    /// the moment that many distinct ranks have reported.
    pub fn new(expected: usize) -> Self {
        Self {
            records: HashMap::new(),
            expected,
        }
    }

    /// Fold one request in.
    ///
    /// A second request from a rank that already reported for the same
    /// tensor is a caller contract violation: it is rejected with
    /// `DuplicateRequest` and the record is left untouched, so the
    /// honest remainder of the group can still complete it.
    pub fn record(&mut self, req: ParticipantRequest) -> Result<ReadinessOutcome> {
        let tensor = req.tensor.clone();
        let expected = self.expected;
        let record = self.records.entry(tensor.clone()).or_insert_with(|| Record {
            requests: Vec::with_capacity(expected),
            first_seen: Instant::now(),
        });

        if record.requests.iter().any(|r| r.rank == req.rank) {
            return Err(QuorumError::DuplicateRequest {
                tensor,
                rank: req.rank,
            });
        }

        record.requests.push(req);
        let reported = record.requests.len();
        if reported == expected {
            // Consume exactly once: the record leaves the table the
            // instant the full set arrives.
            if let Some(record) = self.records.remove(&tensor) {
                return Ok(ReadinessOutcome::Ready(record.requests));
            }
        }
        Ok(ReadinessOutcome::Pending { reported, expected })
    }

    /// Number of tensors still awaiting full participation.
    pub fn pending(&self) -> usize {
        self.records.len()
    }

    /// Records older than `threshold`, reported without being removed.
    pub fn stalled(&self, threshold: Duration) -> Vec<StallReport> {
        let now = Instant::now();
        let mut reports: Vec<StallReport> = self
            .records
            .iter()
            .filter_map(|(tensor, record)| {
                let waited = now.duration_since(record.first_seen);
                if waited <= threshold {
                    return None;
                }
                let missing = (0..self.expected as Rank)
                    .filter(|r| !record.requests.iter().any(|req| req.rank == *r))
                    .collect();
                Some(StallReport {
                    tensor: tensor.clone(),
                    reported: record.requests.len(),
                    expected: self.expected,
                    waited,
                    missing,
                })
            })
            .collect();
        reports.sort_by(|a, b| a.tensor.cmp(&b.tensor));
        reports
    }
}

/// The coordinator's request-draining context: owns the readiness table
/// and the queue participants push requests onto. Constructed on
/// coordinator election, dropped at group shutdown.
pub struct Coordinator {
    queue: Arc<SegQueue<ParticipantRequest>>,
    table: ReadinessTable,
    stall_threshold: Duration,
    sweep_interval: Duration,
    last_sweep: Instant,
}

impl Coordinator {
    pub fn new(expected: usize, config: &QuorumConfig) -> Self {
        Self {
            queue: Arc::new(SegQueue::new()),
            table: ReadinessTable::new(expected),
            stall_threshold: config.stall_threshold,
            sweep_interval: config.stall_sweep_interval,
            last_sweep: Instant::now(),
        }
    }

    /// Handle participants push their requests through.
    pub fn queue(&self) -> Arc<SegQueue<ParticipantRequest>> {
        self.queue.clone()
    }

    /// Drain every queued request into the table, returning the request
    /// sets of all tensors that reached full participation.
    pub fn pump(&mut self) -> Result<Vec<Vec<ParticipantRequest>>> {
        let mut ready = Vec::new();
        while let Some(req) = self.queue.pop() {
            if let ReadinessOutcome::Ready(requests) = self.table.record(req)? {
                ready.push(requests);
            }
        }
        Ok(ready)
    }

    /// Run a stall sweep if the sweep interval has elapsed; each
    /// stalled record is reported (and logged) once per sweep.
    pub fn sweep_stalls(&mut self) -> Vec<StallReport> {
        if self.last_sweep.elapsed() < self.sweep_interval {
            return Vec::new();
        }
        self.last_sweep = Instant::now();
        let reports = self.table.stalled(self.stall_threshold);
        for report in &reports {
            warn!(
                tensor = %report.tensor,
                reported = report.reported,
                expected = report.expected,
                waited_secs = report.waited.as_secs(),
                missing = ?report.missing,
                "tensor readiness stalled"
            );
        }
        reports
    }

    /// Direct table access, for callers that bypass the queue.
    pub fn table_mut(&mut self) -> &mut ReadinessTable {
        &mut self.table
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(rank: Rank, tensor: &str) -> ParticipantRequest {
        ParticipantRequest {
            rank,
            tensor: tensor.into(),
            op: OpKind::Allreduce,
            dtype: DataType::F32,
            shape: vec![4, 4],
            root_rank: None,
        }
    }

    #[test]
    fn test_record_awaits_until_full_participation() {
        let mut table = ReadinessTable::new(4);
        for rank in 0..3 {
            match table.record(req(rank, "grad1")).unwrap() {
                ReadinessOutcome::Pending { reported, expected } => {
                    assert_eq!(reported, rank as usize + 1);
                    assert_eq!(expected, 4);
                }
                other => panic!("not yet ready, got {other:?}"),
            }
        }
        assert_eq!(table.pending(), 1);

        match table.record(req(3, "grad1")).unwrap() {
            ReadinessOutcome::Ready(requests) => {
                assert_eq!(requests.len(), 4);
                let mut ranks: Vec<Rank> = requests.iter().map(|r| r.rank).collect();
                ranks.sort_unstable();
                assert_eq!(ranks, vec![0, 1, 2, 3]);
            }
            other => panic!("expected Ready, got {other:?}"),
        }
        // Consumed exactly once: the record is gone.
        assert_eq!(table.pending(), 0);
    }

    #[test]
    fn test_duplicate_request_rejected() {
        let mut table = ReadinessTable::new(3);
        table.record(req(0, "grad1")).unwrap();
        table.record(req(1, "grad1")).unwrap();

        match table.record(req(1, "grad1")) {
            Err(QuorumError::DuplicateRequest { tensor, rank }) => {
                assert_eq!(tensor, "grad1");
                assert_eq!(rank, 1);
            }
            other => panic!("expected DuplicateRequest, got {other:?}"),
        }
        // The record survives and the missing rank can still finish it.
        assert_eq!(table.pending(), 1);
        assert!(matches!(
            table.record(req(2, "grad1")).unwrap(),
            ReadinessOutcome::Ready(_)
        ));
    }

    #[test]
    fn test_independent_tensors() {
        let mut table = ReadinessTable::new(2);
        table.record(req(0, "grad1")).unwrap();
        table.record(req(0, "grad2")).unwrap();
        assert_eq!(table.pending(), 2);
        assert!(matches!(
            table.record(req(1, "grad2")).unwrap(),
            ReadinessOutcome::Ready(_)
        ));
        assert_eq!(table.pending(), 1);
    }

    #[test]
    fn test_stall_reported_without_removal() {
        let mut table = ReadinessTable::new(3);
        table.record(req(0, "grad1")).unwrap();
        table.record(req(2, "grad1")).unwrap();

        // Zero threshold: any age counts as stalled.
        let reports = table.stalled(Duration::ZERO);
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].tensor, "grad1");
        assert_eq!(reports[0].reported, 2);
        assert_eq!(reports[0].expected, 3);
        assert_eq!(reports[0].missing, vec![1]);

        // Reporting does not consume: the straggler can still complete.
        assert_eq!(table.pending(), 1);
        assert!(matches!(
            table.record(req(1, "grad1")).unwrap(),
            ReadinessOutcome::Ready(_)
        ));
    }

    #[test]
    fn test_fresh_record_not_stalled() {
        let mut table = ReadinessTable::new(2);
        table.record(req(0, "grad1")).unwrap();
        assert!(table.stalled(Duration::from_secs(60)).is_empty());
    }

    #[test]
    fn test_coordinator_pump() {
        let mut coord = Coordinator::new(2, &QuorumConfig::default());
        let queue = coord.queue();

        queue.push(req(0, "grad1"));
        queue.push(req(0, "grad2"));
        assert!(coord.pump().unwrap().is_empty());

        queue.push(req(1, "grad1"));
        let ready = coord.pump().unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0][0].tensor, "grad1");
        assert_eq!(coord.table_mut().pending(), 1);
    }

    #[test]
    fn test_coordinator_duplicate_propagates() {
        let mut coord = Coordinator::new(3, &QuorumConfig::default());
        let queue = coord.queue();
        queue.push(req(0, "grad1"));
        queue.push(req(0, "grad1"));
        assert!(matches!(
            coord.pump(),
            Err(QuorumError::DuplicateRequest { .. })
        ));
    }

    #[test]
    fn test_sweep_respects_interval() {
        let cfg = QuorumConfig {
            stall_threshold: Duration::ZERO,
            stall_sweep_interval: Duration::from_secs(3600),
            ..QuorumConfig::default()
        };
        let mut coord = Coordinator::new(2, &cfg);
        coord.queue().push(req(0, "grad1"));
        coord.pump().unwrap();

        // last_sweep was set at construction; the hour has not elapsed.
        assert!(coord.sweep_stalls().is_empty());
        assert_eq!(coord.table_mut().pending(), 1);
    }

    #[test]
    fn test_sweep_reports_once_per_interval() {
        let cfg = QuorumConfig {
            stall_threshold: Duration::ZERO,
            stall_sweep_interval: Duration::ZERO,
            ..QuorumConfig::default()
        };
        let mut coord = Coordinator::new(2, &cfg);
        coord.queue().push(req(0, "grad1"));
        coord.pump().unwrap();

        // Every sweep interval elapses immediately; each sweep reports
        // the stalled record exactly once and leaves it in place.
        let first = coord.sweep_stalls();
        assert_eq!(first.len(), 1);
        let second = coord.sweep_stalls();
        assert_eq!(second.len(), 1);
        assert_eq!(coord.table_mut().pending(), 1);
    }
}
