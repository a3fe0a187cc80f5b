//! Instrumentation hooks bracketing each collective operation.
//!
//! Operation variants call `activity_start` / `activity_end` around the
//! backend work; when instrumentation is off the hooks must cost
//! nothing, so the default collaborator is a no-op.

use crate::types::TensorEntry;

pub trait Timeline: Send + Sync {
    fn activity_start(&self, entries: &[TensorEntry], label: &'static str);
    fn activity_end(&self, entries: &[TensorEntry]);
}

/// Instrumentation disabled.
#[derive(Default)]
pub struct NullTimeline;

impl Timeline for NullTimeline {
    fn activity_start(&self, _entries: &[TensorEntry], _label: &'static str) {}
    fn activity_end(&self, _entries: &[TensorEntry]) {}
}

/// Emits one `trace!` event per tensor at each boundary.
#[derive(Default)]
pub struct TracingTimeline;

impl Timeline for TracingTimeline {
    fn activity_start(&self, entries: &[TensorEntry], label: &'static str) {
        for entry in entries {
            tracing::trace!(tensor = %entry.name, activity = label, "activity start");
        }
    }

    fn activity_end(&self, entries: &[TensorEntry]) {
        for entry in entries {
            tracing::trace!(tensor = %entry.name, "activity end");
        }
    }
}
