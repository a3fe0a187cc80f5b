use super::CommHandle;
use crate::error::{QuorumError, Result};

/// The subset of processes a collective call targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommScope {
    /// Every participating process.
    Global,
    /// Processes on this node.
    Local,
    /// One representative per node (grouped by node-local index).
    Cross,
}

impl CommScope {
    pub const fn name(self) -> &'static str {
        match self {
            CommScope::Global => "global",
            CommScope::Local => "local",
            CommScope::Cross => "cross",
        }
    }
}

impl std::fmt::Display for CommScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Maps each logical scope to the backend communicator handle serving it.
///
/// Resolution is a pure lookup. A scope whose handle was never
/// configured resolves to `UnsupportedScope` rather than any default;
/// cross and local communicators only exist once the topology layer has
/// split the global group, so a partially configured map is legitimate.
#[derive(Debug, Clone, Default)]
pub struct ScopeMap {
    global: Option<CommHandle>,
    local: Option<CommHandle>,
    cross: Option<CommHandle>,
}

impl ScopeMap {
    /// A map with all three scopes configured.
    pub fn new(global: CommHandle, local: CommHandle, cross: CommHandle) -> Self {
        Self {
            global: Some(global),
            local: Some(local),
            cross: Some(cross),
        }
    }

    /// A map with only the whole-group communicator configured.
    pub fn global_only(global: CommHandle) -> Self {
        Self {
            global: Some(global),
            local: None,
            cross: None,
        }
    }

    pub fn resolve(&self, scope: CommScope) -> Result<CommHandle> {
        let handle = match scope {
            CommScope::Global => self.global,
            CommScope::Local => self.local,
            CommScope::Cross => self.cross,
        };
        handle.ok_or(QuorumError::UnsupportedScope { scope })
    }
}
