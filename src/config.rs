//! Runtime-configurable tuning parameters for quorum.
//!
//! All values have sensible defaults. Override via environment variables
//! (prefixed `QUORUM_`) or by constructing a custom `QuorumConfig`.

use std::time::Duration;

/// Tuning parameters for operation selection and coordinator behavior.
#[derive(Debug, Clone)]
pub struct QuorumConfig {
    /// Use the hierarchical (cross-node + shared-window) allgather
    /// instead of the flat whole-group allgatherv.
    pub hierarchical_allgather: bool,

    /// Age past which an incomplete readiness record counts as stalled.
    pub stall_threshold: Duration,

    /// Minimum interval between coordinator stall sweeps. Each sweep
    /// reports every stalled record at most once.
    pub stall_sweep_interval: Duration,
}

impl Default for QuorumConfig {
    fn default() -> Self {
        Self {
            hierarchical_allgather: false,
            stall_threshold: Duration::from_secs(60),
            stall_sweep_interval: Duration::from_secs(10),
        }
    }
}

impl QuorumConfig {
    /// Load config from environment variables, falling back to defaults.
    ///
    /// Recognized variables:
    /// - `QUORUM_HIERARCHICAL_ALLGATHER` (`1`/`true` to enable)
    /// - `QUORUM_STALL_THRESHOLD_SECS`
    /// - `QUORUM_STALL_SWEEP_SECS`
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("QUORUM_HIERARCHICAL_ALLGATHER") {
            cfg.hierarchical_allgather = v == "1" || v.eq_ignore_ascii_case("true");
        }
        if let Ok(v) = std::env::var("QUORUM_STALL_THRESHOLD_SECS") {
            if let Ok(s) = v.parse::<u64>() {
                cfg.stall_threshold = Duration::from_secs(s);
            }
        }
        if let Ok(v) = std::env::var("QUORUM_STALL_SWEEP_SECS") {
            if let Ok(s) = v.parse::<u64>() {
                cfg.stall_sweep_interval = Duration::from_secs(s);
            }
        }

        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = QuorumConfig::default();
        assert!(!cfg.hierarchical_allgather);
        assert_eq!(cfg.stall_threshold, Duration::from_secs(60));
        assert_eq!(cfg.stall_sweep_interval, Duration::from_secs(10));
    }
}
