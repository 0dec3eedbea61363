//! Per-node tick counters: lifecycle events, drops and rollbacks.

use serde::{Deserialize, Serialize};

/// Accumulated statistics for one node's pipeline.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickStats {
    /// Ticks that completed and produced a snapshot
    pub ticks: u64,
    /// Batches rejected before any mutation (validation)
    pub rejected_batches: u64,
    /// Ticks aborted and rolled back
    pub rollbacks: u64,
    pub births: u64,
    pub confirmations: u64,
    pub deaths: u64,
    /// Detections discarded by the per-tick cap
    pub dropped_detections: u64,
    /// Births refused because the track table was full
    pub dropped_births: u64,
}

impl TickStats {
    /// Fold the counters of one completed tick into the running totals.
    pub fn record(&mut self, out: &crate::pipeline::PipelineOutput) {
        self.ticks += 1;
        self.births += out.births as u64;
        self.confirmations += out.confirmations as u64;
        self.deaths += out.deletions as u64;
        self.dropped_detections += out.dropped_detections as u64;
        self.dropped_births += out.dropped_births as u64;
    }
}
