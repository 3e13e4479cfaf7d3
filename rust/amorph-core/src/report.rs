//! Aggregated per-loop statistics.

use serde::Serialize;
use std::fmt;

/// Counters for one finished parallel loop, merged across all workers.
///
/// `iterations` counts every application of the operator, committed or not,
/// so `commits() == iterations - conflicts` always holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoopReport {
    /// Diagnostic label from the loop options.
    pub loopname: String,
    /// Number of worker threads that ran the loop.
    pub threads: usize,
    /// Total operator applications.
    pub iterations: u64,
    /// Iterations that aborted on a conflict.
    pub conflicts: u64,
    /// Items pushed by operators.
    pub pushes: u64,
    /// Whether the loop ended through the break flag.
    pub broke: bool,
}

impl LoopReport {
    /// Iterations that completed successfully.
    pub fn commits(&self) -> u64 {
        self.iterations - self.conflicts
    }
}

impl fmt::Display for LoopReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} iterations ({} commits, {} conflicts), {} pushes, {} threads{}",
            self.loopname,
            self.iterations,
            self.commits(),
            self.conflicts,
            self.pushes,
            self.threads,
            if self.broke { ", broke" } else { "" },
        )
    }
}
