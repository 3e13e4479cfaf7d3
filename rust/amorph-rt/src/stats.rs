//! Per-worker counters and the runtime's statistics sink.
//!
//! Counters are plain integers owned by one worker; no atomics are needed
//! because merging happens single-threaded at loop teardown. The sink is an
//! append-only in-memory store of finished-loop reports, exportable as JSON.

use amorph_core::report::LoopReport;
use serde_json::json;
use std::fmt;
use std::sync::Mutex;

// ---------------------------------------------------------------------------
// Counters
// ---------------------------------------------------------------------------

/// One worker's tallies for one loop.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct Counters {
    /// Operator applications, committed or aborted.
    pub iterations: u64,
    /// Iterations that aborted on a conflict.
    pub conflicts: u64,
    /// Items pushed by the operator.
    pub pushes: u64,
}

impl Counters {
    /// Iterations that committed.
    pub fn commits(&self) -> u64 {
        self.iterations - self.conflicts
    }

    /// Fold another worker's tallies into this one.
    pub fn merge(&mut self, other: Counters) {
        self.iterations += other.iterations;
        self.conflicts += other.conflicts;
        self.pushes += other.pushes;
    }
}

// ---------------------------------------------------------------------------
// StatsSink
// ---------------------------------------------------------------------------

/// Append-only store of finished-loop reports.
pub struct StatsSink {
    reports: Mutex<Vec<LoopReport>>,
}

impl StatsSink {
    /// An empty sink.
    pub fn new() -> Self {
        Self {
            reports: Mutex::new(Vec::new()),
        }
    }

    /// Record a finished loop.
    pub fn record(&self, report: LoopReport) {
        self.reports.lock().unwrap().push(report);
    }

    /// A copy of every recorded report, in recording order.
    pub fn snapshot(&self) -> Vec<LoopReport> {
        self.reports.lock().unwrap().clone()
    }

    /// Number of recorded reports.
    pub fn len(&self) -> usize {
        self.reports.lock().unwrap().len()
    }

    /// Whether no loop has been recorded yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Grand totals across all recorded loops.
    pub fn totals(&self) -> Counters {
        let mut out = Counters::default();
        for r in self.reports.lock().unwrap().iter() {
            out.merge(Counters {
                iterations: r.iterations,
                conflicts: r.conflicts,
                pushes: r.pushes,
            });
        }
        out
    }

    /// The whole sink as a JSON document.
    pub fn to_json(&self) -> serde_json::Value {
        let totals = self.totals();
        json!({
            "loops": self.snapshot(),
            "totals": {
                "iterations": totals.iterations,
                "commits": totals.commits(),
                "conflicts": totals.conflicts,
                "pushes": totals.pushes,
            },
        })
    }
}

impl Default for StatsSink {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for StatsSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatsSink")
            .field("loops", &self.len())
            .finish()
    }
}
