//! Termination detection.
//!
//! A loop is done when every worker has gone a full round without doing any
//! work and the worklist still looks empty. The detector only tracks the
//! per-worker activity colour; the executor supplies the round structure
//! (barrier between rounds, re-arming, the final emptiness re-check).
//!
//! # Contract
//!
//! * A worker that committed work since its last quiet report keeps global
//!   quiescence false until it reports quiet again.
//! * Once every worker has reported `did_work = false` and no worker has
//!   been re-armed since, [`global_termination`] returns true.
//!
//! [`global_termination`]: TerminationDetector::global_termination

use amorph_core::ids::WorkerId;
use crossbeam_utils::CachePadded;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

/// Per-round quiescence protocol between the executor and its workers.
pub trait TerminationDetector: Send + Sync {
    /// Mark `worker` active again for the next round.
    fn rearm(&self, worker: WorkerId);
    /// Report whether `worker` performed any iterations since its last call.
    fn local_termination(&self, worker: WorkerId, did_work: bool);
    /// Whether every worker is currently quiet.
    fn global_termination(&self) -> bool;
}

/// The default detector: one cache-padded quiet bit per worker.
pub struct QuietFlags {
    quiet: Vec<CachePadded<AtomicBool>>,
}

impl QuietFlags {
    /// A detector for `threads` workers, all initially active.
    pub fn new(threads: usize) -> Self {
        Self {
            quiet: (0..threads.max(1))
                .map(|_| CachePadded::new(AtomicBool::new(false)))
                .collect(),
        }
    }

    /// Number of workers tracked.
    pub fn threads(&self) -> usize {
        self.quiet.len()
    }
}

impl TerminationDetector for QuietFlags {
    fn rearm(&self, worker: WorkerId) {
        self.quiet[worker.index()].store(false, Ordering::Release);
    }

    fn local_termination(&self, worker: WorkerId, did_work: bool) {
        self.quiet[worker.index()].store(!did_work, Ordering::Release);
    }

    fn global_termination(&self) -> bool {
        self.quiet.iter().all(|q| q.load(Ordering::Acquire))
    }
}

impl fmt::Debug for QuietFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let quiet = self
            .quiet
            .iter()
            .filter(|q| q.load(Ordering::Acquire))
            .count();
        f.debug_struct("QuietFlags")
            .field("threads", &self.quiet.len())
            .field("quiet", &quiet)
            .finish()
    }
}
