//! Retry queues for aborted iterations.
//!
//! Each worker owns one FIFO of aborted items: only the owner pops, but any
//! worker may push into it. Which queue receives a given retry is decided by
//! the escalation policy, so repeatedly conflicting items drift toward more
//! distant workers instead of colliding with the same neighbour again.

use amorph_core::escalation::{self, EscalationPolicy};
use amorph_core::ids::WorkerId;
use amorph_core::topology::Topology;
use crossbeam_channel::{Receiver, Sender};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

// ---------------------------------------------------------------------------
// Aborted
// ---------------------------------------------------------------------------

/// An item whose iteration aborted at least once.
///
/// `retries` grows by one on every re-enqueue and never decreases; it drives
/// the escalation routing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Aborted<T> {
    pub val: T,
    pub retries: u32,
}

// ---------------------------------------------------------------------------
// AbortHandler
// ---------------------------------------------------------------------------

/// Routes aborted items to per-worker retry queues under an escalation
/// policy.
pub struct AbortHandler<T> {
    queues: Vec<Sender<Aborted<T>>>,
    policy: EscalationPolicy,
    topo: Topology,
    /// Highest retry count seen; instrumentation for tests and reports.
    peak_retries: AtomicU32,
}

impl<T> AbortHandler<T> {
    /// Build the handler plus one receiver per worker. Receiver `i` belongs
    /// to worker `i` and must be popped only by it.
    pub fn new(topo: Topology, policy: EscalationPolicy) -> (Self, Vec<Receiver<Aborted<T>>>) {
        let mut queues = Vec::with_capacity(topo.threads());
        let mut receivers = Vec::with_capacity(topo.threads());
        for _ in 0..topo.threads() {
            let (tx, rx) = crossbeam_channel::unbounded();
            queues.push(tx);
            receivers.push(rx);
        }
        let handler = Self {
            queues,
            policy,
            topo,
            peak_retries: AtomicU32::new(0),
        };
        (handler, receivers)
    }

    /// Enqueue an item that aborted on worker `from` for retry.
    ///
    /// `prior_retries` is the count carried by the item before this abort
    /// (0 for an item popped from the worklist); the stored count is one
    /// higher, keeping escalation monotone.
    pub fn push(&self, from: WorkerId, val: T, prior_retries: u32) {
        let retries = prior_retries + 1;
        self.peak_retries.fetch_max(retries, Ordering::Relaxed);
        let dest = escalation::destination(self.policy, &self.topo, from, retries);
        // The receiver can only be gone once the loop is shutting down, at
        // which point remaining retries are discarded anyway.
        let _ = self.queues[dest.index()].send(Aborted { val, retries });
    }

    /// The escalation policy in effect.
    pub fn policy(&self) -> EscalationPolicy {
        self.policy
    }

    /// Highest retry count routed so far.
    pub fn peak_retries(&self) -> u32 {
        self.peak_retries.load(Ordering::Relaxed)
    }
}

impl<T> fmt::Debug for AbortHandler<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AbortHandler")
            .field("workers", &self.queues.len())
            .field("policy", &self.policy)
            .field("peak_retries", &self.peak_retries())
            .finish()
    }
}
