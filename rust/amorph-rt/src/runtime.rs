//! The runtime façade: a worker pool plus a statistics sink.
//!
//! A [`Runtime`] owns everything a parallel region needs — the thread pool,
//! its package topology, and the sink where finished-loop reports accumulate.
//! Construct one explicitly, or use the process-wide default behind the free
//! [`for_each`] / [`on_each`] functions.

use crate::error::LoopError;
use crate::executor::{self, Operator};
use crate::pool::ThreadPool;
use crate::stats::StatsSink;
use crate::worklist::{ChunkedFifo, Worklist};
use amorph_core::ids::WorkerId;
use amorph_core::options::LoopOptions;
use amorph_core::report::LoopReport;
use amorph_core::topology::Topology;
use once_cell::sync::Lazy;
use std::fmt;

/// A worker pool with an attached statistics sink.
pub struct Runtime {
    pool: ThreadPool,
    sink: StatsSink,
}

impl Runtime {
    /// A runtime with `threads` workers in a single package. Passing 0 uses
    /// the number of available CPUs.
    pub fn new(threads: usize) -> Self {
        Self {
            pool: ThreadPool::new(threads),
            sink: StatsSink::new(),
        }
    }

    /// A runtime shaped by an explicit package topology.
    pub fn with_topology(topology: Topology) -> Self {
        Self {
            pool: ThreadPool::with_topology(topology),
            sink: StatsSink::new(),
        }
    }

    /// Number of worker threads.
    pub fn threads(&self) -> usize {
        self.pool.threads()
    }

    /// The pool's package topology.
    pub fn topology(&self) -> Topology {
        self.pool.topology()
    }

    /// The sink collecting finished-loop reports.
    pub fn sink(&self) -> &StatsSink {
        &self.sink
    }

    /// Apply `operator` to every item of `range` in parallel, using the
    /// default chunked-FIFO worklist sized by `options.chunk_size`.
    ///
    /// Returns the merged loop report on success. On an operator fault (an
    /// `Err(Abort::Fault)` or a panic, which is caught at the operator
    /// boundary) the loop shuts down break-style, the report is still
    /// recorded in the sink, and the first failure is returned as
    /// [`LoopError::Operator`].
    ///
    /// Reentrant parallel regions are not supported: calling `for_each`
    /// from inside an operator deadlocks the pool.
    pub fn for_each<T, O>(
        &self,
        range: impl IntoIterator<Item = T>,
        operator: O,
        options: LoopOptions,
    ) -> Result<LoopReport, LoopError>
    where
        T: Send + 'static,
        O: Operator<T> + 'static,
    {
        options.validate()?;
        let wl = ChunkedFifo::with_chunk_size(self.threads(), options.chunk_size);
        self.for_each_in(wl, range, operator, options)
    }

    /// [`for_each`](Self::for_each) with a caller-supplied worklist.
    ///
    /// The worklist must be freshly built for this loop (its per-worker
    /// slots are claimed once) and sized to this runtime's thread count.
    pub fn for_each_in<T, O, W>(
        &self,
        worklist: W,
        range: impl IntoIterator<Item = T>,
        operator: O,
        options: LoopOptions,
    ) -> Result<LoopReport, LoopError>
    where
        T: Send + 'static,
        O: Operator<T> + 'static,
        W: Worklist<T> + 'static,
    {
        let items: Vec<T> = range.into_iter().collect();
        executor::run_loop(&self.pool, &self.sink, worklist, items, operator, options)
    }

    /// Run `f` exactly once on every worker; used to set up or tear down
    /// per-worker state outside a speculative loop.
    pub fn on_each<F>(&self, f: F) -> Result<(), LoopError>
    where
        F: Fn(WorkerId, usize) + Send + Sync + 'static,
    {
        executor::run_on_each(&self.pool, f)
    }

    /// Join the worker threads. Idempotent; also runs on drop.
    pub fn shutdown(&mut self) {
        self.pool.shutdown();
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("threads", &self.threads())
            .field("packages", &self.topology().packages())
            .field("loops_recorded", &self.sink.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Process-wide default
// ---------------------------------------------------------------------------

static DEFAULT: Lazy<Runtime> = Lazy::new(|| Runtime::new(0));

/// The lazily-created process-wide runtime (one worker per available CPU).
pub fn default_runtime() -> &'static Runtime {
    &DEFAULT
}

/// [`Runtime::for_each`] on the process-wide default runtime.
pub fn for_each<T, O>(
    range: impl IntoIterator<Item = T>,
    operator: O,
    options: LoopOptions,
) -> Result<LoopReport, LoopError>
where
    T: Send + 'static,
    O: Operator<T> + 'static,
{
    default_runtime().for_each(range, operator, options)
}

/// [`Runtime::on_each`] on the process-wide default runtime.
pub fn on_each<F>(f: F) -> Result<(), LoopError>
where
    F: Fn(WorkerId, usize) + Send + Sync + 'static,
{
    default_runtime().on_each(f)
}
