//! Amorph runtime — a worklist-driven speculative executor for irregular
//! data-parallel workloads.
//!
//! Worker threads pull items from a shared worklist and apply a user
//! operator to each one inside a conflict-detecting iteration. Collisions on
//! logical locks abort the losing iteration and re-enqueue its item under a
//! package-aware escalation policy; global quiescence is detected through a
//! barrier-coupled termination protocol. Operators can push new work, use a
//! per-iteration arena, and break out of the loop early.
//!
//! ```no_run
//! use amorph_rt::{LoopOptions, Runtime};
//!
//! let rt = Runtime::new(4);
//! let report = rt
//!     .for_each(
//!         0..1000u64,
//!         |item: &u64, _scope: &mut amorph_rt::IterationScope<u64>|
//!             -> Result<(), amorph_rt::Abort> {
//!             let _ = item;
//!             Ok(())
//!         },
//!         LoopOptions::new().name("example"),
//!     )
//!     .unwrap();
//! assert_eq!(report.commits(), 1000);
//! ```
#![warn(clippy::all)]

pub mod aborts;
pub mod arena;
pub mod conflict;
pub mod error;
pub mod executor;
pub mod pool;
pub mod runtime;
pub mod scope;
pub mod stats;
pub mod termination;
pub mod worklist;

pub use aborts::{AbortHandler, Aborted};
pub use arena::IterationArena;
pub use conflict::{Abort, Conflict, ConflictContext, Guarded, LogicalLock};
pub use error::LoopError;
pub use executor::Operator;
pub use pool::{ThreadPool, WorkerCtx};
pub use runtime::{default_runtime, for_each, on_each, Runtime};
pub use scope::IterationScope;
pub use stats::{Counters, StatsSink};
pub use termination::{QuietFlags, TerminationDetector};
pub use worklist::{ChunkedFifo, GlobalFifo, Worklist, WorklistHandle};

// Re-export the core vocabulary so callers rarely need amorph-core directly.
pub use amorph_core::{
    ConfigError, EscalationPolicy, LoopOptions, LoopReport, PackageId, Topology, WorkerId,
};
