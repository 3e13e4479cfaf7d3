//! The speculative for-each executor.
//!
//! Each worker runs the same loop: pop items, apply the operator inside a
//! conflict-detecting iteration, commit or abort, drain its own retry queue,
//! and report activity to the termination detector. When the whole pool goes
//! quiet the workers run a barrier-coupled consensus round — either someone
//! still sees work (worklist hint or a non-empty retry queue) and everyone
//! re-arms for another round, or everyone exits together. A worker that runs
//! out of work early therefore never abandons the group.
//!
//! # Commit and abort
//!
//! Commit order is fixed: staged pushes are flushed to the worklist (and
//! counted) *before* any logical lock is released; the flushed state is not
//! revertible. On abort the staged pushes are discarded, the context rolls
//! back its acquisitions, and the item is re-enqueued through the abort
//! handler with an escalated retry count.
//!
//! # Faults
//!
//! The first operator fault (an `Err(Abort::Fault)` or a panic caught at the
//! operator boundary) halts the loop break-style; counters are still merged
//! and reported, then the fault is re-raised from the top-level call.

use crate::aborts::{Aborted, AbortHandler};
use crate::conflict::{Abort, ConflictContext};
use crate::error::LoopError;
use crate::pool::{panic_message, Job, ThreadPool, WorkerCtx};
use crate::scope::{FastPush, IterationScope};
use crate::stats::{Counters, StatsSink};
use crate::termination::{QuietFlags, TerminationDetector};
use crate::worklist::{Worklist, WorklistHandle};
use amorph_core::escalation;
use amorph_core::ids::WorkerId;
use amorph_core::options::LoopOptions;
use amorph_core::range;
use amorph_core::report::LoopReport;
use crossbeam_channel::{Receiver, Sender};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Pop budget per inner round for the leading worker when break is enabled,
/// so the break flag is observed promptly. Other workers (and loops without
/// break) drain without a budget.
const LEADER_BREAK_LIMIT: usize = 64;

// ---------------------------------------------------------------------------
// Operator
// ---------------------------------------------------------------------------

/// A loop body applied to one item at a time.
///
/// Items arrive by shared reference so an aborted iteration can be retried
/// with the unchanged item. Mutation of shared state goes through
/// [`Guarded`](crate::conflict::Guarded) values, acquired via the scope's
/// context; a failed acquisition propagates with `?` as
/// [`Abort::Conflict`] and the executor retries the item elsewhere.
pub trait Operator<T>: Send + Sync {
    fn each(&self, item: &T, scope: &mut IterationScope<T>) -> Result<(), Abort>;
}

impl<T, F> Operator<T> for F
where
    F: Fn(&T, &mut IterationScope<T>) -> Result<(), Abort> + Send + Sync,
{
    fn each(&self, item: &T, scope: &mut IterationScope<T>) -> Result<(), Abort> {
        self(item, scope)
    }
}

// ---------------------------------------------------------------------------
// Region state
// ---------------------------------------------------------------------------

/// Feature selection for one loop, resolved once before the workers start.
#[derive(Debug, Clone, Copy)]
struct Flags {
    needs_aborts: bool,
    /// Speculation can actually fail: aborts enabled and more than one
    /// worker. With a single worker the conflict branch is unreachable.
    could_abort: bool,
    needs_push: bool,
    needs_arena: bool,
    needs_break: bool,
}

/// Everything the workers of one parallel region share.
struct Region<T, O, W> {
    op: O,
    wl: W,
    flags: Flags,
    term: QuietFlags,
    handler: AbortHandler<T>,
    /// Per-worker retry-queue receivers, claimed at loop start.
    abort_rxs: Mutex<Vec<Option<Receiver<Aborted<T>>>>>,
    /// Per-worker seed blocks, claimed at loop start.
    seeds: Mutex<Vec<Option<Vec<T>>>>,
    /// The break flag operators can set through their scope.
    broke: Arc<AtomicBool>,
    /// Set on the first fault; halts the loop break-style.
    halted: AtomicBool,
    /// Round-consensus flag: "someone still sees work".
    again: AtomicBool,
    fault: Mutex<Option<String>>,
    results: Sender<(WorkerId, Counters)>,
}

impl<T, O, W> Region<T, O, W> {
    fn stop_requested(&self) -> bool {
        self.halted.load(Ordering::Acquire) || self.broke.load(Ordering::Acquire)
    }

    fn record_fault(&self, message: String) {
        let mut slot = self.fault.lock().unwrap();
        if slot.is_none() {
            *slot = Some(message);
        }
        drop(slot);
        self.halted.store(true, Ordering::Release);
    }
}

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

/// Run `op` over `items` on `pool`, seeding `wl` and reporting to `sink`.
pub(crate) fn run_loop<T, O, W>(
    pool: &ThreadPool,
    sink: &StatsSink,
    wl: W,
    items: Vec<T>,
    op: O,
    options: LoopOptions,
) -> Result<LoopReport, LoopError>
where
    T: Send + 'static,
    O: Operator<T> + 'static,
    W: Worklist<T> + 'static,
{
    options.validate()?;
    let topo = pool.topology();
    let threads = topo.threads();
    let flags = Flags {
        needs_aborts: options.needs_aborts,
        could_abort: options.needs_aborts && threads > 1,
        needs_push: options.needs_push,
        needs_arena: options.needs_arena,
        needs_break: options.needs_break,
    };
    let policy = options
        .escalation
        .unwrap_or_else(|| escalation::auto_policy(&topo));
    let (handler, abort_rxs) = AbortHandler::new(topo, policy);
    let (results_tx, results_rx) = crossbeam_channel::unbounded();

    let region = Arc::new(Region {
        op,
        wl,
        flags,
        term: QuietFlags::new(threads),
        handler,
        abort_rxs: Mutex::new(abort_rxs.into_iter().map(Some).collect()),
        seeds: Mutex::new(range::partition(items, threads).into_iter().map(Some).collect()),
        broke: Arc::new(AtomicBool::new(false)),
        halted: AtomicBool::new(false),
        again: AtomicBool::new(false),
        fault: Mutex::new(None),
        results: results_tx,
    });

    let job: Job = {
        let region = Arc::clone(&region);
        Arc::new(move |ctx: &WorkerCtx| worker_body(&region, ctx))
    };
    let pool_panic = pool.run(job);

    // All workers have sent their counters by now.
    let mut totals = Counters::default();
    for (_, counters) in results_rx.try_iter() {
        totals.merge(counters);
    }

    let report = LoopReport {
        loopname: options.label().to_string(),
        threads,
        iterations: totals.iterations,
        conflicts: totals.conflicts,
        pushes: totals.pushes,
        broke: region.broke.load(Ordering::Acquire),
    };
    if options.needs_stats {
        sink.record(report.clone());
    }

    // Counters are reported first, then the stored failure is re-raised.
    let fault = region.fault.lock().unwrap().take().or(pool_panic);
    match fault {
        Some(message) => Err(LoopError::Operator {
            loopname: report.loopname,
            message,
        }),
        None => Ok(report),
    }
}

/// Run `f` exactly once per worker.
pub(crate) fn run_on_each<F>(pool: &ThreadPool, f: F) -> Result<(), LoopError>
where
    F: Fn(WorkerId, usize) + Send + Sync + 'static,
{
    let job: Job = Arc::new(move |ctx: &WorkerCtx| f(ctx.worker(), ctx.threads()));
    match pool.run(job) {
        Some(message) => Err(LoopError::Operator {
            loopname: "on_each".into(),
            message,
        }),
        None => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// Worker loop
// ---------------------------------------------------------------------------

fn worker_body<T, O, W>(region: &Arc<Region<T, O, W>>, ctx: &WorkerCtx)
where
    T: Send + 'static,
    O: Operator<T> + 'static,
    W: Worklist<T> + 'static,
{
    let tid = ctx.worker();
    let flags = region.flags;

    let mut handle = region.wl.register(tid);
    if let Some(seed) = region.seeds.lock().unwrap()[tid.index()].take() {
        handle.push_batch(seed);
    }
    let abort_rx = region.abort_rxs.lock().unwrap()[tid.index()].take();
    // Everyone is seeded before anyone starts stealing.
    ctx.barrier_wait();

    let cctx = flags
        .needs_aborts
        .then(|| Arc::new(ConflictContext::new(tid)));
    let break_flag = flags.needs_break.then(|| Arc::clone(&region.broke));
    let fast: Option<FastPush<T>> = (flags.needs_push && !flags.could_abort).then(|| {
        let shared = Arc::clone(region);
        Box::new(move |item: T| shared.wl.push_remote(item)) as FastPush<T>
    });
    let mut scope = IterationScope::new(cctx.clone(), break_flag, fast);
    let mut counters = Counters::default();

    let limit = if flags.needs_break && tid.index() == 0 {
        LEADER_BREAK_LIMIT
    } else {
        0
    };
    let mut seen_iterations = 0u64;

    loop {
        // Inner loop: process until the pool looks quiescent or a stop is
        // requested.
        loop {
            run_queue(
                region,
                tid,
                &mut handle,
                None,
                cctx.as_deref(),
                &mut scope,
                &mut counters,
                limit,
            );
            if flags.could_abort {
                if let Some(rx) = &abort_rx {
                    run_queue(
                        region,
                        tid,
                        &mut handle,
                        Some(rx),
                        cctx.as_deref(),
                        &mut scope,
                        &mut counters,
                        0,
                    );
                }
            }

            let did_work = counters.iterations != seen_iterations;
            seen_iterations = counters.iterations;
            region.term.local_termination(tid, did_work);
            // Let termination state propagate before we look at it.
            std::hint::spin_loop();
            if region.term.global_termination() || region.stop_requested() {
                break;
            }
            if !did_work {
                std::thread::yield_now();
            }
        }

        // Consensus round. Both barriers are reached by every worker, and
        // the decision read between them is identical everywhere, so the
        // pool leaves (or repeats) the round in lockstep. A worker that ran
        // out of work early re-checks here instead of terminating alone.
        let stopping = region.stop_requested();
        let more_here = !stopping
            && (!region.wl.looks_empty()
                || abort_rx.as_ref().is_some_and(|rx| !rx.is_empty()));
        if more_here {
            region.again.store(true, Ordering::SeqCst);
        }
        ctx.barrier_wait();
        let continue_round = region.again.load(Ordering::SeqCst) && !region.stop_requested();
        ctx.barrier_wait();
        if tid.index() == 0 {
            region.again.store(false, Ordering::SeqCst);
        }
        if !continue_round {
            break;
        }
        region.term.rearm(tid);
    }

    counters.pushes += scope.fast_pushes();
    let _ = region.results.send((tid, counters));
}

/// Drain one source — the worklist handle, or this worker's retry queue —
/// processing up to `limit` items (0 = unbounded).
#[allow(clippy::too_many_arguments)]
fn run_queue<T, O, W, H>(
    region: &Region<T, O, W>,
    tid: WorkerId,
    handle: &mut H,
    retry_queue: Option<&Receiver<Aborted<T>>>,
    cctx: Option<&ConflictContext>,
    scope: &mut IterationScope<T>,
    counters: &mut Counters,
    limit: usize,
) where
    T: Send,
    O: Operator<T>,
    W: Worklist<T>,
    H: WorklistHandle<T>,
{
    let mut processed = 0usize;
    loop {
        if limit != 0 && processed == limit {
            return;
        }
        if region.stop_requested() {
            return;
        }
        // Retry-queue entries carry their escalation count; fresh items
        // start at zero.
        let next = match retry_queue {
            Some(rx) => rx.try_recv().ok().map(|a| (a.val, a.retries)),
            None => handle.pop().map(|item| (item, 0)),
        };
        let Some((item, retries)) = next else { return };
        processed += 1;
        process_item(region, tid, handle, cctx, scope, counters, item, retries);
    }
}

/// One iteration: start, apply the operator, then commit or abort.
#[allow(clippy::too_many_arguments)]
fn process_item<T, O, W, H>(
    region: &Region<T, O, W>,
    tid: WorkerId,
    handle: &mut H,
    cctx: Option<&ConflictContext>,
    scope: &mut IterationScope<T>,
    counters: &mut Counters,
    item: T,
    retries: u32,
) where
    T: Send,
    O: Operator<T>,
    W: Worklist<T>,
    H: WorklistHandle<T>,
{
    let flags = region.flags;
    if let Some(c) = cctx {
        if let Err(fault) = c.start_iteration() {
            region.record_fault(fault.to_string());
            return;
        }
    }
    counters.iterations += 1;

    let outcome = catch_unwind(AssertUnwindSafe(|| region.op.each(&item, scope)))
        .unwrap_or_else(|payload| Err(Abort::Fault(panic_message(payload.as_ref()))));

    match outcome {
        Ok(()) => {
            // Flush pushes before any lock is released; from here the
            // iteration counts as committed and is not revertible.
            if flags.needs_push {
                let staged = scope.staged();
                if staged > 0 {
                    counters.pushes += staged as u64;
                    handle.push_batch(scope.drain_staged());
                }
            }
            if flags.needs_arena {
                scope.reset_arena();
            }
            if let Some(c) = cctx {
                if let Err(fault) = c.commit_iteration() {
                    region.record_fault(fault.to_string());
                }
            }
        }
        Err(Abort::Conflict) if flags.could_abort => {
            if let Some(c) = cctx {
                c.cancel_iteration();
            }
            counters.conflicts += 1;
            region.handler.push(tid, item, retries);
            scope.discard(flags.needs_arena);
        }
        Err(Abort::Conflict) => {
            // No concurrent iteration exists that could collide; a conflict
            // here is an operator protocol violation.
            if let Some(c) = cctx {
                c.cancel_iteration();
            }
            scope.discard(flags.needs_arena);
            region.record_fault("conflict signalled while speculation is disabled".into());
        }
        Err(Abort::Fault(message)) => {
            if let Some(c) = cctx {
                c.cancel_iteration();
            }
            scope.discard(flags.needs_arena);
            region.record_fault(message);
        }
    }
}
