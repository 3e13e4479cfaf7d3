//! The per-iteration surface handed to the operator.
//!
//! An [`IterationScope`] is built once per worker and conceptually renewed
//! every iteration: staged pushes are flushed on commit and discarded on
//! abort, and the arena is rewound either way. The operator sees only this
//! scope plus the item; everything else belongs to the executor.

use crate::arena::IterationArena;
use crate::conflict::{Abort, ConflictContext, Guarded};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Thread-safe sink used when pushes may bypass the staging buffer.
pub(crate) type FastPush<T> = Box<dyn Fn(T) + Send + Sync>;

/// Scratch surface for one iteration: push staging, arena, break flag, and
/// the worker's conflict context.
pub struct IterationScope<T> {
    ctx: Option<Arc<ConflictContext>>,
    break_flag: Option<Arc<AtomicBool>>,
    /// When aborts are impossible, pushes spill straight into the worklist.
    fast: Option<FastPush<T>>,
    buf: Vec<T>,
    arena: IterationArena,
    /// Items forwarded through the fast path (already counted as pushed).
    fast_pushes: u64,
}

impl<T> IterationScope<T> {
    pub(crate) fn new(
        ctx: Option<Arc<ConflictContext>>,
        break_flag: Option<Arc<AtomicBool>>,
        fast: Option<FastPush<T>>,
    ) -> Self {
        Self {
            ctx,
            break_flag,
            fast,
            buf: Vec::new(),
            arena: IterationArena::new(),
            fast_pushes: 0,
        }
    }

    /// A detached scope with no executor wiring. Useful for exercising an
    /// operator outside a parallel loop.
    pub fn detached() -> Self {
        Self::new(None, None, None)
    }

    // -- operator API ------------------------------------------------------

    /// Stage a new work item.
    ///
    /// Staged items enter the worklist when the iteration commits and are
    /// discarded if it aborts. When the loop runs without speculation the
    /// item is forwarded to the worklist immediately instead.
    pub fn push(&mut self, item: T) {
        match &self.fast {
            Some(spill) => {
                spill(item);
                self.fast_pushes += 1;
            }
            None => self.buf.push(item),
        }
    }

    /// Stage several items at once.
    pub fn push_all(&mut self, items: impl IntoIterator<Item = T>) {
        for item in items {
            self.push(item);
        }
    }

    /// Request an orderly shutdown of the loop.
    ///
    /// Every worker observes the flag at its next check; remaining items are
    /// discarded. Requires the break option — without it this is a no-op.
    pub fn stop(&self) {
        if let Some(flag) = &self.break_flag {
            flag.store(true, Ordering::Release);
        }
    }

    /// The worker's conflict context, present when speculation is enabled.
    pub fn ctx(&self) -> Option<&ConflictContext> {
        self.ctx.as_deref()
    }

    /// Run `f` with exclusive access to `guarded`, acquiring its lock for
    /// this iteration.
    ///
    /// Fails with [`Abort::Conflict`] on a collision, or with
    /// [`Abort::Fault`] if the loop was configured without speculation.
    pub fn exclusive<U, R>(
        &self,
        guarded: &Guarded<U>,
        f: impl FnOnce(&mut U) -> R,
    ) -> Result<R, Abort> {
        match self.ctx() {
            Some(ctx) => guarded.with_mut(ctx, f).map_err(Abort::from),
            None => Err(Abort::Fault(
                "exclusive access requires a loop with aborts enabled".into(),
            )),
        }
    }

    /// The per-iteration arena.
    pub fn arena(&mut self) -> &mut IterationArena {
        &mut self.arena
    }

    // -- executor API ------------------------------------------------------

    /// Number of currently staged (buffered) items.
    pub(crate) fn staged(&self) -> usize {
        self.buf.len()
    }

    /// Drain the staged items for the commit flush.
    pub(crate) fn drain_staged(&mut self) -> std::vec::Drain<'_, T> {
        self.buf.drain(..)
    }

    /// Discard staged items after an abort; optionally rewind the arena.
    pub(crate) fn discard(&mut self, reset_arena: bool) {
        self.buf.clear();
        if reset_arena {
            self.arena.reset();
        }
    }

    /// Rewind the arena after a commit.
    pub(crate) fn reset_arena(&mut self) {
        self.arena.reset();
    }

    /// Items forwarded through the fast path so far.
    pub(crate) fn fast_pushes(&self) -> u64 {
        self.fast_pushes
    }
}

impl<T> fmt::Debug for IterationScope<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IterationScope")
            .field("staged", &self.buf.len())
            .field("fast_pushes", &self.fast_pushes)
            .field("speculative", &self.ctx.is_some())
            .field("breakable", &self.break_flag.is_some())
            .finish()
    }
}
