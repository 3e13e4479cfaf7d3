//! Conflict detection for speculative iterations.
//!
//! Every worker owns a [`ConflictContext`] for the lifetime of a loop. While
//! an iteration is in flight the context records the logical locks the
//! operator acquires; two contexts can never own the same lock at once. The
//! loser of a collision receives [`Conflict`], unwinds out of the operator
//! via `?`, and the executor cancels its iteration and re-enqueues the item.
//!
//! # Invariants
//!
//! 1. Between `start_iteration` and `commit_iteration` / `cancel_iteration`
//!    at most one iteration is in flight per context.
//! 2. Commit and cancel both release every acquisition made during the
//!    iteration; cancel additionally clears the external abort mark so the
//!    context can be re-entered safely.
//! 3. Lock ownership is a single CAS word, so two contexts observing
//!    ownership of the same lock is impossible by construction.

use amorph_core::ids::WorkerId;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Owner word value meaning "unlocked".
const FREE: usize = 0;

/// Context state: no iteration in flight.
const IDLE: u8 = 0;
/// Context state: an iteration is executing.
const INSIDE: u8 = 1;

// ---------------------------------------------------------------------------
// Abort signals
// ---------------------------------------------------------------------------

/// A logical-lock collision with another in-flight iteration.
///
/// In-band and expected: the executor recovers by aborting and retrying the
/// iteration. Never surfaced to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Conflict;

impl fmt::Display for Conflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("conflict with a concurrent iteration")
    }
}

impl std::error::Error for Conflict {}

/// Why an iteration did not commit.
///
/// Operators return this from their body; `?` on a failed acquisition
/// produces [`Abort::Conflict`] automatically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Abort {
    /// Collision with a concurrent iteration; the item will be retried.
    Conflict,
    /// Operator failure unrelated to speculation. The first fault shuts the
    /// loop down and is re-raised from the top-level call.
    Fault(String),
}

impl From<Conflict> for Abort {
    fn from(_: Conflict) -> Self {
        Abort::Conflict
    }
}

impl fmt::Display for Abort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Abort::Conflict => f.write_str("conflict with a concurrent iteration"),
            Abort::Fault(msg) => write!(f, "operator fault: {}", msg),
        }
    }
}

impl std::error::Error for Abort {}

// ---------------------------------------------------------------------------
// LogicalLock
// ---------------------------------------------------------------------------

/// A logical lock: one atomic owner word shared by all clones.
///
/// Cloning a `LogicalLock` produces another handle to the *same* lock, so a
/// lock can be embedded in shared data structures and recorded by the owning
/// context at the same time.
#[derive(Clone)]
pub struct LogicalLock {
    owner: Arc<AtomicUsize>,
}

impl LogicalLock {
    /// A fresh, unowned lock.
    pub fn new() -> Self {
        Self {
            owner: Arc::new(AtomicUsize::new(FREE)),
        }
    }

    /// Whether any context currently owns this lock.
    pub fn is_held(&self) -> bool {
        self.owner.load(Ordering::Acquire) != FREE
    }

    fn try_own(&self, tag: usize) -> Result<bool, Conflict> {
        match self
            .owner
            .compare_exchange(FREE, tag, Ordering::Acquire, Ordering::Relaxed)
        {
            // Newly acquired.
            Ok(_) => Ok(true),
            // Already ours from earlier in this iteration.
            Err(cur) if cur == tag => Ok(false),
            Err(_) => Err(Conflict),
        }
    }

    fn release(&self, tag: usize) {
        // Only the owner releases; a plain store suffices.
        if self.owner.load(Ordering::Relaxed) == tag {
            self.owner.store(FREE, Ordering::Release);
        }
    }
}

impl Default for LogicalLock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for LogicalLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogicalLock")
            .field("held", &self.is_held())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// ConflictContext
// ---------------------------------------------------------------------------

/// Per-worker transactional scope for one iteration at a time.
pub struct ConflictContext {
    /// Owner tag written into lock words: worker index + 1 (0 means free).
    tag: usize,
    state: AtomicU8,
    held: Mutex<Vec<LogicalLock>>,
    /// Set by another thread to doom the current iteration; checked on every
    /// acquisition, cleared on cancel.
    doomed: AtomicBool,
}

impl ConflictContext {
    /// A context for the given worker.
    pub fn new(worker: WorkerId) -> Self {
        Self {
            tag: worker.index() + 1,
            state: AtomicU8::new(IDLE),
            held: Mutex::new(Vec::new()),
            doomed: AtomicBool::new(false),
        }
    }

    /// The worker this context belongs to.
    pub fn worker(&self) -> WorkerId {
        WorkerId::new(self.tag - 1)
    }

    /// Whether an iteration is currently in flight.
    pub fn in_iteration(&self) -> bool {
        self.state.load(Ordering::Acquire) == INSIDE
    }

    /// Enter a new iteration. Fails if one is already in flight.
    pub fn start_iteration(&self) -> Result<(), Abort> {
        self.state
            .compare_exchange(IDLE, INSIDE, Ordering::Acquire, Ordering::Relaxed)
            .map_err(|_| Abort::Fault("iteration already in progress on this worker".into()))?;
        Ok(())
    }

    /// Commit the current iteration: release every acquisition, then idle.
    ///
    /// All logical locks held for the iteration are released before this
    /// returns.
    pub fn commit_iteration(&self) -> Result<(), Abort> {
        if self.state.load(Ordering::Acquire) != INSIDE {
            return Err(Abort::Fault("commit outside an iteration".into()));
        }
        self.release_all();
        self.state.store(IDLE, Ordering::Release);
        Ok(())
    }

    /// Abandon the current iteration: release every acquisition, clear the
    /// external abort mark, then idle. Safe to call in any state.
    pub fn cancel_iteration(&self) {
        self.release_all();
        self.doomed.store(false, Ordering::Release);
        self.state.store(IDLE, Ordering::Release);
    }

    /// Record ownership of `lock` for the current iteration.
    ///
    /// Fails with [`Conflict`] if another context owns the lock, or if this
    /// context has been marked for abort. Re-acquiring an already-owned lock
    /// is an idempotent success.
    pub fn acquire(&self, lock: &LogicalLock) -> Result<(), Conflict> {
        if self.doomed.load(Ordering::Acquire) {
            return Err(Conflict);
        }
        if lock.try_own(self.tag)? {
            self.held.lock().unwrap().push(lock.clone());
        }
        Ok(())
    }

    /// Doom the iteration currently running in this context: its next
    /// acquisition fails with [`Conflict`]. Cleared by `cancel_iteration`.
    pub fn mark_for_abort(&self) {
        self.doomed.store(true, Ordering::Release);
    }

    /// Whether this context currently owns `lock`. Intended for assertions.
    pub fn holds(&self, lock: &LogicalLock) -> bool {
        lock.owner.load(Ordering::Acquire) == self.tag
    }

    fn release_all(&self) {
        let mut held = self.held.lock().unwrap();
        // Release in acquisition order.
        for lock in held.drain(..) {
            lock.release(self.tag);
        }
    }
}

impl fmt::Debug for ConflictContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConflictContext")
            .field("worker", &self.worker())
            .field("in_iteration", &self.in_iteration())
            .field("held", &self.held.lock().unwrap().len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Guarded
// ---------------------------------------------------------------------------

/// A value protected by a [`LogicalLock`].
///
/// Access goes through [`with_mut`](Guarded::with_mut), which acquires the
/// lock for the calling context first; exclusive access then lasts until the
/// iteration commits or aborts. Do not call `with_mut` on the same `Guarded`
/// reentrantly from inside the closure.
pub struct Guarded<T> {
    lock: LogicalLock,
    cell: std::cell::UnsafeCell<T>,
}

// The lock protocol guarantees a single owning context, and the owning
// context stays on one thread for the whole iteration.
unsafe impl<T: Send> Sync for Guarded<T> {}
unsafe impl<T: Send> Send for Guarded<T> {}

impl<T> Guarded<T> {
    /// Wrap a value.
    pub fn new(value: T) -> Self {
        Self {
            lock: LogicalLock::new(),
            cell: std::cell::UnsafeCell::new(value),
        }
    }

    /// The underlying logical lock.
    pub fn lock(&self) -> &LogicalLock {
        &self.lock
    }

    /// Acquire the lock for `ctx` and run `f` with exclusive access.
    pub fn with_mut<R>(
        &self,
        ctx: &ConflictContext,
        f: impl FnOnce(&mut T) -> R,
    ) -> Result<R, Conflict> {
        ctx.acquire(&self.lock)?;
        // SAFETY: ctx owns the lock until commit/cancel, so no other thread
        // can reach the cell through this protocol.
        Ok(f(unsafe { &mut *self.cell.get() }))
    }

    /// Consume the wrapper and return the value.
    pub fn into_inner(self) -> T {
        self.cell.into_inner()
    }
}

impl<T: fmt::Debug> fmt::Debug for Guarded<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Guarded")
            .field("held", &self.lock.is_held())
            .finish_non_exhaustive()
    }
}
