//! Worklists: the shared bag of pending items.
//!
//! The executor treats a worklist as a black box with three capabilities: a
//! per-worker handle for cheap push/pop, a thread-safe push usable from any
//! thread, and an optional emptiness hint consulted after global quiescence.
//! Pop is always non-blocking and may spuriously report empty; the executor
//! answers "nothing right now" by consulting the termination protocol.
//!
//! Two implementations are provided: [`ChunkedFifo`] (the default — items
//! travel in fixed-size chunks through per-worker deques with work
//! stealing) and [`GlobalFifo`] (a single shared MPMC queue).

use amorph_core::ids::WorkerId;
use crossbeam_deque::{Injector, Steal, Stealer, Worker};
use std::collections::VecDeque;
use std::fmt;
use std::mem;
use std::sync::Mutex;

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// A shared bag of pending work items.
///
/// Ownership of an item passes from pusher to popper. Implementations must
/// be unbounded (a bounded variant would surface rejected pushes as operator
/// failure).
pub trait Worklist<T: Send>: Send + Sync {
    /// The per-worker handle.
    type Handle<'w>: WorklistHandle<T>
    where
        Self: 'w;

    /// Hand out worker `tid`'s handle. Called once per worker per loop;
    /// seeding happens through the handle.
    fn register(&self, tid: WorkerId) -> Self::Handle<'_>;

    /// Push from any thread, including threads outside the pool. Used for
    /// the fast push-back path and by external producers.
    fn push_remote(&self, item: T);

    /// Emptiness hint consulted after global quiescence. The default claims
    /// empty, which makes the executor exit; implementations that can see
    /// their queues should override it.
    fn looks_empty(&self) -> bool {
        true
    }
}

/// A worker's private view of a [`Worklist`].
pub trait WorklistHandle<T> {
    /// Add one item.
    fn push(&mut self, item: T);

    /// Add many items; equivalent to a loop of [`push`](Self::push).
    fn push_batch<I: IntoIterator<Item = T>>(&mut self, items: I) {
        for item in items {
            self.push(item);
        }
    }

    /// Take one item, or `None` if nothing is visible right now. Never
    /// blocks; `None` may be spurious.
    fn pop(&mut self) -> Option<T>;
}

/// Deterministic xorshift32 step; cheap per-worker randomness for picking a
/// steal victim without a `rand` dependency.
fn xorshift32(state: &mut u32) -> u32 {
    let mut x = *state;
    x ^= x << 13;
    x ^= x >> 17;
    x ^= x << 5;
    *state = x;
    x
}

// ---------------------------------------------------------------------------
// ChunkedFifo
// ---------------------------------------------------------------------------

/// The default worklist: items grouped into chunks, chunks flowing through
/// per-worker FIFO deques with work stealing.
///
/// Each handle batches pushes into a chunk; full chunks land on the worker's
/// own deque where peers can steal them. Pop priority is: current chunk,
/// own deque, the shared injector, then a random-start scan over peer
/// stealers; as a last resort the handle drains its own partially-filled
/// outbound chunk so no item is stranded.
pub struct ChunkedFifo<T> {
    injector: Injector<Vec<T>>,
    stealers: Vec<Stealer<Vec<T>>>,
    /// Deques created up front, claimed by workers at registration.
    locals: Mutex<Vec<Option<Worker<Vec<T>>>>>,
    chunk_size: usize,
}

impl<T: Send> ChunkedFifo<T> {
    /// A worklist for `threads` workers with the default chunk size of 32.
    pub fn new(threads: usize) -> Self {
        Self::with_chunk_size(threads, amorph_core::options::DEFAULT_CHUNK_SIZE)
    }

    /// A worklist for `threads` workers with an explicit chunk size.
    ///
    /// # Panics
    /// Panics if `chunk_size` is 0.
    pub fn with_chunk_size(threads: usize, chunk_size: usize) -> Self {
        assert!(chunk_size > 0, "chunk_size must be > 0");
        let threads = threads.max(1);

        // Phase 1: create all deques and collect their stealers; workers
        // claim the deques at registration time.
        let mut locals = Vec::with_capacity(threads);
        let mut stealers = Vec::with_capacity(threads);
        for _ in 0..threads {
            let w = Worker::new_fifo();
            stealers.push(w.stealer());
            locals.push(Some(w));
        }

        Self {
            injector: Injector::new(),
            stealers,
            locals: Mutex::new(locals),
            chunk_size,
        }
    }

    /// The configured chunk size.
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }
}

impl<T: Send> Worklist<T> for ChunkedFifo<T> {
    type Handle<'w> = ChunkedHandle<'w, T> where Self: 'w;

    fn register(&self, tid: WorkerId) -> ChunkedHandle<'_, T> {
        let local = self.locals.lock().unwrap()[tid.index()]
            .take()
            // A second registration for the same slot gets a fresh detached
            // deque; its items are still drained by the owner or via spill.
            .unwrap_or_else(Worker::new_fifo);
        ChunkedHandle {
            owner: self,
            local,
            slot: tid.index(),
            chunk_in: VecDeque::new(),
            chunk_out: Vec::with_capacity(self.chunk_size),
            rng: (tid.index() as u32).wrapping_mul(2654435761).max(1),
        }
    }

    fn push_remote(&self, item: T) {
        self.injector.push(vec![item]);
    }

    fn looks_empty(&self) -> bool {
        self.injector.is_empty() && self.stealers.iter().all(|s| s.is_empty())
    }
}

impl<T> fmt::Debug for ChunkedFifo<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkedFifo")
            .field("workers", &self.stealers.len())
            .field("chunk_size", &self.chunk_size)
            .field("injector_empty", &self.injector.is_empty())
            .finish()
    }
}

/// Worker-side handle to a [`ChunkedFifo`].
pub struct ChunkedHandle<'w, T> {
    owner: &'w ChunkedFifo<T>,
    local: Worker<Vec<T>>,
    slot: usize,
    /// Chunk currently being consumed.
    chunk_in: VecDeque<T>,
    /// Chunk currently being filled.
    chunk_out: Vec<T>,
    rng: u32,
}

impl<T: Send> ChunkedHandle<'_, T> {
    /// Fetch the next chunk: own deque first, then the injector, then a
    /// random-start sweep over peer stealers.
    fn refill(&mut self) -> Option<Vec<T>> {
        if let Some(chunk) = self.local.pop() {
            return Some(chunk);
        }
        if let Steal::Success(chunk) = self.owner.injector.steal_batch_and_pop(&self.local) {
            return Some(chunk);
        }
        let n = self.owner.stealers.len();
        let start = xorshift32(&mut self.rng) as usize % n;
        for offset in 0..n {
            let peer = (start + offset) % n;
            if peer == self.slot {
                continue;
            }
            if let Steal::Success(chunk) =
                self.owner.stealers[peer].steal_batch_and_pop(&self.local)
            {
                return Some(chunk);
            }
            // Steal::Retry counts as a miss; a spurious empty pop is allowed.
        }
        None
    }
}

impl<T: Send> WorklistHandle<T> for ChunkedHandle<'_, T> {
    fn push(&mut self, item: T) {
        self.chunk_out.push(item);
        if self.chunk_out.len() == self.owner.chunk_size {
            let full = mem::replace(
                &mut self.chunk_out,
                Vec::with_capacity(self.owner.chunk_size),
            );
            self.local.push(full);
        }
    }

    fn pop(&mut self) -> Option<T> {
        loop {
            if let Some(item) = self.chunk_in.pop_front() {
                return Some(item);
            }
            if let Some(chunk) = self.refill() {
                self.chunk_in = VecDeque::from(chunk);
                continue;
            }
            // Nothing visible elsewhere: consume our own staged chunk so a
            // partially-filled buffer cannot strand items.
            if !self.chunk_out.is_empty() {
                self.chunk_in = VecDeque::from(mem::take(&mut self.chunk_out));
                continue;
            }
            return None;
        }
    }
}

impl<T> Drop for ChunkedHandle<'_, T> {
    fn drop(&mut self) {
        // Make leftovers visible to anyone still popping (break discards
        // items by dropping the whole worklist, not the handle alone).
        let staged = mem::take(&mut self.chunk_out);
        if !staged.is_empty() {
            self.owner.injector.push(staged);
        }
        let consuming: Vec<T> = mem::take(&mut self.chunk_in).into();
        if !consuming.is_empty() {
            self.owner.injector.push(consuming);
        }
    }
}

// ---------------------------------------------------------------------------
// GlobalFifo
// ---------------------------------------------------------------------------

/// A single shared MPMC FIFO. Simpler than [`ChunkedFifo`] and strictly
/// first-in-first-out across the whole pool, at the cost of contention on
/// one queue.
pub struct GlobalFifo<T> {
    tx: crossbeam_channel::Sender<T>,
    rx: crossbeam_channel::Receiver<T>,
}

impl<T: Send> GlobalFifo<T> {
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self { tx, rx }
    }
}

impl<T: Send> Default for GlobalFifo<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send> Worklist<T> for GlobalFifo<T> {
    type Handle<'w> = GlobalHandle<T> where Self: 'w;

    fn register(&self, _tid: WorkerId) -> GlobalHandle<T> {
        GlobalHandle {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
        }
    }

    fn push_remote(&self, item: T) {
        let _ = self.tx.send(item);
    }

    fn looks_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

impl<T> fmt::Debug for GlobalFifo<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GlobalFifo")
            .field("len", &self.rx.len())
            .finish()
    }
}

/// Worker-side handle to a [`GlobalFifo`].
pub struct GlobalHandle<T> {
    tx: crossbeam_channel::Sender<T>,
    rx: crossbeam_channel::Receiver<T>,
}

impl<T: Send> WorklistHandle<T> for GlobalHandle<T> {
    fn push(&mut self, item: T) {
        let _ = self.tx.send(item);
    }

    fn pop(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}
