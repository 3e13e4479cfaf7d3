//! The fixed worker-thread pool.
//!
//! A [`ThreadPool`] launches one named OS thread per pool slot at
//! construction; the threads park on per-worker job mailboxes until a job is
//! broadcast. A job runs exactly once on every worker (this is what `on_each`
//! exposes directly, and what the for-each executor builds its worker loops
//! on). Workers share a reusable barrier sized to the pool, reachable from
//! the [`WorkerCtx`] every job receives.
//!
//! Panics inside a job are caught at the worker boundary so the pool itself
//! survives; the first panic message is handed back to the caller of
//! [`run`](ThreadPool::run).

use amorph_core::ids::WorkerId;
use amorph_core::topology::Topology;
use crossbeam_channel::{Receiver, Sender};
use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;

/// A job broadcast to every worker.
pub type Job = Arc<dyn Fn(&WorkerCtx) + Send + Sync>;

enum Command {
    Run(Job),
    Exit,
}

/// Extract a readable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "opaque panic payload".to_string()
    }
}

// ---------------------------------------------------------------------------
// WorkerCtx
// ---------------------------------------------------------------------------

/// What a job knows about the worker it is running on.
pub struct WorkerCtx {
    worker: WorkerId,
    topology: Topology,
    barrier: Arc<Barrier>,
}

impl WorkerCtx {
    /// This worker's pool index.
    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    /// Number of workers in the pool.
    pub fn threads(&self) -> usize {
        self.topology.threads()
    }

    /// The pool's package topology.
    pub fn topology(&self) -> Topology {
        self.topology
    }

    /// Rendezvous with every other worker of the pool.
    ///
    /// All workers must reach the barrier; a job that calls this on some
    /// workers but not others deadlocks the pool.
    pub fn barrier_wait(&self) {
        self.barrier.wait();
    }
}

impl fmt::Debug for WorkerCtx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerCtx")
            .field("worker", &self.worker)
            .field("threads", &self.topology.threads())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// ThreadPool
// ---------------------------------------------------------------------------

/// A fixed pool of worker threads with broadcast-style job dispatch.
pub struct ThreadPool {
    mailboxes: Vec<Sender<Command>>,
    done_rx: Receiver<WorkerId>,
    joins: Vec<Option<thread::JoinHandle<()>>>,
    topology: Topology,
    /// First panic captured since the last `run` call.
    panic_slot: Arc<Mutex<Option<String>>>,
    /// Serializes `run` calls; jobs from two caller threads must not
    /// interleave on the mailboxes.
    dispatch_gate: Mutex<()>,
    down: bool,
}

impl ThreadPool {
    /// A pool of `threads` workers in a single package. Passing 0 uses the
    /// number of available CPUs.
    pub fn new(threads: usize) -> Self {
        let threads = if threads == 0 {
            num_cpus::get().max(1)
        } else {
            threads
        };
        Self::with_topology(Topology::flat(threads))
    }

    /// A pool shaped by an explicit topology.
    pub fn with_topology(topology: Topology) -> Self {
        let threads = topology.threads();
        let barrier = Arc::new(Barrier::new(threads));
        let (done_tx, done_rx) = crossbeam_channel::unbounded();
        let panic_slot = Arc::new(Mutex::new(None));

        let mut mailboxes = Vec::with_capacity(threads);
        let mut joins = Vec::with_capacity(threads);

        for idx in 0..threads {
            let (tx, rx) = crossbeam_channel::unbounded::<Command>();
            let ctx = WorkerCtx {
                worker: WorkerId::new(idx),
                topology,
                barrier: Arc::clone(&barrier),
            };
            let done = done_tx.clone();
            let panics = Arc::clone(&panic_slot);

            let jh = thread::Builder::new()
                .name(format!("amorph-worker-{}", idx))
                .spawn(move || Self::worker_loop(ctx, rx, done, panics))
                .expect("failed to spawn worker thread");

            mailboxes.push(tx);
            joins.push(Some(jh));
        }

        Self {
            mailboxes,
            done_rx,
            joins,
            topology,
            panic_slot,
            dispatch_gate: Mutex::new(()),
            down: false,
        }
    }

    /// Number of worker threads.
    pub fn threads(&self) -> usize {
        self.topology.threads()
    }

    /// The pool's topology.
    pub fn topology(&self) -> Topology {
        self.topology
    }

    /// Run `job` once on every worker and wait for all of them to finish.
    ///
    /// Returns the first panic message raised inside the job, if any.
    pub fn run(&self, job: Job) -> Option<String> {
        let _gate = self.dispatch_gate.lock().unwrap();
        for tx in &self.mailboxes {
            let _ = tx.send(Command::Run(Arc::clone(&job)));
        }
        for _ in 0..self.mailboxes.len() {
            let _ = self.done_rx.recv();
        }
        self.panic_slot.lock().unwrap().take()
    }

    /// Ask every worker to exit and join the threads. Idempotent.
    pub fn shutdown(&mut self) {
        if self.down {
            return;
        }
        self.down = true;
        for tx in &self.mailboxes {
            let _ = tx.send(Command::Exit);
        }
        for jh in &mut self.joins {
            if let Some(jh) = jh.take() {
                let _ = jh.join();
            }
        }
    }

    /// Whether the pool has been shut down.
    pub fn is_shutdown(&self) -> bool {
        self.down
    }

    fn worker_loop(
        ctx: WorkerCtx,
        rx: Receiver<Command>,
        done: Sender<WorkerId>,
        panics: Arc<Mutex<Option<String>>>,
    ) {
        loop {
            match rx.recv() {
                Ok(Command::Run(job)) => {
                    if let Err(payload) = catch_unwind(AssertUnwindSafe(|| job(&ctx))) {
                        let mut slot = panics.lock().unwrap();
                        if slot.is_none() {
                            *slot = Some(panic_message(payload.as_ref()));
                        }
                    }
                    let _ = done.send(ctx.worker);
                }
                Ok(Command::Exit) | Err(_) => return,
            }
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        if !self.down {
            self.shutdown();
        }
    }
}

impl fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadPool")
            .field("threads", &self.threads())
            .field("packages", &self.topology.packages())
            .field("shutdown", &self.down)
            .finish()
    }
}
