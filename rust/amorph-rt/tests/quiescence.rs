//! Termination behaviour: slow producers, uneven workers, and repeated
//! rounds must never end a loop while work is still reachable.

use amorph_rt::{Abort, GlobalFifo, IterationScope, LoopOptions, Runtime};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

type Scope<T> = IterationScope<T>;

#[test]
fn slow_producer_keeps_the_loop_alive() {
    // One seed item produces twenty more, sleeping between pushes. The
    // pushes spill straight into the worklist (fast path), so idle workers
    // see them trickle in; the loop must not terminate until the last one
    // is committed.
    let rt = Runtime::new(4);
    let committed = Arc::new(AtomicUsize::new(0));

    let c = Arc::clone(&committed);
    let report = rt
        .for_each(
            vec![0u64],
            move |item: &u64, scope: &mut Scope<u64>| -> Result<(), Abort> {
                if *item == 0 {
                    for child in 1..=20u64 {
                        std::thread::sleep(Duration::from_millis(2));
                        scope.push(child);
                    }
                } else {
                    c.fetch_add(1, Ordering::Relaxed);
                }
                Ok(())
            },
            LoopOptions::new()
                .name("slow-producer")
                .with_push()
                .no_aborts(),
        )
        .unwrap();

    assert_eq!(committed.load(Ordering::Relaxed), 20);
    assert_eq!(report.iterations, 21);
    assert_eq!(report.pushes, 20);
}

#[test]
fn slow_producer_with_buffered_pushes() {
    // The speculative variant of the same shape: pushes are buffered and
    // flushed on commit. Workers that went quiet must pick the late work up
    // in a fresh round instead of exiting.
    let rt = Runtime::new(4);
    let committed = Arc::new(AtomicUsize::new(0));

    let c = Arc::clone(&committed);
    let report = rt
        .for_each(
            vec![0u64],
            move |item: &u64, scope: &mut Scope<u64>| -> Result<(), Abort> {
                if *item == 0 {
                    std::thread::sleep(Duration::from_millis(40));
                    scope.push_all(1..=10u64);
                } else {
                    c.fetch_add(1, Ordering::Relaxed);
                }
                Ok(())
            },
            LoopOptions::new().name("late-flush").with_push(),
        )
        .unwrap();

    assert_eq!(committed.load(Ordering::Relaxed), 10);
    assert_eq!(report.iterations, 11);
}

#[test]
fn one_busy_worker_does_not_let_the_others_terminate() {
    // A single long-running iteration keeps the pool in its round; the
    // other workers must still be there to take the work it creates.
    let rt = Runtime::new(4);
    let tail_runs = Arc::new(AtomicUsize::new(0));

    let t = Arc::clone(&tail_runs);
    let report = rt
        .for_each(
            vec![0u64],
            move |item: &u64, scope: &mut Scope<u64>| -> Result<(), Abort> {
                if *item == 0 {
                    std::thread::sleep(Duration::from_millis(60));
                    scope.push_all(1..=50u64);
                } else {
                    t.fetch_add(1, Ordering::Relaxed);
                }
                Ok(())
            },
            LoopOptions::new().name("straggler").with_push().no_aborts(),
        )
        .unwrap();

    assert_eq!(tail_runs.load(Ordering::Relaxed), 50);
    assert_eq!(report.iterations, 51);
}

#[test]
fn deep_chains_survive_many_rounds() {
    // A chain of single pushes forces round after round of the termination
    // protocol with at most one item live at a time.
    let rt = Runtime::new(3);
    let report = rt
        .for_each(
            vec![200u64],
            |item: &u64, scope: &mut Scope<u64>| -> Result<(), Abort> {
                if *item > 0 {
                    scope.push(*item - 1);
                }
                Ok(())
            },
            LoopOptions::new().name("chain").with_push(),
        )
        .unwrap();
    assert_eq!(report.iterations, 201);
    assert_eq!(report.pushes, 200);
}

#[test]
fn global_fifo_worklist_terminates_too() {
    let rt = Runtime::new(4);
    let seen = Arc::new(AtomicUsize::new(0));

    let s = Arc::clone(&seen);
    let report = rt
        .for_each_in(
            GlobalFifo::new(),
            0..300u64,
            move |_item: &u64, _scope: &mut Scope<u64>| -> Result<(), Abort> {
                s.fetch_add(1, Ordering::Relaxed);
                Ok(())
            },
            LoopOptions::new().name("global-fifo"),
        )
        .unwrap();

    assert_eq!(seen.load(Ordering::Relaxed), 300);
    assert_eq!(report.iterations, 300);
}

#[test]
fn on_each_runs_between_loops() {
    // on_each is the non-speculative sibling: per-worker setup, a loop,
    // per-worker teardown, all on the same pool.
    let rt = Runtime::new(3);
    let setup = Arc::new(Mutex::new(Vec::new()));

    let s = Arc::clone(&setup);
    rt.on_each(move |worker, threads| {
        s.lock().unwrap().push((worker.index(), threads));
    })
    .unwrap();

    rt.for_each(
        0..30u64,
        |_item: &u64, _scope: &mut Scope<u64>| -> Result<(), Abort> { Ok(()) },
        LoopOptions::new().name("between"),
    )
    .unwrap();

    let done = Arc::new(AtomicUsize::new(0));
    let d = Arc::clone(&done);
    rt.on_each(move |_worker, _threads| {
        d.fetch_add(1, Ordering::Relaxed);
    })
    .unwrap();

    let mut ids: Vec<_> = setup.lock().unwrap().iter().map(|&(w, _)| w).collect();
    ids.sort_unstable();
    assert_eq!(ids, vec![0, 1, 2]);
    assert!(setup.lock().unwrap().iter().all(|&(_, n)| n == 3));
    assert_eq!(done.load(Ordering::Relaxed), 3);
}
