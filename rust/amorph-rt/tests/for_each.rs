//! End-to-end loop behaviour: counting, pushing, conflicts, break,
//! escalation, and the executor's accounting laws.

use amorph_rt::{
    Abort, EscalationPolicy, Guarded, IterationScope, LoopError, LoopOptions, Runtime, Topology,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

type Scope<T> = IterationScope<T>;

// ---------------------------------------------------------------------------
// Counting
// ---------------------------------------------------------------------------

#[test]
fn counting_without_conflicts_or_pushes() {
    let rt = Runtime::new(4);
    let sum = Arc::new(AtomicU64::new(0));

    let s = Arc::clone(&sum);
    let report = rt
        .for_each(
            0..1000u64,
            move |item: &u64, _scope: &mut Scope<u64>| -> Result<(), Abort> {
                s.fetch_add(*item, Ordering::Relaxed);
                Ok(())
            },
            LoopOptions::new().name("counting"),
        )
        .unwrap();

    assert_eq!(sum.load(Ordering::Relaxed), 499_500);
    assert_eq!(report.iterations, 1000);
    assert_eq!(report.conflicts, 0);
    assert_eq!(report.commits(), 1000);
    assert!(!report.broke);
}

#[test]
fn counting_on_the_cheap_non_speculative_path() {
    let rt = Runtime::new(4);
    let sum = Arc::new(AtomicU64::new(0));

    let s = Arc::clone(&sum);
    let report = rt
        .for_each(
            0..1000u64,
            move |item: &u64, _scope: &mut Scope<u64>| -> Result<(), Abort> {
                s.fetch_add(*item, Ordering::Relaxed);
                Ok(())
            },
            LoopOptions::new().name("counting-simple").no_aborts(),
        )
        .unwrap();

    assert_eq!(sum.load(Ordering::Relaxed), 499_500);
    assert_eq!(report.iterations, 1000);
    assert_eq!(report.conflicts, 0);
}

// ---------------------------------------------------------------------------
// Pushing new work
// ---------------------------------------------------------------------------

#[test]
fn countdown_push_processes_the_pushed_item() {
    // Seed {1}; the operator pushes x-1 while x > 0, so exactly the items
    // 1 and 0 run: two iterations, one push.
    let rt = Runtime::new(2);
    let report = rt
        .for_each(
            vec![1u64],
            |item: &u64, scope: &mut Scope<u64>| -> Result<(), Abort> {
                if *item > 0 {
                    scope.push(*item - 1);
                }
                Ok(())
            },
            LoopOptions::new().name("countdown").with_push(),
        )
        .unwrap();

    assert_eq!(report.iterations, 2);
    assert_eq!(report.pushes, 1);
    assert_eq!(report.commits(), 2);
}

#[test]
fn countdown_push_on_the_fast_path() {
    // Without aborts the push buffer is bypassed; the counts are identical.
    let rt = Runtime::new(2);
    let report = rt
        .for_each(
            vec![5u64],
            |item: &u64, scope: &mut Scope<u64>| -> Result<(), Abort> {
                if *item > 0 {
                    scope.push(*item - 1);
                }
                Ok(())
            },
            LoopOptions::new().name("countdown-fast").with_push().no_aborts(),
        )
        .unwrap();

    assert_eq!(report.iterations, 6);
    assert_eq!(report.pushes, 5);
}

#[test]
fn every_pushed_item_is_eventually_popped() {
    // Each seed item fans out into ten children; all of them must run.
    let rt = Runtime::new(4);
    let seen = Arc::new(AtomicUsize::new(0));

    let s = Arc::clone(&seen);
    let report = rt
        .for_each(
            (0..20u64).map(|i| i * 100),
            move |item: &u64, scope: &mut Scope<u64>| -> Result<(), Abort> {
                s.fetch_add(1, Ordering::Relaxed);
                if item % 100 == 0 {
                    scope.push_all((item + 1)..(item + 11));
                }
                Ok(())
            },
            LoopOptions::new().name("fanout").with_push(),
        )
        .unwrap();

    assert_eq!(seen.load(Ordering::Relaxed), 20 * 11);
    assert_eq!(report.iterations, 220);
    assert_eq!(report.pushes, 200);
}

// ---------------------------------------------------------------------------
// Conflicts
// ---------------------------------------------------------------------------

#[test]
fn forced_conflict_commits_both_items() {
    // Two items share one logical lock on two workers. A one-shot
    // rendezvous lines both iterations up, then the lock is held across a
    // sleep so the loser must observe a conflict, abort, and retry.
    let rt = Runtime::new(2);
    let shared = Arc::new(Guarded::new(0u64));
    let arrivals = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();

    let g = Arc::clone(&shared);
    let a = Arc::clone(&arrivals);
    let report = rt
        .for_each(
            vec![1u64, 2u64],
            move |_item: &u64, scope: &mut Scope<u64>| -> Result<(), Abort> {
                // First two arrivals wait for each other (with a deadline so
                // retries cannot hang); later attempts fall straight through.
                let rank = a.fetch_add(1, Ordering::SeqCst);
                if rank < 2 {
                    while a.load(Ordering::SeqCst) < 2
                        && start.elapsed() < Duration::from_secs(1)
                    {
                        std::hint::spin_loop();
                    }
                }
                scope.exclusive(&g, |v| {
                    std::thread::sleep(Duration::from_millis(50));
                    *v += 1;
                })?;
                Ok(())
            },
            LoopOptions::new().name("forced-conflict"),
        )
        .unwrap();

    assert_eq!(report.commits(), 2, "no item may be lost");
    assert!(report.conflicts >= 1, "overlap must cause a conflict");
    assert_eq!(report.iterations, report.commits() + report.conflicts);
    assert_eq!(Arc::try_unwrap(shared).ok().unwrap().into_inner(), 2);
}

#[test]
fn conflicting_iterations_discard_their_pushes() {
    // Every even item conflicts once before committing; its push must only
    // take effect on the committed attempt.
    let rt = Runtime::new(4);
    let attempts = Arc::new(Mutex::new(HashMap::<u64, u32>::new()));
    let child_runs = Arc::new(AtomicUsize::new(0));

    let at = Arc::clone(&attempts);
    let cr = Arc::clone(&child_runs);
    let report = rt
        .for_each(
            (0..40u64).map(|i| i * 2),
            move |item: &u64, scope: &mut Scope<u64>| -> Result<(), Abort> {
                if *item % 2 == 0 {
                    // Parent item: stage a child, then maybe conflict.
                    scope.push(*item + 1);
                    let mut seen = at.lock().unwrap();
                    let n = seen.entry(*item).or_insert(0);
                    *n += 1;
                    if *n == 1 {
                        return Err(Abort::Conflict);
                    }
                } else {
                    cr.fetch_add(1, Ordering::Relaxed);
                }
                Ok(())
            },
            LoopOptions::new().name("abort-discards-pushes").with_push(),
        )
        .unwrap();

    // 40 parents, each aborted once then committed, each child ran once.
    assert_eq!(report.conflicts, 40);
    assert_eq!(child_runs.load(Ordering::Relaxed), 40);
    assert_eq!(report.pushes, 40, "aborted pushes must not be counted");
    assert_eq!(report.iterations, report.commits() + report.conflicts);
}

#[test]
fn no_two_commits_hold_the_same_lock_at_once() {
    // Every iteration takes the same lock and bumps a plain counter inside
    // it; if exclusion were broken the unsynchronized increments would lose
    // updates and the final value would fall short.
    let rt = Runtime::new(4);
    let cell = Arc::new(Guarded::new(0u64));

    let g = Arc::clone(&cell);
    let report = rt
        .for_each(
            0..200u64,
            move |_item: &u64, scope: &mut Scope<u64>| -> Result<(), Abort> {
                scope.exclusive(&g, |v| *v += 1)?;
                Ok(())
            },
            LoopOptions::new().name("hot-lock"),
        )
        .unwrap();

    assert_eq!(report.commits(), 200);
    assert_eq!(Arc::try_unwrap(cell).ok().unwrap().into_inner(), 200);
}

// ---------------------------------------------------------------------------
// Break
// ---------------------------------------------------------------------------

#[test]
fn break_stops_the_loop_and_discards_the_rest() {
    let rt = Runtime::new(4);
    let ran = Arc::new(AtomicUsize::new(0));

    let r = Arc::clone(&ran);
    let report = rt
        .for_each(
            0..1000u64,
            move |item: &u64, scope: &mut Scope<u64>| -> Result<(), Abort> {
                r.fetch_add(1, Ordering::Relaxed);
                if *item == 42 {
                    scope.stop();
                }
                Ok(())
            },
            LoopOptions::new().name("break-at-42").with_break(),
        )
        .unwrap();

    assert!(report.broke);
    assert!(report.iterations >= 1);
    assert!(report.iterations <= 1000);
    assert_eq!(ran.load(Ordering::Relaxed) as u64, report.iterations);
}

#[test]
fn break_on_the_first_item_of_a_single_worker() {
    let rt = Runtime::new(1);
    let report = rt
        .for_each(
            0..1000u64,
            |_item: &u64, scope: &mut Scope<u64>| -> Result<(), Abort> {
                scope.stop();
                Ok(())
            },
            LoopOptions::new().name("break-immediately").with_break(),
        )
        .unwrap();

    assert!(report.broke);
    assert_eq!(report.iterations, 1);
}

#[test]
fn stop_without_the_break_option_is_ignored() {
    let rt = Runtime::new(2);
    let report = rt
        .for_each(
            0..100u64,
            |_item: &u64, scope: &mut Scope<u64>| -> Result<(), Abort> {
                scope.stop();
                Ok(())
            },
            LoopOptions::new().name("stop-ignored"),
        )
        .unwrap();

    assert!(!report.broke);
    assert_eq!(report.iterations, 100);
}

// ---------------------------------------------------------------------------
// Escalation
// ---------------------------------------------------------------------------

#[test]
fn repeated_aborts_escalate_retries() {
    // Eight workers in four packages; even items abort on their first two
    // attempts, so their retry counters must climb to two.
    let rt = Runtime::with_topology(Topology::new(8, 4));
    let attempts = Arc::new(Mutex::new(HashMap::<u64, u32>::new()));

    let at = Arc::clone(&attempts);
    let report = rt
        .for_each(
            0..64u64,
            move |item: &u64, _scope: &mut Scope<u64>| -> Result<(), Abort> {
                if item % 2 == 0 {
                    let mut seen = at.lock().unwrap();
                    let n = seen.entry(*item).or_insert(0);
                    *n += 1;
                    if *n <= 2 {
                        return Err(Abort::Conflict);
                    }
                }
                Ok(())
            },
            LoopOptions::new()
                .name("escalating")
                .escalate(EscalationPolicy::Double),
        )
        .unwrap();

    // 32 even items, two aborts each.
    assert_eq!(report.conflicts, 64);
    assert_eq!(report.commits(), 64);
    let seen = attempts.lock().unwrap();
    assert!(seen.values().all(|&n| n == 3));
}

// ---------------------------------------------------------------------------
// Boundary behaviour and laws
// ---------------------------------------------------------------------------

#[test]
fn empty_range_is_immediate() {
    let rt = Runtime::new(4);
    let report = rt
        .for_each(
            Vec::<u64>::new(),
            |_item: &u64, _scope: &mut Scope<u64>| -> Result<(), Abort> { Ok(()) },
            LoopOptions::new().name("empty"),
        )
        .unwrap();
    assert_eq!(report.iterations, 0);
    assert_eq!(report.conflicts, 0);
    assert_eq!(report.pushes, 0);
}

#[test]
fn one_item_one_thread_is_one_commit() {
    let rt = Runtime::new(1);
    let report = rt
        .for_each(
            vec![7u64],
            |_item: &u64, _scope: &mut Scope<u64>| -> Result<(), Abort> { Ok(()) },
            LoopOptions::new().name("singleton"),
        )
        .unwrap();
    assert_eq!(report.commits(), 1);
    assert_eq!(report.conflicts, 0);
}

#[test]
fn single_thread_matches_a_sequential_loop() {
    // With one worker, lock acquisition still runs but conflicts are
    // impossible; the committed effects equal a sequential fold in pop
    // order.
    let rt = Runtime::new(1);
    let order = Arc::new(Mutex::new(Vec::new()));

    let o = Arc::clone(&order);
    let report = rt
        .for_each(
            0..50u64,
            move |item: &u64, _scope: &mut Scope<u64>| -> Result<(), Abort> {
                o.lock().unwrap().push(*item);
                Ok(())
            },
            LoopOptions::new().name("sequential-law"),
        )
        .unwrap();

    assert_eq!(report.conflicts, 0);
    let got = order.lock().unwrap().clone();
    let mut sorted = got.clone();
    sorted.sort_unstable();
    assert_eq!(sorted, (0..50).collect::<Vec<_>>());
}

#[test]
fn non_speculative_multithreaded_run_is_a_multiset_union() {
    // With aborts disabled, each item runs exactly once on some thread; the
    // union of per-thread effects is the input multiset.
    let rt = Runtime::new(4);
    let seen = Arc::new(Mutex::new(HashSet::new()));

    let s = Arc::clone(&seen);
    let report = rt
        .for_each(
            0..500u64,
            move |item: &u64, _scope: &mut Scope<u64>| -> Result<(), Abort> {
                assert!(s.lock().unwrap().insert(*item), "item ran twice");
                Ok(())
            },
            LoopOptions::new().name("multiset-union").no_aborts(),
        )
        .unwrap();

    assert_eq!(report.iterations, 500);
    assert_eq!(seen.lock().unwrap().len(), 500);
}

#[test]
fn reports_accumulate_across_loops() {
    let rt = Runtime::new(2);
    for name in ["first", "second", "third"] {
        rt.for_each(
            0..10u64,
            |_item: &u64, _scope: &mut Scope<u64>| -> Result<(), Abort> { Ok(()) },
            LoopOptions::new().name(name),
        )
        .unwrap();
    }
    let snap = rt.sink().snapshot();
    assert_eq!(snap.len(), 3);
    assert_eq!(rt.sink().totals().iterations, 30);
    let doc = rt.sink().to_json();
    assert_eq!(doc["totals"]["commits"], 30);
}

#[test]
fn config_errors_are_synchronous() {
    let rt = Runtime::new(2);
    let err = rt
        .for_each(
            0..10u64,
            |_item: &u64, _scope: &mut Scope<u64>| -> Result<(), Abort> { Ok(()) },
            LoopOptions::new().chunk(0),
        )
        .unwrap_err();
    assert!(matches!(err, LoopError::Config(_)));
}

#[test]
fn arena_allocations_live_for_one_iteration() {
    let rt = Runtime::new(2);
    let report = rt
        .for_each(
            0..100u64,
            |item: &u64, scope: &mut Scope<u64>| -> Result<(), Abort> {
                let scratch = scope.arena().alloc_value([*item; 8]);
                assert_eq!(scratch[7], *item);
                // The arena was rewound after the previous iteration, so
                // only this iteration's bytes are live.
                assert_eq!(scope.arena().bytes_allocated(), 64);
                Ok(())
            },
            LoopOptions::new().name("arena").with_arena(),
        )
        .unwrap();
    assert_eq!(report.commits(), 100);
}
