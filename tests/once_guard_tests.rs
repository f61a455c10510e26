//! Concurrency tests for the one-time initialization guard.
//!
//! These exercise the guard from many OS threads at once, the way the
//! interposed allocator sees it when a multi-threaded program starts.

use ksm_preload::once::{Entry, InitState, OnceGuard};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

const THREADS: usize = 16;

// ============================================================================
// Exactly-once
// ============================================================================

/// All threads race on first use; the initializer runs once and everyone
/// sees the complete value.
#[test]
fn test_concurrent_first_use_runs_initializer_once() {
    let guard = Arc::new(OnceGuard::<Vec<u64>>::new());
    let runs = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let guard = Arc::clone(&guard);
            let runs = Arc::clone(&runs);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let entry = guard.ensure_with(|| {
                    runs.fetch_add(1, Ordering::SeqCst);
                    // Widen the window in which other threads must wait.
                    thread::sleep(Duration::from_millis(20));
                    (0..1024).collect()
                });
                let value = entry.ready().expect("non-owner threads never see Reentrant");
                assert_eq!(value.len(), 1024);
                assert_eq!(value[1023], 1023);
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(guard.state(), InitState::Done);
}

/// A thread arriving while another initializes blocks until the value is
/// published, instead of returning early.
#[test]
fn test_waiter_blocks_until_done() {
    let guard = Arc::new(OnceGuard::<u32>::new());
    let started = Arc::new(Barrier::new(2));
    let finished = Arc::new(AtomicBool::new(false));

    let initializer = {
        let guard = Arc::clone(&guard);
        let started = Arc::clone(&started);
        let finished = Arc::clone(&finished);
        thread::spawn(move || {
            guard.ensure_with(|| {
                started.wait();
                thread::sleep(Duration::from_millis(50));
                finished.store(true, Ordering::SeqCst);
                99
            });
        })
    };

    started.wait();
    assert!(matches!(guard.state(), InitState::InProgress { .. }));

    let value = guard.ensure_with(|| unreachable!("already being initialized"));
    assert!(finished.load(Ordering::SeqCst));
    assert_eq!(value.ready(), Some(&99));

    initializer.join().unwrap();
}

// ============================================================================
// Reentrancy
// ============================================================================

/// The initializing thread re-enters (as `dlsym` calling `calloc` would)
/// while other threads are already waiting. Nobody deadlocks and the
/// initializer still runs once.
#[test]
fn test_reentry_with_waiters_present() {
    let guard = Arc::new(OnceGuard::<&'static str>::new());
    let runs = Arc::new(AtomicUsize::new(0));
    let reentries = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let guard = Arc::clone(&guard);
            let runs = Arc::clone(&runs);
            let reentries = Arc::clone(&reentries);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let entry = guard.ensure_with(|| {
                    runs.fetch_add(1, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(10));
                    for _ in 0..3 {
                        if let Entry::Reentrant = guard.ensure_with(|| "nested") {
                            reentries.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                    "resolved"
                });
                assert_eq!(entry.ready(), Some(&"resolved"));
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(reentries.load(Ordering::SeqCst), 3);
}

/// Once done, the fast path serves every thread without touching the
/// initializer again.
#[test]
fn test_fast_path_after_done() {
    let guard = Arc::new(OnceGuard::<usize>::new());
    assert_eq!(guard.ensure_with(|| 5).ready(), Some(&5));

    thread::scope(|scope| {
        for _ in 0..THREADS {
            scope.spawn(|| {
                for _ in 0..1000 {
                    let entry = guard.ensure_with(|| unreachable!("initialized twice"));
                    assert_eq!(entry.ready(), Some(&5));
                }
            });
        }
    });
}
