//! Deep iterative composition must cost constant stack and constant memory
//! per step; these chains are deep enough to blow through any scheme that
//! stacks a frame or a forwarding waiter per link.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use pledge::prelude::*;

#[test]
fn deep_and_then_recursion_completes() {
    fn step(n: u32) -> Deferred<u32> {
        if n == 0 {
            Deferred::finished(0)
        } else {
            Deferred::finished(n - 1).and_then(step)
        }
    }

    let done = step(200_000);
    assert_eq!(done.poll(), Some(Outcome::Success(0)));
}

#[test]
fn times_runs_its_body_in_sequence() {
    let count = Arc::new(AtomicUsize::new(0));
    let seen = count.clone();
    let done = times(100_000, move || {
        seen.fetch_add(1, Ordering::Relaxed);
        Deferred::finished(())
    });
    assert_eq!(done.poll(), Some(Outcome::Success(())));
    assert_eq!(count.load(Ordering::Relaxed), 100_000);
}

#[test]
fn while_do_stops_when_the_condition_clears() {
    let remaining = Arc::new(AtomicUsize::new(50_000));
    let cond = remaining.clone();
    let body = remaining.clone();
    let done = while_do(
        move || cond.load(Ordering::Relaxed) > 0,
        move || {
            body.fetch_sub(1, Ordering::Relaxed);
            Deferred::finished(())
        },
    );
    assert_eq!(done.poll(), Some(Outcome::Success(())));
    assert_eq!(remaining.load(Ordering::Relaxed), 0);
}

#[test]
fn a_pending_link_suspends_and_resumes_the_chain() {
    // The chain recurses through a promise that is not complete yet; the
    // remaining iterations run when it is, driven by the completing thread.
    let gate = Promise::new();
    let count = Arc::new(AtomicUsize::new(0));
    let seen = count.clone();
    let gate_deferred = gate.deferred();
    let first = Arc::new(AtomicUsize::new(0));
    let first_flag = first.clone();
    let done = times(10_000, move || {
        seen.fetch_add(1, Ordering::Relaxed);
        if first_flag.fetch_add(1, Ordering::Relaxed) == 0 {
            gate_deferred.clone().and_then(|_| Deferred::finished(()))
        } else {
            Deferred::finished(())
        }
    });
    assert!(done.poll().is_none());
    assert_eq!(count.load(Ordering::Relaxed), 1);
    gate.set_value(());
    assert_eq!(done.poll(), Some(Outcome::Success(())));
    assert_eq!(count.load(Ordering::Relaxed), 10_000);
}
