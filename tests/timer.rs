use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use pledge::prelude::*;
use pledge::timer::{self, PoolTimer, ThreadTimer};

#[test]
fn within_fails_when_the_deadline_fires_first() {
    let mock = MockTimer::new();
    let promise: Promise<u32> = Promise::new();
    let bounded = promise.deferred().within(&mock, Duration::from_millis(50));
    assert!(bounded.poll().is_none());
    mock.advance(Duration::from_millis(50));
    assert_eq!(
        bounded.poll(),
        Some(Outcome::Failure(Fault::Timeout(Duration::from_millis(50))))
    );
    // A late completion of the original promise changes nothing downstream.
    promise.update_if_empty(Outcome::Success(7));
    assert_eq!(
        bounded.poll(),
        Some(Outcome::Failure(Fault::Timeout(Duration::from_millis(50))))
    );
}

#[test]
fn within_cancels_the_task_when_completion_wins() {
    let mock = MockTimer::new();
    let promise: Promise<u32> = Promise::new();
    let bounded = promise.deferred().within(&mock, Duration::from_millis(50));
    promise.set_value(7);
    assert_eq!(bounded.poll(), Some(Outcome::Success(7)));
    assert_eq!(mock.pending(), 0);
    mock.advance(Duration::from_millis(100));
    assert_eq!(bounded.poll(), Some(Outcome::Success(7)));
}

#[test]
fn cancelling_a_bounded_future_reaches_source_and_task() {
    let mock = MockTimer::new();
    let promise: Promise<u32> = Promise::new();
    let bounded = promise.deferred().within(&mock, Duration::from_millis(50));
    bounded.cancel();
    assert!(promise.is_cancelled());
    assert_eq!(mock.pending(), 0);
}

#[test]
fn mock_tick_fires_due_tasks_in_scheduled_order() {
    let mock = MockTimer::new();
    let fired = Arc::new(Mutex::new(Vec::new()));
    for (label, at) in [("first", 10u64), ("second", 20), ("third", 30)] {
        let fired = fired.clone();
        mock.schedule_after(
            Duration::from_millis(at),
            Box::new(move || fired.lock().unwrap().push(label)),
        );
    }
    mock.advance(Duration::from_millis(25));
    assert_eq!(*fired.lock().unwrap(), vec!["first", "second"]);
    assert_eq!(mock.pending(), 1);
}

#[test]
fn defer_produces_the_value_on_schedule() {
    let mock = MockTimer::new();
    let deferred = mock.defer(Duration::from_millis(10), || "ready");
    assert!(deferred.poll().is_none());
    mock.advance(Duration::from_millis(10));
    assert_eq!(deferred.poll(), Some(Outcome::Success("ready")));
}

#[test]
fn defer_captures_panics_as_failures() {
    let mock = MockTimer::new();
    let deferred = mock.defer(Duration::from_millis(10), || -> u32 { panic!("bad thunk") });
    // The mock runs thunks on the ticking thread, so the capture happens in
    // the deferral wrapper, not in the timer.
    mock.advance(Duration::from_millis(10));
    assert_eq!(
        deferred.poll(),
        Some(Outcome::Failure(Fault::Panicked("bad thunk".into())))
    );
}

#[test]
fn cancelling_a_deferral_withdraws_the_task() {
    let mock = MockTimer::new();
    let deferred = mock.defer(Duration::from_millis(10), || 1);
    deferred.cancel();
    assert_eq!(mock.pending(), 0);
    mock.advance(Duration::from_millis(20));
    assert!(deferred.poll().is_none());
}

#[test]
fn thread_timer_drives_within_end_to_end() {
    let timer = ThreadTimer::new();
    let promise: Promise<u32> = Promise::new();
    let bounded = promise.deferred().within(&timer, Duration::from_millis(20));
    assert_eq!(
        bounded.result(Duration::from_secs(2)),
        Outcome::Failure(Fault::Timeout(Duration::from_millis(20)))
    );
    timer.stop();
}

#[test]
fn pool_timer_defers_work() {
    let timer = PoolTimer::new(2);
    let deferred = timer.defer(Duration::from_millis(10), || 3u32);
    assert_eq!(deferred.result(Duration::from_secs(2)), Outcome::Success(3));
    timer.stop();
}

#[test]
fn shared_timer_schedules_between_acquire_and_stop() {
    let shared = timer::shared();
    shared.acquire();
    let deferred = shared.defer(Duration::from_millis(10), || 5u32);
    assert_eq!(deferred.result(Duration::from_secs(2)), Outcome::Success(5));
    shared.stop();
}

#[test]
fn periodic_counts_with_a_thread_timer() {
    let timer = ThreadTimer::new();
    let count = Arc::new(AtomicUsize::new(0));
    let observer = count.clone();
    let task = timer.schedule_every(
        Duration::from_millis(10),
        Box::new(move || {
            observer.fetch_add(1, Ordering::SeqCst);
        }),
    );
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while count.load(Ordering::SeqCst) < 3 && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    assert!(count.load(Ordering::SeqCst) >= 3);
    task.cancel();
    timer.stop();
}
