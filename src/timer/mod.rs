//! Deferred and periodic execution behind a pluggable [`Timer`] trait.
//!
//! Production code schedules on a [`ThreadTimer`] (one worker, one queue)
//! or a [`PoolTimer`] (tokio runtime, concurrent firing). [`NullTimer`]
//! collapses "eventually" to "now" and [`MockTimer`] gives tests a logical
//! clock. [`RefCountedTimer`] and [`DetachedStopTimer`] wrap another timer
//! to share it and to stop it safely from its own threads.

use std::sync::Arc;
use std::time::{Duration, Instant};

use lazy_static::lazy_static;

use crate::cancel::Cancellable;
use crate::deferred::Deferred;
use crate::fault::catching;
use crate::outcome::Outcome;
use crate::promise::Promise;

mod mock;
mod pool;
mod thread;
mod wrappers;

pub use mock::MockTimer;
pub use pool::PoolTimer;
pub use thread::ThreadTimer;
pub use wrappers::{DetachedStopTimer, RefCountedTimer};

/// A one-shot piece of work handed to a [`Timer`].
pub type Thunk = Box<dyn FnOnce() + Send>;

/// A repeatable piece of work for periodic scheduling.
pub type RepeatThunk = Box<dyn FnMut() + Send>;

/// Handle to a scheduled unit of work.
pub trait TimerTask: Send + Sync {
    /// Withdraw the work. Idempotent, and a no-op once it has fired.
    fn cancel(&self);
}

/// A task handle with nothing left to cancel. Returned for work that ran
/// synchronously and for scheduling attempts a timer had to refuse.
pub struct DeadTask;

impl TimerTask for DeadTask {
    fn cancel(&self) {}
}

/// Schedules thunks for deferred or periodic execution.
///
/// A thunk that panics must never unwind a timer's thread; every variant
/// captures the panic and logs it. Whether periodic scheduling is
/// fixed-delay or fixed-rate is up to the variant and documented there.
pub trait Timer: Send + Sync {
    /// The scheduler's notion of the current instant. The mock timer
    /// substitutes its logical clock here; everything else reads the real
    /// one.
    fn now(&self) -> Instant {
        Instant::now()
    }

    /// Run `thunk` once at `deadline`.
    fn schedule_at(&self, deadline: Instant, thunk: Thunk) -> Box<dyn TimerTask>;

    /// Run `thunk` at `first` and then repeatedly every `period`.
    fn schedule_periodic(
        &self,
        first: Instant,
        period: Duration,
        thunk: RepeatThunk,
    ) -> Box<dyn TimerTask>;

    /// Shut the timer down, discarding pending work. Scheduling afterwards
    /// fails softly with a warning and a dead task.
    fn stop(&self);
}

/// Convenience scheduling built on any [`Timer`].
pub trait TimerExt: Timer {
    /// Run `thunk` once, `delay` from now.
    fn schedule_after(&self, delay: Duration, thunk: Thunk) -> Box<dyn TimerTask> {
        self.schedule_at(self.now() + delay, thunk)
    }

    /// Run `thunk` every `period`, first firing one period from now.
    fn schedule_every(&self, period: Duration, thunk: RepeatThunk) -> Box<dyn TimerTask> {
        self.schedule_periodic(self.now() + period, period, thunk)
    }

    /// Evaluate `f` after `delay`, exposing the result as a future.
    fn defer<T, F>(&self, delay: Duration, f: F) -> Deferred<T>
    where
        T: Clone + Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        self.defer_at(self.now() + delay, f)
    }

    /// Evaluate `f` at `deadline`, exposing the result as a future.
    ///
    /// Cancelling the returned future withdraws the scheduled task. A panic
    /// in `f` fails the future instead of the timer thread.
    fn defer_at<T, F>(&self, deadline: Instant, f: F) -> Deferred<T>
    where
        T: Clone + Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let promise = Promise::new();
        let task: Arc<dyn TimerTask> = Arc::from(self.schedule_at(
            deadline,
            Box::new({
                let promise = promise.clone();
                move || {
                    let outcome = match catching(f) {
                        Ok(value) => Outcome::Success(value),
                        Err(fault) => Outcome::Failure(fault),
                    };
                    promise.update_if_empty(outcome);
                }
            }),
        ));
        promise.on_cancel(Box::new(move || task.cancel()));
        promise.deferred()
    }
}

impl<X: Timer + ?Sized> TimerExt for X {}

/// Runs every thunk synchronously at schedule time; for tests where
/// "eventually" should mean "immediately". Periodic work runs exactly once.
pub struct NullTimer;

impl Timer for NullTimer {
    fn schedule_at(&self, _deadline: Instant, thunk: Thunk) -> Box<dyn TimerTask> {
        thunk();
        Box::new(DeadTask)
    }

    fn schedule_periodic(
        &self,
        _first: Instant,
        _period: Duration,
        mut thunk: RepeatThunk,
    ) -> Box<dyn TimerTask> {
        thunk();
        Box::new(DeadTask)
    }

    fn stop(&self) {}
}

lazy_static! {
    static ref SHARED: RefCountedTimer =
        RefCountedTimer::new(|| Arc::new(ThreadTimer::new()) as Arc<dyn Timer>);
}

/// The process-wide shared timer. Call [`RefCountedTimer::acquire`] before
/// scheduling and [`Timer::stop`] when done; the backing worker thread only
/// exists while at least one owner holds it.
pub fn shared() -> &'static RefCountedTimer {
    &SHARED
}
