//! The read half of a computation and its combinators.
//!
//! Everything here registers callbacks; nothing blocks except
//! [`Deferred::result`]. Derived futures hold cancellation edges back to
//! their sources, and iterating combinators merge result cells instead of
//! stacking forwarding waiters, so chains of any depth stay flat.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::cancel::Cancellable;
use crate::fault::{catching, Fault};
use crate::locals::Snapshot;
use crate::outcome::Outcome;
use crate::promise::{Cells, Promise};
use crate::timer::{Timer, TimerExt, TimerTask};

/// The read half of an asynchronous computation.
///
/// Clones share the same cells; dropping a `Deferred` never cancels
/// anything, cancellation is always an explicit [`Cancellable::cancel`].
pub struct Deferred<T> {
    pub(crate) cells: Arc<Cells<T>>,
}

impl<T> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Deferred {
            cells: self.cells.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> Deferred<T> {
    /// An already-successful future.
    pub fn finished(value: T) -> Self {
        Promise::of(Outcome::Success(value)).deferred()
    }

    /// An already-failed future.
    pub fn failed(fault: Fault) -> Self {
        Promise::of(Outcome::Failure(fault)).deferred()
    }

    /// Evaluate `f` immediately, capturing a panic as a failed future.
    pub fn from_fn(f: impl FnOnce() -> T) -> Self {
        match catching(f) {
            Ok(value) => Deferred::finished(value),
            Err(fault) => Deferred::failed(fault),
        }
    }

    /// Non-blocking read of the outcome.
    pub fn poll(&self) -> Option<Outcome<T>> {
        self.cells.results.poll()
    }

    pub fn is_defined(&self) -> bool {
        self.cells.results.is_full()
    }

    /// Block for the outcome, failing with [`Fault::Timeout`] when the
    /// deadline elapses first.
    pub fn result(&self, timeout: Duration) -> Outcome<T> {
        match self.cells.results.wait_for(timeout) {
            Some(outcome) => outcome,
            None => Outcome::Failure(Fault::Timeout(timeout)),
        }
    }

    /// Register `k` for the outcome. Callbacks run in registration order on
    /// whichever thread completes the promise, with the registering thread's
    /// [locals](crate::locals) restored around the invocation.
    ///
    /// Returns a chained future satisfied by the same result, so further
    /// stages hang off this registration instead of piling waiters onto the
    /// original cell.
    pub fn respond(&self, k: impl FnOnce(Outcome<T>) + Send + 'static) -> Deferred<T> {
        let snapshot = Snapshot::capture();
        self.cells
            .results
            .on_full(move |outcome| snapshot.run(move || k(outcome)));
        self.chained()
    }

    /// Run `k` only on success.
    pub fn on_success(&self, k: impl FnOnce(T) + Send + 'static) -> Deferred<T> {
        self.respond(move |outcome| {
            if let Outcome::Success(value) = outcome {
                k(value)
            }
        })
    }

    /// Run `k` only on failure.
    pub fn on_failure(&self, k: impl FnOnce(Fault) + Send + 'static) -> Deferred<T> {
        self.respond(move |outcome| {
            if let Outcome::Failure(fault) = outcome {
                k(fault)
            }
        })
    }

    /// Run `k` once the computation completes, whichever way it went.
    pub fn ensure(&self, k: impl FnOnce() + Send + 'static) -> Deferred<T> {
        self.respond(move |_| k())
    }

    fn chained(&self) -> Deferred<T> {
        let mut cache = self.cells.chained.lock().unwrap();
        if let Some(next) = &*cache {
            return next.clone();
        }
        let next = Deferred {
            cells: Arc::new(Cells {
                results: self.cells.results.chained(),
                cancelled: self.cells.cancelled.clone(),
                chained: Mutex::new(None),
            }),
        };
        *cache = Some(next.clone());
        next
    }

    /// Chain `f` onto a successful result.
    ///
    /// Cancellation reaches whichever stage is pending: this future until it
    /// completes, then the future returned by `f`. When the stage advances,
    /// both the result cell and the cancellation cell are merged with the
    /// inner future's rather than bridged by retained waiters, so an
    /// iterated chain keeps a constant number of cells and edges alive per
    /// link.
    pub fn and_then<U, F>(&self, f: F) -> Deferred<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> Deferred<U> + Send + 'static,
    {
        let next = Promise::new();
        let parent_waiter = next.cells.cancelled.on_full({
            let parent = self.clone();
            move |_| parent.cancel()
        });
        let derived = next.deferred();
        self.respond(move |outcome| match outcome {
            Outcome::Success(value) => {
                next.cells.cancelled.cancel_waiter(parent_waiter);
                let inner = match catching(move || f(value)) {
                    Ok(inner) => inner,
                    Err(fault) => Deferred::failed(fault),
                };
                // The cancellation state collapses along with the result; a
                // retained per-stage edge would keep every advanced stage of
                // an iterated chain reachable from the head.
                next.cells.cancelled.merge(&inner.cells.cancelled);
                next.cells.results.merge(&inner.cells.results);
            }
            Outcome::Failure(fault) => next.update(Outcome::Failure(fault)),
        });
        derived
    }

    /// Transform a successful value; a panic in `f` fails the future.
    pub fn map<U, F>(&self, f: F) -> Deferred<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        self.and_then(move |value| Deferred::from_fn(move || f(value)))
    }

    /// Recover from selected failures with another future. Returning `None`
    /// lets the failure through untouched; successes always pass through.
    pub fn or_else<F>(&self, f: F) -> Deferred<T>
    where
        F: FnOnce(&Fault) -> Option<Deferred<T>> + Send + 'static,
    {
        let next = Promise::new();
        let parent_waiter = next.cells.cancelled.on_full({
            let parent = self.clone();
            move |_| parent.cancel()
        });
        let derived = next.deferred();
        self.respond(move |outcome| match outcome {
            Outcome::Failure(fault) => match catching(|| f(&fault)) {
                Ok(Some(inner)) => {
                    next.cells.cancelled.cancel_waiter(parent_waiter);
                    next.cells.cancelled.merge(&inner.cells.cancelled);
                    next.cells.results.merge(&inner.cells.results);
                }
                Ok(None) => next.update(Outcome::Failure(fault)),
                Err(panic_fault) => next.update(Outcome::Failure(panic_fault)),
            },
            success => next.update(success),
        });
        derived
    }

    /// Recover from selected failures with a plain value. Returning `None`
    /// lets the failure through untouched.
    pub fn handle<F>(&self, f: F) -> Deferred<T>
    where
        F: FnOnce(&Fault) -> Option<T> + Send + 'static,
    {
        self.or_else(move |fault| f(fault).map(Deferred::finished))
    }

    /// Fail with [`Fault::PredicateFailed`] when `p` rejects the value.
    pub fn filter<P>(&self, p: P) -> Deferred<T>
    where
        P: FnOnce(&T) -> bool + Send + 'static,
    {
        self.and_then(move |value| Promise::of(Outcome::Success(value).filter(p)).deferred())
    }

    /// Pair this future with `other`. Both successes produce the tuple; the
    /// first failure to arrive wins. Cancelling the pair cancels both
    /// inputs.
    pub fn join<U: Clone + Send + 'static>(&self, other: &Deferred<U>) -> Deferred<(T, U)> {
        let next = Promise::new();
        next.link_to(self.clone());
        next.link_to(other.clone());
        let gathered: Arc<Mutex<(Option<T>, Option<U>)>> = Arc::new(Mutex::new((None, None)));
        let derived = next.deferred();
        self.respond({
            let next = next.clone();
            let gathered = gathered.clone();
            move |outcome| match outcome {
                Outcome::Success(value) => {
                    let pair = {
                        let mut state = gathered.lock().unwrap();
                        state.0 = Some(value);
                        take_pair(&mut state)
                    };
                    if let Some(pair) = pair {
                        next.update_if_empty(Outcome::Success(pair));
                    }
                }
                Outcome::Failure(fault) => {
                    next.update_if_empty(Outcome::Failure(fault));
                }
            }
        });
        other.respond(move |outcome| match outcome {
            Outcome::Success(value) => {
                let pair = {
                    let mut state = gathered.lock().unwrap();
                    state.1 = Some(value);
                    take_pair(&mut state)
                };
                if let Some(pair) = pair {
                    next.update_if_empty(Outcome::Success(pair));
                }
            }
            Outcome::Failure(fault) => {
                next.update_if_empty(Outcome::Failure(fault));
            }
        });
        derived
    }

    /// The first of the two computations to complete, success or failure.
    pub fn select(&self, other: &Deferred<T>) -> Deferred<T> {
        let next = Promise::new();
        next.link_to(self.clone());
        next.link_to(other.clone());
        let derived = next.deferred();
        self.respond({
            let next = next.clone();
            move |outcome| {
                next.update_if_empty(outcome);
            }
        });
        other.respond(move |outcome| {
            next.update_if_empty(outcome);
        });
        derived
    }

    /// Impose a deadline. When `timeout` elapses first the result is
    /// [`Fault::Timeout`]; when the computation completes first the
    /// scheduled task is cancelled. Cancelling the returned future reaches
    /// both the original computation and the task.
    pub fn within<Tm>(&self, timer: &Tm, timeout: Duration) -> Deferred<T>
    where
        Tm: Timer + ?Sized,
    {
        let next = Promise::new();
        let task: Arc<dyn TimerTask> = Arc::from(timer.schedule_after(
            timeout,
            Box::new({
                let next = next.clone();
                move || {
                    next.update_if_empty(Outcome::Failure(Fault::Timeout(timeout)));
                }
            }),
        ));
        next.link_to(self.clone());
        next.on_cancel(Box::new({
            let task = task.clone();
            move || task.cancel()
        }));
        let derived = next.deferred();
        self.respond(move |outcome| {
            next.update_if_empty(outcome);
            task.cancel();
        });
        derived
    }

}

impl Deferred<()> {
    /// An already-completed unit future.
    pub fn done() -> Deferred<()> {
        Deferred::finished(())
    }
}

fn take_pair<T, U>(state: &mut (Option<T>, Option<U>)) -> Option<(T, U)> {
    if state.0.is_some() && state.1.is_some() {
        Some((state.0.take().unwrap(), state.1.take().unwrap()))
    } else {
        None
    }
}

impl<T: Clone + Send + 'static> Deferred<Deferred<T>> {
    /// Collapse a future of a future.
    pub fn flatten(&self) -> Deferred<T> {
        self.and_then(|inner| inner)
    }
}

impl<T: Clone + Send + 'static> Cancellable for Deferred<T> {
    fn cancel(&self) {
        self.cells.cancelled.fill(());
    }

    fn is_cancelled(&self) -> bool {
        self.cells.cancelled.is_full()
    }

    fn on_cancel(&self, thunk: Box<dyn FnOnce() + Send>) {
        self.cells.cancelled.on_full(move |_| thunk());
    }
}

/// Complete with unit once every input succeeds; the first failure fails
/// the batch. Cancelling the returned future cancels every input.
pub fn join_all<T: Clone + Send + 'static>(futures: Vec<Deferred<T>>) -> Deferred<()> {
    if futures.is_empty() {
        return Deferred::finished(());
    }
    let next = Promise::new();
    let remaining = Arc::new(AtomicUsize::new(futures.len()));
    let derived = next.deferred();
    for future in futures {
        next.link_to(future.clone());
        future.respond({
            let next = next.clone();
            let remaining = remaining.clone();
            move |outcome| match outcome {
                Outcome::Success(_) => {
                    if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                        next.update_if_empty(Outcome::Success(()));
                    }
                }
                Outcome::Failure(fault) => {
                    next.update_if_empty(Outcome::Failure(fault));
                }
            }
        });
    }
    derived
}

/// Complete with every value in input order, regardless of completion
/// order; the first failure fails the batch. Cancelling the returned future
/// cancels every input.
pub fn collect<T: Clone + Send + 'static>(futures: Vec<Deferred<T>>) -> Deferred<Vec<T>> {
    if futures.is_empty() {
        return Deferred::finished(Vec::new());
    }
    let next = Promise::new();
    let gathered: Arc<Mutex<Vec<Option<T>>>> = Arc::new(Mutex::new(vec![None; futures.len()]));
    let remaining = Arc::new(AtomicUsize::new(futures.len()));
    let derived = next.deferred();
    for (index, future) in futures.into_iter().enumerate() {
        next.link_to(future.clone());
        future.respond({
            let next = next.clone();
            let gathered = gathered.clone();
            let remaining = remaining.clone();
            move |outcome| match outcome {
                Outcome::Success(value) => {
                    gathered.lock().unwrap()[index] = Some(value);
                    if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                        let values: Vec<T> = gathered
                            .lock()
                            .unwrap()
                            .drain(..)
                            .map(|slot| slot.expect("pledge: collect slot left empty"))
                            .collect();
                        next.update_if_empty(Outcome::Success(values));
                    }
                }
                Outcome::Failure(fault) => {
                    next.update_if_empty(Outcome::Failure(fault));
                }
            }
        });
    }
    derived
}

/// The first input to complete, paired with the rest in input order. The
/// winner is excluded from the remainder. Cancelling the returned future
/// cancels every input.
///
/// # Panics
///
/// Panics when `futures` is empty.
pub fn select_all<T: Clone + Send + 'static>(
    futures: Vec<Deferred<T>>,
) -> Deferred<(Outcome<T>, Vec<Deferred<T>>)> {
    assert!(
        !futures.is_empty(),
        "pledge: select_all requires at least one future"
    );
    let next = Promise::new();
    let futures = Arc::new(futures);
    let won = Arc::new(AtomicBool::new(false));
    let derived = next.deferred();
    for index in 0..futures.len() {
        next.link_to(futures[index].clone());
        futures[index].respond({
            let next = next.clone();
            let futures = futures.clone();
            let won = won.clone();
            move |outcome| {
                if won.swap(true, Ordering::AcqRel) {
                    return;
                }
                let rest: Vec<Deferred<T>> = futures
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| *i != index)
                    .map(|(_, future)| future.clone())
                    .collect();
                next.update_if_empty(Outcome::Success((outcome, rest)));
            }
        });
    }
    derived
}

/// Run `body` `n` times in sequence, completing with unit. Uses constant
/// space per iteration however large `n` is.
pub fn times<F>(n: usize, body: F) -> Deferred<()>
where
    F: Fn() -> Deferred<()> + Send + Sync + 'static,
{
    fn step<F>(i: usize, n: usize, body: Arc<F>) -> Deferred<()>
    where
        F: Fn() -> Deferred<()> + Send + Sync + 'static,
    {
        if i == n {
            return Deferred::finished(());
        }
        (*body)().and_then(move |_| step(i + 1, n, body))
    }
    step(0, n, Arc::new(body))
}

/// Run `body` repeatedly for as long as `condition` holds, completing with
/// unit. Uses constant space per iteration.
pub fn while_do<C, F>(condition: C, body: F) -> Deferred<()>
where
    C: Fn() -> bool + Send + Sync + 'static,
    F: Fn() -> Deferred<()> + Send + Sync + 'static,
{
    fn step<C, F>(condition: Arc<C>, body: Arc<F>) -> Deferred<()>
    where
        C: Fn() -> bool + Send + Sync + 'static,
        F: Fn() -> Deferred<()> + Send + Sync + 'static,
    {
        if !(*condition)() {
            return Deferred::finished(());
        }
        (*body)().and_then(move |_| step(condition, body))
    }
    step(Arc::new(condition), Arc::new(body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Weak;

    #[test]
    fn advanced_stages_are_released() {
        type Probe = Arc<Mutex<Option<Weak<Cells<u32>>>>>;

        fn step(n: u32, probe: &Probe) -> Deferred<u32> {
            if n == 0 {
                return Deferred::finished(0);
            }
            let recurse = probe.clone();
            let stage = Deferred::finished(n - 1).and_then(move |x| step(x, &recurse));
            if n == 64 {
                *probe.lock().unwrap() = Some(Arc::downgrade(&stage.cells));
            }
            stage
        }

        let probe: Probe = Arc::new(Mutex::new(None));
        let done = step(128, &probe);
        assert_eq!(done.poll(), Some(Outcome::Success(0)));
        // Holding the head of the chain must not keep the stages the
        // computation already advanced past reachable; both the result and
        // the cancellation cells collapse on advance.
        let weak = probe.lock().unwrap().take().expect("probe never armed");
        assert!(weak.upgrade().is_none());
        assert_eq!(done.poll(), Some(Outcome::Success(0)));
    }

    #[test]
    fn cancelling_the_head_after_completion_reaches_the_merged_state() {
        let tail: Promise<u32> = Promise::new();
        let tail_deferred = tail.deferred();
        let head = Deferred::finished(1u32).and_then(move |_| tail_deferred);
        head.cancel();
        assert!(tail.is_cancelled());
    }
}
