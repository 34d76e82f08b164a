use std::sync::{Arc, Mutex};

use crate::cancel::Cancellable;
use crate::deferred::Deferred;
use crate::fault::Fault;
use crate::outcome::Outcome;
use crate::slot::Slot;

/// The shared state behind a [`Promise`] and its [`Deferred`] views.
pub(crate) struct Cells<T> {
    /// The computation's outcome. Set at most once.
    pub(crate) results: Slot<Outcome<T>>,
    /// The cancellation signal. Raising it does not touch `results`.
    pub(crate) cancelled: Slot<()>,
    /// Cache of the chained view handed out by `respond`, so repeated
    /// registrations on the same future reuse one derived cell.
    pub(crate) chained: Mutex<Option<Deferred<T>>>,
}

impl<T: Clone + Send + 'static> Cells<T> {
    pub(crate) fn empty() -> Arc<Cells<T>> {
        Arc::new(Cells {
            results: Slot::new(),
            cancelled: Slot::new(),
            chained: Mutex::new(None),
        })
    }
}

/// The writable half of an asynchronous computation.
///
/// Exactly one completion wins; waiters registered through the matching
/// [`Deferred`] run exactly once with the outcome, on whichever thread
/// completes the promise. Clones share the same cells.
pub struct Promise<T> {
    pub(crate) cells: Arc<Cells<T>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Promise {
            cells: self.cells.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> Promise<T> {
    /// An empty promise.
    pub fn new() -> Self {
        Promise {
            cells: Cells::empty(),
        }
    }

    /// A promise that is already complete.
    pub fn of(outcome: Outcome<T>) -> Self {
        Promise {
            cells: Arc::new(Cells {
                results: Slot::of(outcome),
                cancelled: Slot::new(),
                chained: Mutex::new(None),
            }),
        }
    }

    /// The read half of this promise.
    pub fn deferred(&self) -> Deferred<T> {
        Deferred {
            cells: self.cells.clone(),
        }
    }

    /// Complete with a value.
    ///
    /// # Panics
    ///
    /// Panics when the promise was already completed.
    pub fn set_value(&self, value: T) {
        self.update(Outcome::Success(value));
    }

    /// Complete with a failure.
    ///
    /// # Panics
    ///
    /// Panics when the promise was already completed.
    pub fn set_error(&self, fault: Fault) {
        self.update(Outcome::Failure(fault));
    }

    /// Complete the promise. The result is immutable once set; racing
    /// writers should use [`update_if_empty`](Self::update_if_empty).
    ///
    /// # Panics
    ///
    /// Panics when the promise was already completed.
    pub fn update(&self, outcome: Outcome<T>) {
        assert!(
            self.update_if_empty(outcome),
            "pledge: promise result is immutable once set"
        );
    }

    /// Complete the promise if still empty. Exactly one concurrent caller
    /// observes `true`.
    pub fn update_if_empty(&self, outcome: Outcome<T>) -> bool {
        self.cells.results.fill(outcome)
    }

    pub fn is_defined(&self) -> bool {
        self.cells.results.is_full()
    }

    /// Non-blocking read of the outcome.
    pub fn poll(&self) -> Option<Outcome<T>> {
        self.cells.results.poll()
    }
}

impl<T: Clone + Send + 'static> Default for Promise<T> {
    fn default() -> Self {
        Promise::new()
    }
}

impl<T: Clone + Send + 'static> Cancellable for Promise<T> {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_the_first_completion_wins() {
        let promise = Promise::new();
        assert!(promise.update_if_empty(Outcome::Success(1)));
        assert!(!promise.update_if_empty(Outcome::Success(2)));
        assert_eq!(promise.poll(), Some(Outcome::Success(1)));
    }

    #[test]
    #[should_panic(expected = "immutable")]
    fn strict_update_panics_on_a_full_promise() {
        let promise = Promise::new();
        promise.set_value(1);
        promise.set_value(2);
    }

    #[test]
    fn cancellation_does_not_complete_the_result() {
        let promise: Promise<u32> = Promise::new();
        promise.cancel();
        promise.cancel();
        assert!(promise.is_cancelled());
        assert!(!promise.is_defined());
    }

    #[test]
    fn linked_cancellables_are_notified() {
        let upstream: Promise<u32> = Promise::new();
        let downstream: Promise<u32> = Promise::new();
        upstream.link_to(downstream.clone());
        upstream.cancel();
        assert!(downstream.is_cancelled());
    }

    #[test]
    fn linking_an_already_cancelled_promise_fires_immediately() {
        let upstream: Promise<u32> = Promise::new();
        upstream.cancel();
        let downstream: Promise<u32> = Promise::new();
        upstream.link_to(downstream.clone());
        assert!(downstream.is_cancelled());
    }
}
