//! Adapters between [`Deferred`] and the standard task system, so a pledge
//! future can be awaited on any executor.

use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

use futures::future::FusedFuture;

use crate::deferred::Deferred;
use crate::outcome::Outcome;

/// A [`Deferred`] adapted for `.await`; created by [`Deferred::awaited`] or
/// implicitly through `IntoFuture`.
pub struct Awaiting<T> {
    inner: Deferred<T>,
    waker: Arc<Mutex<Option<Waker>>>,
    registered: bool,
    terminated: bool,
}

impl<T: Clone + Send + 'static> Deferred<T> {
    /// Adapt this future for `.await`. Resolves to the [`Outcome`]; the
    /// adapter never panics, no matter how often it is polled.
    pub fn awaited(&self) -> Awaiting<T> {
        Awaiting {
            inner: self.clone(),
            waker: Arc::new(Mutex::new(None)),
            registered: false,
            terminated: false,
        }
    }
}

impl<T: Clone + Send + 'static> Future for Awaiting<T> {
    type Output = Outcome<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Some(outcome) = this.inner.poll() {
            this.terminated = true;
            return Poll::Ready(outcome);
        }
        *this.waker.lock().unwrap() = Some(cx.waker().clone());
        if !this.registered {
            this.registered = true;
            let waker = this.waker.clone();
            this.inner.cells.results.on_full(move |_| {
                if let Some(waker) = waker.lock().unwrap().take() {
                    waker.wake();
                }
            });
        }
        // The value may have landed between the completeness check and the
        // registration; the waiter then ran immediately and already woke us.
        Poll::Pending
    }
}

impl<T: Clone + Send + 'static> FusedFuture for Awaiting<T> {
    fn is_terminated(&self) -> bool {
        self.terminated
    }
}

impl<T: Clone + Send + 'static> IntoFuture for Deferred<T> {
    type Output = Outcome<T>;
    type IntoFuture = Awaiting<T>;

    fn into_future(self) -> Awaiting<T> {
        self.awaited()
    }
}

#[cfg(test)]
mod tests {
    use crate::outcome::Outcome;
    use crate::promise::Promise;
    use std::time::Duration;

    #[test]
    fn await_resolves_once_the_promise_completes() {
        let promise = Promise::new();
        let deferred = promise.deferred();
        let waiter =
            std::thread::spawn(move || futures::executor::block_on(async move { deferred.await }));
        std::thread::sleep(Duration::from_millis(30));
        promise.set_value(5);
        assert_eq!(waiter.join().unwrap(), Outcome::Success(5));
    }

    #[test]
    fn await_on_a_completed_promise_is_immediate() {
        let promise = Promise::of(Outcome::Success(1));
        let outcome = futures::executor::block_on(promise.deferred().awaited());
        assert_eq!(outcome, Outcome::Success(1));
    }
}
