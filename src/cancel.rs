/// A capability whose work can be called off.
///
/// Cancellation is a cooperative one-shot signal. Raising it never completes
/// a result by itself; it only notifies whoever registered interest, and it
/// is up to a producer, a combinator or a timer to decide whether to turn
/// the signal into a failed result. Edges between cancellables ("cancelling
/// A also cancels B") are plain waiters on the signal, so cycles cost
/// nothing worse than redundant calls into an already raised signal.
pub trait Cancellable {
    /// Raise the cancellation signal. Idempotent; racing with completion is
    /// safe.
    fn cancel(&self);

    /// Whether the signal has been raised.
    fn is_cancelled(&self) -> bool;

    /// Run `thunk` when the signal is raised; immediately, on the calling
    /// thread, when it already has been.
    fn on_cancel(&self, thunk: Box<dyn FnOnce() + Send>);

    /// When this is cancelled, cancel `other` as well. The edge is
    /// directional; it is not mirrored.
    fn link_to<C>(&self, other: C)
    where
        C: Cancellable + Send + 'static,
        Self: Sized,
    {
        self.on_cancel(Box::new(move || other.cancel()));
    }
}
