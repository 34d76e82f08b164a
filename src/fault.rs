use std::any::Any;
use std::error::Error as StdError;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// The failure value carried by [`Outcome::Failure`](crate::Outcome::Failure).
///
/// Faults are cloneable so that one failure can be delivered to every
/// registered waiter. Application errors are kept behind an `Arc` and
/// preserved verbatim.
#[derive(Debug, Clone, Error)]
pub enum Fault {
    /// A deadline elapsed before the computation produced a result.
    #[error("computation timed out after {0:?}")]
    Timeout(Duration),

    /// A `filter` predicate rejected the value.
    #[error("value did not satisfy the predicate")]
    PredicateFailed,

    /// A user-supplied closure panicked; the payload message is preserved.
    #[error("computation panicked: {0}")]
    Panicked(String),

    /// A plain textual failure.
    #[error("{0}")]
    Message(String),

    /// An arbitrary application error supplied by the producer.
    #[error("{0}")]
    App(Arc<dyn StdError + Send + Sync + 'static>),
}

impl Fault {
    /// Wrap an application error.
    pub fn app<E>(err: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Fault::App(Arc::new(err))
    }

    /// A failure described by a message alone.
    pub fn message<S: Into<String>>(msg: S) -> Self {
        Fault::Message(msg.into())
    }
}

impl PartialEq for Fault {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Fault::Timeout(a), Fault::Timeout(b)) => a == b,
            (Fault::PredicateFailed, Fault::PredicateFailed) => true,
            (Fault::Panicked(a), Fault::Panicked(b)) => a == b,
            (Fault::Message(a), Fault::Message(b)) => a == b,
            // Application errors are not required to be comparable, so two
            // faults are equal only when they share the same instance.
            (Fault::App(a), Fault::App(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// Run `f`, converting a panic into a [`Fault::Panicked`] that carries the
/// payload message.
pub(crate) fn catching<T>(f: impl FnOnce() -> T) -> Result<T, Fault> {
    catch_unwind(AssertUnwindSafe(f))
        .map_err(|payload| Fault::Panicked(downcast_panic_payload(&payload)))
}

fn downcast_panic_payload(payload: &Box<dyn Any + Send>) -> String {
    payload
        .downcast_ref::<&'static str>()
        .cloned()
        .map(String::from)
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| String::from("Box<Any>"))
}
