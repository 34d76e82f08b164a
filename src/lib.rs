//! Composable futures with explicit completion, cooperative cancellation,
//! and pluggable timers.
//!
//! A [`Promise`] is the writable half of a computation and a [`Deferred`]
//! the read half. Exactly one completion wins, every registered callback
//! runs exactly once with the [`Outcome`], and combinators derive new
//! futures that stay connected to their sources through cancellation
//! edges. Chained stages share storage through a union-find cell
//! ([`Slot`]), so iterated composition costs a constant amount of memory
//! per step no matter how deep the chain grows.
//!
//! Deadlines and deferred work go through the [`timer`] module; a
//! [`Deferred`] can also be `.await`ed on any standard executor.
//!
//! ```
//! use pledge::prelude::*;
//!
//! let promise = Promise::new();
//! let doubled = promise.deferred().map(|n: i32| n * 2);
//! promise.set_value(21);
//! assert_eq!(doubled.poll(), Some(Outcome::Success(42)));
//! ```

pub use cancel::Cancellable;
pub use deferred::Deferred;
pub use fault::Fault;
pub use interop::Awaiting;
pub use outcome::Outcome;
pub use promise::Promise;
pub use slot::{Slot, WaiterToken};

mod cancel;
pub mod deferred;
mod fault;
mod interop;
pub mod locals;
mod outcome;
mod promise;
mod slot;
pub mod timer;

/// The most useful items in one import.
pub mod prelude {
    pub use crate::deferred::{collect, join_all, select_all, times, while_do, Deferred};
    pub use crate::timer::{MockTimer, NullTimer, Timer, TimerExt, TimerTask};
    pub use crate::{Cancellable, Fault, Outcome, Promise};
}
