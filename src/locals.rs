//! Thread-local values that follow callbacks across threads.
//!
//! A computation often carries ambient state (a request id, a trace span)
//! that its continuations expect to see even though they run on whichever
//! thread completes the promise. Each value is stored under its type, like
//! a singleton per thread. [`Snapshot`] captures the registering thread's
//! bundle; `respond` takes one automatically and restores it around the
//! callback, saving and putting back the dispatching thread's own bundle.

use std::any::{Any, TypeId};
use std::cell::RefCell;
use std::collections::HashMap;
use std::mem;
use std::sync::Arc;

type LocalMap = HashMap<TypeId, Arc<dyn Any + Send + Sync>>;

thread_local! {
    static LOCALS: RefCell<LocalMap> = RefCell::new(HashMap::new());
}

/// Store `value` as the calling thread's local of type `T`, returning the
/// previously stored value if any.
pub fn put<T: Send + Sync + 'static>(value: T) -> Option<Arc<T>> {
    LOCALS
        .with(|map| map.borrow_mut().insert(TypeId::of::<T>(), Arc::new(value)))
        .and_then(|previous| previous.downcast::<T>().ok())
}

/// Read the calling thread's local of type `T`.
pub fn get<T: Send + Sync + 'static>() -> Option<Arc<T>> {
    LOCALS
        .with(|map| map.borrow().get(&TypeId::of::<T>()).cloned())
        .and_then(|value| value.downcast::<T>().ok())
}

/// Remove and return the calling thread's local of type `T`.
pub fn take<T: Send + Sync + 'static>() -> Option<Arc<T>> {
    LOCALS
        .with(|map| map.borrow_mut().remove(&TypeId::of::<T>()))
        .and_then(|value| value.downcast::<T>().ok())
}

/// A copy of one thread's locals, restorable around a callback on any other
/// thread.
#[derive(Clone, Default)]
pub struct Snapshot {
    saved: LocalMap,
}

impl Snapshot {
    /// Capture the calling thread's current locals.
    pub fn capture() -> Snapshot {
        Snapshot {
            saved: LOCALS.with(|map| map.borrow().clone()),
        }
    }

    /// Run `f` with this snapshot installed, putting the thread's own locals
    /// back afterwards, also when `f` panics.
    pub fn run<R>(&self, f: impl FnOnce() -> R) -> R {
        let previous =
            LOCALS.with(|map| mem::replace(&mut *map.borrow_mut(), self.saved.clone()));

        struct Restore(Option<LocalMap>);
        impl Drop for Restore {
            fn drop(&mut self) {
                if let Some(previous) = self.0.take() {
                    LOCALS.with(|map| *map.borrow_mut() = previous);
                }
            }
        }
        let _restore = Restore(Some(previous));

        f()
    }
}
