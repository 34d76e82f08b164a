use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use super::{DeadTask, RepeatThunk, Thunk, Timer, TimerTask};

type TimerFactory = Box<dyn Fn() -> Arc<dyn Timer> + Send + Sync>;

/// Shares one lazily built timer between several owners.
///
/// The underlying timer is constructed on the 0-to-1 acquisition and
/// stopped and dropped on the 1-to-0 stop, never both at once. A stop
/// without a matching acquire is a logged no-op.
pub struct RefCountedTimer {
    factory: TimerFactory,
    state: Mutex<RefCountState>,
}

struct RefCountState {
    count: usize,
    underlying: Option<Arc<dyn Timer>>,
}

impl RefCountedTimer {
    pub fn new(factory: impl Fn() -> Arc<dyn Timer> + Send + Sync + 'static) -> Self {
        RefCountedTimer {
            factory: Box::new(factory),
            state: Mutex::new(RefCountState {
                count: 0,
                underlying: None,
            }),
        }
    }

    /// Register interest. The first acquisition builds the underlying
    /// timer; later ones only bump the count.
    pub fn acquire(&self) {
        let mut state = self.state.lock().unwrap();
        state.count += 1;
        if state.count == 1 {
            state.underlying = Some((self.factory)());
        }
    }

    fn underlying(&self) -> Option<Arc<dyn Timer>> {
        self.state.lock().unwrap().underlying.clone()
    }
}

impl Timer for RefCountedTimer {
    fn now(&self) -> Instant {
        self.underlying().map(|t| t.now()).unwrap_or_else(Instant::now)
    }

    fn schedule_at(&self, deadline: Instant, thunk: Thunk) -> Box<dyn TimerTask> {
        match self.underlying() {
            Some(timer) => timer.schedule_at(deadline, thunk),
            None => {
                log::warn!("pledge: scheduling on a timer that was never acquired");
                Box::new(DeadTask)
            }
        }
    }

    fn schedule_periodic(
        &self,
        first: Instant,
        period: Duration,
        thunk: RepeatThunk,
    ) -> Box<dyn TimerTask> {
        match self.underlying() {
            Some(timer) => timer.schedule_periodic(first, period, thunk),
            None => {
                log::warn!("pledge: scheduling on a timer that was never acquired");
                Box::new(DeadTask)
            }
        }
    }

    fn stop(&self) {
        let released = {
            let mut state = self.state.lock().unwrap();
            if state.count == 0 {
                log::warn!("pledge: timer stop without a matching acquire; ignoring");
                None
            } else {
                state.count -= 1;
                if state.count == 0 {
                    state.underlying.take()
                } else {
                    None
                }
            }
        };
        if let Some(timer) = released {
            timer.stop();
        }
    }
}

/// Proxies scheduling to another timer but dispatches `stop` on an
/// auxiliary thread, so code running on the timer's own threads can stop it
/// without joining itself.
pub struct DetachedStopTimer {
    underlying: Arc<dyn Timer>,
}

impl DetachedStopTimer {
    pub fn new(underlying: Arc<dyn Timer>) -> Self {
        DetachedStopTimer { underlying }
    }
}

impl Timer for DetachedStopTimer {
    fn now(&self) -> Instant {
        self.underlying.now()
    }

    fn schedule_at(&self, deadline: Instant, thunk: Thunk) -> Box<dyn TimerTask> {
        self.underlying.schedule_at(deadline, thunk)
    }

    fn schedule_periodic(
        &self,
        first: Instant,
        period: Duration,
        thunk: RepeatThunk,
    ) -> Box<dyn TimerTask> {
        self.underlying.schedule_periodic(first, period, thunk)
    }

    fn stop(&self) {
        let underlying = self.underlying.clone();
        thread::Builder::new()
            .name("pledge-timer-stop".into())
            .spawn(move || underlying.stop())
            .expect("pledge: could not spawn the stop thread");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timer::{MockTimer, TimerExt};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    fn counting_factory() -> (Arc<AtomicUsize>, impl Fn() -> Arc<dyn Timer> + Send + Sync) {
        let built = Arc::new(AtomicUsize::new(0));
        let observer = built.clone();
        let factory = move || {
            observer.fetch_add(1, Ordering::SeqCst);
            Arc::new(MockTimer::new()) as Arc<dyn Timer>
        };
        (built, factory)
    }

    #[test]
    fn builds_on_first_acquire_and_tears_down_on_last_stop() {
        let (built, factory) = counting_factory();
        let timer = RefCountedTimer::new(factory);
        assert_eq!(built.load(Ordering::SeqCst), 0);
        timer.acquire();
        timer.acquire();
        assert_eq!(built.load(Ordering::SeqCst), 1);
        timer.stop();
        assert!(timer.underlying().is_some());
        timer.stop();
        assert!(timer.underlying().is_none());
        // A fresh acquisition builds a new underlying timer.
        timer.acquire();
        assert_eq!(built.load(Ordering::SeqCst), 2);
        timer.stop();
    }

    #[test]
    fn unbalanced_stop_is_a_no_op() {
        let (built, factory) = counting_factory();
        let timer = RefCountedTimer::new(factory);
        timer.stop();
        timer.acquire();
        assert_eq!(built.load(Ordering::SeqCst), 1);
        timer.stop();
    }

    #[test]
    fn unacquired_scheduling_returns_a_dead_task() {
        let (_built, factory) = counting_factory();
        let timer = RefCountedTimer::new(factory);
        let task = timer.schedule_after(Duration::from_millis(1), Box::new(|| {}));
        task.cancel();
    }

    #[test]
    fn detached_stop_can_be_called_from_a_timer_thread() {
        use crate::timer::ThreadTimer;

        let timer = Arc::new(DetachedStopTimer::new(Arc::new(ThreadTimer::new())));
        let (tx, rx) = mpsc::channel();
        let inner = timer.clone();
        timer.schedule_after(
            Duration::from_millis(10),
            Box::new(move || {
                // Runs on the worker thread; a plain stop would self-join.
                inner.stop();
                tx.send(()).unwrap();
            }),
        );
        assert!(rx.recv_timeout(Duration::from_secs(2)).is_ok());
    }
}
