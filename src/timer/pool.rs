use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::runtime::{Builder, Runtime};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::{DeadTask, RepeatThunk, Thunk, Timer, TimerTask};
use crate::fault::catching;

/// A timer backed by a multi-thread tokio runtime, so firings are
/// concurrent and a long-running thunk does not hold back the rest.
///
/// Periodic tasks are fixed-rate, with ticks missed while a thunk runs
/// skipped rather than replayed in a burst.
pub struct PoolTimer {
    runtime: Mutex<Option<Runtime>>,
}

impl PoolTimer {
    /// A pool with `threads` worker threads.
    pub fn new(threads: usize) -> Self {
        let runtime = Builder::new_multi_thread()
            .worker_threads(threads)
            .thread_name("pledge-pool-timer")
            .enable_time()
            .build()
            .expect("pledge: could not build the timer runtime");
        PoolTimer {
            runtime: Mutex::new(Some(runtime)),
        }
    }

    fn spawn<F>(&self, future: F) -> Box<dyn TimerTask>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let guard = self.runtime.lock().unwrap();
        match &*guard {
            Some(runtime) => Box::new(PoolTask {
                handle: runtime.spawn(future),
            }),
            None => {
                log::warn!("pledge: task scheduled on a stopped timer; dropping it");
                Box::new(DeadTask)
            }
        }
    }
}

struct PoolTask {
    handle: JoinHandle<()>,
}

impl TimerTask for PoolTask {
    fn cancel(&self) {
        self.handle.abort();
    }
}

impl Timer for PoolTimer {
    fn schedule_at(&self, deadline: Instant, thunk: Thunk) -> Box<dyn TimerTask> {
        self.spawn(async move {
            tokio::time::sleep_until(deadline.into()).await;
            if let Err(fault) = catching(thunk) {
                log::warn!("pledge: timer task panicked: {}", fault);
            }
        })
    }

    fn schedule_periodic(
        &self,
        first: Instant,
        period: Duration,
        mut thunk: RepeatThunk,
    ) -> Box<dyn TimerTask> {
        self.spawn(async move {
            let mut ticks = tokio::time::interval_at(first.into(), period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticks.tick().await;
                if let Err(fault) = catching(|| thunk()) {
                    log::warn!("pledge: periodic timer task panicked: {}", fault);
                }
            }
        })
    }

    fn stop(&self) {
        if let Some(runtime) = self.runtime.lock().unwrap().take() {
            // Safe even when invoked from one of the pool's own threads.
            runtime.shutdown_background();
        }
    }
}

impl Drop for PoolTimer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::Outcome;
    use crate::timer::TimerExt;
    use std::sync::mpsc;

    #[test]
    fn defers_a_computation() {
        let timer = PoolTimer::new(2);
        let deferred = timer.defer(Duration::from_millis(20), || 40 + 2);
        assert_eq!(
            deferred.result(Duration::from_secs(2)),
            Outcome::Success(42)
        );
        timer.stop();
    }

    #[test]
    fn long_thunks_do_not_block_other_firings() {
        let timer = PoolTimer::new(2);
        let (slow_tx, slow_rx) = mpsc::channel();
        let (fast_tx, fast_rx) = mpsc::channel();
        timer.schedule_after(
            Duration::from_millis(5),
            Box::new(move || {
                std::thread::sleep(Duration::from_millis(400));
                let _ = slow_tx.send(());
            }),
        );
        timer.schedule_after(
            Duration::from_millis(10),
            Box::new(move || {
                let _ = fast_tx.send(());
            }),
        );
        // The fast task lands while the slow one is still sleeping.
        assert!(fast_rx.recv_timeout(Duration::from_millis(300)).is_ok());
        assert!(slow_rx.recv_timeout(Duration::from_secs(2)).is_ok());
        timer.stop();
    }

    #[test]
    fn scheduling_after_stop_returns_a_dead_task() {
        let timer = PoolTimer::new(1);
        timer.stop();
        let (tx, rx) = mpsc::channel();
        timer.schedule_after(
            Duration::from_millis(1),
            Box::new(move || {
                tx.send(()).unwrap();
            }),
        );
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }
}
