use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use thread_local_panic_hook::set_hook;

use super::{DeadTask, RepeatThunk, Thunk, Timer, TimerTask};
use crate::fault::catching;

enum Work {
    Once(Option<Thunk>),
    Every(RepeatThunk),
}

struct Entry {
    deadline: Instant,
    seq: u64,
    period: Option<Duration>,
    cancelled: Arc<AtomicBool>,
    work: Work,
}

// Earliest deadline first out of the heap; FIFO between equal deadlines.
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (self.deadline, self.seq)
            .cmp(&(other.deadline, other.seq))
            .reverse()
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Entry {}

struct Queue {
    heap: BinaryHeap<Entry>,
    next_seq: u64,
    stopped: bool,
}

struct Shared {
    queue: Mutex<Queue>,
    wakeup: Condvar,
}

/// A timer backed by a single worker thread and a deadline-ordered queue.
///
/// Periodic tasks are fixed-delay: the next fire is scheduled one period
/// after the previous fire started, so a slow thunk pushes later fires back
/// instead of letting them bunch up. One long-running thunk does delay
/// everything else on this timer; use [`PoolTimer`](super::PoolTimer) when
/// firings must be concurrent.
pub struct ThreadTimer {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_id: ThreadId,
}

impl ThreadTimer {
    pub fn new() -> Self {
        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue {
                heap: BinaryHeap::new(),
                next_seq: 0,
                stopped: false,
            }),
            wakeup: Condvar::new(),
        });
        let worker_shared = shared.clone();
        let handle = thread::Builder::new()
            .name("pledge-timer".into())
            .spawn(move || worker_loop(worker_shared))
            .expect("pledge: could not spawn the timer worker thread");
        let worker_id = handle.thread().id();
        ThreadTimer {
            shared,
            worker: Mutex::new(Some(handle)),
            worker_id,
        }
    }

    fn schedule(
        &self,
        deadline: Instant,
        period: Option<Duration>,
        work: Work,
    ) -> Box<dyn TimerTask> {
        let cancelled = Arc::new(AtomicBool::new(false));
        let mut queue = self.shared.queue.lock().unwrap();
        if queue.stopped {
            log::warn!("pledge: task scheduled on a stopped timer; dropping it");
            return Box::new(DeadTask);
        }
        let seq = queue.next_seq;
        queue.next_seq += 1;
        queue.heap.push(Entry {
            deadline,
            seq,
            period,
            cancelled: cancelled.clone(),
            work,
        });
        drop(queue);
        self.shared.wakeup.notify_one();
        Box::new(QueuedTask {
            cancelled,
            shared: self.shared.clone(),
        })
    }
}

impl Timer for ThreadTimer {
    fn schedule_at(&self, deadline: Instant, thunk: Thunk) -> Box<dyn TimerTask> {
        self.schedule(deadline, None, Work::Once(Some(thunk)))
    }

    fn schedule_periodic(
        &self,
        first: Instant,
        period: Duration,
        thunk: RepeatThunk,
    ) -> Box<dyn TimerTask> {
        self.schedule(first, Some(period), Work::Every(thunk))
    }

    fn stop(&self) {
        {
            let mut queue = self.shared.queue.lock().unwrap();
            queue.stopped = true;
            queue.heap.clear();
        }
        self.shared.wakeup.notify_one();
        // Joining from the worker itself would deadlock; there the flag is
        // enough, since the loop re-checks it before sleeping again.
        if thread::current().id() != self.worker_id {
            if let Some(handle) = self.worker.lock().unwrap().take() {
                let _ = handle.join();
            }
        }
    }
}

impl Default for ThreadTimer {
    fn default() -> Self {
        ThreadTimer::new()
    }
}

impl Drop for ThreadTimer {
    fn drop(&mut self) {
        self.stop();
    }
}

struct QueuedTask {
    cancelled: Arc<AtomicBool>,
    shared: Arc<Shared>,
}

impl TimerTask for QueuedTask {
    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        // Wake the worker so a cancelled head entry is discarded promptly
        // instead of being slept on.
        self.shared.wakeup.notify_one();
    }
}

fn worker_loop(shared: Arc<Shared>) {
    // Panicking thunks are captured below; the per-thread hook keeps them
    // from also spewing through the default hook.
    set_hook(Box::new(|_| {}));

    enum Step {
        Idle,
        Sleep(Duration),
        Discard,
        Fire,
    }

    let mut queue = shared.queue.lock().unwrap();
    loop {
        if queue.stopped {
            return;
        }
        let step = match queue.heap.peek() {
            None => Step::Idle,
            Some(entry) if entry.cancelled.load(Ordering::SeqCst) => Step::Discard,
            Some(entry) => {
                let now = Instant::now();
                if entry.deadline <= now {
                    Step::Fire
                } else {
                    Step::Sleep(entry.deadline - now)
                }
            }
        };
        match step {
            Step::Discard => {
                queue.heap.pop();
            }
            Step::Fire => {
                let mut entry = queue.heap.pop().expect("pledge: fireable entry vanished");
                drop(queue);
                let started = Instant::now();
                let rearm = run_entry(&mut entry);
                queue = shared.queue.lock().unwrap();
                if rearm && !queue.stopped && !entry.cancelled.load(Ordering::SeqCst) {
                    if let Some(period) = entry.period {
                        entry.deadline = started + period;
                        entry.seq = queue.next_seq;
                        queue.next_seq += 1;
                        queue.heap.push(entry);
                    }
                }
            }
            Step::Idle => {
                queue = shared.wakeup.wait(queue).unwrap();
            }
            Step::Sleep(timeout) => {
                queue = shared.wakeup.wait_timeout(queue, timeout).unwrap().0;
            }
        }
    }
}

fn run_entry(entry: &mut Entry) -> bool {
    match &mut entry.work {
        Work::Once(thunk) => {
            if let Some(thunk) = thunk.take() {
                if let Err(fault) = catching(thunk) {
                    log::warn!("pledge: timer task panicked: {}", fault);
                }
            }
            false
        }
        Work::Every(thunk) => {
            if let Err(fault) = catching(|| thunk()) {
                log::warn!("pledge: periodic timer task panicked: {}", fault);
            }
            entry.period.is_some()
        }
    }
}
