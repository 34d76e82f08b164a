use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use super::{RepeatThunk, Thunk, Timer, TimerTask};

/// A deterministic timer for tests.
///
/// Time is logical: it only moves when the test calls [`advance`], and due
/// thunks only run on an explicit [`tick`], in deadline order. Scheduling
/// against this timer goes through [`Timer::now`], so relative deadlines
/// line up with the logical clock exactly.
///
/// Periodic scheduling is not supported and panics.
///
/// [`advance`]: MockTimer::advance
/// [`tick`]: MockTimer::tick
pub struct MockTimer {
    state: Arc<Mutex<MockState>>,
}

struct MockState {
    now: Instant,
    stopped: bool,
    next_seq: u64,
    entries: Vec<MockEntry>,
}

struct MockEntry {
    deadline: Instant,
    seq: u64,
    cancelled: Arc<AtomicBool>,
    thunk: Thunk,
}

impl MockTimer {
    pub fn new() -> Self {
        MockTimer {
            state: Arc::new(Mutex::new(MockState {
                now: Instant::now(),
                stopped: false,
                next_seq: 0,
                entries: Vec::new(),
            })),
        }
    }

    /// Move the logical clock forward by `delta` and run everything that
    /// came due.
    ///
    /// # Panics
    ///
    /// Panics when the timer was stopped.
    pub fn advance(&self, delta: Duration) {
        {
            let mut state = self.state.lock().unwrap();
            assert!(!state.stopped, "pledge: timer is stopped");
            state.now += delta;
        }
        self.tick();
    }

    /// Drop cancelled entries and run the due ones, in deadline order, on
    /// the calling thread. Thunks run outside the timer's lock and their
    /// panics propagate to the caller, where a test can see them.
    ///
    /// # Panics
    ///
    /// Panics when the timer was stopped.
    pub fn tick(&self) {
        tick_state(&self.state, true);
    }

    /// Number of pending entries, cancelled ones excluded.
    pub fn pending(&self) -> usize {
        let state = self.state.lock().unwrap();
        state
            .entries
            .iter()
            .filter(|entry| !entry.cancelled.load(Ordering::SeqCst))
            .count()
    }
}

impl Default for MockTimer {
    fn default() -> Self {
        MockTimer::new()
    }
}

fn tick_state(state: &Arc<Mutex<MockState>>, require_running: bool) {
    let due = {
        let mut guard = state.lock().unwrap();
        if guard.stopped {
            assert!(!require_running, "pledge: timer is stopped");
            return;
        }
        guard
            .entries
            .retain(|entry| !entry.cancelled.load(Ordering::SeqCst));
        let now = guard.now;
        let mut due = Vec::new();
        let mut pending = Vec::new();
        for entry in guard.entries.drain(..) {
            if entry.deadline <= now {
                due.push(entry);
            } else {
                pending.push(entry);
            }
        }
        guard.entries = pending;
        due.sort_by_key(|entry| (entry.deadline, entry.seq));
        due
    };
    for entry in due {
        (entry.thunk)();
    }
}

struct MockTask {
    state: Arc<Mutex<MockState>>,
    cancelled: Arc<AtomicBool>,
}

impl TimerTask for MockTask {
    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        // Tick so observers see the removal right away; on a stopped timer
        // there is nothing left to clean up.
        tick_state(&self.state, false);
    }
}

impl Timer for MockTimer {
    fn now(&self) -> Instant {
        self.state.lock().unwrap().now
    }

    fn schedule_at(&self, deadline: Instant, thunk: Thunk) -> Box<dyn TimerTask> {
        let mut state = self.state.lock().unwrap();
        assert!(!state.stopped, "pledge: timer is stopped");
        let cancelled = Arc::new(AtomicBool::new(false));
        let seq = state.next_seq;
        state.next_seq += 1;
        state.entries.push(MockEntry {
            deadline,
            seq,
            cancelled: cancelled.clone(),
            thunk,
        });
        Box::new(MockTask {
            state: self.state.clone(),
            cancelled,
        })
    }

    fn schedule_periodic(
        &self,
        _first: Instant,
        _period: Duration,
        _thunk: RepeatThunk,
    ) -> Box<dyn TimerTask> {
        panic!("pledge: periodic tasks are not supported by the mock timer");
    }

    fn stop(&self) {
        self.state.lock().unwrap().stopped = true;
    }
}
