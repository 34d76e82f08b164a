use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

/// Identifies a waiter registered with [`Slot::on_full`] so it can be
/// removed again while the slot is still empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaiterToken(u64);

static NEXT_WAITER: AtomicU64 = AtomicU64::new(0);

type Waiter<T> = Box<dyn FnOnce(T) + Send>;
type NodeRef<T> = Arc<Mutex<Node<T>>>;

enum Node<T> {
    /// Still empty; waiters run in registration order once the value lands.
    Open(Vec<(u64, Waiter<T>)>),
    Full(T),
    /// Forwarded to another node; re-pointed at the root on traversal.
    Link(NodeRef<T>),
}

/// A single-assignment cell with an ordered waiter queue.
///
/// Handles are cheap to clone and alias the same cell. [`Slot::chained`] and
/// [`Slot::merge`] build union-find forwarding trees with path compression,
/// which is what lets iterating combinators link one cell per step without
/// the cost or the memory growing with the chain depth.
///
/// State only transitions empty to full, exactly once. Every waiter receives
/// its own clone of the value, and user callbacks always run outside the
/// cell's lock.
pub struct Slot<T> {
    node: NodeRef<T>,
}

impl<T> Clone for Slot<T> {
    fn clone(&self) -> Self {
        Slot {
            node: self.node.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> Slot<T> {
    /// An empty slot.
    pub fn new() -> Self {
        Slot {
            node: Arc::new(Mutex::new(Node::Open(Vec::new()))),
        }
    }

    /// A slot that already holds `value`.
    pub fn of(value: T) -> Self {
        Slot {
            node: Arc::new(Mutex::new(Node::Full(value))),
        }
    }

    /// A derived slot satisfied by whatever fills this one. The two handles
    /// behave as aliases; the derived node starts as a forwarding pointer
    /// and collapses onto the root the first time it is touched.
    pub fn chained(&self) -> Slot<T> {
        Slot {
            node: Arc::new(Mutex::new(Node::Link(self.node.clone()))),
        }
    }

    /// Walk the forwarding pointers to the terminal node, re-pointing every
    /// visited node directly at it.
    fn root(&self) -> NodeRef<T> {
        let mut current = self.node.clone();
        let mut trail: Vec<NodeRef<T>> = Vec::new();
        loop {
            let next = match &*current.lock().unwrap() {
                Node::Link(parent) => parent.clone(),
                _ => break,
            };
            trail.push(current);
            current = next;
        }
        for visited in trail {
            *visited.lock().unwrap() = Node::Link(current.clone());
        }
        current
    }

    /// Run `f` on the root node, retrying when a concurrent merge turned the
    /// found root into a forwarding pointer before we took its lock.
    fn with_root<R>(&self, f: impl FnOnce(&mut Node<T>) -> R) -> R {
        let mut f = Some(f);
        loop {
            let root = self.root();
            let mut guard = root.lock().unwrap();
            if !matches!(&*guard, Node::Link(_)) {
                return (f.take().unwrap())(&mut *guard);
            }
        }
    }

    /// Store `value` if the slot is still empty and hand it to every queued
    /// waiter, in registration order, outside the lock. Returns false (and
    /// changes nothing) when the slot is already full.
    pub fn fill(&self, value: T) -> bool {
        let drained = self.with_root(|node| match node {
            Node::Open(waiters) => {
                let drained = mem::take(waiters);
                *node = Node::Full(value.clone());
                Some(drained)
            }
            Node::Full(_) => None,
            Node::Link(_) => unreachable!("slot root cannot be a link"),
        });
        let drained = match drained {
            Some(waiters) => waiters,
            None => return false,
        };
        for (_, waiter) in drained {
            let value = value.clone();
            dispatch(Box::new(move || waiter(value)));
        }
        true
    }

    /// Register `k` for the value. When the slot is already full, `k` runs
    /// right away on the calling thread.
    pub fn on_full(&self, k: impl FnOnce(T) + Send + 'static) -> WaiterToken {
        let id = NEXT_WAITER.fetch_add(1, Ordering::Relaxed);
        let mut k = Some(Box::new(k) as Waiter<T>);
        let ready = self.with_root(|node| match node {
            Node::Open(waiters) => {
                waiters.push((id, k.take().unwrap()));
                None
            }
            Node::Full(value) => Some(value.clone()),
            Node::Link(_) => unreachable!("slot root cannot be a link"),
        });
        if let Some(value) = ready {
            let k = k.take().unwrap();
            dispatch(Box::new(move || k(value)));
        }
        WaiterToken(id)
    }

    /// Remove a pending waiter. No effect once the slot is full.
    pub fn cancel_waiter(&self, token: WaiterToken) {
        self.with_root(|node| {
            if let Node::Open(waiters) = node {
                waiters.retain(|(id, _)| *id != token.0);
            }
        });
    }

    /// Non-blocking read.
    pub fn poll(&self) -> Option<T> {
        self.with_root(|node| match node {
            Node::Full(value) => Some(value.clone()),
            _ => None,
        })
    }

    pub fn is_full(&self) -> bool {
        self.with_root(|node| matches!(node, Node::Full(_)))
    }

    /// Block until the value arrives or `timeout` elapses.
    pub fn wait_for(&self, timeout: Duration) -> Option<T> {
        if let Some(value) = self.poll() {
            return Some(value);
        }
        let (tx, rx) = mpsc::channel();
        let token = self.on_full(move |value| {
            let _ = tx.send(value);
        });
        match rx.recv_timeout(timeout) {
            Ok(value) => Some(value),
            Err(_) => {
                self.cancel_waiter(token);
                None
            }
        }
    }

    /// Unify this slot with `other` so both observe the same fill and the
    /// same waiter queue.
    ///
    /// The root that is already full wins; between two empty roots the one
    /// with the longer waiter queue wins and the loser's waiters are
    /// appended after its own. Merging two full slots changes nothing, since
    /// a stored value is never replaced.
    pub fn merge(&self, other: &Slot<T>) {
        loop {
            let a = self.root();
            let b = other.root();
            if Arc::ptr_eq(&a, &b) {
                return;
            }
            // Address order keeps concurrent merges from deadlocking.
            let (first, second) = if Arc::as_ptr(&a) as usize <= Arc::as_ptr(&b) as usize {
                (a, b)
            } else {
                (b, a)
            };
            let mut first_guard = first.lock().unwrap();
            let mut second_guard = second.lock().unwrap();
            if matches!(&*first_guard, Node::Link(_)) || matches!(&*second_guard, Node::Link(_)) {
                // Lost a race with another merge; walk again.
                drop(second_guard);
                drop(first_guard);
                continue;
            }

            enum Action {
                Nothing,
                FillSecond,
                FillFirst,
                FoldIntoFirst,
                FoldIntoSecond,
            }
            let action = match (&*first_guard, &*second_guard) {
                (Node::Full(_), Node::Full(_)) => Action::Nothing,
                (Node::Full(_), Node::Open(_)) => Action::FillSecond,
                (Node::Open(_), Node::Full(_)) => Action::FillFirst,
                (Node::Open(first_waiters), Node::Open(second_waiters)) => {
                    if first_waiters.len() >= second_waiters.len() {
                        Action::FoldIntoFirst
                    } else {
                        Action::FoldIntoSecond
                    }
                }
                _ => unreachable!("slot root cannot be a link"),
            };

            let mut fired: Option<(T, Vec<(u64, Waiter<T>)>)> = None;
            match action {
                Action::Nothing => {}
                Action::FillSecond => {
                    let value = match &*first_guard {
                        Node::Full(value) => value.clone(),
                        _ => unreachable!(),
                    };
                    let waiters =
                        match mem::replace(&mut *second_guard, Node::Link(first.clone())) {
                            Node::Open(waiters) => waiters,
                            _ => unreachable!(),
                        };
                    fired = Some((value, waiters));
                }
                Action::FillFirst => {
                    let value = match &*second_guard {
                        Node::Full(value) => value.clone(),
                        _ => unreachable!(),
                    };
                    let waiters =
                        match mem::replace(&mut *first_guard, Node::Link(second.clone())) {
                            Node::Open(waiters) => waiters,
                            _ => unreachable!(),
                        };
                    fired = Some((value, waiters));
                }
                Action::FoldIntoFirst => {
                    let mut moved = match mem::replace(&mut *second_guard, Node::Link(first.clone()))
                    {
                        Node::Open(waiters) => waiters,
                        _ => unreachable!(),
                    };
                    if let Node::Open(waiters) = &mut *first_guard {
                        waiters.append(&mut moved);
                    }
                }
                Action::FoldIntoSecond => {
                    let mut moved = match mem::replace(&mut *first_guard, Node::Link(second.clone()))
                    {
                        Node::Open(waiters) => waiters,
                        _ => unreachable!(),
                    };
                    if let Node::Open(waiters) = &mut *second_guard {
                        waiters.append(&mut moved);
                    }
                }
            }
            drop(second_guard);
            drop(first_guard);
            if let Some((value, waiters)) = fired {
                for (_, waiter) in waiters {
                    let value = value.clone();
                    dispatch(Box::new(move || waiter(value)));
                }
            }
            return;
        }
    }
}

impl<T: Clone + Send + 'static> Default for Slot<T> {
    fn default() -> Self {
        Slot::new()
    }
}

thread_local! {
    static DISPATCHING: Cell<bool> = Cell::new(false);
    static PENDING: RefCell<VecDeque<Box<dyn FnOnce()>>> = RefCell::new(VecDeque::new());
}

/// Run `task` now, or queue it when this thread is already inside a waiter.
/// Completion chains of arbitrary depth therefore use constant stack: the
/// outermost fill drains the queue one task at a time.
fn dispatch(task: Box<dyn FnOnce()>) {
    if DISPATCHING.with(|flag| flag.get()) {
        PENDING.with(|queue| queue.borrow_mut().push_back(task));
        return;
    }
    DISPATCHING.with(|flag| flag.set(true));

    // Reset the flag even when a callback panics, so the thread keeps
    // dispatching afterwards. Tasks still queued at that point are dropped
    // along with the unwind.
    struct Reset;
    impl Drop for Reset {
        fn drop(&mut self) {
            PENDING.with(|queue| queue.borrow_mut().clear());
            DISPATCHING.with(|flag| flag.set(false));
        }
    }
    let _reset = Reset;

    task();
    loop {
        let next = PENDING.with(|queue| queue.borrow_mut().pop_front());
        match next {
            Some(task) => task(),
            None => break,
        }
    }
}
