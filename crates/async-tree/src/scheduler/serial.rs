//! Dedicated-thread serial queue.
//!
//! One thread drains a FIFO of ready tasks in submission order. Delayed tasks
//! wait in a min-heap keyed by deadline and join the FIFO once due.

use std::cell::Cell;
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::{Executor, Task};
use crate::error::{Result, TreeError};

static NEXT_QUEUE_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT_QUEUE: Cell<u64> = const { Cell::new(0) };
}

struct Delayed {
    due: Instant,
    sequence: u64,
    task: Task,
}

impl PartialEq for Delayed {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.sequence == other.sequence
    }
}

impl Eq for Delayed {}

impl PartialOrd for Delayed {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Delayed {
    // Reversed so the BinaryHeap pops the earliest deadline first.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<Task>,
    delayed: BinaryHeap<Delayed>,
    sequence: u64,
    shutdown: bool,
}

impl QueueState {
    fn promote_due(&mut self, now: Instant) {
        while self.delayed.peek().is_some_and(|next| next.due <= now) {
            if let Some(delayed) = self.delayed.pop() {
                self.ready.push_back(delayed.task);
            }
        }
    }
}

struct QueueInner {
    id: u64,
    name: String,
    state: Mutex<QueueState>,
    wake: Condvar,
    pending: AtomicUsize,
}

/// A FIFO executor backed by one named OS thread.
///
/// Dropping the queue stops the thread; tasks still queued are discarded.
pub struct SerialQueue {
    inner: Arc<QueueInner>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl SerialQueue {
    pub fn spawn(name: &str) -> Result<Self> {
        let inner = Arc::new(QueueInner {
            id: NEXT_QUEUE_ID.fetch_add(1, Ordering::Relaxed),
            name: name.to_string(),
            state: Mutex::new(QueueState::default()),
            wake: Condvar::new(),
            pending: AtomicUsize::new(0),
        });

        let thread_inner = inner.clone();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run_loop(thread_inner))
            .map_err(|error| {
                TreeError::Config(format!("unable to spawn queue thread {name}: {error}"))
            })?;

        log::info!("tree queue started name={} id={}", inner.name, inner.id);

        Ok(Self {
            inner,
            thread: Mutex::new(Some(handle)),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Stops the queue thread after the task it is running finishes.
    pub fn shutdown(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
        }
        self.inner.wake.notify_all();

        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            if self.is_current() {
                // Joining our own thread would deadlock; it exits after this task.
                return;
            }
            if handle.join().is_err() {
                log::warn!("tree queue thread panicked name={}", self.inner.name);
            }
        }
    }

    fn push(&self, task: Task, delay: Option<Duration>) {
        let mut state = self.inner.state.lock();
        if state.shutdown {
            log::debug!(
                "tree queue rejected task after shutdown name={} label={}",
                self.inner.name,
                task.label()
            );
            return;
        }
        self.inner.pending.fetch_add(1, Ordering::SeqCst);
        match delay {
            Some(delay) if !delay.is_zero() => {
                state.sequence += 1;
                let sequence = state.sequence;
                state.delayed.push(Delayed {
                    due: Instant::now() + delay,
                    sequence,
                    task,
                });
            }
            _ => state.ready.push_back(task),
        }
        drop(state);
        self.inner.wake.notify_one();
    }
}

fn run_loop(inner: Arc<QueueInner>) {
    CURRENT_QUEUE.with(|current| current.set(inner.id));
    loop {
        let task = {
            let mut state = inner.state.lock();
            loop {
                if state.shutdown {
                    // Dropped tasks may post elsewhere; release the lock first.
                    let ready = std::mem::take(&mut state.ready);
                    let delayed = std::mem::take(&mut state.delayed);
                    inner.pending.store(0, Ordering::SeqCst);
                    drop(state);
                    log::info!(
                        "tree queue stopped name={} dropped_tasks={}",
                        inner.name,
                        ready.len() + delayed.len()
                    );
                    return;
                }
                state.promote_due(Instant::now());
                if let Some(task) = state.ready.pop_front() {
                    break task;
                }
                match state.delayed.peek().map(|next| next.due) {
                    Some(due) => {
                        inner.wake.wait_until(&mut state, due);
                    }
                    None => inner.wake.wait(&mut state),
                }
            }
        };

        task.run();
        inner.pending.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Executor for SerialQueue {
    fn execute(&self, task: Task) {
        self.push(task, None);
    }

    fn execute_after(&self, delay: Duration, task: Task) {
        self.push(task, Some(delay));
    }

    fn is_current(&self) -> bool {
        CURRENT_QUEUE.with(|current| current.get() == self.inner.id)
    }

    fn pending(&self) -> usize {
        self.inner.pending.load(Ordering::SeqCst)
    }
}

impl Drop for SerialQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for SerialQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialQueue")
            .field("name", &self.inner.name)
            .field("pending", &self.pending())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;

    #[test]
    fn runs_tasks_in_submission_order() {
        let queue = SerialQueue::spawn("serial-order").expect("queue should start");
        let (tx, rx) = mpsc::channel();
        for index in 0..5 {
            let tx = tx.clone();
            queue.execute(Task::new("order", move || {
                tx.send(index).expect("receiver alive");
            }));
        }
        let seen: Vec<i32> = (0..5)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).expect("task ran"))
            .collect();
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn submission_from_own_thread_is_deferred() {
        let queue = Arc::new(SerialQueue::spawn("serial-defer").expect("queue should start"));
        let (tx, rx) = mpsc::channel();

        let inner_queue = queue.clone();
        let outer_tx = tx.clone();
        queue.execute(Task::new("outer", move || {
            assert!(inner_queue.is_current());
            let inner_tx = outer_tx.clone();
            inner_queue.execute(Task::new("inner", move || {
                inner_tx.send("inner").expect("receiver alive");
            }));
            outer_tx.send("outer-end").expect("receiver alive");
        }));

        let first = rx.recv_timeout(Duration::from_secs(5)).expect("outer ran");
        let second = rx.recv_timeout(Duration::from_secs(5)).expect("inner ran");
        assert_eq!(first, "outer-end");
        assert_eq!(second, "inner");
        assert!(!queue.is_current());
    }

    #[test]
    fn delayed_task_runs_after_ready_ones() {
        let queue = SerialQueue::spawn("serial-delay").expect("queue should start");
        let (tx, rx) = mpsc::channel();

        let delayed_tx = tx.clone();
        queue.execute_after(
            Duration::from_millis(30),
            Task::new("late", move || {
                delayed_tx.send("late").expect("receiver alive");
            }),
        );
        queue.execute(Task::new("now", move || {
            tx.send("now").expect("receiver alive");
        }));

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "now");
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "late");
    }

    #[test]
    fn panic_does_not_stop_the_loop() {
        let queue = SerialQueue::spawn("serial-panic").expect("queue should start");
        let (tx, rx) = mpsc::channel();
        queue.execute(Task::new("panics", || panic!("task failure")));
        queue.execute(Task::new("after", move || {
            tx.send(()).expect("receiver alive");
        }));
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
    }
}
