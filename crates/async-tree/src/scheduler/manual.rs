//! Host-pumped executor.
//!
//! `ManualQueue` never owns a thread: whoever calls [`ManualQueue::run_pending`]
//! becomes the executing thread for the duration of the call. This lets a UI
//! event loop act as the consumer role, and gives tests full control over
//! interleavings. Delays run against a virtual clock moved by
//! [`ManualQueue::advance`].

use std::cell::Cell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use super::{Executor, Task};

static NEXT_MANUAL_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT_MANUAL: Cell<u64> = const { Cell::new(0) };
}

#[derive(Default)]
struct ManualState {
    ready: VecDeque<Task>,
    delayed: Vec<(Duration, u64, Task)>,
    now: Duration,
    sequence: u64,
}

impl ManualState {
    fn promote_due(&mut self) {
        if self.delayed.is_empty() {
            return;
        }
        self.delayed.sort_by_key(|(due, sequence, _)| (*due, *sequence));
        let now = self.now;
        let split = self.delayed.partition_point(|(due, _, _)| *due <= now);
        for (_, _, task) in self.delayed.drain(..split) {
            self.ready.push_back(task);
        }
    }
}

pub struct ManualQueue {
    id: u64,
    state: Mutex<ManualState>,
    pending: AtomicUsize,
}

impl ManualQueue {
    pub fn new() -> Self {
        Self {
            id: NEXT_MANUAL_ID.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(ManualState::default()),
            pending: AtomicUsize::new(0),
        }
    }

    /// Runs the oldest ready task. Returns false when nothing was ready.
    pub fn run_one(&self) -> bool {
        if self.is_current() {
            log::warn!("manual queue drained re-entrantly; ignoring nested call");
            return false;
        }
        let task = {
            let mut state = self.state.lock();
            state.promote_due();
            state.ready.pop_front()
        };
        let Some(task) = task else {
            return false;
        };

        let previous = CURRENT_MANUAL.with(|current| current.replace(self.id));
        task.run();
        CURRENT_MANUAL.with(|current| current.set(previous));
        self.pending.fetch_sub(1, Ordering::SeqCst);
        true
    }

    /// Runs ready tasks, including ones queued while draining, until none remain.
    pub fn run_pending(&self) -> usize {
        let mut executed = 0;
        while self.run_one() {
            executed += 1;
        }
        executed
    }

    /// Moves the virtual clock forward, making delayed tasks due.
    pub fn advance(&self, by: Duration) {
        let mut state = self.state.lock();
        state.now += by;
        state.promote_due();
    }

    /// Number of tasks that are ready to run now.
    pub fn ready(&self) -> usize {
        self.state.lock().ready.len()
    }
}

impl Default for ManualQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Executor for ManualQueue {
    fn execute(&self, task: Task) {
        self.pending.fetch_add(1, Ordering::SeqCst);
        self.state.lock().ready.push_back(task);
    }

    fn execute_after(&self, delay: Duration, task: Task) {
        self.pending.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        if delay.is_zero() {
            state.ready.push_back(task);
            return;
        }
        state.sequence += 1;
        let due = state.now + delay;
        let sequence = state.sequence;
        state.delayed.push((due, sequence, task));
    }

    fn is_current(&self) -> bool {
        CURRENT_MANUAL.with(|current| current.get() == self.id)
    }

    fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for ManualQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManualQueue")
            .field("id", &self.id)
            .field("pending", &self.pending())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn recorder() -> (Arc<Mutex<Vec<&'static str>>>, impl Fn(&'static str) -> Task) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        let make = move |name: &'static str| {
            let sink = sink.clone();
            Task::new("record", move || sink.lock().push(name))
        };
        (log, make)
    }

    #[test]
    fn drains_in_order_including_nested_submissions() {
        let queue = Arc::new(ManualQueue::new());
        let (log, make) = recorder();
        let nested = make("nested");
        let inner = queue.clone();
        let outer_log = log.clone();
        queue.execute(Task::new("outer", move || {
            assert!(inner.is_current());
            inner.execute(nested);
            outer_log.lock().push("outer");
        }));
        queue.execute(make("second"));

        assert_eq!(queue.run_pending(), 3);
        assert_eq!(*log.lock(), vec!["outer", "second", "nested"]);
        assert_eq!(queue.pending(), 0);
        assert!(!queue.is_current());
    }

    #[test]
    fn delayed_tasks_wait_for_virtual_clock() {
        let queue = ManualQueue::new();
        let (log, make) = recorder();
        queue.execute_after(Duration::from_millis(100), make("late"));
        queue.execute_after(Duration::from_millis(50), make("early"));

        assert_eq!(queue.run_pending(), 0);
        assert_eq!(queue.pending(), 2);

        queue.advance(Duration::from_millis(60));
        assert_eq!(queue.run_pending(), 1);
        queue.advance(Duration::from_millis(60));
        assert_eq!(queue.run_pending(), 1);
        assert_eq!(*log.lock(), vec!["early", "late"]);
    }
}
