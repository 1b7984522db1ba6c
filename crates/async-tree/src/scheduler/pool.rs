//! Worker pool backed by `rayon`.

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::{Executor, SerialQueue, Task};
use crate::error::{Result, TreeError};

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT_POOL: Cell<u64> = const { Cell::new(0) };
}

struct PoolInner {
    id: u64,
    name: String,
    pool: rayon::ThreadPool,
    pending: AtomicUsize,
}

/// Runs worker tasks concurrently on a fixed-size thread pool.
///
/// Delayed tasks are parked on a lazily started timer lane and handed to the
/// pool once due, so no pool thread ever sleeps.
pub struct WorkerPool {
    inner: Arc<PoolInner>,
    timer: Mutex<Option<SerialQueue>>,
}

impl WorkerPool {
    pub fn new(name: &str, threads: usize) -> Result<Self> {
        let id = NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed);
        let thread_prefix = name.to_string();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(move |index| format!("{thread_prefix}-{index}"))
            .start_handler(move |_| CURRENT_POOL.with(|current| current.set(id)))
            .build()
            .map_err(|error| {
                TreeError::Config(format!("unable to build worker pool {name}: {error}"))
            })?;

        log::info!("tree worker pool started name={} threads={}", name, threads);

        Ok(Self {
            inner: Arc::new(PoolInner {
                id,
                name: name.to_string(),
                pool,
                pending: AtomicUsize::new(0),
            }),
            timer: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    fn schedule_delayed(&self, delay: Duration, task: Task) {
        let mut timer = self.timer.lock();
        if timer.is_none() {
            match SerialQueue::spawn(&format!("{}-timer", self.inner.name)) {
                Ok(queue) => *timer = Some(queue),
                Err(error) => {
                    log::warn!(
                        "tree worker pool timer unavailable name={} error={}",
                        self.inner.name,
                        error
                    );
                    drop(timer);
                    spawn_now(&self.inner, task);
                    return;
                }
            }
        }
        if let Some(queue) = timer.as_ref() {
            let inner = self.inner.clone();
            queue.execute_after(
                delay,
                Task::new("pool-timer", move || spawn_now(&inner, task)),
            );
        }
    }
}

fn spawn_now(inner: &Arc<PoolInner>, task: Task) {
    let owner = inner.clone();
    inner.pool.spawn(move || {
        task.run();
        owner.pending.fetch_sub(1, Ordering::SeqCst);
    });
}

impl Executor for WorkerPool {
    fn execute(&self, task: Task) {
        self.inner.pending.fetch_add(1, Ordering::SeqCst);
        spawn_now(&self.inner, task);
    }

    fn execute_after(&self, delay: Duration, task: Task) {
        self.inner.pending.fetch_add(1, Ordering::SeqCst);
        if delay.is_zero() {
            spawn_now(&self.inner, task);
        } else {
            self.schedule_delayed(delay, task);
        }
    }

    fn is_current(&self) -> bool {
        CURRENT_POOL.with(|current| current.get() == self.inner.id)
    }

    fn pending(&self) -> usize {
        self.inner.pending.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
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
    fn runs_tasks_on_pool_threads() {
        let pool = Arc::new(WorkerPool::new("pool-test", 2).expect("pool should build"));
        let (tx, rx) = mpsc::channel();
        for _ in 0..4 {
            let tx = tx.clone();
            let handle = pool.clone();
            pool.execute(Task::new("is-current", move || {
                tx.send(handle.is_current()).expect("receiver alive");
            }));
        }
        for _ in 0..4 {
            assert!(rx.recv_timeout(Duration::from_secs(5)).expect("task ran"));
        }
        assert!(!pool.is_current());
    }

    #[test]
    fn delayed_task_reaches_the_pool() {
        let pool = WorkerPool::new("pool-delay", 2).expect("pool should build");
        let (tx, rx) = mpsc::channel();
        pool.execute_after(
            Duration::from_millis(20),
            Task::new("delayed", move || {
                tx.send(()).expect("receiver alive");
            }),
        );
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
    }
}
