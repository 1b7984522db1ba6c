//! Execution roles for the tree model.
//!
//! Two roles exist:
//! - the *consumer* role serializes every tree mutation and every listener
//!   notification;
//! - the *worker* role runs potentially slow structure fetches.
//!
//! ## Module Structure
//!
//! - `serial` - dedicated-thread FIFO queue with delayed tasks (`SerialQueue`)
//! - `pool` - `rayon` backed worker pool (`WorkerPool`)
//! - `manual` - host-pumped queue with a virtual clock (`ManualQueue`)

mod manual;
mod pool;
mod serial;

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

pub use manual::ManualQueue;
pub use pool::WorkerPool;
pub use serial::SerialQueue;

use crate::config::TreeConfig;
use crate::error::{panic_message, Result};

/// The two execution contexts of the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Consumer,
    Worker,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Consumer => "consumer",
            Self::Worker => "worker",
        }
    }
}

/// Predicate checked right before a task runs; `true` drops the task.
pub type Expiry = Arc<dyn Fn() -> bool + Send + Sync>;

/// A unit of work submitted to an [`Executor`].
pub struct Task {
    label: &'static str,
    job: Box<dyn FnOnce() + Send>,
    expired: Option<Expiry>,
}

impl Task {
    pub fn new(label: &'static str, job: impl FnOnce() + Send + 'static) -> Self {
        Self {
            label,
            job: Box::new(job),
            expired: None,
        }
    }

    /// Attaches an expiry predicate.
    pub fn expire_when(mut self, expired: Expiry) -> Self {
        self.expired = Some(expired);
        self
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn is_expired(&self) -> bool {
        self.expired.as_ref().is_some_and(|expired| expired())
    }

    /// Runs the task unless it expired. Panics are logged and swallowed.
    ///
    /// Returns `false` when the task was dropped as expired.
    pub fn run(self) -> bool {
        if self.is_expired() {
            log::debug!("tree task dropped as expired label={}", self.label);
            return false;
        }
        let label = self.label;
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(self.job)) {
            log::error!(
                "tree task panicked label={} error={}",
                label,
                panic_message(payload.as_ref())
            );
        }
        true
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("label", &self.label)
            .field("has_expiry", &self.expired.is_some())
            .finish()
    }
}

/// Runs tasks for one role.
pub trait Executor: Send + Sync {
    /// Queues a task. Never runs it inline, even when called from this executor.
    fn execute(&self, task: Task);

    /// Queues a task to run once `delay` has elapsed.
    fn execute_after(&self, delay: Duration, task: Task);

    /// Returns true when the calling thread is currently running this executor's tasks.
    fn is_current(&self) -> bool;

    /// Number of queued (ready or delayed) tasks that have not finished yet.
    fn pending(&self) -> usize;
}

/// The pair of executors a tree model runs on.
#[derive(Clone)]
pub struct Scheduler {
    consumer: Arc<dyn Executor>,
    worker: Arc<dyn Executor>,
}

impl Scheduler {
    pub fn new(consumer: Arc<dyn Executor>, worker: Arc<dyn Executor>) -> Self {
        Self { consumer, worker }
    }

    /// Builds a consumer thread plus a serial worker queue or a worker pool.
    pub fn from_config(config: &TreeConfig) -> Result<Self> {
        config.validate()?;
        let consumer: Arc<dyn Executor> =
            Arc::new(SerialQueue::spawn(&config.consumer_thread_name)?);
        let worker: Arc<dyn Executor> = if config.worker_threads == 1 {
            Arc::new(SerialQueue::spawn(&config.worker_thread_name)?)
        } else {
            Arc::new(WorkerPool::new(
                &config.worker_thread_name,
                config.worker_threads,
            )?)
        };
        Ok(Self::new(consumer, worker))
    }

    pub fn executor(&self, role: Role) -> &Arc<dyn Executor> {
        match role {
            Role::Consumer => &self.consumer,
            Role::Worker => &self.worker,
        }
    }

    pub fn run_on(&self, role: Role, task: Task) {
        self.executor(role).execute(task);
    }

    pub fn run_on_after(&self, role: Role, delay: Duration, task: Task) {
        self.executor(role).execute_after(delay, task);
    }

    pub fn is_on(&self, role: Role) -> bool {
        self.executor(role).is_current()
    }

    pub fn pending(&self, role: Role) -> usize {
        self.executor(role).pending()
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("consumer_pending", &self.consumer.pending())
            .field("worker_pending", &self.worker.pending())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn expired_task_is_dropped() {
        let ran = Arc::new(AtomicBool::new(false));
        let ran_clone = ran.clone();
        let task = Task::new("expired", move || ran_clone.store(true, Ordering::SeqCst))
            .expire_when(Arc::new(|| true));
        assert!(!task.run());
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[test]
    fn panicking_task_counts_as_complete() {
        let task = Task::new("panics", || panic!("boom"));
        assert!(task.run());
    }

    #[test]
    fn scheduler_routes_by_role() {
        let consumer = Arc::new(ManualQueue::new());
        let worker = Arc::new(ManualQueue::new());
        let scheduler = Scheduler::new(consumer.clone(), worker.clone());
        let count = Arc::new(AtomicUsize::new(0));

        let counter = count.clone();
        scheduler.run_on(
            Role::Worker,
            Task::new("count", move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert_eq!(scheduler.pending(Role::Worker), 1);
        assert_eq!(scheduler.pending(Role::Consumer), 0);

        assert_eq!(consumer.run_pending(), 0);
        assert_eq!(worker.run_pending(), 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
