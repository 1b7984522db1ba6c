//! Per-node single-flight command queue.
//!
//! Every fetch bound to a node goes through its `CommandQueue`. At most one
//! command is active at a time; later requests either attach to it or, when
//! they ask for a broader refresh, supersede it and absorb its callers.
//!
//! ## Generations
//!
//! Commands carry a generation drawn from one process-wide counter, so a
//! result for an evicted node can never be mistaken for a result of a node
//! that was later recreated for an equal object. Before a result is applied
//! the owner checks [`CommandQueue::is_active`]; anything else is obsolete.

use std::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;
use parking_lot::Mutex;

use crate::error::{Result, TreeError};
use crate::promise::{self, Pending, Waiter};

static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

bitflags! {
    /// What a fetch has to refresh.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Refresh: u8 {
        /// Materialize the node's children.
        const CHILDREN = 1;
        /// Refetch even when children are already loaded.
        const RELOAD = 1 << 1;
        /// Also reload every loaded descendant.
        const DEEP = 1 << 2;
    }
}

impl Refresh {
    /// Flags used by invalidation.
    pub fn reload(deep: bool) -> Self {
        let refresh = Self::CHILDREN | Self::RELOAD;
        if deep {
            refresh | Self::DEEP
        } else {
            refresh
        }
    }

    /// A request is covered when every flag it asks for is already requested.
    pub fn covers(self, request: Refresh) -> bool {
        self.contains(request)
    }
}

/// One unit of fetch work bound to a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Command {
    generation: u64,
    refresh: Refresh,
}

impl Command {
    fn next(refresh: Refresh) -> Self {
        Self {
            generation: NEXT_GENERATION.fetch_add(1, Ordering::Relaxed),
            refresh,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn refresh(&self) -> Refresh {
        self.refresh
    }
}

struct Active<R> {
    command: Command,
    waiters: Vec<Waiter<R>>,
}

struct QueueState<R> {
    closed: bool,
    active: Option<Active<R>>,
}

pub(crate) struct CommandQueue<R> {
    state: Mutex<QueueState<R>>,
}

impl<R> CommandQueue<R> {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                closed: false,
                active: None,
            }),
        }
    }

    /// Returns a future for `refresh`, calling `submit` only when a new
    /// command has to run. `submit` runs after the queue lock is released.
    pub(crate) fn promise(&self, refresh: Refresh, submit: impl FnOnce(Command)) -> Pending<R> {
        let (waiter, pending) = promise::channel();
        if let Some(command) = self.enqueue(refresh, waiter) {
            submit(command);
        }
        pending
    }

    /// Attaches `waiter` to the active command or creates a new one.
    ///
    /// Returns the command the caller has to submit, if any. A closed queue
    /// rejects the waiter immediately.
    pub(crate) fn enqueue(&self, refresh: Refresh, waiter: Waiter<R>) -> Option<Command> {
        let mut state = self.state.lock();
        if state.closed {
            drop(state);
            waiter.resolve(Err(TreeError::Cancelled(
                "command queue is closed".to_string(),
            )));
            return None;
        }

        match state.active.as_mut() {
            Some(active) if active.command.refresh.covers(refresh) => {
                active.waiters.push(waiter);
                None
            }
            Some(active) => {
                let superseded = active.command;
                let command = Command::next(superseded.refresh | refresh);
                log::debug!(
                    "tree command superseded old_generation={} new_generation={} refresh={:?}",
                    superseded.generation,
                    command.generation,
                    command.refresh
                );
                active.command = command;
                active.waiters.push(waiter);
                Some(command)
            }
            None => {
                let command = Command::next(refresh);
                state.active = Some(Active {
                    command,
                    waiters: vec![waiter],
                });
                Some(command)
            }
        }
    }

    pub(crate) fn is_active(&self, command: &Command) -> bool {
        self.state
            .lock()
            .active
            .as_ref()
            .is_some_and(|active| active.command == *command)
    }

    /// Completes `command`, handing back its waiters for the caller to resolve.
    ///
    /// Returns `None` when the command is obsolete.
    pub(crate) fn finish(&self, command: &Command) -> Option<Vec<Waiter<R>>> {
        let mut state = self.state.lock();
        match state.active.as_ref() {
            Some(active) if active.command == *command => {
                state.active.take().map(|active| active.waiters)
            }
            _ => {
                log::debug!(
                    "tree command result obsolete generation={}",
                    command.generation
                );
                None
            }
        }
    }

    /// Drops the active command, returning its waiters. New requests are still accepted.
    pub(crate) fn cancel(&self) -> Vec<Waiter<R>> {
        self.state
            .lock()
            .active
            .take()
            .map(|active| active.waiters)
            .unwrap_or_default()
    }

    /// Refuses all further requests and returns the waiters of the active command.
    pub(crate) fn close(&self) -> Vec<Waiter<R>> {
        let mut state = self.state.lock();
        state.closed = true;
        state
            .active
            .take()
            .map(|active| active.waiters)
            .unwrap_or_default()
    }

    pub(crate) fn is_busy(&self) -> bool {
        self.state.lock().active.is_some()
    }
}

impl<R: Clone> CommandQueue<R> {
    /// Completes `command` and resolves every attached caller with `result`.
    ///
    /// Returns false and drops the result when the command is obsolete.
    pub(crate) fn done(&self, command: &Command, result: Result<R>) -> bool {
        match self.finish(command) {
            Some(waiters) => {
                promise::resolve_all(waiters, result);
                true
            }
            None => false,
        }
    }
}

impl<R> Default for CommandQueue<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R> std::fmt::Debug for CommandQueue<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("CommandQueue")
            .field("closed", &state.closed)
            .field("active", &state.active.as_ref().map(|active| active.command))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn submitted(queue: &CommandQueue<u32>, refresh: Refresh) -> (Pending<u32>, Option<Command>) {
        let mut command = None;
        let pending = queue.promise(refresh, |submitted| command = Some(submitted));
        (pending, command)
    }

    #[test]
    fn single_flight_fans_out_one_result() {
        let queue = CommandQueue::new();
        let (mut first, command) = submitted(&queue, Refresh::CHILDREN);
        let (mut second, again) = submitted(&queue, Refresh::CHILDREN);
        let command = command.expect("first request submits");
        assert!(again.is_none());
        assert!(queue.is_busy());

        assert!(queue.done(&command, Ok(3)));
        assert_eq!(first.try_take(), Some(Ok(3)));
        assert_eq!(second.try_take(), Some(Ok(3)));
        assert!(!queue.is_busy());
    }

    // Broader requests supersede and absorb; narrower ones attach.
    #[test]
    fn coalescing_rule() {
        let queue = CommandQueue::new();
        let (mut load, first) = submitted(&queue, Refresh::CHILDREN);
        let first = first.expect("load submits");

        let (mut reload, second) = submitted(&queue, Refresh::reload(false));
        let second = second.expect("reload is broader and supersedes");
        assert_ne!(first.generation(), second.generation());
        assert_eq!(second.refresh(), Refresh::CHILDREN | Refresh::RELOAD);
        assert!(!queue.is_active(&first));

        let (mut narrow, third) = submitted(&queue, Refresh::CHILDREN);
        assert!(third.is_none(), "narrower request attaches");

        let (mut deep, fourth) = submitted(&queue, Refresh::DEEP);
        let fourth = fourth.expect("disjoint flags supersede");
        assert_eq!(
            fourth.refresh(),
            Refresh::CHILDREN | Refresh::RELOAD | Refresh::DEEP
        );

        assert!(!queue.done(&first, Ok(1)));
        assert!(!queue.done(&second, Ok(2)));
        assert_eq!(load.try_take(), None);

        assert!(queue.done(&fourth, Ok(4)));
        for pending in [&mut load, &mut reload, &mut narrow, &mut deep] {
            assert_eq!(pending.try_take(), Some(Ok(4)));
        }
    }

    #[test]
    fn close_rejects_pending_and_future_requests() {
        let queue = CommandQueue::new();
        let (mut pending, command) = submitted(&queue, Refresh::CHILDREN);
        let command = command.expect("submits");

        promise::resolve_all(queue.close(), Err(TreeError::Disposed));
        assert_eq!(pending.try_take(), Some(Err(TreeError::Disposed)));
        assert!(!queue.is_active(&command));

        let (mut late, submitted_late) = submitted(&queue, Refresh::CHILDREN);
        assert!(submitted_late.is_none());
        assert!(matches!(late.try_take(), Some(Err(TreeError::Cancelled(_)))));
    }

    #[test]
    fn cancel_keeps_queue_open() {
        let queue = CommandQueue::new();
        let (_pending, command) = submitted(&queue, Refresh::CHILDREN);
        assert_eq!(queue.cancel().len(), 1);
        assert!(!queue.is_active(&command.expect("submits")));

        let (_again, resubmitted) = submitted(&queue, Refresh::CHILDREN);
        assert!(resubmitted.is_some());
    }
}
