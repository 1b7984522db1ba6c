//! Pausable depth-first traversal.
//!
//! A [`TreeWalker`] visits paths in depth-first order and asks a
//! [`ChildrenSource`] for the children of every path the visitor wants to
//! descend into. When the source cannot answer yet, the walker parks in
//! [`WalkState::Waiting`] and returns control; the source later resumes it
//! with [`TreeWalker::set_children`] (or fails it with [`TreeWalker::fail`])
//! from whatever thread the children arrive on. No thread ever blocks.
//!
//! ## Resume races
//!
//! A source may answer from inside `children` itself or from another thread
//! before the dispatching call has returned. The walker keeps such an early
//! answer in a slot and the dispatching thread picks it up once the source
//! returns, so only one thread is ever dispatching.

use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{panic_message, Result, TreeError};
use crate::path::TreePath;
use crate::promise::{self, Pending, Waiter};
use crate::visitor::{TreeVisitor, VisitAction};

/// Lifecycle of a walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WalkState {
    Idle,
    Dispatching,
    Waiting,
    Finished,
    Failed,
}

impl WalkState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Dispatching => "dispatching",
            Self::Waiting => "waiting",
            Self::Finished => "finished",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Failed)
    }
}

/// The answer of a [`ChildrenSource`].
#[derive(Debug)]
pub enum Fetch<T> {
    Ready(Vec<T>),
    /// Nothing to descend into.
    Leaf,
    /// The source will call [`TreeWalker::set_children`] or
    /// [`TreeWalker::fail`] later.
    Pending,
    Failed(TreeError),
}

/// Supplies children to a walker.
pub trait ChildrenSource<T>: Send + Sync {
    fn children(&self, path: &TreePath<T>, walker: &TreeWalker<T>) -> Fetch<T>;
}

pub type WalkResult<T> = Result<Option<TreePath<T>>>;

struct Frame<T> {
    parent: Option<TreePath<T>>,
    pending: VecDeque<T>,
}

struct WalkCore<T> {
    state: WalkState,
    stack: Vec<Frame<T>>,
    waiting_on: Option<TreePath<T>>,
    /// Set once the dispatching thread has returned from the source.
    parked: bool,
    early: Option<Vec<T>>,
    outcome: Option<WalkResult<T>>,
    waiters: Vec<Waiter<Option<TreePath<T>>>>,
}

struct WalkerInner<T> {
    visitor: Arc<dyn TreeVisitor<T>>,
    source: Arc<dyn ChildrenSource<T>>,
    core: Mutex<WalkCore<T>>,
}

/// A resumable depth-first walk. Clones share the same walk.
pub struct TreeWalker<T> {
    inner: Arc<WalkerInner<T>>,
}

impl<T> Clone for TreeWalker<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

enum Step<T> {
    Visit(TreePath<T>),
    Done,
    Stop,
}

impl<T: Clone + PartialEq + fmt::Debug + Send + 'static> TreeWalker<T> {
    pub fn new(visitor: Arc<dyn TreeVisitor<T>>, source: Arc<dyn ChildrenSource<T>>) -> Self {
        Self {
            inner: Arc::new(WalkerInner {
                visitor,
                source,
                core: Mutex::new(WalkCore {
                    state: WalkState::Idle,
                    stack: Vec::new(),
                    waiting_on: None,
                    parked: false,
                    early: None,
                    outcome: None,
                    waiters: Vec::new(),
                }),
            }),
        }
    }

    pub fn state(&self) -> WalkState {
        self.inner.core.lock().state
    }

    /// The path whose children the walk is waiting for.
    pub fn waiting_on(&self) -> Option<TreePath<T>> {
        self.inner.core.lock().waiting_on.clone()
    }

    /// Future resolving with the interrupting path, `None` when the walk
    /// exhausted the tree, or the error that failed it.
    pub fn result(&self) -> Pending<Option<TreePath<T>>> {
        let mut core = self.inner.core.lock();
        if let Some(outcome) = &core.outcome {
            return match outcome {
                Ok(path) => Pending::ready(path.clone()),
                Err(error) => Pending::rejected(error.clone()),
            };
        }
        let (waiter, pending) = promise::channel();
        core.waiters.push(waiter);
        pending
    }

    /// Starts the walk at `root`. A missing root finishes it immediately.
    pub fn start(&self, root: Option<T>) -> Result<()> {
        {
            let mut core = self.inner.core.lock();
            if core.state != WalkState::Idle {
                return Err(TreeError::IllegalState(format!(
                    "walker already {}",
                    core.state.as_str()
                )));
            }
            match root {
                Some(root) => {
                    core.state = WalkState::Dispatching;
                    core.stack.push(Frame {
                        parent: None,
                        pending: VecDeque::from([root]),
                    });
                }
                None => {
                    drop(core);
                    self.finish(Ok(None));
                    return Ok(());
                }
            }
        }
        self.dispatch();
        Ok(())
    }

    /// Resumes a waiting walk with the children it asked for.
    pub fn set_children(&self, children: Vec<T>) -> Result<()> {
        let mut core = self.inner.core.lock();
        if core.state != WalkState::Waiting || core.early.is_some() {
            return Err(TreeError::IllegalState(format!(
                "walker is {} and cannot take children",
                core.state.as_str()
            )));
        }
        if !core.parked {
            core.early = Some(children);
            return Ok(());
        }
        Self::descend(&mut core, children);
        drop(core);
        self.dispatch();
        Ok(())
    }

    /// Fails the walk unless it already ended.
    pub fn fail(&self, error: TreeError) {
        self.finish(Err(error));
    }

    fn descend(core: &mut WalkCore<T>, children: Vec<T>) {
        let parent = core.waiting_on.take();
        core.state = WalkState::Dispatching;
        core.parked = false;
        if !children.is_empty() {
            core.stack.push(Frame {
                parent,
                pending: children.into(),
            });
        }
    }

    fn next_step(&self) -> Step<T> {
        let mut core = self.inner.core.lock();
        if core.state != WalkState::Dispatching {
            return Step::Stop;
        }
        while let Some(frame) = core.stack.last_mut() {
            if let Some(object) = frame.pending.pop_front() {
                let path = match &frame.parent {
                    Some(parent) if parent.contains(&object) => {
                        log::warn!(
                            "tree walk skipped cyclic child path={:?} child={:?}",
                            parent,
                            object
                        );
                        continue;
                    }
                    Some(parent) => parent.child(object),
                    None => TreePath::root(object),
                };
                return Step::Visit(path);
            }
            core.stack.pop();
        }
        Step::Done
    }

    fn dispatch(&self) {
        loop {
            let path = match self.next_step() {
                Step::Visit(path) => path,
                Step::Done => {
                    self.finish(Ok(None));
                    return;
                }
                Step::Stop => return,
            };

            let visitor = self.inner.visitor.clone();
            let decision = panic::catch_unwind(AssertUnwindSafe(|| visitor.visit(&path)))
                .unwrap_or_else(|payload| {
                    Err(TreeError::Visitor(panic_message(payload.as_ref())))
                });
            let action = match decision {
                Ok(action) => action,
                Err(error) => {
                    self.finish(Err(error));
                    return;
                }
            };

            match action {
                VisitAction::Interrupt => {
                    self.finish(Ok(Some(path)));
                    return;
                }
                VisitAction::SkipChildren => {}
                VisitAction::SkipSiblings => {
                    if let Some(frame) = self.inner.core.lock().stack.last_mut() {
                        frame.pending.clear();
                    }
                }
                VisitAction::Continue => {
                    if !self.request_children(path) {
                        return;
                    }
                }
            }
        }
    }

    /// Asks the source for children. Returns false when this thread must stop
    /// dispatching.
    fn request_children(&self, path: TreePath<T>) -> bool {
        {
            let mut core = self.inner.core.lock();
            if core.state != WalkState::Dispatching {
                return false;
            }
            core.state = WalkState::Waiting;
            core.waiting_on = Some(path.clone());
            core.parked = false;
            core.early = None;
        }

        let fetch = self.inner.source.children(&path, self);

        let mut core = self.inner.core.lock();
        if core.state != WalkState::Waiting {
            // Failed or finished while the source was running.
            return false;
        }
        match fetch {
            Fetch::Ready(children) => {
                core.early = None;
                Self::descend(&mut core, children);
                true
            }
            Fetch::Leaf => {
                core.early = None;
                Self::descend(&mut core, Vec::new());
                true
            }
            Fetch::Failed(error) => {
                drop(core);
                self.finish(Err(error));
                false
            }
            Fetch::Pending => match core.early.take() {
                Some(children) => {
                    Self::descend(&mut core, children);
                    true
                }
                None => {
                    core.parked = true;
                    false
                }
            },
        }
    }

    fn finish(&self, outcome: WalkResult<T>) {
        let waiters = {
            let mut core = self.inner.core.lock();
            if core.state.is_terminal() {
                return;
            }
            core.state = if outcome.is_ok() {
                WalkState::Finished
            } else {
                WalkState::Failed
            };
            core.stack.clear();
            core.waiting_on = None;
            core.early = None;
            core.parked = false;
            core.outcome = Some(outcome.clone());
            std::mem::take(&mut core.waiters)
        };
        if let Err(error) = &outcome {
            log::debug!("tree walk failed error={}", error);
        }
        for waiter in waiters {
            waiter.resolve(outcome.clone());
        }
    }
}

impl<T> fmt::Debug for TreeWalker<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = self.inner.core.lock();
        f.debug_struct("TreeWalker")
            .field("state", &core.state)
            .field("depth", &core.stack.len())
            .finish()
    }
}
