//! AsyncTreeModel - the consumer-facing tree API.
//!
//! The model materializes a [`StructureProvider`]'s hierarchy lazily. Reads
//! answer from what is already loaded and kick off fetches for what is not;
//! fetched children flow back through the consumer role, get reconciled into
//! the [`TreeMap`](crate::map), and produce [`TreeEvent`]s.
//!
//! ## Module Structure
//!
//! - `fetch` - worker side: calling the provider, leaf hints, ordering
//! - `apply` - consumer side: installing results and notifying listeners
//! - `source` - children source that lets walkers pause on unloaded nodes

mod apply;
mod fetch;
mod source;


use std::cmp::Ordering as CmpOrdering;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use fnv::{FnvHashMap, FnvHashSet};
use parking_lot::Mutex;

use crate::command::{Command, CommandQueue, Refresh};
use crate::config::TreeConfig;
use crate::error::{Result, TreeError};
use crate::events::{ListenerId, Listeners, TreeListener};
use crate::map::TreeMap;
use crate::node::{NodeQueue, NodeSnapshot};
use crate::object::TreeObject;
use crate::path::TreePath;
use crate::promise::{self, Pending, Waiter};
use crate::provider::{LeafState, StructureProvider};
use crate::scheduler::{Expiry, Role, Scheduler, Task};
use crate::visitor::{PathFinder, TreeVisitor};
use crate::walker::TreeWalker;

use self::source::ModelSource;

/// Orders siblings before they are reconciled.
pub type Comparator<T> = Arc<dyn Fn(&T, &T) -> CmpOrdering + Send + Sync>;

/// One row under a parent as the consumer should display it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeItem<T> {
    Node(T),
    /// Children are being fetched.
    Loading,
}

impl<T> TreeItem<T> {
    pub fn object(&self) -> Option<&T> {
        match self {
            Self::Node(object) => Some(object),
            Self::Loading => None,
        }
    }
}

/// Lifecycle of a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ModelState {
    /// The root has not been loaded yet.
    Created = 0,
    Ready = 1,
    Disposed = 2,
}

impl ModelState {
    fn load(atomic: &AtomicU8) -> Self {
        match atomic.load(Ordering::Acquire) {
            1 => Self::Ready,
            2 => Self::Disposed,
            _ => Self::Created,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Ready => "ready",
            Self::Disposed => "disposed",
        }
    }
}

/// Point-in-time view of the model's bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeStatus {
    pub state: ModelState,
    pub nodes: usize,
    /// Commands in flight, the root command included.
    pub loading: usize,
    pub consumer_pending: usize,
    pub worker_pending: usize,
    pub listeners: usize,
}

struct TreeState<T> {
    map: TreeMap<T>,
    root_loaded: bool,
    root_stale: bool,
    unavailable_retries: FnvHashMap<T, u32>,
}

struct Shared<T> {
    provider: Arc<dyn StructureProvider<T>>,
    scheduler: Scheduler,
    config: TreeConfig,
    comparator: Option<Comparator<T>>,
    state: Mutex<TreeState<T>>,
    root_queue: CommandQueue<Option<T>>,
    listeners: Listeners<T>,
    lifecycle: AtomicU8,
    queued_updates: Mutex<FnvHashSet<T>>,
}

/// Decision taken under the state lock for a children request.
enum Plan<T> {
    Resolve(Result<NodeSnapshot<T>>),
    Fetch(T, NodeQueue<T>),
}

/// Asynchronous, incrementally reconciled tree model.
///
/// Cloning is cheap; clones share the same tree.
pub struct AsyncTreeModel<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for AsyncTreeModel<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: TreeObject> AsyncTreeModel<T> {
    pub fn new(
        provider: Arc<dyn StructureProvider<T>>,
        scheduler: Scheduler,
        config: TreeConfig,
    ) -> Result<Self> {
        Self::build(provider, scheduler, config, None)
    }

    /// Like [`AsyncTreeModel::new`], sorting every fetched child list with
    /// `comparator` on the worker role.
    pub fn with_comparator(
        provider: Arc<dyn StructureProvider<T>>,
        scheduler: Scheduler,
        config: TreeConfig,
        comparator: impl Fn(&T, &T) -> CmpOrdering + Send + Sync + 'static,
    ) -> Result<Self> {
        Self::build(provider, scheduler, config, Some(Arc::new(comparator)))
    }

    /// Builds the model on threads described by `config`.
    pub fn from_config(provider: Arc<dyn StructureProvider<T>>, config: TreeConfig) -> Result<Self> {
        let scheduler = Scheduler::from_config(&config)?;
        Self::new(provider, scheduler, config)
    }

    fn build(
        provider: Arc<dyn StructureProvider<T>>,
        scheduler: Scheduler,
        config: TreeConfig,
        comparator: Option<Comparator<T>>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            shared: Arc::new(Shared {
                provider,
                scheduler,
                config,
                comparator,
                state: Mutex::new(TreeState {
                    map: TreeMap::new(),
                    root_loaded: false,
                    root_stale: false,
                    unavailable_retries: FnvHashMap::default(),
                }),
                root_queue: CommandQueue::new(),
                listeners: Listeners::new(),
                lifecycle: AtomicU8::new(ModelState::Created as u8),
                queued_updates: Mutex::new(FnvHashSet::default()),
            }),
        })
    }

    pub fn config(&self) -> &TreeConfig {
        &self.shared.config
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.shared.scheduler
    }

    /// The loaded root. Starts loading it when it is not known yet.
    pub fn root(&self) -> Option<T> {
        if self.shared.is_disposed() {
            return None;
        }
        {
            let state = self.shared.state.lock();
            if state.root_loaded {
                return state.map.root_object().cloned();
            }
        }
        self.shared.request_root(Refresh::CHILDREN, Waiter::Discard);
        None
    }

    /// Resolves with the root once it is loaded.
    pub fn load_root(&self) -> Pending<Option<T>> {
        if self.shared.is_disposed() {
            return Pending::rejected(TreeError::Disposed);
        }
        {
            let state = self.shared.state.lock();
            if state.root_loaded && !state.root_stale {
                return Pending::ready(state.map.root_object().cloned());
            }
        }
        let shared = self.shared.clone();
        self.shared
            .root_queue
            .promise(Refresh::CHILDREN, move |command| shared.submit_root(command))
    }

    /// Children of `parent` as they should be displayed right now.
    ///
    /// Unloaded children start loading; meanwhile the result is a single
    /// [`TreeItem::Loading`] placeholder, or empty when placeholders are off.
    pub fn children(&self, parent: &T) -> Vec<TreeItem<T>> {
        if self.shared.is_disposed() {
            return Vec::new();
        }
        {
            let state = self.shared.state.lock();
            let Some(id) = state.map.lookup(parent) else {
                return Vec::new();
            };
            if let Some(children) = state.map.child_objects(id) {
                return children.into_iter().map(TreeItem::Node).collect();
            }
            if state
                .map
                .node(id)
                .is_some_and(|node| node.leaf.state == LeafState::Always)
            {
                return Vec::new();
            }
        }
        self.shared
            .request_children(parent, Refresh::CHILDREN, Waiter::Discard);
        if self.shared.config.show_placeholder_while_loading {
            vec![TreeItem::Loading]
        } else {
            Vec::new()
        }
    }

    pub fn child_count(&self, parent: &T) -> usize {
        self.children(parent).len()
    }

    pub fn child(&self, parent: &T, index: usize) -> Option<TreeItem<T>> {
        self.children(parent).into_iter().nth(index)
    }

    /// Position of `child` among the loaded children of `parent`.
    pub fn index_of_child(&self, parent: &T, child: &T) -> Option<usize> {
        self.loaded_children(parent)?
            .iter()
            .position(|candidate| candidate == child)
    }

    /// Unknown objects count as leaves.
    pub fn is_leaf(&self, object: &T) -> bool {
        let state = self.shared.state.lock();
        state.map.find(object).map_or(true, |node| node.is_leaf())
    }

    /// Children if they are loaded, without triggering a fetch.
    pub fn loaded_children(&self, parent: &T) -> Option<Vec<T>> {
        let state = self.shared.state.lock();
        let id = state.map.lookup(parent)?;
        state.map.child_objects(id)
    }

    pub fn is_loading(&self, object: &T) -> bool {
        let state = self.shared.state.lock();
        state.map.find(object).is_some_and(|node| node.queue.is_busy())
    }

    /// Every path the object is currently reachable through.
    pub fn paths_of(&self, object: &T) -> Vec<TreePath<T>> {
        let state = self.shared.state.lock();
        state
            .map
            .find(object)
            .map(|node| node.paths.clone())
            .unwrap_or_default()
    }

    /// Resolves once the children of `parent` are loaded and current.
    pub fn load_children(&self, parent: &T) -> Pending<NodeSnapshot<T>> {
        let (waiter, pending) = promise::channel();
        self.shared
            .request_children(parent, Refresh::CHILDREN, waiter);
        pending
    }

    /// Walks the tree depth-first with `visitor`.
    ///
    /// With `allow_loading` the walk pauses on unloaded children and resumes
    /// once they arrive; without it, unloaded subtrees are skipped.
    pub fn accept(
        &self,
        visitor: impl TreeVisitor<T> + 'static,
        allow_loading: bool,
    ) -> Pending<Option<TreePath<T>>> {
        if self.shared.is_disposed() {
            return Pending::rejected(TreeError::Disposed);
        }
        let source = Arc::new(ModelSource::new(self.shared.clone(), allow_loading));
        let walker = TreeWalker::new(Arc::new(visitor), source);
        let result = walker.result();
        let shared = self.shared.clone();
        let task = Task::new("accept", move || shared.start_walk(walker))
            .expire_when(self.shared.disposed_expiry());
        self.shared.scheduler.run_on(Role::Consumer, task);
        result
    }

    /// Walks down `components` from the root, loading as needed.
    pub fn resolve_path(&self, components: Vec<T>) -> Pending<Option<TreePath<T>>> {
        self.accept(PathFinder::new(components), true)
    }

    /// Marks an object's children outdated and reloads them if loaded.
    /// `deep` also reloads every loaded descendant.
    pub fn invalidate(&self, object: &T, deep: bool) {
        if self.shared.is_disposed() {
            return;
        }
        let shared = self.shared.clone();
        let object = object.clone();
        let task = Task::new("invalidate", move || {
            shared.reload(&object, Refresh::reload(deep));
        })
        .expire_when(self.shared.disposed_expiry());
        self.shared.scheduler.run_on(Role::Consumer, task);
    }

    pub fn invalidate_path(&self, path: &TreePath<T>, deep: bool) {
        self.invalidate(path.last(), deep);
    }

    /// Refetches the root; `deep` also reloads everything loaded below it.
    pub fn invalidate_root(&self, deep: bool) {
        if self.shared.is_disposed() {
            return;
        }
        let shared = self.shared.clone();
        let task = Task::new("invalidate-root", move || {
            shared.state.lock().root_stale = true;
            shared.request_root(Refresh::reload(deep), Waiter::Discard);
        })
        .expire_when(self.shared.disposed_expiry());
        self.shared.scheduler.run_on(Role::Consumer, task);
    }

    /// Requests a refresh of `object` after the coalescing window. Requests
    /// for the same object inside the window collapse into one.
    pub fn queue_update(&self, object: &T) {
        if self.shared.is_disposed() {
            return;
        }
        if !self.shared.queued_updates.lock().insert(object.clone()) {
            return;
        }
        let shared = self.shared.clone();
        let object = object.clone();
        let task = Task::new("queue-update", move || {
            shared.queued_updates.lock().remove(&object);
            shared.reload(&object, Refresh::reload(false));
        })
        .expire_when(self.shared.disposed_expiry());
        self.shared.scheduler.run_on_after(
            Role::Consumer,
            self.shared.config.update_coalesce_delay(),
            task,
        );
    }

    /// Cancels every in-flight fetch; callers get [`TreeError::Cancelled`].
    /// The tree stays usable.
    pub fn cancel_pending(&self) {
        let queues = {
            let mut state = self.shared.state.lock();
            state.unavailable_retries.clear();
            state.map.queues()
        };
        self.shared.queued_updates.lock().clear();
        let cancelled = || TreeError::Cancelled("cancelled by caller".to_string());
        promise::resolve_all(self.shared.root_queue.cancel(), Err(cancelled()));
        for queue in queues {
            promise::resolve_all(queue.cancel(), Err(cancelled()));
        }
    }

    pub fn add_listener(&self, listener: impl TreeListener<T> + 'static) -> ListenerId {
        self.shared.listeners.add(Arc::new(listener))
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.shared.listeners.remove(id)
    }

    pub fn status(&self) -> TreeStatus {
        let (nodes, busy) = {
            let state = self.shared.state.lock();
            (state.map.len(), state.map.busy_commands())
        };
        TreeStatus {
            state: ModelState::load(&self.shared.lifecycle),
            nodes,
            loading: busy + usize::from(self.shared.root_queue.is_busy()),
            consumer_pending: self.shared.scheduler.pending(Role::Consumer),
            worker_pending: self.shared.scheduler.pending(Role::Worker),
            listeners: self.shared.listeners.len(),
        }
    }

    /// True when nothing is in flight or queued on either role.
    ///
    /// Called from inside a consumer task, the running task itself counts as
    /// pending.
    pub fn is_idle(&self) -> bool {
        let status = self.status();
        status.loading == 0 && status.consumer_pending == 0 && status.worker_pending == 0
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.is_disposed()
    }

    /// Drops the whole tree and rejects every pending future. Idempotent.
    pub fn dispose(&self) {
        let previous = self
            .shared
            .lifecycle
            .swap(ModelState::Disposed as u8, Ordering::AcqRel);
        if previous == ModelState::Disposed as u8 {
            return;
        }
        let (nodes, queues) = {
            let mut state = self.shared.state.lock();
            state.root_loaded = false;
            state.unavailable_retries.clear();
            (state.map.len(), state.map.clear())
        };
        self.shared.queued_updates.lock().clear();
        self.shared.listeners.clear();

        promise::resolve_all(self.shared.root_queue.close(), Err(TreeError::Disposed));
        for queue in queues {
            promise::resolve_all(queue.close(), Err(TreeError::Disposed));
        }
        log::info!("tree model disposed nodes={}", nodes);
    }
}

impl<T: TreeObject> Shared<T> {
    fn is_disposed(&self) -> bool {
        ModelState::load(&self.lifecycle) == ModelState::Disposed
    }

    fn disposed_expiry(self: &Arc<Self>) -> Expiry {
        let shared = Arc::downgrade(self);
        Arc::new(move || shared.upgrade().map_or(true, |shared| shared.is_disposed()))
    }

    /// Expires once the tree is disposed or `command` stopped being active.
    fn command_expiry(self: &Arc<Self>, queue: NodeQueue<T>, command: Command) -> Expiry {
        let shared = Arc::downgrade(self);
        Arc::new(move || {
            shared.upgrade().map_or(true, |shared| shared.is_disposed())
                || !queue.is_active(&command)
        })
    }

    fn request_root(self: &Arc<Self>, refresh: Refresh, waiter: Waiter<Option<T>>) {
        if self.is_disposed() {
            waiter.resolve(Err(TreeError::Disposed));
            return;
        }
        if let Some(command) = self.root_queue.enqueue(refresh, waiter) {
            self.submit_root(command);
        }
    }

    fn request_children(
        self: &Arc<Self>,
        object: &T,
        refresh: Refresh,
        waiter: Waiter<NodeSnapshot<T>>,
    ) {
        if self.is_disposed() {
            waiter.resolve(Err(TreeError::Disposed));
            return;
        }
        let plan = {
            let state = self.state.lock();
            match state.map.lookup(object) {
                None => Plan::Resolve(Err(TreeError::NodeNotFound(format!("{object:?}")))),
                Some(id) => match state.map.node(id) {
                    None => Plan::Resolve(Err(TreeError::NodeNotFound(format!("{object:?}")))),
                    Some(node)
                        if node.leaf.state == LeafState::Always
                            || (node.is_loaded()
                                && !node.stale
                                && !refresh.contains(Refresh::RELOAD)) =>
                    {
                        Plan::Resolve(state.map.snapshot(id).ok_or_else(|| {
                            TreeError::NodeNotFound(format!("{object:?}"))
                        }))
                    }
                    Some(node) => Plan::Fetch(node.object.clone(), node.queue.clone()),
                },
            }
        };

        match plan {
            Plan::Resolve(result) => waiter.resolve(result),
            Plan::Fetch(parent, queue) => {
                if let Some(command) = queue.enqueue(refresh, waiter) {
                    self.submit_children(parent, queue, command);
                }
            }
        }
    }

    /// Refetches the children of a loaded node, or supersedes a first load
    /// that is still running.
    fn reload(self: &Arc<Self>, object: &T, refresh: Refresh) {
        let target = {
            let mut state = self.state.lock();
            let Some(id) = state.map.lookup(object) else {
                log::debug!("tree reload skipped for unknown object={:?}", object);
                return;
            };
            let Some(node) = state.map.node_mut(id) else {
                return;
            };
            if !node.is_loaded() && !node.queue.is_busy() {
                // The next request fetches fresh children anyway.
                return;
            }
            if node.is_loaded() {
                node.stale = true;
            }
            (node.object.clone(), node.queue.clone())
        };
        let (parent, queue) = target;
        if let Some(command) = queue.enqueue(refresh, Waiter::Discard) {
            self.submit_children(parent, queue, command);
        }
    }

    fn post_reload(self: &Arc<Self>, object: T, refresh: Refresh) {
        let shared = self.clone();
        let task = Task::new("reload", move || shared.reload(&object, refresh))
            .expire_when(self.disposed_expiry());
        self.scheduler.run_on(Role::Consumer, task);
    }

    fn start_walk(self: &Arc<Self>, walker: TreeWalker<T>) {
        let root = {
            let state = self.state.lock();
            state
                .root_loaded
                .then(|| state.map.root_object().cloned())
        };
        match root {
            Some(root) => {
                if let Err(error) = walker.start(root) {
                    log::debug!("tree walk not started error={}", error);
                }
            }
            None => {
                let waiter = Waiter::callback(move |result: Result<Option<T>>| match result {
                    Ok(root) => {
                        if let Err(error) = walker.start(root) {
                            log::debug!("tree walk not started error={}", error);
                        }
                    }
                    Err(error) => walker.fail(error),
                });
                self.request_root(Refresh::CHILDREN, waiter);
            }
        }
    }
}

impl<T> fmt::Debug for AsyncTreeModel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncTreeModel")
            .field("state", &ModelState::load(&self.shared.lifecycle))
            .field("scheduler", &self.shared.scheduler)
            .finish_non_exhaustive()
    }
}
