//! Consumer side: installing fetched results into the map.
//!
//! Every function here runs on the consumer role. The state lock is released
//! before waiters are resolved or listeners are called, since both may call
//! back into the model.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::command::{Command, Refresh};
use crate::error::TreeError;
use crate::events::TreeEvent;
use crate::map::RootChange;
use crate::node::NodeQueue;
use crate::object::TreeObject;
use crate::promise;
use crate::scheduler::{Role, Task};

use super::fetch::{Fetched, RootFetch};
use super::{ModelState, Shared};

fn evicted_error() -> TreeError {
    TreeError::Cancelled("node evicted".to_string())
}

impl<T: TreeObject> Shared<T> {
    pub(super) fn apply_children(
        self: &Arc<Self>,
        parent: T,
        queue: NodeQueue<T>,
        command: Command,
        fetched: Fetched<T>,
    ) {
        let mut state = self.state.lock();
        let current = state.map.lookup(&parent).filter(|id| {
            state
                .map
                .node(*id)
                .is_some_and(|node| Arc::ptr_eq(&node.queue, &queue))
        });
        let Some(id) = current else {
            drop(state);
            if let Some(waiters) = queue.finish(&command) {
                promise::resolve_all(waiters, Err(evicted_error()));
            }
            return;
        };

        let objects = match fetched {
            Fetched::Ready(objects) => objects,
            Fetched::Unavailable if state.map.node(id).is_some_and(|node| node.is_loaded()) => {
                let Some(waiters) = queue.finish(&command) else {
                    return;
                };
                state.unavailable_retries.remove(&parent);
                let snapshot = state.map.snapshot(id);
                drop(state);
                log::debug!(
                    "tree children unavailable, keeping loaded children parent={:?}",
                    parent
                );
                match snapshot {
                    Some(snapshot) => promise::resolve_all(waiters, Ok(snapshot)),
                    None => promise::resolve_all(waiters, Err(evicted_error())),
                }
                return;
            }
            Fetched::Unavailable => {
                if !queue.is_active(&command) {
                    log::debug!(
                        "tree children result obsolete parent={:?} generation={}",
                        parent,
                        command.generation()
                    );
                    return;
                }
                let limit = self.config.max_unavailable_retries;
                let attempts = state
                    .unavailable_retries
                    .entry(parent.clone())
                    .or_insert(0);
                if *attempts < limit {
                    *attempts += 1;
                    let attempt = *attempts;
                    drop(state);
                    log::debug!(
                        "tree children unavailable, retrying parent={:?} attempt={}",
                        parent,
                        attempt
                    );
                    self.retry_children(parent, queue, command);
                    return;
                }
                log::warn!(
                    "tree children still unavailable, showing none parent={:?} retries={}",
                    parent,
                    limit
                );
                Vec::new()
            }
        };

        // Claimed before the map changes so a superseded result never lands.
        let Some(waiters) = queue.finish(&command) else {
            return;
        };
        state.unavailable_retries.remove(&parent);
        let Some(pass) = state.map.replace_children(id, objects) else {
            drop(state);
            promise::resolve_all(waiters, Err(evicted_error()));
            return;
        };

        let mut events = Vec::new();
        if pass.first_load {
            events.extend(pass.parent_paths.iter().map(|path| TreeEvent::StructureChanged {
                path: Some(path.clone()),
            }));
        } else {
            for path in &pass.parent_paths {
                events.extend(TreeEvent::from_diff(
                    path,
                    &pass.diff,
                    &pass.old_children,
                    &pass.new_children,
                ));
            }
        }
        log::debug!(
            "tree children applied parent={:?} first_load={} removed={} inserted={} changed={}",
            parent,
            pass.first_load,
            pass.diff.removed.len(),
            pass.diff.inserted.len(),
            pass.diff.changed.len()
        );

        let mut follow_ups: Vec<(T, Refresh)> = pass
            .leaf_flips
            .into_iter()
            .map(|object| (object, Refresh::reload(false)))
            .collect();
        if command.refresh().contains(Refresh::DEEP) {
            follow_ups.extend(
                pass.loaded_kept
                    .into_iter()
                    .map(|object| (object, Refresh::reload(true))),
            );
        }
        for (object, _) in &pass.evicted {
            state.unavailable_retries.remove(object);
        }

        let snapshot = state.map.snapshot(id);
        drop(state);

        for (_, evicted) in pass.evicted {
            promise::resolve_all(evicted.close(), Err(evicted_error()));
        }
        self.emit(events);
        match snapshot {
            Some(snapshot) => promise::resolve_all(waiters, Ok(snapshot)),
            None => promise::resolve_all(waiters, Err(evicted_error())),
        }
        for (object, refresh) in follow_ups {
            self.post_reload(object, refresh);
        }
    }

    pub(super) fn apply_root(self: &Arc<Self>, command: Command, fetched: RootFetch<T>) {
        let root = match fetched {
            RootFetch::Ready(root) => root,
            RootFetch::Failed(message) => {
                self.root_queue
                    .done(&command, Err(TreeError::Provider(message)));
                return;
            }
        };

        let mut state = self.state.lock();
        let Some(waiters) = self.root_queue.finish(&command) else {
            return;
        };
        let first_load = !state.root_loaded;
        let mut events = Vec::new();
        let mut evicted = Vec::new();
        let mut follow_up = None;
        match state.map.set_root(root) {
            RootChange::Replaced { evicted: queues } => {
                evicted = queues;
                state.unavailable_retries.clear();
                events.push(TreeEvent::StructureChanged { path: None });
            }
            RootChange::Unchanged | RootChange::Swapped => {
                if first_load {
                    events.push(TreeEvent::StructureChanged { path: None });
                }
                if command.refresh().contains(Refresh::RELOAD) {
                    let deep = command.refresh().contains(Refresh::DEEP);
                    follow_up = state
                        .map
                        .root_id()
                        .and_then(|id| state.map.node(id))
                        .filter(|node| node.is_loaded())
                        .map(|node| (node.object.clone(), Refresh::reload(deep)));
                }
            }
        }
        state.root_loaded = true;
        state.root_stale = false;
        let root_object = state.map.root_object().cloned();
        drop(state);

        let _ = self.lifecycle.compare_exchange(
            ModelState::Created as u8,
            ModelState::Ready as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        log::debug!(
            "tree root applied root={:?} evicted={}",
            root_object,
            evicted.len()
        );

        for queue in evicted {
            promise::resolve_all(queue.close(), Err(evicted_error()));
        }
        self.emit(events);
        promise::resolve_all(waiters, Ok(root_object));
        if let Some((root, refresh)) = follow_up {
            self.reload(&root, refresh);
        }
    }

    /// Notifies listeners, moving to the consumer role first if needed.
    pub(super) fn emit(self: &Arc<Self>, events: Vec<TreeEvent<T>>) {
        if events.is_empty() {
            return;
        }
        if self.scheduler.is_on(Role::Consumer) {
            self.listeners.notify(&events);
            return;
        }
        let shared = self.clone();
        let task = Task::new("notify", move || shared.listeners.notify(&events))
            .expire_when(self.disposed_expiry());
        self.scheduler.run_on(Role::Consumer, task);
    }
}
