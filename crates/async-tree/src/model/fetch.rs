//! Worker side: asking the provider and preparing results for the consumer.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use crate::command::Command;
use crate::error::panic_message;
use crate::node::NodeQueue;
use crate::object::TreeObject;
use crate::provider::{Children, ChildrenReply, LeafInfo};
use crate::scheduler::{Role, Task};

use super::Shared;

/// Children ready to be reconciled: ordered, with leaf information.
pub(super) enum Fetched<T> {
    Ready(Vec<(T, LeafInfo)>),
    Unavailable,
}

pub(super) enum RootFetch<T> {
    Ready(Option<(T, LeafInfo)>),
    /// The provider panicked.
    Failed(String),
}

impl<T: TreeObject> Shared<T> {
    /// Starts fetching the children of `parent` for `command`.
    ///
    /// An async-capable provider gets the request first; otherwise a worker
    /// task calls [`StructureProvider::children`](crate::StructureProvider::children).
    pub(super) fn submit_children(self: &Arc<Self>, parent: T, queue: NodeQueue<T>, command: Command) {
        let shared = self.clone();
        let reply_parent = parent.clone();
        let reply_queue = queue.clone();
        let reply = ChildrenReply::new(parent.clone(), move |children| {
            shared.deliver_children(reply_parent, reply_queue, command, children);
        });

        // A panic drops the reply, which reports Unavailable.
        let offered =
            panic::catch_unwind(AssertUnwindSafe(|| self.provider.fetch_async(&parent, reply)));
        let reply = match offered {
            Ok(Ok(())) => {
                log::trace!(
                    "tree children requested asynchronously parent={:?} generation={}",
                    parent,
                    command.generation()
                );
                return;
            }
            Ok(Err(reply)) => reply,
            Err(payload) => {
                log::error!(
                    "tree provider panicked in fetch_async parent={:?} error={}",
                    parent,
                    panic_message(payload.as_ref())
                );
                return;
            }
        };

        let shared = self.clone();
        let task = Task::new("fetch-children", move || shared.fetch_children(reply))
            .expire_when(self.command_expiry(queue, command));
        self.scheduler.run_on(Role::Worker, task);
    }

    fn fetch_children(&self, reply: ChildrenReply<T>) {
        let parent = reply.parent().clone();
        let children = self.call_children(&parent);
        if self.config.verify_structure {
            let again = self.call_children(&parent);
            if again != children {
                log::warn!(
                    "tree provider returned different children for the same parent parent={:?}",
                    parent
                );
            }
        }
        reply.send(children);
    }

    fn call_children(&self, parent: &T) -> Children<T> {
        match panic::catch_unwind(AssertUnwindSafe(|| self.provider.children(parent))) {
            Ok(children) => children,
            Err(payload) => {
                log::error!(
                    "tree provider panicked fetching children parent={:?} error={}",
                    parent,
                    panic_message(payload.as_ref())
                );
                Children::Unavailable
            }
        }
    }

    /// Runs wherever the reply was sent from. Prepares the result and hands it
    /// to the consumer.
    fn deliver_children(
        self: &Arc<Self>,
        parent: T,
        queue: NodeQueue<T>,
        command: Command,
        children: Children<T>,
    ) {
        if self.is_disposed() || !queue.is_active(&command) {
            log::debug!(
                "tree children result dropped parent={:?} generation={}",
                parent,
                command.generation()
            );
            return;
        }

        let fetched = match children {
            Children::Ready(objects) => {
                match panic::catch_unwind(AssertUnwindSafe(|| self.prepare(objects))) {
                    Ok(prepared) => Fetched::Ready(prepared),
                    Err(payload) => {
                        log::error!(
                            "tree provider panicked preparing children parent={:?} error={}",
                            parent,
                            panic_message(payload.as_ref())
                        );
                        Fetched::Unavailable
                    }
                }
            }
            Children::Unavailable => Fetched::Unavailable,
        };

        let shared = self.clone();
        let task = Task::new("apply-children", move || {
            shared.apply_children(parent, queue, command, fetched);
        })
        .expire_when(self.disposed_expiry());
        self.scheduler.run_on(Role::Consumer, task);
    }

    fn prepare(&self, mut objects: Vec<T>) -> Vec<(T, LeafInfo)> {
        if let Some(comparator) = &self.comparator {
            objects.sort_by(|a, b| comparator(a, b));
        }
        objects
            .into_iter()
            .map(|object| {
                let leaf = LeafInfo::of(self.provider.as_ref(), &object);
                (object, leaf)
            })
            .collect()
    }

    /// Schedules another attempt at a first load the provider could not answer.
    pub(super) fn retry_children(self: &Arc<Self>, parent: T, queue: NodeQueue<T>, command: Command) {
        let shared = self.clone();
        let retry_queue = queue.clone();
        let task = Task::new("retry-children", move || {
            shared.submit_children(parent, retry_queue, command);
        })
        .expire_when(self.command_expiry(queue, command));
        self.scheduler
            .run_on_after(Role::Worker, self.config.unavailable_retry_delay(), task);
    }

    pub(super) fn submit_root(self: &Arc<Self>, command: Command) {
        let expiry = {
            let shared = Arc::downgrade(self);
            Arc::new(move || {
                shared.upgrade().map_or(true, |shared| {
                    shared.is_disposed() || !shared.root_queue.is_active(&command)
                })
            })
        };
        let shared = self.clone();
        let task = Task::new("fetch-root", move || {
            let fetched = match panic::catch_unwind(AssertUnwindSafe(|| shared.fetch_root())) {
                Ok(root) => RootFetch::Ready(root),
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    log::error!("tree provider panicked fetching root error={}", message);
                    RootFetch::Failed(message)
                }
            };
            let applier = shared.clone();
            let apply = Task::new("apply-root", move || applier.apply_root(command, fetched))
                .expire_when(shared.disposed_expiry());
            shared.scheduler.run_on(Role::Consumer, apply);
        })
        .expire_when(expiry);
        self.scheduler.run_on(Role::Worker, task);
    }

    fn fetch_root(&self) -> Option<(T, LeafInfo)> {
        let root = self.provider.root()?;
        let leaf = LeafInfo::of(self.provider.as_ref(), &root);
        Some((root, leaf))
    }
}
