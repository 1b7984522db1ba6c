//! Change notifications.
//!
//! Listeners are registered on the model and always invoked on the consumer
//! role, in the order the reconciliation passes that produced the events
//! completed.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::panic_message;
use crate::path::TreePath;
use crate::reconcile::ChildDiff;

/// A structural change of the materialized tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeEvent<T> {
    /// Everything at and below `path` must be re-read. `None` means the whole
    /// tree, including the root, changed.
    StructureChanged { path: Option<TreePath<T>> },
    NodesInserted {
        parent: TreePath<T>,
        indices: Vec<usize>,
        children: Vec<T>,
    },
    NodesRemoved {
        parent: TreePath<T>,
        indices: Vec<usize>,
        children: Vec<T>,
    },
    NodesChanged {
        parent: TreePath<T>,
        indices: Vec<usize>,
        children: Vec<T>,
    },
}

impl<T: Clone> TreeEvent<T> {
    /// Builds the removed/inserted/changed events for one parent path,
    /// skipping empty ones. Indices of removed children refer to `old`,
    /// the others to `new`.
    pub(crate) fn from_diff(parent: &TreePath<T>, diff: &ChildDiff, old: &[T], new: &[T]) -> Vec<Self> {
        let pick = |indices: &[usize], from: &[T]| -> Vec<T> {
            indices.iter().filter_map(|index| from.get(*index).cloned()).collect()
        };

        let mut events = Vec::with_capacity(3);
        if !diff.removed.is_empty() {
            events.push(Self::NodesRemoved {
                parent: parent.clone(),
                indices: diff.removed.clone(),
                children: pick(&diff.removed, old),
            });
        }
        if !diff.inserted.is_empty() {
            events.push(Self::NodesInserted {
                parent: parent.clone(),
                indices: diff.inserted.clone(),
                children: pick(&diff.inserted, new),
            });
        }
        if !diff.changed.is_empty() {
            events.push(Self::NodesChanged {
                parent: parent.clone(),
                indices: diff.changed.clone(),
                children: pick(&diff.changed, new),
            });
        }
        events
    }
}

/// Receives [`TreeEvent`]s on the consumer role.
pub trait TreeListener<T>: Send + Sync {
    fn on_event(&self, event: &TreeEvent<T>);
}

impl<T, F> TreeListener<T> for F
where
    F: Fn(&TreeEvent<T>) + Send + Sync,
{
    fn on_event(&self, event: &TreeEvent<T>) {
        self(event)
    }
}

/// Handle returned by `add_listener`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

pub(crate) struct Listeners<T> {
    next_id: AtomicU64,
    entries: Mutex<Vec<(ListenerId, Arc<dyn TreeListener<T>>)>>,
}

impl<T> Listeners<T> {
    pub(crate) fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn add(&self, listener: Arc<dyn TreeListener<T>>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries.lock().push((id, listener));
        id
    }

    pub(crate) fn remove(&self, id: ListenerId) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|(entry, _)| *entry != id);
        entries.len() != before
    }

    pub(crate) fn clear(&self) {
        self.entries.lock().clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Delivers events to a snapshot of the registered listeners.
    ///
    /// A panicking listener is logged and does not keep the others from
    /// hearing about the change.
    pub(crate) fn notify(&self, events: &[TreeEvent<T>]) {
        if events.is_empty() {
            return;
        }
        let listeners: Vec<Arc<dyn TreeListener<T>>> = self
            .entries
            .lock()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in listeners {
            for event in events {
                let delivered =
                    panic::catch_unwind(AssertUnwindSafe(|| listener.on_event(event)));
                if let Err(payload) = delivered {
                    log::error!(
                        "tree listener panicked error={}",
                        panic_message(payload.as_ref())
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diff_events_skip_empty_categories() {
        let parent = TreePath::root("p");
        let diff = ChildDiff {
            removed: vec![0],
            inserted: vec![2],
            changed: Vec::new(),
        };
        let events = TreeEvent::from_diff(&parent, &diff, &["a", "b", "c"], &["b", "c", "d"]);
        assert_eq!(
            events,
            vec![
                TreeEvent::NodesRemoved {
                    parent: parent.clone(),
                    indices: vec![0],
                    children: vec!["a"],
                },
                TreeEvent::NodesInserted {
                    parent,
                    indices: vec![2],
                    children: vec!["d"],
                },
            ]
        );
    }

    #[test]
    fn listeners_survive_a_panicking_peer() {
        let listeners: Listeners<&'static str> = Listeners::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        listeners.add(Arc::new(|_: &TreeEvent<&'static str>| panic!("listener bug")));
        let sink = seen.clone();
        let id = listeners.add(Arc::new(move |event: &TreeEvent<&'static str>| {
            sink.lock().push(event.clone());
        }));

        let event = TreeEvent::StructureChanged { path: None };
        listeners.notify(std::slice::from_ref(&event));
        assert_eq!(*seen.lock(), vec![event.clone()]);

        assert!(listeners.remove(id));
        assert!(!listeners.remove(id));
        listeners.notify(&[event]);
        assert_eq!(seen.lock().len(), 1);
        assert_eq!(listeners.len(), 1);
    }
}
