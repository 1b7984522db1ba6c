//! The structure provider seam.
//!
//! A [`StructureProvider`] knows the domain: which object is the root and
//! what the children of an object are. Blocking calls happen on the worker
//! role. [`StructureProvider::fetch_async`] is offered first, on the thread
//! that asked for the children, and must not block.

use std::fmt;

use crate::object::TreeObject;

/// Answer to a children request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Children<T> {
    Ready(Vec<T>),
    /// The provider is not ready yet (for example its index is still
    /// building). Previously loaded children stay as they are.
    Unavailable,
}

/// How the model may treat an object before its children are known.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LeafState {
    /// Never has children; no fetch is ever made.
    Always,
    /// Always shown as expandable, even once loaded empty.
    Never,
    /// Leafness is only known after fetching.
    AsyncUnknown,
    /// Use [`StructureProvider::is_leaf`] and the loaded children.
    #[default]
    Default,
}

/// Leaf information computed off the consumer for one object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LeafInfo {
    pub state: LeafState,
    pub hint: Option<bool>,
}

impl LeafInfo {
    pub(crate) fn of<T: 'static>(provider: &dyn StructureProvider<T>, object: &T) -> Self {
        let state = provider.leaf_state(object);
        let hint = match state {
            LeafState::Default => provider.is_leaf(object),
            _ => None,
        };
        Self { state, hint }
    }

    /// Leafness known without looking at loaded children.
    pub fn known_leaf(&self) -> Option<bool> {
        match self.state {
            LeafState::Always => Some(true),
            LeafState::Never => Some(false),
            LeafState::AsyncUnknown => None,
            LeafState::Default => self.hint,
        }
    }
}

/// Supplies the raw structure of the tree.
pub trait StructureProvider<T>: Send + Sync + 'static {
    /// The root object, or `None` for an empty tree.
    fn root(&self) -> Option<T>;

    fn children(&self, parent: &T) -> Children<T>;

    fn leaf_state(&self, object: &T) -> LeafState {
        let _ = object;
        LeafState::Default
    }

    /// Cheap leaf hint used before children are loaded.
    fn is_leaf(&self, object: &T) -> Option<bool> {
        let _ = object;
        None
    }

    /// Answers asynchronously instead of blocking a worker.
    ///
    /// Providers that accept the request keep `reply` and call
    /// [`ChildrenReply::send`] later from any thread. The default hands the
    /// reply back, and the model falls back to [`StructureProvider::children`]
    /// on the worker role.
    fn fetch_async(&self, parent: &T, reply: ChildrenReply<T>) -> Result<(), ChildrenReply<T>> {
        let _ = parent;
        Err(reply)
    }
}

type Deliver<T> = Box<dyn FnOnce(Children<T>) + Send>;

/// A one-shot channel back into the model for an asynchronous fetch.
///
/// Dropping a reply without sending counts as [`Children::Unavailable`].
pub struct ChildrenReply<T> {
    parent: T,
    deliver: Option<Deliver<T>>,
}

impl<T: TreeObject> ChildrenReply<T> {
    pub(crate) fn new(parent: T, deliver: impl FnOnce(Children<T>) + Send + 'static) -> Self {
        Self {
            parent,
            deliver: Some(Box::new(deliver)),
        }
    }

    /// The object whose children were requested.
    pub fn parent(&self) -> &T {
        &self.parent
    }

    pub fn send(mut self, children: Children<T>) {
        if let Some(deliver) = self.deliver.take() {
            deliver(children);
        }
    }
}

impl<T> Drop for ChildrenReply<T> {
    fn drop(&mut self) {
        if let Some(deliver) = self.deliver.take() {
            deliver(Children::Unavailable);
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for ChildrenReply<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChildrenReply")
            .field("parent", &self.parent)
            .field("sent", &self.deliver.is_none())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;

    struct Fixed;

    impl StructureProvider<u32> for Fixed {
        fn root(&self) -> Option<u32> {
            Some(0)
        }

        fn children(&self, parent: &u32) -> Children<u32> {
            Children::Ready(vec![parent + 1])
        }

        fn leaf_state(&self, object: &u32) -> LeafState {
            if *object >= 10 {
                LeafState::Always
            } else {
                LeafState::Default
            }
        }

        fn is_leaf(&self, object: &u32) -> Option<bool> {
            Some(*object == 5)
        }
    }

    #[test]
    fn leaf_info_prefers_explicit_state() {
        let provider = Fixed;
        assert_eq!(LeafInfo::of(&provider, &12).known_leaf(), Some(true));
        assert_eq!(LeafInfo::of(&provider, &5).known_leaf(), Some(true));
        assert_eq!(LeafInfo::of(&provider, &4).known_leaf(), Some(false));
        let unknown = LeafInfo {
            state: LeafState::AsyncUnknown,
            hint: Some(true),
        };
        assert_eq!(unknown.known_leaf(), None);
    }

    #[test]
    fn dropped_reply_reports_unavailable() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let reply = ChildrenReply::new(1u32, move |children| sink.lock().push(children));
        assert_eq!(reply.parent(), &1);
        drop(reply);

        let sink = seen.clone();
        ChildrenReply::new(2u32, move |children| sink.lock().push(children))
            .send(Children::Ready(vec![3]));

        assert_eq!(
            *seen.lock(),
            vec![Children::Unavailable, Children::Ready(vec![3])]
        );
    }

    #[test]
    fn default_fetch_async_declines() {
        let reply = ChildrenReply::new(1u32, |_| {});
        assert!(Fixed.fetch_async(&1, reply).is_err());
    }
}
