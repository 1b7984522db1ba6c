//! Children source backing [`AsyncTreeModel::accept`](super::AsyncTreeModel::accept).

use std::sync::Arc;

use crate::command::Refresh;
use crate::error::{Result, TreeError};
use crate::node::NodeSnapshot;
use crate::object::TreeObject;
use crate::path::TreePath;
use crate::promise::Waiter;
use crate::provider::LeafState;
use crate::walker::{ChildrenSource, Fetch, TreeWalker};

use super::Shared;

pub(super) struct ModelSource<T> {
    shared: Arc<Shared<T>>,
    allow_loading: bool,
}

impl<T> ModelSource<T> {
    pub(super) fn new(shared: Arc<Shared<T>>, allow_loading: bool) -> Self {
        Self {
            shared,
            allow_loading,
        }
    }
}

impl<T: TreeObject> ChildrenSource<T> for ModelSource<T> {
    fn children(&self, path: &TreePath<T>, walker: &TreeWalker<T>) -> Fetch<T> {
        if self.shared.is_disposed() {
            return Fetch::Failed(TreeError::Disposed);
        }
        let object = path.last();
        {
            let state = self.shared.state.lock();
            let Some(id) = state.map.lookup(object) else {
                return Fetch::Failed(TreeError::NodeNotFound(format!("{path:?}")));
            };
            if state
                .map
                .node(id)
                .is_some_and(|node| node.leaf.state == LeafState::Always)
            {
                return Fetch::Leaf;
            }
            if let Some(children) = state.map.child_objects(id) {
                return Fetch::Ready(children);
            }
            if !self.allow_loading {
                return Fetch::Leaf;
            }
        }

        let walker = walker.clone();
        let waiter = Waiter::callback(move |result: Result<NodeSnapshot<T>>| match result {
            Ok(snapshot) => {
                if let Err(error) = walker.set_children(snapshot.children) {
                    log::debug!("tree walk ignored late children error={}", error);
                }
            }
            Err(error) => walker.fail(error),
        });
        self.shared
            .request_children(object, Refresh::CHILDREN, waiter);
        Fetch::Pending
    }
}
