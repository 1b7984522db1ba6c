//! Materialized tree nodes.

use std::sync::Arc;

use thin_vec::ThinVec;

use crate::arena::NodeId;
use crate::command::CommandQueue;
use crate::path::TreePath;
use crate::provider::{LeafInfo, LeafState};

/// A read-only copy of one node, handed to callers of `load_children`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSnapshot<T> {
    pub object: T,
    pub leaf: bool,
    pub children: Vec<T>,
}

pub(crate) type NodeQueue<T> = Arc<CommandQueue<NodeSnapshot<T>>>;

pub(crate) struct Node<T> {
    pub(crate) object: T,
    pub(crate) leaf: LeafInfo,
    /// `None` until the first successful fetch.
    pub(crate) children: Option<ThinVec<NodeId>>,
    pub(crate) paths: Vec<TreePath<T>>,
    pub(crate) stale: bool,
    pub(crate) queue: NodeQueue<T>,
}

impl<T> Node<T> {
    pub(crate) fn new(object: T, leaf: LeafInfo) -> Self {
        Self {
            object,
            leaf,
            children: None,
            paths: Vec::new(),
            stale: false,
            queue: Arc::new(CommandQueue::new()),
        }
    }

    pub(crate) fn is_loaded(&self) -> bool {
        self.children.is_some()
    }

    pub(crate) fn is_leaf(&self) -> bool {
        match self.leaf.state {
            LeafState::Always => true,
            LeafState::Never => false,
            LeafState::AsyncUnknown | LeafState::Default => match &self.children {
                Some(children) => children.is_empty(),
                None => self.leaf.hint.unwrap_or(false),
            },
        }
    }

    /// Loaded children whose fetched leaf hint contradicts what is loaded.
    pub(crate) fn contradicts(&self, leaf: &LeafInfo) -> bool {
        match (&self.children, leaf.known_leaf()) {
            (Some(children), Some(known_leaf)) => known_leaf != children.is_empty(),
            _ => false,
        }
    }
}
