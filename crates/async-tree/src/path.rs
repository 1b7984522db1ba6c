//! Persistent tree paths.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

struct PathNode<T> {
    object: T,
    parent: Option<TreePath<T>>,
    len: usize,
}

/// An immutable sequence of objects from the root down to one node.
///
/// Paths are parent-linked, so every child path shares its prefix with its
/// siblings. Two paths are equal when their component sequences are equal,
/// regardless of which allocation they live in.
pub struct TreePath<T> {
    inner: Arc<PathNode<T>>,
}

impl<T> Clone for TreePath<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> TreePath<T> {
    pub fn root(object: T) -> Self {
        Self {
            inner: Arc::new(PathNode {
                object,
                parent: None,
                len: 1,
            }),
        }
    }

    pub fn child(&self, object: T) -> Self {
        Self {
            inner: Arc::new(PathNode {
                object,
                parent: Some(self.clone()),
                len: self.inner.len + 1,
            }),
        }
    }

    /// The object this path points at.
    pub fn last(&self) -> &T {
        &self.inner.object
    }

    pub fn parent(&self) -> Option<&TreePath<T>> {
        self.inner.parent.as_ref()
    }

    /// Number of components; a root path has length 1.
    pub fn len(&self) -> usize {
        self.inner.len
    }

    pub fn is_root(&self) -> bool {
        self.inner.parent.is_none()
    }

    /// Iterates from this node up to the root.
    pub fn ancestors(&self) -> Ancestors<'_, T> {
        Ancestors { next: Some(self) }
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<T: Clone> TreePath<T> {
    /// Components from the root down.
    pub fn components(&self) -> Vec<T> {
        let mut components: Vec<T> = self.ancestors().map(|path| path.last().clone()).collect();
        components.reverse();
        components
    }

    /// Builds a path from root-first components.
    pub fn from_components(components: impl IntoIterator<Item = T>) -> Option<Self> {
        let mut components = components.into_iter();
        let mut path = Self::root(components.next()?);
        for object in components {
            path = path.child(object);
        }
        Some(path)
    }
}

impl<T: PartialEq> TreePath<T> {
    pub fn contains(&self, object: &T) -> bool {
        self.ancestors().any(|path| path.last() == object)
    }

    /// True when `prefix` is this path or one of its ancestors.
    pub fn starts_with(&self, prefix: &TreePath<T>) -> bool {
        if prefix.len() > self.len() {
            return false;
        }
        self.ancestors()
            .find(|path| path.len() == prefix.len())
            .is_some_and(|path| path == prefix)
    }
}

pub struct Ancestors<'a, T> {
    next: Option<&'a TreePath<T>>,
}

impl<'a, T> Iterator for Ancestors<'a, T> {
    type Item = &'a TreePath<T>;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next?;
        self.next = current.parent();
        Some(current)
    }
}

impl<T: PartialEq> PartialEq for TreePath<T> {
    fn eq(&self, other: &Self) -> bool {
        if self.len() != other.len() {
            return false;
        }
        for (left, right) in self.ancestors().zip(other.ancestors()) {
            // Shared prefix from here up.
            if left.ptr_eq(right) {
                return true;
            }
            if left.last() != right.last() {
                return false;
            }
        }
        true
    }
}

impl<T: Eq> Eq for TreePath<T> {}

impl<T: Hash> Hash for TreePath<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.len().hash(state);
        for path in self.ancestors() {
            path.last().hash(state);
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for TreePath<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut components: Vec<&T> = self.ancestors().map(TreePath::last).collect();
        components.reverse();
        f.debug_list().entries(components).finish()
    }
}

impl<T: fmt::Debug> fmt::Display for TreePath<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
