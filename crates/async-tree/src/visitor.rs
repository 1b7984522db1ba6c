//! Traversal decisions.

use std::fmt;

use crate::error::Result;
use crate::path::TreePath;

/// What a traversal does after visiting a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VisitAction {
    /// Descend into the children of this path.
    Continue,
    /// Stop and report this path as the result.
    Interrupt,
    /// Do not descend; go on with the next sibling.
    SkipChildren,
    /// Do not descend and drop the remaining siblings of this path.
    SkipSiblings,
}

/// Decides, path by path, how a tree walk proceeds.
///
/// An `Err` fails the whole walk with that error. Plain closures returning a
/// [`VisitAction`] are visitors too.
pub trait TreeVisitor<T>: Send + Sync {
    fn visit(&self, path: &TreePath<T>) -> Result<VisitAction>;
}

impl<T, F> TreeVisitor<T> for F
where
    F: Fn(&TreePath<T>) -> VisitAction + Send + Sync,
{
    fn visit(&self, path: &TreePath<T>) -> Result<VisitAction> {
        Ok(self(path))
    }
}

/// Walks down a known sequence of components and stops at its end.
#[derive(Clone)]
pub struct PathFinder<T> {
    components: Vec<T>,
}

impl<T> PathFinder<T> {
    pub fn new(components: Vec<T>) -> Self {
        Self { components }
    }
}

impl<T: PartialEq + Send + Sync> TreeVisitor<T> for PathFinder<T> {
    fn visit(&self, path: &TreePath<T>) -> Result<VisitAction> {
        // Only matching prefixes are ever descended, so checking the last
        // component is enough.
        let depth = path.len();
        match self.components.get(depth - 1) {
            Some(expected) if expected == path.last() => {
                if depth == self.components.len() {
                    Ok(VisitAction::Interrupt)
                } else {
                    Ok(VisitAction::Continue)
                }
            }
            _ => Ok(VisitAction::SkipChildren),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for PathFinder<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PathFinder")
            .field("components", &self.components)
            .finish()
    }
}

/// Depth-first search for the first object matching a predicate.
pub struct Search<F> {
    predicate: F,
}

impl<F> Search<F> {
    pub fn new(predicate: F) -> Self {
        Self { predicate }
    }
}

impl<T, F> TreeVisitor<T> for Search<F>
where
    F: Fn(&T) -> bool + Send + Sync,
{
    fn visit(&self, path: &TreePath<T>) -> Result<VisitAction> {
        if (self.predicate)(path.last()) {
            Ok(VisitAction::Interrupt)
        } else {
            Ok(VisitAction::Continue)
        }
    }
}

impl<F> fmt::Debug for Search<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Search").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_finder_follows_components() {
        let finder = PathFinder::new(vec!["root", "src", "lib.rs"]);
        let root = TreePath::root("root");
        let src = root.child("src");

        assert_eq!(finder.visit(&root), Ok(VisitAction::Continue));
        assert_eq!(finder.visit(&src), Ok(VisitAction::Continue));
        assert_eq!(finder.visit(&root.child("docs")), Ok(VisitAction::SkipChildren));
        assert_eq!(finder.visit(&src.child("lib.rs")), Ok(VisitAction::Interrupt));
        assert_eq!(
            finder.visit(&src.child("lib.rs").child("deeper")),
            Ok(VisitAction::SkipChildren)
        );
        assert_eq!(
            finder.visit(&TreePath::root("elsewhere")),
            Ok(VisitAction::SkipChildren)
        );
    }

    #[test]
    fn search_and_closures() {
        let search = Search::new(|name: &&str| name.ends_with(".rs"));
        assert_eq!(
            search.visit(&TreePath::root("src")),
            Ok(VisitAction::Continue)
        );
        assert_eq!(
            search.visit(&TreePath::root("src").child("main.rs")),
            Ok(VisitAction::Interrupt)
        );

        let closure = |path: &TreePath<&str>| {
            if path.len() > 1 {
                VisitAction::SkipSiblings
            } else {
                VisitAction::Continue
            }
        };
        assert_eq!(
            closure.visit(&TreePath::root("a").child("b")),
            Ok(VisitAction::SkipSiblings)
        );
    }
}
