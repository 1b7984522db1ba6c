//! Identity map of materialized nodes.
//!
//! `TreeMap` owns every node of the tree in a [`NodeArena`] and indexes them by
//! domain equality, so equal objects always share one node even when they are
//! reachable from several parents. Each node tracks every [`TreePath`] it is
//! reachable through; losing the last path evicts the node and closes its
//! command queue.
//!
//! All mutation happens on the consumer role while the model holds its state
//! lock.

use std::mem;

use fnv::{FnvHashMap, FnvHashSet};
use thin_vec::ThinVec;

use crate::arena::{NodeArena, NodeId};
use crate::node::{Node, NodeQueue, NodeSnapshot};
use crate::object::TreeObject;
use crate::path::TreePath;
use crate::provider::LeafInfo;
use crate::reconcile::{self, ChildDiff};

/// Outcome of installing a freshly fetched root.
pub(crate) enum RootChange<T> {
    Unchanged,
    /// An equal but distinct instance replaced the cached root in place.
    Swapped,
    /// The previous tree was discarded.
    Replaced { evicted: Vec<NodeQueue<T>> },
}

/// An evicted object together with its now orphaned command queue.
pub(crate) type Evicted<T> = (T, NodeQueue<T>);

/// Everything the model needs to notify and follow up on one children pass.
pub(crate) struct Reconciled<T> {
    pub(crate) parent_paths: Vec<TreePath<T>>,
    pub(crate) first_load: bool,
    pub(crate) diff: ChildDiff,
    pub(crate) old_children: Vec<T>,
    pub(crate) new_children: Vec<T>,
    pub(crate) dropped_duplicates: usize,
    pub(crate) evicted: Vec<Evicted<T>>,
    /// Reused nodes whose loaded children contradict their new leaf answer.
    pub(crate) leaf_flips: Vec<T>,
    /// Reused nodes with loaded children that did not flip.
    pub(crate) loaded_kept: Vec<T>,
}

pub(crate) struct TreeMap<T> {
    nodes: NodeArena<Node<T>>,
    index: FnvHashMap<T, NodeId>,
    root: Option<NodeId>,
}

impl<T: TreeObject> TreeMap<T> {
    pub(crate) fn new() -> Self {
        Self {
            nodes: NodeArena::new(),
            index: FnvHashMap::default(),
            root: None,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }

    pub(crate) fn root_id(&self) -> Option<NodeId> {
        self.root.filter(|id| self.nodes.contains(*id))
    }

    pub(crate) fn root_object(&self) -> Option<&T> {
        self.root_id()
            .and_then(|id| self.nodes.get(id))
            .map(|node| &node.object)
    }

    pub(crate) fn lookup(&self, object: &T) -> Option<NodeId> {
        self.index
            .get(object)
            .copied()
            .filter(|id| self.nodes.contains(*id))
    }

    pub(crate) fn node(&self, id: NodeId) -> Option<&Node<T>> {
        self.nodes.get(id)
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> Option<&mut Node<T>> {
        self.nodes.get_mut(id)
    }

    pub(crate) fn find(&self, object: &T) -> Option<&Node<T>> {
        self.lookup(object).and_then(|id| self.nodes.get(id))
    }

    /// Loaded child objects of a node, in order.
    pub(crate) fn child_objects(&self, id: NodeId) -> Option<Vec<T>> {
        let node = self.nodes.get(id)?;
        let children = node.children.as_ref()?;
        Some(
            children
                .iter()
                .filter_map(|child| self.nodes.get(*child))
                .map(|child| child.object.clone())
                .collect(),
        )
    }

    pub(crate) fn snapshot(&self, id: NodeId) -> Option<NodeSnapshot<T>> {
        let node = self.nodes.get(id)?;
        Some(NodeSnapshot {
            object: node.object.clone(),
            leaf: node.is_leaf(),
            children: self.child_objects(id).unwrap_or_default(),
        })
    }

    pub(crate) fn queues(&self) -> Vec<NodeQueue<T>> {
        self.nodes.iter().map(|(_, node)| node.queue.clone()).collect()
    }

    pub(crate) fn busy_commands(&self) -> usize {
        self.nodes
            .iter()
            .filter(|(_, node)| node.queue.is_busy())
            .count()
    }

    /// Drops every node, returning their queues for the caller to close.
    pub(crate) fn clear(&mut self) -> Vec<NodeQueue<T>> {
        self.index.clear();
        self.root = None;
        self.nodes.drain().into_iter().map(|node| node.queue).collect()
    }

    pub(crate) fn set_root(&mut self, root: Option<(T, LeafInfo)>) -> RootChange<T> {
        let current = self
            .root_id()
            .and_then(|id| self.nodes.get(id).map(|node| (id, node.object.clone())));

        match (current, root) {
            (None, None) if self.nodes.is_empty() => RootChange::Unchanged,
            (Some((id, cached)), Some((object, leaf))) if cached == object => {
                let swapped = !cached.same_instance(&object);
                if swapped {
                    self.swap_object(id, object);
                }
                if let Some(node) = self.nodes.get_mut(id) {
                    node.leaf = leaf;
                }
                if swapped {
                    RootChange::Swapped
                } else {
                    RootChange::Unchanged
                }
            }
            (_, root) => {
                let evicted = self.clear();
                if let Some((object, leaf)) = root {
                    let id = self.allocate(object.clone(), leaf);
                    if let Some(node) = self.nodes.get_mut(id) {
                        node.paths.push(TreePath::root(object));
                    }
                    self.root = Some(id);
                }
                RootChange::Replaced { evicted }
            }
        }
    }

    /// Replaces the children of `parent` with a freshly fetched list.
    ///
    /// Returns `None` when `parent` is no longer in the map.
    pub(crate) fn replace_children(
        &mut self,
        parent: NodeId,
        mut fetched: Vec<(T, LeafInfo)>,
    ) -> Option<Reconciled<T>> {
        let node = self.nodes.get(parent)?;
        let first_load = !node.is_loaded();
        let parent_paths = node.paths.clone();
        let parent_object = node.object.clone();

        let mut old: Vec<(NodeId, T)> = Vec::new();
        for id in node.children.iter().flatten() {
            match self.nodes.get(*id) {
                Some(child) => old.push((*id, child.object.clone())),
                None => log::warn!(
                    "tree child missing from arena parent={:?} id={:?}",
                    parent_object,
                    id
                ),
            }
        }
        let old_children: Vec<T> = old.iter().map(|(_, object)| object.clone()).collect();
        let old_ids: FnvHashSet<NodeId> = old.iter().map(|(id, _)| *id).collect();

        let dropped_duplicates = reconcile::dedup_by_key(&mut fetched, |(object, _)| object);
        if dropped_duplicates > 0 {
            log::warn!(
                "tree dropped duplicate children parent={:?} dropped={}",
                parent_object,
                dropped_duplicates
            );
        }
        let new_children: Vec<T> = fetched.iter().map(|(object, _)| object.clone()).collect();
        let mut diff = reconcile::diff(&old_children, &new_children);

        let mut new_ids: ThinVec<NodeId> = ThinVec::with_capacity(fetched.len());
        let mut leaf_flips = Vec::new();
        let mut loaded_kept = Vec::new();
        for (position, (object, leaf)) in fetched.into_iter().enumerate() {
            let id = match self.lookup(&object) {
                Some(id) => {
                    let swapped = self
                        .nodes
                        .get(id)
                        .is_some_and(|node| !node.object.same_instance(&object));
                    if swapped {
                        self.swap_object(id, object.clone());
                        if old_ids.contains(&id) {
                            diff.mark_changed(position);
                        }
                    }
                    if let Some(node) = self.nodes.get_mut(id) {
                        if node.contradicts(&leaf) {
                            leaf_flips.push(object.clone());
                        } else if node.is_loaded() {
                            loaded_kept.push(object.clone());
                        }
                        let was_leaf = node.is_leaf();
                        node.leaf = leaf;
                        if node.is_leaf() != was_leaf && old_ids.contains(&id) {
                            diff.mark_changed(position);
                        }
                    }
                    id
                }
                None => self.allocate(object, leaf),
            };
            new_ids.push(id);
        }

        if let Some(node) = self.nodes.get_mut(parent) {
            node.children = Some(new_ids.clone());
            node.stale = false;
        }

        // Attach before detaching so a node moving up from a removed subtree
        // keeps a path and survives.
        for &position in &diff.inserted {
            let id = new_ids[position];
            let object = &new_children[position];
            for parent_path in &parent_paths {
                if parent_path.contains(object) {
                    log::warn!(
                        "tree skipped cyclic child path={:?} child={:?}",
                        parent_path,
                        object
                    );
                    continue;
                }
                self.attach(id, parent_path.child(object.clone()));
            }
        }

        let mut evicted = Vec::new();
        for &position in &diff.removed {
            let id = old[position].0;
            for parent_path in &parent_paths {
                self.detach(id, parent_path, &mut evicted);
            }
        }

        Some(Reconciled {
            parent_paths,
            first_load,
            diff,
            old_children,
            new_children,
            dropped_duplicates,
            evicted,
            leaf_flips,
            loaded_kept,
        })
    }

    fn allocate(&mut self, object: T, leaf: LeafInfo) -> NodeId {
        let id = self.nodes.insert(Node::new(object.clone(), leaf));
        self.index.insert(object, id);
        id
    }

    /// Replaces a node's object with an equal instance and rewrites every
    /// path through it.
    fn swap_object(&mut self, id: NodeId, object: T) {
        let Some(node) = self.nodes.get_mut(id) else {
            return;
        };
        let previous = mem::replace(&mut node.object, object.clone());
        let old_paths = mem::take(&mut node.paths);
        node.paths = old_paths
            .iter()
            .map(|path| match path.parent() {
                Some(parent) => parent.child(object.clone()),
                None => TreePath::root(object.clone()),
            })
            .collect();
        let new_paths = node.paths.clone();

        // HashMap::insert keeps the old key for equal keys.
        self.index.remove(&previous);
        self.index.insert(object, id);

        for (old_path, new_path) in old_paths.iter().zip(&new_paths) {
            self.rewrite_below(id, old_path, new_path);
        }
    }

    fn rewrite_below(&mut self, id: NodeId, old_path: &TreePath<T>, new_path: &TreePath<T>) {
        let children: Vec<NodeId> = match self.nodes.get(id) {
            Some(node) => node.children.iter().flatten().copied().collect(),
            None => return,
        };
        for child in children {
            let Some(node) = self.nodes.get_mut(child) else {
                continue;
            };
            let object = node.object.clone();
            let mut rewritten = Vec::new();
            for path in node.paths.iter_mut() {
                if path.parent() == Some(old_path) {
                    let replacement = new_path.child(object.clone());
                    rewritten.push((mem::replace(path, replacement.clone()), replacement));
                }
            }
            for (old, new) in rewritten {
                self.rewrite_below(child, &old, &new);
            }
        }
    }

    /// Adds `path` to a node and extends it through the node's loaded subtree.
    fn attach(&mut self, id: NodeId, path: TreePath<T>) {
        let Some(node) = self.nodes.get_mut(id) else {
            return;
        };
        if node.paths.contains(&path) {
            return;
        }
        node.paths.push(path.clone());
        let children: Vec<NodeId> = node.children.iter().flatten().copied().collect();
        for child in children {
            let Some(object) = self.nodes.get(child).map(|node| node.object.clone()) else {
                continue;
            };
            if path.contains(&object) {
                log::warn!(
                    "tree skipped cyclic child path={:?} child={:?}",
                    path,
                    object
                );
                continue;
            }
            self.attach(child, path.child(object));
        }
    }

    /// Removes the paths of a node that run through `parent_path`, cascading
    /// into its loaded subtree. Nodes left without a path are evicted.
    fn detach(&mut self, id: NodeId, parent_path: &TreePath<T>, evicted: &mut Vec<Evicted<T>>) {
        let Some(node) = self.nodes.get_mut(id) else {
            return;
        };
        let mut removed = Vec::new();
        node.paths.retain(|path| {
            let through = path.parent() == Some(parent_path);
            if through {
                removed.push(path.clone());
            }
            !through
        });
        if removed.is_empty() {
            return;
        }
        let orphan = node.paths.is_empty();
        let children: Vec<NodeId> = node.children.iter().flatten().copied().collect();
        for child in children {
            for path in &removed {
                self.detach(child, path, evicted);
            }
        }
        if orphan {
            self.evict(id, evicted);
        }
    }

    fn evict(&mut self, id: NodeId, evicted: &mut Vec<Evicted<T>>) {
        let Some(node) = self.nodes.remove(id) else {
            return;
        };
        if self.index.get(&node.object) == Some(&id) {
            self.index.remove(&node.object);
        }
        if self.root == Some(id) {
            self.root = None;
        }
        log::trace!("tree node evicted object={:?}", node.object);
        evicted.push((node.object, node.queue));
    }
}

impl<T: TreeObject> Default for TreeMap<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::hash::{Hash, Hasher};

    use super::*;

    /// Equal by name; `instance` tells fetches apart.
    #[derive(Debug, Clone)]
    struct Obj {
        name: &'static str,
        instance: u32,
    }

    impl PartialEq for Obj {
        fn eq(&self, other: &Self) -> bool {
            self.name == other.name
        }
    }

    impl Eq for Obj {}

    impl Hash for Obj {
        fn hash<H: Hasher>(&self, state: &mut H) {
            self.name.hash(state);
        }
    }

    impl TreeObject for Obj {
        fn same_instance(&self, other: &Self) -> bool {
            self.instance == other.instance
        }
    }

    fn obj(name: &'static str) -> Obj {
        Obj { name, instance: 0 }
    }

    fn fetched(names: &[&'static str]) -> Vec<(Obj, LeafInfo)> {
        names
            .iter()
            .map(|name| (obj(name), LeafInfo::default()))
            .collect()
    }

    fn names(objects: &[Obj]) -> Vec<&'static str> {
        objects.iter().map(|object| object.name).collect()
    }

    fn rooted(children: &[&'static str]) -> (TreeMap<Obj>, NodeId) {
        let mut map = TreeMap::new();
        map.set_root(Some((obj("root"), LeafInfo::default())));
        let root = map.root_id().expect("root installed");
        map.replace_children(root, fetched(children))
            .expect("root present");
        (map, root)
    }

    fn path_names(map: &TreeMap<Obj>, name: &'static str) -> Vec<Vec<&'static str>> {
        let mut paths: Vec<Vec<&'static str>> = map
            .find(&obj(name))
            .map(|node| {
                node.paths
                    .iter()
                    .map(|path| names(&path.components()))
                    .collect()
            })
            .unwrap_or_default();
        paths.sort();
        paths
    }

    #[test]
    fn first_load_attaches_children() {
        let mut map = TreeMap::new();
        map.set_root(Some((obj("root"), LeafInfo::default())));
        let root = map.root_id().expect("root installed");

        let pass = map
            .replace_children(root, fetched(&["a", "b"]))
            .expect("root present");
        assert!(pass.first_load);
        assert_eq!(pass.diff.inserted, vec![0, 1]);
        assert_eq!(path_names(&map, "b"), vec![vec!["root", "b"]]);
        assert_eq!(map.len(), 3);
    }

    #[test]
    fn replacement_keeps_identities() {
        let (mut map, root) = rooted(&["a", "b", "c"]);
        let b = map.lookup(&obj("b")).expect("b present");
        let c = map.lookup(&obj("c")).expect("c present");

        let pass = map
            .replace_children(root, fetched(&["b", "c", "d"]))
            .expect("root present");
        assert!(!pass.first_load);
        assert_eq!(pass.diff.removed, vec![0]);
        assert_eq!(pass.diff.inserted, vec![2]);
        assert!(pass.diff.changed.is_empty());
        assert_eq!(pass.evicted.len(), 1);
        assert_eq!(names(&pass.old_children), vec!["a", "b", "c"]);
        assert_eq!(names(&pass.new_children), vec!["b", "c", "d"]);

        assert_eq!(map.lookup(&obj("b")), Some(b));
        assert_eq!(map.lookup(&obj("c")), Some(c));
        assert!(map.lookup(&obj("a")).is_none());
        assert_eq!(path_names(&map, "d"), vec![vec!["root", "d"]]);
    }

    #[test]
    fn equal_instance_is_swapped_and_paths_rewritten() {
        let (mut map, root) = rooted(&["a"]);
        let a = map.lookup(&obj("a")).expect("a present");
        map.replace_children(a, fetched(&["x"])).expect("a present");

        let fresh = Obj {
            name: "a",
            instance: 7,
        };
        let pass = map
            .replace_children(root, vec![(fresh, LeafInfo::default())])
            .expect("root present");
        assert_eq!(pass.diff.changed, vec![0]);
        assert_eq!(map.lookup(&obj("a")), Some(a));

        let node = map.node(a).expect("a kept");
        assert_eq!(node.object.instance, 7);
        assert!(node.children.is_some(), "children preserved across the swap");
        let x = map.find(&obj("x")).expect("x kept");
        let through = x.paths[0].parent().expect("x has a parent");
        assert_eq!(through.last().instance, 7);
    }

    #[test]
    fn shared_child_survives_until_last_parent_drops_it() {
        let (mut map, _) = rooted(&["p", "q"]);
        let p = map.lookup(&obj("p")).expect("p present");
        let q = map.lookup(&obj("q")).expect("q present");
        map.replace_children(p, fetched(&["x"])).expect("p present");
        map.replace_children(q, fetched(&["x"])).expect("q present");
        assert_eq!(
            path_names(&map, "x"),
            vec![vec!["root", "p", "x"], vec!["root", "q", "x"]]
        );

        let pass = map.replace_children(p, fetched(&[])).expect("p present");
        assert!(pass.evicted.is_empty());
        assert_eq!(path_names(&map, "x"), vec![vec!["root", "q", "x"]]);
        assert!(map.node(p).expect("p present").is_leaf());

        let pass = map.replace_children(q, fetched(&[])).expect("q present");
        assert_eq!(pass.evicted.len(), 1);
        assert!(map.lookup(&obj("x")).is_none());
    }

    #[test]
    fn removal_cascades_through_loaded_subtree() {
        let (mut map, root) = rooted(&["a"]);
        let a = map.lookup(&obj("a")).expect("a present");
        map.replace_children(a, fetched(&["x", "y"])).expect("a present");

        let pass = map.replace_children(root, fetched(&[])).expect("root present");
        assert_eq!(pass.evicted.len(), 3);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn child_moving_up_is_kept() {
        let (mut map, root) = rooted(&["a"]);
        let a = map.lookup(&obj("a")).expect("a present");
        map.replace_children(a, fetched(&["x"])).expect("a present");
        let x = map.lookup(&obj("x")).expect("x present");

        let pass = map.replace_children(root, fetched(&["x"])).expect("root present");
        assert_eq!(pass.evicted.len(), 1);
        assert_eq!(map.lookup(&obj("x")), Some(x));
        assert_eq!(path_names(&map, "x"), vec![vec!["root", "x"]]);
    }

    #[test]
    fn cycles_are_not_followed() {
        let (mut map, _) = rooted(&["a"]);
        let a = map.lookup(&obj("a")).expect("a present");
        map.replace_children(a, fetched(&["root", "b"])).expect("a present");

        assert_eq!(path_names(&map, "root"), vec![vec!["root"]]);
        assert_eq!(path_names(&map, "b"), vec![vec!["root", "a", "b"]]);
    }

    #[test]
    fn duplicates_are_dropped() {
        let (mut map, root) = rooted(&[]);
        let pass = map
            .replace_children(root, fetched(&["a", "b", "a"]))
            .expect("root present");
        assert_eq!(pass.dropped_duplicates, 1);
        assert_eq!(names(&pass.new_children), vec!["a", "b"]);
    }

    #[test]
    fn leaf_flip_is_reported_for_loaded_nodes() {
        let (mut map, root) = rooted(&["a", "b"]);
        let a = map.lookup(&obj("a")).expect("a present");
        let b = map.lookup(&obj("b")).expect("b present");
        map.replace_children(a, fetched(&["x"])).expect("a present");
        map.replace_children(b, fetched(&["y"])).expect("b present");

        let says_leaf = LeafInfo {
            hint: Some(true),
            ..LeafInfo::default()
        };
        let pass = map
            .replace_children(
                root,
                vec![(obj("a"), says_leaf), (obj("b"), LeafInfo::default())],
            )
            .expect("root present");
        assert_eq!(names(&pass.leaf_flips), vec!["a"]);
        assert_eq!(names(&pass.loaded_kept), vec!["b"]);
    }

    #[test]
    fn new_leaf_hint_on_unloaded_child_is_a_change() {
        let leaf = |hint| LeafInfo {
            hint: Some(hint),
            ..LeafInfo::default()
        };
        let mut map = TreeMap::new();
        map.set_root(Some((obj("root"), LeafInfo::default())));
        let root = map.root_id().expect("root installed");
        map.replace_children(root, vec![(obj("a"), leaf(true)), (obj("b"), leaf(true))])
            .expect("root present");

        let pass = map
            .replace_children(root, vec![(obj("a"), leaf(true)), (obj("b"), leaf(false))])
            .expect("root present");
        assert_eq!(pass.diff.changed, vec![1]);
        assert!(pass.leaf_flips.is_empty());
        assert!(!map.find(&obj("b")).expect("b present").is_leaf());
    }

    #[test]
    fn root_swap_and_replace() {
        let (mut map, root) = rooted(&["a"]);
        let fresh = Obj {
            name: "root",
            instance: 3,
        };
        assert!(matches!(
            map.set_root(Some((fresh, LeafInfo::default()))),
            RootChange::Swapped
        ));
        assert_eq!(map.root_id(), Some(root));
        assert_eq!(path_names(&map, "a"), vec![vec!["root", "a"]]);
        let a_path = &map.find(&obj("a")).expect("a kept").paths[0];
        assert_eq!(a_path.parent().expect("parent").last().instance, 3);

        assert!(matches!(
            map.set_root(Some((obj("root"), LeafInfo::default()))),
            RootChange::Swapped
        ));
        assert!(matches!(
            map.set_root(Some((obj("root"), LeafInfo::default()))),
            RootChange::Unchanged
        ));

        match map.set_root(Some((obj("other"), LeafInfo::default()))) {
            RootChange::Replaced { evicted } => assert_eq!(evicted.len(), 2),
            _ => panic!("different root must replace the tree"),
        }
        assert_eq!(map.len(), 1);
        assert_eq!(map.root_object(), Some(&obj("other")));
    }
}
