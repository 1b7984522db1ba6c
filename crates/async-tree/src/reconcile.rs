//! Child list diffing.
//!
//! Given the old and the new ordered child list of one parent, computes the
//! minimal notification sets: which old positions disappeared, which new
//! positions appeared, and which kept children moved relative to each other.

use std::hash::Hash;

use fnv::{FnvHashMap, FnvHashSet};

/// Index sets describing one reconciliation pass. All lists are ascending.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChildDiff {
    /// Positions in the old list.
    pub removed: Vec<usize>,
    /// Positions in the new list.
    pub inserted: Vec<usize>,
    /// Positions in the new list.
    pub changed: Vec<usize>,
}

impl ChildDiff {
    pub fn is_empty(&self) -> bool {
        self.removed.is_empty() && self.inserted.is_empty() && self.changed.is_empty()
    }

    /// Records an extra change at a position of the new list.
    pub(crate) fn mark_changed(&mut self, index: usize) {
        if let Err(position) = self.changed.binary_search(&index) {
            self.changed.insert(position, index);
        }
    }
}

/// Drops repeated entries, keeping the first occurrence of each.
///
/// Returns the number of dropped entries.
pub(crate) fn dedup_by_key<V, K>(items: &mut Vec<V>, key: impl Fn(&V) -> &K) -> usize
where
    K: Eq + Hash,
{
    let before = items.len();
    let mut seen: FnvHashSet<&K> = FnvHashSet::default();
    let mut keep = Vec::with_capacity(before);
    for item in items.iter() {
        keep.push(seen.insert(key(item)));
    }
    drop(seen);
    let mut flags = keep.into_iter();
    items.retain(|_| flags.next().unwrap_or(false));
    before - items.len()
}

/// Diffs two duplicate-free lists.
///
/// A kept child counts as changed when its position among the kept children
/// differs between the two lists.
pub fn diff<T: Eq + Hash>(old: &[T], new: &[T]) -> ChildDiff {
    let new_positions: FnvHashMap<&T, usize> =
        new.iter().enumerate().map(|(index, item)| (item, index)).collect();
    let old_positions: FnvHashMap<&T, usize> =
        old.iter().enumerate().map(|(index, item)| (item, index)).collect();

    let removed = old
        .iter()
        .enumerate()
        .filter(|(_, item)| !new_positions.contains_key(item))
        .map(|(index, _)| index)
        .collect();

    let mut inserted = Vec::new();
    let mut kept_new = Vec::new();
    for (index, item) in new.iter().enumerate() {
        if old_positions.contains_key(item) {
            kept_new.push(index);
        } else {
            inserted.push(index);
        }
    }

    let kept_old: Vec<&T> = old
        .iter()
        .filter(|item| new_positions.contains_key(item))
        .collect();
    let changed = kept_new
        .iter()
        .enumerate()
        .filter(|(rank, index)| kept_old[*rank] != &new[**index])
        .map(|(_, index)| *index)
        .collect();

    ChildDiff {
        removed,
        inserted,
        changed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replacement_at_both_ends() {
        let diff = diff(&["a", "b", "c"], &["b", "c", "d"]);
        assert_eq!(diff.removed, vec![0]);
        assert_eq!(diff.inserted, vec![2]);
        assert!(diff.changed.is_empty());
    }

    #[test]
    fn rotation_changes_every_kept_child() {
        let diff = diff(&[1, 2, 3], &[3, 1, 2]);
        assert!(diff.removed.is_empty());
        assert!(diff.inserted.is_empty());
        assert_eq!(diff.changed, vec![0, 1, 2]);
    }

    #[test]
    fn swap_of_two_leaves_rest_alone() {
        let diff = diff(&[1, 2, 3, 4], &[1, 3, 2, 4]);
        assert_eq!(diff.changed, vec![1, 2]);
    }

    #[test]
    fn identical_lists_are_empty() {
        assert!(diff(&[1, 2], &[1, 2]).is_empty());
        assert!(diff::<u8>(&[], &[]).is_empty());
    }

    #[test]
    fn clearing_removes_everything() {
        let diff = diff(&['x', 'y'], &[]);
        assert_eq!(diff.removed, vec![0, 1]);
        assert!(diff.inserted.is_empty());
    }

    #[test]
    fn dedup_keeps_first_occurrence() {
        let mut items = vec![("a", 1), ("b", 2), ("a", 3), ("c", 4), ("b", 5)];
        let dropped = dedup_by_key(&mut items, |(name, _)| name);
        assert_eq!(dropped, 2);
        assert_eq!(items, vec![("a", 1), ("b", 2), ("c", 4)]);
    }

    #[test]
    fn mark_changed_keeps_order_and_uniqueness() {
        let mut diff = ChildDiff {
            changed: vec![1, 4],
            ..ChildDiff::default()
        };
        diff.mark_changed(3);
        diff.mark_changed(4);
        assert_eq!(diff.changed, vec![1, 3, 4]);
    }
}
