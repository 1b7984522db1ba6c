//! Generational node arena.
//!
//! Nodes live in a slab with a freelist. Handles carry the generation of the
//! slot they were issued for, so a handle that outlives its node (the node was
//! evicted and the slot reused) resolves to `None` instead of a stranger.

use std::fmt;

/// Handle to a node in the arena.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId {
    index: u32,
    generation: u32,
}

impl NodeId {
    pub fn index(&self) -> usize {
        self.index as usize
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({}v{})", self.index, self.generation)
    }
}

enum Slot<V> {
    /// Freelist link plus the generation the next occupant will get.
    Vacant { next: usize, generation: u32 },
    Occupied { generation: u32, value: V },
}

pub(crate) struct NodeArena<V> {
    slots: Vec<Slot<V>>,
    /// Head of the freelist; equals `slots.len()` when there is no free slot.
    next: usize,
    len: usize,
}

impl<V> NodeArena<V> {
    pub(crate) fn new() -> Self {
        Self {
            slots: Vec::new(),
            next: 0,
            len: 0,
        }
    }

    pub(crate) fn insert(&mut self, value: V) -> NodeId {
        self.len += 1;
        if self.next == self.slots.len() {
            let index = self.slots.len();
            self.slots.push(Slot::Occupied {
                generation: 0,
                value,
            });
            self.next = self.slots.len();
            return NodeId {
                index: slot_index(index),
                generation: 0,
            };
        }

        let index = self.next;
        let generation = match self.slots[index] {
            Slot::Vacant { next, generation } => {
                self.next = next;
                generation
            }
            // The freelist only ever links vacant slots.
            Slot::Occupied { .. } => unreachable!("freelist points at an occupied slot"),
        };
        self.slots[index] = Slot::Occupied { generation, value };
        NodeId {
            index: slot_index(index),
            generation,
        }
    }

    pub(crate) fn get(&self, id: NodeId) -> Option<&V> {
        match self.slots.get(id.index())? {
            Slot::Occupied { generation, value } if *generation == id.generation => Some(value),
            _ => None,
        }
    }

    pub(crate) fn get_mut(&mut self, id: NodeId) -> Option<&mut V> {
        match self.slots.get_mut(id.index())? {
            Slot::Occupied { generation, value } if *generation == id.generation => Some(value),
            _ => None,
        }
    }

    pub(crate) fn contains(&self, id: NodeId) -> bool {
        self.get(id).is_some()
    }

    pub(crate) fn remove(&mut self, id: NodeId) -> Option<V> {
        if !self.contains(id) {
            return None;
        }
        let vacant = Slot::Vacant {
            next: self.next,
            generation: id.generation.wrapping_add(1),
        };
        match std::mem::replace(&mut self.slots[id.index()], vacant) {
            Slot::Occupied { value, .. } => {
                self.next = id.index();
                self.len -= 1;
                Some(value)
            }
            Slot::Vacant { .. } => None,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (NodeId, &V)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| match slot {
                Slot::Occupied { generation, value } => Some((
                    NodeId {
                        index: slot_index(index),
                        generation: *generation,
                    },
                    value,
                )),
                Slot::Vacant { .. } => None,
            })
    }

    /// Removes every node, yielding the values.
    pub(crate) fn drain(&mut self) -> Vec<V> {
        let slots = std::mem::take(&mut self.slots);
        self.next = 0;
        self.len = 0;
        slots
            .into_iter()
            .filter_map(|slot| match slot {
                Slot::Occupied { value, .. } => Some(value),
                Slot::Vacant { .. } => None,
            })
            .collect()
    }
}

fn slot_index(index: usize) -> u32 {
    u32::try_from(index).unwrap_or_else(|_| panic!("node arena exceeded {} slots", u32::MAX))
}

impl<V> Default for NodeArena<V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_get_remove() {
        let mut arena = NodeArena::new();
        let a = arena.insert("a");
        let b = arena.insert("b");
        assert_eq!(arena.len(), 2);
        assert_eq!(arena.get(a), Some(&"a"));

        assert_eq!(arena.remove(a), Some("a"));
        assert_eq!(arena.get(a), None);
        assert_eq!(arena.remove(a), None);
        assert_eq!(arena.len(), 1);
        assert_eq!(arena.get(b), Some(&"b"));
    }

    #[test]
    fn reused_slot_rejects_stale_handle() {
        let mut arena = NodeArena::new();
        let first = arena.insert(1);
        arena.remove(first);
        let second = arena.insert(2);

        assert_eq!(first.index(), second.index());
        assert_ne!(first.generation(), second.generation());
        assert_eq!(arena.get(first), None);
        assert_eq!(arena.get(second), Some(&2));
    }

    #[test]
    fn drain_empties_the_arena() {
        let mut arena = NodeArena::new();
        arena.insert('x');
        let y = arena.insert('y');
        arena.insert('z');
        arena.remove(y);

        let mut drained = arena.drain();
        drained.sort();
        assert_eq!(drained, vec!['x', 'z']);
        assert!(arena.is_empty());
        assert_eq!(arena.iter().count(), 0);
    }
}
