//! Domain objects shown by the tree.

use std::fmt::Debug;
use std::hash::Hash;
use std::path::PathBuf;
use std::sync::Arc;

/// A caller-supplied value the tree can display.
///
/// Equality and hashing identify the *logical* object and must stay stable
/// while a node for it exists. Two equal values may still be different
/// instances; [`TreeObject::same_instance`] tells the model when an equal
/// object from a fresh fetch should replace the cached one.
pub trait TreeObject: Clone + Eq + Hash + Debug + Send + Sync + 'static {
    /// Returns true when `other` is the very instance already held.
    ///
    /// Value types have no separate identity, so the default says yes.
    fn same_instance(&self, other: &Self) -> bool {
        let _ = other;
        true
    }
}

impl<U> TreeObject for Arc<U>
where
    U: Eq + Hash + Debug + Send + Sync + 'static,
{
    fn same_instance(&self, other: &Self) -> bool {
        Arc::ptr_eq(self, other)
    }
}

macro_rules! value_objects {
    ($($ty:ty),* $(,)?) => {
        $(impl TreeObject for $ty {})*
    };
}

value_objects!(
    String,
    &'static str,
    PathBuf,
    char,
    bool,
    u8,
    u16,
    u32,
    u64,
    usize,
    i8,
    i16,
    i32,
    i64,
    isize,
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arc_identity_is_pointer_identity() {
        let first = Arc::new("node".to_string());
        let same = first.clone();
        let equal = Arc::new("node".to_string());

        assert!(first.same_instance(&same));
        assert_eq!(first, equal);
        assert!(!first.same_instance(&equal));
    }

    #[test]
    fn values_are_always_the_same_instance() {
        assert!(7u32.same_instance(&7));
        assert!("a".to_string().same_instance(&"a".to_string()));
    }
}
