//! Typed numeric lists for `T ∈ {u16, u32, u64, f64}` (`spec.md` §3/§4.2).
//!
//! `u8` gets its own trait in [`crate::containers::bytes`] because every
//! codec in this crate is byte-oriented; the wider widths are generic over
//! `T` instead of being macro-generated per type, since Rust generics cover
//! exactly this case without needing the teacher's `macro_rules!`
//! scaffolding (that scaffolding exists in `block.rs` to bind distinct
//! struct fields, not to repeat one trait impl across primitive types).

use std::cell::RefCell;
use std::rc::Rc;

/// A typed numeric list capability.
pub trait TypedList<T> {
    /// Number of elements.
    fn len(&self) -> usize;

    /// True if empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Typed indexed read (the "fast path" `spec.md` §4.2 mentions).
    fn get_element(&self, i: usize) -> Option<T>;

    /// Raw contiguous borrow; `None` for a virtual list.
    fn as_slice(&self) -> Option<&[T]>;

    /// Whether this instance permits mutation.
    fn is_mutable(&self) -> bool {
        false
    }
}

/// An owned, growable, mutable typed list.
#[derive(Debug, Default, Clone)]
pub struct OwnedTypedList<T>(pub Vec<T>);

impl<T> OwnedTypedList<T> {
    /// Wrap an existing vector.
    pub fn new(data: Vec<T>) -> Self {
        Self(data)
    }
}

impl<T: Copy> TypedList<T> for OwnedTypedList<T> {
    fn len(&self) -> usize {
        self.0.len()
    }
    fn get_element(&self, i: usize) -> Option<T> {
        self.0.get(i).copied()
    }
    fn as_slice(&self) -> Option<&[T]> {
        Some(&self.0)
    }
    fn is_mutable(&self) -> bool {
        true
    }
}

/// A non-owning view into a range of a parent [`OwnedTypedList`], with the
/// same "abort if the parent is resized" contract as [`super::bytes::ByteSubView`].
pub struct TypedSubView<T> {
    parent: Rc<RefCell<OwnedTypedList<T>>>,
    start: usize,
    len: usize,
    parent_len_at_creation: usize,
}

impl<T: Copy> TypedSubView<T> {
    /// Create a sub-view over `parent[start .. start+len]`.
    ///
    /// # Panics
    /// If the range is out of bounds of the parent's current length.
    pub fn new(parent: Rc<RefCell<OwnedTypedList<T>>>, start: usize, len: usize) -> Self {
        let parent_len = parent.borrow().len();
        assert!(
            start + len <= parent_len,
            "sub-view [{start}..{}) out of bounds of parent length {parent_len}",
            start + len
        );
        Self {
            parent,
            start,
            len,
            parent_len_at_creation: parent_len,
        }
    }

    fn check_parent_unchanged(&self) {
        let now = self.parent.borrow().len();
        assert_eq!(
            now, self.parent_len_at_creation,
            "TypedSubView: parent resized from {} to {} while a sub-view was alive",
            self.parent_len_at_creation, now
        );
    }
}

impl<T: Copy> TypedList<T> for TypedSubView<T> {
    fn len(&self) -> usize {
        self.check_parent_unchanged();
        self.len
    }
    fn get_element(&self, i: usize) -> Option<T> {
        self.check_parent_unchanged();
        if i >= self.len {
            return None;
        }
        self.parent.borrow().get_element(self.start + i)
    }
    fn as_slice(&self) -> Option<&[T]> {
        // Same reasoning as `ByteSubView::as_slice`: a `RefCell`-backed
        // parent can't hand out a borrow tied to `&self`.
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owned_u32_list_is_mutable() {
        let l = OwnedTypedList::new(vec![1u32, 2, 3]);
        assert!(l.is_mutable());
        assert_eq!(l.get_element(1), Some(2));
        assert_eq!(l.as_slice(), Some(&[1u32, 2, 3][..]));
    }

    #[test]
    fn sub_view_over_f64() {
        let parent = Rc::new(RefCell::new(OwnedTypedList::new(vec![1.0f64, 2.0, 3.0, 4.0])));
        let view = TypedSubView::new(parent, 1, 2);
        assert_eq!(view.len(), 2);
        assert_eq!(view.get_element(0), Some(2.0));
        assert_eq!(view.get_element(1), Some(3.0));
        assert_eq!(view.get_element(2), None);
    }

    #[test]
    #[should_panic(expected = "parent resized")]
    fn sub_view_aborts_on_parent_resize() {
        let parent = Rc::new(RefCell::new(OwnedTypedList::new(vec![1u16, 2, 3])));
        let view = TypedSubView::new(parent.clone(), 0, 3);
        parent.borrow_mut().0.push(4);
        let _ = view.len();
    }
}
