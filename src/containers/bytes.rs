//! Byte-buffer identities (`spec.md` §3 "Byte buffer identities", §4.2).
//!
//! Four concrete implementations — owned array, sub-view, constant,
//! shared-memory — all satisfy the same [`ByteList`] capability. Only the
//! owned array reports itself mutable. Grounded in
//! `examples/ThomasHabets-rustradio/src/circular_buffer.rs` for the
//! `mmap`/`tempfile` pattern behind [`SharedMemoryBytes`].

use std::cell::RefCell;
use std::os::fd::AsRawFd;
use std::rc::Rc;

use libc::{c_int, c_void, off_t, size_t, MAP_FAILED, MAP_SHARED, PROT_READ, PROT_WRITE};

/// The typed-numeric-list capability specialized to `u8` (`spec.md` §3's
/// "Typed numeric list (T ∈ {u8, u16, u32, u64, f64})"). The generic form
/// for the other widths lives in [`crate::containers::typed_list`]; `u8` gets
/// its own trait because every codec in this crate operates on raw bytes.
pub trait ByteList {
    /// Number of bytes.
    fn len(&self) -> usize;

    /// True if there are no bytes.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Indexed read.
    fn get(&self, i: usize) -> Option<u8>;

    /// Raw contiguous borrow, or `None` for a virtual/non-contiguous list.
    /// All four concrete kinds here are contiguous, but the trait leaves
    /// room for ones that are not (e.g. a future rope-backed list).
    fn as_slice(&self) -> Option<&[u8]>;

    /// Whether `insert`/`remove`/`resize` are available on this instance.
    fn is_mutable(&self) -> bool {
        false
    }

    /// `take_data`: always returns an owned, heap-allocated buffer. If this
    /// list owns its storage outright it hands it over and becomes empty;
    /// otherwise (sub-view, constant, shared-memory) it copies.
    fn take_data(&mut self) -> Vec<u8> {
        self.as_slice().map(|s| s.to_vec()).unwrap_or_default()
    }
}

/// An owned, growable, mutable uint8 array. The only [`ByteList`] kind that
/// reports `is_mutable() == true`.
#[derive(Debug, Default, Clone)]
pub struct OwnedBytes(pub Vec<u8>);

impl OwnedBytes {
    /// Wrap an existing buffer.
    pub fn new(data: Vec<u8>) -> Self {
        Self(data)
    }

    /// Append bytes.
    pub fn append(&mut self, data: &[u8]) {
        self.0.extend_from_slice(data);
    }

    /// Shrink or grow, filling new space with zero.
    pub fn resize(&mut self, new_len: usize) {
        self.0.resize(new_len, 0);
    }
}

impl ByteList for OwnedBytes {
    fn len(&self) -> usize {
        self.0.len()
    }
    fn get(&self, i: usize) -> Option<u8> {
        self.0.get(i).copied()
    }
    fn as_slice(&self) -> Option<&[u8]> {
        Some(&self.0)
    }
    fn is_mutable(&self) -> bool {
        true
    }
    fn take_data(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.0)
    }
}

/// A non-owning view into a range of a parent [`OwnedBytes`].
///
/// `spec.md` §3: *"it remembers the parent's length at creation time and
/// aborts if the parent is later resized."* Every accessor re-checks the
/// parent's current length against the length recorded at construction;
/// this is the "checked abort" testable property (§8 law 4).
pub struct ByteSubView {
    parent: Rc<RefCell<OwnedBytes>>,
    start: usize,
    len: usize,
    parent_len_at_creation: usize,
}

impl ByteSubView {
    /// Create a sub-view `parent.data[start .. start+len]`.
    ///
    /// # Panics
    /// If `start + len` exceeds the parent's current length.
    pub fn new(parent: Rc<RefCell<OwnedBytes>>, start: usize, len: usize) -> Self {
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
            "ByteSubView: parent resized from {} to {} while a sub-view was alive",
            self.parent_len_at_creation, now
        );
    }
}

impl ByteList for ByteSubView {
    fn len(&self) -> usize {
        self.check_parent_unchanged();
        self.len
    }
    fn get(&self, i: usize) -> Option<u8> {
        self.check_parent_unchanged();
        if i >= self.len {
            return None;
        }
        self.parent.borrow().get(self.start + i)
    }
    fn as_slice(&self) -> Option<&[u8]> {
        // Borrowing out of a RefCell as `&[u8]` tied to `&self` isn't
        // possible without unsafe; sub-views are read through `get`/
        // `take_data` instead. Decoders in this crate only need
        // `take_data` (a copy) from a sub-view, never a zero-copy borrow.
        None
    }
    fn take_data(&mut self) -> Vec<u8> {
        self.check_parent_unchanged();
        let parent = self.parent.borrow();
        parent.0[self.start..self.start + self.len].to_vec()
    }
}

/// A borrow of a compile-time-constant byte region (`&'static [u8]`).
pub struct ConstBytes(pub &'static [u8]);

impl ByteList for ConstBytes {
    fn len(&self) -> usize {
        self.0.len()
    }
    fn get(&self, i: usize) -> Option<u8> {
        self.0.get(i).copied()
    }
    fn as_slice(&self) -> Option<&[u8]> {
        Some(self.0)
    }
}

/// An owned `mmap`'d region plus the file descriptor backing it.
///
/// Grounded directly in `circular_buffer.rs`'s `Circ`: a `tempfile` sized
/// to the desired length, mapped `MAP_SHARED` with `PROT_READ|PROT_WRITE`.
/// Unlike `Circ` this does not double-map for ring-buffer wraparound — a
/// shared-memory array is just a flat region, not a circular stream
/// buffer (that distinction lives in [`crate::stream`]).
pub struct SharedMemoryBytes {
    ptr: *mut u8,
    len: usize,
    // Kept alive for as long as the mapping exists; dropping it (after
    // munmap) closes the descriptor.
    _file: std::fs::File,
}

extern "C" {
    fn mmap(
        addr: *const c_void,
        len: size_t,
        prot: c_int,
        flags: c_int,
        fd: c_int,
        offset: off_t,
    ) -> *mut c_void;
    fn munmap(addr: *mut c_void, length: size_t) -> c_int;
}

impl SharedMemoryBytes {
    /// Allocate a new zero-filled shared-memory region of `len` bytes.
    pub fn new(len: usize) -> crate::Result<Self> {
        let file = tempfile::tempfile()?;
        file.set_len(len as u64)?;
        let fd = file.as_raw_fd();
        let ptr = unsafe {
            let p = mmap(
                std::ptr::null::<c_void>(),
                len as size_t,
                PROT_READ | PROT_WRITE,
                MAP_SHARED,
                fd,
                0,
            );
            if p == MAP_FAILED {
                return Err(crate::Error::Io("mmap failed".into()));
            }
            p as *mut u8
        };
        Ok(Self {
            ptr,
            len,
            _file: file,
        })
    }
}

impl Drop for SharedMemoryBytes {
    fn drop(&mut self) {
        // SAFETY: `ptr`/`len` describe exactly the region mapped in `new`,
        // and this is the only place that unmaps it.
        unsafe {
            munmap(self.ptr as *mut c_void, self.len as size_t);
        }
    }
}

// A `SharedMemoryBytes` owns its mapping exclusively; nothing else holds
// a pointer into it across threads concurrently.
unsafe impl Send for SharedMemoryBytes {}

impl ByteList for SharedMemoryBytes {
    fn len(&self) -> usize {
        self.len
    }
    fn get(&self, i: usize) -> Option<u8> {
        self.as_slice()?.get(i).copied()
    }
    fn as_slice(&self) -> Option<&[u8]> {
        // SAFETY: `ptr` is valid for `len` bytes for the lifetime of `self`.
        Some(unsafe { std::slice::from_raw_parts(self.ptr, self.len) })
    }
    fn is_mutable(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owned_bytes_is_mutable_and_takes_data() {
        let mut b = OwnedBytes::new(vec![1, 2, 3]);
        assert!(b.is_mutable());
        assert_eq!(b.len(), 3);
        assert_eq!(b.get(1), Some(2));
        let taken = b.take_data();
        assert_eq!(taken, vec![1, 2, 3]);
        assert_eq!(b.len(), 0);
    }

    #[test]
    fn sub_view_matches_parent_slice() {
        let parent = Rc::new(RefCell::new(OwnedBytes::new(vec![10, 20, 30, 40, 50])));
        let view = ByteSubView::new(parent.clone(), 1, 3);
        assert_eq!(view.len(), 3);
        for i in 0..3 {
            assert_eq!(view.get(i), Some(parent.borrow().0[1 + i]));
        }
        assert!(!view.is_mutable());
    }

    #[test]
    #[should_panic(expected = "parent resized")]
    fn sub_view_aborts_if_parent_resized() {
        let parent = Rc::new(RefCell::new(OwnedBytes::new(vec![1, 2, 3, 4])));
        let view = ByteSubView::new(parent.clone(), 0, 4);
        parent.borrow_mut().resize(2);
        let _ = view.len();
    }

    #[test]
    fn const_bytes_is_immutable() {
        static DATA: [u8; 3] = [7, 8, 9];
        let c = ConstBytes(&DATA);
        assert!(!c.is_mutable());
        assert_eq!(c.as_slice(), Some(&DATA[..]));
    }

    #[test]
    fn shared_memory_bytes_round_trips() {
        let mut shm = SharedMemoryBytes::new(16).expect("mmap should succeed");
        assert_eq!(shm.len(), 16);
        {
            let slice =
                unsafe { std::slice::from_raw_parts_mut(shm.ptr, shm.len) };
            slice[0] = 42;
        }
        assert_eq!(shm.get(0), Some(42));
    }
}
