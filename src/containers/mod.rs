//! Typed containers (C2): lists of `T`, ordered maps, and strings.
//!
//! See `spec.md` §3 "Data Model" and §4.2 "Typed containers".

pub mod bytes;
pub mod map;
pub mod string;
pub mod typed_list;

pub use bytes::{ByteList, ByteSubView, ConstBytes, OwnedBytes, SharedMemoryBytes};
pub use map::OrderedMap;
pub use string::RtString;
pub use typed_list::{OwnedTypedList, TypedList, TypedSubView};
