//! Error kinds shared by every component in this crate.
//!
//! Grounded in `examples/ThomasHabets-rustradio/src/lib.rs`'s hand-rolled
//! `Error { msg: String }` plus `From` conversions, but promoted to the
//! `thiserror`-derived enum the teacher's `Cargo.toml` already depends on
//! (`thiserror = "2.0"`) without ever using. `spec.md` §7 names five error
//! kinds; each gets its own variant here instead of a flat string.

use thiserror::Error;

/// Crate-wide result alias, mirroring the teacher's `pub type Result<T>`
/// convention (`rustradio::Result`).
pub type Result<T> = std::result::Result<T, Error>;

/// The crate's error type.
///
/// Every decoder latches the first `Error` it produces (§4.6, §4.7, §4.8)
/// rather than panicking or silently discarding malformed input.
#[derive(Debug, Error, Clone)]
pub enum Error {
    /// Malformed tag, bad magic, unsupported feature, invalid character
    /// class. The bulk of ASN.1/gzip/JPEG decode failures land here.
    #[error("{0}")]
    Protocol(String),

    /// CRC mismatch, length mismatch, duplicate component id: the data was
    /// syntactically parseable but internally inconsistent.
    #[error("{0}")]
    Consistency(String),

    /// A value exceeded a hard numeric limit (64-bit integer overflow, a
    /// data unit index out of range).
    #[error("{0}")]
    Capacity(String),

    /// An upstream I/O failure, wrapped with the operation that triggered
    /// it.
    #[error("I/O error: {0}")]
    Io(String),

    /// The operation was cancelled. Per §7, cancellation is signalled by
    /// returning zero bytes used and stopping, not normally surfaced as an
    /// `Error` — this variant exists for adapters (like the synchronous
    /// adapter) that must still return *something* when a read never
    /// completes because its cancel fired first.
    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    /// Shorthand for a `Protocol` error, the most common kind.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    /// Shorthand for a `Consistency` error.
    pub fn consistency(msg: impl Into<String>) -> Self {
        Error::Consistency(msg.into())
    }

    /// Shorthand for a `Capacity` error.
    pub fn capacity(msg: impl Into<String>) -> Self {
        Error::Capacity(msg.into())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

impl From<std::array::TryFromSliceError> for Error {
    fn from(e: std::array::TryFromSliceError) -> Self {
        Error::Protocol(e.to_string())
    }
}
