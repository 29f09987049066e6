//! Engine error taxonomy.
//!
//! Every condition the host-driver shim needs to map onto an NT status code
//! is a distinct variant. Lookup misses are *not* errors — they are reported
//! through `Option` returns — and genuinely impossible states panic rather
//! than surfacing here.

use thiserror::Error;

/// Errors surfaced by the volume engine.
///
/// `Full` is always recoverable: free space or retry with a smaller request.
/// `OutOfMemory` means the host allocator refused; the two operations with
/// documented partial-completion semantics (`write` and a growing
/// `set_allocation_size`) may have made visible progress before reporting it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FsError {
    /// The byte budget cannot cover the requested charge.
    #[error("volume is full")]
    Full,

    /// The host allocator refused an allocation.
    #[error("out of memory")]
    OutOfMemory,

    /// An entry with the same name (under the volume's case policy) already
    /// exists in the target directory.
    #[error("an entry with that name already exists")]
    AlreadyExists,

    /// The operation requires a directory but the node is a regular file.
    #[error("not a directory")]
    NotADirectory,

    /// The operation requires a regular file but the node is a directory.
    #[error("is a directory")]
    IsADirectory,

    /// Reparse data was requested from a node without the reparse-point
    /// attribute.
    #[error("not a reparse point")]
    NotAReparsePoint,

    /// A path component is missing, or an intermediate component is not a
    /// directory.
    #[error("path not found")]
    PathNotFound,

    /// An intermediate path component is a directory carrying the
    /// reparse-point attribute; the caller must resolve the reparse point
    /// before continuing the walk.
    #[error("intermediate path component is a reparse point")]
    ReparseIntermediate,
}
