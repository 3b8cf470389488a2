//! The file-system / inode-cache seam the paging subsystem calls through.
//!
//! The surrounding kernel's inode cache, `readi`/`writei`, and `begin_op`/`end_op`
//! transaction brackets are out of scope for this crate (see the crate-level
//! documentation). [`Inode`] stands in for all of it: the executable image the exec
//! loader keeps open and the fault handler reads segment bytes from, and the per-process
//! swap file the evictor and swap-in path read and write page-sized records through.

use alloc::sync::Arc;
use core::fmt;

/// Error returned by a failed [`Inode`] read or write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoError {
    /// The read or write returned fewer bytes than requested.
    ShortTransfer,
    /// The offset or length was out of range for this inode.
    OutOfBounds,
    /// The underlying storage rejected the operation (e.g. the host file system).
    Backend,
}

impl fmt::Display for IoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoError::ShortTransfer => write!(f, "short read/write"),
            IoError::OutOfBounds => write!(f, "offset out of bounds"),
            IoError::Backend => write!(f, "backend I/O error"),
        }
    }
}

/// A refcounted file the paging subsystem reads and writes page-sized records through.
///
/// Implementations correspond to `readi`/`writei`/the inode cache in the original kernel.
/// The executable inode recorded by the exec loader (§4.2) and the per-process swap file
/// (§4.5) are both modeled as `Arc<dyn Inode>` so that duplicating the handle (`idup` in
/// the original) is just a refcount bump.
pub trait Inode: Send + Sync {
    /// Reads exactly `buf.len()` bytes starting at `off` into `buf`.
    ///
    /// Returns [`IoError::ShortTransfer`] if fewer bytes are available.
    fn read_at(&self, off: u64, buf: &mut [u8]) -> Result<(), IoError>;

    /// Writes exactly `buf` at `off`, extending the backing store if necessary.
    fn write_at(&self, off: u64, buf: &[u8]) -> Result<(), IoError>;

    /// Returns the current size of the inode's contents in bytes, if known.
    fn size(&self) -> u64;
}

/// A collaborator that creates and removes the per-process swap file, standing in for
/// the kernel's `create`/path-based file system (§4.5, §9 "Swap file deletion").
pub trait SwapBackend: Send + Sync {
    /// Concrete inode type returned by [`create_swapfile`](SwapBackend::create_swapfile).
    type Inode: Inode + 'static;

    /// Lazily creates the swap file for the given PID, named `/pgswpNNNNN` (`NNNNN` is the
    /// zero-padded PID) in the spec's path convention.
    fn create_swapfile(&self, pid: u32) -> Result<Arc<Self::Inode>, IoError>;
}
