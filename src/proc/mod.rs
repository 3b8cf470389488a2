//! Per-process demand-paging state: segments, page descriptors, swap, the fault
//! handler, the evictor, and the exec/fork/exit orchestration built on top of them.
//!
//! The process table, scheduler, and trap dispatcher that would normally own a
//! [`Process`] are out of scope here; this module only owns the paging-relevant
//! slice of process state.

pub mod descriptor;
pub mod evict;
pub mod exec;
pub mod fault;
pub mod memstat;
pub mod process;
pub mod segment;
pub mod swap;
pub mod uaccess;

#[cfg(test)]
mod scenarios;

/// Capacity of a process's page-descriptor table.
pub const MAX_SWAP_PAGES: usize = 1024;

/// Capacity of a process's loadable-segment table.
pub const MAX_SEGMENTS: usize = 8;

/// Number of stack pages mapped below the guard page at exec time (lazily grown).
pub const USERSTACK: usize = 10;

/// Maximum number of argv entries accepted by exec.
pub const MAXARG: usize = 32;

/// Capacity of the per-page record array returned by `memstat`.
pub const MAX_PAGES_INFO: usize = 64;

/// Virtual address one page below the process's trapframe, itself reserved by the
/// out-of-scope trap-return sequence. `sbrk` may not grow `sz` past this landmark.
pub const TRAPFRAME: usize = crate::mm::addr::MAXVA - 2 * crate::mm::PAGE_SIZE;

pub use descriptor::{DescriptorTable, PageDescriptor};
pub use evict::evict_page;
pub use exec::{ExecError, ExecImage, exec};
pub use fault::{AccessKind, FaultError, KillReason, handle_fault};
pub use memstat::{MemStat, PageState, PageStat};
pub use process::{Process, ProcessPagingState, SbrkMode, Trapframe};
pub use segment::{Segment, SegmentFlags, SegmentMap};
pub use swap::{SwapBitmap, SwapFile};
pub use uaccess::{UaccessError, copy_in, copy_out};
