//! Memory management: addresses, frame allocation, and the Sv39 page-table walker.

pub mod addr;
pub mod allocator;
pub mod pagetable;

pub use addr::Align;

/// Size in bytes of a single page, for every consumer of this crate.
pub const PAGE_SIZE: usize = 4096;

/// `log2(PAGE_SIZE)`.
pub const PAGE_SHIFT: usize = 12;
