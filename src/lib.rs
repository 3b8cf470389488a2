//! rv6 is an educational, Unix-like kernel inspired by
//! [xv6](https://pdos.csail.mit.edu/6.828/2020/xv6.html), with a focus on the RISC-V architecture.
//!
//! This crate carries the kernel's per-process **demand-paging and swap subsystem**: a
//! page-table walker, a per-process page-descriptor table, a FIFO evictor, a per-process
//! swap file, and the ELF-deferred exec loader that feeds the fault handler. The process
//! table, scheduler, trap dispatcher, file system and console driver that would normally
//! surround this subsystem are represented as narrow traits (see [`fs`] and
//! [`mm::allocator`]) so the whole thing builds and tests on a host target.

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

extern crate alloc;

/// Utility macros.
#[macro_use]
mod macros;

/// Console sink that [`kprintln!`] writes through.
pub mod drivers;

/// The file-system/inode-cache seam the paging subsystem calls through.
pub mod fs;

/// ELF64 header and program-header parsing.
pub mod elf;

/// Memory management facilities: addresses, frame allocation, the Sv39 page-table walker.
pub mod mm;

/// Panic support.
pub mod panic;

/// Per-process paging state: segments, descriptors, swap, fault handler, evictor, exec.
pub mod proc;

/// Thin syscall wrappers (`sbrk`, `memstat`) over the paging subsystem.
pub mod syscall;
