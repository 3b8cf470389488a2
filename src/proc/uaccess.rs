//! Crossing the kernel/user boundary: `copy_out` and `copy_in`.
//!
//! Grounded on the original kernel's `copyout`/`copyin`: walk the destination or
//! source address a page at a time, faulting in any page that is not yet mapped
//! (rather than failing outright), and forbidding writes into a read-only mapping.

use crate::{
    fs::SwapBackend,
    mm::{
        PAGE_SIZE,
        addr::{Align, MAXVA, MemoryAddress, PhysAddr, VirtAddr},
        allocator::FrameAllocator,
        pagetable::PageTableWalker,
    },
    proc::{
        fault::{AccessKind, handle_fault},
        process::ProcessPagingState,
    },
};

/// Error returned by [`copy_out`]/[`copy_in`] when a user address cannot be serviced.
///
/// Grounded on the original's `-1` return from `copyout`/`copyin`; this crate never
/// panics on a bad user pointer, since a syscall argument is an untrusted boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UaccessError;

fn lookup_mapped(state: &mut ProcessPagingState, va: VirtAddr) -> Option<PhysAddr> {
    let mut walker = PageTableWalker::new(&mut state.pagetable);
    walker.configure_direct_map(state.direct_map);

    let entry = walker.leaf_entry(va)?;
    if !entry.is_valid() || !entry.is_user() {
        return None;
    }

    walker.virt_to_phys(va)
}

/// Copies `src` into the process's address space starting at `dst_va`, faulting in
/// any unmapped destination page as it goes.
///
/// Fails (without killing the process) on a non-canonical address or a write into a
/// read-only mapping, matching `copyout`'s explicit refusal to overwrite user text.
pub fn copy_out(
    state: &mut ProcessPagingState,
    pid: u32,
    sp: VirtAddr,
    mut dst_va: VirtAddr,
    mut src: &[u8],
    allocator: &mut impl FrameAllocator<PAGE_SIZE>,
    swap_backend: &impl SwapBackend,
) -> Result<(), UaccessError> {
    while !src.is_empty() {
        let va0 = dst_va.align_down(PAGE_SIZE);
        if va0.as_usize() >= MAXVA {
            return Err(UaccessError);
        }

        let paddr = match lookup_mapped(state, va0) {
            Some(paddr) => paddr,
            None => handle_fault(state, pid, va0, AccessKind::Write, sp, allocator, swap_backend).map_err(|_| UaccessError)?,
        };

        let writable = {
            let mut walker = PageTableWalker::new(&mut state.pagetable);
            walker.configure_direct_map(state.direct_map);
            walker.leaf_entry(va0).is_some_and(|e| e.is_write())
        };
        if !writable {
            return Err(UaccessError);
        }

        let off = dst_va.as_usize() - va0.as_usize();
        let n = core::cmp::min(PAGE_SIZE - off, src.len());

        let ptr = state.direct_map.to_virt(paddr).as_mut_ptr::<u8>();
        // SAFETY: paddr is a page this process owns, reachable through the direct
        // map for exactly PAGE_SIZE bytes; off + n <= PAGE_SIZE.
        unsafe {
            core::ptr::copy_nonoverlapping(src.as_ptr(), ptr.add(off), n);
        }

        if let Some(d) = state.pages.find_mut(va0) {
            d.dirty = true;
        }

        src = &src[n..];
        dst_va = va0 + PAGE_SIZE;
    }

    Ok(())
}

/// Copies `dst.len()` bytes from the process's address space starting at `src_va`
/// into `dst`, faulting in any unmapped source page as it goes.
pub fn copy_in(
    state: &mut ProcessPagingState,
    pid: u32,
    sp: VirtAddr,
    dst: &mut [u8],
    mut src_va: VirtAddr,
    allocator: &mut impl FrameAllocator<PAGE_SIZE>,
    swap_backend: &impl SwapBackend,
) -> Result<(), UaccessError> {
    let mut dst = dst;

    while !dst.is_empty() {
        let va0 = src_va.align_down(PAGE_SIZE);
        if va0.as_usize() >= MAXVA {
            return Err(UaccessError);
        }

        let paddr = match lookup_mapped(state, va0) {
            Some(paddr) => paddr,
            None => handle_fault(state, pid, va0, AccessKind::Read, sp, allocator, swap_backend).map_err(|_| UaccessError)?,
        };

        let off = src_va.as_usize() - va0.as_usize();
        let n = core::cmp::min(PAGE_SIZE - off, dst.len());

        let ptr = state.direct_map.to_virt(paddr).as_ptr::<u8>();
        // SAFETY: paddr is a page this process owns, reachable through the direct
        // map for exactly PAGE_SIZE bytes; off + n <= PAGE_SIZE.
        unsafe {
            core::ptr::copy_nonoverlapping(ptr.add(off), dst.as_mut_ptr(), n);
        }

        let (_, rest) = dst.split_at_mut(n);
        dst = rest;
        src_va = va0 + PAGE_SIZE;
    }

    Ok(())
}
