//! FIFO page replacement within a single process's own resident set.
//!
//! Grounded on the original kernel's `evict_page`/`swapout_page`: pick the oldest
//! resident page by sequence number, and either discard it (if it is clean and can be
//! reloaded verbatim from the executable) or write it to the per-process swap file.

use alloc::sync::Arc;

use crate::{
    fs::{IoError, SwapBackend},
    mm::{
        PAGE_SIZE,
        addr::MemoryAddress,
        allocator::{Frame, FrameAllocator},
        pagetable::PageTableWalker,
    },
    proc::{
        fault::FaultError,
        process::ProcessPagingState,
        swap::SwapFile,
    },
};

/// Error returned by [`evict_page`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictError {
    /// This process has no resident page left to evict.
    NoVictim,
    /// The swap file is at capacity; the caller kills the process.
    SwapFull,
    /// The swap file write failed.
    Io(IoError),
}

/// Picks the FIFO victim among this process's resident pages and reclaims its frame,
/// discarding it outright or writing it to swap first.
///
/// Returns the reclaimed [`Frame`], ready to be reused directly by the caller (frame
/// allocators in this crate never reclaim freed frames, see
/// [`crate::mm::allocator::BumpFrameAllocator`]).
pub fn evict_page(
    state: &mut ProcessPagingState,
    pid: u32,
    swap_backend: &impl SwapBackend,
) -> Result<Frame, EvictError> {
    let victim = state.pages.fifo_victim().copied().ok_or(EvictError::NoVictim)?;
    let va = victim.va;

    kprintln!("[pid {}] VICTIM va={:#x} seq={} algo=FIFO", pid, va.as_usize(), victim.seq);

    let has_backing_store = state
        .segments
        .find(va)
        .is_some_and(|seg| seg.has_backing_store(va.as_usize() - seg.vaddr.as_usize()));

    let should_swap = victim.dirty || !has_backing_store;

    let mut walker = PageTableWalker::new(&mut state.pagetable);
    walker.configure_direct_map(state.direct_map);
    let paddr = walker.unmap(va).expect("FIFO victim must have a mapped leaf");
    let ptr = state.direct_map.to_virt(paddr).as_mut_ptr::<u8>();

    if should_swap {
        if state.swapfile.is_none() {
            let inode = swap_backend.create_swapfile(pid).map_err(EvictError::Io)?;
            state.swapfile = Some(SwapFile::new(inode as Arc<dyn crate::fs::Inode>));
        }

        let slot = match state.swap_slots.alloc() {
            Some(slot) => slot,
            None => {
                kprintln!("[pid {}] SWAPFULL", pid);
                kprintln!("[pid {}] KILL swap-exhausted", pid);
                return Err(EvictError::SwapFull);
            }
        };

        // SAFETY: ptr was just unmapped from this process's own page table and is
        // reachable through the direct map for exactly PAGE_SIZE bytes; the frame's
        // contents survive the unmap until the caller reuses or frees it.
        let page = unsafe { &*(ptr as *const [u8; PAGE_SIZE]) };

        let swapfile = state.swapfile.as_ref().expect("just created above");
        if let Err(e) = swapfile.write_page(slot, page) {
            state.swap_slots.free(slot);
            return Err(EvictError::Io(e));
        }

        kprintln!("[pid {}] SWAPOUT va={:#x} slot={}", pid, va.as_usize(), slot);

        let d = state.pages.find_mut(va).expect("victim descriptor must still be tracked");
        d.swapped = true;
        d.resident = false;
        d.swap_offset = slot;
        kprintln!("[pid {}] EVICT va={:#x} state={}", pid, va.as_usize(), if victim.dirty { "dirty" } else { "clean" });
    } else {
        kprintln!("[pid {}] EVICT va={:#x} state=clean", pid, va.as_usize());
        kprintln!("[pid {}] DISCARD va={:#x}", pid, va.as_usize());
        state.pages.remove(va);
    }

    Ok(Frame::at(paddr, ptr as *mut ()))
}

/// Allocates a fresh frame, falling back to evicting this process's own FIFO victim
/// when the allocator is exhausted.
pub(crate) fn alloc_or_evict(
    state: &mut ProcessPagingState,
    pid: u32,
    allocator: &mut impl FrameAllocator<PAGE_SIZE>,
    swap_backend: &impl SwapBackend,
) -> Result<Frame, FaultError> {
    if let Some(frame) = allocator.alloc(1) {
        return Ok(frame);
    }

    kprintln!("[pid {}] MEMFULL", pid);

    evict_page(state, pid, swap_backend).map_err(|e| match e {
        EvictError::NoVictim => FaultError::OutOfMemory,
        EvictError::SwapFull => FaultError::Killed(crate::proc::fault::KillReason::SwapExhausted),
        EvictError::Io(e) => FaultError::Io(e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        fs::test_support::MemSwapBackend,
        mm::{
            addr::VirtAddr,
            allocator::BumpFrameAllocator,
            pagetable::{DirectMap, EntryFlags, PageSize},
        },
        proc::{
            descriptor::DescriptorTable,
            segment::{SegmentFlags, SegmentMap},
        },
    };

    fn new_allocator(pages: usize) -> (BumpFrameAllocator<PAGE_SIZE>, crate::mm::addr::PhysAddr) {
        let layout = core::alloc::Layout::from_size_align(pages * PAGE_SIZE, PAGE_SIZE).unwrap();
        let ptr = unsafe { alloc::alloc::alloc_zeroed(layout) };
        assert!(!ptr.is_null());
        let base = crate::mm::addr::PhysAddr::new(ptr as usize);
        (BumpFrameAllocator::new(base, base + pages * PAGE_SIZE), base)
    }

    fn new_state(alloc: &mut BumpFrameAllocator<PAGE_SIZE>) -> ProcessPagingState {
        let mut state = ProcessPagingState::new();
        state.direct_map = DirectMap::new(0);
        let va = VirtAddr::new(0x1000);
        let frame = alloc.alloc(1).unwrap();
        let mut walker = PageTableWalker::new(&mut state.pagetable);
        walker.configure_direct_map(state.direct_map);
        unsafe {
            walker.map(va, frame.phys(), PageSize::Kb, EntryFlags::RW | EntryFlags::USER, alloc).unwrap();
        }
        state.pages.insert_resident(va, false).unwrap();
        state
    }

    #[test]
    fn evicts_clean_backed_page_by_discarding() {
        let (mut alloc, _) = new_allocator(4);
        let mut state = new_state(&mut alloc);
        state.segments = SegmentMap::new();
        state.segments.push(VirtAddr::new(0x1000), PAGE_SIZE, PAGE_SIZE, 0, SegmentFlags::R | SegmentFlags::X).unwrap();

        let backend = MemSwapBackend;
        evict_page(&mut state, 1, &backend).unwrap();

        assert!(state.pages.find(VirtAddr::new(0x1000)).is_none());
    }

    #[test]
    fn evicts_dirty_page_by_swapping_out() {
        let (mut alloc, _) = new_allocator(4);
        let mut state = new_state(&mut alloc);
        state.pages.find_mut(VirtAddr::new(0x1000)).unwrap().dirty = true;

        let backend = MemSwapBackend;
        evict_page(&mut state, 1, &backend).unwrap();

        let d = state.pages.find(VirtAddr::new(0x1000)).unwrap();
        assert!(d.swapped);
        assert!(!d.resident);
        assert!(state.swapfile.is_some());
    }

    #[test]
    fn evict_with_no_resident_pages_fails() {
        let mut state = ProcessPagingState::new();
        let backend = MemSwapBackend;
        assert_eq!(evict_page(&mut state, 1, &backend).unwrap_err(), EvictError::NoVictim);
    }

    #[test]
    fn swap_exhaustion_is_reported() {
        let (mut alloc, _) = new_allocator(4);
        let mut state = new_state(&mut alloc);
        state.pages.find_mut(VirtAddr::new(0x1000)).unwrap().dirty = true;
        for _ in 0..crate::proc::MAX_SWAP_PAGES {
            state.swap_slots.alloc();
        }

        let backend = MemSwapBackend;
        assert_eq!(evict_page(&mut state, 1, &backend).unwrap_err(), EvictError::SwapFull);
    }
}
