//! The demand-paging fault handler.
//!
//! Grounded on the original kernel's `vmfault`: validate the access, then dispatch to
//! the already-mapped fast path, a swap-in, or first materialization from a segment,
//! the heap, or the stack, in that order.

use core::fmt;

use crate::{
    fs::{IoError, SwapBackend},
    mm::{
        PAGE_SIZE,
        addr::{Align, MAXVA, MemoryAddress, VirtAddr},
        allocator::FrameAllocator,
        pagetable::{EntryFlags, PageSize, PageTableWalker},
    },
    proc::{evict, process::ProcessPagingState, swap},
};

/// The kind of access that triggered a fault, decoded from `scause` (12=exec,
/// 13=read, 15=store/AMO).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    /// Instruction fetch.
    Exec,
    /// Load.
    Read,
    /// Store or atomic memory operation.
    Write,
}

impl AccessKind {
    /// Decodes `scause` into an access kind, or `None` if it is not one of the three
    /// page-fault causes this subsystem handles.
    pub fn from_scause(scause: u64) -> Option<Self> {
        match scause {
            12 => Some(Self::Exec),
            13 => Some(Self::Read),
            15 => Some(Self::Write),
            _ => None,
        }
    }
}

impl fmt::Display for AccessKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AccessKind::Exec => "exec",
            AccessKind::Read => "read",
            AccessKind::Write => "write",
        })
    }
}

/// Why a process was killed by the fault handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillReason {
    /// The faulting address is outside every segment/heap/stack band, or the access
    /// does not match the mapping's permissions, or the address is non-canonical.
    InvalidAccess {
        /// The faulting (page-aligned) address.
        va: VirtAddr,
        /// The access that was attempted.
        access: AccessKind,
    },
    /// The per-process swap file has no free slots left to evict a dirty page into.
    SwapExhausted,
}

/// Error returned by [`handle_fault`] and the helpers it calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultError {
    /// The process must be killed; the caller sets its kill flag.
    Killed(KillReason),
    /// No frame could be obtained (allocator exhausted, and this process has no
    /// resident page left to evict).
    OutOfMemory,
    /// Reading the executable or the swap file failed.
    Io(IoError),
    /// The descriptor table is at capacity.
    OutOfDescriptors,
}

/// Returns the page table permissions a freshly-materialized page at `va` should be
/// mapped with: a segment's own declared permissions (always at least read), or `RW`
/// for anonymous heap/stack pages.
pub(crate) fn perm_for(state: &ProcessPagingState, va: VirtAddr) -> EntryFlags {
    match state.segments.find(va) {
        Some(seg) => seg.perm.to_entry_flags() | EntryFlags::READ | EntryFlags::USER,
        None => EntryFlags::RW | EntryFlags::USER,
    }
}

enum Cause {
    Segment,
    Heap,
    Stack,
}

fn classify(state: &ProcessPagingState, va: VirtAddr, sp: VirtAddr) -> Option<Cause> {
    if state.segments.find(va).is_some() {
        return Some(Cause::Segment);
    }

    let va = va.as_usize();
    let heap_start = state.heap_start.as_usize();
    let stack_bottom = state.stack_bottom.as_usize();
    let stack_top = state.stack_top.as_usize();
    let sz = state.sz.as_usize().align_up(PAGE_SIZE);

    let in_heap = (va >= heap_start && va < stack_bottom) || (va >= stack_top && va < sz);
    if in_heap {
        return Some(Cause::Heap);
    }

    let sp = sp.as_usize();
    let stack_floor = sp.align_down(PAGE_SIZE).saturating_sub(PAGE_SIZE);
    let in_stack = va >= stack_bottom && va < stack_top && (va >= stack_floor || sp >= stack_top);
    if in_stack {
        return Some(Cause::Stack);
    }

    None
}

/// Services a page fault at `va`, for the given `access` kind and current user stack
/// pointer `sp`.
///
/// On success, returns the physical address now backing `va`. On
/// [`FaultError::Killed`], the caller is responsible for marking the process as
/// killed; every other variant is non-fatal and simply propagates to the caller
/// (e.g. a failed `copy_in`/`copy_out`).
pub fn handle_fault(
    state: &mut ProcessPagingState,
    pid: u32,
    va: VirtAddr,
    access: AccessKind,
    sp: VirtAddr,
    allocator: &mut impl FrameAllocator<PAGE_SIZE>,
    swap_backend: &impl SwapBackend,
) -> Result<crate::mm::addr::PhysAddr, FaultError> {
    let va = va.align_down(PAGE_SIZE);

    if va.as_usize() >= MAXVA {
        kprintln!("[pid {}] KILL invalid-access va={:#x} access={}", pid, va.as_usize(), access);
        return Err(FaultError::Killed(KillReason::InvalidAccess { va, access }));
    }

    {
        let mut walker = PageTableWalker::new(&mut state.pagetable);
        walker.configure_direct_map(state.direct_map);

        if let Some(entry) = walker.leaf_entry(va) {
            if entry.is_valid() {
                let ok = entry.is_user()
                    && match access {
                        AccessKind::Exec => entry.is_exec(),
                        AccessKind::Read => entry.is_read(),
                        AccessKind::Write => entry.is_write(),
                    };

                if !ok {
                    kprintln!("[pid {}] KILL invalid-access va={:#x} access={}", pid, va.as_usize(), access);
                    return Err(FaultError::Killed(KillReason::InvalidAccess { va, access }));
                }

                let paddr = walker.virt_to_phys(va).expect("leaf entry was valid");

                if access == AccessKind::Write {
                    if let Some(d) = state.pages.find_mut(va) {
                        d.dirty = true;
                    }
                }

                return Ok(paddr);
            }
        }
    }

    if state.pages.find(va).is_some_and(|d| d.swapped) {
        kprintln!("[pid {}] PAGEFAULT va={:#x} access={} cause=swap", pid, va.as_usize(), access);

        let paddr = swap::swap_in(state, pid, va, allocator, swap_backend)?;

        if access == AccessKind::Write {
            if let Some(d) = state.pages.find_mut(va) {
                d.dirty = true;
            }
        }

        return Ok(paddr);
    }

    let cause = match classify(state, va, sp) {
        Some(cause) => cause,
        None => {
            kprintln!("[pid {}] KILL invalid-access va={:#x} access={}", pid, va.as_usize(), access);
            return Err(FaultError::Killed(KillReason::InvalidAccess { va, access }));
        }
    };

    let frame = evict::alloc_or_evict(state, pid, allocator, swap_backend)?;
    let ptr = frame.virt() as *mut u8;
    // SAFETY: frame was just allocated/reclaimed and is not otherwise referenced.
    unsafe { core::ptr::write_bytes(ptr, 0, PAGE_SIZE) };

    match cause {
        Cause::Segment => {
            kprintln!("[pid {}] PAGEFAULT va={:#x} access={} cause=exec", pid, va.as_usize(), access);

            let seg = *state.segments.find(va).expect("classify confirmed a segment");
            let offset_in_seg = va.as_usize() - seg.vaddr.as_usize();

            if offset_in_seg < seg.filesz {
                let to_read = core::cmp::min(PAGE_SIZE, seg.filesz - offset_in_seg);
                let file_offset = (seg.off + offset_in_seg) as u64;
                let exec_inode = state.exec_inode.as_ref().expect("segment fault requires an open executable");

                // SAFETY: buf covers to_read bytes of the just-zeroed frame.
                let buf = unsafe { core::slice::from_raw_parts_mut(ptr, to_read) };
                if let Err(e) = exec_inode.read_at(file_offset, buf) {
                    allocator.free(frame);
                    return Err(FaultError::Io(e));
                }
            }

            let perm = perm_for(state, va);
            let mut walker = PageTableWalker::new(&mut state.pagetable);
            walker.configure_direct_map(state.direct_map);
            // SAFETY: va was classified as unmapped above.
            if unsafe { walker.map(va, frame.phys(), PageSize::Kb, perm, allocator) }.is_err() {
                allocator.free(frame);
                return Err(FaultError::OutOfMemory);
            }

            kprintln!("[pid {}] LOADEXEC va={:#x}", pid, va.as_usize());
        }
        Cause::Heap | Cause::Stack => {
            let tag = if matches!(cause, Cause::Heap) { "heap" } else { "stack" };
            kprintln!("[pid {}] PAGEFAULT va={:#x} access={} cause={}", pid, va.as_usize(), access, tag);

            let perm = perm_for(state, va);
            let mut walker = PageTableWalker::new(&mut state.pagetable);
            walker.configure_direct_map(state.direct_map);
            // SAFETY: va was classified as unmapped above.
            if unsafe { walker.map(va, frame.phys(), PageSize::Kb, perm, allocator) }.is_err() {
                allocator.free(frame);
                return Err(FaultError::OutOfMemory);
            }

            kprintln!("[pid {}] ALLOC va={:#x}", pid, va.as_usize());
        }
    }

    let dirty = access == AccessKind::Write;
    match state.pages.insert_resident(va, dirty) {
        Ok(d) => {
            kprintln!("[pid {}] RESIDENT va={:#x} seq={}", pid, va.as_usize(), d.seq);
            Ok(frame.phys())
        }
        Err(_) => {
            let mut walker = PageTableWalker::new(&mut state.pagetable);
            walker.configure_direct_map(state.direct_map);
            walker.unmap(va);
            allocator.free(frame);
            Err(FaultError::OutOfDescriptors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        fs::test_support::MemSwapBackend,
        mm::allocator::BumpFrameAllocator,
        proc::{
            process::ProcessPagingState,
            segment::SegmentFlags,
        },
    };

    fn new_allocator(pages: usize) -> BumpFrameAllocator<PAGE_SIZE> {
        let layout = core::alloc::Layout::from_size_align(pages * PAGE_SIZE, PAGE_SIZE).unwrap();
        let ptr = unsafe { alloc::alloc::alloc_zeroed(layout) };
        assert!(!ptr.is_null());
        let base = crate::mm::addr::PhysAddr::new(ptr as usize);
        BumpFrameAllocator::new(base, base + pages * PAGE_SIZE)
    }

    fn new_state() -> ProcessPagingState {
        let mut state = ProcessPagingState::new();
        state.heap_start = VirtAddr::new(0x10000);
        state.stack_bottom = VirtAddr::new(0x11000);
        state.stack_top = VirtAddr::new(0x11000 + 4 * PAGE_SIZE);
        state.sz = state.stack_top;
        state
    }

    #[test]
    fn kills_on_address_beyond_maxva() {
        let mut state = new_state();
        let mut alloc = new_allocator(4);
        let backend = MemSwapBackend;
        let err = handle_fault(&mut state, 1, VirtAddr::new(MAXVA), AccessKind::Read, VirtAddr::new(0), &mut alloc, &backend);
        assert_eq!(err.unwrap_err(), FaultError::Killed(KillReason::InvalidAccess { va: VirtAddr::new(MAXVA), access: AccessKind::Read }));
    }

    #[test]
    fn kills_on_address_outside_any_band() {
        let mut state = new_state();
        let mut alloc = new_allocator(4);
        let backend = MemSwapBackend;
        let err = handle_fault(&mut state, 1, VirtAddr::new(0x1000), AccessKind::Read, VirtAddr::new(0x11800), &mut alloc, &backend);
        assert!(matches!(err.unwrap_err(), FaultError::Killed(KillReason::InvalidAccess { .. })));
    }

    #[test]
    fn null_write_kill_is_logged_on_the_console() {
        let con = crate::drivers::console::capturing();
        con.take();

        let mut state = new_state();
        let mut alloc = new_allocator(4);
        let backend = MemSwapBackend;
        let _ = handle_fault(&mut state, 7, VirtAddr::new(0), AccessKind::Write, VirtAddr::new(0x11800), &mut alloc, &backend);

        assert!(con.take().contains("[pid 7] KILL invalid-access va=0x0 access=write"));
    }

    #[test]
    fn materializes_a_zero_filled_heap_page() {
        let mut state = new_state();
        let mut alloc = new_allocator(4);
        let backend = MemSwapBackend;
        let va = state.heap_start;
        let paddr = handle_fault(&mut state, 1, va, AccessKind::Write, VirtAddr::new(0x11800), &mut alloc, &backend).unwrap();
        assert!(state.pages.find(va).unwrap().resident);
        assert!(state.pages.find(va).unwrap().dirty);
        let _ = paddr;
    }

    #[test]
    fn materializes_a_stack_page_near_sp() {
        let mut state = new_state();
        let mut alloc = new_allocator(4);
        let backend = MemSwapBackend;
        let sp = VirtAddr::new(0x12000 + 16);
        let va = VirtAddr::new(0x12000);
        handle_fault(&mut state, 1, va, AccessKind::Write, sp, &mut alloc, &backend).unwrap();
        assert!(state.pages.find(va).unwrap().resident);
    }

    #[test]
    fn second_access_to_resident_page_takes_fast_path_and_marks_dirty() {
        let mut state = new_state();
        let mut alloc = new_allocator(4);
        let backend = MemSwapBackend;
        let va = state.heap_start;
        handle_fault(&mut state, 1, va, AccessKind::Read, VirtAddr::new(0x11800), &mut alloc, &backend).unwrap();
        assert!(!state.pages.find(va).unwrap().dirty);
        handle_fault(&mut state, 1, va, AccessKind::Write, VirtAddr::new(0x11800), &mut alloc, &backend).unwrap();
        assert!(state.pages.find(va).unwrap().dirty);
    }

    #[test]
    fn loads_segment_page_from_executable() {
        let mut state = new_state();
        state.segments.push(VirtAddr::new(0x1000), PAGE_SIZE, PAGE_SIZE, 0, SegmentFlags::R | SegmentFlags::X).unwrap();
        state.exec_inode =
            Some(crate::fs::test_support::MemInode::new(alloc::vec![0xAB; PAGE_SIZE]) as alloc::sync::Arc<dyn crate::fs::Inode>);

        let mut alloc = new_allocator(4);
        let backend = MemSwapBackend;
        handle_fault(&mut state, 1, VirtAddr::new(0x1000), AccessKind::Exec, VirtAddr::new(0x11800), &mut alloc, &backend).unwrap();

        assert!(state.pages.find(VirtAddr::new(0x1000)).unwrap().resident);
    }
}
