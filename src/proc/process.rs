//! The paging-relevant slice of a process: its page table and demand-paging metadata,
//! plus `sbrk`, `fork`, and `exit` built on top of the fault handler and evictor.
//!
//! Grounded on the original kernel's `struct proc`'s paging fields, `sys_sbrk`, and the
//! `kfork`/`kexit` lifecycle (the scheduler, trap dispatch, and the rest of `struct proc`
//! are out of scope).

use core::sync::atomic::{AtomicBool, Ordering};

use alloc::sync::Arc;

use crate::{
    fs::{Inode, SwapBackend},
    mm::{
        PAGE_SIZE,
        addr::{Align, MemoryAddress, PhysAddr, VirtAddr},
        allocator::{Frame, FrameAllocator},
        pagetable::{DirectMap, PageSize, PageTable, PageTableWalker},
    },
    proc::{
        descriptor::DescriptorTable,
        evict,
        fault::{self, AccessKind, FaultError},
        segment::SegmentMap,
        swap::{SwapBitmap, SwapFile},
        uaccess::{self, UaccessError},
    },
};

/// Whether a positive `sbrk` grows the address space eagerly (materializing pages
/// immediately) or lazily (bumping `sz` and letting the fault handler do the work).
///
/// Grounded on `sys_sbrk`'s `t` argument (`SBRK_EAGER`/`SBRK_LAZY`): a shrink always
/// takes the eager path regardless of `mode`, since there is no lazy way to free memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SbrkMode {
    /// Grow by allocating and zeroing every new page immediately.
    Eager,
    /// Grow by only bumping `sz`; pages materialize on first fault.
    Lazy,
}

/// The architectural register state a trap return and an exec image hand off through.
///
/// Stands in for the original kernel's much larger `struct trapframe`; this crate only
/// cares about the fields the exec loader initializes.
#[derive(Debug, Clone, Copy, Default)]
pub struct Trapframe {
    /// Initial program counter (the ELF entry point).
    pub epc: usize,
    /// Initial user stack pointer.
    pub sp: usize,
    /// `argc`, returned to `main` in `a0`.
    pub a0: u64,
    /// `argv`, passed to `main` in `a1`.
    pub a1: u64,
}

/// A process's demand-paging state: its page table, recorded segments, page
/// descriptors, swap bookkeeping, and address-space landmarks.
pub struct ProcessPagingState {
    /// Root of this process's Sv39 page table.
    pub pagetable: PageTable,
    /// Recorded `PT_LOAD` segments.
    pub segments: SegmentMap,
    /// Per-page demand-paging metadata.
    pub pages: DescriptorTable,
    /// Swap slot allocator for this process's swap file.
    pub swap_slots: SwapBitmap,
    /// This process's swap file, created lazily on first eviction.
    pub swapfile: Option<SwapFile>,
    /// The open executable inode, kept for demand-loading segment pages.
    pub exec_inode: Option<Arc<dyn Inode>>,
    /// First byte above the highest recorded segment, page-aligned: where the heap
    /// (and the guard page) begin.
    pub heap_start: VirtAddr,
    /// First byte of the mapped stack region (one page above the guard page).
    pub stack_bottom: VirtAddr,
    /// First byte above the stack region.
    pub stack_top: VirtAddr,
    /// Current address-space size; `sbrk` grows or shrinks it.
    pub sz: VirtAddr,
    /// Direct map used to dereference intermediate page-table frames.
    pub direct_map: DirectMap,
}

impl Default for ProcessPagingState {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessPagingState {
    /// Creates an empty paging state: no segments, no pages, an empty page table.
    pub const fn new() -> Self {
        Self {
            pagetable: PageTable::new(),
            segments: SegmentMap::new(),
            pages: DescriptorTable::new(),
            swap_slots: SwapBitmap::new(),
            swapfile: None,
            exec_inode: None,
            // SAFETY: zero is a valid (if meaningless) placeholder address.
            heap_start: unsafe { VirtAddr::new_unchecked(0) },
            // SAFETY: see above.
            stack_bottom: unsafe { VirtAddr::new_unchecked(0) },
            // SAFETY: see above.
            stack_top: unsafe { VirtAddr::new_unchecked(0) },
            // SAFETY: see above.
            sz: unsafe { VirtAddr::new_unchecked(0) },
            direct_map: DirectMap::new(0),
        }
    }
}

/// Error returned by [`Process::sbrk`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SbrkError {
    /// The requested size would overflow or cross [`crate::proc::TRAPFRAME`].
    OutOfRange,
    /// Eager growth or shrink ran into a fault-handling error.
    Fault(FaultError),
}

impl From<FaultError> for SbrkError {
    fn from(e: FaultError) -> Self {
        Self::Fault(e)
    }
}

/// A process and everything this crate tracks about it.
pub struct Process {
    /// Process ID, used only to tag console output.
    pub pid: u32,
    /// This process's paging state.
    pub state: ProcessPagingState,
    /// Register state handed to/from a trap.
    pub trapframe: Trapframe,
    killed: AtomicBool,
}

impl Process {
    /// Creates a new process with empty paging state.
    pub fn new(pid: u32) -> Self {
        Self { pid, state: ProcessPagingState::new(), trapframe: Trapframe::default(), killed: AtomicBool::new(false) }
    }

    /// Marks this process as killed; the scheduler (out of scope) is responsible for
    /// actually tearing it down at the next safe point.
    pub fn kill(&self) {
        self.killed.store(true, Ordering::SeqCst);
    }

    /// Returns whether this process has been marked killed.
    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    /// Services a page fault at `va` for this process.
    pub fn fault(
        &mut self,
        va: VirtAddr,
        access: AccessKind,
        allocator: &mut impl FrameAllocator<PAGE_SIZE>,
        swap_backend: &impl SwapBackend,
    ) -> Result<PhysAddr, FaultError> {
        let sp = VirtAddr::new(self.trapframe.sp);
        fault::handle_fault(&mut self.state, self.pid, va, access, sp, allocator, swap_backend)
    }

    /// Copies `src` into this process's address space at `dst_va`.
    pub fn copy_out(
        &mut self,
        dst_va: VirtAddr,
        src: &[u8],
        allocator: &mut impl FrameAllocator<PAGE_SIZE>,
        swap_backend: &impl SwapBackend,
    ) -> Result<(), UaccessError> {
        let sp = VirtAddr::new(self.trapframe.sp);
        uaccess::copy_out(&mut self.state, self.pid, sp, dst_va, src, allocator, swap_backend)
    }

    /// Copies from this process's address space at `src_va` into `dst`.
    pub fn copy_in(
        &mut self,
        dst: &mut [u8],
        src_va: VirtAddr,
        allocator: &mut impl FrameAllocator<PAGE_SIZE>,
        swap_backend: &impl SwapBackend,
    ) -> Result<(), UaccessError> {
        let sp = VirtAddr::new(self.trapframe.sp);
        uaccess::copy_in(&mut self.state, self.pid, sp, dst, src_va, allocator, swap_backend)
    }

    /// Grows or shrinks the address space by `delta` bytes, returning the previous
    /// `sz` (the convention `sys_sbrk` returns to user space).
    ///
    /// A negative `delta` always takes the eager path, unmapping and freeing every
    /// page (resident or swapped) beyond the new size. A positive `delta` in
    /// [`SbrkMode::Lazy`] only bumps `sz`; [`SbrkMode::Eager`] materializes the new
    /// pages immediately.
    pub fn sbrk(
        &mut self,
        delta: isize,
        mode: SbrkMode,
        allocator: &mut impl FrameAllocator<PAGE_SIZE>,
        swap_backend: &impl SwapBackend,
    ) -> Result<usize, SbrkError> {
        let old_sz = self.state.sz.as_usize();

        if mode == SbrkMode::Eager || delta < 0 {
            let new_sz = old_sz.checked_add_signed(delta).ok_or(SbrkError::OutOfRange)?;

            if delta < 0 {
                self.shrink_to(new_sz, allocator);
            } else {
                self.grow_eager(old_sz, new_sz, allocator, swap_backend)?;
            }

            self.state.sz = VirtAddr::new(new_sz);
        } else {
            let new_sz = old_sz.checked_add_signed(delta).ok_or(SbrkError::OutOfRange)?;
            if new_sz > crate::proc::TRAPFRAME {
                return Err(SbrkError::OutOfRange);
            }
            self.state.sz = VirtAddr::new(new_sz);
        }

        Ok(old_sz)
    }

    fn grow_eager(
        &mut self,
        old_sz: usize,
        new_sz: usize,
        allocator: &mut impl FrameAllocator<PAGE_SIZE>,
        swap_backend: &impl SwapBackend,
    ) -> Result<(), SbrkError> {
        let start = old_sz.align_up(PAGE_SIZE);
        let end = new_sz.align_up(PAGE_SIZE);

        let mut va = start;
        while va < end {
            let addr = VirtAddr::new(va);
            let frame = evict::alloc_or_evict(&mut self.state, self.pid, allocator, swap_backend)?;
            // SAFETY: frame was just allocated/reclaimed and is not otherwise referenced.
            unsafe { core::ptr::write_bytes(frame.virt() as *mut u8, 0, PAGE_SIZE) };

            let perm = fault::perm_for(&self.state, addr);
            let mut walker = PageTableWalker::new(&mut self.state.pagetable);
            walker.configure_direct_map(self.state.direct_map);
            // SAFETY: addr is unmapped since it is beyond the previous sz.
            if unsafe { walker.map(addr, frame.phys(), PageSize::Kb, perm, allocator) }.is_err() {
                allocator.free(frame);
                return Err(SbrkError::Fault(FaultError::OutOfMemory));
            }
            drop(walker);

            if self.state.pages.insert_resident(addr, false).is_err() {
                let mut walker = PageTableWalker::new(&mut self.state.pagetable);
                walker.configure_direct_map(self.state.direct_map);
                walker.unmap(addr);
                allocator.free(frame);
                return Err(SbrkError::Fault(FaultError::OutOfDescriptors));
            }

            va += PAGE_SIZE;
        }

        Ok(())
    }

    fn shrink_to(&mut self, new_sz: usize, allocator: &mut impl FrameAllocator<PAGE_SIZE>) {
        let start = new_sz.align_up(PAGE_SIZE);
        let end = self.state.sz.as_usize().align_up(PAGE_SIZE);

        let mut va = start;
        while va < end {
            let addr = VirtAddr::new(va);

            if let Some(d) = self.state.pages.find(addr).copied() {
                if d.resident {
                    let mut walker = PageTableWalker::new(&mut self.state.pagetable);
                    walker.configure_direct_map(self.state.direct_map);
                    if let Some(paddr) = walker.unmap(addr) {
                        let ptr = self.state.direct_map.to_virt(paddr).as_mut_ptr::<()>();
                        allocator.free(Frame::at(paddr, ptr));
                    }
                } else if d.swapped {
                    self.state.swap_slots.free(d.swap_offset);
                }
            }

            va += PAGE_SIZE;
        }

        self.state.pages.retain_below(new_sz);
    }

    /// Builds the child's paging state for a `fork`: a fresh copy of every resident
    /// page (each with its own physical frame) and a snapshot of the resident
    /// descriptors, carrying over segments and address-space landmarks unchanged.
    ///
    /// Swapped pages are not propagated (see [`DescriptorTable::resident_snapshot`]);
    /// the child simply re-materializes them from their segment or as a fresh
    /// zero-filled page on first access, the same as any other untouched page.
    pub fn fork(
        &mut self,
        child_pid: u32,
        allocator: &mut impl FrameAllocator<PAGE_SIZE>,
    ) -> Result<Process, FaultError> {
        let mut child = Process::new(child_pid);
        child.state.direct_map = self.state.direct_map;
        child.state.segments = self.state.segments;
        child.state.sz = self.state.sz;
        child.state.heap_start = self.state.heap_start;
        child.state.stack_bottom = self.state.stack_bottom;
        child.state.stack_top = self.state.stack_top;
        child.state.exec_inode = self.state.exec_inode.clone();
        child.state.pages = self.state.pages.resident_snapshot();

        let mut parent_walker = PageTableWalker::new(&mut self.state.pagetable);
        parent_walker.configure_direct_map(self.state.direct_map);

        for d in child.state.pages.iter().copied().collect::<alloc::vec::Vec<_>>() {
            let parent_paddr = parent_walker.virt_to_phys(d.va).expect("resident snapshot entries must be mapped");
            let parent_ptr = self.state.direct_map.to_virt(parent_paddr).as_ptr::<u8>();

            let frame = allocator.alloc(1).ok_or(FaultError::OutOfMemory)?;
            // SAFETY: parent_ptr is reachable through the direct map for exactly
            // PAGE_SIZE bytes; frame was just allocated and is not otherwise referenced.
            unsafe {
                core::ptr::copy_nonoverlapping(parent_ptr, frame.virt() as *mut u8, PAGE_SIZE);
            }

            let perm = fault::perm_for(&child.state, d.va);
            let mut walker = PageTableWalker::new(&mut child.state.pagetable);
            walker.configure_direct_map(child.state.direct_map);
            // SAFETY: d.va is unmapped in the freshly-created child page table.
            if unsafe { walker.map(d.va, frame.phys(), PageSize::Kb, perm, allocator) }.is_err() {
                allocator.free(frame);
                return Err(FaultError::OutOfMemory);
            }
        }

        Ok(child)
    }

    /// Tears down this process's address space: frees every mapped frame, forgets
    /// every swap slot (the swap file itself is leaked, matching the original's own
    /// intentional leak), and logs the number of slots freed.
    pub fn exit(&mut self, allocator: &mut impl FrameAllocator<PAGE_SIZE>) {
        let mut walker = PageTableWalker::new(&mut self.state.pagetable);
        walker.configure_direct_map(self.state.direct_map);
        walker.teardown(allocator);

        let freed = self.state.swap_slots.clear();
        kprintln!("[pid {}] SWAPCLEANUP freed_slots={}", self.pid, freed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::test_support::MemSwapBackend;

    fn new_allocator(pages: usize) -> crate::mm::allocator::BumpFrameAllocator<PAGE_SIZE> {
        let layout = core::alloc::Layout::from_size_align(pages * PAGE_SIZE, PAGE_SIZE).unwrap();
        let ptr = unsafe { alloc::alloc::alloc_zeroed(layout) };
        assert!(!ptr.is_null());
        let base = PhysAddr::new(ptr as usize);
        crate::mm::allocator::BumpFrameAllocator::new(base, base + pages * PAGE_SIZE)
    }

    fn new_process() -> Process {
        let mut p = Process::new(1);
        p.state.heap_start = VirtAddr::new(0x10000);
        p.state.stack_bottom = VirtAddr::new(0x11000);
        p.state.stack_top = VirtAddr::new(0x11000 + 4 * PAGE_SIZE);
        p.state.sz = p.state.heap_start;
        p
    }

    #[test]
    fn lazy_sbrk_only_bumps_sz() {
        let mut p = new_process();
        let mut alloc = new_allocator(4);
        let backend = MemSwapBackend;

        let old = p.sbrk(PAGE_SIZE as isize, SbrkMode::Lazy, &mut alloc, &backend).unwrap();
        assert_eq!(old, 0x10000);
        assert_eq!(p.state.sz, VirtAddr::new(0x10000 + PAGE_SIZE));
        assert!(p.state.pages.find(VirtAddr::new(0x10000)).is_none());
    }

    #[test]
    fn eager_sbrk_materializes_pages() {
        let mut p = new_process();
        let mut alloc = new_allocator(4);
        let backend = MemSwapBackend;

        p.sbrk(PAGE_SIZE as isize, SbrkMode::Eager, &mut alloc, &backend).unwrap();
        assert!(p.state.pages.find(VirtAddr::new(0x10000)).unwrap().resident);
    }

    #[test]
    fn shrink_frees_resident_pages() {
        let mut p = new_process();
        let mut alloc = new_allocator(4);
        let backend = MemSwapBackend;

        p.sbrk(2 * PAGE_SIZE as isize, SbrkMode::Eager, &mut alloc, &backend).unwrap();
        p.sbrk(-(PAGE_SIZE as isize), SbrkMode::Lazy, &mut alloc, &backend).unwrap();

        assert_eq!(p.state.sz, VirtAddr::new(0x10000 + PAGE_SIZE));
        assert!(p.state.pages.find(VirtAddr::new(0x10000 + PAGE_SIZE)).is_none());
        assert!(p.state.pages.find(VirtAddr::new(0x10000)).unwrap().resident);
    }

    #[test]
    fn sbrk_rejects_growth_past_trapframe() {
        let mut p = new_process();
        p.state.sz = VirtAddr::new(crate::proc::TRAPFRAME);
        let mut alloc = new_allocator(4);
        let backend = MemSwapBackend;

        let err = p.sbrk(PAGE_SIZE as isize, SbrkMode::Lazy, &mut alloc, &backend);
        assert_eq!(err, Err(SbrkError::OutOfRange));
    }

    #[test]
    fn fork_copies_resident_pages_into_fresh_frames() {
        let mut parent = new_process();
        let mut alloc = new_allocator(8);
        let backend = MemSwapBackend;

        parent.sbrk(PAGE_SIZE as isize, SbrkMode::Eager, &mut alloc, &backend).unwrap();
        parent.copy_out(VirtAddr::new(0x10000), &[0xAB; 4], &mut alloc, &backend).unwrap();

        let child = parent.fork(2, &mut alloc).unwrap();
        assert!(child.state.pages.find(VirtAddr::new(0x10000)).unwrap().resident);

        let parent_paddr = {
            let mut w = PageTableWalker::new(&mut parent.state.pagetable);
            w.virt_to_phys(VirtAddr::new(0x10000)).unwrap()
        };
        let child_paddr = {
            let mut child = parent.fork(3, &mut alloc).unwrap();
            let mut w = PageTableWalker::new(&mut child.state.pagetable);
            w.virt_to_phys(VirtAddr::new(0x10000)).unwrap()
        };
        assert_ne!(parent_paddr, child_paddr);
        let _ = child;
    }

    #[test]
    fn exit_tears_down_the_page_table_and_reports_freed_slots() {
        let mut p = new_process();
        let mut alloc = new_allocator(4);
        let backend = MemSwapBackend;
        p.sbrk(PAGE_SIZE as isize, SbrkMode::Eager, &mut alloc, &backend).unwrap();

        p.exit(&mut alloc);
    }
}
