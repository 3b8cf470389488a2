//! The per-process swap slot bitmap and swap file, and the swap-in path.
//!
//! Grounded on the original kernel's `alloc_swap_slot`/`free_swap_slot` (a linear scan
//! over a fixed bitmap) and `swapin_page`/`swapout_page`. The swap file itself is
//! created lazily, on the first page actually evicted to disk, not at exec time.

use alloc::sync::Arc;

use crate::{
    fs::{Inode, IoError, SwapBackend},
    mm::{
        PAGE_SIZE,
        addr::{MemoryAddress, VirtAddr},
        allocator::FrameAllocator,
        pagetable::{PageSize, PageTableWalker},
    },
    proc::{MAX_SWAP_PAGES, evict, fault::FaultError, process::ProcessPagingState},
};

const WORD_BITS: usize = 32;
const WORDS: usize = MAX_SWAP_PAGES.div_ceil(WORD_BITS);

/// A fixed-capacity bitmap of [`MAX_SWAP_PAGES`] swap slots, tracking which are in use.
#[derive(Debug, Clone)]
pub struct SwapBitmap {
    words: [u32; WORDS],
    count: usize,
}

impl Default for SwapBitmap {
    fn default() -> Self {
        Self::new()
    }
}

impl SwapBitmap {
    /// Creates an empty bitmap.
    pub const fn new() -> Self {
        Self { words: [0; WORDS], count: 0 }
    }

    /// Returns the number of slots currently in use.
    pub fn len(&self) -> usize {
        self.count
    }

    /// Returns whether no slot is currently in use.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Allocates the lowest-numbered free slot, or `None` if the bitmap is full.
    pub fn alloc(&mut self) -> Option<usize> {
        if self.count >= MAX_SWAP_PAGES {
            return None;
        }
        for slot in 0..MAX_SWAP_PAGES {
            let (w, b) = (slot / WORD_BITS, slot % WORD_BITS);
            if self.words[w] & (1 << b) == 0 {
                self.words[w] |= 1 << b;
                self.count += 1;
                return Some(slot);
            }
        }
        None
    }

    /// Frees a previously-allocated slot. A double-free is a no-op.
    pub fn free(&mut self, slot: usize) {
        if slot >= MAX_SWAP_PAGES {
            return;
        }
        let (w, b) = (slot / WORD_BITS, slot % WORD_BITS);
        if self.words[w] & (1 << b) != 0 {
            self.words[w] &= !(1 << b);
            self.count -= 1;
        }
    }

    /// Clears every slot, returning the number that were in use.
    pub fn clear(&mut self) -> usize {
        let freed = self.count;
        self.words = [0; WORDS];
        self.count = 0;
        freed
    }
}

/// A process's per-page-sized-record swap file.
///
/// Wraps the [`Inode`] handed out by a [`SwapBackend`]; this crate never deletes the
/// underlying file, matching the original kernel's own intentional leak (see
/// `SWAPCLEANUP`).
#[derive(Clone)]
pub struct SwapFile {
    inode: Arc<dyn Inode>,
}

impl SwapFile {
    /// Wraps an already-created swap-file inode.
    pub fn new(inode: Arc<dyn Inode>) -> Self {
        Self { inode }
    }

    /// Writes one page-sized record to `slot`.
    pub fn write_page(&self, slot: usize, data: &[u8; PAGE_SIZE]) -> Result<(), IoError> {
        self.inode.write_at((slot * PAGE_SIZE) as u64, data)
    }

    /// Reads one page-sized record from `slot`.
    pub fn read_page(&self, slot: usize, buf: &mut [u8; PAGE_SIZE]) -> Result<(), IoError> {
        self.inode.read_at((slot * PAGE_SIZE) as u64, buf)
    }
}

/// Swaps the page backing the already-swapped descriptor at `va` back into memory.
///
/// Allocates a frame (evicting one of this process's own resident pages on OOM — bounded,
/// since a descriptor that is itself being swapped in can never be the chosen victim), reads
/// its contents back from the swap file, re-maps it, and frees the swap slot.
pub fn swap_in(
    state: &mut ProcessPagingState,
    pid: u32,
    va: VirtAddr,
    allocator: &mut impl FrameAllocator<PAGE_SIZE>,
    swap_backend: &impl SwapBackend,
) -> Result<crate::mm::addr::PhysAddr, FaultError> {
    let va = va.align_down(PAGE_SIZE);
    let slot = state
        .pages
        .find(va)
        .filter(|d| d.swapped)
        .map(|d| d.swap_offset)
        .expect("swap_in called for a descriptor that is not swapped");

    let frame = evict::alloc_or_evict(state, pid, allocator, swap_backend)?;

    let swapfile = state.swapfile.as_ref().expect("a swapped descriptor implies an existing swap file");
    // SAFETY: frame was just allocated and is not otherwise referenced, and is
    // reachable through the direct map for exactly PAGE_SIZE bytes.
    let page = unsafe { &mut *(frame.virt() as *mut [u8; PAGE_SIZE]) };
    if let Err(e) = swapfile.read_page(slot, page) {
        allocator.free(frame);
        return Err(FaultError::Io(e));
    }

    let perm = super::fault::perm_for(state, va);

    let paddr = frame.phys();
    {
        let mut walker = PageTableWalker::new(&mut state.pagetable);
        walker.configure_direct_map(state.direct_map);
        // SAFETY: va is page-aligned and was unmapped while swapped.
        if unsafe { walker.map(va, paddr, PageSize::Kb, perm, allocator) }.is_err() {
            allocator.free(frame);
            return Err(FaultError::OutOfMemory);
        }
    }

    state.swap_slots.free(slot);
    let seq = state.pages.take_next_seq();
    let d = state.pages.find_mut(va).expect("descriptor present since we just looked it up");
    d.resident = true;
    d.swapped = false;
    d.dirty = false;
    d.swap_offset = 0;
    d.seq = seq;

    kprintln!("[pid {}] SWAPIN va={:#x} slot={}", pid, va.as_usize(), slot);
    kprintln!("[pid {}] RESIDENT va={:#x} seq={}", pid, va.as_usize(), seq);

    Ok(paddr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitmap_allocates_lowest_free_slot() {
        let mut bm = SwapBitmap::new();
        assert_eq!(bm.alloc(), Some(0));
        assert_eq!(bm.alloc(), Some(1));
        bm.free(0);
        assert_eq!(bm.alloc(), Some(0));
        assert_eq!(bm.len(), 2);
    }

    #[test]
    fn bitmap_exhausts_at_capacity() {
        let mut bm = SwapBitmap::new();
        for _ in 0..MAX_SWAP_PAGES {
            assert!(bm.alloc().is_some());
        }
        assert_eq!(bm.alloc(), None);
    }

    #[test]
    fn bitmap_clear_reports_freed_count() {
        let mut bm = SwapBitmap::new();
        bm.alloc();
        bm.alloc();
        bm.alloc();
        assert_eq!(bm.clear(), 3);
        assert!(bm.is_empty());
    }

    #[test]
    fn swap_file_round_trips_a_page() {
        let inode = crate::fs::test_support::MemInode::empty();
        let file = SwapFile::new(inode);
        let page = [0x5Au8; PAGE_SIZE];
        file.write_page(3, &page).unwrap();

        let mut buf = [0u8; PAGE_SIZE];
        file.read_page(3, &mut buf).unwrap();
        assert_eq!(buf, page);
    }
}
