//! `memstat`'s wire struct and the logic that fills it in from a process's paging state.
//!
//! Grounded on the original kernel's `sys_memstat`: a fixed-size snapshot of every
//! tracked page plus, space permitting, every untouched page below `sz` that has
//! never been faulted in.

use crate::{
    mm::{PAGE_SIZE, addr::Align},
    proc::{MAX_PAGES_INFO, descriptor::DescriptorTable, process::ProcessPagingState},
};

/// The residency state of one virtual page, as reported to user space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PageState {
    /// Backed by a physical frame and mapped.
    Resident = 0,
    /// Written out to the swap file.
    Swapped = 1,
    /// Never faulted in.
    Unmapped = 2,
}

/// One page's entry in a [`MemStat`] snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct PageStat {
    /// Page-aligned virtual address.
    pub va: usize,
    /// Current residency state.
    pub state: PageState,
    /// Written since last loaded/swapped in; meaningless for [`PageState::Unmapped`].
    pub is_dirty: bool,
    /// FIFO sequence number; meaningless for [`PageState::Unmapped`].
    pub seq: u64,
    /// Swap slot index, or `-1` if not swapped.
    pub swap_slot: i64,
}

/// A snapshot of a process's demand-paging state, as returned by `memstat`.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct MemStat {
    /// The process this snapshot describes.
    pub pid: u32,
    /// The FIFO sequence number that would be assigned to the next resident page.
    pub next_fifo_seq: u64,
    /// `PGROUNDUP(sz) / PAGE_SIZE`: the process's total address-space size in pages.
    pub num_pages_total: usize,
    /// Number of pages currently resident.
    pub num_resident_pages: usize,
    /// Number of pages currently swapped out.
    pub num_swapped_pages: usize,
    /// Per-page entries: every tracked descriptor, then (space permitting) every
    /// untouched page below `sz`, in ascending `va` order.
    pub pages: [PageStat; MAX_PAGES_INFO],
    /// Number of entries in `pages` that are actually populated.
    pub num_pages_info: usize,
}

const EMPTY_PAGE_STAT: PageStat =
    PageStat { va: 0, state: PageState::Unmapped, is_dirty: false, seq: 0, swap_slot: -1 };

/// Builds a [`MemStat`] snapshot of `state`, mirroring `sys_memstat`'s field-by-field
/// walk of the process's tracked descriptors followed by a scan for untouched pages.
pub fn collect(state: &ProcessPagingState, pid: u32) -> MemStat {
    let mut st = MemStat {
        pid,
        next_fifo_seq: state.pages.next_seq(),
        num_pages_total: state.sz.as_usize().align_up(PAGE_SIZE) / PAGE_SIZE,
        num_resident_pages: 0,
        num_swapped_pages: 0,
        pages: [EMPTY_PAGE_STAT; MAX_PAGES_INFO],
        num_pages_info: 0,
    };

    let mut i = 0;
    for d in state.pages.iter().take(MAX_PAGES_INFO) {
        let (pstate, swap_slot) = if d.resident {
            st.num_resident_pages += 1;
            (PageState::Resident, -1)
        } else if d.swapped {
            st.num_swapped_pages += 1;
            (PageState::Swapped, d.swap_offset as i64)
        } else {
            (PageState::Unmapped, -1)
        };

        st.pages[i] = PageStat { va: d.va.as_usize(), state: pstate, is_dirty: d.dirty, seq: d.seq, swap_slot };
        i += 1;
    }

    let mut page_va = 0usize;
    while i < MAX_PAGES_INFO && page_va < state.sz.as_usize() {
        if find_untracked(&state.pages, page_va) {
            st.pages[i] = PageStat { va: page_va, state: PageState::Unmapped, is_dirty: false, seq: 0, swap_slot: -1 };
            i += 1;
        }
        page_va += PAGE_SIZE;
    }

    st.num_pages_info = i;
    st
}

fn find_untracked(pages: &DescriptorTable, va: usize) -> bool {
    pages.find(crate::mm::addr::VirtAddr::new(va)).is_none()
}
