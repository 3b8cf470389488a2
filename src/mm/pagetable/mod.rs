//! The Sv39 three-level radix tree and its walker.
//!
//! Kernel address-space setup (identity-mapped MMIO, trampoline, per-process kernel
//! stack) is owned by the out-of-scope boot/arch-init sequence; this module only
//! provides the mechanism it is built from.

use core::{fmt, ops::Range, ptr::NonNull};

use bitflags::bitflags;

use crate::mm::{
    PAGE_SHIFT, PAGE_SIZE,
    addr::{Align, MemoryAddress, PhysAddr, PhysAddrExt, VirtAddr, VirtAddrExt},
    allocator::FrameAllocator,
};

#[cfg(all(feature = "sv39", feature = "sv48"))]
compile_error!("Features \"sv39\" and \"sv48\" are mutually exclusive.");

#[cfg(feature = "sv39")]
const PTE_PPN_MASK: u64 = 0x3ff_ffff;
#[cfg(feature = "sv48")]
const PTE_PPN_MASK: u64 = 0xfff_ffff_ffff;

const PTE_PPN_OFFSET: u64 = 10;

#[cfg(feature = "sv39")]
const PAGE_LEVELS: usize = 3;
#[cfg(feature = "sv48")]
const PAGE_LEVELS: usize = 4;

bitflags! {
    /// Bitfields of a page table entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    #[repr(transparent)]
    pub struct EntryFlags: u64 {
        /// If set, this entry represents a valid mapping.
        const VALID = 1 << 0;
        /// If set, this page contains readable memory.
        const READ = 1 << 1;
        /// If set, this page contains writable memory.
        const WRITE = 1 << 2;
        /// If set, this page contains executable memory.
        const EXEC = 1 << 3;
        /// If set, this page can be accessed in U-mode.
        const USER = 1 << 4;
        /// If set, this mapping is global.
        const GLOBAL = 1 << 5;
        /// If set, this page has been accessed by the CPU.
        const ACCESS = 1 << 6;
        /// If set, this page has been written by the CPU.
        const DIRTY = 1 << 7;

        /// If set, this page contains read-write memory.
        const RW = Self::READ.bits() | Self::WRITE.bits();
        /// If set, this page contains read-exec memory.
        const RX = Self::READ.bits() | Self::EXEC.bits();
        /// If set, this page contains read-write-exec memory.
        const RWX = Self::READ.bits() | Self::WRITE.bits() | Self::EXEC.bits();
        /// Mask of user-settable flags on a page table entry.
        const RWXUG = Self::RWX.bits() | Self::USER.bits() | Self::GLOBAL.bits();
    }
}

/// A page table for virtual address translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(align(4096))]
pub struct PageTable {
    entries: [Entry; 512],
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PageTable {
    /// Creates a new page table with cleared entries.
    pub const fn new() -> Self {
        Self { entries: [Entry::empty(); 512] }
    }

    /// Resets all the entries of this page table to zero.
    pub fn clear(&mut self) {
        for entry in &mut self.entries {
            entry.clear();
        }
    }

    /// Returns a reference to an entry in this page table.
    pub fn get_entry(&self, i: usize) -> Option<&Entry> {
        self.entries.get(i)
    }

    /// Returns a mutable reference to an entry in this page table.
    pub fn get_entry_mut(&mut self, i: usize) -> Option<&mut Entry> {
        self.entries.get_mut(i)
    }

    /// Returns an iterator over the entries in this page table.
    pub fn iter(&self) -> core::slice::Iter<'_, Entry> {
        self.entries.iter()
    }
}

impl fmt::Display for PageTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, e) in self.entries.iter().enumerate() {
            if e.is_valid() {
                writeln!(f, "{:>3}: {}", i, e)?;
            }
        }
        Ok(())
    }
}

/// An entry in a [`PageTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Entry {
    inner: EntryFlags,
}

impl Entry {
    /// Creates a new empty, non-valid page entry.
    pub const fn empty() -> Entry {
        Self { inner: EntryFlags::empty() }
    }

    /// Returns whether the mapping contained in this entry is valid for use in translation.
    pub fn is_valid(&self) -> bool {
        self.inner.contains(EntryFlags::VALID)
    }

    /// Returns whether the page pointed to by this entry is readable.
    pub fn is_read(&self) -> bool {
        self.inner.contains(EntryFlags::READ)
    }

    /// Returns whether the page pointed to by this entry is writable.
    pub fn is_write(&self) -> bool {
        self.inner.contains(EntryFlags::WRITE)
    }

    /// Returns whether the page pointed to by this entry contains executable code.
    pub fn is_exec(&self) -> bool {
        self.inner.contains(EntryFlags::EXEC)
    }

    /// Returns whether the page pointed to by this entry can be accessed in U-mode.
    pub fn is_user(&self) -> bool {
        self.inner.contains(EntryFlags::USER)
    }

    /// Returns whether the virtual page has been written since the last time this flag
    /// was cleared.
    pub fn is_dirty(&self) -> bool {
        self.inner.contains(EntryFlags::DIRTY)
    }

    /// Returns whether this entry is a leaf or a pointer to another page table.
    pub fn is_leaf(&self) -> bool {
        self.inner.intersects(EntryFlags::READ | EntryFlags::WRITE | EntryFlags::EXEC)
    }

    /// Returns the flags currently set on this entry.
    pub fn flags(&self) -> EntryFlags {
        self.inner & EntryFlags::all()
    }

    /// Resets the bits of this entry to zero.
    pub fn clear(&mut self) {
        self.inner = EntryFlags::empty();
    }

    /// Sets this entry's flags, keeping the PPN untouched.
    pub fn set_flags(&mut self, flags: EntryFlags) {
        self.inner |= flags;
    }

    /// Overwrites this entry's user-settable flags, keeping the PPN untouched.
    pub fn write_flags(&mut self, flags: EntryFlags) {
        self.inner.remove(EntryFlags::RWXUG);
        self.inner |= flags;
    }

    /// Returns the PPN portion of this entry.
    pub fn get_ppn(&self) -> usize {
        ((self.inner.bits() >> PTE_PPN_OFFSET) & PTE_PPN_MASK) as usize
    }

    /// Sets the PPN portion of this entry to the provided value.
    pub fn set_ppn(&mut self, ppn: usize) {
        let mut v = self.inner.bits();
        v &= !(PTE_PPN_MASK << PTE_PPN_OFFSET);
        v |= (ppn as u64 & PTE_PPN_MASK) << PTE_PPN_OFFSET;
        self.inner = EntryFlags::from_bits_retain(v);
    }
}

impl fmt::Display for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "phy: 0x{:016x} ", self.get_ppn() << PAGE_SHIFT)?;
        write!(
            f,
            "{} {} {} {} {}",
            if self.is_read() { 'R' } else { ' ' },
            if self.is_write() { 'W' } else { ' ' },
            if self.is_exec() { 'X' } else { ' ' },
            if self.is_user() { 'U' } else { ' ' },
            if self.is_dirty() { 'D' } else { ' ' },
        )
    }
}

/// Possible sizes for page table mappings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PageSize {
    /// 4KiB page.
    Kb,
    /// 2MiB _megapage_.
    Mb,
    /// 1GiB _gigapage_.
    Gb,
}

impl PageSize {
    fn to_table_level(self) -> usize {
        match self {
            PageSize::Kb => 0,
            PageSize::Mb => 1,
            PageSize::Gb => 2,
        }
    }

    /// Returns the number of bytes contained in a page of this size.
    pub const fn size(self) -> usize {
        match self {
            PageSize::Kb => 0x1000,
            PageSize::Mb => 0x200000,
            PageSize::Gb => 0x4000_0000,
        }
    }
}

/// An error condition returned by memory mapping functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MapError {
    /// The requested page was already mapped with different flags.
    AlreadyMapped,
    /// Frame allocation failed.
    AllocationFailed,
    /// A page table entry was found corrupted or not respecting some invariants.
    CorruptedPageTable,
}

/// Maps physical addresses to the virtual addresses they can be accessed through.
///
/// The real kernel's boot sequence installs a direct map covering all of physical
/// memory at a fixed offset; that bootstrap is out of scope here. Tests configure
/// the identity mapping (offset zero), matching how the corpus's own allocator tests
/// reinterpret a heap pointer as a physical address.
#[derive(Debug, Clone, Copy)]
pub struct DirectMap {
    offset: usize,
}

impl DirectMap {
    /// Creates a direct map at the given offset: `virt = phys + offset`.
    pub const fn new(offset: usize) -> Self {
        Self { offset }
    }

    /// Returns the virtual address `paddr` is accessible through.
    pub fn to_virt(self, paddr: PhysAddr) -> VirtAddr {
        VirtAddr::new_truncated(paddr.as_usize().wrapping_add(self.offset))
    }
}

impl Default for DirectMap {
    /// Identity mapping: `virt == phys`.
    fn default() -> Self {
        Self::new(0)
    }
}

/// A simple memory mapper over a single root [`PageTable`].
#[derive(Debug)]
pub struct PageTableWalker<'a> {
    rpt: &'a mut PageTable,
    direct_map: DirectMap,
}

impl<'a> PageTableWalker<'a> {
    /// Creates a new page mapper using the identity direct map.
    pub fn new(rpt: &'a mut PageTable) -> Self {
        Self { rpt, direct_map: DirectMap::default() }
    }

    /// Overrides the direct map used to dereference intermediate page table frames.
    pub fn configure_direct_map(&mut self, direct_map: DirectMap) {
        self.direct_map = direct_map;
    }

    fn vpn_of(vaddr: VirtAddr) -> [usize; PAGE_LEVELS] {
        #[cfg(feature = "sv39")]
        {
            [vaddr.vpn0(), vaddr.vpn1(), vaddr.vpn2()]
        }
        #[cfg(feature = "sv48")]
        {
            [vaddr.vpn0(), vaddr.vpn1(), vaddr.vpn2(), vaddr.vpn3()]
        }
    }

    /// Maps a memory page of size `page_size` using the provided root page table,
    /// allocating intermediate tables as needed.
    ///
    /// # Safety
    ///
    /// `vaddr` and `paddr` must be properly aligned to `page_size`, and the VA range
    /// covered by the new mapping must not be currently used for live Rust references.
    /// The direct map must cover every intermediate page table frame this walk
    /// allocates or traverses.
    pub unsafe fn map(
        &mut self,
        vaddr: VirtAddr,
        paddr: PhysAddr,
        page_size: PageSize,
        mut flags: EntryFlags,
        allocator: &mut impl FrameAllocator<PAGE_SIZE>,
    ) -> Result<(), MapError> {
        let vpn = Self::vpn_of(vaddr);

        let mut pte = self.rpt.get_entry_mut(vpn[PAGE_LEVELS - 1]).unwrap();

        for i in (page_size.to_table_level()..PAGE_LEVELS - 1).rev() {
            let table_paddr = if !pte.is_valid() {
                let frame = allocator.alloc(1).ok_or(MapError::AllocationFailed)?;
                let new_table_addr = frame.phys();

                pte.clear();
                pte.set_flags(EntryFlags::VALID);
                pte.set_ppn(new_table_addr.page_index());

                // SAFETY: new_table_addr points to valid writable memory reachable
                // through the direct map.
                unsafe {
                    (self.direct_map.to_virt(new_table_addr).as_mut_ptr::<PageTable>())
                        .write(PageTable::default());
                }

                new_table_addr
            } else {
                PhysAddr::new(pte.get_ppn() << PAGE_SHIFT)
            };

            // SAFETY: the resulting pointer points to properly initialized memory.
            let table = unsafe { &mut *self.direct_map.to_virt(table_paddr).as_mut_ptr::<PageTable>() };

            pte = table.get_entry_mut(vpn[i]).unwrap();
        }

        flags |= EntryFlags::VALID;

        if pte.is_valid() && pte.flags() != flags {
            return Err(MapError::AlreadyMapped);
        }

        pte.write_flags(flags);
        pte.set_ppn(paddr.page_index());

        Ok(())
    }

    /// Maps a range of addresses to pages of size `page_size` starting at `vaddr`.
    ///
    /// # Safety
    ///
    /// See [`Self::map`].
    pub unsafe fn map_range(
        &mut self,
        vaddr: VirtAddr,
        phys: Range<PhysAddr>,
        page_size: PageSize,
        flags: EntryFlags,
        allocator: &mut impl FrameAllocator<PAGE_SIZE>,
    ) -> Result<(), MapError> {
        let start = phys.start;
        let end = phys.end;

        let sz = (end - start).as_usize();
        let n_pages = sz.div_ceil(page_size.size());

        for i in 0..n_pages {
            let offset = i * page_size.size();

            // SAFETY: assuming caller has upheld the safety contract.
            unsafe {
                self.map(vaddr + offset, start + offset, page_size, flags, allocator)?;
            }
        }

        Ok(())
    }

    /// Unmaps the leaf page at `vaddr`, if any. Tolerates unmapped or missing
    /// intermediate page tables. Returns the physical frame that was mapped, if it
    /// was actually present.
    ///
    /// Mirrors the original kernel's `uvmunmap` for a single page: "it's OK if the
    /// mapping doesn't exist".
    pub fn unmap(&mut self, vaddr: VirtAddr) -> Option<PhysAddr> {
        let mut pte_ptr = self.get_pte_ptr(vaddr)?;

        // SAFETY: pte_ptr was produced by a valid walk of this page table.
        let pte = unsafe { pte_ptr.as_mut() };
        if !pte.is_valid() {
            return None;
        }

        let paddr = PhysAddr::from_ppn(pte.get_ppn());
        pte.clear();
        Some(paddr)
    }

    /// Walks to (allocating intermediate tables as needed) and clears the leaf entry for
    /// `vaddr`, leaving it invalid.
    ///
    /// Mirrors the original kernel's `walk(pagetable, va, 1)` immediately followed by
    /// `*pte = 0`, used by the exec loader to pre-install the stack guard page: the
    /// intermediate tables exist (so a later walk never has to allocate under a
    /// half-built address space) but the leaf stays unmapped.
    ///
    /// # Safety
    ///
    /// The VA range covered must not be currently used for live Rust references.
    pub unsafe fn install_invalid_leaf(
        &mut self,
        vaddr: VirtAddr,
        allocator: &mut impl FrameAllocator<PAGE_SIZE>,
    ) -> Result<(), MapError> {
        let vpn = Self::vpn_of(vaddr);

        let mut pte = self.rpt.get_entry_mut(vpn[PAGE_LEVELS - 1]).unwrap();

        for i in (0..PAGE_LEVELS - 1).rev() {
            let table_paddr = if !pte.is_valid() {
                let frame = allocator.alloc(1).ok_or(MapError::AllocationFailed)?;
                let new_table_addr = frame.phys();

                pte.clear();
                pte.set_flags(EntryFlags::VALID);
                pte.set_ppn(new_table_addr.page_index());

                // SAFETY: new_table_addr points to valid writable memory reachable
                // through the direct map.
                unsafe {
                    (self.direct_map.to_virt(new_table_addr).as_mut_ptr::<PageTable>())
                        .write(PageTable::default());
                }

                new_table_addr
            } else {
                PhysAddr::new(pte.get_ppn() << PAGE_SHIFT)
            };

            // SAFETY: the resulting pointer points to properly initialized memory.
            let table = unsafe { &mut *self.direct_map.to_virt(table_paddr).as_mut_ptr::<PageTable>() };

            pte = table.get_entry_mut(vpn[i]).unwrap();
        }

        pte.clear();
        Ok(())
    }

    /// Returns the leaf entry for `vaddr`, regardless of whether it is currently valid.
    ///
    /// Unlike [`Self::get_pte_ptr`], this does not require the leaf itself to be valid —
    /// only that the walk down to it has already been performed (by [`Self::map`] or
    /// [`Self::install_invalid_leaf`]). Returns `None` if an intermediate table along the
    /// way was never allocated.
    pub fn leaf_entry(&self, vaddr: VirtAddr) -> Option<&Entry> {
        let vpn = Self::vpn_of(vaddr);

        let mut table: &PageTable = self.rpt;

        for i in (1..PAGE_LEVELS).rev() {
            let pte = table.get_entry(vpn[i])?;
            if !pte.is_valid() {
                return None;
            }

            // SAFETY: non-leaf PTEs point to page tables reachable via the direct map.
            table = unsafe { &*self.direct_map.to_virt(PhysAddr::from_ppn(pte.get_ppn())).as_ptr::<PageTable>() };
        }

        table.get_entry(vpn[0])
    }

    /// Returns a pointer to the page table entry corresponding to `vaddr`, or `None` if
    /// the page table is corrupted or not properly set up.
    pub fn get_pte_ptr(&mut self, vaddr: VirtAddr) -> Option<NonNull<Entry>> {
        let vpn = Self::vpn_of(vaddr);

        let mut pte_ptr: *mut Entry = core::ptr::addr_of_mut!(self.rpt.entries[vpn[PAGE_LEVELS - 1]]);

        for i in (0..PAGE_LEVELS - 1).rev() {
            // SAFETY: `pte_ptr` always points into a PageTable reached from `self.rpt`
            // or a valid non-leaf PTE's PPN via the direct map.
            let pte = unsafe { &*pte_ptr };

            if !pte.is_valid() {
                return None;
            }

            if pte.is_leaf() {
                return NonNull::new(pte_ptr);
            }

            let table_paddr = PhysAddr::new(pte.get_ppn() << PAGE_SHIFT);
            let table_ptr: *mut PageTable = self.direct_map.to_virt(table_paddr).as_mut_ptr::<PageTable>();

            // SAFETY: non-leaf PTEs point to page tables reachable via the direct map.
            pte_ptr = unsafe { core::ptr::addr_of_mut!((*table_ptr).entries[vpn[i]]) };
        }

        // SAFETY: same reasoning as above for the final PTE pointer.
        let pte = unsafe { &*pte_ptr };
        pte.is_valid().then(|| NonNull::new(pte_ptr).unwrap())
    }

    /// Updates PTE flags for each entry in the provided range.
    ///
    /// # Safety
    ///
    /// This can change the permissions of existing mappings; the caller must ensure
    /// no memory safety violations can occur through the new flags.
    pub unsafe fn update_mapping(&mut self, vaddr: VirtAddr, len: usize, flags: EntryFlags) -> Result<(), MapError> {
        let start = vaddr.align_down(PAGE_SIZE);
        let end = (vaddr + len).align_up(PAGE_SIZE);

        let num_pages = (end - start).as_usize() >> PAGE_SHIFT;

        for i in 0..num_pages {
            let addr = start + (i << PAGE_SHIFT);

            let mut pte_ptr = self.get_pte_ptr(addr).ok_or(MapError::CorruptedPageTable)?;
            // SAFETY: caller must ensure no concurrent access to the page table.
            let pte = unsafe { pte_ptr.as_mut() };
            if !pte.is_valid() {
                return Err(MapError::CorruptedPageTable);
            }

            pte.write_flags(flags);
        }

        Ok(())
    }

    /// Returns the physical address mapped to `vaddr`, or `None` if unmapped.
    pub fn virt_to_phys(&self, vaddr: VirtAddr) -> Option<PhysAddr> {
        let vpn = Self::vpn_of(vaddr);

        let mut table: &PageTable = self.rpt;

        for i in (0..PAGE_LEVELS).rev() {
            let pte = table.get_entry(vpn[i]).unwrap();

            if !pte.is_valid() {
                break;
            }

            if pte.is_leaf() {
                let mut ppn = pte.get_ppn();
                for (lvl, vpn) in vpn.iter().enumerate().take(i) {
                    ppn |= vpn << (lvl * 9);
                }
                return Some(PhysAddr::new(ppn << PAGE_SHIFT) + vaddr.page_offset());
            }

            // SAFETY: non-leaf PTEs point to page tables reachable via the direct map.
            table = unsafe { &*self.direct_map.to_virt(PhysAddr::from_ppn(pte.get_ppn())).as_ptr::<PageTable>() };
        }

        None
    }

    /// Recursively frees every intermediate page table reachable from the root, along
    /// with any leaf frame still mapped (demand paging can leave dangling leaves on
    /// abnormal exit, so unlike the original `freewalk` this does not assume the
    /// caller has already unmapped every leaf).
    ///
    /// Returns the number of leaf frames that were still mapped when torn down.
    pub fn teardown(&mut self, allocator: &mut impl FrameAllocator<PAGE_SIZE>) -> usize {
        Self::teardown_level(self.rpt, self.direct_map, allocator)
    }

    fn teardown_level(
        table: &mut PageTable,
        direct_map: DirectMap,
        allocator: &mut impl FrameAllocator<PAGE_SIZE>,
    ) -> usize {
        let mut freed = 0;

        for entry in table.iter_mut_internal() {
            if !entry.is_valid() {
                continue;
            }

            let paddr = PhysAddr::from_ppn(entry.get_ppn());

            if entry.is_leaf() {
                allocator.free(crate::mm::allocator::Frame::at(paddr, direct_map.to_virt(paddr).as_mut_ptr()));
                freed += 1;
            } else {
                // SAFETY: non-leaf PTEs point to page tables reachable via the direct map.
                let child = unsafe { &mut *direct_map.to_virt(paddr).as_mut_ptr::<PageTable>() };
                Self::teardown_level(child, direct_map, allocator);
                allocator.free(crate::mm::allocator::Frame::at(paddr, direct_map.to_virt(paddr).as_mut_ptr()));
            }

            entry.clear();
        }

        freed
    }

    /// Returns a reference to the root page table used by this mapper.
    pub fn page_table(&self) -> &PageTable {
        self.rpt
    }
}

impl PageTable {
    fn iter_mut_internal(&mut self) -> core::slice::IterMut<'_, Entry> {
        self.entries.iter_mut()
    }
}
