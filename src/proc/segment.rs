//! The fixed-capacity table of loadable segments recorded at exec time.

use crate::{
    mm::{addr::{Align, MemoryAddress, VirtAddr}, pagetable::EntryFlags},
    proc::MAX_SEGMENTS,
};

bitflags::bitflags! {
    /// Permissions carried by a loadable segment, independent of the architecture's
    /// page-table encoding.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SegmentFlags: u32 {
        /// Readable segment.
        const R = 0b001;
        /// Writable segment.
        const W = 0b010;
        /// Executable segment.
        const X = 0b100;
    }
}

impl SegmentFlags {
    /// Translates this segment's permission bits into the page table's own
    /// [`EntryFlags`] encoding (the two use different bit positions).
    pub fn to_entry_flags(self) -> EntryFlags {
        let mut flags = EntryFlags::empty();
        if self.contains(Self::R) {
            flags |= EntryFlags::READ;
        }
        if self.contains(Self::W) {
            flags |= EntryFlags::WRITE;
        }
        if self.contains(Self::X) {
            flags |= EntryFlags::EXEC;
        }
        flags
    }
}

/// A loadable segment, recorded from a `PT_LOAD` program header and otherwise
/// immutable for the lifetime of the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    /// Page-aligned virtual address where the segment starts.
    pub vaddr: VirtAddr,
    /// Number of bytes backed by the executable file, starting at `off`.
    pub filesz: usize,
    /// Number of bytes this segment occupies in memory; `memsz >= filesz`, and the
    /// tail beyond `filesz` is BSS (zero-filled, no backing store).
    pub memsz: usize,
    /// Byte offset of the segment's data within the executable file.
    pub off: usize,
    /// Segment permissions (R/W/X subset); `R` and `U` are always added when mapped.
    pub perm: SegmentFlags,
}

/// Error returned when a segment fails the validation exec performs before
/// recording it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentError {
    /// `memsz < filesz`.
    FileszExceedsMemsz,
    /// `vaddr + memsz` wraps around the address space.
    AddressOverflow,
    /// `vaddr` is not page-aligned.
    Misaligned,
    /// The segment table is already at capacity.
    TooManySegments,
}

impl Segment {
    fn validate(vaddr: VirtAddr, filesz: usize, memsz: usize) -> Result<(), SegmentError> {
        if memsz < filesz {
            return Err(SegmentError::FileszExceedsMemsz);
        }
        if vaddr.as_usize().checked_add(memsz).is_none() {
            return Err(SegmentError::AddressOverflow);
        }
        if !vaddr.is_aligned(crate::mm::PAGE_SIZE) {
            return Err(SegmentError::Misaligned);
        }
        Ok(())
    }

    /// Returns whether `va` (assumed page-aligned) falls within this segment.
    pub fn contains(&self, va: VirtAddr) -> bool {
        va >= self.vaddr && va.as_usize() < self.vaddr.as_usize() + self.memsz
    }

    /// Returns whether the byte at `offset_in_seg` is backed by the executable file
    /// (as opposed to being BSS).
    pub fn has_backing_store(&self, offset_in_seg: usize) -> bool {
        offset_in_seg < self.filesz
    }
}

/// The per-process table of recorded segments, capacity [`MAX_SEGMENTS`].
#[derive(Debug, Clone, Copy)]
pub struct SegmentMap {
    segments: [Segment; MAX_SEGMENTS],
    len: usize,
    /// Highest address covered by any recorded segment, tracked without allocating.
    sz: usize,
}

impl Default for SegmentMap {
    fn default() -> Self {
        Self::new()
    }
}

const EMPTY_SEGMENT: Segment =
    Segment { vaddr: unsafe { VirtAddr::new_unchecked(0) }, filesz: 0, memsz: 0, off: 0, perm: SegmentFlags::empty() };

impl SegmentMap {
    /// Creates an empty segment map.
    pub const fn new() -> Self {
        Self { segments: [EMPTY_SEGMENT; MAX_SEGMENTS], len: 0, sz: 0 }
    }

    /// Records a new `PT_LOAD` segment, validating it per exec's rules.
    pub fn push(&mut self, vaddr: VirtAddr, filesz: usize, memsz: usize, off: usize, perm: SegmentFlags) -> Result<(), SegmentError> {
        Segment::validate(vaddr, filesz, memsz)?;

        if self.len >= MAX_SEGMENTS {
            return Err(SegmentError::TooManySegments);
        }

        self.segments[self.len] = Segment { vaddr, filesz, memsz, off, perm };
        self.len += 1;

        let top = vaddr.as_usize() + memsz;
        if top > self.sz {
            self.sz = top;
        }

        Ok(())
    }

    /// Returns the segments recorded so far.
    pub fn iter(&self) -> impl Iterator<Item = &Segment> {
        self.segments[..self.len].iter()
    }

    /// Returns the segment containing `va`, if any.
    pub fn find(&self, va: VirtAddr) -> Option<&Segment> {
        self.iter().find(|seg| seg.contains(va))
    }

    /// Returns `max(vaddr + memsz)` over all recorded segments.
    pub fn sz(&self) -> usize {
        self.sz
    }

    /// Returns the first segment that is executable and not writable (the text
    /// segment), if any.
    pub fn text(&self) -> Option<&Segment> {
        self.iter().find(|s| s.perm.contains(SegmentFlags::X) && !s.perm.contains(SegmentFlags::W))
    }

    /// Returns the first segment that is writable and not executable (the data
    /// segment), if any.
    pub fn data(&self) -> Option<&Segment> {
        self.iter().find(|s| s.perm.contains(SegmentFlags::W) && !s.perm.contains(SegmentFlags::X))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_misaligned_segment() {
        let mut map = SegmentMap::new();
        let err = map.push(VirtAddr::new(0x1001), 0, 0x1000, 0, SegmentFlags::R);
        assert_eq!(err, Err(SegmentError::Misaligned));
    }

    #[test]
    fn rejects_filesz_exceeding_memsz() {
        let mut map = SegmentMap::new();
        let err = map.push(VirtAddr::new(0x1000), 0x2000, 0x1000, 0, SegmentFlags::R);
        assert_eq!(err, Err(SegmentError::FileszExceedsMemsz));
    }

    #[test]
    fn tracks_sz_across_segments() {
        let mut map = SegmentMap::new();
        map.push(VirtAddr::new(0x1000), 0x500, 0x1000, 0, SegmentFlags::R | SegmentFlags::X).unwrap();
        map.push(VirtAddr::new(0x2000), 0x800, 0x1800, 0x500, SegmentFlags::R | SegmentFlags::W).unwrap();
        assert_eq!(map.sz(), 0x3800);
    }

    #[test]
    fn to_entry_flags_maps_bits() {
        let flags = (SegmentFlags::R | SegmentFlags::X).to_entry_flags();
        assert!(flags.contains(crate::mm::pagetable::EntryFlags::READ));
        assert!(flags.contains(crate::mm::pagetable::EntryFlags::EXEC));
        assert!(!flags.contains(crate::mm::pagetable::EntryFlags::WRITE));
    }

    #[test]
    fn enforces_capacity() {
        let mut map = SegmentMap::new();
        for i in 0..MAX_SEGMENTS {
            map.push(VirtAddr::new((i + 1) * 0x1000), 0, 0x1000, 0, SegmentFlags::R).unwrap();
        }
        let err = map.push(VirtAddr::new((MAX_SEGMENTS + 1) * 0x1000), 0, 0x1000, 0, SegmentFlags::R);
        assert_eq!(err, Err(SegmentError::TooManySegments));
    }
}
