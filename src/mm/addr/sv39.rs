//! Sv39 (and, for parity with the teacher crate, Sv48) address validation and bit-field
//! extraction.
//!
//! The teacher crate puts this behind `arch::riscv`, gated by `#[cfg(target_arch =
//! "riscv64")]`, because the surrounding module also holds inline-assembly CSR access. The
//! address arithmetic here is pure bit manipulation over `usize`/`u64` with no inline
//! assembly, so it is hoisted out to a `sv39`/`sv48` Cargo feature instead and builds (and
//! is tested) on a host target, the same way `mm::allocator::bump` does for the frame
//! allocator.

use crate::mm::{
    PAGE_SHIFT,
    addr::{InvalidAddrError, MemoryAddress, PhysAddr, VirtAddr},
};

#[cfg(all(feature = "sv39", feature = "sv48"))]
compile_error!("Features \"sv39\" and \"sv48\" are mutually exclusive.");

#[cfg(not(any(feature = "sv39", feature = "sv48")))]
compile_error!("One of \"sv39\" or \"sv48\" must be enabled.");

/// Highest valid user virtual address for the active paging layout, exclusive.
///
/// Mirrors the original kernel's `MAXVA`: one page below the top of the VPN space, so
/// that a sign-extended address can never collide with the highest PTE index.
#[cfg(feature = "sv39")]
pub const MAXVA: usize = 1 << (9 + 9 + 9 + 12 - 1);
#[cfg(feature = "sv48")]
pub const MAXVA: usize = 1 << (9 + 9 + 9 + 9 + 12 - 1);

/// Physical memory address.
impl MemoryAddress for PhysAddr {
    fn new(addr: usize) -> Self {
        Self::try_new(addr)
            .expect("address passed to PhysAddr::new must not contain any data in bits 56 to 63")
    }

    fn try_new(addr: usize) -> Result<Self, InvalidAddrError> {
        if addr >> 56 != 0 {
            Err(InvalidAddrError)
        } else {
            // SAFETY: upper bits are checked
            Ok(unsafe { Self::new_unchecked(addr) })
        }
    }
}

/// Sv39/Sv48-specific extensions to the `PhysAddr` type.
pub trait PhysAddrExt {
    /// Creates a new physical address from a physical page index.
    ///
    /// # Panics
    ///
    /// Panics if `ppn` is not a valid physical page index for the active paging layout.
    fn from_ppn(ppn: usize) -> Self;

    /// Creates a new physical address throwing away the upper bits of the address.
    fn new_truncated(addr: usize) -> Self;

    /// Returns the lowest 12 bits of this address.
    fn page_offset(self) -> usize;

    /// Returns the full page number of this address.
    fn page_index(self) -> usize;

    /// Returns the 9-bit level 0 page table index.
    fn ppn0(self) -> usize;

    /// Returns the 9-bit level 1 page table index.
    fn ppn1(self) -> usize;

    /// Returns the level 2 page table index.
    ///
    /// The size of this field varies depending on the paging layout.
    fn ppn2(self) -> usize;

    /// Returns the 17-bit level 3 page table index.
    #[cfg(feature = "sv48")]
    fn ppn3(self) -> usize;
}

impl PhysAddrExt for PhysAddr {
    fn from_ppn(ppn: usize) -> Self {
        Self::try_new(ppn << PAGE_SHIFT)
            .expect("index passed to PhysAddr::from_ppn is not a valid page number")
    }

    fn new_truncated(addr: usize) -> Self {
        // SAFETY: upper bits are discarded
        unsafe { Self::new_unchecked((addr << 8) >> 8) }
    }

    fn page_offset(self) -> usize {
        self.as_usize() & 0xfff
    }

    fn page_index(self) -> usize {
        (self.as_usize() >> PAGE_SHIFT) & 0xfff_ffff_ffff
    }

    fn ppn0(self) -> usize {
        (self.as_usize() >> 12) & 0x1ff
    }

    fn ppn1(self) -> usize {
        (self.as_usize() >> 21) & 0x1ff
    }

    fn ppn2(self) -> usize {
        if cfg!(feature = "sv39") {
            (self.as_usize() >> 30) & 0x3ff_ffff
        } else {
            /* feature = "sv48" */
            (self.as_usize() >> 30) & 0x1ff
        }
    }

    #[cfg(feature = "sv48")]
    fn ppn3(self) -> usize {
        (self.as_usize() >> 39) & 0x1ffff
    }
}

/// Virtual memory address.
///
///  - In Sv39 mode, virtual addresses are 64-bit wide but only the lower 39 bits are used
///    by the MMU. Bits 63-39 must all be equal to bit 38, or else a page-fault exception
///    would occur on real hardware.
///  - In Sv48 mode, the same holds for the lower 48 bits and bit 47.
///
/// The safe methods of this type ensure that the above constraints are met.
impl MemoryAddress for VirtAddr {
    /// Creates a new virtual address.
    ///
    /// # Panics
    ///
    /// Panics if `addr` is not a valid virtual address for the active paging layout.
    fn new(addr: usize) -> Self {
        Self::try_new(addr).expect("address passed to VirtAddr::new must be properly sign-extended")
    }

    /// Tries to create a new virtual address.
    ///
    /// This function tries to perform sign extension to make the address canonical. It
    /// succeeds if the upper bits are either a correct sign extension or all null. Else,
    /// an error is returned.
    fn try_new(addr: usize) -> Result<Self, InvalidAddrError> {
        let shr = if cfg!(feature = "sv39") { 38 } else { 47 };

        // SAFETY: upper bits are checked
        unsafe {
            match addr >> shr {
                #[cfg(feature = "sv39")]
                0 | 0x3ff_ffff => Ok(Self::new_unchecked(addr)),
                #[cfg(feature = "sv48")]
                0 | 0x1ffff => Ok(Self::new_unchecked(addr)),
                1 => Ok(Self::new_truncated(addr)),
                _ => Err(InvalidAddrError),
            }
        }
    }
}

/// Sv39/Sv48-specific extensions to the `VirtAddr` type.
pub trait VirtAddrExt {
    /// Creates a new virtual address, throwing away the upper bits of the address.
    ///
    /// This function performs sign extension to make the address canonical, so upper bits
    /// are overwritten. If you want to check that these bits contain no data, use `new` or
    /// `try_new`.
    fn new_truncated(addr: usize) -> Self;

    /// Returns the lowest 12 bits of this address.
    fn page_offset(self) -> usize;

    /// Returns the full page number of this address.
    fn page_index(self) -> usize;

    /// Returns the 9-bit level 0 page table index.
    fn vpn0(self) -> usize;

    /// Returns the 9-bit level 1 page table index.
    fn vpn1(self) -> usize;

    /// Returns the 9-bit level 2 page table index.
    fn vpn2(self) -> usize;

    /// Returns the 9-bit level 3 page table index.
    #[cfg(feature = "sv48")]
    fn vpn3(self) -> usize;
}

impl VirtAddrExt for VirtAddr {
    fn new_truncated(addr: usize) -> Self {
        // SAFETY: upper bits are discarded
        unsafe {
            if cfg!(feature = "sv39") {
                Self::new_unchecked(((addr << 25) as isize >> 25) as usize)
            } else {
                /* feature = "sv48" */
                Self::new_unchecked(((addr << 16) as isize >> 16) as usize)
            }
        }
    }

    fn page_offset(self) -> usize {
        self.as_usize() & 0xfff
    }

    fn page_index(self) -> usize {
        if cfg!(feature = "sv39") {
            (self.as_usize() >> PAGE_SHIFT) & 0x7ff_ffff
        } else {
            /* feature = "sv48" */
            (self.as_usize() >> PAGE_SHIFT) & 0xf_ffff_ffff
        }
    }

    fn vpn0(self) -> usize {
        (self.as_usize() >> 12) & 0x1ff
    }

    fn vpn1(self) -> usize {
        (self.as_usize() >> 21) & 0x1ff
    }

    fn vpn2(self) -> usize {
        (self.as_usize() >> 30) & 0x1ff
    }

    #[cfg(feature = "sv48")]
    fn vpn3(self) -> usize {
        (self.as_usize() >> 39) & 0x1ff
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn virt_addr_rejects_non_canonical() {
        assert!(VirtAddr::try_new(1 << 40).is_err());
    }

    #[test]
    fn virt_addr_accepts_low_half() {
        assert_eq!(VirtAddr::new(0x1000).as_usize(), 0x1000);
    }

    #[test]
    fn phys_addr_round_trips_ppn() {
        let pa = PhysAddr::from_ppn(0x42);
        assert_eq!(pa.page_index(), 0x42);
    }

    #[test]
    fn maxva_is_page_aligned() {
        use crate::mm::addr::Align;
        assert!(MAXVA.is_aligned(4096));
    }
}
