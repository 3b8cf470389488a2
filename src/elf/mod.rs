//! Minimal ELF64 little-endian header and program-header parser.
//!
//! Restricted to identifying loadable (`PT_LOAD`) segments (§1, "ELF parsing beyond
//! identifying loadable segments" is out of scope): the exec loader (§4.2) never reads a
//! whole executable into memory, so unlike the upstream `elf` crate this does not offer a
//! `segment_data` accessor that slices a fully-buffered file — segment bytes are read
//! lazily through [`crate::fs::Inode`] at fault time instead.
//!
//! Safety model: bounds-checked slicing and manual little-endian decoding, no `unsafe`.

use core::convert::TryFrom;

pub mod abi;

/// Error returned while parsing an ELF header or program-header table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElfError {
    /// The buffer is too small to contain a full ELF64 header or program header.
    TooSmall,
    /// The ELF magic number (`\x7fELF`) is missing.
    BadMagic,
    /// The file does not declare itself as 64-bit (`ELFCLASS64`).
    NotElf64,
    /// The file does not declare itself as little-endian (`ELFDATA2LSB`).
    NotLittleEndian,
    /// `e_ehsize` does not match the expected ELF64 header size.
    BadHeaderSize,
    /// `e_phentsize` does not match the expected ELF64 program header size.
    BadPhEntSize,
    /// A field references a byte range outside the buffer.
    OutOfBounds,
}

/// The fixed-size fields of an ELF64 header relevant to loading a program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Elf64Header {
    /// Object file type (`ET_EXEC`, `ET_DYN`, ...).
    pub e_type: u16,
    /// Entry point virtual address.
    pub e_entry: u64,
    /// File offset of the program header table.
    pub e_phoff: u64,
    /// Size in bytes of one program header table entry.
    pub e_phentsize: u16,
    /// Number of entries in the program header table.
    pub e_phnum: u16,
}

/// A single ELF64 program header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Elf64Phdr {
    /// Segment type (`PT_LOAD`, ...).
    pub p_type: u32,
    /// Segment permission flags.
    pub p_flags: u32,
    /// Offset of the segment's data within the file.
    pub p_offset: u64,
    /// Virtual address at which the first byte of the segment is placed.
    pub p_vaddr: u64,
    /// Number of bytes in the file image of the segment.
    pub p_filesz: u64,
    /// Number of bytes in the memory image of the segment.
    pub p_memsz: u64,
    /// Required alignment for the segment.
    pub p_align: u64,
}

const EI_NIDENT: usize = 16;
const ELFMAG: [u8; 4] = [0x7F, b'E', b'L', b'F'];
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;

/// A parsed ELF64 file, giving access to its header and program headers.
pub struct Elf64<'a> {
    data: &'a [u8],
    hdr: Elf64Header,
}

impl<'a> Elf64<'a> {
    /// Parses the ELF64 header out of `data`, validating the magic, class, endianness, and
    /// program-header-table bounds.
    pub fn parse(data: &'a [u8]) -> Result<Self, ElfError> {
        let hdr = Self::parse_header(data)?;

        if hdr.e_phnum != 0 {
            let phoff = usize::try_from(hdr.e_phoff).map_err(|_| ElfError::OutOfBounds)?;
            let entsz = usize::from(hdr.e_phentsize);
            let num = usize::from(hdr.e_phnum);
            let bytes = entsz.checked_mul(num).ok_or(ElfError::OutOfBounds)?;
            get_range(data, phoff, bytes)?;
        }

        Ok(Self { data, hdr })
    }

    /// Validates and decodes just the fixed-size ELF64 header, without requiring the
    /// program-header table to be present in `data`.
    ///
    /// Meant for callers that read a file incrementally through an [`crate::fs::Inode`]:
    /// the returned header's `e_phoff`/`e_phnum`/`e_phentsize` tell the caller how many
    /// more bytes to fetch before the whole buffer can be handed to [`Self::parse`].
    pub fn header_only(data: &[u8]) -> Result<Elf64Header, ElfError> {
        Self::parse_header(data)
    }

    fn parse_header(data: &[u8]) -> Result<Elf64Header, ElfError> {
        if data.len() < 64 {
            return Err(ElfError::TooSmall);
        }

        let ident = get_range(data, 0, EI_NIDENT)?;
        if ident[0..4] != ELFMAG {
            return Err(ElfError::BadMagic);
        }
        if ident[4] != ELFCLASS64 {
            return Err(ElfError::NotElf64);
        }
        if ident[5] != ELFDATA2LSB {
            return Err(ElfError::NotLittleEndian);
        }

        // Fixed offsets for ELF64 header fields (System V ABI):
        //   0x10 e_type (2), 0x18 e_entry (8), 0x20 e_phoff (8),
        //   0x34 e_ehsize (2), 0x36 e_phentsize (2), 0x38 e_phnum (2)
        let e_type = read_u16_le(get_range(data, 0x10, 2)?)?;
        let e_entry = read_u64_le(get_range(data, 0x18, 8)?)?;
        let e_phoff = read_u64_le(get_range(data, 0x20, 8)?)?;
        let e_ehsize = read_u16_le(get_range(data, 0x34, 2)?)?;
        let e_phentsize = read_u16_le(get_range(data, 0x36, 2)?)?;
        let e_phnum = read_u16_le(get_range(data, 0x38, 2)?)?;

        if e_ehsize != 64 {
            return Err(ElfError::BadHeaderSize);
        }
        if e_phnum != 0 && e_phentsize != 56 {
            return Err(ElfError::BadPhEntSize);
        }

        Ok(Elf64Header {
            e_type,
            e_entry,
            e_phoff,
            e_phentsize,
            e_phnum,
        })
    }

    /// Returns the parsed ELF header.
    pub fn header(&self) -> &Elf64Header {
        &self.hdr
    }

    /// Returns an iterator over the program headers in the table.
    pub fn program_headers(&self) -> ProgramHeaderIter<'a> {
        ProgramHeaderIter {
            data: self.data,
            off: self.hdr.e_phoff as usize,
            idx: 0,
            count: self.hdr.e_phnum as usize,
            entsz: self.hdr.e_phentsize as usize,
        }
    }
}

impl Elf64Header {
    /// Returns whether this is a statically-linked executable (`ET_EXEC`).
    pub fn is_executable(&self) -> bool {
        self.e_type == abi::ET_EXEC
    }
}

impl Elf64Phdr {
    /// Returns whether this program header describes a loadable segment.
    pub fn is_load(&self) -> bool {
        self.p_type == abi::PT_LOAD
    }

    /// Returns whether the segment is readable.
    pub fn is_readable(&self) -> bool {
        (self.p_flags & abi::PF_R) != 0
    }

    /// Returns whether the segment is writable.
    pub fn is_writable(&self) -> bool {
        (self.p_flags & abi::PF_W) != 0
    }

    /// Returns whether the segment is executable.
    pub fn is_executable(&self) -> bool {
        (self.p_flags & abi::PF_X) != 0
    }
}

/// An iterator over the program headers of an [`Elf64`] file.
pub struct ProgramHeaderIter<'a> {
    data: &'a [u8],
    off: usize,
    idx: usize,
    count: usize,
    entsz: usize,
}

impl ProgramHeaderIter<'_> {
    fn parse_one(&self, ph: &[u8]) -> Result<Elf64Phdr, ElfError> {
        // ELF64 Phdr layout (56 bytes):
        //   0x00 p_type(4) 0x04 p_flags(4) 0x08 p_offset(8) 0x10 p_vaddr(8)
        //   0x18 p_paddr(8) 0x20 p_filesz(8) 0x28 p_memsz(8) 0x30 p_align(8)
        if ph.len() < 56 {
            return Err(ElfError::TooSmall);
        }
        Ok(Elf64Phdr {
            p_type: read_u32_le(&ph[0x00..0x04])?,
            p_flags: read_u32_le(&ph[0x04..0x08])?,
            p_offset: read_u64_le(&ph[0x08..0x10])?,
            p_vaddr: read_u64_le(&ph[0x10..0x18])?,
            p_filesz: read_u64_le(&ph[0x20..0x28])?,
            p_memsz: read_u64_le(&ph[0x28..0x30])?,
            p_align: read_u64_le(&ph[0x30..0x38])?,
        })
    }
}

impl Iterator for ProgramHeaderIter<'_> {
    type Item = Result<Elf64Phdr, ElfError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.idx >= self.count {
            return None;
        }
        let start = self.off + self.idx * self.entsz;
        self.idx += 1;

        Some(get_range(self.data, start, self.entsz).and_then(|ph| self.parse_one(ph)))
    }
}

fn read_u16_le(b: &[u8]) -> Result<u16, ElfError> {
    if b.len() < 2 {
        return Err(ElfError::TooSmall);
    }
    Ok(u16::from_le_bytes([b[0], b[1]]))
}

fn read_u32_le(b: &[u8]) -> Result<u32, ElfError> {
    if b.len() < 4 {
        return Err(ElfError::TooSmall);
    }
    Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

fn read_u64_le(b: &[u8]) -> Result<u64, ElfError> {
    if b.len() < 8 {
        return Err(ElfError::TooSmall);
    }
    Ok(u64::from_le_bytes([
        b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
    ]))
}

fn get_range(data: &[u8], off: usize, len: usize) -> Result<&[u8], ElfError> {
    data.get(off..off + len).ok_or(ElfError::OutOfBounds)
}

#[cfg(test)]
mod tests {
    use alloc::vec::Vec;

    use super::*;

    fn build_elf(phdrs: &[Elf64Phdr], entry: u64) -> Vec<u8> {
        let mut buf = alloc::vec![0u8; 64];
        buf[0..4].copy_from_slice(&ELFMAG);
        buf[4] = ELFCLASS64;
        buf[5] = ELFDATA2LSB;
        buf[0x10..0x12].copy_from_slice(&abi::ET_EXEC.to_le_bytes());
        buf[0x18..0x20].copy_from_slice(&entry.to_le_bytes());
        buf[0x20..0x28].copy_from_slice(&(64u64).to_le_bytes());
        buf[0x34..0x36].copy_from_slice(&(64u16).to_le_bytes());
        buf[0x36..0x38].copy_from_slice(&(56u16).to_le_bytes());
        buf[0x38..0x3A].copy_from_slice(&(phdrs.len() as u16).to_le_bytes());

        for ph in phdrs {
            let mut entry = [0u8; 56];
            entry[0x00..0x04].copy_from_slice(&ph.p_type.to_le_bytes());
            entry[0x04..0x08].copy_from_slice(&ph.p_flags.to_le_bytes());
            entry[0x08..0x10].copy_from_slice(&ph.p_offset.to_le_bytes());
            entry[0x10..0x18].copy_from_slice(&ph.p_vaddr.to_le_bytes());
            entry[0x20..0x28].copy_from_slice(&ph.p_filesz.to_le_bytes());
            entry[0x28..0x30].copy_from_slice(&ph.p_memsz.to_le_bytes());
            entry[0x30..0x38].copy_from_slice(&ph.p_align.to_le_bytes());
            buf.extend_from_slice(&entry);
        }

        buf
    }

    fn phdr(p_type: u32, p_flags: u32, vaddr: u64, filesz: u64, memsz: u64, off: u64) -> Elf64Phdr {
        Elf64Phdr {
            p_type,
            p_flags,
            p_offset: off,
            p_vaddr: vaddr,
            p_filesz: filesz,
            p_memsz: memsz,
            p_align: 4096,
        }
    }

    #[test]
    fn parses_valid_header_and_segments() {
        let text = phdr(abi::PT_LOAD, abi::PF_R | abi::PF_X, 0x1000, 0x200, 0x200, 64);
        let data = phdr(abi::PT_LOAD, abi::PF_R | abi::PF_W, 0x2000, 0x80, 0x400, 320);
        let buf = build_elf(&[text, data], 0x1000);

        let elf = Elf64::parse(&buf).unwrap();
        assert!(elf.header().is_executable());
        assert_eq!(elf.header().e_entry, 0x1000);

        let segs: Vec<_> = elf.program_headers().map(|p| p.unwrap()).collect();
        assert_eq!(segs.len(), 2);
        assert!(segs[0].is_load() && segs[0].is_readable() && segs[0].is_executable());
        assert!(segs[1].is_writable() && !segs[1].is_executable());
    }

    #[test]
    fn rejects_bad_magic() {
        let mut buf = build_elf(&[], 0);
        buf[0] = 0;
        assert_eq!(Elf64::parse(&buf), Err(ElfError::BadMagic));
    }

    #[test]
    fn rejects_truncated_buffer() {
        assert_eq!(Elf64::parse(&[0u8; 10]), Err(ElfError::TooSmall));
    }

    #[test]
    fn header_only_succeeds_without_phdr_bytes() {
        let text = phdr(abi::PT_LOAD, abi::PF_R | abi::PF_X, 0x1000, 0x200, 0x200, 64);
        let buf = build_elf(&[text], 0x1000);
        let hdr = Elf64::header_only(&buf[..64]).unwrap();
        assert_eq!(hdr.e_phnum, 1);
        assert_eq!(hdr.e_phoff, 64);
    }

    #[test]
    fn rejects_out_of_bounds_program_header_table() {
        let mut buf = build_elf(&[], 0);
        // Claim one program header but don't actually append it.
        buf[0x38..0x3A].copy_from_slice(&1u16.to_le_bytes());
        assert_eq!(Elf64::parse(&buf), Err(ElfError::OutOfBounds));
    }
}
