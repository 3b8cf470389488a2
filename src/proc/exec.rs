//! The ELF-deferred exec loader.
//!
//! Grounded on the original kernel's `exec`: validate the image, record its `PT_LOAD`
//! segments without reading a single byte of them, lay out the heap and stack above the
//! highest segment, and stage `argv` on the new stack before ever switching the process
//! over to the new image. Segment and heap/stack pages materialize later, through the
//! fault handler, the first time they are touched.

use alloc::{sync::Arc, vec, vec::Vec};
use core::convert::TryFrom;

use crate::{
    elf::{Elf64, ElfError},
    fs::{Inode, IoError, SwapBackend},
    mm::{
        PAGE_SIZE,
        addr::{Align, MAXVA, MemoryAddress, VirtAddr},
        allocator::FrameAllocator,
        pagetable::{PageSize, PageTableWalker},
    },
    proc::{
        MAXARG, USERSTACK,
        fault,
        process::{Process, ProcessPagingState, Trapframe},
        segment::SegmentFlags,
        uaccess,
    },
};

/// Error returned by [`exec`]. The process's previous image survives every variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecError {
    /// The ELF header or program-header table failed to parse.
    Elf(ElfError),
    /// The file is not a statically-linked executable (`ET_EXEC`).
    NotExecutable,
    /// A `PT_LOAD` segment failed validation (overlap, misalignment, too many segments).
    Segment(crate::proc::segment::SegmentError),
    /// The computed address-space layout overflows or escapes the canonical range.
    AddressOverflow,
    /// The frame allocator is exhausted (exec never evicts; there is no prior image's
    /// resident set to steal a frame from until the new one has committed).
    OutOfMemory,
    /// Mapping a page into the new address space failed.
    MapFailed,
    /// More than [`MAXARG`] argv entries were supplied.
    TooManyArgs,
    /// `argv` does not fit below the mapped stack region.
    StackOverflow,
    /// Staging an argv string or the argv pointer array failed.
    CopyFailed,
    /// Reading the executable failed.
    Io(IoError),
}

/// The register and address-space landmarks exec hands back to the caller, to be
/// copied into the scheduler's own trap-return bookkeeping (out of scope here).
#[derive(Debug, Clone, Copy)]
pub struct ExecImage {
    /// Number of argv entries.
    pub argc: usize,
    /// Entry point.
    pub entry: VirtAddr,
    /// Initial user stack pointer, already below the staged argv.
    pub sp: VirtAddr,
}

/// Loads `exec_inode` into `process`, replacing its address space on success.
///
/// Builds the new image in a scratch [`ProcessPagingState`] and only swaps it into
/// `process` once every segment is recorded, the guard page and the top stack page are
/// mapped, and `argv` is staged — mirroring the original's "everything fails before the
/// point of no return" structure. On any error the half-built state is torn down and
/// `process` is left untouched.
pub fn exec(
    process: &mut Process,
    exec_inode: Arc<dyn Inode>,
    argv: &[&[u8]],
    allocator: &mut impl FrameAllocator<PAGE_SIZE>,
    swap_backend: &impl SwapBackend,
) -> Result<ExecImage, ExecError> {
    if argv.len() > MAXARG {
        return Err(ExecError::TooManyArgs);
    }

    let pid = process.pid;

    let mut hdr_buf = [0u8; 64];
    exec_inode.read_at(0, &mut hdr_buf).map_err(ExecError::Io)?;
    let hdr = Elf64::header_only(&hdr_buf).map_err(ExecError::Elf)?;
    if !hdr.is_executable() {
        return Err(ExecError::NotExecutable);
    }

    let phoff = usize::try_from(hdr.e_phoff).map_err(|_| ExecError::Elf(ElfError::OutOfBounds))?;
    let entsz = usize::from(hdr.e_phentsize);
    let num = usize::from(hdr.e_phnum);
    let phbytes = entsz.checked_mul(num).ok_or(ExecError::Elf(ElfError::OutOfBounds))?;
    let phend = phoff.checked_add(phbytes).ok_or(ExecError::Elf(ElfError::OutOfBounds))?;

    let mut buf = vec![0u8; core::cmp::max(64, phend)];
    exec_inode.read_at(0, &mut buf).map_err(ExecError::Io)?;
    let elf = Elf64::parse(&buf).map_err(ExecError::Elf)?;

    let mut new_state = ProcessPagingState::new();
    new_state.direct_map = process.state.direct_map;

    for phdr in elf.program_headers() {
        let ph = phdr.map_err(ExecError::Elf)?;
        if !ph.is_load() {
            continue;
        }

        let mut perm = SegmentFlags::empty();
        if ph.is_readable() {
            perm |= SegmentFlags::R;
        }
        if ph.is_writable() {
            perm |= SegmentFlags::W;
        }
        if ph.is_executable() {
            perm |= SegmentFlags::X;
        }

        let vaddr_raw = usize::try_from(ph.p_vaddr).map_err(|_| ExecError::AddressOverflow)?;
        let vaddr = VirtAddr::try_new(vaddr_raw).map_err(|_| ExecError::AddressOverflow)?;

        new_state
            .segments
            .push(vaddr, ph.p_filesz as usize, ph.p_memsz as usize, ph.p_offset as usize, perm)
            .map_err(ExecError::Segment)?;
    }

    let heap_start_raw = new_state.segments.sz().align_up(PAGE_SIZE);
    let stack_bottom_raw = heap_start_raw.checked_add(PAGE_SIZE).ok_or(ExecError::AddressOverflow)?;
    let stack_top_raw =
        stack_bottom_raw.checked_add(USERSTACK * PAGE_SIZE).ok_or(ExecError::AddressOverflow)?;
    if stack_top_raw >= MAXVA {
        return Err(ExecError::AddressOverflow);
    }

    let heap_start = VirtAddr::try_new(heap_start_raw).map_err(|_| ExecError::AddressOverflow)?;
    let stack_bottom = VirtAddr::try_new(stack_bottom_raw).map_err(|_| ExecError::AddressOverflow)?;
    let stack_top = VirtAddr::try_new(stack_top_raw).map_err(|_| ExecError::AddressOverflow)?;

    new_state.heap_start = heap_start;
    new_state.stack_bottom = stack_bottom;
    new_state.stack_top = stack_top;
    new_state.sz = stack_top;

    // The guard page sits at heap_start, one page below the mapped stack region: any
    // access there faults as an out-of-band address rather than silently growing
    // into the stack.
    {
        let mut walker = PageTableWalker::new(&mut new_state.pagetable);
        walker.configure_direct_map(new_state.direct_map);
        // SAFETY: heap_start is unused in this brand-new address space.
        if unsafe { walker.install_invalid_leaf(heap_start, allocator) }.is_err() {
            rollback(&mut new_state, allocator);
            return Err(ExecError::OutOfMemory);
        }
    }

    // Only the top stack page is materialized up front, since argv must be copied out
    // before the process ever runs; the rest of the stack grows on demand.
    let top_stack_va = stack_top - PAGE_SIZE;
    let frame = match allocator.alloc(1) {
        Some(frame) => frame,
        None => {
            rollback(&mut new_state, allocator);
            return Err(ExecError::OutOfMemory);
        }
    };
    // SAFETY: frame was just allocated and is not otherwise referenced.
    unsafe { core::ptr::write_bytes(frame.virt() as *mut u8, 0, PAGE_SIZE) };

    let perm = fault::perm_for(&new_state, top_stack_va);
    {
        let mut walker = PageTableWalker::new(&mut new_state.pagetable);
        walker.configure_direct_map(new_state.direct_map);
        // SAFETY: top_stack_va is unmapped in this brand-new address space.
        let mapped = unsafe { walker.map(top_stack_va, frame.phys(), PageSize::Kb, perm, allocator) };
        if mapped.is_err() {
            allocator.free(frame);
            rollback(&mut new_state, allocator);
            return Err(ExecError::MapFailed);
        }
    }

    if new_state.pages.insert_resident(top_stack_va, false).is_err() {
        rollback(&mut new_state, allocator);
        return Err(ExecError::OutOfMemory);
    }

    let text = new_state.segments.text();
    let data = new_state.segments.data();
    kprintln!(
        "[pid {}] INIT-LAZYMAP text=[{:#x},{:#x}) data=[{:#x},{:#x}) heap_start={:#x} stack_top={:#x}",
        pid,
        text.map_or(0, |s| s.vaddr.as_usize()),
        text.map_or(0, |s| s.vaddr.as_usize() + s.memsz),
        data.map_or(0, |s| s.vaddr.as_usize()),
        data.map_or(0, |s| s.vaddr.as_usize() + s.memsz),
        heap_start.as_usize(),
        stack_top.as_usize(),
    );

    let stack_floor = stack_bottom.as_usize();
    let mut sp = stack_top.as_usize();
    let mut ustack = [0u64; MAXARG + 1];

    for (i, arg) in argv.iter().enumerate() {
        let mut bytes = Vec::with_capacity(arg.len() + 1);
        bytes.extend_from_slice(arg);
        bytes.push(0);

        sp -= bytes.len();
        sp -= sp % 16;
        if sp < stack_floor {
            rollback(&mut new_state, allocator);
            return Err(ExecError::StackOverflow);
        }

        if uaccess::copy_out(&mut new_state, pid, stack_top, VirtAddr::new(sp), &bytes, allocator, swap_backend)
            .is_err()
        {
            rollback(&mut new_state, allocator);
            return Err(ExecError::CopyFailed);
        }

        ustack[i] = sp as u64;
    }
    ustack[argv.len()] = 0;

    let ptrs_len = (argv.len() + 1) * 8;
    sp -= ptrs_len;
    sp -= sp % 16;
    if sp < stack_floor {
        rollback(&mut new_state, allocator);
        return Err(ExecError::StackOverflow);
    }

    let mut ptr_buf = Vec::with_capacity(ptrs_len);
    for &p in &ustack[..=argv.len()] {
        ptr_buf.extend_from_slice(&p.to_le_bytes());
    }

    if uaccess::copy_out(&mut new_state, pid, stack_top, VirtAddr::new(sp), &ptr_buf, allocator, swap_backend)
        .is_err()
    {
        rollback(&mut new_state, allocator);
        return Err(ExecError::CopyFailed);
    }

    let argv_ptr = sp as u64;
    let entry_raw = usize::try_from(hdr.e_entry).map_err(|_| ExecError::AddressOverflow)?;

    new_state.exec_inode = Some(exec_inode);

    let old_state = core::mem::replace(&mut process.state, new_state);
    process.trapframe = Trapframe { epc: entry_raw, sp, a0: argv.len() as u64, a1: argv_ptr };

    // The new image has committed; now it's safe to free what the old one held.
    let mut old_state = old_state;
    let mut old_walker = PageTableWalker::new(&mut old_state.pagetable);
    old_walker.configure_direct_map(old_state.direct_map);
    old_walker.teardown(allocator);

    Ok(ExecImage { argc: argv.len(), entry: VirtAddr::new(entry_raw), sp: VirtAddr::new(sp) })
}

fn rollback(state: &mut ProcessPagingState, allocator: &mut impl FrameAllocator<PAGE_SIZE>) {
    let mut walker = PageTableWalker::new(&mut state.pagetable);
    walker.configure_direct_map(state.direct_map);
    walker.teardown(allocator);
}
