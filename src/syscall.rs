//! Thin syscall wrappers (`sbrk`, `memstat`) over the paging subsystem.
//!
//! The full syscall table, argument-register decoding from a trap frame, and the trap
//! entry/return sequence itself are out of scope; this module only shows how the two
//! syscalls this crate cares about are reached once their arguments have been decoded.

use crate::{
    fs::SwapBackend,
    mm::{
        PAGE_SIZE,
        addr::{MemoryAddress, VirtAddr},
        allocator::FrameAllocator,
    },
    proc::{
        memstat,
        process::{Process, SbrkMode},
    },
};

/// Syscall numbers.
#[repr(usize)]
pub enum Sysno {
    /// Grow or shrink the calling process's address space.
    Sbrk = 0,
    /// Snapshot the calling process's demand-paging state.
    Memstat = 1,
}

/// Syscall arguments passed from user space.
#[derive(Debug, Clone, Copy)]
pub struct SysArgs([usize; 6]);

impl SysArgs {
    /// Creates a new `SysArgs` instance from the given array of syscall arguments.
    #[inline]
    pub fn new(args: [usize; 6]) -> Self {
        SysArgs(args)
    }

    /// Retrieves the syscall argument at the specified index.
    #[inline]
    pub fn get(&self, n: usize) -> usize {
        self.0[n]
    }
}

/// Possible syscall error codes.
#[repr(isize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Errno {
    /// Invalid argument.
    EINVAL = 22,
    /// Out of memory.
    ENOMEM = 12,
    /// Bad address.
    EFAULT = 14,
}

/// Syscall result type.
pub type SysResult<T> = Result<T, Errno>;

/// Converts a `SysResult` into a raw return value for syscalls.
pub fn to_ret(res: SysResult<usize>) -> usize {
    match res {
        Ok(val) => val,
        Err(err) => (-(err as i64)) as isize as usize, // Return negative error code
    }
}

/// Grows or shrinks `process`'s address space by `args[0]` bytes (interpreted as a
/// signed delta), taking the eager path if `args[1]` is nonzero.
///
/// Returns the previous `sz`, matching `sys_sbrk`'s return convention.
pub fn sys_sbrk(
    args: SysArgs,
    process: &mut Process,
    allocator: &mut impl FrameAllocator<PAGE_SIZE>,
    swap_backend: &impl SwapBackend,
) -> SysResult<usize> {
    let delta = args.get(0) as isize;
    let mode = if args.get(1) != 0 { SbrkMode::Eager } else { SbrkMode::Lazy };

    process.sbrk(delta, mode, allocator, swap_backend).map_err(|_| Errno::ENOMEM)
}

/// Writes a [`memstat::MemStat`] snapshot of `process` to the user buffer pointed to by
/// `args[0]`, returning the number of bytes written.
pub fn sys_memstat(
    args: SysArgs,
    process: &mut Process,
    allocator: &mut impl FrameAllocator<PAGE_SIZE>,
    swap_backend: &impl SwapBackend,
) -> SysResult<usize> {
    let dst_va = VirtAddr::try_new(args.get(0)).map_err(|_| Errno::EFAULT)?;

    let stat = memstat::collect(&process.state, process.pid);
    let size = core::mem::size_of::<memstat::MemStat>();

    // SAFETY: MemStat is repr(C) and contains no padding that aliases live references;
    // this reinterprets it as its own byte representation for the duration of the copy.
    let bytes = unsafe { core::slice::from_raw_parts(&stat as *const memstat::MemStat as *const u8, size) };

    process.copy_out(dst_va, bytes, allocator, swap_backend).map_err(|_| Errno::EFAULT)?;

    Ok(size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        fs::test_support::MemSwapBackend,
        mm::{addr::PhysAddr, allocator::BumpFrameAllocator},
    };

    fn new_allocator(pages: usize) -> BumpFrameAllocator<PAGE_SIZE> {
        let layout = core::alloc::Layout::from_size_align(pages * PAGE_SIZE, PAGE_SIZE).unwrap();
        // SAFETY: layout has non-zero size.
        let ptr = unsafe { alloc::alloc::alloc_zeroed(layout) };
        assert!(!ptr.is_null());
        let start = ptr as usize;
        BumpFrameAllocator::new(PhysAddr::new(start), PhysAddr::new(start + pages * PAGE_SIZE))
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
    fn sys_sbrk_grows_lazily_and_returns_old_sz() {
        let mut p = new_process();
        let mut alloc = new_allocator(4);
        let backend = MemSwapBackend;

        let args = SysArgs::new([PAGE_SIZE, 0, 0, 0, 0, 0]);
        let old = sys_sbrk(args, &mut p, &mut alloc, &backend).unwrap();

        assert_eq!(old, 0x10000);
        assert_eq!(p.state.sz, VirtAddr::new(0x10000 + PAGE_SIZE));
    }

    #[test]
    fn sys_sbrk_reports_out_of_range_as_enomem() {
        let mut p = new_process();
        p.state.sz = VirtAddr::new(crate::proc::TRAPFRAME);
        let mut alloc = new_allocator(4);
        let backend = MemSwapBackend;

        let args = SysArgs::new([PAGE_SIZE, 0, 0, 0, 0, 0]);
        assert_eq!(sys_sbrk(args, &mut p, &mut alloc, &backend), Err(Errno::ENOMEM));
    }

    #[test]
    fn sys_memstat_writes_a_snapshot_into_the_user_buffer() {
        let mut p = new_process();
        let mut alloc = new_allocator(4);
        let backend = MemSwapBackend;

        let dst = p.state.heap_start.as_usize();
        let args = SysArgs::new([dst, 0, 0, 0, 0, 0]);
        let written = sys_memstat(args, &mut p, &mut alloc, &backend).unwrap();

        assert_eq!(written, core::mem::size_of::<memstat::MemStat>());
        assert!(p.state.pages.find(p.state.heap_start).unwrap().resident);

        let mut buf = alloc::vec![0u8; written];
        p.copy_in(&mut buf, VirtAddr::new(dst), &mut alloc, &backend).unwrap();
        // SAFETY: buf holds exactly the bytes of the MemStat just written out.
        let stat = unsafe { core::ptr::read_unaligned(buf.as_ptr() as *const memstat::MemStat) };
        assert_eq!(stat.pid, 1);
    }

    #[test]
    fn sys_memstat_rejects_a_non_canonical_destination() {
        let mut p = new_process();
        let mut alloc = new_allocator(4);
        let backend = MemSwapBackend;

        let args = SysArgs::new([crate::mm::addr::MAXVA, 0, 0, 0, 0, 0]);
        assert_eq!(sys_memstat(args, &mut p, &mut alloc, &backend), Err(Errno::EFAULT));
    }

    #[test]
    fn to_ret_negates_errno() {
        assert_eq!(to_ret(Err(Errno::EINVAL)), (-22i64) as isize as usize);
        assert_eq!(to_ret(Ok(42)), 42);
    }
}
