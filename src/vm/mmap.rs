//! The mmap/munmap surface.

use crate::addr::{addr_to_pn, page_aligned, pn_to_addr};
use crate::error::{Errno, KResult};
use crate::fs::file::{self, FileMode};
use crate::kernel::KernelCtx;
use crate::param::{PAGE_SIZE, USER_MEM_HIGH, USER_MEM_LOW};
use crate::vm::tlb;
use crate::vm::vmmap::{Dir, MapFlags, Prot};

/// Adds a mapping to the current process's address space and returns its
/// address. Supports the SHARED, PRIVATE, FIXED and ANON flags.
pub fn do_mmap(
    ctx: &KernelCtx<'_>,
    addr: usize,
    len: usize,
    prot: Prot,
    flags: MapFlags,
    fd: i32,
    off: usize,
) -> KResult<usize> {
    if !page_aligned(addr) || !page_aligned(off) || len == 0 {
        return Err(Errno::EINVAL);
    }
    if flags.contains(MapFlags::FIXED) && (addr < USER_MEM_LOW || addr >= USER_MEM_HIGH) {
        return Err(Errno::EINVAL);
    }
    if flags.contains(MapFlags::SHARED) == flags.contains(MapFlags::PRIVATE) {
        return Err(Errno::EINVAL);
    }

    let file = if flags.contains(MapFlags::ANON) {
        None
    } else {
        let f = file::fget(ctx, fd).ok_or(Errno::EBADF)?;
        let guard = scopeguard::guard(f, |f| file::fput(ctx, f));
        if !guard.mode().contains(FileMode::READ)
            || (flags.contains(MapFlags::SHARED)
                && prot.contains(Prot::WRITE)
                && !guard.mode().contains(FileMode::WRITE))
            || (prot.contains(Prot::WRITE) && guard.mode() == FileMode::APPEND)
        {
            return Err(Errno::EACCES);
        }
        Some(guard)
    };

    let p = ctx.curproc();
    let npages = (len - 1) / PAGE_SIZE + 1;
    let area = p.vmmap.borrow_mut().map(
        ctx,
        file.as_ref().map(|f| f.vnode()),
        addr_to_pn(addr),
        npages,
        prot,
        flags,
        addr_to_pn(off),
        Dir::HiLo,
    )?;

    let (start, end) = {
        let a = area.borrow();
        (a.start, a.end)
    };
    p.pagedir.borrow_mut().unmap_range(start, end);
    tlb::flush_range(pn_to_addr(start), end - start);
    Ok(pn_to_addr(start))
}

/// Removes any mappings in `[addr, addr + len)`.
pub fn do_munmap(ctx: &KernelCtx<'_>, addr: usize, len: usize) -> KResult<()> {
    if !page_aligned(addr) || len == 0 {
        return Err(Errno::EINVAL);
    }
    if addr < USER_MEM_LOW || addr >= USER_MEM_HIGH {
        return Err(Errno::EINVAL);
    }
    let lopage = addr_to_pn(addr);
    let npages = (len - 1) / PAGE_SIZE + 1;
    if lopage + npages > addr_to_pn(USER_MEM_HIGH) {
        return Err(Errno::EINVAL);
    }
    let p = ctx.curproc();
    p.vmmap.borrow_mut().remove(ctx, lopage, npages);
    p.pagedir.borrow_mut().unmap_range(lopage, lopage + npages);
    tlb::flush_range(addr, npages);
    Ok(())
}
