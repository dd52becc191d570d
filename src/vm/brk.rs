//! The process break.

use crate::addr::{addr_to_pn, page_align_up, pn_to_addr};
use crate::error::{Errno, KResult};
use crate::kernel::KernelCtx;
use crate::param::USER_MEM_LOW;
use crate::vm::tlb;
use crate::vm::vmmap::{Dir, MapFlags, Prot};

/// Establishes the dynamic region: the loader's job, done here because the
/// loader is out of scope. Maps the page holding the last byte below `addr`
/// as the (non-empty) data region and sets both break pointers to `addr`.
pub fn init_brk(ctx: &KernelCtx<'_>, addr: usize) -> KResult<()> {
    assert!(addr > USER_MEM_LOW);
    let p = ctx.curproc();
    assert_eq!(p.start_brk.get(), 0, "break initialized twice");
    let pn = addr_to_pn(addr - 1);
    p.vmmap.borrow_mut().map(
        ctx,
        None,
        pn,
        1,
        Prot::READ | Prot::WRITE,
        MapFlags::PRIVATE,
        0,
        Dir::LoHi,
    )?;
    p.start_brk.set(addr);
    p.brk.set(addr);
    Ok(())
}

/// Grows or shrinks the dynamic region so that it ends at `addr`, and returns
/// the new break. `addr == 0` queries the current break.
///
/// The break may not drop below its initial value, and the region may not run
/// past the top of the user range or into another mapping.
pub fn do_brk(ctx: &KernelCtx<'_>, addr: usize) -> KResult<usize> {
    let p = ctx.curproc();
    if addr == 0 {
        return Ok(p.brk.get());
    }
    let start_brk = p.start_brk.get();
    assert!(start_brk != 0, "brk before the dynamic region exists");
    if addr < start_brk {
        return Err(Errno::ENOMEM);
    }

    let map = p.vmmap.borrow_mut();
    let area = map
        .lookup(addr_to_pn(p.brk.get() - 1))
        .expect("dynamic region vanished");
    let newpage = addr_to_pn(page_align_up(addr));
    if newpage > addr_to_pn(crate::param::USER_MEM_HIGH) {
        return Err(Errno::ENOMEM);
    }

    let end = area.borrow().end;
    if newpage > end {
        // Growing: the new pages must be free.
        if !map.is_range_empty(end, newpage - end) {
            return Err(Errno::ENOMEM);
        }
    } else if newpage < end {
        // Shrinking: drop the stale translations.
        p.pagedir.borrow_mut().unmap_range(newpage, end);
        tlb::flush_range(pn_to_addr(newpage), end - newpage);
    }
    area.borrow_mut().end = newpage;
    drop(map);

    p.brk.set(addr);
    Ok(addr)
}
