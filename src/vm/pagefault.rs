//! The user page-fault handler.

use crate::addr::addr_to_pn;
use crate::error::Errno;
use crate::kernel::KernelCtx;
use crate::proc;
use crate::vm::pagedir::PteFlags;
use crate::vm::pframe;
use crate::vm::vmmap::Prot;

bitflags::bitflags! {
    pub struct FaultCause: u32 {
        const READ = 0x1;
        const WRITE = 0x2;
        const EXEC = 0x4;
        const USER = 0x8;
    }
}

/// Handles a user fault at `vaddr`.
///
/// A fault outside any mapping, or one the mapping's protection does not
/// allow, terminates the process with an `EFAULT` status (no signals here).
/// Otherwise the page is produced through the area's memory object — which is
/// where shadow copy-on-write happens — and installed in the page table,
/// writable only when the fault was a write so that later writes through
/// read-shared pages fault again.
pub fn handle_pagefault(ctx: &KernelCtx<'_>, vaddr: usize, cause: FaultCause) {
    assert!(cause.contains(FaultCause::USER), "kernel fault at {:#x}", vaddr);
    let p = ctx.curproc();
    log::trace!(
        "pagefault: pid {} vaddr {:#x} cause {:?}",
        p.pid(),
        vaddr,
        cause
    );

    let pn = addr_to_pn(vaddr);
    let looked = p.vmmap.borrow().lookup(pn);
    let area = match looked {
        Some(area) => area,
        None => {
            log::debug!("pagefault: pid {} segfault (unmapped {:#x})", p.pid(), vaddr);
            proc::proc_kill(ctx, &p, Errno::EFAULT as i32);
            return;
        }
    };
    let (obj, pagenum, prot) = {
        let a = area.borrow();
        (a.obj.clone(), pn - a.start + a.off, a.prot)
    };
    drop(area);

    if prot.is_empty()
        || (cause.contains(FaultCause::WRITE) && !prot.contains(Prot::WRITE))
        || (cause.contains(FaultCause::EXEC) && !prot.contains(Prot::EXEC))
    {
        log::debug!("pagefault: pid {} segfault (protection {:#x})", p.pid(), vaddr);
        proc::proc_kill(ctx, &p, Errno::EFAULT as i32);
        return;
    }

    let forwrite = cause.contains(FaultCause::WRITE);
    let pf = match pframe::lookup(ctx, &obj, pagenum, forwrite) {
        Ok(pf) => pf,
        Err(_) => {
            proc::proc_kill(ctx, &p, Errno::EFAULT as i32);
            return;
        }
    };
    if forwrite {
        if pframe::dirty(ctx, &obj, &pf).is_err() {
            proc::proc_kill(ctx, &p, Errno::EFAULT as i32);
            return;
        }
    }

    let mut flags = PteFlags::PRESENT | PteFlags::USER;
    if forwrite {
        flags |= PteFlags::WRITE;
    }
    let addr = pf.page().addr();
    if p.pagedir
        .borrow_mut()
        .map_page(pn, addr, flags)
        .is_err()
    {
        proc::proc_kill(ctx, &p, Errno::ENOMEM as i32);
    }
}
