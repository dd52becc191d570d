//! Emulated user-memory access.
//!
//! Userland loads and stores go through the process's page directory exactly
//! as the MMU would: a missing or insufficient entry raises a fault, and the
//! fault handler either installs a mapping or kills the process. Copies then
//! go through the kernel address the installed entry points at, so a
//! copy-on-write break lands in the private frame, not the shared one.

use core::cmp;
use core::ptr;

use crate::addr::{addr_to_pn, page_offset};
use crate::kernel::KernelCtx;
use crate::param::PAGE_SIZE;
use crate::vm::pagedir::{Pte, PteFlags};
use crate::vm::pagefault::{handle_pagefault, FaultCause};

fn translate(ctx: &KernelCtx<'_>, addr: usize, forwrite: bool) -> Pte {
    let p = ctx.curproc();
    let vfn = addr_to_pn(addr);
    loop {
        let pte = p.pagedir.borrow().lookup(vfn);
        if let Some(pte) = pte {
            if !forwrite || pte.flags.contains(PteFlags::WRITE) {
                return pte;
            }
        }
        let cause = if forwrite {
            FaultCause::WRITE | FaultCause::USER
        } else {
            FaultCause::READ | FaultCause::USER
        };
        // Either installs a usable entry or never returns.
        handle_pagefault(ctx, addr, cause);
    }
}

/// Stores `buf` at user address `vaddr` of the current process. An invalid
/// access terminates the process, so a return is success.
pub fn copy_to_user(ctx: &KernelCtx<'_>, vaddr: usize, buf: &[u8]) {
    let mut done = 0;
    while done < buf.len() {
        let addr = vaddr + done;
        let pte = translate(ctx, addr, true);
        let off = page_offset(addr);
        let n = cmp::min(buf.len() - done, PAGE_SIZE - off);
        // SAFETY: the entry points into a live frame kept resident by the
        // mapping's object reference.
        unsafe { ptr::copy_nonoverlapping(buf[done..].as_ptr(), pte.addr.add(off), n) };
        done += n;
    }
}

/// Loads `buf.len()` bytes from user address `vaddr` of the current process.
pub fn copy_from_user(ctx: &KernelCtx<'_>, vaddr: usize, buf: &mut [u8]) {
    let mut done = 0;
    while done < buf.len() {
        let addr = vaddr + done;
        let pte = translate(ctx, addr, false);
        let off = page_offset(addr);
        let n = cmp::min(buf.len() - done, PAGE_SIZE - off);
        // SAFETY: as in `copy_to_user`.
        unsafe { ptr::copy_nonoverlapping(pte.addr.add(off), buf[done..].as_mut_ptr(), n) };
        done += n;
    }
}
