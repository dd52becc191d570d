//! fork: duplicate the current process under copy-on-write.

use alloc::rc::Rc;
use itertools::izip;

use crate::addr::{user_pn_high, user_pn_low};
use crate::error::KResult;
use crate::fs::vnode;
use crate::kernel::KernelCtx;
use crate::param::NFILES;
use crate::vm::shadow;
use crate::vm::tlb;
use crate::vm::vmmap::MapFlags;

use super::{kthread_create, proc_create, Pid, ThreadFn};

/// Creates a child process that is a copy of the current one: same name,
/// break boundaries, working directory and open files; a cloned address-space
/// map with fresh shadow objects on both sides of every private mapping, so
/// that post-fork writes in either process fault and copy.
///
/// The child's thread is fresh (this kernel's stand-in for entering userland
/// at the saved frame with a zero return value) and runs `child_main`.
/// Returns the child's pid to the parent.
pub fn do_fork(ctx: &KernelCtx<'_>, child_main: ThreadFn) -> KResult<Pid> {
    let parent = ctx.curproc();
    let name = parent.name();
    let child = proc_create(ctx, &name)?;
    log::debug!("fork: pid {} -> pid {}", parent.pid(), child.pid());

    child.start_brk.set(parent.start_brk.get());
    child.brk.set(parent.brk.get());

    // The child starts at the parent's working directory, not the root the
    // fresh process was given.
    let old = child.cwd.borrow_mut().replace(parent.cwd());
    if let Some(old) = old {
        vnode::vput(ctx, old);
    }

    // Clone the address space. Every backing object gets one more reference;
    // shadows come below.
    *child.vmmap.borrow_mut() = parent.vmmap.borrow().clone_map();

    // Share the open files.
    for fd in 0..NFILES as i32 {
        if let Some(f) = parent.fd_get(fd) {
            child.fd_set(fd, f);
        }
    }

    // Interpose a fresh shadow object on each side of every private mapping.
    {
        let pmap = parent.vmmap.borrow();
        let cmap = child.vmmap.borrow();
        for (pva, cva) in izip!(pmap.areas(), cmap.areas()) {
            if !pva.borrow().flags.contains(MapFlags::PRIVATE) {
                continue;
            }
            let orig = pva.borrow().obj().clone();
            let bottom = orig.bottom();
            debug_assert!(!bottom.is_shadow());
            let sp = shadow::create(ctx.kernel(), orig.clone(), bottom.clone());
            let sc = shadow::create(ctx.kernel(), orig, bottom);
            pva.borrow_mut().obj = sp;
            cva.borrow_mut().obj = sc;
        }
    }

    // From here on the parent must fault on every user page again so writes
    // go through the new shadows.
    parent
        .pagedir
        .borrow_mut()
        .unmap_range(user_pn_low(), user_pn_high());
    tlb::flush_all();

    let thr = kthread_create(ctx, &child, child_main);
    ctx.kernel().sched().make_runnable(&thr);
    Ok(child.pid())
}
