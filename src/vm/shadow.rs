//! Shadow objects: the copy-on-write overlay.
//!
//! A shadow object holds the pages its mapping has privately written; every
//! other page is found by walking the `shadowed` chain down to the terminal
//! object. Both walks here are iterative — recursing down a long chain would
//! overflow a kernel stack.

use alloc::rc::Rc;

use crate::error::KResult;
use crate::kernel::{Kernel, KernelCtx};
use crate::vm::pframe::{self, Pframe};

use super::mmobj::{MmObj, MmObjId, MmObjKind, RcMmObj};

/// A fresh shadow over `shadowed`, with `bottom` caching the chain's terminal
/// object.
pub fn create(kernel: &Kernel, shadowed: RcMmObj, bottom: RcMmObj) -> RcMmObj {
    MmObj::new_shadow(kernel, shadowed, bottom)
}

/// The resident, settled (non-BUSY) frame for (`obj`, `pagenum`), if any.
/// Sleeping on a BUSY frame can race its eviction, so re-look it up.
fn resident_settled(
    ctx: &KernelCtx<'_>,
    obj: MmObjId,
    pagenum: usize,
) -> Option<Rc<Pframe>> {
    loop {
        let pf = pframe::get_resident(ctx, obj, pagenum)?;
        if !pf.is_busy() {
            return Some(pf);
        }
        pf.sleep_busy(ctx);
    }
}

/// For a write, the page must live in this shadow itself (allocating it runs
/// `fillpage` below, which performs the copy). For a read, return the first
/// resident copy down the chain, or the terminal object's page.
pub(crate) fn lookuppage(
    ctx: &KernelCtx<'_>,
    obj: &RcMmObj,
    pagenum: usize,
    forwrite: bool,
) -> KResult<Rc<Pframe>> {
    if forwrite {
        return pframe::get(ctx, obj, pagenum);
    }
    let mut o = obj.clone();
    loop {
        let next = match o.kind() {
            MmObjKind::Shadow { shadowed, .. } => {
                if let Some(pf) = resident_settled(ctx, o.id(), pagenum) {
                    return Ok(pf);
                }
                shadowed.clone()
            }
            _ => return pframe::get(ctx, &o, pagenum),
        };
        o = next;
    }
}

/// Copy-on-write: fill `pf` from the first object below `obj` that has the
/// page (a shadow with a resident copy, or the terminal object), and pin it.
pub(crate) fn fillpage(ctx: &KernelCtx<'_>, obj: &MmObj, pf: &Pframe) -> KResult<()> {
    debug_assert!(pf.is_busy());
    let mut o = match obj.kind() {
        MmObjKind::Shadow { shadowed, .. } => shadowed.clone(),
        _ => panic!("shadow fill on a non-shadow object"),
    };
    loop {
        let next = match o.kind() {
            MmObjKind::Shadow { shadowed, .. } => {
                if let Some(src) = resident_settled(ctx, o.id(), pf.pagenum()) {
                    pf.page().copy_from_page(src.page());
                    pf.pin();
                    return Ok(());
                }
                shadowed.clone()
            }
            _ => {
                pf.pin();
                let src = pframe::get(ctx, &o, pf.pagenum())?;
                pf.page().copy_from_page(src.page());
                return Ok(());
            }
        };
        o = next;
    }
}
