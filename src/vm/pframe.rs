//! The page-frame cache.
//!
//! A frame is identified by `(memory object, page index)`. Lookup is
//! find-or-create: a created frame is marked BUSY while its object's
//! `fillpage` runs, and concurrent lookups sleep on the frame's wait channel
//! until the fill completes. Frames reference their object by identifier only
//! and are owned by the cache; objects evict their frames when they die.

use core::cell::{Cell, RefCell};

use alloc::collections::BTreeMap;
use alloc::rc::Rc;
use alloc::vec::Vec;

use crate::error::KResult;
use crate::kernel::KernelCtx;
use crate::page::Page;
use crate::proc::WaitChannel;

use super::mmobj::{MmObj, MmObjId, RcMmObj};

bitflags::bitflags! {
    pub struct PfFlags: u8 {
        const BUSY = 0x1;
        const DIRTY = 0x2;
    }
}

pub struct Pframe {
    obj: MmObjId,
    pagenum: usize,
    page: Page,
    flags: Cell<PfFlags>,
    pincount: Cell<u32>,
    waitq: WaitChannel,
}

impl Pframe {
    fn new(obj: MmObjId, pagenum: usize) -> Pframe {
        Pframe {
            obj,
            pagenum,
            page: Page::new(),
            flags: Cell::new(PfFlags::BUSY),
            pincount: Cell::new(0),
            waitq: WaitChannel::new(),
        }
    }

    pub fn pagenum(&self) -> usize {
        self.pagenum
    }

    pub fn page(&self) -> &Page {
        &self.page
    }

    pub fn is_busy(&self) -> bool {
        self.flags.get().contains(PfFlags::BUSY)
    }

    pub fn is_dirty(&self) -> bool {
        self.flags.get().contains(PfFlags::DIRTY)
    }

    fn set_flag(&self, flag: PfFlags, on: bool) {
        let mut f = self.flags.get();
        f.set(flag, on);
        self.flags.set(f);
    }

    pub fn is_pinned(&self) -> bool {
        self.pincount.get() > 0
    }

    /// Pins the frame in memory (a pin count, so pins nest).
    pub fn pin(&self) {
        self.pincount.set(self.pincount.get() + 1);
    }

    pub fn unpin(&self) {
        let n = self.pincount.get();
        assert!(n > 0, "unpin of unpinned frame");
        self.pincount.set(n - 1);
    }

    /// Sleeps until whoever holds this frame BUSY broadcasts. The caller must
    /// re-look the frame up afterwards; it may have been evicted.
    pub(crate) fn sleep_busy(&self, ctx: &KernelCtx<'_>) {
        self.waitq.sleep(ctx);
    }
}

pub struct PframeCache {
    frames: RefCell<BTreeMap<(MmObjId, usize), Rc<Pframe>>>,
}

impl PframeCache {
    pub(crate) fn new() -> Self {
        Self {
            frames: RefCell::new(BTreeMap::new()),
        }
    }

    pub fn nframes(&self) -> usize {
        self.frames.borrow().len()
    }

    fn find(&self, obj: MmObjId, pagenum: usize) -> Option<Rc<Pframe>> {
        self.frames.borrow().get(&(obj, pagenum)).cloned()
    }

    fn keys_of(&self, obj: MmObjId) -> Vec<(MmObjId, usize)> {
        self.frames
            .borrow()
            .range((obj, 0)..=(obj, usize::MAX))
            .map(|(k, _)| *k)
            .collect()
    }
}

/// Finds the frame for (`obj`, `pagenum`), creating and filling it if it is
/// not resident. Sleeps while another thread holds the frame BUSY.
pub fn get(ctx: &KernelCtx<'_>, obj: &RcMmObj, pagenum: usize) -> KResult<Rc<Pframe>> {
    let cache = ctx.kernel().pframes();
    loop {
        if let Some(pf) = cache.find(obj.id(), pagenum) {
            if pf.is_busy() {
                pf.waitq.sleep(ctx);
                continue;
            }
            return Ok(pf);
        }
        let pf = Rc::new(Pframe::new(obj.id(), pagenum));
        let prev = cache
            .frames
            .borrow_mut()
            .insert((obj.id(), pagenum), pf.clone());
        debug_assert!(prev.is_none());
        obj.respages_inc();
        let filled = obj.fillpage(ctx, &pf);
        pf.set_flag(PfFlags::BUSY, false);
        pf.waitq.wakeup_all(ctx.kernel());
        match filled {
            Ok(()) => return Ok(pf),
            Err(e) => {
                let _ = cache.frames.borrow_mut().remove(&(obj.id(), pagenum));
                obj.respages_dec();
                return Err(e);
            }
        }
    }
}

/// The resident frame for (`obj`, `pagenum`), if any — possibly BUSY.
pub fn get_resident(ctx: &KernelCtx<'_>, obj: MmObjId, pagenum: usize) -> Option<Rc<Pframe>> {
    ctx.kernel().pframes().find(obj, pagenum)
}

/// Looks the page up through the object (`lookuppage`), which is where
/// shadow-chain copy-on-write resolution happens.
pub fn lookup(
    ctx: &KernelCtx<'_>,
    obj: &RcMmObj,
    pagenum: usize,
    forwrite: bool,
) -> KResult<Rc<Pframe>> {
    obj.lookuppage(ctx, pagenum, forwrite)
}

/// Marks the frame dirty, first telling the object so it can make the page
/// cleanable (a file object allocates the backing block here).
pub fn dirty(ctx: &KernelCtx<'_>, obj: &MmObj, pf: &Pframe) -> KResult<()> {
    debug_assert_eq!(obj.id(), pf.obj);
    obj.dirtypage(ctx, pf)?;
    pf.set_flag(PfFlags::DIRTY, true);
    Ok(())
}

/// Evicts every resident frame of `obj`, writing dirty frames back through
/// `cleanpage` when `sync` is set and discarding them otherwise.
pub(crate) fn evict_obj(ctx: &KernelCtx<'_>, obj: &MmObj, sync: bool) -> KResult<()> {
    let cache = ctx.kernel().pframes();
    for key in cache.keys_of(obj.id()) {
        let pf = cache.find(key.0, key.1).expect("evicting vanished frame");
        assert!(!pf.is_busy(), "evicting busy frame");
        if sync && pf.is_dirty() {
            obj.cleanpage(ctx, &pf)?;
            pf.set_flag(PfFlags::DIRTY, false);
        }
        while pf.is_pinned() {
            pf.unpin();
        }
        let _ = cache.frames.borrow_mut().remove(&key);
        obj.respages_dec();
    }
    Ok(())
}
