//! Memory objects: abstract sources of pages.
//!
//! Every mapping is backed by an object; the variants share a header (id,
//! resident-page count) and differ in how pages are produced. Anonymous
//! objects zero-fill, vnode objects read and write the file they cache,
//! block-device objects go straight to the device, and shadow objects overlay
//! privately-written pages over a chain ending at a terminal ("bottom")
//! object.
//!
//! Lifetimes: references are `Rc` clones released through [`put`], which
//! tears an object down once only internal references remain. A vnode and its
//! built-in object reference each other; that cycle is broken by the vnode
//! cache when the pair is otherwise unreferenced (see `fs::vnode`).

use core::cell::{Cell, RefCell};

use alloc::rc::{Rc, Weak};
use alloc::vec::Vec;

use crate::drivers::BlockDev;
use crate::error::KResult;
use crate::fs::vnode::{self, Vnode};
use crate::kernel::{Kernel, KernelCtx};
use crate::vm::pframe::{self, Pframe};
use crate::vm::shadow;
use crate::vm::vmmap::VmAreaRef;

/// Key identifying an object in the page-frame cache.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct MmObjId(u64);

impl MmObjId {
    pub(crate) fn new(raw: u64) -> Self {
        MmObjId(raw)
    }
}

pub type RcMmObj = Rc<MmObj>;

type VmasList = RefCell<Vec<Weak<RefCell<crate::vm::vmmap::VmArea>>>>;

pub struct MmObj {
    id: MmObjId,
    respages: Cell<usize>,
    kind: MmObjKind,
}

pub(crate) enum MmObjKind {
    /// Zero-fill pages, pinned while resident.
    Anon { vmas: VmasList },
    /// Pages of a file, filled and cleaned through the vnode's operations.
    Vnode {
        vnode: RefCell<Option<Rc<Vnode>>>,
        vmas: VmasList,
    },
    /// Pages of a block device (the metadata cache of a filesystem).
    BlockDev {
        dev: Rc<dyn BlockDev>,
        vmas: VmasList,
    },
    /// Copy-on-write overlay.
    Shadow {
        shadowed: RcMmObj,
        /// Cached terminal object of the chain.
        bottom: RcMmObj,
    },
}

impl MmObj {
    fn alloc(kernel: &Kernel, kind: MmObjKind) -> RcMmObj {
        Rc::new(MmObj {
            id: kernel.alloc_mmobj_id(),
            respages: Cell::new(0),
            kind,
        })
    }

    /// A fresh anonymous object.
    pub fn new_anon(kernel: &Kernel) -> RcMmObj {
        Self::alloc(
            kernel,
            MmObjKind::Anon {
                vmas: RefCell::new(Vec::new()),
            },
        )
    }

    pub(crate) fn new_vnode(kernel: &Kernel, vnode: Rc<Vnode>) -> RcMmObj {
        Self::alloc(
            kernel,
            MmObjKind::Vnode {
                vnode: RefCell::new(Some(vnode)),
                vmas: RefCell::new(Vec::new()),
            },
        )
    }

    pub(crate) fn new_blockdev(kernel: &Kernel, dev: Rc<dyn BlockDev>) -> RcMmObj {
        Self::alloc(
            kernel,
            MmObjKind::BlockDev {
                dev,
                vmas: RefCell::new(Vec::new()),
            },
        )
    }

    pub(crate) fn new_shadow(kernel: &Kernel, shadowed: RcMmObj, bottom: RcMmObj) -> RcMmObj {
        debug_assert!(!bottom.is_shadow());
        Self::alloc(kernel, MmObjKind::Shadow { shadowed, bottom })
    }

    pub fn id(&self) -> MmObjId {
        self.id
    }

    pub(crate) fn kind(&self) -> &MmObjKind {
        &self.kind
    }

    pub fn is_shadow(&self) -> bool {
        matches!(self.kind, MmObjKind::Shadow { .. })
    }

    pub fn respages(&self) -> usize {
        self.respages.get()
    }

    pub(crate) fn respages_inc(&self) {
        self.respages.set(self.respages.get() + 1);
    }

    pub(crate) fn respages_dec(&self) {
        self.respages.set(self.respages.get() - 1);
    }

    /// The terminal object: self for bottom objects, the cached bottom for
    /// shadows.
    pub fn bottom(self: &Rc<Self>) -> RcMmObj {
        match &self.kind {
            MmObjKind::Shadow { bottom, .. } => bottom.clone(),
            _ => self.clone(),
        }
    }

    fn vmas(&self) -> &VmasList {
        match &self.kind {
            MmObjKind::Anon { vmas }
            | MmObjKind::Vnode { vmas, .. }
            | MmObjKind::BlockDev { vmas, .. } => vmas,
            MmObjKind::Shadow { .. } => panic!("vma list on a shadow object"),
        }
    }

    /// Links `area` into the list of areas sharing this bottom object.
    pub(crate) fn vmas_insert(&self, area: &VmAreaRef) {
        self.vmas().borrow_mut().push(Rc::downgrade(area));
    }

    pub(crate) fn vmas_remove(&self, area: &VmAreaRef) {
        let target = Rc::downgrade(area);
        self.vmas()
            .borrow_mut()
            .retain(|w| !Weak::ptr_eq(w, &target));
    }

    /// Resolves the frame to use for page `pagenum` of a mapping backed by
    /// this object. For shadows this is where do-not-copy-on-not-write (and,
    /// through `fillpage`, copy-on-write) happens.
    pub fn lookuppage(
        self: &Rc<Self>,
        ctx: &KernelCtx<'_>,
        pagenum: usize,
        forwrite: bool,
    ) -> KResult<Rc<Pframe>> {
        match &self.kind {
            MmObjKind::Shadow { .. } => shadow::lookuppage(ctx, self, pagenum, forwrite),
            _ => pframe::get(ctx, self, pagenum),
        }
    }

    /// Fills a freshly-allocated BUSY frame of this object.
    pub(crate) fn fillpage(&self, ctx: &KernelCtx<'_>, pf: &Pframe) -> KResult<()> {
        debug_assert!(pf.is_busy());
        match &self.kind {
            MmObjKind::Anon { .. } => {
                pf.page().zero();
                pf.pin();
                Ok(())
            }
            MmObjKind::Vnode { vnode, .. } => {
                let vn = vnode.borrow().clone().expect("fill on dead vnode object");
                vn.ops().fillpage(ctx, &vn, pf)
            }
            MmObjKind::BlockDev { dev, .. } => dev.read_into_page(pf.pagenum() as u32, pf.page()),
            MmObjKind::Shadow { .. } => shadow::fillpage(ctx, self, pf),
        }
    }

    /// Prepares a page to be dirtied (file objects allocate backing here).
    pub(crate) fn dirtypage(&self, ctx: &KernelCtx<'_>, pf: &Pframe) -> KResult<()> {
        match &self.kind {
            MmObjKind::Vnode { vnode, .. } => {
                let vn = vnode.borrow().clone().expect("dirty on dead vnode object");
                vn.ops().dirtypage(ctx, &vn, pf)
            }
            _ => Ok(()),
        }
    }

    /// Writes a dirty page back to its backing store. No-op for anonymous and
    /// shadow objects, whose pages are purely in-memory.
    pub(crate) fn cleanpage(&self, ctx: &KernelCtx<'_>, pf: &Pframe) -> KResult<()> {
        match &self.kind {
            MmObjKind::Vnode { vnode, .. } => {
                let vn = vnode.borrow().clone().expect("clean on dead vnode object");
                vn.ops().cleanpage(ctx, &vn, pf)
            }
            MmObjKind::BlockDev { dev, .. } => dev.write_from_page(pf.pagenum() as u32, pf.page()),
            MmObjKind::Anon { .. } | MmObjKind::Shadow { .. } => Ok(()),
        }
    }

    pub(crate) fn vnode_backref(&self) -> Option<Rc<Vnode>> {
        match &self.kind {
            MmObjKind::Vnode { vnode, .. } => vnode.borrow().clone(),
            _ => None,
        }
    }

    pub(crate) fn clear_vnode_backref(&self) {
        match &self.kind {
            MmObjKind::Vnode { vnode, .. } => *vnode.borrow_mut() = None,
            _ => panic!("not a vnode object"),
        }
    }
}

impl Drop for MmObj {
    fn drop(&mut self) {
        debug_assert_eq!(self.respages.get(), 0, "object dropped with resident pages");
    }
}

/// Releases one reference to `obj`.
///
/// References to a vnode's built-in object stand for references to the vnode,
/// so they are funneled into `vput`. Any other object whose last reference
/// this was is torn down: its frames are evicted (written back only where a
/// backing store exists) and, for shadows, the release walks down the chain
/// iteratively — a recursive walk would overflow a kernel stack on a long
/// chain.
pub fn put(ctx: &KernelCtx<'_>, obj: RcMmObj) {
    let mut cur = obj;
    loop {
        if let MmObjKind::Vnode { .. } = cur.kind {
            let vn = cur.vnode_backref().expect("released a dead vnode object");
            drop(cur);
            vnode::vput(ctx, vn);
            return;
        }
        if Rc::strong_count(&cur) > 1 {
            return;
        }
        let below = match &cur.kind {
            MmObjKind::Anon { .. } => {
                pframe::evict_obj(ctx, &cur, false).expect("anon eviction cannot fail");
                None
            }
            MmObjKind::BlockDev { .. } => {
                pframe::evict_obj(ctx, &cur, true).expect("device writeback failed");
                None
            }
            MmObjKind::Shadow { shadowed, .. } => {
                pframe::evict_obj(ctx, &cur, false).expect("shadow eviction cannot fail");
                Some(shadowed.clone())
            }
            MmObjKind::Vnode { .. } => unreachable!(),
        };
        match below {
            Some(below) => {
                // Freeing the shadow drops its chain and cached-bottom
                // references; continue with the object underneath.
                drop(cur);
                cur = below;
            }
            None => return,
        }
    }
}
