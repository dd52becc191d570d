//! Address-space maps.
//!
//! A `VmMap` is the ordered list of non-overlapping virtual memory areas of
//! one process. Areas carry page-number ranges, protection and mapping flags,
//! an owning reference to their backing memory object, and are additionally
//! linked (weakly) into the list their bottom object keeps of the areas above
//! it.

use core::cell::RefCell;
use core::cmp;

use alloc::rc::Rc;
use alloc::vec::Vec;

use crate::addr::{addr_to_pn, page_offset, user_pn_high, user_pn_low};
use crate::error::{Errno, KResult};
use crate::fs::vnode::Vnode;
use crate::kernel::KernelCtx;
use crate::param::PAGE_SIZE;
use crate::vm::mmobj::{self, MmObj, RcMmObj};
use crate::vm::pframe;
use crate::vm::shadow;

bitflags::bitflags! {
    /// Area protection; empty means PROT_NONE.
    pub struct Prot: u32 {
        const READ = 0x1;
        const WRITE = 0x2;
        const EXEC = 0x4;
    }
}

bitflags::bitflags! {
    pub struct MapFlags: u32 {
        const SHARED = 0x1;
        const PRIVATE = 0x2;
        const FIXED = 0x4;
        const ANON = 0x8;
    }
}

/// Gap search direction for `find_range`.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Dir {
    LoHi,
    HiLo,
}

pub struct VmArea {
    /// Half-open page-number range `[start, end)`.
    pub start: usize,
    pub end: usize,
    /// Page offset into the backing object.
    pub off: usize,
    pub prot: Prot,
    pub flags: MapFlags,
    pub(crate) obj: RcMmObj,
}

pub type VmAreaRef = Rc<RefCell<VmArea>>;

impl VmArea {
    pub fn obj(&self) -> &RcMmObj {
        &self.obj
    }

    pub fn npages(&self) -> usize {
        self.end - self.start
    }
}

pub struct VmMap {
    /// Ascending by `start`, pairwise disjoint.
    areas: Vec<VmAreaRef>,
}

impl VmMap {
    pub fn new() -> Self {
        Self { areas: Vec::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.areas.is_empty()
    }

    pub fn areas(&self) -> &[VmAreaRef] {
        &self.areas
    }

    /// Adds `area` in sorted position. The range must be unoccupied.
    pub fn insert(&mut self, area: VmAreaRef) {
        let start = area.borrow().start;
        debug_assert!(self.is_range_empty(start, area.borrow().npages()));
        let pos = self
            .areas
            .iter()
            .position(|a| start < a.borrow().start)
            .unwrap_or(self.areas.len());
        self.areas.insert(pos, area);
    }

    /// First-fit gap of `npages` pages inside the user range, scanning from
    /// the bottom (`LoHi`) or the top (`HiLo`) of the address space.
    pub fn find_range(&self, npages: usize, dir: Dir) -> Option<usize> {
        assert!(npages > 0);
        match dir {
            Dir::LoHi => {
                let mut low = user_pn_low();
                for a in &self.areas {
                    let a = a.borrow();
                    if a.start >= low && a.start - low >= npages {
                        return Some(low);
                    }
                    low = cmp::max(low, a.end);
                }
                if user_pn_high() - low >= npages {
                    return Some(low);
                }
                None
            }
            Dir::HiLo => {
                let mut high = user_pn_high();
                for a in self.areas.iter().rev() {
                    let a = a.borrow();
                    if a.end <= high && high - a.end >= npages {
                        return Some(high - npages);
                    }
                    high = cmp::min(high, a.start);
                }
                if high >= user_pn_low() && high - user_pn_low() >= npages {
                    return Some(high - npages);
                }
                None
            }
        }
    }

    /// The area covering page `vfn`, if any.
    pub fn lookup(&self, vfn: usize) -> Option<VmAreaRef> {
        self.areas
            .iter()
            .find(|a| {
                let a = a.borrow();
                a.start <= vfn && vfn < a.end
            })
            .cloned()
    }

    /// True iff no area overlaps `[startvfn, startvfn + npages)`.
    pub fn is_range_empty(&self, startvfn: usize, npages: usize) -> bool {
        let endvfn = startvfn + npages;
        !self.areas.iter().any(|a| {
            let a = a.borrow();
            a.start < endvfn && startvfn < a.end
        })
    }

    /// A field-for-field copy of this map for `fork`: every area is
    /// duplicated, every backing object reference count incremented, and the
    /// copies are linked into their bottom objects' area lists. Shadow setup
    /// for private areas is the caller's job.
    pub fn clone_map(&self) -> VmMap {
        let mut areas = Vec::with_capacity(self.areas.len());
        for a in &self.areas {
            let src = a.borrow();
            let copy = Rc::new(RefCell::new(VmArea {
                start: src.start,
                end: src.end,
                off: src.off,
                prot: src.prot,
                flags: src.flags,
                obj: src.obj.clone(),
            }));
            src.obj.bottom().vmas_insert(&copy);
            areas.push(copy);
        }
        VmMap { areas }
    }

    /// Inserts a mapping of `npages` pages.
    ///
    /// With `lopage == 0` a gap is chosen via `find_range(dir)`; otherwise
    /// anything already mapped in `[lopage, lopage + npages)` is unmapped
    /// first. A `file` mapping is backed by the object the vnode's `mmap`
    /// operation hands out — wrapped in a fresh shadow object when PRIVATE —
    /// and an anonymous mapping by a fresh zero-fill object.
    pub fn map(
        &mut self,
        ctx: &KernelCtx<'_>,
        file: Option<&Rc<Vnode>>,
        lopage: usize,
        npages: usize,
        prot: Prot,
        flags: MapFlags,
        off: usize,
        dir: Dir,
    ) -> KResult<VmAreaRef> {
        assert!(
            flags.contains(MapFlags::SHARED) != flags.contains(MapFlags::PRIVATE),
            "mapping must be SHARED xor PRIVATE"
        );
        assert!(npages > 0);
        let fixed = lopage != 0;
        let lopage = if fixed {
            lopage
        } else {
            self.find_range(npages, dir).ok_or(Errno::ENOMEM)?
        };

        let obj = match file {
            Some(vn) => {
                let fobj = vn.ops().mmap(ctx, vn)?;
                if flags.contains(MapFlags::PRIVATE) {
                    let bottom = fobj.clone();
                    shadow::create(ctx.kernel(), fobj, bottom)
                } else {
                    fobj
                }
            }
            None => MmObj::new_anon(ctx.kernel()),
        };

        let area = Rc::new(RefCell::new(VmArea {
            start: lopage,
            end: lopage + npages,
            off,
            prot,
            flags,
            obj: obj.clone(),
        }));
        obj.bottom().vmas_insert(&area);

        if fixed && !self.is_range_empty(lopage, npages) {
            self.remove(ctx, lopage, npages);
        }
        debug_assert!(self.is_range_empty(lopage, npages));
        self.insert(area.clone());
        log::trace!(
            "vmmap: mapped [{:#x}, {:#x}) prot {:?} flags {:?}",
            lopage * PAGE_SIZE,
            (lopage + npages) * PAGE_SIZE,
            prot,
            flags
        );
        Ok(area)
    }

    /// Unmaps `[lopage, lopage + npages)`. Overlapping areas are split,
    /// trimmed at either end, or released entirely.
    pub fn remove(&mut self, ctx: &KernelCtx<'_>, lopage: usize, npages: usize) {
        assert!(npages > 0);
        let hipage = lopage + npages;
        let mut splits = Vec::new();
        let mut dead = Vec::new();

        for area in &self.areas {
            let mut a = area.borrow_mut();
            if a.start < lopage {
                if hipage < a.end {
                    // Interior: split into two areas sharing the object.
                    let tail = Rc::new(RefCell::new(VmArea {
                        start: hipage,
                        end: a.end,
                        off: a.off + (hipage - a.start),
                        prot: a.prot,
                        flags: a.flags,
                        obj: a.obj.clone(),
                    }));
                    a.obj.bottom().vmas_insert(&tail);
                    a.end = lopage;
                    splits.push(tail);
                } else if lopage < a.end {
                    // Overlaps the tail: shorten.
                    a.end = lopage;
                }
            } else if a.start < hipage {
                if hipage < a.end {
                    // Overlaps the head: advance, shifting the object offset.
                    a.off += hipage - a.start;
                    a.start = hipage;
                } else {
                    // Enclosed: release below.
                    dead.push(area.clone());
                }
            }
        }

        self.areas
            .retain(|a| !dead.iter().any(|d| Rc::ptr_eq(a, d)));
        for area in dead {
            release_area(ctx, area);
        }
        for tail in splits {
            self.insert(tail);
        }
        debug_assert!(self.is_range_empty(lopage, npages));
    }

    /// Reads `buf.len()` bytes of this address space starting at `vaddr`.
    /// The range must be fully mapped; no permission checks are made.
    pub fn read(&self, ctx: &KernelCtx<'_>, vaddr: usize, buf: &mut [u8]) -> KResult<()> {
        let mut done = 0;
        while done < buf.len() {
            let addr = vaddr + done;
            let (obj, pagenum) = self.page_of(addr);
            let pf = pframe::lookup(ctx, &obj, pagenum, false)?;
            let off = page_offset(addr);
            let n = cmp::min(buf.len() - done, PAGE_SIZE - off);
            pf.page().copy_out(off, &mut buf[done..done + n]);
            done += n;
        }
        Ok(())
    }

    /// Writes `buf` into this address space at `vaddr`, dirtying each touched
    /// frame. The range must be fully mapped; no permission checks are made.
    pub fn write(&self, ctx: &KernelCtx<'_>, vaddr: usize, buf: &[u8]) -> KResult<()> {
        let mut done = 0;
        while done < buf.len() {
            let addr = vaddr + done;
            let (obj, pagenum) = self.page_of(addr);
            let pf = pframe::lookup(ctx, &obj, pagenum, true)?;
            pframe::dirty(ctx, &obj, &pf)?;
            let off = page_offset(addr);
            let n = cmp::min(buf.len() - done, PAGE_SIZE - off);
            pf.page().copy_in(off, &buf[done..done + n]);
            done += n;
        }
        Ok(())
    }

    fn page_of(&self, addr: usize) -> (RcMmObj, usize) {
        let pn = addr_to_pn(addr);
        let area = self.lookup(pn).expect("access to unmapped page");
        let a = area.borrow();
        (a.obj.clone(), pn - a.start + a.off)
    }

    /// Releases every area and its object reference.
    pub fn destroy(&mut self, ctx: &KernelCtx<'_>) {
        for area in self.areas.drain(..).collect::<Vec<_>>() {
            release_area(ctx, area);
        }
    }
}

/// Detaches a dying area from its bottom object's list and releases its
/// object reference.
fn release_area(ctx: &KernelCtx<'_>, area: VmAreaRef) {
    area.borrow().obj.bottom().vmas_remove(&area);
    match Rc::try_unwrap(area) {
        Ok(cell) => mmobj::put(ctx, cell.into_inner().obj),
        Err(_) => panic!("released area still referenced"),
    }
}
