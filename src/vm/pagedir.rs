//! Per-process page directories.
//!
//! The hardware walk is emulated: a page directory maps virtual frame numbers
//! to the kernel address of the backing frame plus protection bits, and every
//! emulated user access consults it. The fault handler installs entries; fork,
//! brk and munmap remove them so later accesses fault again.

use alloc::collections::BTreeMap;

use crate::error::KResult;

bitflags::bitflags! {
    pub struct PteFlags: u32 {
        const PRESENT = 0x1;
        const WRITE = 0x2;
        const USER = 0x4;
    }
}

#[derive(Copy, Clone)]
pub struct Pte {
    pub addr: *mut u8,
    pub flags: PteFlags,
}

pub struct PageDir {
    entries: BTreeMap<usize, Pte>,
}

impl PageDir {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Installs (or replaces) the entry for `vfn`. The `KResult` is the
    /// contract of the real page-table walk, which can fail allocating
    /// intermediate tables.
    pub fn map_page(&mut self, vfn: usize, addr: *mut u8, flags: PteFlags) -> KResult<()> {
        let _ = self.entries.insert(vfn, Pte { addr, flags });
        Ok(())
    }

    pub fn lookup(&self, vfn: usize) -> Option<Pte> {
        self.entries.get(&vfn).copied()
    }

    /// Removes all entries in `[lo, hi)` (virtual frame numbers).
    pub fn unmap_range(&mut self, lo: usize, hi: usize) {
        let gone: alloc::vec::Vec<usize> =
            self.entries.range(lo..hi).map(|(vfn, _)| *vfn).collect();
        for vfn in gone {
            let _ = self.entries.remove(&vfn);
        }
    }

    pub(crate) fn destroy(&mut self) {
        self.entries.clear();
    }
}
