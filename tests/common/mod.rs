#![allow(dead_code)]

//! Shared setup for the integration suite: a freshly formatted ramdisk and a
//! kernel booted over it with the test body as init.

use std::rc::Rc;

use wren_kernel::drivers::ramdisk::MemDisk;
use wren_kernel::fs::s5fs;
use wren_kernel::kernel::{self, KernelCtx};

pub const DISK_BLOCKS: usize = 256;

pub fn newdisk() -> Rc<MemDisk> {
    let disk = Rc::new(MemDisk::new(DISK_BLOCKS));
    s5fs::format(&*disk).expect("format failed");
    disk
}

/// Boots a kernel on a fresh disk, runs `init_main` as init, and returns its
/// exit status.
pub fn boot<F>(init_main: F) -> i32
where
    F: FnOnce(&KernelCtx<'_>) -> i32 + 'static,
{
    kernel::boot(newdisk(), Box::new(init_main))
}
