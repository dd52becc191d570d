//! TLB maintenance contract.
//!
//! The emulated walk reads the page directory on every access, so there is no
//! translation cache to invalidate; the entry points exist so the paths that
//! must flush on real hardware (fork, brk shrink, munmap) keep doing so.

pub fn flush(_vaddr: usize) {}

pub fn flush_range(_vaddr: usize, _npages: usize) {}

pub fn flush_all() {}
