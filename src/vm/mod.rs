//! Virtual memory: address-space maps, memory objects, the page-frame cache,
//! and the fault/brk/mmap policy layer on top of them.

pub mod brk;
pub mod mmap;
pub mod mmobj;
pub mod pagedir;
pub mod pagefault;
pub mod pframe;
pub mod shadow;
pub mod tlb;
pub mod usermem;
pub mod vmmap;
