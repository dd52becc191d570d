//! The virtual filesystem: vnodes and their cache, path resolution, open
//! files, the syscall surface, and the on-disk filesystem (s5fs) beneath it.

use alloc::boxed::Box;
use arrayvec::ArrayVec;

use crate::error::KResult;
use crate::kernel::KernelCtx;
use crate::param::NAME_LEN;

pub mod file;
pub mod namev;
pub mod path;
pub mod s5fs;
pub mod stat;
pub mod vfs_syscall;
pub mod vnode;

use vnode::{VnodeKind, VnodeOps};

/// What a concrete filesystem provides to the vfs.
pub trait FsOps: 'static {
    fn fsid(&self) -> u64;

    fn root_ino(&self) -> u32;

    /// Reads inode `vno` and produces the vnode's kind, byte length, and
    /// operations. Called by `vget` on a cache miss.
    fn read_vnode(
        &self,
        ctx: &KernelCtx<'_>,
        vno: u32,
    ) -> KResult<(VnodeKind, usize, Box<dyn VnodeOps>)>;
}

/// A directory entry as surfaced by `readdir`/`getdent`.
#[derive(Clone, Debug)]
pub struct Dirent {
    pub ino: u32,
    name: ArrayVec<u8, { NAME_LEN + 1 }>,
}

impl Dirent {
    pub(crate) fn new(ino: u32, name: &[u8]) -> Dirent {
        let mut v = ArrayVec::new();
        v.try_extend_from_slice(name).expect("dirent name too long");
        Dirent { ino, name: v }
    }

    pub fn name(&self) -> &[u8] {
        &self.name
    }
}
