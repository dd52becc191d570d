//! Open-file objects and descriptor helpers.

use core::cell::Cell;

use alloc::rc::Rc;

use crate::error::{Errno, KResult};
use crate::fs::vnode::{self, Vnode};
use crate::kernel::KernelCtx;

/// `open(2)` flag bits.
pub const O_RDONLY: u32 = 0x000;
pub const O_WRONLY: u32 = 0x001;
pub const O_RDWR: u32 = 0x002;
pub const O_CREAT: u32 = 0x100;
pub const O_APPEND: u32 = 0x400;

bitflags::bitflags! {
    pub struct FileMode: u32 {
        const READ = 0x1;
        const WRITE = 0x2;
        const APPEND = 0x4;
    }
}

/// Translates open flags into a file mode; `EINVAL` on a bad access mode.
pub(crate) fn mode_from_flags(flags: u32) -> KResult<FileMode> {
    let mut mode = match flags & 0x3 {
        O_RDONLY => FileMode::READ,
        O_WRONLY => FileMode::WRITE,
        O_RDWR => FileMode::READ | FileMode::WRITE,
        _ => return Err(Errno::EINVAL),
    };
    if flags & O_APPEND != 0 {
        mode |= FileMode::APPEND;
    }
    Ok(mode)
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Whence {
    Set,
    Cur,
    End,
}

/// An open file: a mode, a seek offset, and an owning vnode reference.
/// Duplicated descriptors share one file object.
pub struct File {
    mode: FileMode,
    pos: Cell<usize>,
    vnode: Rc<Vnode>,
}

impl File {
    pub(crate) fn new(mode: FileMode, vnode: Rc<Vnode>) -> File {
        File {
            mode,
            pos: Cell::new(0),
            vnode,
        }
    }

    pub fn mode(&self) -> FileMode {
        self.mode
    }

    pub fn pos(&self) -> usize {
        self.pos.get()
    }

    pub(crate) fn set_pos(&self, pos: usize) {
        self.pos.set(pos);
    }

    pub fn vnode(&self) -> &Rc<Vnode> {
        &self.vnode
    }
}

/// The file open on descriptor `fd` of the current process, its reference
/// count incremented. Pair with `fput`.
pub fn fget(ctx: &KernelCtx<'_>, fd: i32) -> Option<Rc<File>> {
    ctx.curproc().fd_get(fd)
}

/// Releases one file reference; the last one releases the vnode.
pub fn fput(ctx: &KernelCtx<'_>, f: Rc<File>) {
    if Rc::strong_count(&f) == 1 {
        match Rc::try_unwrap(f) {
            Ok(file) => vnode::vput(ctx, file.vnode),
            Err(_) => unreachable!(),
        }
    }
}
