//! The file-descriptor and path syscall surface.
//!
//! Every operation takes or returns kernel buffers and returns `KResult`;
//! the syscall boundary turns errors into `-errno`. Each reference taken
//! here (`fget`, `dir_namev`, `open_namev`, `lookup`) is released on every
//! return path — the scope guards are what keep the error paths honest.

use alloc::rc::Rc;
use scopeguard::{guard, ScopeGuard};

use crate::drivers::DevId;
use crate::error::{Errno, KResult};
use crate::fs::file::{self, File, FileMode, Whence, O_CREAT};
use crate::fs::namev::{self, dir_namev, open_namev};
use crate::fs::path::Path;
use crate::fs::stat::Stat;
use crate::fs::vnode::{self, VnodeKind};
use crate::fs::Dirent;
use crate::kernel::KernelCtx;

/// Opens `path`, allocating the lowest free descriptor.
pub fn do_open(ctx: &KernelCtx<'_>, path: &Path, flags: u32) -> KResult<i32> {
    let mode = file::mode_from_flags(flags)?;
    let vn = open_namev(ctx, path, flags & O_CREAT != 0, None)?;
    let vn = guard(vn, |vn| vnode::vput(ctx, vn));

    if vn.kind().is_dir() && mode.intersects(FileMode::WRITE) {
        return Err(Errno::EISDIR);
    }
    if vn.kind() == VnodeKind::Chr {
        let devid = vn.ops().devid().expect("device vnode without device id");
        if ctx.kernel().bytedev_lookup(devid).is_none() {
            return Err(Errno::ENOENT);
        }
    }

    let p = ctx.curproc();
    let fd = p.get_empty_fd()?;
    let vn = ScopeGuard::into_inner(vn);
    p.fd_set(fd, Rc::new(File::new(mode, vn)));
    Ok(fd)
}

/// Reads from descriptor `fd` at its offset, advancing it by the bytes read.
pub fn do_read(ctx: &KernelCtx<'_>, fd: i32, buf: &mut [u8]) -> KResult<usize> {
    let f = file::fget(ctx, fd).ok_or(Errno::EBADF)?;
    let f = guard(f, |f| file::fput(ctx, f));
    if !f.mode().contains(FileMode::READ) {
        return Err(Errno::EBADF);
    }
    if f.vnode().kind().is_dir() {
        return Err(Errno::EISDIR);
    }
    let n = f.vnode().ops().read(ctx, f.vnode(), f.pos(), buf)?;
    f.set_pos(f.pos() + n);
    Ok(n)
}

/// Writes to descriptor `fd` at its offset — first seeking to the end in
/// append mode — advancing the offset by the bytes actually written.
pub fn do_write(ctx: &KernelCtx<'_>, fd: i32, buf: &[u8]) -> KResult<usize> {
    let f = file::fget(ctx, fd).ok_or(Errno::EBADF)?;
    let f = guard(f, |f| file::fput(ctx, f));
    if !f.mode().contains(FileMode::WRITE) {
        return Err(Errno::EBADF);
    }
    if f.mode().contains(FileMode::APPEND) {
        f.set_pos(f.vnode().len());
    }
    let n = f.vnode().ops().write(ctx, f.vnode(), f.pos(), buf)?;
    f.set_pos(f.pos() + n);
    Ok(n)
}

/// Closes descriptor `fd`.
pub fn do_close(ctx: &KernelCtx<'_>, fd: i32) -> KResult<()> {
    let f = ctx.curproc().fd_take(fd).ok_or(Errno::EBADF)?;
    file::fput(ctx, f);
    Ok(())
}

/// Duplicates `fd` onto the lowest free descriptor; both share one file
/// object (and one offset).
pub fn do_dup(ctx: &KernelCtx<'_>, fd: i32) -> KResult<i32> {
    let f = file::fget(ctx, fd).ok_or(Errno::EBADF)?;
    let p = ctx.curproc();
    match p.get_empty_fd() {
        Ok(nfd) => {
            p.fd_set(nfd, f);
            Ok(nfd)
        }
        Err(e) => {
            file::fput(ctx, f);
            Err(e)
        }
    }
}

/// Duplicates `ofd` onto `nfd`, closing `nfd` first if it is open and
/// distinct.
pub fn do_dup2(ctx: &KernelCtx<'_>, ofd: i32, nfd: i32) -> KResult<i32> {
    let f = file::fget(ctx, ofd).ok_or(Errno::EBADF)?;
    if nfd < 0 || nfd as usize >= crate::param::NFILES {
        file::fput(ctx, f);
        return Err(Errno::EBADF);
    }
    if nfd == ofd {
        file::fput(ctx, f);
        return Ok(nfd);
    }
    if let Some(old) = ctx.curproc().fd_take(nfd) {
        file::fput(ctx, old);
    }
    ctx.curproc().fd_set(nfd, f);
    Ok(nfd)
}

/// Creates a device special file.
pub fn do_mknod(ctx: &KernelCtx<'_>, path: &Path, kind: VnodeKind, devid: DevId) -> KResult<()> {
    if !kind.is_device() {
        return Err(Errno::EINVAL);
    }
    let (dir, name) = dir_namev(ctx, path, None)?;
    let dir = guard(dir, |dir| vnode::vput(ctx, dir));
    match namev::lookup(ctx, &*dir, name) {
        Ok(vn) => {
            vnode::vput(ctx, vn);
            Err(Errno::EEXIST)
        }
        Err(Errno::ENOENT) => dir.ops().mknod(ctx, &*dir, name, kind, devid),
        Err(e) => Err(e),
    }
}

/// Creates a directory.
pub fn do_mkdir(ctx: &KernelCtx<'_>, path: &Path) -> KResult<()> {
    let (dir, name) = dir_namev(ctx, path, None)?;
    let dir = guard(dir, |dir| vnode::vput(ctx, dir));
    match namev::lookup(ctx, &*dir, name) {
        Ok(vn) => {
            vnode::vput(ctx, vn);
            Err(Errno::EEXIST)
        }
        Err(Errno::ENOENT) => dir.ops().mkdir(ctx, &*dir, name),
        Err(e) => Err(e),
    }
}

/// Removes an empty directory.
pub fn do_rmdir(ctx: &KernelCtx<'_>, path: &Path) -> KResult<()> {
    let (dir, name) = dir_namev(ctx, path, None)?;
    let dir = guard(dir, |dir| vnode::vput(ctx, dir));
    if name.is_empty() || name.is_dot() {
        return Err(Errno::EINVAL);
    }
    if name.is_dotdot() {
        return Err(Errno::ENOTEMPTY);
    }
    dir.ops().rmdir(ctx, &*dir, name)
}

/// Removes a non-directory name.
pub fn do_unlink(ctx: &KernelCtx<'_>, path: &Path) -> KResult<()> {
    let (dir, name) = dir_namev(ctx, path, None)?;
    let dir = guard(dir, |dir| vnode::vput(ctx, dir));
    let vn = namev::lookup(ctx, &*dir, name)?;
    let vn = guard(vn, |vn| vnode::vput(ctx, vn));
    if vn.kind().is_dir() {
        return Err(Errno::EPERM);
    }
    dir.ops().unlink(ctx, &*dir, name)
}

/// Links `to` to the file at `from`.
pub fn do_link(ctx: &KernelCtx<'_>, from: &Path, to: &Path) -> KResult<()> {
    let src = open_namev(ctx, from, false, None)?;
    let src = guard(src, |src| vnode::vput(ctx, src));
    if src.kind().is_dir() {
        return Err(Errno::EPERM);
    }
    let (dir, name) = dir_namev(ctx, to, None)?;
    let dir = guard(dir, |dir| vnode::vput(ctx, dir));
    match namev::lookup(ctx, &*dir, name) {
        Ok(vn) => {
            vnode::vput(ctx, vn);
            Err(Errno::EEXIST)
        }
        Err(Errno::ENOENT) => dir.ops().link(ctx, &*src, &*dir, name),
        Err(e) => Err(e),
    }
}

/// Renames by linking the new name and unlinking the old; a failed link
/// leaves the old name in place.
pub fn do_rename(ctx: &KernelCtx<'_>, old: &Path, new: &Path) -> KResult<()> {
    do_link(ctx, old, new)?;
    do_unlink(ctx, old)
}

/// Changes the current working directory.
pub fn do_chdir(ctx: &KernelCtx<'_>, path: &Path) -> KResult<()> {
    let vn = open_namev(ctx, path, false, None)?;
    if !vn.kind().is_dir() {
        vnode::vput(ctx, vn);
        return Err(Errno::ENOTDIR);
    }
    let old = ctx.curproc().cwd.borrow_mut().replace(vn);
    if let Some(old) = old {
        vnode::vput(ctx, old);
    }
    Ok(())
}

/// Reads one directory entry at the descriptor's offset, advancing it by the
/// size of the on-disk record. `None` at end of directory.
pub fn do_getdent(ctx: &KernelCtx<'_>, fd: i32) -> KResult<Option<Dirent>> {
    let f = file::fget(ctx, fd).ok_or(Errno::EBADF)?;
    let f = guard(f, |f| file::fput(ctx, f));
    if !f.vnode().kind().is_dir() {
        return Err(Errno::ENOTDIR);
    }
    match f.vnode().ops().readdir(ctx, f.vnode(), f.pos())? {
        Some((dirent, consumed)) => {
            f.set_pos(f.pos() + consumed);
            Ok(Some(dirent))
        }
        None => Ok(None),
    }
}

/// Repositions the descriptor's offset.
pub fn do_lseek(ctx: &KernelCtx<'_>, fd: i32, offset: isize, whence: Whence) -> KResult<usize> {
    let f = file::fget(ctx, fd).ok_or(Errno::EBADF)?;
    let f = guard(f, |f| file::fput(ctx, f));
    let base = match whence {
        Whence::Set => 0,
        Whence::Cur => f.pos(),
        Whence::End => f.vnode().len(),
    };
    let pos = base as isize + offset;
    if pos < 0 {
        return Err(Errno::EINVAL);
    }
    f.set_pos(pos as usize);
    Ok(pos as usize)
}

/// Stats the file at `path`.
pub fn do_stat(ctx: &KernelCtx<'_>, path: &Path) -> KResult<Stat> {
    let vn = open_namev(ctx, path, false, None)?;
    let vn = guard(vn, |vn| vnode::vput(ctx, vn));
    vn.ops().stat(ctx, &*vn)
}
