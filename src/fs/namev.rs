//! Path resolution.

use alloc::rc::Rc;

use crate::error::{Errno, KResult};
use crate::fs::path::{FileName, Path};
use crate::fs::vnode::{self, Vnode};
use crate::kernel::KernelCtx;
use crate::param::MAXPATHLEN;

/// Resolves `name` in `dir`, which must be a directory. The empty name
/// resolves to `dir` itself (so a trailing slash is tolerated). On success
/// the result's reference count is incremented.
pub fn lookup(ctx: &KernelCtx<'_>, dir: &Rc<Vnode>, name: &FileName) -> KResult<Rc<Vnode>> {
    if !dir.kind().is_dir() {
        return Err(Errno::ENOTDIR);
    }
    if name.is_empty() {
        return Ok(dir.clone());
    }
    dir.ops().lookup(ctx, dir, name)
}

/// Resolves every component of `path` except the last, returning the parent
/// directory (reference count incremented) and the final component.
///
/// A leading `/` resets resolution to the filesystem root; otherwise it
/// starts from `base`, defaulting to the current process's working directory.
/// Consecutive slashes collapse; a path of only slashes yields the directory
/// itself and an empty name.
pub fn dir_namev<'p>(
    ctx: &KernelCtx<'_>,
    path: &'p Path,
    base: Option<&Rc<Vnode>>,
) -> KResult<(Rc<Vnode>, &'p FileName)> {
    if path.is_empty() {
        return Err(Errno::EINVAL);
    }
    if path.len() > MAXPATHLEN {
        return Err(Errno::ENAMETOOLONG);
    }
    let mut dir = if path.is_absolute() {
        ctx.kernel().root_vnode()
    } else {
        match base {
            Some(base) => base.clone(),
            None => ctx.curproc().cwd(),
        }
    };
    let mut rest = path;
    loop {
        let (next_rest, name) = match rest.skipelem() {
            Some(elem) => elem,
            None => {
                // Nothing but slashes: the "parent" is the directory itself.
                if !dir.kind().is_dir() {
                    vnode::vput(ctx, dir);
                    return Err(Errno::ENOTDIR);
                }
                return Ok((dir, FileName::new("")));
            }
        };
        if !name.fits() {
            vnode::vput(ctx, dir);
            return Err(Errno::ENAMETOOLONG);
        }
        if next_rest.is_empty() {
            return Ok((dir, name));
        }
        let next = lookup(ctx, &dir, name);
        vnode::vput(ctx, dir);
        dir = next?;
        rest = next_rest;
    }
}

/// Resolves `path` to a vnode (reference count incremented). When the final
/// component does not exist and `create` is set, it is created in the parent
/// directory; without `create` the miss is `ENOENT`.
pub fn open_namev(
    ctx: &KernelCtx<'_>,
    path: &Path,
    create: bool,
    base: Option<&Rc<Vnode>>,
) -> KResult<Rc<Vnode>> {
    let (dir, name) = dir_namev(ctx, path, base)?;
    let result = match lookup(ctx, &dir, name) {
        Ok(vn) => Ok(vn),
        Err(Errno::ENOENT) if create => dir.ops().create(ctx, &dir, name),
        Err(e) => Err(e),
    };
    vnode::vput(ctx, dir);
    result
}
