//! s5fs vnode operations.
//!
//! An `S5Node` is the in-core copy of one inode plus the filesystem
//! back-pointer; it implements the vnode operations for every inode type,
//! delegating chr-device I/O to the byte-device registry. Directory and file
//! helpers assert the vnode mutex where multi-step metadata updates need it.

use core::any::Any;
use core::cell::{Cell, RefCell};
use core::cmp;

use alloc::rc::Rc;
use zerocopy::{AsBytes, FromBytes};

use crate::drivers::DevId;
use crate::error::{Errno, KResult};
use crate::fs::path::FileName;
use crate::fs::stat::Stat;
use crate::fs::vnode::{self, Vnode, VnodeKind, VnodeOps};
use crate::fs::Dirent;
use crate::kernel::KernelCtx;
use crate::param::BLOCK_SIZE;
use crate::vm::mmobj::RcMmObj;
use crate::vm::pframe::{self, Pframe};

use super::{
    S5Dirent, S5Inode, S5fs, S5_DIRENT_SIZE, S5_MAX_BLOCKS, S5_NDIRECT, S5_TYPE_BLK,
    S5_TYPE_CHR, S5_TYPE_DATA, S5_TYPE_DIR,
};

pub(crate) struct S5Node {
    fs: Rc<S5fs>,
    vno: u32,
    inode: RefCell<S5Inode>,
    /// In-core inode differs from the table record.
    dirty: Cell<bool>,
}

/// The s5fs node behind a vnode this filesystem produced.
fn s5node(vn: &Vnode) -> &S5Node {
    vn.ops()
        .as_any()
        .downcast_ref::<S5Node>()
        .expect("foreign vnode handed to s5fs")
}

impl S5Node {
    pub(crate) fn new(fs: Rc<S5fs>, vno: u32, inode: S5Inode) -> S5Node {
        S5Node {
            fs,
            vno,
            inode: RefCell::new(inode),
            dirty: Cell::new(false),
        }
    }

    fn typ(&self) -> u16 {
        self.inode.borrow().typ
    }

    fn size(&self) -> usize {
        self.inode.borrow().size as usize
    }

    fn mark_dirty(&self) {
        self.dirty.set(true);
    }

    /// The byte device behind a chr inode.
    fn bytedev(&self, ctx: &KernelCtx<'_>) -> KResult<Rc<dyn crate::drivers::ByteDev>> {
        let devid = DevId::from_raw(self.inode.borrow().indirect);
        ctx.kernel().bytedev_lookup(devid).ok_or(Errno::ENOENT)
    }

    /// Disk block backing file position `seekptr`, or 0 for a hole. With
    /// `alloc` set, a hole (and a missing indirect block) is allocated and
    /// the owning slot dirtied.
    fn seek_to_block(&self, ctx: &KernelCtx<'_>, seekptr: usize, alloc: bool) -> KResult<u32> {
        let index = seekptr / BLOCK_SIZE;
        if index >= S5_MAX_BLOCKS {
            return Err(Errno::EFBIG);
        }
        if index < S5_NDIRECT {
            let blockno = self.inode.borrow().direct[index];
            if blockno != 0 || !alloc {
                return Ok(blockno);
            }
            let blockno = self.fs.alloc_block(ctx)?;
            self.inode.borrow_mut().direct[index] = blockno;
            self.mark_dirty();
            return Ok(blockno);
        }

        let index = index - S5_NDIRECT;
        let mut indirect = self.inode.borrow().indirect;
        if indirect == 0 {
            if !alloc {
                return Ok(0);
            }
            // A fresh indirect block must read as all holes.
            indirect = self.fs.alloc_block(ctx)?;
            let pf = pframe::get(ctx, self.fs.obj(), indirect as usize)?;
            pf.page().zero();
            pframe::dirty(ctx, self.fs.obj(), &pf)?;
            self.inode.borrow_mut().indirect = indirect;
            self.mark_dirty();
        }
        let pf = pframe::get(ctx, self.fs.obj(), indirect as usize)?;
        let blockno = pf.page().read_u32(index);
        if blockno != 0 || !alloc {
            return Ok(blockno);
        }
        let blockno = self.fs.alloc_block(ctx)?;
        pf.page().write_u32(index, blockno);
        pframe::dirty(ctx, self.fs.obj(), &pf)?;
        Ok(blockno)
    }

    /// Reads through the vnode's resident pages, stopping at end of file.
    fn read_file(
        &self,
        ctx: &KernelCtx<'_>,
        vn: &Rc<Vnode>,
        seek: usize,
        buf: &mut [u8],
    ) -> KResult<usize> {
        let size = self.size();
        if seek >= size {
            return Ok(0);
        }
        let n = cmp::min(buf.len(), size - seek);
        let obj = vn.mmobj();
        let mut done = 0;
        while done < n {
            let pos = seek + done;
            let pf = pframe::get(ctx, &obj, pos / BLOCK_SIZE)?;
            let offset = pos % BLOCK_SIZE;
            let cnt = cmp::min(n - done, BLOCK_SIZE - offset);
            pf.page().copy_out(offset, &mut buf[done..done + cnt]);
            done += cnt;
        }
        Ok(n)
    }

    /// Writes through the vnode's resident pages, pinning and dirtying each
    /// touched frame, extending the file when the write runs past its end.
    /// Intervening unwritten bytes read as zeros (sparse pages fill as
    /// zeros). Reports a short count when space runs out mid-write.
    fn write_file(
        &self,
        ctx: &KernelCtx<'_>,
        vn: &Rc<Vnode>,
        seek: usize,
        buf: &[u8],
    ) -> KResult<usize> {
        let obj = vn.mmobj();
        let mut done = 0;
        while done < buf.len() {
            let pos = seek + done;
            let pf = match pframe::get(ctx, &obj, pos / BLOCK_SIZE) {
                Ok(pf) => pf,
                Err(e) if done > 0 => {
                    log::debug!("s5fs: short write ({})", e);
                    break;
                }
                Err(e) => return Err(e),
            };
            pf.pin();
            if let Err(e) = pframe::dirty(ctx, &obj, &pf) {
                pf.unpin();
                if done > 0 {
                    log::debug!("s5fs: short write ({})", e);
                    break;
                }
                return Err(e);
            }
            let offset = pos % BLOCK_SIZE;
            let cnt = cmp::min(buf.len() - done, BLOCK_SIZE - offset);
            pf.page().copy_in(offset, &buf[done..done + cnt]);
            pf.unpin();
            done += cnt;
        }

        let newsize = seek + done;
        if done > 0 && newsize > self.size() {
            debug_assert_eq!(vn.len(), self.size());
            self.inode.borrow_mut().size = newsize as u32;
            vn.set_len(newsize);
            self.mark_dirty();
        }
        Ok(done)
    }

    fn read_dirent(
        &self,
        ctx: &KernelCtx<'_>,
        vn: &Rc<Vnode>,
        off: usize,
    ) -> KResult<S5Dirent> {
        let mut d = S5Dirent::default();
        let n = self.read_file(ctx, vn, off, d.as_bytes_mut())?;
        assert_eq!(n, S5_DIRENT_SIZE, "torn directory entry");
        Ok(d)
    }

    fn write_dirent(
        &self,
        ctx: &KernelCtx<'_>,
        vn: &Rc<Vnode>,
        off: usize,
        d: &S5Dirent,
    ) -> KResult<()> {
        let n = self.write_file(ctx, vn, off, d.as_bytes())?;
        if n != S5_DIRENT_SIZE {
            return Err(Errno::EMLINK);
        }
        Ok(())
    }

    /// Inode number for `name` in this directory, or `ENOENT`.
    fn find_dirent(&self, ctx: &KernelCtx<'_>, vn: &Rc<Vnode>, name: &FileName) -> KResult<u32> {
        assert!(vn.mutex().holding(ctx));
        let mut off = 0;
        while off < self.size() {
            let d = self.read_dirent(ctx, vn, off)?;
            if d.name[0] == 0 {
                break;
            }
            if name.matches_padded(&d.name) {
                return Ok(d.ino);
            }
            off += S5_DIRENT_SIZE;
        }
        Err(Errno::ENOENT)
    }

    /// Removes `name`, decrementing the target inode's link count, and
    /// compacts the directory by moving the final entry into the hole.
    fn remove_dirent(&self, ctx: &KernelCtx<'_>, vn: &Rc<Vnode>, name: &FileName) -> KResult<()> {
        assert!(vn.mutex().holding(ctx));
        let mut off = 0;
        let mut found = None;
        let mut last = None;
        while off < self.size() {
            let d = self.read_dirent(ctx, vn, off)?;
            if d.name[0] == 0 {
                break;
            }
            if name.matches_padded(&d.name) {
                found = Some(off);
                let child = vnode::vget(ctx, &*self.fs, d.ino)?;
                let node = s5node(&child);
                node.inode.borrow_mut().linkcount -= 1;
                node.mark_dirty();
                vnode::vput(ctx, child);
            }
            last = Some((d, off));
            off += S5_DIRENT_SIZE;
        }
        let found = found.ok_or(Errno::ENOENT)?;
        let (last_d, last_off) = last.expect("matched an entry in an empty directory");

        self.write_dirent(ctx, vn, found, &last_d)?;
        self.write_dirent(ctx, vn, last_off, &S5Dirent::default())?;

        let newsize = self.size() - S5_DIRENT_SIZE;
        self.inode.borrow_mut().size = newsize as u32;
        vn.set_len(newsize);
        self.mark_dirty();
        Ok(())
    }

    /// Appends the entry (`name`, `ino`) at the first free slot (the end of
    /// the directory), incrementing the target's link count unless it is a
    /// self-link.
    fn link_dirent(
        &self,
        ctx: &KernelCtx<'_>,
        vn: &Rc<Vnode>,
        name: &FileName,
        ino: u32,
    ) -> KResult<()> {
        assert!(vn.mutex().holding(ctx));
        assert!(name.fits());
        let mut off = 0;
        while off < self.size() {
            let d = self.read_dirent(ctx, vn, off)?;
            if d.name[0] == 0 {
                break;
            }
            debug_assert!(!name.matches_padded(&d.name), "linking a duplicate name");
            off += S5_DIRENT_SIZE;
        }
        let mut d = S5Dirent::default();
        d.name[..name.len()].copy_from_slice(name.as_bytes());
        d.ino = ino;
        self.write_dirent(ctx, vn, off, &d)?;

        if ino != self.vno {
            let child = vnode::vget(ctx, &*self.fs, ino)?;
            let node = s5node(&child);
            node.inode.borrow_mut().linkcount += 1;
            node.mark_dirty();
            vnode::vput(ctx, child);
        }
        Ok(())
    }

    /// Allocated blocks of this inode: non-hole direct and indirect entries,
    /// plus the indirect block itself.
    fn inode_blocks(&self, ctx: &KernelCtx<'_>) -> KResult<u32> {
        let inode = self.inode.borrow().clone();
        let mut blocks = 0;
        for i in 0..S5_NDIRECT {
            if inode.direct[i] != 0 {
                blocks += 1;
            }
        }
        if (inode.typ == S5_TYPE_DATA || inode.typ == S5_TYPE_DIR) && inode.indirect != 0 {
            blocks += 1;
            let pf = pframe::get(ctx, self.fs.obj(), inode.indirect as usize)?;
            for i in 0..super::S5_NINDIRECT {
                if pf.page().read_u32(i) != 0 {
                    blocks += 1;
                }
            }
        }
        Ok(blocks)
    }
}

impl VnodeOps for S5Node {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn lookup(
        &self,
        ctx: &KernelCtx<'_>,
        dir: &Rc<Vnode>,
        name: &FileName,
    ) -> KResult<Rc<Vnode>> {
        let _guard = dir.mutex().lock(ctx);
        let ino = self.find_dirent(ctx, dir, name)?;
        vnode::vget(ctx, &*self.fs, ino)
    }

    fn create(
        &self,
        ctx: &KernelCtx<'_>,
        dir: &Rc<Vnode>,
        name: &FileName,
    ) -> KResult<Rc<Vnode>> {
        if !name.fits() || name.is_empty() {
            return Err(Errno::ENAMETOOLONG);
        }
        let _guard = dir.mutex().lock(ctx);
        let ino = self.fs.alloc_inode(ctx, S5_TYPE_DATA, 0)?;
        self.link_dirent(ctx, dir, name, ino)?;
        log::debug!("s5fs: created ino {} in dir {}", ino, self.vno);
        vnode::vget(ctx, &*self.fs, ino)
    }

    fn mknod(
        &self,
        ctx: &KernelCtx<'_>,
        dir: &Rc<Vnode>,
        name: &FileName,
        kind: VnodeKind,
        devid: DevId,
    ) -> KResult<()> {
        if !name.fits() || name.is_empty() {
            return Err(Errno::ENAMETOOLONG);
        }
        let typ = match kind {
            VnodeKind::Chr => S5_TYPE_CHR,
            VnodeKind::Blk => S5_TYPE_BLK,
            _ => return Err(Errno::EINVAL),
        };
        let _guard = dir.mutex().lock(ctx);
        let ino = self.fs.alloc_inode(ctx, typ, devid.raw())?;
        self.link_dirent(ctx, dir, name, ino)
    }

    fn mkdir(&self, ctx: &KernelCtx<'_>, dir: &Rc<Vnode>, name: &FileName) -> KResult<()> {
        if !name.fits() || name.is_empty() {
            return Err(Errno::ENAMETOOLONG);
        }
        let _guard = dir.mutex().lock(ctx);
        let ino = self.fs.alloc_inode(ctx, S5_TYPE_DIR, 0)?;
        self.link_dirent(ctx, dir, name, ino)?;

        // Seed the child with its `.` and `..` entries. The self-link does
        // not count; `..` adds a link to this directory.
        let child = vnode::vget(ctx, &*self.fs, ino)?;
        let cnode = s5node(&child);
        {
            let _cguard = child.mutex().lock(ctx);
            cnode.link_dirent(ctx, &child, FileName::new("."), ino)?;
            cnode.link_dirent(ctx, &child, FileName::new(".."), self.vno)?;
        }
        vnode::vput(ctx, child);
        Ok(())
    }

    fn rmdir(&self, ctx: &KernelCtx<'_>, dir: &Rc<Vnode>, name: &FileName) -> KResult<()> {
        let _guard = dir.mutex().lock(ctx);
        let ino = self.find_dirent(ctx, dir, name)?;
        let child = vnode::vget(ctx, &*self.fs, ino)?;
        let child = scopeguard::guard(child, |child| vnode::vput(ctx, child));
        if !child.kind().is_dir() {
            return Err(Errno::ENOTDIR);
        }
        if child.len() > 2 * S5_DIRENT_SIZE {
            return Err(Errno::ENOTEMPTY);
        }
        self.remove_dirent(ctx, dir, name)?;
        // The child's `..` goes with it.
        self.inode.borrow_mut().linkcount -= 1;
        self.mark_dirty();
        Ok(())
    }

    fn link(
        &self,
        ctx: &KernelCtx<'_>,
        src: &Rc<Vnode>,
        dir: &Rc<Vnode>,
        name: &FileName,
    ) -> KResult<()> {
        if !name.fits() || name.is_empty() {
            return Err(Errno::ENAMETOOLONG);
        }
        let _guard = dir.mutex().lock(ctx);
        self.link_dirent(ctx, dir, name, src.vno())
    }

    fn unlink(&self, ctx: &KernelCtx<'_>, dir: &Rc<Vnode>, name: &FileName) -> KResult<()> {
        let _guard = dir.mutex().lock(ctx);
        self.remove_dirent(ctx, dir, name)
    }

    fn read(
        &self,
        ctx: &KernelCtx<'_>,
        vn: &Rc<Vnode>,
        off: usize,
        buf: &mut [u8],
    ) -> KResult<usize> {
        match self.typ() {
            S5_TYPE_CHR => self.bytedev(ctx)?.read(ctx, off, buf),
            S5_TYPE_BLK => Err(Errno::EPERM),
            _ => {
                let _guard = vn.mutex().lock(ctx);
                self.read_file(ctx, vn, off, buf)
            }
        }
    }

    fn write(
        &self,
        ctx: &KernelCtx<'_>,
        vn: &Rc<Vnode>,
        off: usize,
        buf: &[u8],
    ) -> KResult<usize> {
        match self.typ() {
            S5_TYPE_CHR => self.bytedev(ctx)?.write(ctx, off, buf),
            S5_TYPE_BLK => Err(Errno::EPERM),
            _ => {
                let _guard = vn.mutex().lock(ctx);
                self.write_file(ctx, vn, off, buf)
            }
        }
    }

    fn readdir(
        &self,
        ctx: &KernelCtx<'_>,
        vn: &Rc<Vnode>,
        off: usize,
    ) -> KResult<Option<(Dirent, usize)>> {
        let _guard = vn.mutex().lock(ctx);
        if off % S5_DIRENT_SIZE != 0 {
            return Err(Errno::EINVAL);
        }
        if off >= self.size() {
            return Ok(None);
        }
        let d = self.read_dirent(ctx, vn, off)?;
        if d.name[0] == 0 {
            return Ok(None);
        }
        let len = d.name.iter().position(|c| *c == 0).unwrap_or(d.name.len());
        Ok(Some((Dirent::new(d.ino, &d.name[..len]), S5_DIRENT_SIZE)))
    }

    fn stat(&self, ctx: &KernelCtx<'_>, vn: &Rc<Vnode>) -> KResult<Stat> {
        let _guard = vn.mutex().lock(ctx);
        let inode = self.inode.borrow().clone();
        Ok(Stat {
            ino: self.vno,
            kind: vn.kind(),
            nlink: inode.linkcount,
            size: inode.size as usize,
            blocks: self.inode_blocks(ctx)?,
        })
    }

    fn mmap(&self, ctx: &KernelCtx<'_>, vn: &Rc<Vnode>) -> KResult<RcMmObj> {
        match self.typ() {
            S5_TYPE_DATA => Ok(vn.mmobj()),
            S5_TYPE_CHR => self.bytedev(ctx)?.mmap(ctx),
            _ => Err(Errno::EACCES),
        }
    }

    fn fillpage(&self, ctx: &KernelCtx<'_>, _vn: &Rc<Vnode>, pf: &Pframe) -> KResult<()> {
        let blockno = self.seek_to_block(ctx, pf.pagenum() * BLOCK_SIZE, false)?;
        if blockno == 0 {
            pf.page().zero();
            Ok(())
        } else {
            self.fs.dev().read_into_page(blockno, pf.page())
        }
    }

    fn dirtypage(&self, ctx: &KernelCtx<'_>, _vn: &Rc<Vnode>, pf: &Pframe) -> KResult<()> {
        // Allocate the backing block now so cleaning cannot fail later.
        let _ = self.seek_to_block(ctx, pf.pagenum() * BLOCK_SIZE, true)?;
        Ok(())
    }

    fn cleanpage(&self, ctx: &KernelCtx<'_>, _vn: &Rc<Vnode>, pf: &Pframe) -> KResult<()> {
        let blockno = self.seek_to_block(ctx, pf.pagenum() * BLOCK_SIZE, false)?;
        assert_ne!(blockno, 0, "cleaning a page with no backing block");
        self.fs.dev().write_from_page(blockno, pf.page())
    }

    fn devid(&self) -> Option<DevId> {
        match self.typ() {
            S5_TYPE_CHR | S5_TYPE_BLK => Some(DevId::from_raw(self.inode.borrow().indirect)),
            _ => None,
        }
    }

    fn nlink(&self) -> u16 {
        self.inode.borrow().linkcount
    }

    fn reclaim(&self, ctx: &KernelCtx<'_>, _vn: &Vnode, keep: bool) -> KResult<()> {
        if keep {
            if self.dirty.get() {
                self.fs.write_inode(ctx, &self.inode.borrow())?;
                self.dirty.set(false);
            }
            Ok(())
        } else {
            log::debug!("s5fs: freeing ino {}", self.vno);
            let mut inode = self.inode.borrow().clone();
            self.fs.free_inode(ctx, &mut inode)?;
            *self.inode.borrow_mut() = inode;
            Ok(())
        }
    }
}
