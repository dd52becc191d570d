//! s5fs, the on-disk filesystem.
//!
//! Disk layout: block 0 holds the superblock, blocks 1..=`S5_INODE_BLOCKS`
//! the inode table, and everything after is data. Free blocks are chained in
//! groups through the superblock's cache array, whose last slot points at the
//! next group (or the end sentinel); free inodes are singly linked through
//! their `next_free` field. All on-disk records are bit-exact little-endian
//! structures.
//!
//! Metadata (the superblock, inode-table blocks, indirect blocks, free-chain
//! blocks) is accessed through the filesystem's block-device memory object so
//! it lives in the page-frame cache and is written back on eviction. File
//! data pages belong to each file vnode's own object and transfer directly
//! between their frames and the device.

use core::cell::RefCell;
use core::mem;

use alloc::boxed::Box;
use alloc::rc::{Rc, Weak};
use alloc::vec;
use static_assertions::const_assert;
use static_assertions::const_assert_eq;
use zerocopy::{AsBytes, FromBytes};

use crate::drivers::BlockDev;
use crate::error::{Errno, KResult};
use crate::fs::vnode::{VnodeKind, VnodeOps};
use crate::fs::FsOps;
use crate::kernel::KernelCtx;
use crate::lock::KMutex;
use crate::param::{BLOCK_SIZE, NAME_LEN, PAGE_SIZE};
use crate::vm::mmobj::{MmObj, RcMmObj};
use crate::vm::pframe;

mod inode;

pub(crate) use inode::S5Node;

pub const S5_MAGIC: u32 = 0x95f5_0000;
pub const S5_VERSION: u32 = 1;

pub(crate) const S5_TYPE_FREE: u16 = 0;
pub(crate) const S5_TYPE_DATA: u16 = 1;
pub(crate) const S5_TYPE_DIR: u16 = 2;
pub(crate) const S5_TYPE_CHR: u16 = 3;
pub(crate) const S5_TYPE_BLK: u16 = 4;

/// Direct block slots per inode.
pub const S5_NDIRECT: usize = 28;
/// Block numbers per indirect block.
pub const S5_NINDIRECT: usize = BLOCK_SIZE / 4;
/// Largest file, in blocks.
pub const S5_MAX_BLOCKS: usize = S5_NDIRECT + S5_NINDIRECT;
/// Free block numbers cached in the superblock; the last one chains.
pub const S5_NBLKS_PER_FNODE: usize = 32;

pub const S5_INODE_SIZE: usize = mem::size_of::<S5Inode>();
pub const S5_INODES_PER_BLOCK: usize = BLOCK_SIZE / S5_INODE_SIZE;
pub const S5_INODE_BLOCKS: usize = 8;
pub const S5_NUM_INODES: usize = S5_INODES_PER_BLOCK * S5_INODE_BLOCKS;

pub const S5_SUPER_BLOCK: u32 = 0;
pub const S5_DATA_START: u32 = 1 + S5_INODE_BLOCKS as u32;
pub const S5_ROOT_INODE: u32 = 0;
/// End of the free-block chain and of the free-inode list.
pub const S5_FREE_SENTINEL: u32 = u32::MAX;

pub const S5_DIRENT_SIZE: usize = mem::size_of::<S5Dirent>();

#[repr(C)]
#[derive(AsBytes, FromBytes, Clone, Copy, Default)]
pub struct S5Super {
    pub magic: u32,
    pub version: u32,
    /// Valid entries in `free_blocks` below the chain slot.
    pub nfree: u32,
    /// Cached free block numbers; the last slot is the next chain block or
    /// the sentinel.
    pub free_blocks: [u32; S5_NBLKS_PER_FNODE],
    /// Head of the free inode list, or the sentinel.
    pub free_inode: u32,
}

#[repr(C)]
#[derive(AsBytes, FromBytes, Clone, Copy, Default)]
pub struct S5Inode {
    pub size: u32,
    pub typ: u16,
    pub linkcount: u16,
    pub direct: [u32; S5_NDIRECT],
    /// Indirect block number — or the device id for chr/blk inodes.
    pub indirect: u32,
    /// Next free inode when this one is free.
    pub next_free: u32,
    pub number: u32,
}

#[repr(C)]
#[derive(AsBytes, FromBytes, Clone, Copy)]
pub struct S5Dirent {
    /// NUL-terminated; an empty name marks end of directory.
    pub name: [u8; NAME_LEN + 1],
    pub ino: u32,
}

impl Default for S5Dirent {
    fn default() -> Self {
        S5Dirent {
            name: [0; NAME_LEN + 1],
            ino: 0,
        }
    }
}

const_assert_eq!(S5_INODE_SIZE, 132);
const_assert_eq!(S5_DIRENT_SIZE, 32);
const_assert_eq!(BLOCK_SIZE % S5_DIRENT_SIZE, 0);
const_assert_eq!(BLOCK_SIZE, PAGE_SIZE);
const_assert!(S5_INODES_PER_BLOCK * S5_INODE_SIZE <= BLOCK_SIZE);
const_assert!(mem::size_of::<S5Super>() <= BLOCK_SIZE);

/// Inode-table block holding inode `ino`.
pub(crate) fn inode_block(ino: u32) -> u32 {
    1 + ino / S5_INODES_PER_BLOCK as u32
}

/// Byte offset of inode `ino` inside its table block.
pub(crate) fn inode_offset(ino: u32) -> usize {
    (ino as usize % S5_INODES_PER_BLOCK) * S5_INODE_SIZE
}

pub struct S5fs {
    fsid: u64,
    dev: Rc<dyn BlockDev>,
    /// Metadata page cache over the device.
    obj: RcMmObj,
    /// In-core superblock; doubling as the filesystem mutex guarding the free
    /// lists.
    sb: KMutex<S5Super>,
    selfref: RefCell<Weak<S5fs>>,
}

impl S5fs {
    /// Mounts the filesystem on `dev`, validating the superblock.
    pub fn mount(ctx: &KernelCtx<'_>, dev: Rc<dyn BlockDev>) -> KResult<Rc<S5fs>> {
        let kernel = ctx.kernel();
        let obj = MmObj::new_blockdev(kernel, dev.clone());
        let pf = pframe::get(ctx, &obj, S5_SUPER_BLOCK as usize)?;
        let mut sb = S5Super::default();
        pf.page().copy_out(0, sb.as_bytes_mut());
        if sb.magic != S5_MAGIC || sb.version != S5_VERSION {
            log::warn!("s5fs: bad superblock (magic {:#x})", sb.magic);
            return Err(Errno::EINVAL);
        }
        let fs = Rc::new(S5fs {
            fsid: kernel.alloc_fsid(),
            dev,
            obj,
            sb: KMutex::new("s5fs", sb),
            selfref: RefCell::new(Weak::new()),
        });
        *fs.selfref.borrow_mut() = Rc::downgrade(&fs);
        log::info!("s5fs: mounted fs {} ({} blocks)", fs.fsid, fs.dev.nblocks());
        Ok(fs)
    }

    pub fn root_ino() -> u32 {
        S5_ROOT_INODE
    }

    pub(crate) fn obj(&self) -> &RcMmObj {
        &self.obj
    }

    pub(crate) fn dev(&self) -> &Rc<dyn BlockDev> {
        &self.dev
    }

    pub(crate) fn myself(&self) -> Rc<S5fs> {
        self.selfref.borrow().upgrade().expect("fs self reference")
    }

    /// Copies the in-core superblock into its cached frame and dirties it.
    fn dirty_super(&self, ctx: &KernelCtx<'_>, sb: &S5Super) -> KResult<()> {
        let pf = pframe::get(ctx, &self.obj, S5_SUPER_BLOCK as usize)?;
        pf.page().copy_in(0, sb.as_bytes());
        pframe::dirty(ctx, &self.obj, &pf)
    }

    /// Takes a block off the free list. The block's contents are undefined.
    pub(crate) fn alloc_block(&self, ctx: &KernelCtx<'_>) -> KResult<u32> {
        let mut sb = self.sb.lock(ctx);
        if sb.nfree > 0 {
            sb.nfree -= 1;
            let blockno = sb.free_blocks[sb.nfree as usize];
            self.dirty_super(ctx, &sb)?;
            return Ok(blockno);
        }
        // Cache exhausted: the chain slot names the block holding the next
        // batch of free numbers, and that block itself is the one we hand
        // out after copying the batch in.
        let next = sb.free_blocks[S5_NBLKS_PER_FNODE - 1];
        if next == S5_FREE_SENTINEL {
            log::debug!("s5fs: out of free blocks");
            return Err(Errno::ENOSPC);
        }
        let pf = pframe::get(ctx, &self.obj, next as usize)?;
        for i in 0..S5_NBLKS_PER_FNODE {
            sb.free_blocks[i] = pf.page().read_u32(i);
        }
        sb.nfree = (S5_NBLKS_PER_FNODE - 1) as u32;
        self.dirty_super(ctx, &sb)?;
        Ok(next)
    }

    /// Returns a block to the free list. The caller guarantees the block is
    /// unreferenced and its frames are not resident.
    pub(crate) fn free_block(&self, ctx: &KernelCtx<'_>, blockno: u32) -> KResult<()> {
        let mut sb = self.sb.lock(ctx);
        assert!((sb.nfree as usize) < S5_NBLKS_PER_FNODE);
        if sb.nfree as usize == S5_NBLKS_PER_FNODE - 1 {
            // Cache full: spill it into the freed block and start a new
            // chain link headed there.
            let pf = pframe::get(ctx, &self.obj, blockno as usize)?;
            for i in 0..S5_NBLKS_PER_FNODE {
                pf.page().write_u32(i, sb.free_blocks[i]);
            }
            pframe::dirty(ctx, &self.obj, &pf)?;
            sb.nfree = 0;
            sb.free_blocks[S5_NBLKS_PER_FNODE - 1] = blockno;
        } else {
            let n = sb.nfree as usize;
            sb.free_blocks[n] = blockno;
            sb.nfree += 1;
        }
        self.dirty_super(ctx, &sb)
    }

    /// Pops an inode off the free list and initializes it on disk. For chr
    /// and blk inodes `devid` lands in the indirect slot.
    pub(crate) fn alloc_inode(&self, ctx: &KernelCtx<'_>, typ: u16, devid: u32) -> KResult<u32> {
        assert!(matches!(
            typ,
            S5_TYPE_DATA | S5_TYPE_DIR | S5_TYPE_CHR | S5_TYPE_BLK
        ));
        let mut sb = self.sb.lock(ctx);
        if sb.free_inode == S5_FREE_SENTINEL {
            log::debug!("s5fs: out of free inodes");
            return Err(Errno::ENOSPC);
        }
        let ino = sb.free_inode;
        let mut inode = self.read_inode(ctx, ino)?;
        assert_eq!(inode.number, ino, "corrupt free inode list");
        assert_eq!(inode.typ, S5_TYPE_FREE);
        sb.free_inode = inode.next_free;
        self.dirty_super(ctx, &sb)?;
        drop(sb);

        inode.size = 0;
        inode.typ = typ;
        inode.linkcount = 0;
        inode.direct = [0; S5_NDIRECT];
        inode.indirect = if typ == S5_TYPE_CHR || typ == S5_TYPE_BLK {
            devid
        } else {
            0
        };
        inode.next_free = 0;
        self.write_inode(ctx, &inode)?;
        Ok(ino)
    }

    /// Releases the inode's blocks and prepends it to the free list. The
    /// caller passes the in-core copy, which is reset and written back.
    pub(crate) fn free_inode(&self, ctx: &KernelCtx<'_>, inode: &mut S5Inode) -> KResult<()> {
        assert!(matches!(
            inode.typ,
            S5_TYPE_DATA | S5_TYPE_DIR | S5_TYPE_CHR | S5_TYPE_BLK
        ));
        if inode.typ == S5_TYPE_DATA || inode.typ == S5_TYPE_DIR {
            for i in 0..S5_NDIRECT {
                if inode.direct[i] != 0 {
                    self.free_block(ctx, inode.direct[i])?;
                    inode.direct[i] = 0;
                }
            }
            if inode.indirect != 0 {
                let pf = pframe::get(ctx, &self.obj, inode.indirect as usize)?;
                pf.pin();
                for i in 0..S5_NINDIRECT {
                    let blockno = pf.page().read_u32(i);
                    assert_ne!(blockno, inode.indirect);
                    if blockno != 0 {
                        self.free_block(ctx, blockno)?;
                    }
                }
                pf.unpin();
                self.free_block(ctx, inode.indirect)?;
            }
        }
        inode.indirect = 0;
        inode.typ = S5_TYPE_FREE;

        let mut sb = self.sb.lock(ctx);
        inode.next_free = sb.free_inode;
        sb.free_inode = inode.number;
        self.dirty_super(ctx, &sb)?;
        drop(sb);

        self.write_inode(ctx, inode)
    }

    /// The on-disk inode record for `ino`, via the metadata cache.
    pub(crate) fn read_inode(&self, ctx: &KernelCtx<'_>, ino: u32) -> KResult<S5Inode> {
        assert!((ino as usize) < S5_NUM_INODES, "inode {} out of range", ino);
        let pf = pframe::get(ctx, &self.obj, inode_block(ino) as usize)?;
        let mut inode = S5Inode::default();
        pf.page().copy_out(inode_offset(ino), inode.as_bytes_mut());
        Ok(inode)
    }

    pub(crate) fn write_inode(&self, ctx: &KernelCtx<'_>, inode: &S5Inode) -> KResult<()> {
        let pf = pframe::get(ctx, &self.obj, inode_block(inode.number) as usize)?;
        pf.page().copy_in(inode_offset(inode.number), inode.as_bytes());
        pframe::dirty(ctx, &self.obj, &pf)
    }

    /// Writes all cached metadata back and drops its frames. The vnode cache
    /// must already be empty.
    pub(crate) fn unmount(&self, ctx: &KernelCtx<'_>) {
        pframe::evict_obj(ctx, &self.obj, true).expect("metadata writeback failed");
        log::info!("s5fs: unmounted fs {}", self.fsid);
    }
}

impl FsOps for S5fs {
    fn fsid(&self) -> u64 {
        self.fsid
    }

    fn root_ino(&self) -> u32 {
        S5_ROOT_INODE
    }

    fn read_vnode(
        &self,
        ctx: &KernelCtx<'_>,
        vno: u32,
    ) -> KResult<(VnodeKind, usize, Box<dyn VnodeOps>)> {
        let inode = self.read_inode(ctx, vno)?;
        let kind = match inode.typ {
            S5_TYPE_DATA => VnodeKind::Regular,
            S5_TYPE_DIR => VnodeKind::Directory,
            S5_TYPE_CHR => VnodeKind::Chr,
            S5_TYPE_BLK => VnodeKind::Blk,
            t => panic!("vget of free inode {} (type {})", vno, t),
        };
        let len = inode.size as usize;
        Ok((kind, len, Box::new(S5Node::new(self.myself(), vno, inode))))
    }
}

/// Builds a fresh filesystem on `dev`: superblock, inode table with inode 0
/// as the root directory, the root's `.`/`..` block, and every remaining
/// block chained onto the free list by the same algorithm `free_block` uses.
pub fn format(dev: &dyn BlockDev) -> KResult<()> {
    let nblocks = dev.nblocks() as u32;
    assert!(nblocks > S5_DATA_START + 1, "disk too small for s5fs");

    let root_block = S5_DATA_START;
    let mut sb = S5Super {
        magic: S5_MAGIC,
        version: S5_VERSION,
        nfree: 0,
        free_blocks: [0; S5_NBLKS_PER_FNODE],
        free_inode: 1,
    };
    sb.free_blocks[S5_NBLKS_PER_FNODE - 1] = S5_FREE_SENTINEL;

    // Inode table: the root directory, then a chain of free inodes.
    let mut table = vec![0u8; S5_INODE_BLOCKS * BLOCK_SIZE];
    for ino in 0..S5_NUM_INODES as u32 {
        let mut inode = S5Inode::default();
        inode.number = ino;
        if ino == S5_ROOT_INODE {
            inode.typ = S5_TYPE_DIR;
            inode.size = (2 * S5_DIRENT_SIZE) as u32;
            // The mount itself holds the root; without this the last vput
            // would free the root inode.
            inode.linkcount = 1;
            inode.direct[0] = root_block;
        } else {
            inode.typ = S5_TYPE_FREE;
            inode.next_free = if ino + 1 < S5_NUM_INODES as u32 {
                ino + 1
            } else {
                S5_FREE_SENTINEL
            };
        }
        let pos = (ino as usize / S5_INODES_PER_BLOCK) * BLOCK_SIZE + inode_offset(ino);
        table[pos..pos + S5_INODE_SIZE].copy_from_slice(inode.as_bytes());
    }
    for b in 0..S5_INODE_BLOCKS {
        dev.write_block(1 + b as u32, &table[b * BLOCK_SIZE..(b + 1) * BLOCK_SIZE])?;
    }

    // Root directory contents.
    let mut rootdir = vec![0u8; BLOCK_SIZE];
    for (i, name) in [&b"."[..], &b".."[..]].iter().enumerate() {
        let mut d = S5Dirent::default();
        d.name[..name.len()].copy_from_slice(name);
        d.ino = S5_ROOT_INODE;
        rootdir[i * S5_DIRENT_SIZE..(i + 1) * S5_DIRENT_SIZE].copy_from_slice(d.as_bytes());
    }
    dev.write_block(root_block, &rootdir)?;

    // Chain the free blocks.
    for blockno in root_block + 1..nblocks {
        if sb.nfree as usize == S5_NBLKS_PER_FNODE - 1 {
            let mut chain = vec![0u8; BLOCK_SIZE];
            for (i, b) in sb.free_blocks.iter().enumerate() {
                chain[i * 4..i * 4 + 4].copy_from_slice(&b.to_le_bytes());
            }
            dev.write_block(blockno, &chain)?;
            sb.nfree = 0;
            sb.free_blocks[S5_NBLKS_PER_FNODE - 1] = blockno;
        } else {
            let n = sb.nfree as usize;
            sb.free_blocks[n] = blockno;
            sb.nfree += 1;
        }
    }

    let mut sbuf = vec![0u8; BLOCK_SIZE];
    sbuf[..mem::size_of::<S5Super>()].copy_from_slice(sb.as_bytes());
    dev.write_block(S5_SUPER_BLOCK, &sbuf)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_layout() {
        assert_eq!(S5_INODE_SIZE, 132);
        assert_eq!(S5_DIRENT_SIZE, 32);
        assert_eq!(S5_INODES_PER_BLOCK, 31);
        assert_eq!(S5_NINDIRECT, 1024);
    }

    #[test]
    fn locators() {
        assert_eq!(inode_block(0), 1);
        assert_eq!(inode_block(30), 1);
        assert_eq!(inode_block(31), 2);
        assert_eq!(inode_offset(0), 0);
        assert_eq!(inode_offset(32), S5_INODE_SIZE);
    }
}
