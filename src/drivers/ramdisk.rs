//! A RAM-backed block device.
//!
//! Stands in for the disk: synchronous, and inspectable after the kernel that
//! used it has shut down, which is how the tests check persistence.

use core::cell::RefCell;

use alloc::vec;
use alloc::vec::Vec;

use crate::error::KResult;
use crate::param::BLOCK_SIZE;

use super::BlockDev;

pub struct MemDisk {
    blocks: RefCell<Vec<u8>>,
    nblocks: usize,
}

impl MemDisk {
    /// A zeroed disk of `nblocks` blocks.
    pub fn new(nblocks: usize) -> MemDisk {
        MemDisk {
            blocks: RefCell::new(vec![0; nblocks * BLOCK_SIZE]),
            nblocks,
        }
    }

    fn check(&self, blockno: u32, len: usize) -> (usize, usize) {
        assert_eq!(len, BLOCK_SIZE, "partial block transfer");
        let blockno = blockno as usize;
        assert!(blockno < self.nblocks, "block {} out of range", blockno);
        (blockno * BLOCK_SIZE, (blockno + 1) * BLOCK_SIZE)
    }
}

impl BlockDev for MemDisk {
    fn read_block(&self, blockno: u32, buf: &mut [u8]) -> KResult<()> {
        let (lo, hi) = self.check(blockno, buf.len());
        buf.copy_from_slice(&self.blocks.borrow()[lo..hi]);
        Ok(())
    }

    fn write_block(&self, blockno: u32, buf: &[u8]) -> KResult<()> {
        let (lo, hi) = self.check(blockno, buf.len());
        self.blocks.borrow_mut()[lo..hi].copy_from_slice(buf);
        Ok(())
    }

    fn nblocks(&self) -> usize {
        self.nblocks
    }
}
