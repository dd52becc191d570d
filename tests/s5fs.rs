//! The on-disk filesystem: sparse files, indirect blocks, block accounting,
//! free-list recycling, and persistence across mounts.

mod common;

use common::{boot, newdisk};
use wren_kernel::fs::file::{Whence, O_CREAT, O_RDONLY, O_RDWR, O_WRONLY};
use wren_kernel::fs::path::Path;
use wren_kernel::fs::s5fs::{S5_MAX_BLOCKS, S5_NDIRECT};
use wren_kernel::fs::vfs_syscall as vfs;
use wren_kernel::kernel;
use wren_kernel::param::BLOCK_SIZE;
use wren_kernel::Errno;

#[test]
fn sparse_file_reads_zeros() {
    boot(|ctx| {
        let fd = vfs::do_open(ctx, Path::new("/a"), O_RDWR | O_CREAT).unwrap();
        vfs::do_lseek(ctx, fd, 8192, Whence::Set).unwrap();
        assert_eq!(vfs::do_write(ctx, fd, b"tail").unwrap(), 4);

        vfs::do_lseek(ctx, fd, 0, Whence::Set).unwrap();
        let mut buf = vec![0xffu8; 8196];
        assert_eq!(vfs::do_read(ctx, fd, &mut buf).unwrap(), 8196);
        assert!(buf[..8192].iter().all(|b| *b == 0));
        assert_eq!(&buf[8192..], b"tail");
        vfs::do_close(ctx, fd).unwrap();

        let st = vfs::do_stat(ctx, Path::new("/a")).unwrap();
        assert_eq!(st.size, 8196);
        // One allocated data block; the holes cost nothing.
        assert_eq!(st.blocks, 1);
        0
    });
}

#[test]
fn indirect_blocks_are_counted() {
    boot(|ctx| {
        let fd = vfs::do_open(ctx, Path::new("/big"), O_RDWR | O_CREAT).unwrap();
        let off = (S5_NDIRECT * BLOCK_SIZE) as isize;
        vfs::do_lseek(ctx, fd, off, Whence::Set).unwrap();
        vfs::do_write(ctx, fd, b"deep").unwrap();
        vfs::do_lseek(ctx, fd, off, Whence::Set).unwrap();
        let mut buf = [0u8; 4];
        vfs::do_read(ctx, fd, &mut buf).unwrap();
        assert_eq!(&buf, b"deep");
        vfs::do_close(ctx, fd).unwrap();

        let st = vfs::do_stat(ctx, Path::new("/big")).unwrap();
        assert_eq!(st.size, S5_NDIRECT * BLOCK_SIZE + 4);
        // The data block plus the indirect block holding its number.
        assert_eq!(st.blocks, 2);
        vfs::do_unlink(ctx, Path::new("/big")).unwrap();
        0
    });
}

#[test]
fn file_size_is_bounded() {
    boot(|ctx| {
        let fd = vfs::do_open(ctx, Path::new("/huge"), O_WRONLY | O_CREAT).unwrap();
        let off = (S5_MAX_BLOCKS * BLOCK_SIZE) as isize;
        vfs::do_lseek(ctx, fd, off, Whence::Set).unwrap();
        assert_eq!(vfs::do_write(ctx, fd, b"x").unwrap_err(), Errno::EFBIG);
        vfs::do_close(ctx, fd).unwrap();
        0
    });
}

#[test]
fn unlink_recycles_blocks() {
    // Two files of ~150 blocks only both fit on a 246-block disk if the
    // first one's blocks really return to the free list.
    boot(|ctx| {
        let chunk = vec![0xabu8; 150 * BLOCK_SIZE];
        for name in ["/one", "/two"] {
            let fd = vfs::do_open(ctx, Path::new(name), O_WRONLY | O_CREAT).unwrap();
            assert_eq!(vfs::do_write(ctx, fd, &chunk).unwrap(), chunk.len());
            vfs::do_close(ctx, fd).unwrap();
            vfs::do_unlink(ctx, Path::new(name)).unwrap();
        }
        0
    });
}

#[test]
fn disk_fills_up() {
    boot(|ctx| {
        let fd = vfs::do_open(ctx, Path::new("/fill"), O_WRONLY | O_CREAT).unwrap();
        let chunk = vec![0u8; 8 * BLOCK_SIZE];
        let err = loop {
            match vfs::do_write(ctx, fd, &chunk) {
                Ok(_) => continue,
                Err(e) => break e,
            }
        };
        assert_eq!(err, Errno::ENOSPC);
        vfs::do_close(ctx, fd).unwrap();
        vfs::do_unlink(ctx, Path::new("/fill")).unwrap();

        // Space is usable again.
        let fd = vfs::do_open(ctx, Path::new("/after"), O_WRONLY | O_CREAT).unwrap();
        assert_eq!(vfs::do_write(ctx, fd, &chunk).unwrap(), chunk.len());
        vfs::do_close(ctx, fd).unwrap();
        0
    });
}

#[test]
fn data_persists_across_mounts() {
    let disk = newdisk();
    kernel::boot(
        disk.clone(),
        Box::new(|ctx| {
            vfs::do_mkdir(ctx, Path::new("/keep")).unwrap();
            let fd = vfs::do_open(ctx, Path::new("/keep/f"), O_WRONLY | O_CREAT).unwrap();
            vfs::do_write(ctx, fd, b"durable").unwrap();
            vfs::do_close(ctx, fd).unwrap();
            0
        }),
    );
    kernel::boot(
        disk,
        Box::new(|ctx| {
            let fd = vfs::do_open(ctx, Path::new("/keep/f"), O_RDONLY).unwrap();
            let mut buf = [0u8; 16];
            assert_eq!(vfs::do_read(ctx, fd, &mut buf).unwrap(), 7);
            assert_eq!(&buf[..7], b"durable");
            vfs::do_close(ctx, fd).unwrap();
            // Device nodes were created on the first boot and survived.
            assert!(vfs::do_stat(ctx, Path::new("/dev/null")).is_ok());
            0
        }),
    );
}

#[test]
fn sparse_hole_write_preserves_tail() {
    boot(|ctx| {
        let fd = vfs::do_open(ctx, Path::new("/s"), O_RDWR | O_CREAT).unwrap();
        vfs::do_write(ctx, fd, b"head").unwrap();
        vfs::do_lseek(ctx, fd, (2 * BLOCK_SIZE) as isize, Whence::Set).unwrap();
        vfs::do_write(ctx, fd, b"tail").unwrap();
        // Fill part of the hole; head and tail survive.
        vfs::do_lseek(ctx, fd, BLOCK_SIZE as isize, Whence::Set).unwrap();
        vfs::do_write(ctx, fd, b"middle").unwrap();

        let mut buf = vec![0u8; 2 * BLOCK_SIZE + 4];
        vfs::do_lseek(ctx, fd, 0, Whence::Set).unwrap();
        assert_eq!(vfs::do_read(ctx, fd, &mut buf).unwrap(), buf.len());
        assert_eq!(&buf[..4], b"head");
        assert!(buf[4..BLOCK_SIZE].iter().all(|b| *b == 0));
        assert_eq!(&buf[BLOCK_SIZE..BLOCK_SIZE + 6], b"middle");
        assert_eq!(&buf[2 * BLOCK_SIZE..], b"tail");
        vfs::do_close(ctx, fd).unwrap();
        0
    });
}
