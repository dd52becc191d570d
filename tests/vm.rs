//! Virtual memory end to end: anonymous mappings, fork copy-on-write,
//! munmap faults, brk, and shared file mappings.

mod common;

use std::cell::Cell;
use std::rc::Rc;

use common::boot;
use wren_kernel::error::Errno;
use wren_kernel::fs::file::{O_CREAT, O_RDWR};
use wren_kernel::fs::path::Path;
use wren_kernel::fs::vfs_syscall as vfs;
use wren_kernel::param::PAGE_SIZE;
use wren_kernel::proc;
use wren_kernel::vm::brk;
use wren_kernel::vm::mmap::{do_mmap, do_munmap};
use wren_kernel::vm::usermem::{copy_from_user, copy_to_user};
use wren_kernel::vm::vmmap::{MapFlags, Prot};

fn rw() -> Prot {
    Prot::READ | Prot::WRITE
}

fn user_byte(ctx: &wren_kernel::KernelCtx<'_>, addr: usize) -> u8 {
    let mut b = [0u8];
    copy_from_user(ctx, addr, &mut b);
    b[0]
}

#[test]
fn anon_mapping_roundtrip() {
    boot(|ctx| {
        let a = do_mmap(
            ctx,
            0,
            2 * PAGE_SIZE,
            rw(),
            MapFlags::PRIVATE | MapFlags::ANON,
            -1,
            0,
        )
        .unwrap();
        copy_to_user(ctx, a, b"first");
        copy_to_user(ctx, a + PAGE_SIZE, b"second");
        let mut buf = [0u8; 6];
        copy_from_user(ctx, a + PAGE_SIZE, &mut buf);
        assert_eq!(&buf, b"second");
        // Fresh anonymous pages read as zeros.
        assert_eq!(user_byte(ctx, a + 100), 0);
        do_munmap(ctx, a, 2 * PAGE_SIZE).unwrap();
        0
    });
}

#[test]
fn fork_copy_on_write() {
    let child_saw = Rc::new(Cell::new(0u8));
    let observed = child_saw.clone();
    let status = boot(move |ctx| {
        let a = do_mmap(
            ctx,
            0,
            PAGE_SIZE,
            rw(),
            MapFlags::PRIVATE | MapFlags::ANON,
            -1,
            0,
        )
        .unwrap();
        copy_to_user(ctx, a, &[0xaa]);

        let pid = proc::do_fork(
            ctx,
            Box::new(move |ctx| {
                copy_to_user(ctx, a, &[0xbb]);
                i32::from(user_byte(ctx, a))
            }),
        )
        .unwrap();
        let (_, status) = proc::do_waitpid(ctx, pid, 0).unwrap();
        observed.set(status as u8);

        // The child's write went to its own frame.
        assert_eq!(user_byte(ctx, a), 0xaa);
        0
    });
    assert_eq!(status, 0);
    assert_eq!(child_saw.get(), 0xbb);
}

#[test]
fn fork_copy_on_write_parent_writes() {
    // Writes on the parent side after fork are private too: the child still
    // reads the pre-fork snapshot.
    boot(move |ctx| {
        let a = do_mmap(
            ctx,
            0,
            PAGE_SIZE,
            rw(),
            MapFlags::PRIVATE | MapFlags::ANON,
            -1,
            0,
        )
        .unwrap();
        copy_to_user(ctx, a, &[0x11]);
        let pid = proc::do_fork(
            ctx,
            Box::new(move |ctx| i32::from(user_byte(ctx, a))),
        )
        .unwrap();
        // Overwrite before the child ever runs.
        copy_to_user(ctx, a, &[0x22]);
        let (_, status) = proc::do_waitpid(ctx, pid, 0).unwrap();
        assert_eq!(status, 0x11);
        assert_eq!(user_byte(ctx, a), 0x22);
        0
    });
}

#[test]
fn munmap_hole_faults() {
    boot(|ctx| {
        let pid = proc::do_fork(
            ctx,
            Box::new(|ctx| {
                let a = do_mmap(
                    ctx,
                    0,
                    3 * PAGE_SIZE,
                    rw(),
                    MapFlags::PRIVATE | MapFlags::ANON,
                    -1,
                    0,
                )
                .unwrap();
                copy_to_user(ctx, a, &[1]);
                copy_to_user(ctx, a + PAGE_SIZE, &[2]);
                copy_to_user(ctx, a + 2 * PAGE_SIZE, &[3]);
                do_munmap(ctx, a + PAGE_SIZE, PAGE_SIZE).unwrap();
                // The outer pages keep their values.
                assert_eq!(user_byte(ctx, a), 1);
                assert_eq!(user_byte(ctx, a + 2 * PAGE_SIZE), 3);
                // The hole kills us with EFAULT.
                let _ = user_byte(ctx, a + PAGE_SIZE);
                unreachable!("survived a fault in unmapped memory");
            }),
        )
        .unwrap();
        let (_, status) = proc::do_waitpid(ctx, pid, 0).unwrap();
        assert_eq!(status, Errno::EFAULT as i32);
        0
    });
}

#[test]
fn write_to_readonly_mapping_faults() {
    boot(|ctx| {
        let pid = proc::do_fork(
            ctx,
            Box::new(|ctx| {
                let a = do_mmap(
                    ctx,
                    0,
                    PAGE_SIZE,
                    Prot::READ,
                    MapFlags::PRIVATE | MapFlags::ANON,
                    -1,
                    0,
                )
                .unwrap();
                assert_eq!(user_byte(ctx, a), 0);
                copy_to_user(ctx, a, &[9]);
                unreachable!("wrote through a read-only mapping");
            }),
        )
        .unwrap();
        let (_, status) = proc::do_waitpid(ctx, pid, 0).unwrap();
        assert_eq!(status, Errno::EFAULT as i32);
        0
    });
}

#[test]
fn brk_grows_and_shrinks() {
    boot(|ctx| {
        let base = wren_kernel::param::USER_MEM_LOW + 0x10000;
        brk::init_brk(ctx, base).unwrap();
        assert_eq!(brk::do_brk(ctx, 0).unwrap(), base);

        // Below the initial break.
        assert_eq!(brk::do_brk(ctx, base - 1).unwrap_err(), Errno::ENOMEM);

        let grown = base + 3 * PAGE_SIZE;
        assert_eq!(brk::do_brk(ctx, grown).unwrap(), grown);
        copy_to_user(ctx, grown - 8, b"heapdata");
        let mut buf = [0u8; 8];
        copy_from_user(ctx, grown - 8, &mut buf);
        assert_eq!(&buf, b"heapdata");

        assert_eq!(brk::do_brk(ctx, base).unwrap(), base);
        assert_eq!(brk::do_brk(ctx, 0).unwrap(), base);

        // A mapping in the way blocks growth.
        let wall = wren_kernel::addr::page_align_up(base) + 8 * PAGE_SIZE;
        do_mmap(
            ctx,
            wall,
            PAGE_SIZE,
            rw(),
            MapFlags::PRIVATE | MapFlags::ANON | MapFlags::FIXED,
            -1,
            0,
        )
        .unwrap();
        assert_eq!(
            brk::do_brk(ctx, wall + PAGE_SIZE).unwrap_err(),
            Errno::ENOMEM
        );
        0
    });
}

#[test]
fn shared_file_mapping_is_visible_to_read() {
    boot(|ctx| {
        let fd = vfs::do_open(ctx, Path::new("/m"), O_RDWR | O_CREAT).unwrap();
        vfs::do_write(ctx, fd, &[0u8; 64]).unwrap();
        let a = do_mmap(ctx, 0, PAGE_SIZE, rw(), MapFlags::SHARED, fd, 0).unwrap();
        copy_to_user(ctx, a + 10, b"via mmap");

        use wren_kernel::fs::file::Whence;
        vfs::do_lseek(ctx, fd, 10, Whence::Set).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(vfs::do_read(ctx, fd, &mut buf).unwrap(), 8);
        assert_eq!(&buf, b"via mmap");

        do_munmap(ctx, a, PAGE_SIZE).unwrap();
        vfs::do_close(ctx, fd).unwrap();
        0
    });
}

#[test]
fn mmap_argument_checking() {
    boot(|ctx| {
        assert_eq!(
            do_mmap(ctx, 1, PAGE_SIZE, rw(), MapFlags::PRIVATE | MapFlags::ANON, -1, 0)
                .unwrap_err(),
            Errno::EINVAL
        );
        assert_eq!(
            do_mmap(ctx, 0, 0, rw(), MapFlags::PRIVATE | MapFlags::ANON, -1, 0).unwrap_err(),
            Errno::EINVAL
        );
        assert_eq!(
            do_mmap(
                ctx,
                0,
                PAGE_SIZE,
                rw(),
                MapFlags::PRIVATE | MapFlags::SHARED,
                -1,
                0
            )
            .unwrap_err(),
            Errno::EINVAL
        );
        assert_eq!(
            do_mmap(ctx, 0, PAGE_SIZE, rw(), MapFlags::SHARED, 44, 0).unwrap_err(),
            Errno::EBADF
        );
        assert_eq!(do_munmap(ctx, 3, PAGE_SIZE).unwrap_err(), Errno::EINVAL);
        0
    });
}
