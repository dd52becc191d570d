//! Process lifecycle: spawn, fork, waitpid, reparenting, kill.

mod common;

use std::cell::Cell;
use std::rc::Rc;

use common::boot;
use wren_kernel::proc;
use wren_kernel::Errno;

#[test]
fn init_exit_status() {
    assert_eq!(boot(|_| 7), 7);
}

#[test]
fn waitpid_reaps_in_death_order() {
    let status = boot(|ctx| {
        let mut pids = Vec::new();
        for status in [7, 8, 9] {
            let pid = proc::do_fork(ctx, Box::new(move |_| status)).unwrap();
            pids.push(pid);
        }
        for (i, expect_status) in [7, 8, 9].iter().enumerate() {
            let (pid, status) = proc::do_waitpid(ctx, -1, 0).unwrap();
            assert_eq!(pid, pids[i]);
            assert_eq!(status, *expect_status);
        }
        0
    });
    assert_eq!(status, 0);
}

#[test]
fn waitpid_specific_child() {
    boot(|ctx| {
        let a = proc::spawn(ctx, "a", Box::new(|_| 1)).unwrap();
        let b = proc::spawn(ctx, "b", Box::new(|_| 2)).unwrap();
        let (pid, status) = proc::do_waitpid(ctx, b.pid(), 0).unwrap();
        assert_eq!(pid, b.pid());
        assert_eq!(status, 2);
        let (pid, status) = proc::do_waitpid(ctx, -1, 0).unwrap();
        assert_eq!(pid, a.pid());
        assert_eq!(status, 1);
        0
    });
}

#[test]
fn waitpid_without_children() {
    boot(|ctx| {
        assert_eq!(proc::do_waitpid(ctx, -1, 0), Err(Errno::ECHILD));
        let child = proc::spawn(ctx, "c", Box::new(|_| 0)).unwrap();
        // A selector naming a process that is not our child is ECHILD too.
        assert_eq!(
            proc::do_waitpid(ctx, child.pid() + 1, 0),
            Err(Errno::ECHILD)
        );
        proc::do_waitpid(ctx, -1, 0).unwrap();
        0
    });
}

#[test]
fn orphans_are_adopted_by_init() {
    let grandchild_status = Rc::new(Cell::new(-1));
    let observed = grandchild_status.clone();
    boot(move |ctx| {
        let middle = proc::spawn(
            ctx,
            "middle",
            Box::new(|ctx| {
                // Dies without reaping its child; init inherits it.
                let _ = proc::spawn(ctx, "orphan", Box::new(|_| 5)).unwrap();
                0
            }),
        )
        .unwrap();
        let (pid, status) = proc::do_waitpid(ctx, middle.pid(), 0).unwrap();
        assert_eq!((pid, status), (middle.pid(), 0));
        // The orphan is now our child.
        let (_, status) = proc::do_waitpid(ctx, -1, 0).unwrap();
        observed.set(status);
        0
    });
    assert_eq!(grandchild_status.get(), 5);
}

#[test]
fn fork_shares_open_files() {
    use wren_kernel::fs::file::{O_CREAT, O_RDWR};
    use wren_kernel::fs::path::Path;
    use wren_kernel::fs::vfs_syscall as vfs;

    boot(|ctx| {
        let fd = vfs::do_open(ctx, Path::new("/shared"), O_RDWR | O_CREAT).unwrap();
        vfs::do_write(ctx, fd, b"ab").unwrap();
        let pid = proc::do_fork(
            ctx,
            Box::new(move |ctx| {
                // Same file object: the offset is shared with the parent.
                vfs::do_write(ctx, fd, b"cd").unwrap();
                vfs::do_close(ctx, fd).unwrap();
                0
            }),
        )
        .unwrap();
        proc::do_waitpid(ctx, pid, 0).unwrap();
        let mut buf = [0u8; 4];
        use wren_kernel::fs::file::Whence;
        vfs::do_lseek(ctx, fd, 0, Whence::Set).unwrap();
        assert_eq!(vfs::do_read(ctx, fd, &mut buf).unwrap(), 4);
        assert_eq!(&buf, b"abcd");
        vfs::do_close(ctx, fd).unwrap();
        0
    });
}
