//! The terminal line discipline: canonical lines, editing, end-of-file,
//! echo, and cancellation of a blocked reader.

mod common;

use std::cell::RefCell;
use std::rc::Rc;

use common::boot;
use wren_kernel::fs::file::{O_RDONLY, O_WRONLY};
use wren_kernel::fs::path::Path;
use wren_kernel::fs::vfs_syscall as vfs;
use wren_kernel::proc;

fn feed(ctx: &wren_kernel::KernelCtx<'_>, bytes: &[u8]) {
    let tty = ctx.kernel().tty(0).unwrap();
    for &b in bytes {
        tty.receive_char(ctx.kernel(), b);
    }
}

/// Spawns a reader process that performs one read from /dev/tty0 and records
/// the bytes it got.
fn spawn_reader(
    ctx: &wren_kernel::KernelCtx<'_>,
    into: Rc<RefCell<Vec<u8>>>,
) -> Rc<wren_kernel::proc::Proc> {
    proc::spawn(
        ctx,
        "reader",
        Box::new(move |ctx| {
            let fd = vfs::do_open(ctx, Path::new("/dev/tty0"), O_RDONLY).unwrap();
            let mut buf = [0u8; 64];
            match vfs::do_read(ctx, fd, &mut buf) {
                Ok(n) => {
                    into.borrow_mut().extend_from_slice(&buf[..n]);
                    let _ = vfs::do_close(ctx, fd);
                    0
                }
                Err(e) => {
                    let _ = vfs::do_close(ctx, fd);
                    -(e as i32)
                }
            }
        }),
    )
    .unwrap()
}

#[test]
fn read_blocks_until_a_line_is_cooked() {
    boot(|ctx| {
        let got = Rc::new(RefCell::new(Vec::new()));
        let reader = spawn_reader(ctx, got.clone());
        // Let the reader block.
        ctx.kernel().sched().yield_now(ctx);
        assert!(got.borrow().is_empty());

        feed(ctx, b"hi");
        // No newline yet: the line is not cooked, the reader stays asleep.
        ctx.kernel().sched().yield_now(ctx);
        assert!(got.borrow().is_empty());

        feed(ctx, b"\n");
        let (_, status) = proc::do_waitpid(ctx, reader.pid(), 0).unwrap();
        assert_eq!(status, 0);
        assert_eq!(&*got.borrow(), b"hi\n");
        0
    });
}

#[test]
fn backspace_edits_the_raw_line() {
    boot(|ctx| {
        let got = Rc::new(RefCell::new(Vec::new()));
        let reader = spawn_reader(ctx, got.clone());
        ctx.kernel().sched().yield_now(ctx);

        feed(ctx, b"ab\x08c\n");
        proc::do_waitpid(ctx, reader.pid(), 0).unwrap();
        assert_eq!(&*got.borrow(), b"ac\n");

        // The echo shows the edit, the screen capture has it all.
        let console = ctx.kernel().tty(0).unwrap().console().unwrap();
        assert_eq!(console.contents(), b"ab\x08c\n");
        0
    });
}

#[test]
fn eof_terminates_the_line_unseen() {
    boot(|ctx| {
        let got = Rc::new(RefCell::new(Vec::new()));
        let reader = spawn_reader(ctx, got.clone());
        ctx.kernel().sched().yield_now(ctx);
        feed(ctx, b"ab\x04");
        proc::do_waitpid(ctx, reader.pid(), 0).unwrap();
        // EOF cooks the line but is not delivered.
        assert_eq!(&*got.borrow(), b"ab");

        // A bare EOF reads as zero bytes.
        let got = Rc::new(RefCell::new(Vec::new()));
        let reader = spawn_reader(ctx, got.clone());
        ctx.kernel().sched().yield_now(ctx);
        feed(ctx, b"\x04");
        let (_, status) = proc::do_waitpid(ctx, reader.pid(), 0).unwrap();
        assert_eq!(status, 0);
        assert!(got.borrow().is_empty());
        0
    });
}

#[test]
fn two_lines_two_reads() {
    boot(|ctx| {
        feed(ctx, b"one\ntwo\n");
        let fd = vfs::do_open(ctx, Path::new("/dev/tty0"), O_RDONLY).unwrap();
        let mut buf = [0u8; 64];
        let n = vfs::do_read(ctx, fd, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"one\n");
        let n = vfs::do_read(ctx, fd, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"two\n");
        vfs::do_close(ctx, fd).unwrap();
        0
    });
}

#[test]
fn killing_a_blocked_reader_interrupts_it() {
    boot(|ctx| {
        let got = Rc::new(RefCell::new(Vec::new()));
        let reader = spawn_reader(ctx, got.clone());
        ctx.kernel().sched().yield_now(ctx);

        proc::proc_kill(ctx, &reader, 42);
        let (pid, status) = proc::do_waitpid(ctx, -1, 0).unwrap();
        assert_eq!(pid, reader.pid());
        // The kill status wins over anything the thread would have returned.
        assert_eq!(status, 42);
        assert!(got.borrow().is_empty());
        0
    });
}

#[test]
fn tty_write_reaches_the_console() {
    boot(|ctx| {
        let fd = vfs::do_open(ctx, Path::new("/dev/tty1"), O_WRONLY).unwrap();
        assert_eq!(vfs::do_write(ctx, fd, b"boot ok\n").unwrap(), 8);
        vfs::do_close(ctx, fd).unwrap();
        let console = ctx.kernel().tty(1).unwrap().console().unwrap();
        assert_eq!(console.contents(), b"boot ok\n");
        0
    });
}
