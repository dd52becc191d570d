//! The vfs syscall surface: open/read/write, descriptors, directories,
//! links, renames, and the error contract.

mod common;

use common::boot;
use wren_kernel::fs::file::{Whence, O_APPEND, O_CREAT, O_RDONLY, O_RDWR, O_WRONLY};
use wren_kernel::fs::path::Path;
use wren_kernel::fs::vfs_syscall as vfs;
use wren_kernel::fs::vnode::VnodeKind;
use wren_kernel::param::NFILES;
use wren_kernel::Errno;

#[test]
fn write_then_read_back() {
    boot(|ctx| {
        let fd = vfs::do_open(ctx, Path::new("/a"), O_RDWR | O_CREAT).unwrap();
        assert_eq!(vfs::do_write(ctx, fd, b"hello, wren").unwrap(), 11);
        vfs::do_close(ctx, fd).unwrap();

        let fd = vfs::do_open(ctx, Path::new("/a"), O_RDONLY).unwrap();
        let mut buf = [0u8; 32];
        assert_eq!(vfs::do_read(ctx, fd, &mut buf).unwrap(), 11);
        assert_eq!(&buf[..11], b"hello, wren");
        // Reads at end of file return zero bytes.
        assert_eq!(vfs::do_read(ctx, fd, &mut buf).unwrap(), 0);
        vfs::do_close(ctx, fd).unwrap();
        0
    });
}

#[test]
fn directory_full_cycle() {
    boot(|ctx| {
        vfs::do_mkdir(ctx, Path::new("/d")).unwrap();
        vfs::do_link(ctx, Path::new("/dev/null"), Path::new("/d/x")).unwrap();
        vfs::do_unlink(ctx, Path::new("/d/x")).unwrap();
        vfs::do_rmdir(ctx, Path::new("/d")).unwrap();
        assert_eq!(vfs::do_stat(ctx, Path::new("/d")).unwrap_err(), Errno::ENOENT);
        0
    });
}

#[test]
fn dup2_shares_the_file() {
    boot(|ctx| {
        let z = vfs::do_open(ctx, Path::new("/dev/zero"), O_RDONLY).unwrap();
        let n = vfs::do_open(ctx, Path::new("/dev/null"), O_RDONLY).unwrap();
        assert_eq!(vfs::do_dup2(ctx, z, n).unwrap(), n);
        let mut byte = [0xffu8];
        assert_eq!(vfs::do_read(ctx, n, &mut byte).unwrap(), 1);
        assert_eq!(byte[0], 0);
        vfs::do_close(ctx, z).unwrap();
        // The duplicate survives closing the original.
        assert_eq!(vfs::do_read(ctx, n, &mut byte).unwrap(), 1);
        vfs::do_close(ctx, n).unwrap();
        // dup2 onto itself is a no-op.
        let z = vfs::do_open(ctx, Path::new("/dev/zero"), O_RDONLY).unwrap();
        assert_eq!(vfs::do_dup2(ctx, z, z).unwrap(), z);
        vfs::do_close(ctx, z).unwrap();
        0
    });
}

#[test]
fn dup_shares_the_offset() {
    boot(|ctx| {
        let fd = vfs::do_open(ctx, Path::new("/f"), O_RDWR | O_CREAT).unwrap();
        vfs::do_write(ctx, fd, b"abcdef").unwrap();
        let dup = vfs::do_dup(ctx, fd).unwrap();
        vfs::do_lseek(ctx, fd, 1, Whence::Set).unwrap();
        let mut buf = [0u8; 2];
        assert_eq!(vfs::do_read(ctx, dup, &mut buf).unwrap(), 2);
        assert_eq!(&buf, b"bc");
        vfs::do_close(ctx, fd).unwrap();
        vfs::do_close(ctx, dup).unwrap();
        0
    });
}

#[test]
fn unlink_compacts_the_directory() {
    boot(|ctx| {
        vfs::do_mkdir(ctx, Path::new("/d")).unwrap();
        for name in ["/d/a", "/d/b", "/d/c"] {
            let fd = vfs::do_open(ctx, Path::new(name), O_WRONLY | O_CREAT).unwrap();
            vfs::do_close(ctx, fd).unwrap();
        }
        vfs::do_unlink(ctx, Path::new("/d/b")).unwrap();

        let fd = vfs::do_open(ctx, Path::new("/d"), O_RDONLY).unwrap();
        let mut names = Vec::new();
        while let Some(d) = vfs::do_getdent(ctx, fd).unwrap() {
            names.push(String::from_utf8(d.name().to_vec()).unwrap());
        }
        vfs::do_close(ctx, fd).unwrap();
        names.sort();
        assert_eq!(names, [".", "..", "a", "c"]);
        0
    });
}

#[test]
fn rename_moves_the_name() {
    boot(|ctx| {
        let fd = vfs::do_open(ctx, Path::new("/old"), O_WRONLY | O_CREAT).unwrap();
        vfs::do_write(ctx, fd, b"data").unwrap();
        vfs::do_close(ctx, fd).unwrap();
        vfs::do_rename(ctx, Path::new("/old"), Path::new("/new")).unwrap();
        assert_eq!(
            vfs::do_stat(ctx, Path::new("/old")).unwrap_err(),
            Errno::ENOENT
        );
        let st = vfs::do_stat(ctx, Path::new("/new")).unwrap();
        assert_eq!(st.size, 4);
        assert_eq!(st.nlink, 1);
        // Renaming onto an existing name fails and leaves the old name.
        vfs::do_mkdir(ctx, Path::new("/exists")).unwrap();
        let fd = vfs::do_open(ctx, Path::new("/exists2"), O_WRONLY | O_CREAT).unwrap();
        vfs::do_close(ctx, fd).unwrap();
        assert_eq!(
            vfs::do_rename(ctx, Path::new("/new"), Path::new("/exists2")).unwrap_err(),
            Errno::EEXIST
        );
        assert!(vfs::do_stat(ctx, Path::new("/new")).is_ok());
        0
    });
}

#[test]
fn append_mode_seeks_to_end() {
    boot(|ctx| {
        let fd = vfs::do_open(ctx, Path::new("/log"), O_WRONLY | O_CREAT).unwrap();
        vfs::do_write(ctx, fd, b"one").unwrap();
        vfs::do_close(ctx, fd).unwrap();

        let fd = vfs::do_open(ctx, Path::new("/log"), O_WRONLY | O_APPEND).unwrap();
        vfs::do_write(ctx, fd, b"two").unwrap();
        vfs::do_close(ctx, fd).unwrap();

        let st = vfs::do_stat(ctx, Path::new("/log")).unwrap();
        assert_eq!(st.size, 6);
        0
    });
}

#[test]
fn chdir_changes_relative_resolution() {
    boot(|ctx| {
        vfs::do_mkdir(ctx, Path::new("/d")).unwrap();
        vfs::do_chdir(ctx, Path::new("/d")).unwrap();
        let fd = vfs::do_open(ctx, Path::new("f"), O_WRONLY | O_CREAT).unwrap();
        vfs::do_close(ctx, fd).unwrap();
        assert!(vfs::do_stat(ctx, Path::new("/d/f")).is_ok());
        assert!(vfs::do_stat(ctx, Path::new("../d/f")).is_ok());
        assert_eq!(
            vfs::do_chdir(ctx, Path::new("/d/f")).unwrap_err(),
            Errno::ENOTDIR
        );
        0
    });
}

#[test]
fn error_contract() {
    boot(|ctx| {
        // EBADF
        let mut buf = [0u8; 1];
        assert_eq!(vfs::do_read(ctx, 11, &mut buf).unwrap_err(), Errno::EBADF);
        assert_eq!(vfs::do_close(ctx, 11).unwrap_err(), Errno::EBADF);
        assert_eq!(vfs::do_write(ctx, -1, b"x").unwrap_err(), Errno::EBADF);

        // Reading a directory is EISDIR; writing one cannot even be opened.
        let fd = vfs::do_open(ctx, Path::new("/"), O_RDONLY).unwrap();
        assert_eq!(vfs::do_read(ctx, fd, &mut buf).unwrap_err(), Errno::EISDIR);
        vfs::do_close(ctx, fd).unwrap();
        assert_eq!(
            vfs::do_open(ctx, Path::new("/"), O_RDWR).unwrap_err(),
            Errno::EISDIR
        );

        // Write without write mode.
        let fd = vfs::do_open(ctx, Path::new("/dev/zero"), O_RDONLY).unwrap();
        assert_eq!(vfs::do_write(ctx, fd, b"x").unwrap_err(), Errno::EBADF);
        vfs::do_close(ctx, fd).unwrap();

        // Path errors.
        let fd = vfs::do_open(ctx, Path::new("/plain"), O_WRONLY | O_CREAT).unwrap();
        vfs::do_close(ctx, fd).unwrap();
        assert_eq!(
            vfs::do_stat(ctx, Path::new("/plain/sub")).unwrap_err(),
            Errno::ENOTDIR
        );
        assert_eq!(
            vfs::do_open(ctx, Path::new("/missing"), O_RDONLY).unwrap_err(),
            Errno::ENOENT
        );
        let long = format!("/{}", "n".repeat(28));
        assert_eq!(
            vfs::do_open(ctx, Path::from_bytes(long.as_bytes()), O_RDONLY).unwrap_err(),
            Errno::ENAMETOOLONG
        );

        // Directories.
        vfs::do_mkdir(ctx, Path::new("/dir")).unwrap();
        assert_eq!(vfs::do_mkdir(ctx, Path::new("/dir")).unwrap_err(), Errno::EEXIST);
        assert_eq!(vfs::do_unlink(ctx, Path::new("/dir")).unwrap_err(), Errno::EPERM);
        assert_eq!(
            vfs::do_rmdir(ctx, Path::new("/dir/.")).unwrap_err(),
            Errno::EINVAL
        );
        assert_eq!(
            vfs::do_rmdir(ctx, Path::new("/dir/..")).unwrap_err(),
            Errno::ENOTEMPTY
        );
        let fd = vfs::do_open(ctx, Path::new("/dir/f"), O_WRONLY | O_CREAT).unwrap();
        vfs::do_close(ctx, fd).unwrap();
        assert_eq!(vfs::do_rmdir(ctx, Path::new("/dir")).unwrap_err(), Errno::ENOTEMPTY);
        vfs::do_unlink(ctx, Path::new("/dir/f")).unwrap();
        vfs::do_rmdir(ctx, Path::new("/dir")).unwrap();

        // Hard links to directories are refused.
        assert_eq!(
            vfs::do_link(ctx, Path::new("/"), Path::new("/rootlink")).unwrap_err(),
            Errno::EPERM
        );

        // mknod wants a device kind.
        assert_eq!(
            vfs::do_mknod(
                ctx,
                Path::new("/notadev"),
                VnodeKind::Regular,
                wren_kernel::drivers::NULL_DEVID
            )
            .unwrap_err(),
            Errno::EINVAL
        );

        // lseek.
        let fd = vfs::do_open(ctx, Path::new("/plain"), O_RDONLY).unwrap();
        assert_eq!(
            vfs::do_lseek(ctx, fd, -1, Whence::Set).unwrap_err(),
            Errno::EINVAL
        );
        assert_eq!(vfs::do_lseek(ctx, fd, 0, Whence::End).unwrap(), 0);
        // getdent on a non-directory.
        assert_eq!(vfs::do_getdent(ctx, fd).unwrap_err(), Errno::ENOTDIR);
        vfs::do_close(ctx, fd).unwrap();
        vfs::do_unlink(ctx, Path::new("/plain")).unwrap();
        0
    });
}

#[test]
fn descriptor_table_fills_up() {
    boot(|ctx| {
        let mut fds = Vec::new();
        loop {
            match vfs::do_open(ctx, Path::new("/dev/null"), O_RDONLY) {
                Ok(fd) => fds.push(fd),
                Err(e) => {
                    assert_eq!(e, Errno::EMFILE);
                    break;
                }
            }
        }
        assert_eq!(fds.len(), NFILES);
        for fd in fds {
            vfs::do_close(ctx, fd).unwrap();
        }
        0
    });
}

#[test]
fn link_counts() {
    boot(|ctx| {
        let fd = vfs::do_open(ctx, Path::new("/a"), O_WRONLY | O_CREAT).unwrap();
        vfs::do_close(ctx, fd).unwrap();
        vfs::do_link(ctx, Path::new("/a"), Path::new("/b")).unwrap();
        assert_eq!(vfs::do_stat(ctx, Path::new("/a")).unwrap().nlink, 2);
        let ino_a = vfs::do_stat(ctx, Path::new("/a")).unwrap().ino;
        assert_eq!(vfs::do_stat(ctx, Path::new("/b")).unwrap().ino, ino_a);
        vfs::do_unlink(ctx, Path::new("/a")).unwrap();
        assert_eq!(vfs::do_stat(ctx, Path::new("/b")).unwrap().nlink, 1);
        vfs::do_unlink(ctx, Path::new("/b")).unwrap();
        0
    });
}
