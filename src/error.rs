//! Kernel error codes.
//!
//! Every fallible kernel operation returns `KResult<T>`; the variants carry
//! the canonical errno numbers so the syscall boundary can hand userland a
//! `-errno` without translation.

use core::fmt;

/// The canonical error numbers the kernel can produce.
#[repr(i32)]
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Errno {
    /// Operation not permitted.
    EPERM = 1,
    /// No such file or directory.
    ENOENT = 2,
    /// Interrupted call (thread was cancelled at a cancellable sleep).
    EINTR = 4,
    /// Bad file descriptor.
    EBADF = 9,
    /// No child processes.
    ECHILD = 10,
    /// Out of memory (or address space).
    ENOMEM = 12,
    /// Permission denied.
    EACCES = 13,
    /// Bad address. Used to terminate a faulting process, never returned.
    EFAULT = 14,
    /// File exists.
    EEXIST = 17,
    /// Not a directory.
    ENOTDIR = 20,
    /// Is a directory.
    EISDIR = 21,
    /// Invalid argument.
    EINVAL = 22,
    /// Too many open files.
    EMFILE = 24,
    /// File too large.
    EFBIG = 27,
    /// No space left on device.
    ENOSPC = 28,
    /// Too many links.
    EMLINK = 31,
    /// File name too long.
    ENAMETOOLONG = 36,
    /// Directory not empty.
    ENOTEMPTY = 39,
}

pub type KResult<T> = Result<T, Errno>;

impl Errno {
    /// The `-errno` value a syscall returns for this error.
    pub fn as_neg(self) -> i32 {
        -(self as i32)
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_numbers() {
        assert_eq!(Errno::EPERM as i32, 1);
        assert_eq!(Errno::ENOENT as i32, 2);
        assert_eq!(Errno::ECHILD as i32, 10);
        assert_eq!(Errno::ENAMETOOLONG as i32, 36);
        assert_eq!(Errno::ENOTEMPTY.as_neg(), -39);
    }
}
