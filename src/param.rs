/// Maximum number of live processes; pids wrap around this bound.
pub const PROC_MAX: usize = 65536;

/// Open files per process.
pub const NFILES: usize = 32;

/// Maximum file path name.
pub const MAXPATHLEN: usize = 1024;

/// Maximum length of one path component (and of an on-disk name).
pub const NAME_LEN: usize = 27;

/// Maximum length of process name.
pub const MAXPROCNAME: usize = 16;

/// Kernel stack size of one thread.
pub const KSTACK_SIZE: usize = 256 * 1024;

/// Bytes per page.
pub const PAGE_SIZE: usize = 4096;
pub const PAGE_SHIFT: usize = 12;

/// User address range. Mappings live in page numbers
/// `[ADDR_TO_PN(USER_MEM_LOW), ADDR_TO_PN(USER_MEM_HIGH))`.
pub const USER_MEM_LOW: usize = 0x0040_0000;
pub const USER_MEM_HIGH: usize = 0xc000_0000;

/// Block size of the block-device layer and of s5fs. The page-frame cache
/// relies on blocks and pages being the same size.
pub const BLOCK_SIZE: usize = PAGE_SIZE;

/// Number of terminals registered at boot.
pub const NTTYS: usize = 2;

/// Size of a terminal's raw input ring.
pub const TTY_BUF_SIZE: usize = 128;

/// Well-known pids.
pub const PID_IDLE: i32 = 0;
pub const PID_INIT: i32 = 1;
