//! The kernel object and its boot/teardown orchestrator.
//!
//! All global mutable state of the original design (current process/thread,
//! process list, root vnode, caches, device tables) lives in one `Kernel`
//! owned by `boot`; kernel code receives a `KernelCtx` handle instead of
//! reaching for globals. The kernel is single-threaded and cooperative, so
//! none of this is shared across host threads.

use core::cell::{Cell, RefCell};

use alloc::collections::BTreeMap;
use alloc::format;
use alloc::rc::Rc;
use alloc::string::String;
use alloc::vec::Vec;

use crate::drivers::ramdisk::MemDisk;
use crate::drivers::tty::Tty;
use crate::drivers::{self, BlockDev, ByteDev, DevId, DISK_MAJOR};
use crate::error::Errno;
use crate::fs::path::Path;
use crate::fs::s5fs::S5fs;
use crate::fs::vfs_syscall;
use crate::fs::vnode::{self, Vnode, VnodeCache};
use crate::param::{PID_IDLE, PID_INIT};
use crate::proc::{self, KThread, Proc, ProcTable, Sched, ThreadFn};
use crate::vm::mmobj::MmObjId;
use crate::vm::pframe::PframeCache;

pub struct Kernel {
    sched: Sched,
    procs: ProcTable,
    pframes: PframeCache,
    vcache: VnodeCache,
    rootfs: RefCell<Option<Rc<S5fs>>>,
    root_vn: RefCell<Option<Rc<Vnode>>>,
    bytedevs: RefCell<BTreeMap<DevId, Rc<dyn ByteDev>>>,
    blockdevs: RefCell<BTreeMap<DevId, Rc<dyn BlockDev>>>,
    ttys: RefCell<Vec<Rc<Tty>>>,
    next_mmobj: Cell<u64>,
    next_fsid: Cell<u64>,
    io_blocked: Cell<bool>,
}

impl Kernel {
    pub(crate) fn new() -> Self {
        Self {
            sched: Sched::new(),
            procs: ProcTable::new(),
            pframes: PframeCache::new(),
            vcache: VnodeCache::new(),
            rootfs: RefCell::new(None),
            root_vn: RefCell::new(None),
            bytedevs: RefCell::new(BTreeMap::new()),
            blockdevs: RefCell::new(BTreeMap::new()),
            ttys: RefCell::new(Vec::new()),
            next_mmobj: Cell::new(0),
            next_fsid: Cell::new(0),
            io_blocked: Cell::new(false),
        }
    }

    pub fn sched(&self) -> &Sched {
        &self.sched
    }

    pub fn procs(&self) -> &ProcTable {
        &self.procs
    }

    pub fn pframes(&self) -> &PframeCache {
        &self.pframes
    }

    pub(crate) fn vcache(&self) -> &VnodeCache {
        &self.vcache
    }

    /// The root vnode (reference count incremented).
    pub fn root_vnode(&self) -> Rc<Vnode> {
        self.root_vnode_opt().expect("no root filesystem mounted")
    }

    pub(crate) fn root_vnode_opt(&self) -> Option<Rc<Vnode>> {
        self.root_vn.borrow().clone()
    }

    pub fn rootfs(&self) -> Rc<S5fs> {
        self.rootfs.borrow().clone().expect("no root filesystem mounted")
    }

    pub(crate) fn alloc_mmobj_id(&self) -> MmObjId {
        let id = self.next_mmobj.get();
        self.next_mmobj.set(id + 1);
        MmObjId::new(id)
    }

    pub(crate) fn alloc_fsid(&self) -> u64 {
        let id = self.next_fsid.get();
        self.next_fsid.set(id + 1);
        id
    }

    pub fn bytedev_register(&self, id: DevId, dev: Rc<dyn ByteDev>) {
        let prev = self.bytedevs.borrow_mut().insert(id, dev);
        assert!(prev.is_none(), "bytedev {:?} registered twice", id);
    }

    pub fn bytedev_lookup(&self, id: DevId) -> Option<Rc<dyn ByteDev>> {
        self.bytedevs.borrow().get(&id).cloned()
    }

    pub fn blockdev_register(&self, id: DevId, dev: Rc<dyn BlockDev>) {
        let prev = self.blockdevs.borrow_mut().insert(id, dev);
        assert!(prev.is_none(), "blockdev {:?} registered twice", id);
    }

    pub fn blockdev_lookup(&self, id: DevId) -> Option<Rc<dyn BlockDev>> {
        self.blockdevs.borrow().get(&id).cloned()
    }

    pub(crate) fn register_tty(&self, tty: Rc<Tty>) {
        self.ttys.borrow_mut().push(tty);
    }

    /// The `minor`-th terminal, for feeding input and inspecting output.
    pub fn tty(&self, minor: u8) -> Option<Rc<Tty>> {
        self.ttys.borrow().get(minor as usize).cloned()
    }

    pub(crate) fn io_blocked(&self) -> bool {
        self.io_blocked.get()
    }

    pub(crate) fn set_io_blocked(&self, blocked: bool) {
        self.io_blocked.set(blocked);
    }
}

/// Handle kernel code uses to reach the kernel and the current thread.
pub struct KernelCtx<'s> {
    kernel: &'s Kernel,
}

impl<'s> KernelCtx<'s> {
    pub(crate) fn new(kernel: &'s Kernel) -> Self {
        Self { kernel }
    }

    pub fn kernel(&self) -> &'s Kernel {
        self.kernel
    }

    /// The running thread.
    pub fn curthr(&self) -> Rc<KThread> {
        self.kernel.sched.current().expect("no current thread")
    }

    pub(crate) fn curthr_ptr(&self) -> *const KThread {
        Rc::as_ptr(&self.curthr())
    }

    /// The running thread's process.
    pub fn curproc(&self) -> Rc<Proc> {
        self.curthr().proc()
    }
}

/// Boots a kernel over `disk`, runs `init_main` as the init process (pid 1),
/// and returns init's exit status once it has been reaped.
///
/// The caller's context becomes the idle process (pid 0): always runnable,
/// running only when no other thread is ready, and the reaper of init.
pub fn boot(disk: Rc<MemDisk>, init_main: ThreadFn) -> i32 {
    let kernel = Kernel::new();
    let ctx = KernelCtx::new(&kernel);

    // The idle process adopts the context we were entered on.
    let idle = proc::proc_create(&ctx, "idle").expect("cannot create idle");
    assert_eq!(idle.pid(), PID_IDLE);
    let idle_thr = KThread::bootstrap();
    idle_thr.attach(&idle);
    idle.threads.borrow_mut().push(idle_thr.clone());
    kernel.sched.set_current(idle_thr);

    // Devices, then the root filesystem on top of them.
    kernel.blockdev_register(DevId::new(DISK_MAJOR, 0), disk.clone());
    drivers::memdevs::init(&kernel);
    drivers::tty::init(&kernel);

    let fs = S5fs::mount(&ctx, disk).expect("root filesystem will not mount");
    let root = vnode::vget(&ctx, &*fs, S5fs::root_ino()).expect("no root vnode");
    *kernel.rootfs.borrow_mut() = Some(fs);
    *kernel.root_vn.borrow_mut() = Some(root.clone());
    *idle.cwd.borrow_mut() = Some(root);

    setup_devfs(&ctx);

    log::info!("wren: booted, starting init");
    let initp = proc::spawn(&ctx, "init", init_main).expect("cannot create init");
    assert_eq!(initp.pid(), PID_INIT);
    drop(initp);

    let (pid, status) = proc::do_waitpid(&ctx, -1, 0).expect("waitpid on init");
    assert_eq!(pid, PID_INIT);

    shutdown(&ctx);
    log::info!("wren: halted, init status {}", status);
    status
}

/// Creates the device special files. On a disk that already carries them the
/// creations come back EEXIST, which is fine.
fn setup_devfs(ctx: &KernelCtx<'_>) {
    let mkdir = vfs_syscall::do_mkdir(ctx, Path::new("/dev"));
    match mkdir {
        Ok(()) | Err(Errno::EEXIST) => {}
        Err(e) => panic!("mkdir /dev: {}", e),
    }
    let mut nodes: Vec<(String, DevId)> = Vec::new();
    nodes.push(("/dev/null".into(), drivers::NULL_DEVID));
    nodes.push(("/dev/zero".into(), drivers::ZERO_DEVID));
    for minor in 0..ctx.kernel().ttys.borrow().len() as u8 {
        nodes.push((format!("/dev/tty{}", minor), DevId::new(drivers::TTY_MAJOR, minor)));
    }
    for (path, devid) in nodes {
        let r = vfs_syscall::do_mknod(
            ctx,
            Path::from_bytes(path.as_bytes()),
            crate::fs::vnode::VnodeKind::Chr,
            devid,
        );
        match r {
            Ok(()) | Err(Errno::EEXIST) => {}
            Err(e) => panic!("mknod {}: {}", path, e),
        }
    }
}

/// Tears the kernel down after init has been reaped: release the idle
/// process's references, write everything dirty back, and check the
/// reference-counting invariants.
fn shutdown(ctx: &KernelCtx<'_>) {
    let kernel = ctx.kernel();
    let idle = ctx.curproc();
    assert_eq!(idle.pid(), PID_IDLE);

    let cwd = idle.cwd.borrow_mut().take();
    if let Some(cwd) = cwd {
        vnode::vput(ctx, cwd);
    }
    let root = kernel.root_vn.borrow_mut().take();
    if let Some(root) = root {
        vnode::vput(ctx, root);
    }
    let fs = kernel.rootfs.borrow_mut().take().expect("shutdown without rootfs");
    fs.unmount(ctx);

    assert!(kernel.vcache.is_empty(), "vnodes leaked at shutdown");
    assert_eq!(kernel.pframes.nframes(), 0, "page frames leaked at shutdown");
    assert_eq!(kernel.procs.len(), 1, "unreaped processes at shutdown");
}
