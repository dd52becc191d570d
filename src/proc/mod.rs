//! Processes.
//!
//! A process owns its threads (one, by convention), a fixed table of open
//! files, a current working directory, an address-space map and a page
//! directory, and bookkeeping for its parent and children. A DEAD process is
//! a zombie until its parent reaps it with `do_waitpid`; orphans are adopted
//! by init (pid 1).

use core::cell::{Cell, RefCell};

use alloc::rc::{Rc, Weak};
use alloc::vec::Vec;
use array_macro::array;
use arrayvec::ArrayString;

use crate::error::{Errno, KResult};
use crate::fs::file::{self, File};
use crate::fs::vnode::{self, Vnode};
use crate::kernel::KernelCtx;
use crate::param::{MAXPROCNAME, NFILES, PID_IDLE, PID_INIT, PROC_MAX};
use crate::vm::pagedir::PageDir;
use crate::vm::vmmap::VmMap;

mod fork;
mod kthread;
mod sched;
mod wait_channel;

pub use fork::do_fork;
pub use kthread::{kthread_cancel, kthread_exit, KThread, ThreadFn, ThreadState};
pub use sched::Sched;
pub use wait_channel::WaitChannel;

pub type Pid = i32;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ProcState {
    Running,
    Dead,
}

pub struct Proc {
    pid: Pid,

    name: RefCell<ArrayString<MAXPROCNAME>>,

    state: Cell<ProcState>,

    /// Exit status, meaningful once DEAD.
    status: Cell<i32>,

    pub(crate) parent: RefCell<Option<Weak<Proc>>>,

    pub(crate) children: RefCell<Vec<Rc<Proc>>>,

    pub(crate) threads: RefCell<Vec<Rc<KThread>>>,

    /// Open files.
    files: RefCell<[Option<Rc<File>>; NFILES]>,

    /// Current directory; holds a vnode reference while set.
    pub(crate) cwd: RefCell<Option<Rc<Vnode>>>,

    pub(crate) vmmap: RefCell<VmMap>,

    pub(crate) pagedir: RefCell<PageDir>,

    /// Bottom of the dynamic region; immutable once established.
    pub(crate) start_brk: Cell<usize>,

    /// Current break.
    pub(crate) brk: Cell<usize>,

    /// The parent blocks here waiting for this process to die.
    pub(crate) wait: WaitChannel,
}

impl Proc {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn name(&self) -> ArrayString<MAXPROCNAME> {
        *self.name.borrow()
    }

    pub fn state(&self) -> ProcState {
        self.state.get()
    }

    pub(crate) fn set_state(&self, state: ProcState) {
        self.state.set(state);
    }

    pub fn status(&self) -> i32 {
        self.status.get()
    }

    pub fn parent(&self) -> Option<Rc<Proc>> {
        self.parent.borrow().as_ref().and_then(Weak::upgrade)
    }

    /// The current working directory (reference count incremented).
    pub fn cwd(&self) -> Rc<Vnode> {
        self.cwd.borrow().clone().expect("process has no cwd")
    }

    pub fn fd_get(&self, fd: i32) -> Option<Rc<File>> {
        self.files.borrow().get(fd_index(fd)?)?.clone()
    }

    pub(crate) fn fd_set(&self, fd: i32, file: Rc<File>) {
        let prev = self.files.borrow_mut()[fd as usize].replace(file);
        debug_assert!(prev.is_none());
    }

    pub(crate) fn fd_take(&self, fd: i32) -> Option<Rc<File>> {
        self.files.borrow_mut().get_mut(fd_index(fd)?)?.take()
    }

    /// Lowest free descriptor slot.
    pub(crate) fn get_empty_fd(&self) -> KResult<i32> {
        let files = self.files.borrow();
        for (fd, slot) in files.iter().enumerate() {
            if slot.is_none() {
                return Ok(fd as i32);
            }
        }
        Err(Errno::EMFILE)
    }

    fn reap(&self) {
        for thr in self.threads.borrow_mut().drain(..) {
            assert_eq!(thr.state(), ThreadState::Exited);
        }
        self.pagedir.borrow_mut().destroy();
    }
}

fn fd_index(fd: i32) -> Option<usize> {
    if fd < 0 || fd as usize >= NFILES {
        None
    } else {
        Some(fd as usize)
    }
}

/// The process table.
pub struct ProcTable {
    list: RefCell<Vec<Rc<Proc>>>,
    next_pid: Cell<Pid>,
    init: RefCell<Option<Rc<Proc>>>,
}

impl ProcTable {
    pub(crate) fn new() -> Self {
        Self {
            list: RefCell::new(Vec::new()),
            next_pid: Cell::new(0),
            init: RefCell::new(None),
        }
    }

    /// Next free pid: a linear scan from `next_pid`, wrapping at `PROC_MAX`.
    fn alloc_pid(&self) -> Option<Pid> {
        let list = self.list.borrow();
        let mut pid = self.next_pid.get();
        'retry: loop {
            for p in list.iter() {
                if p.pid == pid {
                    pid = (pid + 1) % PROC_MAX as Pid;
                    if pid == self.next_pid.get() {
                        return None;
                    }
                    continue 'retry;
                }
            }
            self.next_pid.set((pid + 1) % PROC_MAX as Pid);
            return Some(pid);
        }
    }

    pub fn lookup(&self, pid: Pid) -> Option<Rc<Proc>> {
        self.list.borrow().iter().find(|p| p.pid == pid).cloned()
    }

    pub(crate) fn snapshot(&self) -> Vec<Rc<Proc>> {
        self.list.borrow().clone()
    }

    pub(crate) fn init_proc(&self) -> Option<Rc<Proc>> {
        self.init.borrow().clone()
    }

    pub(crate) fn clear_init(&self) {
        *self.init.borrow_mut() = None;
    }

    fn remove(&self, proc: &Rc<Proc>) {
        self.list.borrow_mut().retain(|p| !Rc::ptr_eq(p, proc));
    }

    pub(crate) fn len(&self) -> usize {
        self.list.borrow().len()
    }
}

/// Creates a process with no threads, in the RUNNING state, parented under
/// the current process (if any) and rooted at the filesystem root (if one is
/// mounted yet).
pub fn proc_create(ctx: &KernelCtx<'_>, name: &str) -> KResult<Rc<Proc>> {
    let kernel = ctx.kernel();
    let table = kernel.procs();
    let pid = table.alloc_pid().ok_or(Errno::ENOMEM)?;
    let parent = kernel.sched().current().map(|t| t.proc());

    let mut pname = ArrayString::new();
    for c in name.chars().take(MAXPROCNAME) {
        let _ = pname.try_push(c);
    }

    let proc = Rc::new(Proc {
        pid,
        name: RefCell::new(pname),
        state: Cell::new(ProcState::Running),
        status: Cell::new(0),
        parent: RefCell::new(parent.as_ref().map(Rc::downgrade)),
        children: RefCell::new(Vec::new()),
        threads: RefCell::new(Vec::new()),
        files: RefCell::new(array![_ => None; NFILES]),
        cwd: RefCell::new(kernel.root_vnode_opt()),
        vmmap: RefCell::new(VmMap::new()),
        pagedir: RefCell::new(PageDir::new()),
        start_brk: Cell::new(0),
        brk: Cell::new(0),
        wait: WaitChannel::new(),
    });

    if pid == PID_INIT {
        *table.init.borrow_mut() = Some(proc.clone());
    }
    table.list.borrow_mut().push(proc.clone());
    if let Some(parent) = parent {
        parent.children.borrow_mut().push(proc.clone());
    }
    log::debug!("proc_create: pid {} ({})", pid, name);
    Ok(proc)
}

/// Creates a thread for `proc` running `main`.
pub fn kthread_create(ctx: &KernelCtx<'_>, proc: &Rc<Proc>, main: ThreadFn) -> Rc<KThread> {
    let thr = KThread::new(ctx.kernel(), main);
    thr.attach(proc);
    proc.threads.borrow_mut().push(thr.clone());
    thr
}

/// Creates a process and a runnable thread executing `main`.
pub fn spawn(ctx: &KernelCtx<'_>, name: &str, main: ThreadFn) -> KResult<Rc<Proc>> {
    let proc = proc_create(ctx, name)?;
    let thr = kthread_create(ctx, &proc, main);
    ctx.kernel().sched().make_runnable(&thr);
    Ok(proc)
}

/// Releases everything the process can release from its own context: files,
/// cwd, address space; reparents children to init and wakes the parent.
/// Thread and page-directory teardown wait for `do_waitpid` in the parent.
fn proc_cleanup(ctx: &KernelCtx<'_>, status: i32) {
    let kernel = ctx.kernel();
    let p = ctx.curproc();
    log::debug!("proc_cleanup: pid {} status {}", p.pid, status);
    p.status.set(status);

    if p.pid == PID_INIT {
        assert!(
            p.children.borrow().is_empty(),
            "init exiting with children"
        );
        kernel.procs().clear_init();
    } else if !p.children.borrow().is_empty() {
        let init = kernel.procs().init_proc().expect("orphans but no init");
        let orphans: Vec<_> = p.children.borrow_mut().drain(..).collect();
        for child in orphans {
            *child.parent.borrow_mut() = Some(Rc::downgrade(&init));
            init.children.borrow_mut().push(child);
        }
        // Init may already be blocked in waitpid for a zombie it just
        // inherited.
        init.wait.wakeup_all(kernel);
    }

    kernel.procs().remove(&p);

    if let Some(parent) = p.parent() {
        parent.wait.wakeup_all(kernel);
    }

    for fd in 0..NFILES as i32 {
        if let Some(f) = p.fd_take(fd) {
            file::fput(ctx, f);
        }
    }
    let cwd = p.cwd.borrow_mut().take();
    if let Some(cwd) = cwd {
        vnode::vput(ctx, cwd);
    }
    p.vmmap.borrow_mut().destroy(ctx);
}

/// Called from `kthread_exit`: clean the process up, mark it DEAD and the
/// thread EXITED, and schedule away for the last time.
pub(crate) fn proc_thread_exited(ctx: &KernelCtx<'_>, status: i32) -> ! {
    proc_cleanup(ctx, status);
    {
        let thr = ctx.curthr();
        thr.set_state(ThreadState::Exited);
        thr.proc().set_state(ProcState::Dead);
    }
    ctx.kernel().sched().switch();
    unreachable!("exited thread rescheduled")
}

/// Exits the current process with `status`. With one thread per process this
/// is the thread's exit.
pub fn do_exit(ctx: &KernelCtx<'_>, status: i32) -> ! {
    kthread_exit(ctx, status)
}

/// Reaps a DEAD child and returns its pid and exit status.
///
/// `pid == -1` reaps the first DEAD child; `pid > 0` waits for that child
/// specifically. Blocks (cancellably) on the caller's wait queue while no
/// matching child is dead. `ECHILD` when no child matches the selector.
pub fn do_waitpid(ctx: &KernelCtx<'_>, pid: Pid, options: u32) -> KResult<(Pid, i32)> {
    assert_eq!(options, 0, "waitpid: unsupported options");
    assert!(pid == -1 || pid > 0, "waitpid: unsupported pid selector");
    let p = ctx.curproc();
    if p.children.borrow().is_empty() {
        return Err(Errno::ECHILD);
    }
    loop {
        let mut found = false;
        let mut dead = None;
        for child in p.children.borrow().iter() {
            if pid == -1 || child.pid == pid {
                found = true;
                if child.state() == ProcState::Dead {
                    dead = Some(child.clone());
                    break;
                }
            }
        }
        if let Some(child) = dead {
            p.children.borrow_mut().retain(|c| !Rc::ptr_eq(c, &child));
            child.reap();
            log::debug!("waitpid: pid {} reaped {}", p.pid, child.pid);
            return Ok((child.pid, child.status()));
        }
        if !found {
            return Err(Errno::ECHILD);
        }
        p.wait.sleep_cancellable(ctx)?;
    }
}

/// Kills `proc` with exit status `status`. On the current process this exits
/// and does not return; otherwise every thread of `proc` is cancelled.
pub fn proc_kill(ctx: &KernelCtx<'_>, proc: &Rc<Proc>, status: i32) {
    if Rc::ptr_eq(proc, &ctx.curproc()) {
        do_exit(ctx, status);
    }
    let threads: Vec<_> = proc.threads.borrow().clone();
    for thr in &threads {
        kthread_cancel(ctx, thr, status);
    }
}

/// Kills every process except the current one, init, idle, and idle's direct
/// children; then exits the caller.
pub fn proc_kill_all(ctx: &KernelCtx<'_>) -> ! {
    let cur = ctx.curproc();
    for p in ctx.kernel().procs().snapshot() {
        if Rc::ptr_eq(&p, &cur) || p.pid == PID_IDLE || p.pid == PID_INIT {
            continue;
        }
        if p.parent().map_or(false, |pp| pp.pid == PID_IDLE) {
            continue;
        }
        proc_kill(ctx, &p, 0);
    }
    do_exit(ctx, 0)
}
