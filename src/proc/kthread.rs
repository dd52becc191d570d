//! Kernel threads.
//!
//! A thread owns a kernel stack and a saved context, and belongs to exactly
//! one process. The bootstrap thread (the idle process's thread) borrows the
//! host stack the kernel was entered on and therefore owns no stack of its
//! own.

use core::cell::{Cell, UnsafeCell};
use core::ptr::NonNull;

use alloc::alloc::{alloc, dealloc, Layout};
use alloc::boxed::Box;
use alloc::rc::{Rc, Weak};

use crate::arch::Context;
use crate::kernel::{Kernel, KernelCtx};
use crate::param::KSTACK_SIZE;
use crate::proc::{Proc, WaitChannel};

/// Entry function of a kernel thread; the returned value becomes the exit
/// status unless the thread was cancelled first.
pub type ThreadFn = Box<dyn FnOnce(&KernelCtx<'_>) -> i32>;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ThreadState {
    /// Created, never run.
    New,
    /// Running or on the run queue.
    Run,
    Sleep,
    SleepCancellable,
    /// Terminal.
    Exited,
}

/// A thread's kernel stack.
struct Kstack {
    ptr: NonNull<u8>,
}

impl Kstack {
    fn layout() -> Layout {
        Layout::from_size_align(KSTACK_SIZE, 16).unwrap()
    }

    fn new() -> Kstack {
        let ptr = unsafe { alloc(Self::layout()) };
        let ptr = NonNull::new(ptr).expect("kstack: out of memory");
        Kstack { ptr }
    }

    fn top(&self) -> *mut u8 {
        unsafe { self.ptr.as_ptr().add(KSTACK_SIZE) }
    }
}

impl Drop for Kstack {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr.as_ptr(), Self::layout()) };
    }
}

pub struct KThread {
    /// `None` only for the bootstrap (idle) thread.
    stack: Option<Kstack>,

    context: UnsafeCell<Context>,

    state: Cell<ThreadState>,

    cancelled: Cell<bool>,

    /// Exit status planted by `kthread_cancel`.
    retval: Cell<i32>,

    /// Channel this thread sleeps on, if any.
    wchan: Cell<Option<NonNull<WaitChannel>>>,

    proc: Cell<Option<Weak<Proc>>>,
}

struct Payload {
    kernel: NonNull<Kernel>,
    main: ThreadFn,
}

extern "C" fn thread_start(arg: *mut u8) -> ! {
    // SAFETY: `arg` is the Box::into_raw'd payload planted by KThread::new,
    // entered exactly once, and the kernel outlives every thread it runs.
    let payload = unsafe { Box::from_raw(arg as *mut Payload) };
    let kernel = unsafe { &*payload.kernel.as_ptr() };
    let main = payload.main;
    let status = {
        let ctx = KernelCtx::new(kernel);
        main(&ctx)
    };
    let ctx = KernelCtx::new(kernel);
    kthread_exit(&ctx, status)
}

impl KThread {
    /// Allocates a thread with a fresh stack set up to run `main`.
    pub(crate) fn new(kernel: &Kernel, main: ThreadFn) -> Rc<KThread> {
        let stack = Kstack::new();
        let payload = Box::into_raw(Box::new(Payload {
            kernel: NonNull::from(kernel),
            main,
        }));
        let mut context = Context::default();
        context.setup(stack.top(), thread_start, payload as *mut u8);
        Rc::new(KThread {
            stack: Some(stack),
            context: UnsafeCell::new(context),
            state: Cell::new(ThreadState::New),
            cancelled: Cell::new(false),
            retval: Cell::new(0),
            wchan: Cell::new(None),
            proc: Cell::new(None),
        })
    }

    /// The thread adopting the context the kernel booted on.
    pub(crate) fn bootstrap() -> Rc<KThread> {
        Rc::new(KThread {
            stack: None,
            context: UnsafeCell::new(Context::default()),
            state: Cell::new(ThreadState::Run),
            cancelled: Cell::new(false),
            retval: Cell::new(0),
            wchan: Cell::new(None),
            proc: Cell::new(None),
        })
    }

    pub fn state(&self) -> ThreadState {
        self.state.get()
    }

    pub(crate) fn set_state(&self, state: ThreadState) {
        debug_assert_ne!(self.state.get(), ThreadState::Exited);
        self.state.set(state);
    }

    pub fn cancelled(&self) -> bool {
        self.cancelled.get()
    }

    pub fn retval(&self) -> i32 {
        self.retval.get()
    }

    pub(crate) fn set_wchan(&self, wchan: Option<NonNull<WaitChannel>>) {
        self.wchan.set(wchan);
    }

    pub(crate) fn wchan(&self) -> Option<NonNull<WaitChannel>> {
        self.wchan.get()
    }

    pub(crate) fn context_ptr(&self) -> *mut Context {
        self.context.get()
    }

    pub(crate) fn attach(&self, proc: &Rc<Proc>) {
        self.proc.set(Some(Rc::downgrade(proc)));
    }

    /// The owning process.
    pub fn proc(&self) -> Rc<Proc> {
        let weak = self.proc.take().expect("thread has no process");
        let proc = weak.upgrade().expect("thread outlived its process");
        self.proc.set(Some(weak));
        proc
    }
}

/// Exits the current thread, and with it the current process. Never returns.
pub fn kthread_exit(ctx: &KernelCtx<'_>, status: i32) -> ! {
    let status = {
        let thr = ctx.curthr();
        debug_assert!(thr.wchan().is_none());
        if thr.cancelled() {
            thr.retval()
        } else {
            status
        }
    };
    super::proc_thread_exited(ctx, status)
}

/// Cancels `thr` with exit status `status`.
///
/// On the current thread this is an exit. Otherwise the cancelled and retval
/// slots are set; a cancellable sleeper is additionally woken, while a
/// non-cancellable sleeper (or a runnable thread) observes the flag at its
/// next cancellable sleep.
pub fn kthread_cancel(ctx: &KernelCtx<'_>, thr: &Rc<KThread>, status: i32) {
    if Rc::ptr_eq(thr, &ctx.curthr()) {
        kthread_exit(ctx, status);
    }
    thr.cancelled.set(true);
    thr.retval.set(status);
    if thr.state() == ThreadState::SleepCancellable {
        let wchan = thr.wchan().expect("cancellable sleeper has no channel");
        // SAFETY: a sleeping thread's channel is owned by a structure that
        // outlives the sleep (kernel, process, frame, or lock).
        unsafe { wchan.as_ref() }.remove(thr);
        ctx.kernel().sched().make_runnable(thr);
    }
}
