//! The cooperative scheduler.
//!
//! Exactly one thread runs at a time; switches happen only inside `switch`,
//! which the blocking primitives call after queueing the current thread
//! somewhere (a wait channel, the run queue, or nowhere when exiting). Control
//! transfers directly from thread to thread; when nothing is runnable and the
//! current thread cannot continue, the kernel is deadlocked and says so.

use core::cell::RefCell;

use alloc::collections::VecDeque;
use alloc::rc::Rc;

use crate::arch;
use crate::kernel::KernelCtx;

use super::{KThread, ThreadState};

pub struct Sched {
    runq: RefCell<VecDeque<Rc<KThread>>>,
    curthr: RefCell<Option<Rc<KThread>>>,
}

impl Sched {
    pub(crate) fn new() -> Self {
        Self {
            runq: RefCell::new(VecDeque::new()),
            curthr: RefCell::new(None),
        }
    }

    /// The running thread, if a thread context has been entered yet.
    pub fn current(&self) -> Option<Rc<KThread>> {
        self.curthr.borrow().clone()
    }

    pub(crate) fn set_current(&self, thr: Rc<KThread>) {
        let prev = self.curthr.borrow_mut().replace(thr);
        assert!(prev.is_none());
    }

    /// Marks `thr` runnable and queues it.
    pub fn make_runnable(&self, thr: &Rc<KThread>) {
        debug_assert_ne!(thr.state(), ThreadState::Exited);
        thr.set_state(ThreadState::Run);
        self.runq.borrow_mut().push_back(thr.clone());
    }

    /// Switches away from the current thread to the next runnable one.
    ///
    /// The caller is responsible for the current thread's bookkeeping: it must
    /// already be queued on a wait channel or the run queue, or be EXITED.
    /// Returns when the thread is scheduled again (never, for EXITED).
    pub fn switch(&self) {
        let next = self
            .runq
            .borrow_mut()
            .pop_front()
            .expect("deadlock: no runnable threads");
        let prev = self
            .curthr
            .borrow_mut()
            .replace(next.clone())
            .expect("switch without a current thread");
        let old = prev.context_ptr();
        let new = next.context_ptr();
        // An exiting thread abandons its stack here, so nothing owned may be
        // held past this point.
        drop(prev);
        drop(next);
        // SAFETY: both contexts belong to live threads kept alive by their
        // processes; only one thread runs at a time.
        unsafe { arch::swtch(old, new) };
    }

    /// Voluntarily gives up the processor to any other runnable thread.
    pub fn yield_now(&self, ctx: &KernelCtx<'_>) {
        if self.runq.borrow().is_empty() {
            return;
        }
        let thr = ctx.curthr();
        self.make_runnable(&thr);
        drop(thr);
        self.switch();
    }
}
