use core::cell::RefCell;
use core::ptr::NonNull;

use alloc::collections::VecDeque;
use alloc::rc::Rc;

use crate::error::{Errno, KResult};
use crate::kernel::{Kernel, KernelCtx};

use super::{KThread, ThreadState};

/// A FIFO of blocked threads.
///
/// Threads queue themselves with `sleep`/`sleep_cancellable` and are moved
/// back to the run queue by `wakeup_one`/`wakeup_all`, or by cancellation if
/// the sleep was cancellable. A thread is linked into at most one channel at
/// a time; the back-pointer in `KThread::wchan` lets cancellation find it.
pub struct WaitChannel {
    q: RefCell<VecDeque<Rc<KThread>>>,
}

impl WaitChannel {
    pub fn new() -> Self {
        Self {
            q: RefCell::new(VecDeque::new()),
        }
    }

    fn enqueue(&self, ctx: &KernelCtx<'_>, state: ThreadState) {
        let thr = ctx.curthr();
        thr.set_state(state);
        thr.set_wchan(Some(NonNull::from(self)));
        self.q.borrow_mut().push_back(thr);
    }

    /// Blocks the current thread until a wakeup. Not interruptible by
    /// cancellation; the cancelled flag is delivered at the next cancellable
    /// sleep instead.
    pub fn sleep(&self, ctx: &KernelCtx<'_>) {
        self.enqueue(ctx, ThreadState::Sleep);
        ctx.kernel().sched().switch();
    }

    /// Blocks the current thread until a wakeup or a cancellation. Returns
    /// `Err(EINTR)` if the thread was (or already had been) cancelled.
    pub fn sleep_cancellable(&self, ctx: &KernelCtx<'_>) -> KResult<()> {
        if ctx.curthr().cancelled() {
            return Err(Errno::EINTR);
        }
        self.enqueue(ctx, ThreadState::SleepCancellable);
        ctx.kernel().sched().switch();
        if ctx.curthr().cancelled() {
            return Err(Errno::EINTR);
        }
        Ok(())
    }

    /// Wakes the thread at the head of the queue, if any.
    pub fn wakeup_one(&self, kernel: &Kernel) {
        if let Some(thr) = self.q.borrow_mut().pop_front() {
            thr.set_wchan(None);
            kernel.sched().make_runnable(&thr);
        }
    }

    /// Wakes every thread on the queue, preserving FIFO order.
    pub fn wakeup_all(&self, kernel: &Kernel) {
        while let Some(thr) = self.q.borrow_mut().pop_front() {
            thr.set_wchan(None);
            kernel.sched().make_runnable(&thr);
        }
    }

    /// Unlinks `thr` from this channel. Used by cancellation; `thr` must be
    /// sleeping here.
    pub(crate) fn remove(&self, thr: &Rc<KThread>) {
        let mut q = self.q.borrow_mut();
        let pos = q
            .iter()
            .position(|t| Rc::ptr_eq(t, thr))
            .expect("wait channel: cancelled thread not queued");
        let _ = q.remove(pos);
        thr.set_wchan(None);
    }
}
