//! Sleeping locks.

use core::cell::{Cell, UnsafeCell};
use core::ops::{Deref, DerefMut};

use crate::kernel::{Kernel, KernelCtx};
use crate::proc::{KThread, WaitChannel};

/// Long-term lock for kernel threads. Holding one across blocking operations
/// is allowed (that is the point); acquiring one recursively is a bug.
pub struct KMutex<T> {
    /// Thread holding the lock, null when unlocked. Identity only, never
    /// dereferenced.
    holder: Cell<*const KThread>,

    waitq: WaitChannel,

    /// Name of lock for debugging.
    name: &'static str,

    data: UnsafeCell<T>,
}

pub struct KMutexGuard<'s, T> {
    lock: &'s KMutex<T>,
    kernel: &'s Kernel,
}

impl<T> KMutex<T> {
    pub fn new(name: &'static str, data: T) -> Self {
        Self {
            holder: Cell::new(core::ptr::null()),
            waitq: WaitChannel::new(),
            name,
            data: UnsafeCell::new(data),
        }
    }

    /// Acquires the lock, sleeping while it is held by another thread.
    pub fn lock<'s>(&'s self, ctx: &KernelCtx<'s>) -> KMutexGuard<'s, T> {
        let me = ctx.curthr_ptr();
        assert!(self.holder.get() != me, "kmutex {}: recursive lock", self.name);
        while !self.holder.get().is_null() {
            self.waitq.sleep(ctx);
        }
        self.holder.set(me);
        KMutexGuard {
            lock: self,
            kernel: ctx.kernel(),
        }
    }

    /// Does the current thread hold this lock?
    pub fn holding(&self, ctx: &KernelCtx<'_>) -> bool {
        self.holder.get() == ctx.curthr_ptr()
    }
}

impl<T> KMutexGuard<'_, T> {
    /// The channel other acquirers sleep on; exposed for asserts.
    pub fn name(&self) -> &'static str {
        self.lock.name
    }
}

impl<T> Deref for KMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the mutex is held by the current thread.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for KMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the mutex is held by the current thread.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for KMutexGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.holder.set(core::ptr::null());
        self.lock.waitq.wakeup_one(self.kernel);
    }
}
