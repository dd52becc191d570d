//! Architecture-specific context switching.
//!
//! A `Context` holds the callee-saved register state of a suspended thread.
//! `swtch` saves the current state into `old` and resumes `new`; a freshly
//! set-up context "resumes" into the thread-start trampoline, which calls the
//! entry function with its argument. Exactly one thread runs at a time, so
//! these are only ever called from the scheduler with both contexts valid.

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        mod x86_64;
        pub use self::x86_64::Context;
    } else if #[cfg(target_arch = "aarch64")] {
        mod aarch64;
        pub use self::aarch64::Context;
    } else {
        compile_error!("wren: unsupported host architecture");
    }
}

/// Entry point of a new thread. Must not return.
pub type ThreadEntry = extern "C" fn(arg: *mut u8) -> !;

/// Saves the current callee-saved state into `old` and resumes `new`.
///
/// # Safety
///
/// `old` and `new` must point to valid contexts; `new` must have been filled
/// either by a previous `swtch` or by `Context::setup` over a live stack.
pub unsafe fn swtch(old: *mut Context, new: *mut Context) {
    unsafe { kctx_swtch(old, new) };
}

extern "C" {
    fn kctx_swtch(old: *mut Context, new: *mut Context);
}
