//! x86-64 System V context switching.

use core::arch::global_asm;

use super::ThreadEntry;

/// Callee-saved register state. Field order matches the offsets in the
/// assembly below.
#[repr(C)]
#[derive(Default)]
pub struct Context {
    rsp: u64,
    rbx: u64,
    rbp: u64,
    r12: u64,
    r13: u64,
    r14: u64,
    r15: u64,
}

global_asm!(
    r#"
    .globl kctx_swtch
    kctx_swtch:
        mov [rdi + 0x00], rsp
        mov [rdi + 0x08], rbx
        mov [rdi + 0x10], rbp
        mov [rdi + 0x18], r12
        mov [rdi + 0x20], r13
        mov [rdi + 0x28], r14
        mov [rdi + 0x30], r15
        mov rsp, [rsi + 0x00]
        mov rbx, [rsi + 0x08]
        mov rbp, [rsi + 0x10]
        mov r12, [rsi + 0x18]
        mov r13, [rsi + 0x20]
        mov r14, [rsi + 0x28]
        mov r15, [rsi + 0x30]
        ret

    .globl kctx_thread_start
    kctx_thread_start:
        mov rdi, r12
        call rbx
        ud2
    "#
);

extern "C" {
    fn kctx_thread_start();
}

impl Context {
    pub const fn zero() -> Self {
        Self {
            rsp: 0,
            rbx: 0,
            rbp: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
        }
    }

    /// Prepares a context so that switching to it enters `entry(arg)` on the
    /// stack topped at `stack_top` (which must be 16-byte aligned).
    ///
    /// The trampoline is reached by `ret`, which pops the address we plant at
    /// the initial `rsp`. Planting it 8 bytes below the top keeps the stack
    /// pointer congruent to the ABI at the trampoline's `call`.
    pub fn setup(&mut self, stack_top: *mut u8, entry: ThreadEntry, arg: *mut u8) {
        debug_assert_eq!(stack_top as usize % 16, 0);
        let sp = unsafe { stack_top.sub(8) } as *mut u64;
        unsafe { sp.write(kctx_thread_start as usize as u64) };
        *self = Self::zero();
        self.rsp = sp as u64;
        self.rbx = entry as usize as u64;
        self.r12 = arg as u64;
    }
}
