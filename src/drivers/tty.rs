//! Terminals and their line discipline.
//!
//! Input arrives one character at a time from the driver callback (an
//! interrupt path on real hardware, the test harness here), is buffered raw,
//! and becomes readable once a line is cooked by newline, carriage return or
//! the end-of-file marker. Readers block on the discipline's wait channel
//! until a canonical line is available; backspace erases the last raw
//! character. Output is processed a character at a time and handed to the
//! driver.

use core::cell::RefCell;

use alloc::rc::Rc;
use alloc::vec::Vec;
use arrayvec::ArrayVec;

use crate::error::KResult;
use crate::intr;
use crate::kernel::{Kernel, KernelCtx};
use crate::lock::KMutex;
use crate::param::{NTTYS, TTY_BUF_SIZE};
use crate::proc::WaitChannel;

use super::{ByteDev, DevId, TTY_MAJOR};

const EOFC: u8 = 0x04;

/// At most one echoed character plus a terminator's worth of slack; echo
/// strings are never heap-allocated.
type Echo = ArrayVec<u8, 2>;

fn is_backspace(c: u8) -> bool {
    c == 0x08 || c == 0x7f
}

fn cooks_line(c: u8) -> bool {
    c == b'\n' || c == b'\r' || c == EOFC
}

/// Sink for characters a terminal emits.
pub trait TtyDriver {
    fn provide_char(&self, c: u8);
}

/// The default driver: a capture buffer standing in for the screen.
pub struct ConsoleBuffer {
    out: RefCell<Vec<u8>>,
}

impl ConsoleBuffer {
    pub fn new() -> ConsoleBuffer {
        ConsoleBuffer {
            out: RefCell::new(Vec::new()),
        }
    }

    /// Everything emitted so far.
    pub fn contents(&self) -> Vec<u8> {
        self.out.borrow().clone()
    }
}

impl TtyDriver for ConsoleBuffer {
    fn provide_char(&self, c: u8) {
        self.out.borrow_mut().push(c);
    }
}

/// Raw input ring. Indices are free-running counters; `rhead..ckdtail` is
/// cooked and readable, `ckdtail..rawtail` is still editable.
struct LdiscBuf {
    buf: [u8; TTY_BUF_SIZE],
    rhead: usize,
    rawtail: usize,
    ckdtail: usize,
}

impl LdiscBuf {
    fn at(&self, idx: usize) -> u8 {
        self.buf[idx % TTY_BUF_SIZE]
    }

    fn set(&mut self, idx: usize, c: u8) {
        self.buf[idx % TTY_BUF_SIZE] = c;
    }

    fn full(&self) -> bool {
        self.rawtail - self.rhead >= TTY_BUF_SIZE
    }

    fn has_line(&self) -> bool {
        self.rhead != self.ckdtail
    }
}

struct Ldisc {
    /// Serializes readers.
    rlock: KMutex<()>,

    /// Readers sleep here until a line is cooked.
    rwaitq: WaitChannel,

    buf: RefCell<LdiscBuf>,
}

impl Ldisc {
    fn new() -> Ldisc {
        Ldisc {
            rlock: KMutex::new("tty", ()),
            rwaitq: WaitChannel::new(),
            buf: RefCell::new(LdiscBuf {
                buf: [0; TTY_BUF_SIZE],
                rhead: 0,
                rawtail: 0,
                ckdtail: 0,
            }),
        }
    }

    /// Buffers a received character, returning what should be echoed and
    /// whether a line was completed.
    fn receive_char(&self, c: u8) -> (Echo, bool) {
        let mut echo = Echo::new();
        let mut cooked = false;
        let mut b = self.buf.borrow_mut();
        if is_backspace(c) {
            if b.rawtail != b.ckdtail {
                b.rawtail -= 1;
                let t = b.rawtail;
                b.set(t, 0);
                echo.push(0x08);
            }
        } else if !b.full() {
            let t = b.rawtail;
            b.set(t, c);
            b.rawtail += 1;
            if c != EOFC {
                echo.push(c);
            }
            if cooks_line(c) {
                b.ckdtail = b.rawtail;
                cooked = true;
            }
        }
        (echo, cooked)
    }

    /// Output processing; only place a translation would go.
    fn process_char(&self, c: u8) -> Echo {
        let mut out = Echo::new();
        out.push(c);
        out
    }

    /// Reads up to one canonical line, blocking until one is cooked. The
    /// end-of-file marker is consumed but not copied out, so a line of just
    /// EOF reads as zero bytes.
    fn read(&self, ctx: &KernelCtx<'_>, buf: &mut [u8]) -> KResult<usize> {
        let guard = self.rlock.lock(ctx);
        loop {
            let ready = {
                let _io = intr::block_io(ctx.kernel());
                self.buf.borrow().has_line()
            };
            if ready {
                break;
            }
            self.rwaitq.sleep_cancellable(ctx)?;
        }
        let _io = intr::block_io(ctx.kernel());
        let mut b = self.buf.borrow_mut();
        let mut n = 0;
        while b.has_line() && n < buf.len() {
            let c = b.at(b.rhead);
            b.rhead += 1;
            if c == EOFC {
                break;
            }
            buf[n] = c;
            n += 1;
            if c == b'\n' || c == b'\r' {
                break;
            }
        }
        drop(b);
        drop(guard);
        Ok(n)
    }
}

pub struct Tty {
    id: DevId,
    driver: Rc<dyn TtyDriver>,
    /// Set when the driver is the built-in capture console.
    console: Option<Rc<ConsoleBuffer>>,
    ldisc: Ldisc,
}

impl Tty {
    pub fn new(id: DevId, driver: Rc<dyn TtyDriver>) -> Tty {
        Tty {
            id,
            driver,
            console: None,
            ldisc: Ldisc::new(),
        }
    }

    fn with_console(id: DevId) -> Tty {
        let console = Rc::new(ConsoleBuffer::new());
        Tty {
            id,
            driver: console.clone(),
            console: Some(console),
            ldisc: Ldisc::new(),
        }
    }

    pub fn id(&self) -> DevId {
        self.id
    }

    /// The capture console, when this tty uses the built-in driver.
    pub fn console(&self) -> Option<Rc<ConsoleBuffer>> {
        self.console.clone()
    }

    /// The driver callback: buffer one received character, wake readers if it
    /// completed a line, and echo it.
    ///
    /// Runs in interrupt context, so it must not sleep; delivery while the
    /// reader has input blocked would be a masked-interrupt violation.
    pub fn receive_char(&self, kernel: &Kernel, c: u8) {
        intr::assert_deliverable(kernel);
        let (echo, cooked) = self.ldisc.receive_char(c);
        if cooked {
            self.ldisc.rwaitq.wakeup_all(kernel);
        }
        for &c in &echo {
            self.driver.provide_char(c);
        }
    }
}

impl ByteDev for Tty {
    fn read(&self, ctx: &KernelCtx<'_>, _offset: usize, buf: &mut [u8]) -> KResult<usize> {
        self.ldisc.read(ctx, buf)
    }

    /// Processes each input byte and emits the result to the driver. Returns
    /// the number of bytes processed.
    fn write(&self, ctx: &KernelCtx<'_>, _offset: usize, buf: &[u8]) -> KResult<usize> {
        let _io = intr::block_io(ctx.kernel());
        for &c in buf {
            for &out in &self.ldisc.process_char(c) {
                self.driver.provide_char(out);
            }
        }
        Ok(buf.len())
    }
}

pub(crate) fn init(kernel: &Kernel) {
    for minor in 0..NTTYS as u8 {
        let id = DevId::new(TTY_MAJOR, minor);
        let tty = Rc::new(Tty::with_console(id));
        kernel.bytedev_register(id, tty.clone());
        kernel.register_tty(tty);
    }
}
