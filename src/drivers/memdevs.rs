//! The memory byte devices, `null` and `zero`.

use alloc::rc::Rc;

use crate::error::KResult;
use crate::kernel::{Kernel, KernelCtx};
use crate::vm::mmobj::{MmObj, RcMmObj};

use super::{ByteDev, NULL_DEVID, ZERO_DEVID};

struct NullDev;

struct ZeroDev;

impl ByteDev for NullDev {
    /// Reads from null see end-of-file.
    fn read(&self, _ctx: &KernelCtx<'_>, _offset: usize, _buf: &mut [u8]) -> KResult<usize> {
        Ok(0)
    }

    /// Writes to null succeed in full.
    fn write(&self, _ctx: &KernelCtx<'_>, _offset: usize, buf: &[u8]) -> KResult<usize> {
        Ok(buf.len())
    }
}

impl ByteDev for ZeroDev {
    fn read(&self, _ctx: &KernelCtx<'_>, _offset: usize, buf: &mut [u8]) -> KResult<usize> {
        for b in buf.iter_mut() {
            *b = 0;
        }
        Ok(buf.len())
    }

    fn write(&self, _ctx: &KernelCtx<'_>, _offset: usize, buf: &[u8]) -> KResult<usize> {
        Ok(buf.len())
    }

    /// Mapping zero is an anonymous mapping.
    fn mmap(&self, ctx: &KernelCtx<'_>) -> KResult<RcMmObj> {
        Ok(MmObj::new_anon(ctx.kernel()))
    }
}

pub(crate) fn init(kernel: &Kernel) {
    kernel.bytedev_register(NULL_DEVID, Rc::new(NullDev));
    kernel.bytedev_register(ZERO_DEVID, Rc::new(ZeroDev));
}
