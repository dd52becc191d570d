//! Kernel locks.
//!
//! The kernel is single-threaded and cooperative, so the only lock it needs is
//! the long-term sleeping mutex: contended acquirers sleep on the lock's wait
//! channel instead of spinning.

mod sleeplock;

pub use sleeplock::{KMutex, KMutexGuard};
