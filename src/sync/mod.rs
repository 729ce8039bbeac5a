//! Synchronization primitives.
//!
//! Two layers: interrupt-aware spin locks for short critical sections, and a
//! blocking sleep lock for long operations that must not burn a CPU.

pub mod sleeplock;
pub mod spinlock;

pub use sleeplock::SleepLock;
pub use spinlock::{SpinLock, SpinMutex, SpinMutexGuard};
