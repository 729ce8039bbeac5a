//! Interrupt-aware spin locks.
//!
//! Acquiring any spin lock disables interrupts on the local core first and
//! keeps them disabled until the last lock is released, so a lock can never
//! be interrupted by a handler that tries to take it again on the same core.
//! The disable depth is counted per CPU; the enable state from before the
//! outermost disable is restored when the count returns to zero.
//!
//! [`SpinLock`] is the raw lock, used where the protected state cannot live
//! inside the lock (the process table). [`SpinMutex`] wraps data and hands
//! out a guard, which is what nearly all callers want.
//!
//! Reentrant acquisition and stray release are kernel bugs and panic.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{fence, AtomicBool, AtomicUsize, Ordering};

use crate::arch::{self, NCALLER_PCS};
use crate::proc::cpu;

/// Owner value meaning "nobody".
const NO_CPU: usize = usize::MAX;

// ============================================================================
// Raw lock
// ============================================================================

/// A raw busy-wait lock recording its owner core and, on bare metal, the
/// call stack that acquired it.
pub struct SpinLock {
    locked: AtomicBool,
    /// Core currently holding the lock.
    cpu: AtomicUsize,
    /// Debug name shown in panics.
    name: &'static str,
    /// Return addresses of the acquiring call stack.
    pcs: [AtomicUsize; NCALLER_PCS],
}

impl SpinLock {
    pub const fn new(name: &'static str) -> Self {
        SpinLock {
            locked: AtomicBool::new(false),
            cpu: AtomicUsize::new(NO_CPU),
            name,
            pcs: [const { AtomicUsize::new(0) }; NCALLER_PCS],
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Spin until the lock is held by this core. Interrupts stay disabled
    /// until the matching [`SpinLock::release`].
    pub fn acquire(&self) {
        cpu::push_off();
        if self.holding() {
            panic!("acquire: {} already held", self.name);
        }
        while self.locked.swap(true, Ordering::Acquire) {
            core::hint::spin_loop();
        }
        // Reads of the protected state must not move above the acquire.
        fence(Ordering::SeqCst);
        self.cpu.store(arch::cpu_id(), Ordering::Relaxed);
        for (slot, pc) in self.pcs.iter().zip(arch::caller_pcs()) {
            slot.store(pc, Ordering::Relaxed);
        }
    }

    /// Release the lock and pop one level of interrupt disable.
    pub fn release(&self) {
        if !self.holding() {
            panic!("release: {} not held", self.name);
        }
        self.cpu.store(NO_CPU, Ordering::Relaxed);
        for slot in &self.pcs {
            slot.store(0, Ordering::Relaxed);
        }
        // Writes to the protected state must not move below the release.
        fence(Ordering::SeqCst);
        self.locked.store(false, Ordering::Release);
        cpu::pop_off();
    }

    /// Is the lock held by the calling core?
    pub fn holding(&self) -> bool {
        cpu::push_off();
        let held = self.locked.load(Ordering::Relaxed)
            && self.cpu.load(Ordering::Relaxed) == arch::cpu_id();
        cpu::pop_off();
        held
    }
}

// ============================================================================
// Data-carrying lock
// ============================================================================

/// A spin lock wrapping the data it protects; access goes through the guard.
pub struct SpinMutex<T> {
    lock: SpinLock,
    data: UnsafeCell<T>,
}

// Exclusive access is enforced by the lock.
unsafe impl<T: Send> Send for SpinMutex<T> {}
unsafe impl<T: Send> Sync for SpinMutex<T> {}

impl<T> SpinMutex<T> {
    pub const fn new(name: &'static str, data: T) -> Self {
        SpinMutex {
            lock: SpinLock::new(name),
            data: UnsafeCell::new(data),
        }
    }

    pub fn lock(&self) -> SpinMutexGuard<'_, T> {
        self.lock.acquire();
        SpinMutexGuard { mutex: self }
    }

    /// Access the data without locking; `&mut self` proves exclusivity.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    pub fn name(&self) -> &'static str {
        self.lock.name()
    }
}

/// RAII guard for [`SpinMutex`]; releases on drop.
pub struct SpinMutexGuard<'a, T> {
    mutex: &'a SpinMutex<T>,
}

impl<'a, T> SpinMutexGuard<'a, T> {
    /// The mutex this guard came from, for release-and-reacquire patterns
    /// (see [`crate::proc::ProcessTable::sleep`]).
    pub fn mutex(&self) -> &'a SpinMutex<T> {
        self.mutex
    }
}

impl<T> Deref for SpinMutexGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> DerefMut for SpinMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T> Drop for SpinMutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.lock.release();
    }
}
