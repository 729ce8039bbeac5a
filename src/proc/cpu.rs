//! Per-CPU state.
//!
//! One record per core: identity, the slot of the process currently running
//! there, the scheduler's saved context, and the interrupt-disable nesting
//! used by the spin locks. A record is touched only by its own core, which
//! is what makes the plain `Cell` fields sound.
//!
//! Bare metal keeps a fixed table indexed by core id. Hosted builds give
//! every OS thread its own record in thread-local storage, since a thread
//! stands in for a core.

use core::cell::{Cell, UnsafeCell};

use crate::arch;
use crate::proc::context::Context;

/// Maximum number of cores
pub const NCPU: usize = 8;

/// One per-core record.
pub struct Cpu {
    id: usize,
    /// Process-table slot currently running on this core.
    current: Cell<Option<usize>>,
    /// Where the dispatch loop's execution is saved while a process runs.
    scheduler: UnsafeCell<Context>,
    /// Interrupt-disable nesting depth.
    ncli: Cell<i32>,
    /// Interrupt-enable state before the outermost disable.
    intena: Cell<bool>,
}

// Each record is only ever touched by its own core (or its own thread on
// hosted builds), never concurrently.
unsafe impl Sync for Cpu {}

impl Cpu {
    pub const fn new(id: usize) -> Self {
        Cpu {
            id,
            current: Cell::new(None),
            scheduler: UnsafeCell::new(Context::zero()),
            ncli: Cell::new(0),
            intena: Cell::new(false),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Pointer to the scheduler context, for the switch primitive.
    pub(crate) fn scheduler_context(&self) -> *mut Context {
        self.scheduler.get()
    }

    pub(crate) fn ncli(&self) -> i32 {
        self.ncli.get()
    }

    pub(crate) fn intena(&self) -> bool {
        self.intena.get()
    }

    pub(crate) fn set_intena(&self, on: bool) {
        self.intena.set(on);
    }
}

// ============================================================================
// Record lookup
// ============================================================================

#[cfg(target_os = "none")]
mod table {
    use super::{Cpu, NCPU};
    use crate::arch;

    static CPUS: [Cpu; NCPU] = {
        let mut i = 0;
        let mut cpus = [const { Cpu::new(0) }; NCPU];
        while i < NCPU {
            cpus[i] = Cpu::new(i);
            i += 1;
        }
        cpus
    };

    /// Run `f` against the calling core's record.
    pub fn with_cpu<R>(f: impl FnOnce(&Cpu) -> R) -> R {
        f(&CPUS[arch::cpu_id() % NCPU])
    }
}

#[cfg(not(target_os = "none"))]
mod table {
    use super::Cpu;
    use crate::arch;

    std::thread_local! {
        static CPU: Cpu = Cpu::new(arch::cpu_id());
    }

    /// Run `f` against the calling thread's simulated core record.
    pub fn with_cpu<R>(f: impl FnOnce(&Cpu) -> R) -> R {
        CPU.with(|c| f(c))
    }
}

pub use table::with_cpu;

// ============================================================================
// Interrupt-disable nesting
// ============================================================================

/// Disable interrupts and push one nesting level. The enable state from
/// before the outermost disable is remembered for [`pop_off`].
pub fn push_off() {
    let was_enabled = arch::intr_enabled();
    arch::intr_off();
    with_cpu(|c| {
        if c.ncli.get() == 0 {
            c.intena.set(was_enabled);
        }
        c.ncli.set(c.ncli.get() + 1);
    });
}

/// Pop one nesting level; re-enable interrupts when the count reaches zero
/// and they were enabled before the outermost disable.
pub fn pop_off() {
    with_cpu(|c| {
        if arch::intr_enabled() {
            panic!("pop_off: interruptible");
        }
        let n = c.ncli.get() - 1;
        if n < 0 {
            panic!("pop_off: unbalanced");
        }
        c.ncli.set(n);
        if n == 0 && c.intena.get() {
            arch::intr_on();
        }
    });
}

// ============================================================================
// Current process
// ============================================================================

/// Slot of the process running on the calling core, if any. Interrupts are
/// held off across the read so the answer cannot go stale mid-lookup.
pub fn current_slot() -> Option<usize> {
    push_off();
    let slot = with_cpu(|c| c.current.get());
    pop_off();
    slot
}

/// Record which slot the calling core is running. Callers hold the process
/// table lock (or are the dispatch loop between processes).
pub(crate) fn set_current(slot: Option<usize>) {
    with_cpu(|c| c.current.set(slot));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_pop_restores_enable_state() {
        assert!(arch::intr_enabled());
        push_off();
        push_off();
        assert!(!arch::intr_enabled());
        pop_off();
        assert!(!arch::intr_enabled());
        pop_off();
        assert!(arch::intr_enabled());
    }

    #[test]
    fn test_disabled_before_push_stays_disabled() {
        std::thread::spawn(|| {
            arch::intr_off();
            push_off();
            pop_off();
            assert!(!arch::intr_enabled());
        })
        .join()
        .unwrap();
    }

    #[test]
    #[should_panic(expected = "unbalanced")]
    fn test_unbalanced_pop_panics() {
        arch::intr_off();
        pop_off();
    }

    #[test]
    fn test_current_slot_tracking() {
        std::thread::spawn(|| {
            assert_eq!(current_slot(), None);
            set_current(Some(3));
            assert_eq!(current_slot(), Some(3));
            set_current(None);
            assert_eq!(current_slot(), None);
        })
        .join()
        .unwrap();
    }
}
