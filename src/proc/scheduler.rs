//! Per-CPU scheduling: the dispatch loop, voluntary yield, and the
//! sleep/wakeup rendezvous.
//!
//! Control never transfers process-to-process: a process hands the CPU back
//! to its core's dispatch loop, which picks the next RUNNABLE slot. The
//! hand-off happens with the table lock held on both sides of the switch,
//! which is exactly what makes sleep atomic: a process marks itself
//! SLEEPING and switches away under the same lock acquisition that a waker
//! must take to flip it back, so no wakeup can fall between the decision to
//! sleep and the switch.
//!
//! The hosted rendition has no register switching. [`suspend`] instead
//! releases the table lock and parks the calling OS thread until the slot's
//! state mirror turns RUNNABLE, then re-marks it RUNNING under the lock.
//! The blocking semantics are identical; a missed wakeup deadlocks the test
//! that caused it.

use crate::arch;
use crate::proc::cpu;
use crate::proc::{ProcState, ProcessTable, NPROC};
use crate::sync::SpinMutexGuard;
use crate::types::Channel;

impl ProcessTable {
    /// Sleep on `chan` with the table lock held; returns with it held once
    /// woken. The caller re-checks its condition: wakeups are collective.
    pub(crate) fn sleep_on_table(&self, slot: usize, chan: Channel) {
        if !self.lock.holding() {
            panic!("sleep_on_table: table lock not held");
        }
        self.slots[slot].set_chan(chan.0);
        self.slots[slot].set_state(ProcState::Sleeping);
        suspend(self, slot);
        self.slots[slot].set_chan(0);
    }

    /// Atomically release `guard` and sleep on `chan`; the guard's lock is
    /// re-acquired before returning. Callers loop: a wakeup means the
    /// condition may have changed, not that it has.
    pub fn sleep<'a, T>(
        &self,
        chan: Channel,
        guard: SpinMutexGuard<'a, T>,
    ) -> SpinMutexGuard<'a, T> {
        let cur = match self.current() {
            Some(c) => c,
            None => panic!("sleep: no current process"),
        };
        let mutex = guard.mutex();
        // Take the table lock before releasing the condition lock: any waker
        // must pass through one of the two, so it cannot slip between the
        // release and the state change.
        self.lock.acquire();
        drop(guard);
        self.sleep_on_table(cur, chan);
        self.lock.release();
        mutex.lock()
    }

    /// Flip every process sleeping on `chan` to RUNNABLE. Caller holds the
    /// table lock.
    pub(crate) fn wakeup_locked(&self, chan: Channel) {
        for i in 0..NPROC {
            if self.slots[i].state() == ProcState::Sleeping && self.slots[i].chan() == chan.0 {
                self.slots[i].set_state(ProcState::Runnable);
            }
        }
    }

    /// Wake every process sleeping on `chan`.
    pub fn wakeup(&self, chan: Channel) {
        self.lock.acquire();
        self.wakeup_locked(chan);
        self.lock.release();
    }

    /// Voluntarily give up the CPU; the caller stays RUNNABLE and will be
    /// picked again.
    pub fn yield_cpu(&self) {
        let cur = match self.current() {
            Some(c) => c,
            None => panic!("yield: no current process"),
        };
        self.lock.acquire();
        self.slots[cur].set_state(ProcState::Runnable);
        suspend(self, cur);
        self.lock.release();
    }
}

// ============================================================================
// The switch-away primitive
// ============================================================================

/// Hand the CPU from the process in `slot` back to the dispatch loop. Called
/// and returns with the table lock held; the process must already be in its
/// post-switch state (RUNNABLE, SLEEPING, or ZOMBIE).
#[cfg(target_os = "none")]
pub(crate) fn suspend(table: &ProcessTable, slot: usize) {
    use crate::proc::context;

    if !table.lock.holding() {
        panic!("suspend: table lock not held");
    }
    if table.slots[slot].state() == ProcState::Running {
        panic!("suspend: process still marked running");
    }
    if arch::intr_enabled() {
        panic!("suspend: interruptible");
    }
    let intena = cpu::with_cpu(|c| {
        // Exactly the table lock's disable level: anything else would carry
        // a held spin lock across the switch.
        if c.ncli() != 1 {
            panic!("suspend: other locks held");
        }
        c.intena()
    });

    let body = unsafe { table.body(slot) };
    let sched = cpu::with_cpu(|c| c.scheduler_context());
    unsafe { context::switch(&mut body.context, sched) };

    // Possibly a different core now; restore its saved enable state.
    cpu::with_cpu(|c| c.set_intena(intena));
}

/// Hosted rendition: park the OS thread standing in for this process until
/// a waker flips the slot RUNNABLE, then re-mark it RUNNING.
#[cfg(not(target_os = "none"))]
pub(crate) fn suspend(table: &ProcessTable, slot: usize) {
    if !table.lock.holding() {
        panic!("suspend: table lock not held");
    }
    if table.slots[slot].state() == ProcState::Running {
        panic!("suspend: process still marked running");
    }
    table.lock.release();
    loop {
        while table.slots[slot].state() != ProcState::Runnable {
            core::hint::spin_loop();
            std::thread::yield_now();
        }
        table.lock.acquire();
        if table.slots[slot].state() == ProcState::Runnable {
            table.slots[slot].set_state(ProcState::Running);
            return;
        }
        // Lost the race against another core; park again.
        table.lock.release();
    }
}

// ============================================================================
// Dispatch loop and first landing
// ============================================================================

/// The per-core dispatch loop. Each core calls this once at boot and never
/// returns: scan the table for a RUNNABLE slot, install its address space,
/// run it until it switches back, repeat. Interrupts are re-enabled at the
/// top of every sweep so a core with nothing to run still takes timer
/// interrupts.
#[cfg(target_os = "none")]
pub fn scheduler(kernel: &'static crate::kernel::Kernel) -> ! {
    use crate::proc::context;

    let table = kernel.procs();
    loop {
        arch::intr_on();

        table.lock.acquire();
        for slot in 0..NPROC {
            if table.slots[slot].state() != ProcState::Runnable {
                continue;
            }
            let body = unsafe { table.body(slot) };
            match body.space.as_ref() {
                Some(space) => space.install(),
                None => panic!("scheduler: runnable process without address space"),
            }
            cpu::set_current(Some(slot));
            table.slots[slot].set_state(ProcState::Running);

            let sched = cpu::with_cpu(|c| c.scheduler_context());
            unsafe { context::switch(sched, &body.context) };

            // The process switched back; it updated its own state.
            kernel.kernel_space().install();
            cpu::set_current(None);
        }
        table.lock.release();
    }
}

/// First landing of a newly created process, reached through its first-run
/// context. The dispatch loop hands over the table lock, which must be
/// released before heading out to user mode.
pub(crate) extern "C" fn forkret() {
    #[cfg(target_os = "none")]
    {
        let table = crate::kernel::kernel().procs();
        table.lock.release();
        let cur = match table.current() {
            Some(c) => c,
            None => panic!("forkret: no current process"),
        };
        let trapframe = unsafe { &table.body(cur).trapframe };
        unsafe { crate::trap::return_to_user(trapframe) }
    }
    #[cfg(not(target_os = "none"))]
    unreachable!("first-run trampoline is only reached on bare metal");
}
