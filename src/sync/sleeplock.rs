//! Sleep locks: long-term locks whose waiters yield the CPU.
//!
//! A sleep lock may be held across blocking operations (disk I/O), which a
//! spin lock must never be. Contenders sleep on the lock's own address and
//! are woken collectively at release; the internal spin lock makes the
//! test-and-sleep atomic. The owning process is recorded by pid.
//!
//! Blocking needs the process table, which callers pass in explicitly; the
//! lock itself stays a plain value.

use crate::proc::ProcessTable;
use crate::sync::SpinMutex;
use crate::types::{Channel, Pid};

struct SleepLockState {
    locked: bool,
    owner: Option<Pid>,
}

/// A blocking lock held by a process rather than a core.
pub struct SleepLock {
    inner: SpinMutex<SleepLockState>,
    name: &'static str,
}

impl SleepLock {
    pub const fn new(name: &'static str) -> Self {
        SleepLock {
            inner: SpinMutex::new(
                name,
                SleepLockState {
                    locked: false,
                    owner: None,
                },
            ),
            name,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Block the current process until the lock is free, then take it.
    pub fn acquire(&self, table: &ProcessTable) {
        let mut state = self.inner.lock();
        while state.locked {
            state = table.sleep(Channel::of(self), state);
        }
        state.locked = true;
        state.owner = table.current_pid();
    }

    /// Release the lock and wake every contender. Releasing a lock that is
    /// not held is a kernel bug and panics.
    pub fn release(&self, table: &ProcessTable) {
        let mut state = self.inner.lock();
        if !state.locked {
            panic!("sleep lock release: {} not held", self.name);
        }
        state.locked = false;
        state.owner = None;
        table.wakeup(Channel::of(self));
    }

    /// Is the lock held by the current process?
    pub fn holding(&self, table: &ProcessTable) -> bool {
        let state = self.inner.lock();
        state.locked && state.owner == table.current_pid()
    }
}
