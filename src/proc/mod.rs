//! Process table and lifecycle.
//!
//! A fixed table of [`NPROC`] slots under a single spin lock. Each slot
//! carries lock-free-readable mirrors of its state, pid, killed flag, and
//! wait channel (written only under the table lock), plus the bulky body:
//! address space, kernel stack, saved context, trap frame, open files. The
//! body is reached through [`ProcessTable::body`], whose contract is the
//! table's one aliasing rule: hold the table lock, or be the process that
//! owns the slot.
//!
//! Lifecycle: UNUSED -> EMBRYO -> RUNNABLE -> RUNNING -> {RUNNABLE,
//! SLEEPING, ZOMBIE}, and ZOMBIE -> UNUSED when the parent reaps. Orphans
//! are adopted by init (pid 1). Kill is cooperative: it flags the victim and
//! promotes it out of SLEEPING; the victim terminates itself at the next
//! trap boundary. A process in an uninterruptible wait that never re-checks
//! the flag is not killable, a known limitation carried on purpose.

pub mod context;
pub mod cpu;
pub mod exec;
pub mod scheduler;

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, AtomicUsize, Ordering};

use alloc::sync::Arc;

use crate::fs::{File, Inode};
use crate::mm::frame::{Frame, FrameAllocator};
use crate::mm::layout::KernelLayout;
use crate::mm::page_table::Perm;
use crate::mm::{AddressSpace, PAGE_SIZE};
use crate::proc::context::Context;
use crate::sync::SpinLock;
use crate::trap::TrapFrame;
use crate::types::{Channel, Pid};

// ============================================================================
// Constants
// ============================================================================

/// Slots in the process table
pub const NPROC: usize = 64;
/// Open files per process
pub const NOFILE: usize = 16;
/// Kernel stack size per process
pub const KSTACK_SIZE: usize = PAGE_SIZE;
/// Capacity of the debug name
pub const NAME_LEN: usize = 16;

/// `init_slot` value meaning "no init process yet".
const NO_INIT: usize = NPROC;

// ============================================================================
// States and errors
// ============================================================================

/// Lifecycle state of a process slot.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcState {
    Unused = 0,
    Embryo = 1,
    Sleeping = 2,
    Runnable = 3,
    Running = 4,
    Zombie = 5,
}

impl ProcState {
    fn from_u8(v: u8) -> ProcState {
        match v {
            0 => ProcState::Unused,
            1 => ProcState::Embryo,
            2 => ProcState::Sleeping,
            3 => ProcState::Runnable,
            4 => ProcState::Running,
            5 => ProcState::Zombie,
            _ => panic!("corrupt process state {}", v),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProcState::Unused => "unused",
            ProcState::Embryo => "embryo",
            ProcState::Sleeping => "sleeping",
            ProcState::Runnable => "runnable",
            ProcState::Running => "running",
            ProcState::Zombie => "zombie",
        }
    }
}

/// Process lifecycle failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcError {
    /// Every table slot is in use.
    OutOfSlots,
    /// A kernel stack or address-space allocation failed.
    OutOfMemory,
    /// The caller has no children to wait for.
    NoChildren,
    /// The caller was killed while waiting.
    Killed,
    /// No live process has the given pid.
    NotFound,
    /// The request itself is malformed (shrinking below zero).
    BadRequest,
}

// ============================================================================
// Slots
// ============================================================================

/// The bulky, lock-protected part of a process control block.
pub(crate) struct ProcBody {
    /// User-region size in bytes.
    pub sz: usize,
    pub space: Option<AddressSpace>,
    pub kstack: Option<Frame>,
    /// Slot index of the parent.
    pub parent: Option<usize>,
    /// Saved kernel registers while not running.
    pub context: Context,
    /// User registers from the outstanding trap.
    pub trapframe: TrapFrame,
    /// Status passed to exit, read by wait.
    pub exit_status: i32,
    pub files: [Option<Arc<File>>; NOFILE],
    pub cwd: Option<Inode>,
    /// Debug name.
    pub name: heapless::String<NAME_LEN>,
}

impl ProcBody {
    fn new() -> Self {
        ProcBody {
            sz: 0,
            space: None,
            kstack: None,
            parent: None,
            context: Context::zero(),
            trapframe: TrapFrame::default(),
            exit_status: 0,
            files: Default::default(),
            cwd: None,
            name: heapless::String::new(),
        }
    }

    pub fn set_name(&mut self, name: &str) {
        self.name.clear();
        for c in name.chars().take(NAME_LEN) {
            let _ = self.name.push(c);
        }
    }
}

/// One process-table slot: lock-free mirrors plus the body.
pub(crate) struct ProcSlot {
    /// Mirrors, written only under the table lock; readable anywhere.
    state: AtomicU8,
    pid: AtomicU32,
    killed: AtomicBool,
    chan: AtomicUsize,
    body: UnsafeCell<ProcBody>,
}

impl ProcSlot {
    fn new() -> Self {
        ProcSlot {
            state: AtomicU8::new(ProcState::Unused as u8),
            pid: AtomicU32::new(0),
            killed: AtomicBool::new(false),
            chan: AtomicUsize::new(0),
            body: UnsafeCell::new(ProcBody::new()),
        }
    }

    pub(crate) fn state(&self) -> ProcState {
        ProcState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub(crate) fn set_state(&self, state: ProcState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    pub(crate) fn pid(&self) -> Pid {
        Pid(self.pid.load(Ordering::SeqCst))
    }

    pub(crate) fn killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    pub(crate) fn chan(&self) -> usize {
        self.chan.load(Ordering::SeqCst)
    }

    pub(crate) fn set_chan(&self, chan: usize) {
        self.chan.store(chan, Ordering::SeqCst);
    }
}

// ============================================================================
// The table
// ============================================================================

/// The process table.
pub struct ProcessTable {
    pub(crate) lock: SpinLock,
    pub(crate) slots: [ProcSlot; NPROC],
    next_pid: AtomicU32,
    init_slot: AtomicUsize,
    frames: Arc<FrameAllocator>,
    layout: Arc<KernelLayout>,
}

// Bodies are reached only under the table lock or by the owning process;
// the mirrors are atomics.
unsafe impl Sync for ProcessTable {}
unsafe impl Send for ProcessTable {}

impl ProcessTable {
    pub fn new(frames: Arc<FrameAllocator>, layout: Arc<KernelLayout>) -> Self {
        ProcessTable {
            lock: SpinLock::new("ptable"),
            slots: core::array::from_fn(|_| ProcSlot::new()),
            next_pid: AtomicU32::new(1),
            init_slot: AtomicUsize::new(NO_INIT),
            frames,
            layout,
        }
    }

    pub fn frames(&self) -> &Arc<FrameAllocator> {
        &self.frames
    }

    /// Mutable access to a slot's body.
    ///
    /// # Safety
    ///
    /// The caller must hold the table lock, or be (running on behalf of) the
    /// process that owns the slot, and must not let returned references to
    /// the same slot alias.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn body(&self, slot: usize) -> &mut ProcBody {
        &mut *self.slots[slot].body.get()
    }

    /// The wait channel conventionally associated with a slot (its parent
    /// sleeps there in wait, exit wakes it).
    pub(crate) fn chan_of(&self, slot: usize) -> Channel {
        Channel::of(&self.slots[slot])
    }

    fn init_slot(&self) -> Option<usize> {
        match self.init_slot.load(Ordering::SeqCst) {
            NO_INIT => None,
            s => Some(s),
        }
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    /// Slot of the process running on the calling core.
    pub fn current(&self) -> Option<usize> {
        cpu::current_slot()
    }

    pub fn current_pid(&self) -> Option<Pid> {
        self.current().map(|s| self.slots[s].pid())
    }

    /// Has the current process been flagged for termination?
    pub fn current_killed(&self) -> bool {
        self.current().is_some_and(|s| self.slots[s].killed())
    }

    pub fn state_of(&self, slot: usize) -> ProcState {
        self.slots[slot].state()
    }

    pub fn pid_of(&self, slot: usize) -> Pid {
        self.slots[slot].pid()
    }

    /// Slot currently holding `pid`, if any.
    pub(crate) fn slot_of(&self, pid: Pid) -> Option<usize> {
        self.lock.acquire();
        let found = (0..NPROC)
            .find(|&i| self.slots[i].state() != ProcState::Unused && self.slots[i].pid() == pid);
        self.lock.release();
        found
    }

    /// Log one line per live slot. Diagnostic, racy by nature.
    pub fn dump(&self) {
        for i in 0..NPROC {
            let state = self.slots[i].state();
            if state == ProcState::Unused {
                continue;
            }
            // An EMBRYO's name is still being written by its creator.
            if state == ProcState::Embryo {
                log::info!("{:>5} {:8}", self.slots[i].pid().0, state.as_str());
                continue;
            }
            let name = unsafe { &self.body(i).name };
            log::info!("{:>5} {:8} {}", self.slots[i].pid().0, state.as_str(), name);
        }
    }

    // ========================================================================
    // Slot allocation
    // ========================================================================

    /// Claim an UNUSED slot, assign a fresh pid, and build the kernel stack
    /// with a first-run context that lands in the fork-return trampoline.
    /// The slot is left EMBRYO, owned by the caller.
    pub(crate) fn alloc_slot(&self) -> Option<usize> {
        self.lock.acquire();
        let slot = (0..NPROC).find(|&i| self.slots[i].state() == ProcState::Unused);
        let slot = match slot {
            Some(s) => s,
            None => {
                self.lock.release();
                return None;
            }
        };
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        self.slots[slot].set_state(ProcState::Embryo);
        self.slots[slot].pid.store(pid, Ordering::SeqCst);
        self.slots[slot].killed.store(false, Ordering::SeqCst);
        self.slots[slot].set_chan(0);
        self.lock.release();

        // An embryo belongs to its creator; the body is built unlocked.
        let body = unsafe { self.body(slot) };
        let kstack = match self.frames.alloc() {
            Some(f) => f,
            None => {
                self.retire_embryo(slot);
                return None;
            }
        };
        let stack_top = unsafe { kstack.addr().as_mut_ptr().add(KSTACK_SIZE) };
        body.kstack = Some(kstack);
        body.context = unsafe { Context::first_run(scheduler::forkret, stack_top) };
        body.trapframe = TrapFrame::default();
        body.sz = 0;
        body.parent = None;
        body.exit_status = 0;
        Some(slot)
    }

    /// Undo a partially built embryo.
    fn retire_embryo(&self, slot: usize) {
        let body = unsafe { self.body(slot) };
        if let Some(kstack) = body.kstack.take() {
            self.frames.free(kstack);
        }
        body.space = None;
        body.sz = 0;
        self.lock.acquire();
        self.slots[slot].pid.store(0, Ordering::SeqCst);
        self.slots[slot].set_state(ProcState::Unused);
        self.lock.release();
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Create the first process. `image` is the bootstrap user program,
    /// smaller than a page, copied to virtual address zero of a fresh
    /// space; execution starts there in user mode with the stack at the top
    /// of the page.
    pub fn spawn_init(&self, image: &[u8]) -> Result<Pid, ProcError> {
        if image.len() >= PAGE_SIZE {
            panic!("spawn_init: image larger than a page");
        }
        let slot = self.alloc_slot().ok_or(ProcError::OutOfSlots)?;
        let body = unsafe { self.body(slot) };

        let built = AddressSpace::new_kernel_mapped(self.frames.clone(), self.layout.clone())
            .and_then(|mut space| {
                space.grow(0, PAGE_SIZE, Perm::WRITE | Perm::EXEC)?;
                space.copy_out(0, image)?;
                Ok(space)
            });
        let space = match built {
            Ok(s) => s,
            Err(_) => {
                self.retire_embryo(slot);
                return Err(ProcError::OutOfMemory);
            }
        };

        body.space = Some(space);
        body.sz = PAGE_SIZE;
        body.trapframe = TrapFrame::user_init(0, PAGE_SIZE as u64);
        body.set_name("init");
        let pid = self.slots[slot].pid();

        self.init_slot.store(slot, Ordering::SeqCst);
        self.lock.acquire();
        self.slots[slot].set_state(ProcState::Runnable);
        self.lock.release();
        Ok(pid)
    }

    /// Create a child of the current process: a deep copy of its user
    /// region, a copy of its trap frame with the return register zeroed (so
    /// the child observes fork returning 0), its open files shared by
    /// refcount. Returns the child's pid to the parent. Any failure rolls
    /// the slot back and leaves the parent untouched.
    pub fn fork(&self) -> Result<Pid, ProcError> {
        let parent = match self.current() {
            Some(p) => p,
            None => panic!("fork: no current process"),
        };
        let child = self.alloc_slot().ok_or(ProcError::OutOfSlots)?;

        // The parent body is stable: it is the caller's own slot.
        let parent_body = unsafe { self.body(parent) };
        let child_body = unsafe { self.body(child) };

        let parent_space = match parent_body.space.as_ref() {
            Some(s) => s,
            None => panic!("fork: current process has no address space"),
        };
        let space = match parent_space.duplicate(parent_body.sz) {
            Ok(s) => s,
            Err(_) => {
                self.retire_embryo(child);
                return Err(ProcError::OutOfMemory);
            }
        };

        child_body.space = Some(space);
        child_body.sz = parent_body.sz;
        child_body.trapframe = parent_body.trapframe;
        child_body.trapframe.rax = 0;
        child_body.files = parent_body.files.clone();
        child_body.cwd = parent_body.cwd;
        child_body.name = parent_body.name.clone();

        let pid = self.slots[child].pid();
        // The parent link is published under the same acquisition that makes
        // the slot RUNNABLE, so the exit and wait scans never see a child
        // whose body is still being built.
        self.lock.acquire();
        child_body.parent = Some(parent);
        self.slots[child].set_state(ProcState::Runnable);
        self.lock.release();
        Ok(pid)
    }

    /// Terminate the current process: close its files, drop its working
    /// directory, hand its children to init (waking init if any are already
    /// zombies), wake its parent, and become a ZOMBIE holding `status` until
    /// reaped.
    ///
    /// On bare metal this never returns. The hosted rendition returns after
    /// the slot becomes a zombie so a simulated process (an OS thread) can
    /// unwind; the calling core is left running nothing.
    pub fn exit(&self, status: i32) {
        let cur = match self.current() {
            Some(c) => c,
            None => panic!("exit: no current process"),
        };
        if self.init_slot() == Some(cur) {
            panic!("init exiting");
        }

        let body = unsafe { self.body(cur) };
        // Closing here drops the Arcs outside the table lock.
        body.files = Default::default();
        body.cwd = None;

        self.lock.acquire();

        if let Some(parent) = body.parent {
            self.wakeup_locked(self.chan_of(parent));
        }

        for i in 0..NPROC {
            let state = self.slots[i].state();
            // An EMBRYO body still belongs to the process building it.
            if i == cur || state == ProcState::Unused || state == ProcState::Embryo {
                continue;
            }
            let child_body = unsafe { self.body(i) };
            if child_body.parent != Some(cur) {
                continue;
            }
            let init = match self.init_slot() {
                Some(s) => s,
                None => panic!("exit: orphaned child but no init process"),
            };
            child_body.parent = Some(init);
            if state == ProcState::Zombie {
                self.wakeup_locked(self.chan_of(init));
            }
        }

        body.exit_status = status;
        self.slots[cur].set_state(ProcState::Zombie);

        #[cfg(target_os = "none")]
        {
            scheduler::suspend(self, cur);
            panic!("zombie process resumed");
        }
        #[cfg(not(target_os = "none"))]
        {
            cpu::set_current(None);
            self.lock.release();
        }
    }

    /// Wait for a child to exit and reap it: free its kernel stack and
    /// address space, recycle the slot, and return its pid and exit status.
    /// Fails fast with `NoChildren` when the caller has no children left,
    /// and with `Killed` when the caller is flagged while waiting.
    pub fn wait(&self) -> Result<(Pid, i32), ProcError> {
        let cur = match self.current() {
            Some(c) => c,
            None => panic!("wait: no current process"),
        };
        self.lock.acquire();
        loop {
            let mut have_children = false;
            for i in 0..NPROC {
                let state = self.slots[i].state();
                // An EMBRYO body still belongs to the process building it.
                if i == cur || state == ProcState::Unused || state == ProcState::Embryo {
                    continue;
                }
                let child_body = unsafe { self.body(i) };
                if child_body.parent != Some(cur) {
                    continue;
                }
                have_children = true;
                if state != ProcState::Zombie {
                    continue;
                }

                let pid = self.slots[i].pid();
                let status = child_body.exit_status;
                if let Some(kstack) = child_body.kstack.take() {
                    self.frames.free(kstack);
                }
                child_body.space = None;
                child_body.sz = 0;
                child_body.parent = None;
                child_body.name.clear();
                self.slots[i].pid.store(0, Ordering::SeqCst);
                self.slots[i].killed.store(false, Ordering::SeqCst);
                self.slots[i].set_state(ProcState::Unused);
                self.lock.release();
                return Ok((pid, status));
            }

            if !have_children {
                self.lock.release();
                return Err(ProcError::NoChildren);
            }
            if self.slots[cur].killed() {
                self.lock.release();
                return Err(ProcError::Killed);
            }

            // Sleep on our own slot; exiting children wake it.
            self.sleep_on_table(cur, self.chan_of(cur));
        }
    }

    /// Flag `pid` for termination and promote it out of SLEEPING so it
    /// reaches the next trap boundary, where it will exit. A process parked
    /// in an uninterruptible wait that never re-checks the flag is not
    /// killable; that limitation is inherent to cooperative termination.
    pub fn kill(&self, pid: Pid) -> Result<(), ProcError> {
        self.lock.acquire();
        for i in 0..NPROC {
            if self.slots[i].state() == ProcState::Unused || self.slots[i].pid() != pid {
                continue;
            }
            self.slots[i].killed.store(true, Ordering::SeqCst);
            if self.slots[i].state() == ProcState::Sleeping {
                self.slots[i].set_state(ProcState::Runnable);
            }
            self.lock.release();
            return Ok(());
        }
        self.lock.release();
        Err(ProcError::NotFound)
    }

    /// Grow or shrink the current process's user region by `delta` bytes
    /// (the sbrk backend). Returns the new size.
    pub fn grow_user(&self, delta: isize) -> Result<usize, ProcError> {
        let cur = match self.current() {
            Some(c) => c,
            None => panic!("grow_user: no current process"),
        };
        let body = unsafe { self.body(cur) };
        let space = match body.space.as_mut() {
            Some(s) => s,
            None => panic!("grow_user: current process has no address space"),
        };

        let old = body.sz;
        let new = if delta >= 0 {
            space
                .grow(old, old + delta as usize, Perm::WRITE)
                .map_err(|_| ProcError::OutOfMemory)?
        } else {
            let target = old
                .checked_sub(delta.unsigned_abs())
                .ok_or(ProcError::BadRequest)?;
            space.shrink(old, target)
        };
        body.sz = new;
        // Drop stale translations for the changed region.
        space.install();
        Ok(new)
    }

    // ========================================================================
    // Hosted simulation
    // ========================================================================

    /// Bind `slot` to the calling core and mark it RUNNING: the hosted
    /// stand-in for being picked by the dispatch loop. Tests and simulations
    /// use this to let an OS thread act as the process in `slot`.
    #[cfg(not(target_os = "none"))]
    pub fn adopt(&self, slot: usize) {
        self.lock.acquire();
        self.slots[slot].set_state(ProcState::Running);
        cpu::set_current(Some(slot));
        self.lock.release();
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{test_table, INIT_IMAGE};
    use super::*;

    #[test]
    fn test_spawn_init_is_pid_one() {
        let table = test_table(64);
        let pid = table.spawn_init(INIT_IMAGE).unwrap();
        assert_eq!(pid, Pid::INIT);

        let slot = table.slot_of(pid).unwrap();
        assert_eq!(table.state_of(slot), ProcState::Runnable);
        let body = unsafe { table.body(slot) };
        assert_eq!(body.name.as_str(), "init");
        assert_eq!(body.sz, PAGE_SIZE);
        // The image landed at virtual address zero.
        let ka = body.space.as_ref().unwrap().translate(0).unwrap();
        assert_eq!(unsafe { ka.as_ptr().read() }, 0x90);
        // Entry at zero, stack at the top of the page.
        assert_eq!(body.trapframe.rip, 0);
        assert_eq!(body.trapframe.rsp, PAGE_SIZE as u64);
    }

    #[test]
    fn test_fork_copies_parent() {
        std::thread::spawn(|| {
            let table = test_table(128);
            let init = table.spawn_init(INIT_IMAGE).unwrap();
            let slot = table.slot_of(init).unwrap();
            table.adopt(slot);
            unsafe { table.body(slot) }.trapframe.rax = 77;

            let child_pid = table.fork().unwrap();
            assert_ne!(child_pid, init);

            let child = table.slot_of(child_pid).unwrap();
            assert_eq!(table.state_of(child), ProcState::Runnable);
            let child_body = unsafe { table.body(child) };
            assert_eq!(child_body.parent, Some(slot));
            assert_eq!(child_body.sz, PAGE_SIZE);
            // The child observes fork returning zero.
            assert_eq!(child_body.trapframe.rax, 0);
            assert_eq!(unsafe { table.body(slot) }.trapframe.rax, 77);
            // The copy is deep.
            let child_ka = child_body.space.as_ref().unwrap().translate(0).unwrap();
            assert_eq!(unsafe { child_ka.as_ptr().read() }, 0x90);
            unsafe { child_ka.as_mut_ptr().write(0x33) };
            let parent_body = unsafe { table.body(slot) };
            let parent_ka = parent_body.space.as_ref().unwrap().translate(0).unwrap();
            assert_eq!(unsafe { parent_ka.as_ptr().read() }, 0x90);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_fork_rolls_back_when_memory_runs_out() {
        std::thread::spawn(|| {
            // Enough for init but not for a duplicate of it.
            let table = test_table(8);
            let init = table.spawn_init(INIT_IMAGE).unwrap();
            let slot = table.slot_of(init).unwrap();
            table.adopt(slot);

            assert_eq!(table.fork(), Err(ProcError::OutOfMemory));
            // No embryo left behind.
            let used = (0..NPROC)
                .filter(|&i| table.state_of(i) != ProcState::Unused)
                .count();
            assert_eq!(used, 1);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_wait_without_children_fails_fast() {
        std::thread::spawn(|| {
            let table = test_table(64);
            let init = table.spawn_init(INIT_IMAGE).unwrap();
            table.adopt(table.slot_of(init).unwrap());
            assert_eq!(table.wait(), Err(ProcError::NoChildren));
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_fork_wait_balance() {
        std::thread::spawn(|| {
            let table = test_table(256);
            let init = table.spawn_init(INIT_IMAGE).unwrap();
            let init_slot = table.slot_of(init).unwrap();
            table.adopt(init_slot);

            let mut pids = std::vec::Vec::new();
            for n in 0..3 {
                let pid = table.fork().unwrap();
                assert!(!pids.contains(&pid));
                // Each child runs on its own thread and exits.
                let child_slot = table.slot_of(pid).unwrap();
                std::thread::scope(|s| {
                    s.spawn(|| {
                        table.adopt(child_slot);
                        table.exit(100 + n);
                    });
                });
                pids.push(pid);
            }

            let free_before_reaps = table.frames().free_frames();
            let mut reaped = std::vec::Vec::new();
            for _ in 0..3 {
                let (pid, status) = table.wait().unwrap();
                assert!(pids.contains(&pid));
                assert!(!reaped.contains(&pid));
                assert!((100..103).contains(&status));
                reaped.push(pid);
            }
            // Reaping released the children's stacks and spaces.
            assert!(table.frames().free_frames() > free_before_reaps);
            // The last reap exhausted the children.
            assert_eq!(table.wait(), Err(ProcError::NoChildren));
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_exit_reparents_children_to_init() {
        std::thread::spawn(|| {
            let table = test_table(256);
            let init = table.spawn_init(INIT_IMAGE).unwrap();
            let init_slot = table.slot_of(init).unwrap();
            table.adopt(init_slot);

            // init forks a middle process, which forks a grandchild.
            let mid_pid = table.fork().unwrap();
            let mid_slot = table.slot_of(mid_pid).unwrap();
            let (grandchild_pid, grandchild_slot) = std::thread::scope(|s| {
                s.spawn(|| {
                    table.adopt(mid_slot);
                    let pid = table.fork().unwrap();
                    let slot = table.slot_of(pid).unwrap();
                    // The middle process dies first; the grandchild becomes
                    // init's.
                    table.exit(0);
                    (pid, slot)
                })
                .join()
                .unwrap()
            });
            assert_eq!(
                unsafe { table.body(grandchild_slot) }.parent,
                Some(init_slot)
            );

            // The grandchild exits and init reaps both, in zombie order.
            std::thread::scope(|s| {
                s.spawn(|| {
                    table.adopt(grandchild_slot);
                    table.exit(7);
                });
            });
            let mut reaped = std::vec::Vec::new();
            reaped.push(table.wait().unwrap().0);
            reaped.push(table.wait().unwrap().0);
            assert!(reaped.contains(&mid_pid));
            assert!(reaped.contains(&grandchild_pid));
            assert_eq!(table.wait(), Err(ProcError::NoChildren));
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_embryo_slots_are_left_alone_by_exit_and_wait() {
        std::thread::spawn(|| {
            let table = test_table(256);
            let init = table.spawn_init(INIT_IMAGE).unwrap();
            table.adopt(table.slot_of(init).unwrap());

            // A fork caught mid-build: the slot is claimed but its body is
            // not yet published.
            let embryo = table.alloc_slot().unwrap();
            assert_eq!(table.state_of(embryo), ProcState::Embryo);
            // wait skips it rather than scanning the half-built body.
            assert_eq!(table.wait(), Err(ProcError::NoChildren));

            // A dying sibling reparents its children and leaves the embryo
            // untouched.
            let mid_pid = table.fork().unwrap();
            let mid_slot = table.slot_of(mid_pid).unwrap();
            std::thread::scope(|s| {
                s.spawn(|| {
                    table.adopt(mid_slot);
                    table.exit(0);
                });
            });
            assert_eq!(table.state_of(embryo), ProcState::Embryo);
            assert_eq!(unsafe { table.body(embryo) }.parent, None);

            assert_eq!(table.wait().unwrap().0, mid_pid);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_kill_flags_and_promotes() {
        let table = test_table(64);
        let init = table.spawn_init(INIT_IMAGE).unwrap();
        let slot = table.slot_of(init).unwrap();

        assert_eq!(table.kill(Pid(42)), Err(ProcError::NotFound));

        // Fake a sleeping process and kill it.
        table.lock.acquire();
        table.slots[slot].set_chan(0x1234);
        table.slots[slot].set_state(ProcState::Sleeping);
        table.lock.release();

        table.kill(init).unwrap();
        assert!(table.slots[slot].killed());
        assert_eq!(table.state_of(slot), ProcState::Runnable);
    }

    #[test]
    fn test_grow_user_round_trip() {
        std::thread::spawn(|| {
            let table = test_table(128);
            let init = table.spawn_init(INIT_IMAGE).unwrap();
            let slot = table.slot_of(init).unwrap();
            table.adopt(slot);

            let grown = table.grow_user(3 * PAGE_SIZE as isize).unwrap();
            assert_eq!(grown, 4 * PAGE_SIZE);
            let shrunk = table.grow_user(-(2 * PAGE_SIZE as isize)).unwrap();
            assert_eq!(shrunk, 2 * PAGE_SIZE);
            assert_eq!(
                table.grow_user(-(3 * PAGE_SIZE as isize)),
                Err(ProcError::BadRequest)
            );
        })
        .join()
        .unwrap();
    }
}
