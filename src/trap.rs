//! Trap entry: classification and dispatch for syscalls, device
//! interrupts, and faults.
//!
//! The assembly vectors push a [`TrapFrame`] and call [`handle`]; what
//! happens next depends only on the trap number. Syscalls go to the
//! installed dispatcher, the timer tick drives the clock and preemption,
//! device interrupts go to their registered handlers, and anything
//! unexpected kills the offending user process or panics the kernel.
//!
//! A kill takes effect at this boundary: a flagged process never returns
//! to user mode, it exits here instead.

use crate::arch;
use crate::kernel::Kernel;
use crate::proc::ProcState;
use crate::sync::{SpinMutex, SpinMutexGuard};
use crate::types::Channel;

/// Trap vector reserved for the syscall gate
pub const T_SYSCALL: u64 = 64;
/// First device interrupt vector; line n arrives as vector T_IRQ0 + n.
pub const T_IRQ0: u64 = 32;

pub const IRQ_TIMER: u8 = 0;
pub const IRQ_KBD: u8 = 1;
pub const IRQ_COM1: u8 = 4;
pub const IRQ_IDE: u8 = 14;
pub const IRQ_SPURIOUS: u8 = 31;

/// User code segment selector, RPL 3
const SEG_UCODE: u64 = (3 << 3) | 3;
/// User data segment selector, RPL 3
const SEG_UDATA: u64 = (4 << 3) | 3;

// ============================================================================
// The saved register frame
// ============================================================================

/// Registers pushed at trap entry, in the exact order the entry stubs and
/// the return path expect. `trapno` and `err` are pushed by the stubs (a
/// zero error code where the hardware supplies none); `rip` through `ss`
/// are the hardware interrupt frame.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct TrapFrame {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rbp: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub trapno: u64,
    pub err: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

impl TrapFrame {
    /// The frame a brand-new user process starts from: user selectors,
    /// interrupts enabled, everything else zero.
    pub fn user_init(entry: u64, stack_top: u64) -> TrapFrame {
        TrapFrame {
            rip: entry,
            rsp: stack_top,
            cs: SEG_UCODE,
            ss: SEG_UDATA,
            rflags: arch::FL_IF,
            ..TrapFrame::default()
        }
    }

    /// Did this trap arrive from user mode?
    pub fn is_user(&self) -> bool {
        self.cs & 3 == 3
    }
}

/// What a trap number means.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trap {
    Syscall,
    /// Device interrupt line, already rebased below [`T_IRQ0`].
    Irq(u8),
    Spurious,
    /// A fault or a vector nothing claims.
    Unknown(u64),
}

impl Trap {
    pub fn from_number(trapno: u64) -> Trap {
        match trapno {
            T_SYSCALL => Trap::Syscall,
            n if n == T_IRQ0 + IRQ_SPURIOUS as u64 => Trap::Spurious,
            n if (T_IRQ0..T_IRQ0 + 32).contains(&n) => Trap::Irq((n - T_IRQ0) as u8),
            n => Trap::Unknown(n),
        }
    }
}

// ============================================================================
// The clock
// ============================================================================

/// The system tick counter, advanced by the timekeeping core on every
/// timer interrupt. Sleepers wait on [`Ticks::channel`].
pub struct Ticks {
    count: SpinMutex<u64>,
}

impl Ticks {
    pub const fn new() -> Self {
        Ticks {
            count: SpinMutex::new("time", 0),
        }
    }

    pub fn lock(&self) -> SpinMutexGuard<'_, u64> {
        self.count.lock()
    }

    pub fn get(&self) -> u64 {
        *self.count.lock()
    }

    /// The channel tick sleepers wait on.
    pub fn channel(&self) -> Channel {
        Channel::of(self)
    }
}

impl Default for Ticks {
    fn default() -> Self {
        Ticks::new()
    }
}

// ============================================================================
// Dispatch
// ============================================================================

/// Core 0 owns the clock; other cores only acknowledge their timer ticks.
const TIMEKEEPER: usize = 0;

/// Handle one trap against `kernel`. The frame is live: dispatchers write
/// results and exec rewrites the return state through it.
pub fn handle(kernel: &Kernel, tf: &mut TrapFrame) {
    let table = kernel.procs();
    match Trap::from_number(tf.trapno) {
        Trap::Syscall => {
            if table.current_killed() {
                table.exit(-1);
                return;
            }
            match table.current() {
                // Record the user registers so fork and exec can see them.
                Some(cur) => unsafe { table.body(cur) }.trapframe = *tf,
                None => panic!("syscall with no current process"),
            }
            kernel.dispatch_syscall(tf);
        }
        Trap::Irq(IRQ_TIMER) => {
            if arch::cpu_id() == TIMEKEEPER {
                let mut ticks = kernel.ticks().lock();
                *ticks += 1;
                table.wakeup(kernel.ticks().channel());
            }
            kernel.irq_eoi();
            // Preempt whatever was running when the tick landed.
            if let Some(cur) = table.current() {
                if table.state_of(cur) == ProcState::Running {
                    table.yield_cpu();
                }
            }
        }
        Trap::Irq(irq) => {
            if !kernel.handle_irq(irq) {
                log::warn!("cpu{}: unclaimed interrupt {}", arch::cpu_id(), irq);
            }
            kernel.irq_eoi();
        }
        Trap::Spurious => {
            log::warn!(
                "cpu{}: spurious interrupt at {:#x}",
                arch::cpu_id(),
                tf.rip
            );
        }
        Trap::Unknown(trapno) => match table.current() {
            Some(cur) if tf.is_user() => {
                log::warn!(
                    "pid {} {}: trap {} err {} on cpu{} rip {:#x}, killing",
                    table.pid_of(cur).0,
                    unsafe { table.body(cur) }.name,
                    trapno,
                    tf.err,
                    arch::cpu_id(),
                    tf.rip
                );
                let _ = table.kill(table.pid_of(cur));
            }
            _ => panic!(
                "unexpected trap {} err {} from kernel mode, rip {:#x}",
                trapno, tf.err, tf.rip
            ),
        },
    }

    // A pending kill takes effect before the return to user mode.
    if tf.is_user() && table.current_killed() {
        table.exit(-1);
    }
}

// ============================================================================
// The return path
// ============================================================================

/// Restore `tf` and drop to user mode, never returning. The register
/// restore and `iretq` live in the boot glue next to the entry stubs.
#[cfg(target_os = "none")]
pub unsafe fn return_to_user(tf: &TrapFrame) -> ! {
    extern "C" {
        fn vireo_trapret(tf: *const TrapFrame) -> !;
    }
    vireo_trapret(tf)
}

#[cfg(not(target_os = "none"))]
pub unsafe fn return_to_user(_tf: &TrapFrame) -> ! {
    unreachable!("user-mode return is only reached on bare metal")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::testing::test_kernel;
    use crate::proc::testing::INIT_IMAGE;

    #[test]
    fn test_trap_classification() {
        assert_eq!(Trap::from_number(T_SYSCALL), Trap::Syscall);
        assert_eq!(Trap::from_number(T_IRQ0), Trap::Irq(IRQ_TIMER));
        assert_eq!(Trap::from_number(T_IRQ0 + 14), Trap::Irq(IRQ_IDE));
        assert_eq!(Trap::from_number(T_IRQ0 + 31), Trap::Spurious);
        assert_eq!(Trap::from_number(14), Trap::Unknown(14));
        assert_eq!(Trap::from_number(13), Trap::Unknown(13));
    }

    #[test]
    fn test_user_init_frame() {
        let tf = TrapFrame::user_init(0x1000, 0x8000);
        assert_eq!(tf.rip, 0x1000);
        assert_eq!(tf.rsp, 0x8000);
        assert!(tf.is_user());
        assert_eq!(tf.rflags & arch::FL_IF, arch::FL_IF);
        assert_eq!(tf.rax, 0);
    }

    #[test]
    fn test_timer_tick_advances_clock_and_wakes_sleepers() {
        let kernel = test_kernel(128);
        let _ = kernel.procs().spawn_init(INIT_IMAGE).unwrap();
        let kernel = &kernel;

        std::thread::scope(|s| {
            let sleeper_slot = kernel.procs().alloc_slot().unwrap();
            s.spawn(move || {
                let table = kernel.procs();
                table.adopt(sleeper_slot);
                let mut ticks = kernel.ticks().lock();
                while *ticks == 0 {
                    ticks = table.sleep(kernel.ticks().channel(), ticks);
                }
                assert_eq!(*ticks, 1);
            });

            while kernel.procs().state_of(sleeper_slot) != ProcState::Sleeping {
                std::thread::yield_now();
            }
            s.spawn(move || {
                crate::arch::adopt_cpu(TIMEKEEPER);
                let mut tf = TrapFrame::default();
                tf.trapno = T_IRQ0 + IRQ_TIMER as u64;
                handle(kernel, &mut tf);
            });
        });
        assert_eq!(kernel.ticks().get(), 1);
    }

    #[test]
    fn test_timer_tick_on_other_core_leaves_clock_alone() {
        std::thread::spawn(|| {
            let kernel = test_kernel(64);
            crate::arch::adopt_cpu(3);
            let mut tf = TrapFrame::default();
            tf.trapno = T_IRQ0 + IRQ_TIMER as u64;
            handle(&kernel, &mut tf);
            assert_eq!(kernel.ticks().get(), 0);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_unknown_user_trap_kills_the_process() {
        let kernel = test_kernel(256);
        let kernel = &kernel;

        std::thread::scope(|s| {
            s.spawn(move || {
                let table = kernel.procs();
                let init = table.spawn_init(INIT_IMAGE).unwrap();
                table.adopt(table.slot_of(init).unwrap());
                let child = table.fork().unwrap();
                let child_slot = table.slot_of(child).unwrap();

                s.spawn(move || {
                    let table = kernel.procs();
                    table.adopt(child_slot);
                    // A page fault out of user mode.
                    let mut tf = TrapFrame::user_init(0x4000, 0x8000);
                    tf.trapno = 14;
                    handle(kernel, &mut tf);
                });

                let (pid, status) = table.wait().unwrap();
                assert_eq!(pid, child);
                assert_eq!(status, -1);
            });
        });
    }

    #[test]
    #[should_panic(expected = "unexpected trap")]
    fn test_unknown_kernel_trap_panics() {
        let kernel = test_kernel(64);
        let mut tf = TrapFrame::default();
        tf.trapno = 13;
        tf.cs = 8;
        handle(&kernel, &mut tf);
    }

    #[test]
    fn test_killed_process_exits_at_syscall_entry() {
        let kernel = test_kernel(256);
        let kernel = &kernel;

        std::thread::scope(|s| {
            s.spawn(move || {
                let table = kernel.procs();
                let init = table.spawn_init(INIT_IMAGE).unwrap();
                table.adopt(table.slot_of(init).unwrap());
                let child = table.fork().unwrap();
                let child_slot = table.slot_of(child).unwrap();
                table.kill(child).unwrap();

                s.spawn(move || {
                    let table = kernel.procs();
                    table.adopt(child_slot);
                    let mut tf = TrapFrame::user_init(0, 0x1000);
                    tf.trapno = T_SYSCALL;
                    tf.rax = 99;
                    handle(kernel, &mut tf);
                    // The dispatcher never ran.
                    assert_eq!(tf.rax, 99);
                });

                let (pid, status) = table.wait().unwrap();
                assert_eq!(pid, child);
                assert_eq!(status, -1);
            });
        });
    }

    #[test]
    fn test_spurious_interrupt_is_ignored() {
        let kernel = test_kernel(64);
        let mut tf = TrapFrame::default();
        tf.trapno = T_IRQ0 + IRQ_SPURIOUS as u64;
        handle(&kernel, &mut tf);
        assert_eq!(kernel.ticks().get(), 0);
    }
}
