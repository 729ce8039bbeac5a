//! x86-64 hardware primitives and their hosted shims.

// ============================================================================
// Constants
// ============================================================================

/// RFLAGS interrupt-enable bit
pub const FL_IF: u64 = 0x200;

/// Depth of the call stack captured for lock diagnostics
pub const NCALLER_PCS: usize = 10;

// ============================================================================
// Interrupt flag control
// ============================================================================

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod intr {
    use super::FL_IF;
    use core::arch::asm;

    fn rflags() -> u64 {
        let flags: u64;
        unsafe {
            asm!("pushfq; pop {}", out(reg) flags, options(nomem, preserves_flags));
        }
        flags
    }

    /// Enable maskable interrupts on this core.
    pub fn intr_on() {
        unsafe { asm!("sti", options(nomem, nostack)) }
    }

    /// Disable maskable interrupts on this core.
    pub fn intr_off() {
        unsafe { asm!("cli", options(nomem, nostack)) }
    }

    /// Are maskable interrupts currently enabled on this core?
    pub fn intr_enabled() -> bool {
        rflags() & FL_IF != 0
    }
}

// The hosted shim keeps the interrupt-enable state as a thread-local flag:
// each OS thread stands in for one core, and "interrupts" are purely a
// bookkeeping concern for the lock nesting discipline.
#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
mod intr {
    use core::cell::Cell;

    std::thread_local! {
        static INTR_ENABLED: Cell<bool> = const { Cell::new(true) };
    }

    /// Enable "interrupts" on this simulated core.
    pub fn intr_on() {
        INTR_ENABLED.with(|f| f.set(true));
    }

    /// Disable "interrupts" on this simulated core.
    pub fn intr_off() {
        INTR_ENABLED.with(|f| f.set(false));
    }

    /// Are "interrupts" enabled on this simulated core?
    pub fn intr_enabled() -> bool {
        INTR_ENABLED.with(|f| f.get())
    }
}

pub use intr::{intr_enabled, intr_off, intr_on};

// ============================================================================
// CPU identity
// ============================================================================

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod cpuid {
    use core::sync::atomic::{AtomicUsize, Ordering};

    // Core identity comes from the local APIC, which belongs to the boot
    // discovery collaborator; it installs a source function here before
    // secondary cores start. Until then every caller is core 0.
    static CPU_ID_SOURCE: AtomicUsize = AtomicUsize::new(0);

    /// Install the boot-glue function that maps the running core to its id.
    pub fn set_cpu_id_source(source: fn() -> usize) {
        CPU_ID_SOURCE.store(source as usize, Ordering::Release);
    }

    /// Identity of the core executing this call.
    pub fn cpu_id() -> usize {
        let raw = CPU_ID_SOURCE.load(Ordering::Acquire);
        if raw == 0 {
            return 0;
        }
        let source: fn() -> usize = unsafe { core::mem::transmute(raw) };
        source()
    }
}

// Hosted shim: each OS thread is its own core, with a process-wide counter
// handing out ids. Ids are unique per thread so lock ownership checks stay
// meaningful no matter how the test harness schedules threads.
#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
mod cpuid {
    use core::cell::Cell;
    use core::sync::atomic::{AtomicUsize, Ordering};

    // Low ids are reserved for adopt_cpu so an adopted id never collides
    // with an auto-assigned one.
    static NEXT_CPU_ID: AtomicUsize = AtomicUsize::new(64);

    std::thread_local! {
        static CPU_ID: Cell<Option<usize>> = const { Cell::new(None) };
    }

    /// Identity of the simulated core executing this call.
    pub fn cpu_id() -> usize {
        CPU_ID.with(|id| match id.get() {
            Some(n) => n,
            None => {
                let n = NEXT_CPU_ID.fetch_add(1, Ordering::Relaxed);
                id.set(Some(n));
                n
            }
        })
    }

    /// Pin this thread to a specific core id (timekeeping tests want core 0).
    pub fn adopt_cpu(id: usize) {
        CPU_ID.with(|slot| slot.set(Some(id)));
    }
}

pub use cpuid::cpu_id;
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub use cpuid::set_cpu_id_source;
#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
pub use cpuid::adopt_cpu;

// ============================================================================
// Address-space activation and TLB control
// ============================================================================

/// Load CR3 with the physical address of a level-4 page table root.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn load_root(root_pa: usize) {
    unsafe {
        core::arch::asm!("mov cr3, {}", in(reg) root_pa, options(nostack));
    }
}

/// Hosted builds never activate a page table; walks are done in software.
#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
pub fn load_root(_root_pa: usize) {}

/// Invalidate the TLB entry covering one virtual address.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn invalidate_page(va: usize) {
    unsafe {
        core::arch::asm!("invlpg [{}]", in(reg) va, options(nostack));
    }
}

/// Hosted builds have no TLB.
#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
pub fn invalidate_page(_va: usize) {}

// ============================================================================
// Call-stack capture (lock diagnostics)
// ============================================================================

/// Capture up to [`NCALLER_PCS`] return addresses from the current call
/// stack by walking saved frame pointers. Slots past the end are zero.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn caller_pcs() -> [usize; NCALLER_PCS] {
    use crate::mm::layout::KERNBASE;

    let mut pcs = [0usize; NCALLER_PCS];
    let mut rbp: usize;
    unsafe {
        core::arch::asm!("mov {}, rbp", out(reg) rbp, options(nomem, preserves_flags));
    }
    for slot in pcs.iter_mut() {
        // A frame pointer outside the kernel direct map ends the walk.
        if rbp < KERNBASE || rbp == usize::MAX {
            break;
        }
        let frame = rbp as *const usize;
        unsafe {
            *slot = *frame.add(1);
            rbp = *frame;
        }
    }
    pcs
}

/// Hosted builds skip the frame walk; the lock diagnostics carry zeros.
#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
pub fn caller_pcs() -> [usize; NCALLER_PCS] {
    [0; NCALLER_PCS]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intr_flag_roundtrip() {
        intr_off();
        assert!(!intr_enabled());
        intr_on();
        assert!(intr_enabled());
    }

    #[test]
    fn test_cpu_ids_unique_per_thread() {
        let here = cpu_id();
        assert_eq!(here, cpu_id());
        let there = std::thread::spawn(cpu_id).join().unwrap();
        assert_ne!(here, there);
    }

    #[test]
    fn test_adopt_cpu_overrides() {
        std::thread::spawn(|| {
            adopt_cpu(0);
            assert_eq!(cpu_id(), 0);
        })
        .join()
        .unwrap();
    }
}
