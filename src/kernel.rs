//! The kernel context.
//!
//! One [`Kernel`] value owns every core subsystem: the frame allocator, the
//! boot layout, the kernel address space, the process table, the tick
//! counter, and the registries for device interrupt handlers and the
//! syscall dispatcher. There are no file-scope mutable globals; everything
//! hangs off this object, which boot code constructs once and installs with
//! [`install`]. Tests build private instances and never touch the global.

use alloc::sync::Arc;
use spin::{Mutex, Once};

use crate::fs::Filesystem;
use crate::mm::addr_space::VmError;
use crate::mm::{AddressSpace, FrameAllocator, KernelLayout};
use crate::proc::ProcessTable;
use crate::trap::{Ticks, TrapFrame};

/// Device interrupt lines the registry can route
pub const NIRQ: usize = 32;

/// A device driver's interrupt entry point.
pub trait IrqHandler: Send + Sync {
    fn handle_irq(&self, irq: u8);
}

/// The embedding kernel's syscall surface. Installed once at boot; the
/// trap path routes every syscall trap through it.
pub trait SyscallDispatcher: Send + Sync {
    fn dispatch(&self, kernel: &Kernel, tf: &mut TrapFrame);
}

/// The one kernel context.
pub struct Kernel {
    frames: Arc<FrameAllocator>,
    layout: Arc<KernelLayout>,
    procs: ProcessTable,
    ticks: Ticks,
    /// The kernel-only address space, active when no process is.
    kernel_space: AddressSpace,
    irq_handlers: Mutex<[Option<&'static dyn IrqHandler>; NIRQ]>,
    /// End-of-interrupt hook supplied by the interrupt-controller driver.
    irq_eoi: Mutex<Option<fn()>>,
    syscalls: Once<&'static dyn SyscallDispatcher>,
    fsys: Once<Arc<dyn Filesystem>>,
}

impl Kernel {
    /// Build a kernel context from a seeded allocator and the boot layout.
    pub fn new(frames: Arc<FrameAllocator>, layout: Arc<KernelLayout>) -> Result<Kernel, VmError> {
        let kernel_space = AddressSpace::new_kernel_mapped(frames.clone(), layout.clone())?;
        Ok(Kernel {
            procs: ProcessTable::new(frames.clone(), layout.clone()),
            ticks: Ticks::new(),
            kernel_space,
            frames,
            layout,
            irq_handlers: Mutex::new([None; NIRQ]),
            irq_eoi: Mutex::new(None),
            syscalls: Once::new(),
            fsys: Once::new(),
        })
    }

    pub fn procs(&self) -> &ProcessTable {
        &self.procs
    }

    pub fn ticks(&self) -> &Ticks {
        &self.ticks
    }

    pub fn frames(&self) -> &Arc<FrameAllocator> {
        &self.frames
    }

    pub fn layout(&self) -> &Arc<KernelLayout> {
        &self.layout
    }

    pub fn kernel_space(&self) -> &AddressSpace {
        &self.kernel_space
    }

    // ========================================================================
    // Collaborator registration
    // ========================================================================

    /// Install the syscall dispatcher. The first installation wins.
    pub fn set_syscall_dispatcher(&self, dispatcher: &'static dyn SyscallDispatcher) {
        self.syscalls.call_once(|| dispatcher);
    }

    /// Route a syscall trap to the installed dispatcher. With none
    /// installed the syscall fails like an unknown number would.
    pub fn dispatch_syscall(&self, tf: &mut TrapFrame) {
        match self.syscalls.get() {
            Some(dispatcher) => dispatcher.dispatch(self, tf),
            None => {
                log::warn!("syscall {} with no dispatcher installed", tf.rax);
                tf.rax = u64::MAX;
            }
        }
    }

    /// Install the file-system collaborator. The first installation wins.
    pub fn set_filesystem(&self, fsys: Arc<dyn Filesystem>) {
        self.fsys.call_once(|| fsys);
    }

    pub fn filesystem(&self) -> Option<&Arc<dyn Filesystem>> {
        self.fsys.get()
    }

    /// Claim interrupt line `irq` for `handler`. Double registration is a
    /// configuration bug and panics.
    pub fn register_irq(&self, irq: u8, handler: &'static dyn IrqHandler) {
        let mut handlers = self.irq_handlers.lock();
        if handlers[irq as usize].is_some() {
            panic!("irq {} already claimed", irq);
        }
        handlers[irq as usize] = Some(handler);
    }

    /// Install the end-of-interrupt hook.
    pub fn set_irq_eoi(&self, eoi: fn()) {
        *self.irq_eoi.lock() = Some(eoi);
    }

    /// Deliver a device interrupt to its registered handler. Returns false
    /// for an unclaimed line.
    pub(crate) fn handle_irq(&self, irq: u8) -> bool {
        let handler = self.irq_handlers.lock()[irq as usize % NIRQ];
        match handler {
            Some(h) => {
                h.handle_irq(irq);
                true
            }
            None => false,
        }
    }

    /// Acknowledge the current interrupt with the controller.
    pub(crate) fn irq_eoi(&self) {
        let eoi = *self.irq_eoi.lock();
        if let Some(f) = eoi {
            f();
        }
    }
}

// ============================================================================
// The global context
// ============================================================================

static KERNEL: Once<Kernel> = Once::new();

/// Install the kernel context built by boot code. Called once.
pub fn install(kernel: Kernel) -> &'static Kernel {
    if KERNEL.get().is_some() {
        panic!("kernel context installed twice");
    }
    KERNEL.call_once(|| kernel)
}

/// The installed kernel context. Panics before [`install`].
pub fn kernel() -> &'static Kernel {
    match KERNEL.get() {
        Some(k) => k,
        None => panic!("kernel context not installed"),
    }
}
