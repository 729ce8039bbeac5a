//! Kernel context switch.
//!
//! A [`Context`] is the callee-saved register block of a suspended kernel
//! execution. Switches happen only at a call boundary, so the caller-saved
//! registers are already dead and the block stays small: the callee-saved
//! set plus the stack pointer. The word at the top of the saved stack is the
//! address execution resumes at when the block is switched to.
//!
//! [`switch`] is the single unsafe switching boundary in the kernel; every
//! transfer of control between executions goes through it.

// ============================================================================
// Saved register block
// ============================================================================

/// Callee-saved registers of a suspended kernel execution.
///
/// Field order is the layout the assembly in this file stores to; the two
/// must change together.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct Context {
    pub rsp: u64,
    pub rbx: u64,
    pub rbp: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
}

impl Context {
    pub const fn zero() -> Self {
        Context {
            rsp: 0,
            rbx: 0,
            rbp: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
        }
    }

    /// Build a first-run block: switching to it "returns" into `entry` on
    /// the given stack.
    ///
    /// # Safety
    ///
    /// `stack_top` must be the exclusive, 16-byte-aligned top of a live
    /// kernel stack with room for at least one word.
    pub unsafe fn first_run(entry: extern "C" fn(), stack_top: *mut u8) -> Self {
        let slot = stack_top.cast::<u64>().sub(1);
        slot.write(entry as usize as u64);
        Context {
            rsp: slot as u64,
            ..Default::default()
        }
    }
}

// ============================================================================
// The switch primitive
// ============================================================================

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
core::arch::global_asm!(
    r#"
.globl vireo_swtch
vireo_swtch:
    mov [rdi + 0x00], rsp
    mov [rdi + 0x08], rbx
    mov [rdi + 0x10], rbp
    mov [rdi + 0x18], r12
    mov [rdi + 0x20], r13
    mov [rdi + 0x28], r14
    mov [rdi + 0x30], r15

    mov rsp, [rsi + 0x00]
    mov rbx, [rsi + 0x08]
    mov rbp, [rsi + 0x10]
    mov r12, [rsi + 0x18]
    mov r13, [rsi + 0x20]
    mov r14, [rsi + 0x28]
    mov r15, [rsi + 0x30]
    ret
"#
);

/// Save the current execution into `old` and resume the one saved in `new`.
/// Returns when something later switches back to `old`.
///
/// # Safety
///
/// `old` must be writable, `new` must hold a context saved by this function
/// or built by [`Context::first_run`], and the stack `new` carries must be
/// live and not in use by any other core.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub unsafe fn switch(old: *mut Context, new: *const Context) {
    extern "C" {
        fn vireo_swtch(old: *mut Context, new: *const Context);
    }
    vireo_swtch(old, new)
}

/// Hosted builds never transfer control through saved registers; blocking is
/// emulated in [`crate::proc::scheduler`] instead.
#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
pub unsafe fn switch(_old: *mut Context, _new: *const Context) {
    unreachable!("register context switch is only available on bare metal");
}
