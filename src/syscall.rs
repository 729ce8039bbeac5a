//! The syscall surface: numbers, the dispatcher, and the process-facing
//! handlers.
//!
//! Numbers are fixed ABI and survive as an enum; an unknown number is
//! logged and fails with -1, never undefined behavior. The handlers here
//! cover the process lifecycle; calls that live entirely in the
//! file-system layer are the embedding kernel's to dispatch, so the stock
//! dispatcher fails them the same way it fails unknown numbers.
//!
//! Convention: the number arrives in `rax`, arguments in `rdi` and `rsi`,
//! and the result goes back out through `rax`, with -1 for failure.

use alloc::string::String;
use alloc::vec::Vec;

use crate::kernel::{Kernel, SyscallDispatcher};
use crate::mm::AddressSpace;
use crate::proc::exec;
use crate::trap::TrapFrame;
use crate::types::Pid;

/// Most arguments an exec image can carry
pub const MAXARG: usize = 32;
/// Cap on a string fetched from user space
const MAX_STR: usize = 4096;

/// The syscall numbers. The full numbering is ABI even where this core
/// leaves the file-system half to the embedding kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum Syscall {
    Fork = 1,
    Exit = 2,
    Wait = 3,
    Pipe = 4,
    Read = 5,
    Kill = 6,
    Exec = 7,
    Fstat = 8,
    Chdir = 9,
    Dup = 10,
    Getpid = 11,
    Sbrk = 12,
    Sleep = 13,
    Uptime = 14,
    Open = 15,
    Write = 16,
    Mknod = 17,
    Unlink = 18,
    Link = 19,
    Mkdir = 20,
    Close = 21,
}

impl Syscall {
    pub fn from_number(n: u64) -> Option<Syscall> {
        Some(match n {
            1 => Syscall::Fork,
            2 => Syscall::Exit,
            3 => Syscall::Wait,
            4 => Syscall::Pipe,
            5 => Syscall::Read,
            6 => Syscall::Kill,
            7 => Syscall::Exec,
            8 => Syscall::Fstat,
            9 => Syscall::Chdir,
            10 => Syscall::Dup,
            11 => Syscall::Getpid,
            12 => Syscall::Sbrk,
            13 => Syscall::Sleep,
            14 => Syscall::Uptime,
            15 => Syscall::Open,
            16 => Syscall::Write,
            17 => Syscall::Mknod,
            18 => Syscall::Unlink,
            19 => Syscall::Link,
            20 => Syscall::Mkdir,
            21 => Syscall::Close,
            _ => return None,
        })
    }
}

// ============================================================================
// The stock dispatcher
// ============================================================================

/// Dispatcher covering the process-lifecycle syscalls. An embedding kernel
/// with a full file-system layer wraps this and handles the rest.
pub struct ProcSyscalls;

impl SyscallDispatcher for ProcSyscalls {
    fn dispatch(&self, kernel: &Kernel, tf: &mut TrapFrame) {
        let result: i64 = match Syscall::from_number(tf.rax) {
            Some(Syscall::Fork) => sys_fork(kernel),
            Some(Syscall::Exit) => sys_exit(kernel, tf.rdi as i32),
            Some(Syscall::Wait) => sys_wait(kernel, tf.rdi as usize),
            Some(Syscall::Kill) => sys_kill(kernel, tf.rdi),
            Some(Syscall::Exec) => sys_exec(kernel, tf),
            Some(Syscall::Getpid) => sys_getpid(kernel),
            Some(Syscall::Sbrk) => sys_sbrk(kernel, tf.rdi as i64),
            Some(Syscall::Sleep) => sys_sleep(kernel, tf.rdi),
            Some(Syscall::Uptime) => sys_uptime(kernel),
            Some(other) => {
                log::warn!(
                    "pid {:?}: syscall {:?} not handled by this dispatcher",
                    kernel.procs().current_pid(),
                    other
                );
                -1
            }
            None => {
                log::warn!(
                    "pid {:?}: unknown syscall {}",
                    kernel.procs().current_pid(),
                    tf.rax
                );
                -1
            }
        };
        tf.rax = result as u64;
    }
}

// ============================================================================
// Handlers
// ============================================================================

fn sys_fork(kernel: &Kernel) -> i64 {
    match kernel.procs().fork() {
        Ok(pid) => pid.0 as i64,
        Err(_) => -1,
    }
}

fn sys_exit(kernel: &Kernel, status: i32) -> i64 {
    kernel.procs().exit(status);
    // Unreached on bare metal; the hosted rendition falls through after
    // the slot turns zombie.
    0
}

/// Wait for a child; a non-zero `status_va` receives the exit status.
fn sys_wait(kernel: &Kernel, status_va: usize) -> i64 {
    let table = kernel.procs();
    let (pid, status) = match table.wait() {
        Ok(r) => r,
        Err(_) => return -1,
    };
    if status_va != 0 {
        let cur = match table.current() {
            Some(c) => c,
            None => panic!("wait: no current process"),
        };
        let body = unsafe { table.body(cur) };
        let space = match body.space.as_mut() {
            Some(s) => s,
            None => panic!("wait: current process has no address space"),
        };
        if space.copy_out(status_va, &status.to_le_bytes()).is_err() {
            return -1;
        }
    }
    pid.0 as i64
}

fn sys_kill(kernel: &Kernel, pid: u64) -> i64 {
    match kernel.procs().kill(Pid(pid as u32)) {
        Ok(()) => 0,
        Err(_) => -1,
    }
}

fn sys_getpid(kernel: &Kernel) -> i64 {
    match kernel.procs().current_pid() {
        Some(pid) => pid.0 as i64,
        None => panic!("getpid: no current process"),
    }
}

/// Grow or shrink the user region; returns the previous break.
fn sys_sbrk(kernel: &Kernel, delta: i64) -> i64 {
    let table = kernel.procs();
    let cur = match table.current() {
        Some(c) => c,
        None => panic!("sbrk: no current process"),
    };
    let old = unsafe { table.body(cur) }.sz;
    match table.grow_user(delta as isize) {
        Ok(_) => old as i64,
        Err(_) => -1,
    }
}

/// Sleep for `n` ticks; abandoned with -1 when the process is killed.
fn sys_sleep(kernel: &Kernel, n: u64) -> i64 {
    let table = kernel.procs();
    let mut ticks = kernel.ticks().lock();
    let start = *ticks;
    while *ticks - start < n {
        if table.current_killed() {
            return -1;
        }
        ticks = table.sleep(kernel.ticks().channel(), ticks);
    }
    0
}

fn sys_uptime(kernel: &Kernel) -> i64 {
    kernel.ticks().get() as i64
}

/// Fetch path and argv from the caller's space and replace its image.
fn sys_exec(kernel: &Kernel, tf: &mut TrapFrame) -> i64 {
    let table = kernel.procs();
    let cur = match table.current() {
        Some(c) => c,
        None => panic!("exec: no current process"),
    };

    let (path, args) = {
        let body = unsafe { table.body(cur) };
        let space = match body.space.as_ref() {
            Some(s) => s,
            None => panic!("exec: current process has no address space"),
        };
        let path = match fetch_str(space, tf.rdi as usize) {
            Some(p) => p,
            None => return -1,
        };
        let mut args: Vec<String> = Vec::new();
        let mut at = tf.rsi as usize;
        loop {
            if args.len() > MAXARG {
                return -1;
            }
            let ptr = match fetch_u64(space, at) {
                Some(p) => p,
                None => return -1,
            };
            if ptr == 0 {
                break;
            }
            match fetch_str(space, ptr as usize) {
                Some(s) => args.push(s),
                None => return -1,
            }
            at += 8;
        }
        (path, args)
    };

    let argv: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
    match exec::exec(kernel, &path, &argv) {
        Ok(()) => {
            // The committed frame is the one that must return to user mode.
            let committed = unsafe { table.body(cur) }.trapframe;
            tf.rip = committed.rip;
            tf.rsp = committed.rsp;
            tf.rdi = committed.rdi;
            tf.rsi = committed.rsi;
            0
        }
        Err(e) => {
            log::warn!("exec {}: {:?}", path, e);
            -1
        }
    }
}

// ============================================================================
// User-memory fetches
// ============================================================================

/// Read a u64 from user memory, tolerating a page straddle.
fn fetch_u64(space: &AddressSpace, va: usize) -> Option<u64> {
    let mut bytes = [0u8; 8];
    for (i, b) in bytes.iter_mut().enumerate() {
        let ka = space.translate(va + i)?;
        *b = unsafe { ka.as_ptr().read() };
    }
    Some(u64::from_le_bytes(bytes))
}

/// Read a NUL-terminated string from user memory. Fails on an unmapped
/// byte, invalid UTF-8, or a missing terminator within [`MAX_STR`].
fn fetch_str(space: &AddressSpace, va: usize) -> Option<String> {
    let mut bytes = Vec::new();
    for i in 0..MAX_STR {
        let ka = space.translate(va + i)?;
        let b = unsafe { ka.as_ptr().read() };
        if b == 0 {
            return String::from_utf8(bytes).ok();
        }
        bytes.push(b);
    }
    None
}
