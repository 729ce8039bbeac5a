//! exec: replace the current process's image with an ELF executable.
//!
//! The new image is built in a scratch address space while the old one
//! keeps running; nothing about the caller changes until every segment,
//! the stack, and the argument block are in place. Only then does the
//! commit step swap the spaces and rewrite the return frame, so a failed
//! exec leaves the process exactly as it was.

use alloc::vec::Vec;

use crate::fs::{Filesystem, Inode};
use crate::kernel::Kernel;
use crate::mm::addr_space::VmError;
use crate::mm::page_table::Perm;
use crate::mm::{page_round_up, AddressSpace, PAGE_SIZE};
use crate::syscall::MAXARG;

const ELF_MAGIC: u32 = 0x464C457F;
const PT_LOAD: u32 = 1;
const PF_EXEC: u32 = 1;
const PF_WRITE: u32 = 2;
/// Size of a 64-bit program header entry
const PHENT_SIZE: u16 = 56;

/// Why an exec failed. The caller keeps its old image in every case.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecError {
    /// No file-system collaborator, or the path does not resolve.
    NotFound,
    /// The file is not a loadable ELF executable.
    BadImage,
    /// The argument block does not fit the stack page.
    TooManyArgs,
    /// No frames left for the new image.
    OutOfMemory,
    /// The collaborator failed while reading the file.
    Io,
}

impl From<VmError> for ExecError {
    fn from(e: VmError) -> ExecError {
        match e {
            VmError::OutOfMemory => ExecError::OutOfMemory,
            VmError::TooBig => ExecError::BadImage,
            VmError::BadAddress => ExecError::TooManyArgs,
            VmError::Io => ExecError::Io,
        }
    }
}

// ============================================================================
// Header parsing
// ============================================================================

fn u16_at(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([buf[off], buf[off + 1]])
}

fn u32_at(buf: &[u8], off: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&buf[off..off + 4]);
    u32::from_le_bytes(raw)
}

fn u64_at(buf: &[u8], off: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[off..off + 8]);
    u64::from_le_bytes(raw)
}

struct ElfHeader {
    entry: u64,
    phoff: u64,
    phnum: u16,
}

impl ElfHeader {
    fn parse(buf: &[u8; 64]) -> Option<ElfHeader> {
        if u32_at(buf, 0) != ELF_MAGIC {
            return None;
        }
        if u16_at(buf, 54) != PHENT_SIZE {
            return None;
        }
        Some(ElfHeader {
            entry: u64_at(buf, 24),
            phoff: u64_at(buf, 32),
            phnum: u16_at(buf, 56),
        })
    }
}

struct ProgHeader {
    kind: u32,
    flags: u32,
    offset: u64,
    vaddr: u64,
    filesz: u64,
    memsz: u64,
}

impl ProgHeader {
    fn parse(buf: &[u8; 56]) -> ProgHeader {
        ProgHeader {
            kind: u32_at(buf, 0),
            flags: u32_at(buf, 4),
            offset: u64_at(buf, 8),
            vaddr: u64_at(buf, 16),
            filesz: u64_at(buf, 32),
            memsz: u64_at(buf, 40),
        }
    }

    fn perm(&self) -> Perm {
        let mut perm = Perm::empty();
        if self.flags & PF_WRITE != 0 {
            perm |= Perm::WRITE;
        }
        if self.flags & PF_EXEC != 0 {
            perm |= Perm::EXEC;
        }
        perm
    }
}

fn read_exact(
    fsys: &dyn Filesystem,
    inode: &Inode,
    offset: u64,
    buf: &mut [u8],
) -> Result<(), ExecError> {
    match fsys.read(inode, offset, buf) {
        Ok(n) if n == buf.len() => Ok(()),
        Ok(_) => Err(ExecError::BadImage),
        Err(_) => Err(ExecError::Io),
    }
}

// ============================================================================
// The loader
// ============================================================================

/// Replace the current process's image with the executable at `path`,
/// passing `argv`. On success the process next returns to user mode at the
/// new entry point with `argc` and `argv` in the argument registers.
pub fn exec(kernel: &Kernel, path: &str, argv: &[&str]) -> Result<(), ExecError> {
    if argv.len() > MAXARG {
        return Err(ExecError::TooManyArgs);
    }
    let fsys = kernel.filesystem().ok_or(ExecError::NotFound)?;
    let inode = fsys.resolve_path(path).ok_or(ExecError::NotFound)?;

    let mut raw = [0u8; 64];
    read_exact(fsys.as_ref(), &inode, 0, &mut raw)?;
    let header = ElfHeader::parse(&raw).ok_or(ExecError::BadImage)?;

    let mut space =
        AddressSpace::new_kernel_mapped(kernel.frames().clone(), kernel.layout().clone())
            .map_err(ExecError::from)?;

    // Load every PT_LOAD segment, growing the region to cover it.
    let mut sz = 0usize;
    for i in 0..header.phnum {
        let mut raw = [0u8; 56];
        let at = header.phoff + i as u64 * PHENT_SIZE as u64;
        read_exact(fsys.as_ref(), &inode, at, &mut raw)?;
        let ph = ProgHeader::parse(&raw);
        if ph.kind != PT_LOAD {
            continue;
        }
        if ph.memsz < ph.filesz {
            return Err(ExecError::BadImage);
        }
        if ph.vaddr % PAGE_SIZE as u64 != 0 {
            return Err(ExecError::BadImage);
        }
        // Segments must arrive in ascending order; a vaddr inside the
        // region built so far would overwrite an earlier segment.
        if (ph.vaddr as usize) < sz {
            return Err(ExecError::BadImage);
        }
        let end = ph
            .vaddr
            .checked_add(ph.memsz)
            .ok_or(ExecError::BadImage)? as usize;
        sz = space.grow(sz, end, ph.perm()).map_err(|e| match e {
            VmError::TooBig => ExecError::BadImage,
            other => ExecError::from(other),
        })?;
        space.load_segment(
            ph.vaddr as usize,
            fsys.as_ref(),
            &inode,
            ph.offset,
            ph.filesz as usize,
        )?;
    }

    // Two stack pages: the lower one becomes the inaccessible guard.
    sz = page_round_up(sz);
    let guard = sz;
    sz = space
        .grow(sz, sz + 2 * PAGE_SIZE, Perm::WRITE)
        .map_err(ExecError::from)?;
    space.clear_user(guard);

    // Argument block, top down: strings, the argv vector, a fake return
    // pc. Running into the guard page fails the copy, not the kernel.
    let mut sp = sz;
    let mut arg_ptrs: Vec<u64> = Vec::with_capacity(argv.len() + 1);
    for arg in argv {
        sp = (sp - (arg.len() + 1)) & !7;
        space.copy_out(sp, arg.as_bytes()).map_err(ExecError::from)?;
        space
            .copy_out(sp + arg.len(), &[0])
            .map_err(ExecError::from)?;
        arg_ptrs.push(sp as u64);
    }
    arg_ptrs.push(0);

    sp -= arg_ptrs.len() * 8;
    let argv_va = sp;
    let mut vector = Vec::with_capacity(arg_ptrs.len() * 8);
    for ptr in &arg_ptrs {
        vector.extend_from_slice(&ptr.to_le_bytes());
    }
    space.copy_out(argv_va, &vector).map_err(ExecError::from)?;

    sp -= 8;
    space
        .copy_out(sp, &u64::MAX.to_le_bytes())
        .map_err(ExecError::from)?;

    // Commit: from here on the process is the new image.
    let table = kernel.procs();
    let cur = match table.current() {
        Some(c) => c,
        None => panic!("exec: no current process"),
    };
    let name = path.rsplit('/').next().unwrap_or(path);
    space.install();

    let body = unsafe { table.body(cur) };
    body.trapframe.rip = header.entry;
    body.trapframe.rsp = sp as u64;
    body.trapframe.rdi = argv.len() as u64;
    body.trapframe.rsi = argv_va as u64;
    body.set_name(name);
    body.sz = sz;
    let old = body.space.replace(space);
    drop(old);
    Ok(())
}
