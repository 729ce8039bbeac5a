//! External collaborator interfaces for storage and files.
//!
//! The kernel core carries no on-disk format and no buffer cache; the block
//! device, the file system, and the console are supplied by the embedding
//! kernel through the traits here. What the core does own is the open-file
//! object: refcounted, shared across fork by cloning the `Arc`, closed when
//! the last clone drops.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};

/// Bytes per storage block
pub const BLOCK_SIZE: usize = 512;

/// Collaborator I/O failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoError {
    /// The device reported a hard error.
    Device,
    /// The request falls outside the medium or file.
    OutOfRange,
    /// Write to a read-only object.
    ReadOnly,
}

// ============================================================================
// Collaborator traits
// ============================================================================

/// A block device. Calls may block the calling process (the driver sleeps
/// it until the transfer completes).
pub trait BlockStorage: Send + Sync {
    fn read_block(&self, block: u64, buf: &mut [u8; BLOCK_SIZE]) -> Result<(), IoError>;
    fn write_block(&self, block: u64, buf: &[u8; BLOCK_SIZE]) -> Result<(), IoError>;
}

/// The file-system collaborator: path resolution and inode reads, which is
/// all the core needs for exec and inode-backed files.
pub trait Filesystem: Send + Sync {
    /// Resolve an absolute path to an inode handle.
    fn resolve_path(&self, path: &str) -> Option<Inode>;
    /// Read file bytes at `offset`; short reads only at end of file.
    fn read(&self, inode: &Inode, offset: u64, buf: &mut [u8]) -> Result<usize, IoError>;
}

/// A byte-stream device such as the console.
pub trait CharDevice: Send + Sync {
    /// Next input byte, or `None` when no input is pending.
    fn read_byte(&self) -> Option<u8>;
    fn write_byte(&self, byte: u8);
}

// ============================================================================
// Inodes and open files
// ============================================================================

/// Handle to a file-system object, opaque to the core beyond its identity
/// and size. Used for open files and the per-process working directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Inode {
    pub dev: u32,
    pub inum: u32,
    pub size: u64,
}

/// What an open file reads from and writes to.
pub enum FileBacking {
    Device(&'static dyn CharDevice),
    Inode {
        fsys: Arc<dyn Filesystem>,
        inode: Inode,
    },
}

/// An open file. Shared across fork by cloning the `Arc` that holds it, so
/// the read/write offset is shared too; the object closes when the last
/// clone drops.
pub struct File {
    backing: FileBacking,
    readable: bool,
    writable: bool,
    offset: AtomicU64,
}

impl File {
    pub fn from_device(dev: &'static dyn CharDevice, readable: bool, writable: bool) -> Arc<File> {
        Arc::new(File {
            backing: FileBacking::Device(dev),
            readable,
            writable,
            offset: AtomicU64::new(0),
        })
    }

    pub fn from_inode(
        fsys: Arc<dyn Filesystem>,
        inode: Inode,
        readable: bool,
        writable: bool,
    ) -> Arc<File> {
        Arc::new(File {
            backing: FileBacking::Inode { fsys, inode },
            readable,
            writable,
            offset: AtomicU64::new(0),
        })
    }

    pub fn readable(&self) -> bool {
        self.readable
    }

    pub fn writable(&self) -> bool {
        self.writable
    }

    pub fn offset(&self) -> u64 {
        self.offset.load(Ordering::Relaxed)
    }

    /// Read up to `buf.len()` bytes, advancing the shared offset.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, IoError> {
        if !self.readable {
            return Err(IoError::ReadOnly);
        }
        match &self.backing {
            FileBacking::Device(dev) => {
                let mut n = 0;
                for slot in buf.iter_mut() {
                    match dev.read_byte() {
                        Some(b) => {
                            *slot = b;
                            n += 1;
                        }
                        None => break,
                    }
                }
                Ok(n)
            }
            FileBacking::Inode { fsys, inode } => {
                let at = self.offset.load(Ordering::Relaxed);
                let n = fsys.read(inode, at, buf)?;
                self.offset.fetch_add(n as u64, Ordering::Relaxed);
                Ok(n)
            }
        }
    }

    /// Write `buf`, advancing the shared offset. Inode-backed writes go
    /// through the file-system collaborator, which this core does not
    /// require to support writing.
    pub fn write(&self, buf: &[u8]) -> Result<usize, IoError> {
        if !self.writable {
            return Err(IoError::ReadOnly);
        }
        match &self.backing {
            FileBacking::Device(dev) => {
                for &b in buf {
                    dev.write_byte(b);
                }
                Ok(buf.len())
            }
            FileBacking::Inode { .. } => Err(IoError::ReadOnly),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[test]
    fn test_device_file_roundtrip() {
        static CONSOLE: LoopbackConsole = LoopbackConsole::new();

        let file = File::from_device(&CONSOLE, true, true);
        assert_eq!(file.write(b"hi").unwrap(), 2);

        let mut buf = [0u8; 8];
        assert_eq!(file.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"hi");
        // Input drained.
        assert_eq!(file.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_permission_bits_enforced() {
        static CONSOLE: LoopbackConsole = LoopbackConsole::new();

        let read_only = File::from_device(&CONSOLE, true, false);
        assert_eq!(read_only.write(b"x"), Err(IoError::ReadOnly));
        let write_only = File::from_device(&CONSOLE, false, true);
        assert_eq!(write_only.read(&mut [0u8; 1]), Err(IoError::ReadOnly));
    }

    #[test]
    fn test_inode_file_shares_offset_across_clones() {
        let fsys = alloc::sync::Arc::new(FakeFs::new());
        fsys.add("/data", b"abcdef");
        let inode = fsys.resolve_path("/data").unwrap();
        assert_eq!(inode.size, 6);

        let file = File::from_inode(fsys, inode, true, false);
        let other = file.clone();

        let mut buf = [0u8; 3];
        assert_eq!(file.read(&mut buf).unwrap(), 3);
        assert_eq!(&buf, b"abc");
        // The clone continues where the original left off.
        assert_eq!(other.read(&mut buf).unwrap(), 3);
        assert_eq!(&buf, b"def");
    }

    #[test]
    fn test_missing_path_resolves_to_none() {
        let fsys = FakeFs::new();
        assert!(fsys.resolve_path("/nope").is_none());
    }
}
