//! Common types used across vireo
//!
//! This module defines shared types to avoid circular dependencies.

/// Process identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Pid(pub u32);

impl Pid {
    /// The init process, adoptive parent of every orphan.
    pub const INIT: Pid = Pid(1);
}

/// Physical CPU core identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct CpuId(pub usize);

/// A wait channel: an opaque token matching sleepers with wakers.
///
/// Only equality of the token matters. By convention a channel is derived
/// from the address of the object being waited on, which stays unique for
/// as long as the wait is meaningful. Token zero is reserved for "not
/// waiting" and can never be produced by [`Channel::of`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Channel(pub usize);

impl Channel {
    /// Derive a channel from the address of `obj`.
    pub fn of<T>(obj: &T) -> Self {
        Channel(obj as *const T as usize)
    }
}
