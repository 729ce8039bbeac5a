//! Memory management: physical frames, kernel layout, page tables, and
//! address spaces.

pub mod addr_space;
pub mod frame;
pub mod layout;
pub mod page_table;

pub use addr_space::AddressSpace;
pub use frame::{Frame, FrameAllocator};
pub use layout::KernelLayout;

/// Size of one page / frame
pub const PAGE_SIZE: usize = 4096;
/// log2 of the page size
pub const PAGE_SHIFT: usize = 12;

/// A physical address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PhysicalAddress(pub usize);

impl PhysicalAddress {
    pub const fn new(addr: usize) -> Self {
        PhysicalAddress(addr)
    }

    pub const fn as_usize(&self) -> usize {
        self.0
    }

    pub const fn is_page_aligned(&self) -> bool {
        self.0 % PAGE_SIZE == 0
    }
}

/// A virtual address (kernel or user)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct VirtualAddress(pub usize);

impl VirtualAddress {
    pub const fn new(addr: usize) -> Self {
        VirtualAddress(addr)
    }

    pub const fn as_usize(&self) -> usize {
        self.0
    }

    pub const fn is_page_aligned(&self) -> bool {
        self.0 % PAGE_SIZE == 0
    }

    pub const fn as_ptr(&self) -> *const u8 {
        self.0 as *const u8
    }

    pub const fn as_mut_ptr(&self) -> *mut u8 {
        self.0 as *mut u8
    }
}

/// Round `n` up to the next page boundary.
pub const fn page_round_up(n: usize) -> usize {
    (n + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

/// Round `n` down to a page boundary.
pub const fn page_round_down(n: usize) -> usize {
    n & !(PAGE_SIZE - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_rounding() {
        assert_eq!(page_round_up(0), 0);
        assert_eq!(page_round_up(1), PAGE_SIZE);
        assert_eq!(page_round_up(PAGE_SIZE), PAGE_SIZE);
        assert_eq!(page_round_down(PAGE_SIZE + 17), PAGE_SIZE);
        assert!(PhysicalAddress::new(8192).is_page_aligned());
        assert!(!VirtualAddress::new(8193).is_page_aligned());
    }
}
