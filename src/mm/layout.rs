//! Kernel memory layout.
//!
//! At boot the loader hands the kernel a table of physical ranges: where the
//! kernel image sits, which ranges are device registers, and which ranges
//! are general-purpose heap. The table is consumed twice: the heap ranges
//! seed the frame allocator, and every range is mirrored into each address
//! space's kernel half so kernel code runs identically no matter which
//! process is current.
//!
//! All physical memory is reachable through a direct map at `KERNBASE`.
//! Hosted builds run identity-mapped (frames are ordinary process memory),
//! so the direct map degenerates to offset zero and page-table walks work on
//! real data during tests.

use heapless::Vec;

use crate::mm::page_table::Perm;
use crate::mm::{PhysicalAddress, VirtualAddress};

// ============================================================================
// Constants
// ============================================================================

/// First virtual address of the kernel direct map.
#[cfg(target_os = "none")]
pub const KERNBASE: usize = 0xffff_8000_0000_0000;

/// Hosted builds are identity-mapped.
#[cfg(not(target_os = "none"))]
pub const KERNBASE: usize = 0;

/// Exclusive upper bound on user mappings: the bottom half of the canonical
/// 48-bit address space belongs to user code.
pub const USER_TOP: usize = 1 << 47;

/// Capacity of the boot-supplied range table.
pub const MAX_KERNEL_RANGES: usize = 16;

// ============================================================================
// Direct-map conversion
// ============================================================================

/// Kernel virtual address of a physical address, via the direct map.
pub const fn phys_to_virt(pa: PhysicalAddress) -> VirtualAddress {
    VirtualAddress::new(pa.0 + KERNBASE)
}

/// Physical address backing a direct-map virtual address.
pub const fn virt_to_phys(va: VirtualAddress) -> PhysicalAddress {
    PhysicalAddress::new(va.0 - KERNBASE)
}

// ============================================================================
// Range table
// ============================================================================

/// One physical range described by the boot loader.
#[derive(Debug, Clone, Copy)]
pub struct KernelRange {
    pub start: PhysicalAddress,
    pub end: PhysicalAddress,
    /// Permissions for the kernel mapping of this range.
    pub perm: Perm,
    /// General-purpose heap ranges seed the frame allocator.
    pub heap: bool,
}

/// The boot-supplied map of kernel physical memory.
#[derive(Debug, Clone, Default)]
pub struct KernelLayout {
    ranges: Vec<KernelRange, MAX_KERNEL_RANGES>,
}

impl KernelLayout {
    pub const fn new() -> Self {
        KernelLayout { ranges: Vec::new() }
    }

    /// Register a physical range. Overflowing the table is a configuration
    /// bug and panics.
    pub fn add_range(
        &mut self,
        start: PhysicalAddress,
        end: PhysicalAddress,
        perm: Perm,
        heap: bool,
    ) {
        if start.0 >= end.0 {
            panic!("kernel layout: empty range {:#x}..{:#x}", start.0, end.0);
        }
        let range = KernelRange {
            start,
            end,
            perm,
            heap,
        };
        if self.ranges.push(range).is_err() {
            panic!("kernel layout: too many ranges");
        }
    }

    /// All registered ranges, in registration order.
    pub fn ranges(&self) -> &[KernelRange] {
        &self.ranges
    }

    /// Only the general-purpose heap ranges.
    pub fn heap_ranges(&self) -> impl Iterator<Item = &KernelRange> {
        self.ranges.iter().filter(|r| r.heap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_registration() {
        let mut layout = KernelLayout::new();
        layout.add_range(
            PhysicalAddress::new(0x1000),
            PhysicalAddress::new(0x5000),
            Perm::WRITE,
            false,
        );
        layout.add_range(
            PhysicalAddress::new(0x10000),
            PhysicalAddress::new(0x20000),
            Perm::WRITE,
            true,
        );
        assert_eq!(layout.ranges().len(), 2);
        assert_eq!(layout.heap_ranges().count(), 1);
        assert_eq!(layout.heap_ranges().next().unwrap().start.0, 0x10000);
    }

    #[test]
    #[should_panic(expected = "too many ranges")]
    fn test_range_table_overflow_panics() {
        let mut layout = KernelLayout::new();
        for i in 0..=MAX_KERNEL_RANGES {
            let base = (i + 1) * 0x1000;
            layout.add_range(
                PhysicalAddress::new(base),
                PhysicalAddress::new(base + 0x1000),
                Perm::empty(),
                false,
            );
        }
    }

    #[test]
    #[should_panic(expected = "empty range")]
    fn test_empty_range_panics() {
        let mut layout = KernelLayout::new();
        layout.add_range(
            PhysicalAddress::new(0x2000),
            PhysicalAddress::new(0x2000),
            Perm::empty(),
            false,
        );
    }

    #[test]
    fn test_direct_map_roundtrip() {
        let pa = PhysicalAddress::new(0x42000);
        assert_eq!(virt_to_phys(phys_to_virt(pa)), pa);
    }
}
