//! x86-64 page-table structures.
//!
//! Four levels, 512 eight-byte entries per table, translating 48-bit
//! canonical virtual addresses. The types here are plain data; walking and
//! ownership live in [`crate::mm::addr_space`].

use bitflags::bitflags;

use crate::mm::PhysicalAddress;

// ============================================================================
// Constants
// ============================================================================

/// Entries per table at every level
pub const ENTRIES_PER_TABLE: usize = 512;

/// Number of translation levels
pub const LEVELS: u8 = 4;

/// Bits of physical address carried by an entry
const ADDR_MASK: u64 = 0x000f_ffff_ffff_f000;

bitflags! {
    /// Hardware page-table entry flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u64 {
        /// Present
        const P = 1 << 0;
        /// Writable
        const W = 1 << 1;
        /// User-accessible
        const U = 1 << 2;
        /// Large page (level 2/3 leaves, unused by this kernel)
        const PS = 1 << 7;
        /// Accessed
        const A = 1 << 5;
        /// Dirty
        const D = 1 << 6;
        /// Software bit: the mapped frame belongs to the address space and
        /// is returned to the allocator when the region is freed.
        const OWNED = 1 << 9;
        /// Execute-disable
        const XD = 1 << 63;
    }
}

bitflags! {
    /// Mapping permissions as requested by callers; read access is implied.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Perm: u8 {
        const WRITE = 1 << 0;
        const USER = 1 << 1;
        const EXEC = 1 << 2;
    }
}

impl Perm {
    /// Leaf-entry flags realizing these permissions.
    pub fn to_pte_flags(self) -> PteFlags {
        let mut flags = PteFlags::P;
        if self.contains(Perm::WRITE) {
            flags |= PteFlags::W;
        }
        if self.contains(Perm::USER) {
            flags |= PteFlags::U;
        }
        if !self.contains(Perm::EXEC) {
            flags |= PteFlags::XD;
        }
        flags
    }
}

// ============================================================================
// Entries
// ============================================================================

/// One page-table entry at any level.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, Default)]
pub struct PageTableEntry(u64);

impl PageTableEntry {
    pub const fn zero() -> Self {
        PageTableEntry(0)
    }

    pub fn is_present(&self) -> bool {
        self.0 & PteFlags::P.bits() != 0
    }

    pub fn is_user(&self) -> bool {
        self.0 & PteFlags::U.bits() != 0
    }

    /// Physical address of the frame or next-level table this entry points at.
    pub fn addr(&self) -> PhysicalAddress {
        PhysicalAddress::new((self.0 & ADDR_MASK) as usize)
    }

    pub fn flags(&self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0 & !ADDR_MASK)
    }

    pub fn set(&mut self, pa: PhysicalAddress, flags: PteFlags) {
        self.0 = (pa.0 as u64 & ADDR_MASK) | flags.bits();
    }

    pub fn clear(&mut self) {
        self.0 = 0;
    }

    /// Revoke user access without otherwise changing the entry.
    pub fn clear_user(&mut self) {
        self.0 &= !PteFlags::U.bits();
    }
}

// ============================================================================
// Indexing
// ============================================================================

/// Shift amount selecting the index bits for `level` (1 = leaf tables).
pub const fn level_shift(level: u8) -> usize {
    12 + 9 * (level as usize - 1)
}

/// Index into the table at `level` for virtual address `va`.
pub const fn level_index(va: usize, level: u8) -> usize {
    (va >> level_shift(level)) & (ENTRIES_PER_TABLE - 1)
}

/// Size of the region covered by one entry at `level`.
pub const fn level_span(level: u8) -> usize {
    1 << level_shift(level)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_indexing() {
        // Index fields are 9 bits wide, starting at bit 12.
        let va = 0x0000_7f3a_1234_5678usize;
        assert_eq!(level_index(va, 1), (va >> 12) & 0x1ff);
        assert_eq!(level_index(va, 2), (va >> 21) & 0x1ff);
        assert_eq!(level_index(va, 3), (va >> 30) & 0x1ff);
        assert_eq!(level_index(va, 4), (va >> 39) & 0x1ff);
        assert_eq!(level_span(1), 4096);
        assert_eq!(level_span(2), 2 * 1024 * 1024);
    }

    #[test]
    fn test_entry_roundtrip() {
        let mut e = PageTableEntry::zero();
        assert!(!e.is_present());
        e.set(
            PhysicalAddress::new(0x7000),
            PteFlags::P | PteFlags::W | PteFlags::U,
        );
        assert!(e.is_present());
        assert!(e.is_user());
        assert_eq!(e.addr(), PhysicalAddress::new(0x7000));
        assert_eq!(e.flags(), PteFlags::P | PteFlags::W | PteFlags::U);
        e.clear_user();
        assert!(!e.is_user());
        assert!(e.is_present());
        e.clear();
        assert!(!e.is_present());
    }

    #[test]
    fn test_perm_translation() {
        let rw = Perm::WRITE.to_pte_flags();
        assert!(rw.contains(PteFlags::P | PteFlags::W | PteFlags::XD));
        assert!(!rw.contains(PteFlags::U));

        let user_exec = (Perm::USER | Perm::EXEC).to_pte_flags();
        assert!(user_exec.contains(PteFlags::P | PteFlags::U));
        assert!(!user_exec.contains(PteFlags::XD));
        assert!(!user_exec.contains(PteFlags::W));
    }
}
