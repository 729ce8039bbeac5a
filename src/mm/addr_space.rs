//! Address spaces.
//!
//! An [`AddressSpace`] owns a 4-level page-table tree: the root frame, every
//! intermediate table frame, and every leaf frame it allocated for the user
//! region. Kernel mappings are aliases of physical ranges described by the
//! boot layout and are never owned; the [`PteFlags::OWNED`] software bit
//! marks the leaves that are. Destruction is `Drop`: every owned leaf below
//! `USER_TOP` is returned to the allocator, then every table page bottom-up,
//! so teardown is exactly-once by construction.
//!
//! The four near-identical per-level helpers a C rendition would carry are a
//! single walk and a single recursive range-free, both parameterized by
//! level.

use alloc::sync::Arc;

use crate::arch;
use crate::fs::{Filesystem, Inode};
use crate::mm::frame::FrameAllocator;
use crate::mm::layout::{phys_to_virt, KernelLayout, USER_TOP};
use crate::mm::page_table::{
    level_index, level_shift, level_span, PageTableEntry, Perm, PteFlags, ENTRIES_PER_TABLE,
    LEVELS,
};
use crate::mm::{
    page_round_down, page_round_up, PhysicalAddress, VirtualAddress, PAGE_SIZE,
};

/// Address-space operation failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// No frames left for a leaf or table page.
    OutOfMemory,
    /// The requested size crosses `USER_TOP`.
    TooBig,
    /// A user virtual address is unmapped or not user-accessible.
    BadAddress,
    /// The file-system collaborator failed while loading a segment.
    Io,
}

/// One process's (or the kernel's) 4-level page-table tree.
pub struct AddressSpace {
    root: PhysicalAddress,
    frames: Arc<FrameAllocator>,
    layout: Arc<KernelLayout>,
}

// The tree is owned; concurrent access is serialized by the owning process.
unsafe impl Send for AddressSpace {}

/// Direct-map pointer to the entries of a table page.
fn table_ptr(table: PhysicalAddress) -> *mut PageTableEntry {
    phys_to_virt(table).as_mut_ptr() as *mut PageTableEntry
}

impl AddressSpace {
    // ========================================================================
    // Construction
    // ========================================================================

    /// Build a fresh space whose kernel half mirrors the boot layout: every
    /// registered range is mapped at its direct-map address with the range's
    /// permissions, so kernel code runs identically in every space.
    pub fn new_kernel_mapped(
        frames: Arc<FrameAllocator>,
        layout: Arc<KernelLayout>,
    ) -> Result<AddressSpace, VmError> {
        let mut root_frame = frames.alloc().ok_or(VmError::OutOfMemory)?;
        root_frame.zero();
        let mut space = AddressSpace {
            root: root_frame.into_phys(),
            frames,
            layout: layout.clone(),
        };
        for range in layout.ranges() {
            let size = range.end.as_usize() - range.start.as_usize();
            // A failure here drops the partial space, returning its frames.
            space.map_pages(phys_to_virt(range.start), size, range.start, range.perm)?;
        }
        Ok(space)
    }

    /// Physical address of the root table, for CR3.
    pub fn root_phys(&self) -> PhysicalAddress {
        self.root
    }

    /// Make this the active address space on the calling core.
    pub fn install(&self) {
        arch::load_root(self.root.as_usize());
    }

    // ========================================================================
    // Walking
    // ========================================================================

    /// Pointer to the leaf entry for `va`, descending through all four
    /// levels. With `alloc`, missing intermediate tables are created
    /// (zeroed, writable, user); without it, a missing table yields `None`.
    /// Allocation failure also yields `None`.
    fn walk(&self, va: usize, alloc: bool) -> Option<*mut PageTableEntry> {
        let mut table = self.root;
        for level in (2..=LEVELS).rev() {
            let entry = unsafe { &mut *table_ptr(table).add(level_index(va, level)) };
            if entry.is_present() {
                table = entry.addr();
            } else if !alloc {
                return None;
            } else {
                let mut frame = self.frames.alloc()?;
                frame.zero();
                let pa = frame.into_phys();
                entry.set(pa, PteFlags::P | PteFlags::W | PteFlags::U);
                table = pa;
            }
        }
        Some(unsafe { table_ptr(table).add(level_index(va, 1)) })
    }

    // ========================================================================
    // Mapping
    // ========================================================================

    /// Map the `size` bytes starting at physical `pa` to virtual `va`.
    /// Neither needs to be page-aligned; the covering pages are mapped. The
    /// mapped frames are not owned by the space. Mapping over a present
    /// entry is a kernel bug and panics.
    pub fn map_pages(
        &mut self,
        va: VirtualAddress,
        size: usize,
        pa: PhysicalAddress,
        perm: Perm,
    ) -> Result<(), VmError> {
        self.map_with_flags(va, size, pa, perm.to_pte_flags())
    }

    fn map_with_flags(
        &mut self,
        va: VirtualAddress,
        size: usize,
        pa: PhysicalAddress,
        flags: PteFlags,
    ) -> Result<(), VmError> {
        let mut at = page_round_down(va.as_usize());
        let last = page_round_down(va.as_usize() + size - 1);
        let mut pa = page_round_down(pa.as_usize());
        loop {
            let entry = self.walk(at, true).ok_or(VmError::OutOfMemory)?;
            let entry = unsafe { &mut *entry };
            if entry.is_present() {
                panic!("remap at {:#x}", at);
            }
            entry.set(PhysicalAddress::new(pa), flags);
            if at == last {
                break;
            }
            at += PAGE_SIZE;
            pa += PAGE_SIZE;
        }
        Ok(())
    }

    // ========================================================================
    // User-region growth
    // ========================================================================

    /// Grow the user region from `old` to `new` bytes: allocate a zeroed,
    /// owned frame for every page in between and map it with `perm` plus
    /// user access. Partial failure rolls the region back to `old` before
    /// returning, so a failed grow is invisible. `new < old` is a no-op
    /// returning `old`.
    pub fn grow(&mut self, old: usize, new: usize, perm: Perm) -> Result<usize, VmError> {
        if new >= USER_TOP {
            return Err(VmError::TooBig);
        }
        if new < old {
            return Ok(old);
        }

        let mut at = page_round_up(old);
        while at < new {
            let mut frame = match self.frames.alloc() {
                Some(f) => f,
                None => {
                    log::warn!("address space grow: out of frames at {:#x}", at);
                    self.shrink(at, old);
                    return Err(VmError::OutOfMemory);
                }
            };
            frame.zero();
            let pa = frame.into_phys();
            let flags = (perm | Perm::USER).to_pte_flags() | PteFlags::OWNED;
            if let Err(e) = self.map_with_flags(VirtualAddress::new(at), PAGE_SIZE, pa, flags)
            {
                log::warn!("address space grow: table allocation failed at {:#x}", at);
                unsafe { self.frames.free_phys(pa) };
                self.shrink(at, old);
                return Err(e);
            }
            at += PAGE_SIZE;
        }
        Ok(new)
    }

    /// Shrink the user region from `old` to `new` bytes, returning every
    /// owned frame in between to the allocator. Holes are tolerated; table
    /// pages are kept (they are reclaimed at destruction). Returns the new
    /// size; `new >= old` is a no-op returning `old`.
    pub fn shrink(&mut self, old: usize, new: usize) -> usize {
        if new >= old {
            return old;
        }
        let start = page_round_up(new);
        let end = page_round_up(old);
        if start < end {
            self.free_range(self.root, LEVELS, start, end);
        }
        new
    }

    /// Free every owned leaf in `[start, end)` within the table at `level`.
    /// The range must fall inside a single entry of the enclosing level;
    /// spanning is a walk bug and panics.
    fn free_range(&self, table: PhysicalAddress, level: u8, start: usize, end: usize) {
        let parent_shift = level_shift(level + 1);
        if (start >> parent_shift) != ((end - 1) >> parent_shift) {
            panic!("free_range: level {} range spans parent entries", level);
        }

        if level == 1 {
            let mut at = start;
            while at < end {
                let entry = unsafe { &mut *table_ptr(table).add(level_index(at, 1)) };
                // Only frames the space allocated are returned; kernel
                // aliases in an identity-mapped hosted build stay put.
                if entry.is_present() && entry.flags().contains(PteFlags::OWNED) {
                    unsafe { self.frames.free_phys(entry.addr()) };
                    entry.clear();
                }
                at += PAGE_SIZE;
            }
            return;
        }

        let span = level_span(level);
        let mut at = start;
        while at < end {
            let boundary = (at / span + 1) * span;
            let entry = unsafe { &*table_ptr(table).add(level_index(at, level)) };
            if entry.is_present() {
                let sub_end = core::cmp::min(end, boundary);
                self.free_range(entry.addr(), level - 1, at, sub_end);
            }
            at = boundary;
        }
    }

    // ========================================================================
    // Duplication
    // ========================================================================

    /// Eagerly deep-copy the first `size` bytes of the user region into a
    /// fresh kernel-mapped space. Every present page is copied with its
    /// flags; holes are skipped. On failure the partial copy is destroyed
    /// and the original is untouched.
    pub fn duplicate(&self, size: usize) -> Result<AddressSpace, VmError> {
        let mut copy = AddressSpace::new_kernel_mapped(self.frames.clone(), self.layout.clone())?;
        let mut at = 0;
        while at < size {
            let entry = match self.walk(at, false) {
                Some(e) => unsafe { &*e },
                None => {
                    at += PAGE_SIZE;
                    continue;
                }
            };
            if !entry.is_present() {
                at += PAGE_SIZE;
                continue;
            }
            let mut frame = copy.frames.alloc().ok_or(VmError::OutOfMemory)?;
            frame
                .as_mut_slice()
                .copy_from_slice(unsafe {
                    &*(phys_to_virt(entry.addr()).as_ptr() as *const [u8; PAGE_SIZE])
                });
            let pa = frame.into_phys();
            if let Err(e) =
                copy.map_with_flags(VirtualAddress::new(at), PAGE_SIZE, pa, entry.flags())
            {
                unsafe { copy.frames.free_phys(pa) };
                return Err(e);
            }
            at += PAGE_SIZE;
        }
        Ok(copy)
    }

    // ========================================================================
    // User access
    // ========================================================================

    /// Kernel-accessible address of user virtual address `va`, or `None`
    /// when `va` is unmapped or not user-accessible.
    pub fn translate(&self, va: usize) -> Option<VirtualAddress> {
        let entry = unsafe { &*self.walk(va, false)? };
        if !entry.is_present() || !entry.is_user() {
            return None;
        }
        Some(VirtualAddress::new(
            phys_to_virt(entry.addr()).as_usize() + (va % PAGE_SIZE),
        ))
    }

    /// Copy `data` into this space's user region at `va`, page by page.
    /// Works whether or not the space is active. Fails without side channel
    /// if any covered page is not user-accessible.
    pub fn copy_out(&mut self, va: usize, data: &[u8]) -> Result<(), VmError> {
        let mut va = va;
        let mut data = data;
        while !data.is_empty() {
            let page = page_round_down(va);
            let dst = self.translate(page).ok_or(VmError::BadAddress)?;
            let offset = va - page;
            let n = core::cmp::min(PAGE_SIZE - offset, data.len());
            unsafe {
                core::ptr::copy_nonoverlapping(
                    data.as_ptr(),
                    dst.as_mut_ptr().add(offset),
                    n,
                );
            }
            data = &data[n..];
            va = page + PAGE_SIZE;
        }
        Ok(())
    }

    /// Read `len` file bytes at `offset` into the already-mapped pages at
    /// page-aligned `addr`. Unaligned or unmapped addresses are walk bugs
    /// and panic.
    pub fn load_segment(
        &mut self,
        addr: usize,
        fsys: &dyn Filesystem,
        inode: &Inode,
        offset: u64,
        len: usize,
    ) -> Result<(), VmError> {
        if addr % PAGE_SIZE != 0 {
            panic!("load_segment: unaligned address {:#x}", addr);
        }
        let mut done = 0;
        while done < len {
            let entry = match self.walk(addr + done, false) {
                Some(e) => unsafe { &*e },
                None => panic!("load_segment: address should exist"),
            };
            if !entry.is_present() {
                panic!("load_segment: address should exist");
            }
            let n = core::cmp::min(PAGE_SIZE, len - done);
            let dst = phys_to_virt(entry.addr()).as_mut_ptr();
            let buf = unsafe { core::slice::from_raw_parts_mut(dst, n) };
            let read = fsys
                .read(inode, offset + done as u64, buf)
                .map_err(|_| VmError::Io)?;
            if read != n {
                return Err(VmError::Io);
            }
            done += n;
        }
        Ok(())
    }

    /// Revoke user access to the page at `va` (the stack guard). The page
    /// stays owned and is still reclaimed at destruction. Calling this on an
    /// unmapped page is a kernel bug and panics.
    pub fn clear_user(&mut self, va: usize) {
        let entry = match self.walk(va, false) {
            Some(e) => unsafe { &mut *e },
            None => panic!("clear_user: unmapped page {:#x}", va),
        };
        if !entry.is_present() {
            panic!("clear_user: unmapped page {:#x}", va);
        }
        entry.clear_user();
        arch::invalidate_page(va);
    }

    // ========================================================================
    // Destruction
    // ========================================================================

    /// Free the table page at `table` and, above the leaf level, every table
    /// page below it. Leaf frames are gone by the time this runs.
    fn free_table_pages(&self, table: PhysicalAddress, level: u8) {
        if level > 1 {
            for i in 0..ENTRIES_PER_TABLE {
                let entry = unsafe { &*table_ptr(table).add(i) };
                if entry.is_present() {
                    self.free_table_pages(entry.addr(), level - 1);
                }
            }
        }
        unsafe { self.frames.free_phys(table) };
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        self.free_range(self.root, LEVELS, 0, USER_TOP);
        self.free_table_pages(self.root, LEVELS);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::frame::test_allocator;

    fn empty_layout() -> Arc<KernelLayout> {
        Arc::new(KernelLayout::new())
    }

    fn fresh_space(pages: usize) -> (AddressSpace, Arc<FrameAllocator>) {
        let frames = test_allocator(pages);
        let space = AddressSpace::new_kernel_mapped(frames.clone(), empty_layout()).unwrap();
        (space, frames)
    }

    #[test]
    fn test_grow_translate_write() {
        let (mut space, _frames) = fresh_space(32);
        assert_eq!(space.grow(0, 2 * PAGE_SIZE, Perm::WRITE).unwrap(), 2 * PAGE_SIZE);

        let ka = space.translate(PAGE_SIZE + 0x123).unwrap();
        unsafe { ka.as_mut_ptr().write(0x5a) };
        assert_eq!(
            space.translate(PAGE_SIZE).unwrap().as_usize() + 0x123,
            ka.as_usize()
        );
        // Fresh pages are zeroed.
        assert_eq!(unsafe { space.translate(0).unwrap().as_ptr().read() }, 0);
        // Beyond the region there is nothing.
        assert!(space.translate(3 * PAGE_SIZE).is_none());
    }

    #[test]
    fn test_grow_refuses_crossing_user_top() {
        let (mut space, _frames) = fresh_space(8);
        assert_eq!(space.grow(0, USER_TOP, Perm::WRITE), Err(VmError::TooBig));
    }

    #[test]
    fn test_shrink_returns_leaf_frames() {
        let (mut space, frames) = fresh_space(32);
        space.grow(0, 3 * PAGE_SIZE, Perm::WRITE).unwrap();
        let after_grow = frames.free_frames();

        assert_eq!(space.shrink(3 * PAGE_SIZE, PAGE_SIZE), PAGE_SIZE);
        // Two leaves freed; the table pages stay until destruction.
        assert_eq!(frames.free_frames(), after_grow + 2);
        assert!(space.translate(0).is_some());
        assert!(space.translate(PAGE_SIZE).is_none());
        assert!(space.translate(2 * PAGE_SIZE).is_none());
    }

    #[test]
    fn test_destruction_returns_everything() {
        let frames = test_allocator(32);
        {
            let mut space =
                AddressSpace::new_kernel_mapped(frames.clone(), empty_layout()).unwrap();
            space.grow(0, 4 * PAGE_SIZE, Perm::WRITE).unwrap();
            space.shrink(4 * PAGE_SIZE, 2 * PAGE_SIZE);
        }
        assert_eq!(frames.free_frames(), 32);
    }

    #[test]
    fn test_failed_grow_rolls_back() {
        // Room for the root, the three intermediate tables, and one leaf.
        let frames = test_allocator(5);
        let mut space = AddressSpace::new_kernel_mapped(frames.clone(), empty_layout()).unwrap();

        assert_eq!(
            space.grow(0, 3 * PAGE_SIZE, Perm::WRITE),
            Err(VmError::OutOfMemory)
        );
        // The partially grown pages were rolled back.
        assert!(space.translate(0).is_none());
        drop(space);
        assert_eq!(frames.free_frames(), 5);
    }

    #[test]
    fn test_duplicate_is_deep() {
        let (mut parent, frames) = fresh_space(64);
        parent.grow(0, 2 * PAGE_SIZE, Perm::WRITE).unwrap();
        unsafe { parent.translate(10).unwrap().as_mut_ptr().write(7) };

        let mut child = parent.duplicate(2 * PAGE_SIZE).unwrap();
        assert_eq!(unsafe { child.translate(10).unwrap().as_ptr().read() }, 7);

        // Writes do not propagate in either direction.
        unsafe { child.translate(10).unwrap().as_mut_ptr().write(9) };
        assert_eq!(unsafe { parent.translate(10).unwrap().as_ptr().read() }, 7);
        unsafe { parent.translate(11).unwrap().as_mut_ptr().write(3) };
        assert_eq!(unsafe { child.translate(11).unwrap().as_ptr().read() }, 0);

        child.shrink(2 * PAGE_SIZE, 0);
        drop(child);
        drop(parent);
        assert_eq!(frames.free_frames(), 64);
    }

    #[test]
    fn test_duplicate_skips_holes() {
        let (mut parent, _frames) = fresh_space(64);
        parent.grow(0, PAGE_SIZE, Perm::WRITE).unwrap();
        // Duplicate across a region larger than what is mapped.
        let child = parent.duplicate(4 * PAGE_SIZE).unwrap();
        assert!(child.translate(0).is_some());
        assert!(child.translate(PAGE_SIZE).is_none());
    }

    #[test]
    fn test_copy_out_straddles_pages() {
        let (mut space, _frames) = fresh_space(32);
        space.grow(0, 2 * PAGE_SIZE, Perm::WRITE).unwrap();

        let data = [1u8, 2, 3, 4, 5, 6];
        space.copy_out(PAGE_SIZE - 3, &data).unwrap();
        for (i, &expect) in data.iter().enumerate() {
            let ka = space.translate(PAGE_SIZE - 3 + i).unwrap();
            assert_eq!(unsafe { ka.as_ptr().read() }, expect);
        }
    }

    #[test]
    fn test_copy_out_to_unmapped_fails() {
        let (mut space, _frames) = fresh_space(32);
        space.grow(0, PAGE_SIZE, Perm::WRITE).unwrap();
        assert_eq!(
            space.copy_out(PAGE_SIZE - 1, &[0, 0]),
            Err(VmError::BadAddress)
        );
    }

    #[test]
    fn test_clear_user_revokes_access_but_not_ownership() {
        let frames = test_allocator(32);
        {
            let mut space =
                AddressSpace::new_kernel_mapped(frames.clone(), empty_layout()).unwrap();
            space.grow(0, 2 * PAGE_SIZE, Perm::WRITE).unwrap();
            space.clear_user(0);
            assert!(space.translate(0).is_none());
            assert!(space.translate(PAGE_SIZE).is_some());
        }
        // The guard page is still reclaimed at destruction.
        assert_eq!(frames.free_frames(), 32);
    }

    #[test]
    #[should_panic(expected = "remap")]
    fn test_remap_panics() {
        let (mut space, frames) = fresh_space(32);
        let a = frames.alloc().unwrap().into_phys();
        let b = frames.alloc().unwrap().into_phys();
        space
            .map_pages(VirtualAddress::new(0x4000), PAGE_SIZE, a, Perm::WRITE)
            .unwrap();
        space
            .map_pages(VirtualAddress::new(0x4000), PAGE_SIZE, b, Perm::WRITE)
            .unwrap();
    }

    #[test]
    fn test_kernel_ranges_are_mapped_and_not_owned() {
        let frames = test_allocator(40);
        // Borrow one frame to stand in for a kernel physical range.
        let frame = frames.alloc().unwrap();
        let pa = frame.phys();

        let mut layout = KernelLayout::new();
        layout.add_range(
            pa,
            PhysicalAddress::new(pa.as_usize() + PAGE_SIZE),
            Perm::WRITE,
            false,
        );
        let before = frames.free_frames();
        {
            let space =
                AddressSpace::new_kernel_mapped(frames.clone(), Arc::new(layout)).unwrap();
            // The kernel alias exists but is not user-accessible.
            let va = phys_to_virt(pa).as_usize();
            assert!(space.translate(va).is_none());
            let entry = unsafe { &*space.walk(va, false).unwrap() };
            assert!(entry.is_present());
            assert_eq!(entry.addr(), pa);
        }
        // Destruction returned the table pages but left the alias target alone.
        assert_eq!(frames.free_frames(), before);
        frames.free(frame);
    }
}
