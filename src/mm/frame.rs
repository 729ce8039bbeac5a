//! Physical frame allocation.
//!
//! Free frames form an intrusive singly-linked list threaded through the
//! first word of each frame, reached via the kernel direct map. Allocation
//! and release are O(1) pointer swaps under one lock. Every freed frame is
//! clobbered with [`CLOBBER_BYTE`] end to end before being linked, so stale
//! reads through a dangling reference fail loudly instead of silently.
//!
//! Initialization is two-phase: boot code seeds the freelist through `&mut
//! self` while the allocator is still exclusively owned, then shares it
//! (typically in an `Arc`). The borrow checker enforces that the unlocked
//! phase ends before the first concurrent caller exists.
//!
//! All pointer reinterpretation is confined to this module.

use core::ptr::NonNull;

use crate::mm::layout::{phys_to_virt, virt_to_phys, KernelLayout};
use crate::mm::{PhysicalAddress, VirtualAddress, PAGE_SIZE};
use crate::sync::SpinMutex;

/// Byte written over every freed frame.
pub const CLOBBER_BYTE: u8 = 0x01;

// ============================================================================
// Frame handle
// ============================================================================

/// An owned 4 KiB physical frame, addressed through the kernel direct map.
///
/// A `Frame` is returned to its allocator with [`FrameAllocator::free`], or
/// converted to a raw physical address with [`Frame::into_phys`] when its
/// ownership moves into a page-table entry. Dropping a `Frame` without doing
/// either leaks the frame.
#[derive(Debug)]
pub struct Frame(NonNull<u8>);

// A frame is exclusively owned memory; the pointer is not shared.
unsafe impl Send for Frame {}

impl Frame {
    /// Direct-map virtual address of the frame.
    pub fn addr(&self) -> VirtualAddress {
        VirtualAddress::new(self.0.as_ptr() as usize)
    }

    /// Physical address of the frame.
    pub fn phys(&self) -> PhysicalAddress {
        virt_to_phys(self.addr())
    }

    pub fn as_slice(&self) -> &[u8; PAGE_SIZE] {
        unsafe { &*(self.0.as_ptr() as *const [u8; PAGE_SIZE]) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8; PAGE_SIZE] {
        unsafe { &mut *(self.0.as_ptr() as *mut [u8; PAGE_SIZE]) }
    }

    /// Fill the frame with zeros.
    pub fn zero(&mut self) {
        unsafe { core::ptr::write_bytes(self.0.as_ptr(), 0, PAGE_SIZE) }
    }

    /// Give the frame's ownership away as a raw physical address, typically
    /// into a page-table entry.
    pub fn into_phys(self) -> PhysicalAddress {
        self.phys()
    }

    /// Reclaim ownership previously given away with [`Frame::into_phys`].
    ///
    /// # Safety
    ///
    /// `pa` must be a page-aligned frame whose ownership was transferred out
    /// with `into_phys` and not reclaimed since.
    pub unsafe fn from_phys(pa: PhysicalAddress) -> Frame {
        let va = phys_to_virt(pa);
        Frame(NonNull::new_unchecked(va.as_mut_ptr()))
    }
}

// ============================================================================
// Allocator
// ============================================================================

/// Link at the head of each free frame.
struct Run {
    next: *mut Run,
}

struct FreeList {
    head: *mut Run,
    free: usize,
}

// The raw pointers only ever reference frames owned by the freelist.
unsafe impl Send for FreeList {}

/// The physical frame allocator.
pub struct FrameAllocator {
    inner: SpinMutex<FreeList>,
}

impl FrameAllocator {
    pub const fn new() -> Self {
        FrameAllocator {
            inner: SpinMutex::new(
                "frames",
                FreeList {
                    head: core::ptr::null_mut(),
                    free: 0,
                },
            ),
        }
    }

    /// Seed the freelist with the direct-map range `start..end`. `start` is
    /// rounded up to a page boundary; a partial trailing page is dropped.
    ///
    /// # Safety
    ///
    /// The range must be unused physical memory reachable through the direct
    /// map, seeded exactly once.
    pub unsafe fn seed_range(&mut self, start: VirtualAddress, end: VirtualAddress) {
        let list = self.inner.get_mut();
        let mut page = crate::mm::page_round_up(start.as_usize());
        while page + PAGE_SIZE <= end.as_usize() {
            free_into(list, page as *mut u8);
            page += PAGE_SIZE;
        }
    }

    /// Seed from every general-purpose heap range in the boot layout.
    ///
    /// # Safety
    ///
    /// Same contract as [`Self::seed_range`] for each heap range.
    pub unsafe fn seed_from_layout(&mut self, layout: &KernelLayout) {
        for range in layout.heap_ranges() {
            self.seed_range(phys_to_virt(range.start), phys_to_virt(range.end));
        }
    }

    /// Take one frame, or `None` when physical memory is exhausted. The
    /// frame's contents are unspecified; callers zero it when that matters.
    pub fn alloc(&self) -> Option<Frame> {
        let mut list = self.inner.lock();
        let run = list.head;
        if run.is_null() {
            return None;
        }
        unsafe {
            list.head = (*run).next;
        }
        list.free -= 1;
        // run came off the freelist, so it is non-null and page-aligned.
        Some(Frame(unsafe { NonNull::new_unchecked(run as *mut u8) }))
    }

    /// Return a frame to the freelist.
    pub fn free(&self, frame: Frame) {
        let ptr = frame.0.as_ptr();
        let mut list = self.inner.lock();
        unsafe { free_into(&mut list, ptr) }
    }

    /// Return a frame previously leaked into a page table.
    ///
    /// # Safety
    ///
    /// Same contract as [`Frame::from_phys`].
    pub unsafe fn free_phys(&self, pa: PhysicalAddress) {
        self.free(Frame::from_phys(pa));
    }

    /// Number of frames currently free. Diagnostic; racy by nature.
    pub fn free_frames(&self) -> usize {
        self.inner.lock().free
    }
}

/// Clobber a frame and push it onto the freelist.
///
/// # Safety
///
/// `ptr` must address an owned, unreferenced frame.
unsafe fn free_into(list: &mut FreeList, ptr: *mut u8) {
    if ptr as usize % PAGE_SIZE != 0 {
        panic!("frame free: unaligned {:p}", ptr);
    }
    core::ptr::write_bytes(ptr, CLOBBER_BYTE, PAGE_SIZE);
    let run = ptr as *mut Run;
    (*run).next = list.head;
    list.head = run;
    list.free += 1;
}

// ============================================================================
// Test support
// ============================================================================

/// Build an allocator seeded with `pages` frames of leaked, page-aligned
/// host memory. Shared by the test suites of several modules.
#[cfg(test)]
pub(crate) fn test_allocator(pages: usize) -> alloc::sync::Arc<FrameAllocator> {
    use std::alloc::{alloc, Layout};

    let bytes = pages * PAGE_SIZE;
    let layout = Layout::from_size_align(bytes, PAGE_SIZE).unwrap();
    let arena = unsafe { alloc(layout) };
    assert!(!arena.is_null());

    let mut frames = FrameAllocator::new();
    unsafe {
        frames.seed_range(
            VirtualAddress::new(arena as usize),
            VirtualAddress::new(arena as usize + bytes),
        );
    }
    assert_eq!(frames.free_frames(), pages);
    alloc::sync::Arc::new(frames)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_free_roundtrip() {
        let frames = test_allocator(4);
        assert_eq!(frames.free_frames(), 4);

        let mut a = frames.alloc().unwrap();
        let b = frames.alloc().unwrap();
        assert_eq!(frames.free_frames(), 2);
        assert_ne!(a.phys(), b.phys());
        assert!(a.phys().is_page_aligned());

        a.zero();
        a.as_mut_slice()[100] = 0xab;
        assert_eq!(a.as_slice()[100], 0xab);

        frames.free(a);
        frames.free(b);
        assert_eq!(frames.free_frames(), 4);
    }

    #[test]
    fn test_freed_frames_are_clobbered() {
        let frames = test_allocator(1);
        let mut frame = frames.alloc().unwrap();
        frame.zero();
        let pa = frame.phys();
        frames.free(frame);

        let again = frames.alloc().unwrap();
        assert_eq!(again.phys(), pa);
        // The first word holds the freelist link; everything after it must
        // still carry the clobber pattern.
        for &byte in &again.as_slice()[core::mem::size_of::<usize>()..] {
            assert_eq!(byte, CLOBBER_BYTE);
        }
        frames.free(again);
    }

    #[test]
    fn test_exhaustion_and_exact_reuse() {
        let frames = test_allocator(2);
        let a = frames.alloc().unwrap();
        let b = frames.alloc().unwrap();
        assert!(frames.alloc().is_none());

        let pa = b.phys();
        frames.free(b);
        // LIFO: the frame just freed is the next one handed out.
        let c = frames.alloc().unwrap();
        assert_eq!(c.phys(), pa);

        frames.free(a);
        frames.free(c);
        assert_eq!(frames.free_frames(), 2);
    }

    #[test]
    fn test_seed_rounds_to_whole_pages() {
        use std::alloc::{alloc, Layout};
        let layout = Layout::from_size_align(3 * PAGE_SIZE, PAGE_SIZE).unwrap();
        let arena = unsafe { alloc(layout) } as usize;

        let mut frames = FrameAllocator::new();
        // Misaligned start and a partial trailing page yield exactly one frame.
        unsafe {
            frames.seed_range(
                VirtualAddress::new(arena + 1),
                VirtualAddress::new(arena + 2 * PAGE_SIZE + 100),
            );
        }
        assert_eq!(frames.free_frames(), 1);
        assert_eq!(frames.alloc().unwrap().addr().as_usize(), arena + PAGE_SIZE);
    }

    #[test]
    #[should_panic(expected = "unaligned")]
    fn test_unaligned_free_panics() {
        let frames = test_allocator(1);
        let frame = frames.alloc().unwrap();
        let bad = PhysicalAddress::new(frame.phys().as_usize() + 3);
        unsafe { frames.free_phys(bad) };
    }
}
