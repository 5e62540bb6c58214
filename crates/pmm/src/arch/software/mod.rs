//! Software-emulated MMU for tests and host development.
//!
//! The emulated architecture is a scale model of x86_64:
//! - 16-bit addresses (vs 48-bit on x86_64)
//! - 3 levels of page tables (vs 4 on x86_64)
//! - 4-bit indexes (16 entries per table, vs 512 on x86_64)
//! - 16-byte pages (vs 4 KiB on x86_64)
//!
//! Nothing translates addresses in hardware here. Code that touches user memory walks
//! the page directory itself and sets the accessed and dirty bits the way an MMU would.

mod entry;
mod flags;
mod table;

use alloc::alloc::{Layout, alloc_zeroed, dealloc};
use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};

pub use entry::PageEntry;
pub use flags::PageFlags;
pub use table::PageTable;

/// Maximum number of bits in a physical address.
pub const MAX_PHYSICAL_BITS: usize = 16;

/// Maximum number of bits in a virtual address.
pub const MAX_VIRTUAL_BITS: usize = 16;

/// Page size in bytes.
pub const PAGE_SIZE: usize = 16;

/// Number of page table levels (level 2, 1, 0).
pub const PAGE_TABLE_LEVELS: usize = 3;

/// Lowest address handed out to user mappings. The first 4 KiB stay unmapped so that
/// null-pointer dereferences always fault.
pub const USER_SPACE_START: usize = 0x1000;

/// End (exclusive) of the user half.
pub const USER_SPACE_END: usize = 0x8000;

/// First root table slot owned by the kernel half.
pub const KERNEL_ROOT_INDEX: usize = 8;

/// Returns the page table index for `address` at `level`.
///
/// - Level 0: bits 4-7
/// - Level 1: bits 8-11
/// - Level 2: bits 12-15
#[inline]
pub const fn page_index(address: usize, level: usize) -> usize {
    assert!(level < PAGE_TABLE_LEVELS, "level out of range for software emulation (0-2)");
    (address >> (4 + level * 4)) & 0xF
}

/// Physical addresses must fit within 16 bits.
#[inline]
pub const fn validate_physical(addr: usize) -> bool {
    addr <= 0xFFFF
}

/// Virtual addresses must be canonical: bits 16-63 are a sign-extension of bit 15.
#[inline]
pub const fn validate_virtual(addr: usize) -> bool {
    canonicalize_virtual(addr) == addr
}

/// Sign-extends bit 15 into bits 16-63.
#[inline]
pub const fn canonicalize_virtual(addr: usize) -> usize {
    if (addr & 0x8000) != 0 {
        addr | 0xFFFF_FFFF_FFFF_0000
    } else {
        addr & 0xFFFF
    }
}

/// Invalidates the cached translation of `virt`. There is no TLB in the model.
#[inline]
pub fn flush_page(_virt: usize) {}

/// Emulated physical memory.
///
/// A single zeroed, page-aligned host allocation stands in for RAM. Physical address
/// `n` is byte `n` of the buffer. A bump pointer hands out regions; nothing is ever
/// returned to it.
pub struct EmulatedMemory {
    base: NonNull<u8>,
    size: usize,
    next_alloc: AtomicUsize,
}

// SAFETY: The buffer is only reached through raw pointers and callers synchronise
// access to the frames they own, as they would with real RAM.
unsafe impl Send for EmulatedMemory {}
unsafe impl Sync for EmulatedMemory {}

impl EmulatedMemory {
    /// Creates a new emulated memory region of `size` bytes.
    ///
    /// # Panics
    /// Panics if `size` does not fit the 16-bit physical address space or the host
    /// allocation fails.
    pub fn new(size: usize) -> Self {
        assert!(size > 0, "emulated memory must not be empty");
        assert!(
            validate_physical(size - 1),
            "emulated memory exceeds the physical address width"
        );
        let layout = Self::layout(size);
        // SAFETY: the layout has a non-zero size.
        let raw = unsafe { alloc_zeroed(layout) };
        let base = NonNull::new(raw).expect("host allocation for emulated memory failed");
        Self {
            base,
            size,
            next_alloc: AtomicUsize::new(0),
        }
    }

    fn layout(size: usize) -> Layout {
        Layout::from_size_align(size, 4096).expect("invalid emulated memory layout")
    }

    /// Claims `size` bytes aligned to `align` and returns the physical address, or
    /// `None` when the region is exhausted.
    pub fn allocate(&self, size: usize, align: usize) -> Option<usize> {
        loop {
            let current = self.next_alloc.load(Ordering::Relaxed);
            let aligned = (current + align - 1) & !(align - 1);
            let end = aligned.checked_add(size)?;
            if end > self.size {
                return None;
            }
            if self
                .next_alloc
                .compare_exchange(current, end, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                return Some(aligned);
            }
        }
    }

    /// Returns a host pointer to physical address `phys`.
    pub fn translate(&self, phys: usize) -> *mut u8 {
        assert!(phys < self.size, "physical address out of bounds");
        // SAFETY: bounds checked above.
        unsafe { self.base.as_ptr().add(phys) }
    }

    /// Maps a host pointer into the buffer back to its physical address.
    pub fn ptr_to_phys(&self, ptr: *const u8) -> usize {
        let offset = (ptr as usize).wrapping_sub(self.base.as_ptr() as usize);
        assert!(offset < self.size, "pointer not within emulated memory");
        offset
    }

    /// Returns the size of the emulated region in bytes.
    pub fn size(&self) -> usize {
        self.size
    }
}

impl Drop for EmulatedMemory {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with the same layout.
        unsafe { dealloc(self.base.as_ptr(), Self::layout(self.size)) }
    }
}
