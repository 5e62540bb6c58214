//! x86_64 hardware paging.

mod entry;
mod flags;
mod table;

pub use entry::PageEntry;
pub use flags::PageFlags;
pub use table::PageTable;

/// Conservative physical address width.
pub const MAX_PHYSICAL_BITS: usize = 48;

/// Virtual address width with 4-level paging.
pub const MAX_VIRTUAL_BITS: usize = 48;

/// Page size in bytes (4 KiB).
pub const PAGE_SIZE: usize = 4096;

/// Number of page table levels (PML4, PDPT, PD, PT).
pub const PAGE_TABLE_LEVELS: usize = 4;

/// Lowest address handed out to user mappings.
pub const USER_SPACE_START: usize = 0x0000_0000_0040_0000;

/// End (exclusive) of the canonical lower half.
pub const USER_SPACE_END: usize = 0x0000_8000_0000_0000;

/// First PML4 slot owned by the kernel half.
pub const KERNEL_ROOT_INDEX: usize = 256;

/// Returns the page table index for `address` at `level` (9 bits per level).
#[inline]
pub const fn page_index(address: usize, level: usize) -> usize {
    assert!(level < PAGE_TABLE_LEVELS, "level out of range for x86_64 page table levels");
    (address >> (12 + level * 9)) & 0x1FF
}

#[inline]
pub const fn validate_physical(addr: usize) -> bool {
    addr <= (1usize << MAX_PHYSICAL_BITS) - 1
}

/// Virtual addresses must be canonical: bits 48-63 are a sign-extension of bit 47.
#[inline]
pub const fn validate_virtual(addr: usize) -> bool {
    canonicalize_virtual(addr) == addr
}

#[inline]
pub const fn canonicalize_virtual(addr: usize) -> usize {
    if (addr & (1 << 47)) != 0 {
        addr | 0xFFFF_0000_0000_0000
    } else {
        addr & 0x0000_FFFF_FFFF_FFFF
    }
}

/// Invalidates the TLB entry for `virt` on the current CPU.
#[inline]
pub fn flush_page(virt: usize) {
    x86_64::instructions::tlb::flush(x86_64::VirtAddr::new_truncate(virt as u64));
}
