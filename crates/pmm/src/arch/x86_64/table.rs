//! Page table structure for x86_64 architecture.

use x86_64::{
    PhysAddr,
    registers::control::{Cr3, Cr3Flags},
    structures::paging::PhysFrame,
};

use crate::{PhysicalAddress, address::AddressTranslator};

use super::entry::PageEntry;

const ENTRY_COUNT: usize = 512;

/// One level of the x86_64 page table hierarchy (PML4, PDPT, PD or PT).
///
/// Exactly one 4 KiB frame, so non-leaf entries can point straight at it.
#[repr(transparent)]
pub struct PageTable(x86_64::structures::paging::PageTable);

impl PageTable {
    /// Creates a new table with every entry cleared.
    pub const fn new() -> Self {
        Self(x86_64::structures::paging::PageTable::new())
    }

    /// # Panics
    /// Panics if `index >= 512`.
    pub fn entry(&self, index: usize) -> PageEntry {
        assert!(index < ENTRY_COUNT, "page table index out of bounds");
        // SAFETY: both types are a transparent 64-bit word with the same layout.
        unsafe { *(&self.0[index] as *const _ as *const PageEntry) }
    }

    /// # Panics
    /// Panics if `index >= 512`.
    pub fn entry_mut(&mut self, index: usize) -> &mut PageEntry {
        assert!(index < ENTRY_COUNT, "page table index out of bounds");
        // SAFETY: both types are a transparent 64-bit word with the same layout.
        unsafe { &mut *(&mut self.0[index] as *mut _ as *mut PageEntry) }
    }

    pub const fn len(&self) -> usize {
        ENTRY_COUNT
    }

    /// Returns the physical address of this table, as loaded into CR3.
    pub fn physical_address(&self) -> PhysicalAddress {
        PhysicalAddress::new(AddressTranslator::current().ptr_to_phys(self as *const Self))
    }

    /// Loads this table into CR3.
    ///
    /// # Safety
    /// The table must map the kernel, its own storage and everything the caller is
    /// about to touch.
    pub unsafe fn activate(&self) {
        let frame = PhysFrame::containing_address(PhysAddr::new(
            self.physical_address().as_usize() as u64,
        ));
        // SAFETY: upheld by the caller.
        unsafe {
            Cr3::write(frame, Cr3Flags::empty());
        }
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}
