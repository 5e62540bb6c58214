//! Page table entry for software emulation.

use crate::PhysicalAddress;

use super::flags::PageFlags;

/// A single page table entry for software emulation.
///
/// Layout:
/// - Bits 0-3: PRESENT, WRITABLE, USER, NO_EXECUTE
/// - Bits 4-15: physical frame address (16-byte aligned)
/// - Bits 16-17: ACCESSED, DIRTY
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct PageEntry(usize);

impl PageEntry {
    const ADDRESS_MASK: usize = 0xFFF0;
    const FLAGS_MASK: usize = !Self::ADDRESS_MASK;

    /// Creates a new page table entry. `address` must be page-aligned.
    pub fn new(address: PhysicalAddress, flags: PageFlags) -> Self {
        debug_assert!(
            address.as_usize() & 0xF == 0,
            "physical address must be page-aligned (16-byte alignment)"
        );
        Self((address.as_usize() & Self::ADDRESS_MASK) | (flags.to_raw() & Self::FLAGS_MASK))
    }

    /// Returns the physical address stored in this entry, or `None` if not present.
    pub fn address(self) -> Option<PhysicalAddress> {
        self.is_present()
            .then(|| PhysicalAddress::new(self.0 & Self::ADDRESS_MASK))
    }

    pub fn flags(self) -> PageFlags {
        PageFlags::from_raw(self.0 & Self::FLAGS_MASK)
    }

    /// Replaces the flags, preserving the address.
    pub fn set_flags(&mut self, flags: PageFlags) {
        self.0 = (self.0 & Self::ADDRESS_MASK) | (flags.to_raw() & Self::FLAGS_MASK);
    }

    pub fn is_present(self) -> bool {
        self.flags().is_present()
    }

    pub fn clear(&mut self) {
        self.0 = 0;
    }

    pub const fn as_usize(self) -> usize {
        self.0
    }
}
