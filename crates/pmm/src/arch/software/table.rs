//! Page table structure for software emulation.

use super::entry::PageEntry;

/// With 4-bit indexes, each table has 16 entries.
const ENTRY_COUNT: usize = 16;

/// A page table for software emulation.
///
/// Address layout:
/// - Bits 0-3: page offset
/// - Bits 4-7: level 0 index
/// - Bits 8-11: level 1 index
/// - Bits 12-15: level 2 (root) index
///
/// Non-leaf entries hold the emulated physical address of the next table, so every
/// table below the root lives inside emulated memory.
#[repr(C, align(16))]
pub struct PageTable {
    entries: [PageEntry; ENTRY_COUNT],
}

impl PageTable {
    /// Creates a new table with every entry cleared.
    pub fn new() -> Self {
        Self {
            entries: [PageEntry::default(); ENTRY_COUNT],
        }
    }

    /// # Panics
    /// Panics if `index >= 16`.
    pub fn entry(&self, index: usize) -> PageEntry {
        assert!(index < ENTRY_COUNT, "page table index out of bounds");
        self.entries[index]
    }

    /// # Panics
    /// Panics if `index >= 16`.
    pub fn entry_mut(&mut self, index: usize) -> &mut PageEntry {
        assert!(index < ENTRY_COUNT, "page table index out of bounds");
        &mut self.entries[index]
    }

    pub const fn len(&self) -> usize {
        ENTRY_COUNT
    }

    /// Makes this table the active root.
    ///
    /// # Safety
    /// Mirrors the hardware contract; the model has no hardware state to update.
    pub unsafe fn activate(&self) {}
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}
