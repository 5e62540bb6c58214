//! Page table entry flags for x86_64 architecture.

use x86_64::structures::paging::PageTableFlags;

/// Page table entry flags for x86_64.
///
/// Wraps the `x86_64` crate's flags behind the same accessor set the software model
/// exposes, so the page directory and its callers stay architecture-independent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFlags(PageTableFlags);

impl From<usize> for PageFlags {
    fn from(value: usize) -> Self {
        Self(PageTableFlags::from_bits_truncate(value as u64))
    }
}

macro_rules! flag_accessors {
    ($($flag:ident => $get:ident, $set:ident;)*) => {
        $(
            pub fn $get(self) -> bool {
                self.0.contains(PageTableFlags::$flag)
            }

            pub fn $set(&mut self, value: bool) {
                self.0.set(PageTableFlags::$flag, value);
            }
        )*
    };
}

impl PageFlags {
    /// Creates empty page flags (page not present).
    pub const fn empty() -> Self {
        Self(PageTableFlags::empty())
    }

    pub const fn as_usize(self) -> usize {
        self.0.bits() as usize
    }

    flag_accessors! {
        PRESENT => is_present, set_present;
        WRITABLE => is_writable, set_writable;
        USER_ACCESSIBLE => is_user, set_user;
        NO_EXECUTE => is_no_execute, set_no_execute;
        ACCESSED => is_accessed, set_accessed;
        DIRTY => is_dirty, set_dirty;
    }
}

impl Default for PageFlags {
    fn default() -> Self {
        Self::empty()
    }
}
