//! Page table entry flags for software emulation.

/// Page table entry flags for software emulation.
///
/// The bit positions mirror the entry layout documented on [`super::PageEntry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PageFlags(usize);

macro_rules! flag_accessors {
    ($($(#[$doc:meta])* $bit:ident => $get:ident, $set:ident;)*) => {
        $(
            $(#[$doc])*
            pub fn $get(self) -> bool {
                (self.0 & Self::$bit) != 0
            }

            pub fn $set(&mut self, value: bool) {
                if value {
                    self.0 |= Self::$bit;
                } else {
                    self.0 &= !Self::$bit;
                }
            }
        )*
    };
}

impl PageFlags {
    const PRESENT: usize = 1 << 0;
    const WRITABLE: usize = 1 << 1;
    const USER: usize = 1 << 2;
    const NO_EXECUTE: usize = 1 << 3;
    const ACCESSED: usize = 1 << 16;
    const DIRTY: usize = 1 << 17;

    /// Creates empty page flags (page not present).
    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    pub const fn to_raw(self) -> usize {
        self.0
    }

    flag_accessors! {
        /// Whether the entry is valid.
        PRESENT => is_present, set_present;
        /// Whether writes are allowed through this entry.
        WRITABLE => is_writable, set_writable;
        /// Whether user mode may access the page.
        USER => is_user, set_user;
        /// Whether instruction fetches are forbidden.
        NO_EXECUTE => is_no_execute, set_no_execute;
        /// Set when the page has been read or written.
        ACCESSED => is_accessed, set_accessed;
        /// Set when the page has been written.
        DIRTY => is_dirty, set_dirty;
    }
}
