//! Page and frame number types.
//!
//! Page numbers are never validated on construction, so the exclusive end of a range
//! may sit one past the last canonical page. Only convert a page number to an address
//! once it is known to lie inside the range being walked.

use crate::{
    address::{PhysicalAddress, VirtualAddress},
    arch,
};
use core::{
    fmt,
    ops::{Add, Sub},
};

macro_rules! impl_page_number_common {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[repr(transparent)]
        pub struct $name(usize);

        impl $name {
            #[inline]
            pub const fn new(number: usize) -> Self {
                Self(number)
            }

            #[inline]
            pub const fn as_usize(self) -> usize {
                self.0
            }

            /// Iterates `count` consecutive numbers starting at `self`.
            #[inline]
            pub fn range(self, count: usize) -> impl DoubleEndedIterator<Item = Self> {
                (self.0..self.0 + count).map($name)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl Add<usize> for $name {
            type Output = Self;

            #[inline]
            fn add(self, rhs: usize) -> Self::Output {
                Self(self.0 + rhs)
            }
        }

        impl Sub<usize> for $name {
            type Output = Self;

            #[inline]
            fn sub(self, rhs: usize) -> Self::Output {
                Self(self.0 - rhs)
            }
        }

        impl Sub<$name> for $name {
            type Output = usize;

            #[inline]
            fn sub(self, rhs: $name) -> Self::Output {
                self.0 - rhs.0
            }
        }
    };
}

impl_page_number_common!(
    FrameNumber,
    "A physical memory frame number.\n\n\
     Frame `n` starts at physical address `n * PAGE_SIZE`."
);

impl FrameNumber {
    /// Returns the physical address at the start of this frame.
    #[inline]
    pub const fn start(self) -> PhysicalAddress {
        PhysicalAddress::new(self.0 * arch::PAGE_SIZE)
    }
}

impl From<PhysicalAddress> for FrameNumber {
    #[inline]
    fn from(addr: PhysicalAddress) -> Self {
        Self::new(addr.as_usize() / arch::PAGE_SIZE)
    }
}

impl_page_number_common!(
    PageNumber,
    "A virtual memory page number.\n\n\
     Page `n` starts at virtual address `n * PAGE_SIZE`."
);

impl PageNumber {
    /// Returns the page containing the raw address `addr`.
    #[inline]
    pub const fn containing(addr: usize) -> Self {
        Self(addr / arch::PAGE_SIZE)
    }

    /// Returns the virtual address at the start of this page.
    ///
    /// # Panics
    ///
    /// Panics if the page does not start at a canonical address.
    #[inline]
    pub const fn start(self) -> VirtualAddress {
        VirtualAddress::new(self.0 * arch::PAGE_SIZE)
    }

    /// Returns the raw start address without canonical validation.
    #[inline]
    pub const fn start_raw(self) -> usize {
        self.0 * arch::PAGE_SIZE
    }
}

impl From<VirtualAddress> for PageNumber {
    #[inline]
    fn from(addr: VirtualAddress) -> Self {
        Self::new(addr.as_usize() / arch::PAGE_SIZE)
    }
}
