//! Address types for physical and virtual memory management.
//!
//! Architecture-independent wrappers around physical and virtual addresses, and the
//! translator that turns a physical frame address into something the kernel can
//! dereference.

use core::fmt;
use core::ops::{Add, Sub};

#[cfg(any(test, feature = "software-emulation"))]
use alloc::sync::Arc;

use crate::{FrameNumber, arch};

#[cfg(any(test, feature = "software-emulation"))]
use crate::arch::EmulatedMemory;

/// Converts between physical addresses and kernel-visible pointers.
///
/// - `Hardware`: physical memory is mapped at a fixed offset in the kernel half.
/// - `Emulated`: physical memory is a host buffer (tests and software emulation).
pub enum AddressTranslator {
    Hardware { direct_map_offset: usize },
    #[cfg(any(test, feature = "software-emulation"))]
    Emulated(Arc<EmulatedMemory>),
}

impl AddressTranslator {
    pub const fn hardware(direct_map_offset: usize) -> Self {
        Self::Hardware { direct_map_offset }
    }

    /// Creates a translator over a fresh emulated region of `size` bytes.
    #[cfg(any(test, feature = "software-emulation"))]
    pub fn emulated(size: usize) -> Self {
        Self::Emulated(Arc::new(EmulatedMemory::new(size)))
    }

    /// Returns a translator viewing the same physical memory, for installing on
    /// another thread.
    #[cfg(any(test, feature = "software-emulation"))]
    pub fn share(&self) -> Self {
        match self {
            Self::Hardware { direct_map_offset } => Self::hardware(*direct_map_offset),
            Self::Emulated(mem) => Self::Emulated(Arc::clone(mem)),
        }
    }

    /// Installs the global translator. Must be called exactly once during
    /// initialisation (once per thread under emulation).
    ///
    /// # Panics
    ///
    /// Panics if a translator has already been set.
    pub fn set_current(translator: AddressTranslator) {
        #[cfg(not(any(test, feature = "software-emulation")))]
        {
            if ADDRESS_TRANSLATOR.get().is_some() {
                panic!("address translator already set");
            }
            ADDRESS_TRANSLATOR.call_once(|| translator);
        }

        #[cfg(any(test, feature = "software-emulation"))]
        {
            ADDRESS_TRANSLATOR.with(|t| {
                if t.get().is_some() {
                    panic!("address translator already set");
                }
                t.call_once(|| translator);
            });
        }
    }

    /// Returns the installed translator.
    ///
    /// # Panics
    ///
    /// Panics if no translator has been set.
    pub fn current() -> &'static AddressTranslator {
        Self::try_current().expect(
            "address translator not set; call AddressTranslator::set_current during initialization",
        )
    }

    /// Returns the installed translator, if any.
    pub fn try_current() -> Option<&'static AddressTranslator> {
        #[cfg(not(any(test, feature = "software-emulation")))]
        {
            ADDRESS_TRANSLATOR.get()
        }

        #[cfg(any(test, feature = "software-emulation"))]
        {
            ADDRESS_TRANSLATOR.with(|t| {
                // SAFETY: the thread-local outlives every caller on this thread and a
                // `spin::Once` is never written again after initialisation.
                t.get()
                    .map(|translator| unsafe { &*(translator as *const AddressTranslator) })
            })
        }
    }

    pub fn phys_to_virt(&self, phys: usize) -> usize {
        match self {
            Self::Hardware { direct_map_offset } => phys.wrapping_add(*direct_map_offset),
            #[cfg(any(test, feature = "software-emulation"))]
            Self::Emulated(mem) => mem.translate(phys) as usize,
        }
    }

    pub fn virt_to_phys(&self, virt: usize) -> usize {
        match self {
            Self::Hardware { direct_map_offset } => virt.wrapping_sub(*direct_map_offset),
            #[cfg(any(test, feature = "software-emulation"))]
            Self::Emulated(mem) => mem.ptr_to_phys(virt as *const u8),
        }
    }

    pub fn phys_to_ptr<T>(&self, phys: usize) -> *mut T {
        self.phys_to_virt(phys) as *mut T
    }

    pub fn ptr_to_phys<T>(&self, ptr: *const T) -> usize {
        self.virt_to_phys(ptr as usize)
    }

    /// Claims a block of emulated physical memory and returns its address, or `None`
    /// if the region is exhausted.
    ///
    /// # Panics
    ///
    /// Panics on a hardware translator; real memory comes from the boot map.
    #[cfg(any(test, feature = "software-emulation"))]
    pub fn allocate(&self, size: usize, align: usize) -> Option<usize> {
        match self {
            Self::Hardware { .. } => panic!("cannot allocate from hardware translator"),
            Self::Emulated(mem) => mem.allocate(size, align),
        }
    }

    fn is_emulated(&self) -> bool {
        #[cfg(any(test, feature = "software-emulation"))]
        if matches!(self, Self::Emulated(_)) {
            return true;
        }
        false
    }
}

#[cfg(not(any(test, feature = "software-emulation")))]
static ADDRESS_TRANSLATOR: spin::Once<AddressTranslator> = spin::Once::new();

// Thread-local so that every test owns a private emulated memory.
#[cfg(any(test, feature = "software-emulation"))]
std::thread_local! {
    static ADDRESS_TRANSLATOR: spin::Once<AddressTranslator> = spin::Once::new();
}

macro_rules! impl_address_common {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[repr(transparent)]
        pub struct $name(usize);

        impl $name {
            #[inline]
            pub const fn as_usize(self) -> usize {
                self.0
            }

            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn is_aligned(self, align: usize) -> bool {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                self.0 & (align - 1) == 0
            }

            #[inline]
            pub const fn is_page_aligned(self) -> bool {
                self.is_aligned(arch::PAGE_SIZE)
            }

            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn align_down(self, align: usize) -> Self {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                Self(self.0 & !(align - 1))
            }

            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn align_up(self, align: usize) -> Self {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                Self((self.0 + align - 1) & !(align - 1))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:#x})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#x}", self.0)
            }
        }

        impl From<usize> for $name {
            #[inline]
            fn from(addr: usize) -> Self {
                Self::new(addr)
            }
        }

        impl Add<usize> for $name {
            type Output = Self;

            #[inline]
            fn add(self, rhs: usize) -> Self::Output {
                Self::new(self.0 + rhs)
            }
        }

        impl Sub<usize> for $name {
            type Output = Self;

            #[inline]
            fn sub(self, rhs: usize) -> Self::Output {
                Self::new(self.0 - rhs)
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

impl_address_common!(
    PhysicalAddress,
    "A physical memory address.\n\n\
     Always within the architecture's physical address width."
);

impl PhysicalAddress {
    /// # Panics
    ///
    /// Panics if the address exceeds the architecture's physical address width.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        assert!(
            arch::validate_physical(addr),
            "physical address exceeds maximum width"
        );
        Self(addr)
    }

    #[inline]
    pub fn frame_number(self) -> FrameNumber {
        FrameNumber::from(self)
    }
}

impl_address_common!(
    VirtualAddress,
    "A virtual memory address.\n\n\
     Always canonical for the architecture."
);

impl VirtualAddress {
    /// # Panics
    ///
    /// Panics if the address is not canonical.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        assert!(arch::validate_virtual(addr), "address is not canonical");
        Self(addr)
    }

    /// Returns the kernel's direct-mapped view of a physical address.
    #[inline]
    pub fn direct_mapped(phys: PhysicalAddress) -> Self {
        let translator = AddressTranslator::current();
        let virt = translator.phys_to_virt(phys.as_usize());

        // Host pointers are not canonical for the 16-bit model.
        if translator.is_emulated() {
            return Self(virt);
        }

        Self::new(virt)
    }

    #[inline]
    pub const fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    /// Index into the page table at `level` (0 = leaf table).
    #[inline]
    pub const fn page_index(self, level: usize) -> usize {
        arch::page_index(self.0, level)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PageNumber;

    #[test]
    fn physical_alignment_helpers() {
        let addr = PhysicalAddress::new(arch::PAGE_SIZE * 4 + 4);
        assert!(!addr.is_page_aligned());
        assert_eq!(addr.align_down(arch::PAGE_SIZE), PhysicalAddress::new(arch::PAGE_SIZE * 4));
        assert_eq!(addr.align_up(arch::PAGE_SIZE), PhysicalAddress::new(arch::PAGE_SIZE * 5));
    }

    #[test]
    #[should_panic(expected = "physical address exceeds maximum width")]
    fn physical_beyond_width_panics() {
        PhysicalAddress::new(1usize << arch::MAX_PHYSICAL_BITS);
    }

    #[test]
    #[should_panic(expected = "address is not canonical")]
    fn virtual_non_canonical_panics() {
        VirtualAddress::new(0x8000);
    }

    #[test]
    fn user_range_classification() {
        assert!(!arch::is_user_address(0));
        assert!(arch::is_user_address(arch::USER_SPACE_START));
        assert!(arch::is_user_address(arch::USER_SPACE_END - 1));
        assert!(!arch::is_user_address(0xFFFF_FFFF_FFFF_8000));
    }

    #[test]
    fn both_halves_are_canonical() {
        assert_eq!(VirtualAddress::new(0x1230).as_usize(), 0x1230);
        assert_eq!(
            VirtualAddress::new(0xFFFF_FFFF_FFFF_8000).as_usize(),
            0xFFFF_FFFF_FFFF_8000
        );
    }

    #[test]
    fn page_indexes() {
        let addr = VirtualAddress::new(0x1234);
        assert_eq!(addr.page_index(0), 0x3);
        assert_eq!(addr.page_index(1), 0x2);
        assert_eq!(addr.page_index(2), 0x1);
        assert_eq!(PageNumber::from(addr), PageNumber::new(0x123));
    }

    #[test]
    fn hardware_direct_map_round_trip() {
        AddressTranslator::set_current(AddressTranslator::hardware(0xFFFF_FFFF_FFFF_8000));
        let phys = PhysicalAddress::new(0x0100);
        let virt = VirtualAddress::direct_mapped(phys);
        assert_eq!(virt.as_usize(), 0xFFFF_FFFF_FFFF_8100);
        assert_eq!(AddressTranslator::current().virt_to_phys(virt.as_usize()), 0x0100);
    }

    #[test]
    fn emulated_translator_is_shareable_across_threads() {
        AddressTranslator::set_current(AddressTranslator::emulated(256));
        let base = AddressTranslator::current().allocate(16, 16).unwrap();
        let shared = AddressTranslator::current().share();
        let ptr = AddressTranslator::current().phys_to_virt(base);

        std::thread::spawn(move || {
            AddressTranslator::set_current(shared);
            assert_eq!(AddressTranslator::current().phys_to_virt(base), ptr);
        })
        .join()
        .unwrap();
    }

    #[test]
    #[should_panic(expected = "address translator already set")]
    fn panics_on_double_set() {
        AddressTranslator::set_current(AddressTranslator::hardware(0xFFFF_FFFF_FFFF_8000));
        AddressTranslator::set_current(AddressTranslator::hardware(0xFFFF_FFFF_FFFF_9000));
    }
}
