//! Architecture-specific paging primitives.
//!
//! The hardware implementation is selected for x86_64 kernel builds. Tests and the
//! `software-emulation` feature select a software MMU that runs on any host.

// The x86_64 module is compiled during tests too so that it keeps type-checking.
#[cfg(target_arch = "x86_64")]
mod x86_64;
#[cfg(all(target_arch = "x86_64", not(test), not(feature = "software-emulation")))]
pub use x86_64::*;

#[cfg(any(test, feature = "software-emulation"))]
mod software;
#[cfg(any(test, feature = "software-emulation"))]
pub use software::*;

/// Returns true if `addr` lies inside the range handed out to user mappings.
#[inline]
pub const fn is_user_address(addr: usize) -> bool {
    addr >= USER_SPACE_START && addr < USER_SPACE_END
}
