#![cfg_attr(not(any(test, feature = "software-emulation")), no_std)]

//! # Polaris Memory Manager (PMM)
//!
//! The Polaris Memory Manager (PMM) is the low-level half of memory management for the
//! Polaris kernel. It provides:
//!
//! - Physical and virtual address types, and the translator between them.
//! - A reference-counted physical frame allocator.
//! - Architecture-independent page directories over the x86_64 paging structures.
//! - Software emulation of the MMU for testing in non-kernel environments.
//!
//! Address spaces, mappings and fault handling live one layer up, in `vmm`.

extern crate alloc;

mod address;
mod arch;
mod frame;
mod frame_allocator;
mod numbers;
mod page_directory;

pub use address::{AddressTranslator, PhysicalAddress, VirtualAddress};
pub use frame::{Frame, FrameFlag, FrameFlags, copy_frame, frame_bytes, zero_frame};
pub use frame_allocator::{AllocError, FrameAllocator};
pub use numbers::{FrameNumber, PageNumber};
pub use page_directory::PageDirectory;

pub use arch::{
    KERNEL_ROOT_INDEX, PAGE_SIZE, PageEntry, PageFlags, USER_SPACE_END, USER_SPACE_START,
    flush_page, is_user_address,
};
