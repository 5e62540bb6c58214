#![cfg_attr(not(any(test, feature = "software-emulation")), no_std)]

//! # Polaris Virtual Memory Manager (VMM)
//!
//! Per-process virtual address spaces for the Polaris kernel, built on the frames and
//! page directories of `pmm`:
//!
//! - A registry of non-overlapping mappings per address space.
//! - Mapping creation, partial unmapping, fork (copy-on-write) and teardown.
//! - Demand paging for anonymous and file-backed memory through a shared zero frame
//!   and a VFS bridge.
//! - The page-fault entry point and the `mmap`/`munmap`/`msync` system calls.
//!
//! Every address space is guarded by a single lock over its registry and page
//! directory. The lock is dropped while a file-backed fault waits on the VFS.

extern crate alloc;

/// Emits a trace record only when the `detailed-logging` feature is enabled.
macro_rules! detail {
    ($($arg:tt)*) => {
        #[cfg(feature = "detailed-logging")]
        {
            log::trace!($($arg)*);
        }
    };
}

mod binder;
mod error;
mod fault;
mod kernel;
mod lifecycle;
mod mapping;
mod registry;
mod space;
mod syscall;
mod uaccess;
mod vfs;
mod zero;

#[cfg(test)]
mod testing;

pub use binder::Binder;
pub use error::VmError;
pub use fault::{Access, FaultOutcome, PageFault, Privilege, SegvCode, Signal, handle_page_fault};
pub use kernel::{KernelMemory, KernelSpace};
pub use lifecycle::MappingRequest;
pub use mapping::{Mapping, MappingId, Protection, Sharing};
pub use registry::Registry;
pub use space::AddressSpace;
pub use syscall::{Errno, MapFlags, sys_mmap, sys_msync, sys_munmap};
pub use vfs::{FileHandle, RamFile, VfsError, VfsFile, read_page, write_back_page};
pub use zero::ZeroPage;
