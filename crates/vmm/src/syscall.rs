//! `mmap`, `munmap` and `msync`.
//!
//! Raw arguments are checked and translated here; failures come back as POSIX
//! error numbers.

use alloc::sync::Arc;
use core::fmt;

use bitflags::bitflags;
use pmm::PAGE_SIZE;

use crate::{
    error::VmError,
    lifecycle::MappingRequest,
    mapping::Protection,
    space::AddressSpace,
    vfs::FileHandle,
};

bitflags! {
    /// `mmap` flags, with the Linux values.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u32 {
        const SHARED = 0x01;
        const PRIVATE = 0x02;
        const FIXED = 0x10;
        const ANONYMOUS = 0x20;
        const POPULATE = 0x8000;
    }
}

/// POSIX error numbers returned by the memory system calls.
#[allow(clippy::upper_case_acronyms)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Errno {
    EIO = 5,
    EBADF = 9,
    ENOMEM = 12,
    EFAULT = 14,
    EEXIST = 17,
    EINVAL = 22,
}

impl Errno {
    pub fn code(self) -> i32 {
        self as i32
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ({})", self, self.code())
    }
}

impl From<VmError> for Errno {
    fn from(error: VmError) -> Self {
        match error {
            VmError::Overlap => Errno::EEXIST,
            VmError::InvalidAlignment | VmError::InvalidArgument => Errno::EINVAL,
            VmError::OutOfVirtualSpace | VmError::OutOfMemory => Errno::ENOMEM,
            VmError::IoFault => Errno::EIO,
            VmError::SegmentationFault => Errno::EFAULT,
        }
    }
}

fn page_align(length: usize) -> Result<usize, Errno> {
    if length == 0 {
        return Err(Errno::EINVAL);
    }
    length.checked_next_multiple_of(PAGE_SIZE).ok_or(Errno::ENOMEM)
}

/// Maps `length` bytes and returns the chosen address.
///
/// `handle` is ignored for anonymous mappings. Exactly one of `MAP_SHARED` and
/// `MAP_PRIVATE` must be given.
pub fn sys_mmap(
    space: &Arc<AddressSpace>,
    handle: Option<&Arc<FileHandle>>,
    addr: usize,
    length: usize,
    prot: u32,
    flags: u32,
    offset: usize,
) -> Result<usize, Errno> {
    let prot = Protection::from_bits(prot).ok_or(Errno::EINVAL)?;
    let flags = MapFlags::from_bits(flags).ok_or(Errno::EINVAL)?;
    let length = page_align(length)?;

    if flags.contains(MapFlags::SHARED) == flags.contains(MapFlags::PRIVATE) {
        return Err(Errno::EINVAL);
    }
    if offset % PAGE_SIZE != 0 {
        return Err(Errno::EINVAL);
    }

    let mut request = if flags.contains(MapFlags::ANONYMOUS) {
        MappingRequest::anonymous(length, prot)
    } else {
        let handle = handle.ok_or(Errno::EBADF)?;
        if handle.is_closed() {
            return Err(Errno::EBADF);
        }
        MappingRequest::file(Arc::clone(handle), offset, length, prot)
    };
    if flags.contains(MapFlags::SHARED) {
        request = request.shared();
    }
    if flags.contains(MapFlags::FIXED) {
        request = request.fixed(addr);
    } else if addr != 0 {
        request = request.at(addr);
    }
    if flags.contains(MapFlags::POPULATE) {
        request = request.populate();
    }

    space.create_mapping(request).map_err(|error| {
        log::debug!("mmap of {:#x} bytes failed: {}", length, error);
        Errno::from(error)
    })
}

/// Unmaps every page in `[addr, addr + length)`, rounding `length` up.
pub fn sys_munmap(space: &AddressSpace, addr: usize, length: usize) -> Result<(), Errno> {
    let length = page_align(length)?;
    space.unmap_range(addr, length).map_err(Errno::from)
}

/// Writes dirty shared file pages in `[addr, addr + length)` back to their files.
pub fn sys_msync(space: &AddressSpace, addr: usize, length: usize) -> Result<(), Errno> {
    space.sync_range(addr, length).map_err(Errno::from)
}
