//! Page-fault resolution.
//!
//! A fault ends either `Resolved`, with the page installed so the access can be
//! retried, or as a signal for the faulting process. Only faults that point at a
//! kernel bug stop the kernel.

use alloc::sync::Arc;

use pmm::{PAGE_SIZE, PhysicalAddress};

use crate::{
    binder::Binder,
    error::{VmError, invariant_violation},
    mapping::Mapping,
    space::AddressSpace,
    vfs::read_page,
};

/// The kind of access that faulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
    Execute,
}

/// The mode the CPU was in when the fault was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Privilege {
    User,
    Kernel,
}

/// A page fault as reported by the trap handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFault {
    pub address: usize,
    pub access: Access,
    pub privilege: Privilege,
}

impl PageFault {
    pub fn user(address: usize, access: Access) -> Self {
        Self {
            address,
            access,
            privilege: Privilege::User,
        }
    }

    /// Decodes an x86 page-fault error code, with `address` read from CR2.
    pub fn from_error_code(address: usize, error_code: u64) -> Self {
        const CAUSED_BY_WRITE: u64 = 1 << 1;
        const USER_MODE: u64 = 1 << 2;
        const INSTRUCTION_FETCH: u64 = 1 << 4;

        let access = if error_code & INSTRUCTION_FETCH != 0 {
            Access::Execute
        } else if error_code & CAUSED_BY_WRITE != 0 {
            Access::Write
        } else {
            Access::Read
        };
        let privilege = if error_code & USER_MODE != 0 {
            Privilege::User
        } else {
            Privilege::Kernel
        };
        Self {
            address,
            access,
            privilege,
        }
    }
}

/// `si_code` of a segmentation fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegvCode {
    /// Nothing is mapped at the address.
    MapErr,
    /// The mapping forbids the access.
    AccErr,
}

/// A signal to deliver to the faulting process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Segv(SegvCode),
    /// The backing object could not supply the page.
    Bus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    Resolved,
    Signal(Signal),
}

/// Page-fault entry point for the trap handler.
///
/// # Panics
/// Panics if no address space is active, or if the kernel faulted outside the user
/// range.
pub fn handle_page_fault(
    active: Option<&AddressSpace>,
    fault: PageFault,
) -> Result<FaultOutcome, VmError> {
    let Some(space) = active else {
        invariant_violation(format_args!(
            "page fault at {:#x} with no active address space",
            fault.address
        ));
    };
    space.handle_fault(fault)
}

impl AddressSpace {
    /// Resolves `fault` in this space. Frame exhaustion is returned as
    /// [`VmError::OutOfMemory`] for the caller to act on.
    pub fn handle_fault(&self, fault: PageFault) -> Result<FaultOutcome, VmError> {
        let addr = fault.address;
        if !pmm::is_user_address(addr) {
            if fault.privilege == Privilege::Kernel {
                invariant_violation(format_args!(
                    "kernel {:?} fault at {:#x} outside user space",
                    fault.access, addr
                ));
            }
            return Ok(self.segv(fault, SegvCode::MapErr));
        }
        let page = addr & !(PAGE_SIZE - 1);

        loop {
            let mut guard = self.lock();
            let state = &mut *guard;
            let Some(mapping) = state.registry.lookup(addr) else {
                return Ok(self.segv(fault, SegvCode::MapErr));
            };
            if !mapping.prot().permits(fault.access) {
                return Ok(self.segv(fault, SegvCode::AccErr));
            }
            let mut binder = Binder::new(&mut state.directory, self.memory());

            if let Some((frame, flags)) = binder.translate(page) {
                if fault.access == Access::Write && !flags.is_writable() {
                    resolve_write_protect(&mut binder, mapping, page, frame)?;
                } else {
                    detail!("fault at {:#x} already resolved", addr);
                }
                return Ok(FaultOutcome::Resolved);
            }

            let Some(handle) = mapping.backing() else {
                resolve_anonymous(&mut binder, mapping, page, fault.access)?;
                return Ok(FaultOutcome::Resolved);
            };

            // File-backed: read without the lock, then check nothing changed.
            let id = mapping.id();
            let handle = Arc::clone(handle);
            let offset = mapping.file_offset(page);
            let flags = mapping.page_flags();
            drop(guard);

            detail!("fault at {:#x} reads offset {:#x} of file {}", addr, offset, handle.id());
            let frame = match read_page(&handle, offset, self.memory()) {
                Ok(frame) => frame,
                Err(VmError::IoFault) => {
                    log::warn!(
                        "address space {}: SIGBUS at {:#x}, offset {:#x} of file handle {}",
                        self.id(),
                        addr,
                        offset,
                        handle.id()
                    );
                    return Ok(FaultOutcome::Signal(Signal::Bus));
                }
                Err(error) => return Err(error),
            };

            let mut guard = self.lock();
            let state = &mut *guard;
            let unchanged = state
                .registry
                .lookup(addr)
                .is_some_and(|current| current.id() == id);
            let mut binder = Binder::new(&mut state.directory, self.memory());
            if unchanged && binder.translate(page).is_none() {
                // A private page read from the file is already a private copy.
                binder.map_page(page, frame, flags);
                return Ok(FaultOutcome::Resolved);
            }
            drop(guard);

            self.memory().release_frame(frame);
            detail!("fault at {:#x} raced with a mapping change, retrying", addr);
        }
    }

    fn segv(&self, fault: PageFault, code: SegvCode) -> FaultOutcome {
        log::warn!(
            "address space {}: SIGSEGV ({:?}) on {:?} at {:#x}",
            self.id(),
            code,
            fault.access,
            fault.address
        );
        FaultOutcome::Signal(Signal::Segv(code))
    }
}

/// A write hit a present page that is mapped read-only although the mapping
/// allows writes.
fn resolve_write_protect(
    binder: &mut Binder<'_>,
    mapping: &Mapping,
    page: usize,
    frame: PhysicalAddress,
) -> Result<(), VmError> {
    let memory = binder.memory();
    if memory.zero_page().is_zero_frame(frame) {
        detail!("write to zero page at {:#x}", page);
        let fresh = memory.allocate_zeroed_frame()?;
        binder.map_page(page, fresh, mapping.page_flags());
    } else if mapping.is_shared() || memory.refcount(frame) == 1 {
        detail!("write upgrade at {:#x}", page);
        binder.update_flags(page, |flags| flags.set_writable(true));
    } else {
        detail!("copy-on-write at {:#x}", page);
        let copy = memory.allocate_copy(frame)?;
        binder.map_page(page, copy, mapping.page_flags());
    }
    Ok(())
}

/// First touch of an anonymous page.
fn resolve_anonymous(
    binder: &mut Binder<'_>,
    mapping: &Mapping,
    page: usize,
    access: Access,
) -> Result<(), VmError> {
    let memory = binder.memory();
    if !mapping.is_shared() && access != Access::Write {
        detail!("zero page bound at {:#x}", page);
        binder.map_page(page, memory.zero_page().frame(), mapping.read_only_flags());
    } else {
        detail!("fresh anonymous frame at {:#x}", page);
        let frame = memory.allocate_zeroed_frame()?;
        binder.map_page(page, frame, mapping.page_flags());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        lifecycle::MappingRequest,
        mapping::Protection,
        testing,
        vfs::{FileHandle, RamFile, VfsError, VfsFile},
    };
    use alloc::vec::Vec;
    use pmm::frame_bytes;
    use spin::Mutex;

    const RW: Protection = Protection::READ.union(Protection::WRITE);

    fn read_fault(addr: usize) -> PageFault {
        PageFault::user(addr, Access::Read)
    }

    fn write_fault(addr: usize) -> PageFault {
        PageFault::user(addr, Access::Write)
    }

    fn frame_at(space: &AddressSpace, addr: usize) -> PhysicalAddress {
        space.translate(addr).expect("page not resolved").0
    }

    #[test]
    fn error_code_decoding() {
        let fault = PageFault::from_error_code(0x2000, 0b0_0110);
        assert_eq!(fault.access, Access::Write);
        assert_eq!(fault.privilege, Privilege::User);

        let fault = PageFault::from_error_code(0x2000, 0b1_0001);
        assert_eq!(fault.access, Access::Execute);
        assert_eq!(fault.privilege, Privilege::Kernel);

        assert_eq!(PageFault::from_error_code(0x2000, 0).access, Access::Read);
    }

    #[test]
    fn unmapped_address_is_segv() {
        let memory = testing::memory(8);
        let space = AddressSpace::new_user(&memory);
        assert_eq!(
            space.handle_fault(read_fault(0x2000)),
            Ok(FaultOutcome::Signal(Signal::Segv(SegvCode::MapErr)))
        );
    }

    #[test]
    fn protection_violation_is_segv() {
        let memory = testing::memory(8);
        let space = AddressSpace::new_user(&memory);
        let base = space
            .create_mapping(MappingRequest::anonymous(PAGE_SIZE, Protection::READ))
            .unwrap();

        assert_eq!(
            space.handle_fault(write_fault(base)),
            Ok(FaultOutcome::Signal(Signal::Segv(SegvCode::AccErr)))
        );
        assert_eq!(
            space.handle_fault(PageFault::user(base, Access::Execute)),
            Ok(FaultOutcome::Signal(Signal::Segv(SegvCode::AccErr)))
        );
        assert!(space.translate(base).is_none());
    }

    #[test]
    fn user_fault_on_kernel_address_is_segv() {
        let memory = testing::memory(8);
        let space = AddressSpace::new_user(&memory);
        assert_eq!(
            space.handle_fault(read_fault(0xFFFF_FFFF_FFFF_9000)),
            Ok(FaultOutcome::Signal(Signal::Segv(SegvCode::MapErr)))
        );
    }

    #[test]
    #[should_panic(expected = "outside user space")]
    fn kernel_fault_on_kernel_address_is_fatal() {
        let memory = testing::memory(8);
        let space = AddressSpace::new_user(&memory);
        let _ = space.handle_fault(PageFault {
            address: 0xFFFF_FFFF_FFFF_9000,
            access: Access::Read,
            privilege: Privilege::Kernel,
        });
    }

    #[test]
    #[should_panic(expected = "no active address space")]
    fn fault_without_active_space_is_fatal() {
        let _ = handle_page_fault(None, read_fault(0x2000));
    }

    #[test]
    #[cfg(not(feature = "mmap-no-cow"))]
    fn read_binds_zero_frame_read_only() {
        let memory = testing::memory(8);
        let space = AddressSpace::new_user(&memory);
        let base = space
            .create_mapping(MappingRequest::anonymous(2 * PAGE_SIZE, RW))
            .unwrap();

        assert_eq!(
            handle_page_fault(Some(&*space), read_fault(base + 3)),
            Ok(FaultOutcome::Resolved)
        );
        let (frame, flags) = space.translate(base).unwrap();
        assert_eq!(frame, memory.zero_page().frame());
        assert!(!flags.is_writable());
        assert_eq!(memory.allocated_frames(), 1);
    }

    #[test]
    #[cfg(not(feature = "mmap-no-cow"))]
    fn write_after_zero_read_gets_private_frame() {
        let memory = testing::memory(8);
        let space = AddressSpace::new_user(&memory);
        let base = space
            .create_mapping(MappingRequest::anonymous(2 * PAGE_SIZE, RW))
            .unwrap();
        space.handle_fault(read_fault(base)).unwrap();
        space.handle_fault(read_fault(base + PAGE_SIZE)).unwrap();

        space.handle_fault(write_fault(base)).unwrap();

        let (frame, flags) = space.translate(base).unwrap();
        assert_ne!(frame, memory.zero_page().frame());
        assert!(flags.is_writable());
        assert!(unsafe { frame_bytes(frame) }.iter().all(|&b| b == 0));
        assert_eq!(frame_at(&space, base + PAGE_SIZE), memory.zero_page().frame());
    }

    #[test]
    fn first_write_allocates_directly() {
        let memory = testing::memory(8);
        let space = AddressSpace::new_user(&memory);
        let base = space
            .create_mapping(MappingRequest::anonymous(PAGE_SIZE, RW))
            .unwrap();

        space.handle_fault(write_fault(base)).unwrap();
        assert_ne!(frame_at(&space, base), memory.zero_page().frame());
        assert_eq!(memory.allocated_frames(), 2);
    }

    #[test]
    fn shared_anonymous_read_allocates() {
        let memory = testing::memory(8);
        let space = AddressSpace::new_user(&memory);
        let base = space
            .create_mapping(MappingRequest::anonymous(PAGE_SIZE, RW).shared())
            .unwrap();

        space.handle_fault(read_fault(base)).unwrap();
        let (frame, flags) = space.translate(base).unwrap();
        assert_ne!(frame, memory.zero_page().frame());
        assert!(flags.is_writable());
    }

    #[test]
    #[cfg(not(feature = "mmap-no-cow"))]
    fn out_of_frames_is_reported() {
        // Only the zero frame exists.
        let memory = testing::memory(1);
        let space = AddressSpace::new_user(&memory);
        let base = space
            .create_mapping(MappingRequest::anonymous(PAGE_SIZE, RW))
            .unwrap();

        assert_eq!(space.handle_fault(read_fault(base)), Ok(FaultOutcome::Resolved));
        assert_eq!(space.handle_fault(write_fault(base)), Err(VmError::OutOfMemory));
        assert_eq!(frame_at(&space, base), memory.zero_page().frame());
    }

    #[test]
    fn file_fault_reads_the_right_page() {
        let memory = testing::memory(8);
        let space = AddressSpace::new_user(&memory);
        let data: Vec<u8> = (0..4 * PAGE_SIZE).map(|i| (i / PAGE_SIZE) as u8 + 1).collect();
        let handle = FileHandle::new(RamFile::new(data));
        let base = space
            .create_mapping(MappingRequest::file(handle, PAGE_SIZE, 2 * PAGE_SIZE, Protection::READ))
            .unwrap();

        space.handle_fault(read_fault(base + PAGE_SIZE)).unwrap();
        let (frame, flags) = space.translate(base + PAGE_SIZE).unwrap();
        assert!(unsafe { frame_bytes(frame) }.iter().all(|&b| b == 3));
        assert!(!flags.is_writable());
        assert!(space.translate(base).is_none());
    }

    #[test]
    fn file_fault_past_end_is_bus_error() {
        let memory = testing::memory(8);
        let space = AddressSpace::new_user(&memory);
        let handle = FileHandle::new(RamFile::new(alloc::vec![1; PAGE_SIZE]));
        let base = space
            .create_mapping(MappingRequest::file(handle, 0, 2 * PAGE_SIZE, Protection::READ))
            .unwrap();

        assert_eq!(space.handle_fault(read_fault(base)), Ok(FaultOutcome::Resolved));
        assert_eq!(
            space.handle_fault(read_fault(base + PAGE_SIZE)),
            Ok(FaultOutcome::Signal(Signal::Bus))
        );
        assert_eq!(memory.allocated_frames(), 2);
    }

    /// Unmaps its own mapping while a fault is reading from it.
    struct UnmapDuringRead {
        space: Mutex<Option<(Arc<AddressSpace>, usize)>>,
    }

    impl VfsFile for UnmapDuringRead {
        fn read(&self, buf: &mut [u8], _offset: usize) -> Result<usize, VfsError> {
            if let Some((space, base)) = self.space.lock().take() {
                space.unmap_range(base, PAGE_SIZE).unwrap();
            }
            buf.fill(0xAA);
            Ok(buf.len())
        }

        fn write(&self, buf: &[u8], _offset: usize) -> Result<usize, VfsError> {
            Ok(buf.len())
        }

        fn size(&self) -> usize {
            PAGE_SIZE
        }
    }

    #[test]
    fn mapping_removed_during_read_is_revalidated() {
        let memory = testing::memory(8);
        let space = AddressSpace::new_user(&memory);
        let file = Arc::new(UnmapDuringRead {
            space: Mutex::new(None),
        });
        let handle = FileHandle::new(file.clone());
        let base = space
            .create_mapping(MappingRequest::file(handle, 0, PAGE_SIZE, Protection::READ))
            .unwrap();
        *file.space.lock() = Some((Arc::clone(&space), base));

        assert_eq!(
            space.handle_fault(read_fault(base)),
            Ok(FaultOutcome::Signal(Signal::Segv(SegvCode::MapErr)))
        );
        assert!(space.translate(base).is_none());
        assert_eq!(memory.allocated_frames(), 1);
    }
}
