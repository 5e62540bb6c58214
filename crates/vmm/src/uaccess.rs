//! Copies between kernel buffers and user virtual memory.
//!
//! Each page is looked up in the page directory the way the MMU would. Missing or
//! write-protected pages go through the fault resolver first; the accessed and dirty
//! bits are set by hand because the emulated MMU does not set them.

use pmm::{PAGE_SIZE, frame_bytes};

use crate::{
    error::VmError,
    fault::{Access, FaultOutcome, PageFault, Signal},
    space::AddressSpace,
};

impl AddressSpace {
    /// Copies `buf.len()` bytes starting at user address `addr` into `buf`.
    pub fn read_user(&self, addr: usize, buf: &mut [u8]) -> Result<(), VmError> {
        let mut done = 0;
        while done < buf.len() {
            let chunk = self.with_user_page(addr + done, Access::Read, |bytes| {
                let len = bytes.len().min(buf.len() - done);
                buf[done..done + len].copy_from_slice(&bytes[..len]);
                len
            })?;
            done += chunk;
        }
        Ok(())
    }

    /// Copies `data` to user address `addr`.
    pub fn write_user(&self, addr: usize, data: &[u8]) -> Result<(), VmError> {
        let mut done = 0;
        while done < data.len() {
            let chunk = self.with_user_page(addr + done, Access::Write, |bytes| {
                let len = bytes.len().min(data.len() - done);
                bytes[..len].copy_from_slice(&data[done..done + len]);
                len
            })?;
            done += chunk;
        }
        Ok(())
    }

    /// Runs `copy` over the bytes from `addr` to the end of its page, resolving the
    /// page first if needed.
    fn with_user_page(
        &self,
        addr: usize,
        access: Access,
        copy: impl FnOnce(&mut [u8]) -> usize,
    ) -> Result<usize, VmError> {
        if !pmm::is_user_address(addr) {
            return Err(VmError::SegmentationFault);
        }
        let page = addr & !(PAGE_SIZE - 1);

        loop {
            {
                let mut state = self.lock();
                let mut binder = state.binder(self.memory());
                if let Some((frame, flags)) = binder.translate(page) {
                    if access != Access::Write || flags.is_writable() {
                        binder.update_flags(page, |flags| {
                            flags.set_accessed(true);
                            if access == Access::Write {
                                flags.set_dirty(true);
                            }
                        });
                        // SAFETY: the space lock keeps the frame mapped. Only frames
                        // of shared mappings are writable from more than one space.
                        let bytes = unsafe { frame_bytes(frame) };
                        return Ok(copy(&mut bytes[addr - page..]));
                    }
                }
            }

            match self.handle_fault(PageFault::user(addr, access))? {
                FaultOutcome::Resolved => continue,
                FaultOutcome::Signal(Signal::Bus) => return Err(VmError::IoFault),
                FaultOutcome::Signal(Signal::Segv(_)) => return Err(VmError::SegmentationFault),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        error::VmError, lifecycle::MappingRequest, mapping::Protection, space::AddressSpace,
        testing,
    };
    use pmm::PAGE_SIZE;

    #[test]
    fn write_then_read_across_pages() {
        let memory = testing::memory(8);
        let space = AddressSpace::new_user(&memory);
        let base = space
            .create_mapping(MappingRequest::anonymous(
                3 * PAGE_SIZE,
                Protection::READ | Protection::WRITE,
            ))
            .unwrap();

        let data: alloc::vec::Vec<u8> = (1..=2 * PAGE_SIZE as u8).collect();
        space.write_user(base + 5, &data).unwrap();

        let mut back = alloc::vec![0; data.len()];
        space.read_user(base + 5, &mut back).unwrap();
        assert_eq!(back, data);

        let (_, flags) = space.translate(base).unwrap();
        assert!(flags.is_dirty());
        assert!(flags.is_accessed());
    }

    #[test]
    fn read_sets_accessed_but_not_dirty() {
        let memory = testing::memory(8);
        let space = AddressSpace::new_user(&memory);
        let base = space
            .create_mapping(MappingRequest::anonymous(PAGE_SIZE, Protection::READ))
            .unwrap();

        let mut byte = [0xFF];
        space.read_user(base, &mut byte).unwrap();
        assert_eq!(byte, [0]);
        let (_, flags) = space.translate(base).unwrap();
        assert!(flags.is_accessed());
        assert!(!flags.is_dirty());
    }

    #[test]
    fn faults_become_errors() {
        let memory = testing::memory(8);
        let space = AddressSpace::new_user(&memory);
        let base = space
            .create_mapping(MappingRequest::anonymous(PAGE_SIZE, Protection::READ))
            .unwrap();

        assert_eq!(space.write_user(base, &[1]), Err(VmError::SegmentationFault));
        assert_eq!(
            space.read_user(base + PAGE_SIZE, &mut [0]),
            Err(VmError::SegmentationFault)
        );
        assert_eq!(space.read_user(0, &mut [0]), Err(VmError::SegmentationFault));
    }

    #[test]
    fn access_running_off_the_mapping_fails() {
        let memory = testing::memory(8);
        let space = AddressSpace::new_user(&memory);
        let base = space
            .create_mapping(MappingRequest::anonymous(
                PAGE_SIZE,
                Protection::READ | Protection::WRITE,
            ))
            .unwrap();

        assert_eq!(
            space.write_user(base + PAGE_SIZE - 1, &[1, 2]),
            Err(VmError::SegmentationFault)
        );
    }
}
