//! Page table binder.
//!
//! The only layer that installs or removes leaf entries for user pages, and the one
//! that keeps frame reference counts in step with them: every present entry holds
//! one reference to its frame, except entries pointing at the zero frame.

use pmm::{PageDirectory, PageFlags, PageNumber, PhysicalAddress, VirtualAddress};

use crate::{error::VmError, kernel::KernelMemory};

/// Binds pages of one address space. Borrowing the directory mutably means the
/// owning space's lock is held for the binder's lifetime.
pub struct Binder<'a> {
    directory: &'a mut PageDirectory,
    memory: &'a KernelMemory,
}

fn pages(vaddr: usize, page_count: usize) -> impl DoubleEndedIterator<Item = VirtualAddress> {
    PageNumber::containing(vaddr)
        .range(page_count)
        .map(PageNumber::start)
}

impl<'a> Binder<'a> {
    pub fn new(directory: &'a mut PageDirectory, memory: &'a KernelMemory) -> Self {
        Self { directory, memory }
    }

    pub fn memory(&self) -> &'a KernelMemory {
        self.memory
    }

    /// Installs `frame` at `vaddr`, taking over the caller's reference to it.
    /// Anything mapped there before is released, including the entry's own
    /// reference when `frame` is already mapped at `vaddr`.
    pub fn map_page(&mut self, vaddr: usize, frame: PhysicalAddress, flags: PageFlags) {
        let page = VirtualAddress::new(vaddr);
        if let Some((previous, _)) = self.directory.translate(page) {
            self.memory.release_frame(previous);
        }
        self.directory.map(page, frame, flags);
    }

    /// Removes the entry at `vaddr` and drops its frame reference. Unmapping an
    /// absent page does nothing.
    pub fn unmap_page(&mut self, vaddr: usize) -> Option<PhysicalAddress> {
        let frame = self.take_page(vaddr)?.0;
        self.memory.release_frame(frame);
        Some(frame)
    }

    /// Removes the entry at `vaddr` and hands its frame reference to the caller.
    pub fn take_page(&mut self, vaddr: usize) -> Option<(PhysicalAddress, PageFlags)> {
        let page = VirtualAddress::new(vaddr);
        let entry = self.directory.translate(page)?;
        self.directory.unmap(page);
        Some(entry)
    }

    pub fn translate(&mut self, vaddr: usize) -> Option<(PhysicalAddress, PageFlags)> {
        self.directory.translate(VirtualAddress::new(vaddr))
    }

    /// Rewrites the flags of the page at `vaddr`, keeping its frame.
    pub fn update_flags(&mut self, vaddr: usize, update: impl FnOnce(&mut PageFlags)) -> bool {
        self.directory.update_flags(VirtualAddress::new(vaddr), update)
    }

    /// Backs `page_count` pages at `vaddr` with fresh zeroed frames right away.
    ///
    /// On failure every frame mapped by this call is unmapped and freed again, and
    /// the range is left fully unmapped.
    pub fn alloc_eager_range(
        &mut self,
        vaddr: usize,
        page_count: usize,
        flags: PageFlags,
    ) -> Result<(), VmError> {
        for (done, page) in pages(vaddr, page_count).enumerate() {
            match self.memory.allocate_zeroed_frame() {
                Ok(frame) => self.map_page(page.as_usize(), frame, flags),
                Err(error) => {
                    log::warn!(
                        "eager allocation at {:#x} failed after {} of {} pages",
                        vaddr,
                        done,
                        page_count
                    );
                    self.free_range(vaddr, done);
                    return Err(error);
                }
            }
        }
        Ok(())
    }

    /// Unmaps every page in the range and releases its frame. Holes are skipped.
    /// Returns how many pages were mapped.
    pub fn free_range(&mut self, vaddr: usize, page_count: usize) -> usize {
        pages(vaddr, page_count)
            .filter_map(|page| self.unmap_page(page.as_usize()))
            .count()
    }

    /// Points every unmapped page in the range at the zero frame, read-only.
    /// Pages that already have a frame are left alone.
    pub fn bind_zero_range(&mut self, vaddr: usize, page_count: usize, flags: PageFlags) {
        let zero = self.memory.zero_page().frame();
        let mut flags = flags;
        flags.set_writable(false);
        for page in pages(vaddr, page_count) {
            if self.directory.translate(page).is_none() {
                self.directory.map(page, zero, flags);
            }
        }
    }

    /// Removes every zero-frame binding in the range. Pages with their own frame are
    /// left alone.
    pub fn unbind_zero_range(&mut self, vaddr: usize, page_count: usize) {
        let zero = self.memory.zero_page();
        for page in pages(vaddr, page_count) {
            if let Some((frame, _)) = self.directory.translate(page) {
                if zero.is_zero_frame(frame) {
                    self.directory.unmap(page);
                }
            }
        }
    }
}
