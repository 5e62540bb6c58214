//! Per-process address spaces.

use alloc::{sync::Arc, vec::Vec};

use pmm::{PageDirectory, PageFlags, PhysicalAddress};
use spin::{Mutex, MutexGuard};

use crate::{
    binder::Binder,
    kernel::KernelMemory,
    lifecycle,
    mapping::Mapping,
    registry::Registry,
};

/// Everything guarded by the space lock.
pub(crate) struct SpaceState {
    pub(crate) registry: Registry,
    pub(crate) directory: PageDirectory,
}

impl SpaceState {
    pub(crate) fn binder<'a>(&'a mut self, memory: &'a KernelMemory) -> Binder<'a> {
        Binder::new(&mut self.directory, memory)
    }
}

/// The virtual memory of one process: its mappings and the page directory that
/// resolves them.
///
/// Spaces are shared as `Arc<AddressSpace>` between the threads of a process and
/// the file handles they map. Dropping the last reference tears every mapping down;
/// [`AddressSpace::destroy`] does the same and reports write-back failures.
pub struct AddressSpace {
    id: u64,
    memory: Arc<KernelMemory>,
    state: Mutex<SpaceState>,
}

impl AddressSpace {
    /// Creates an empty user address space sharing the kernel half.
    ///
    /// # Panics
    /// Panics if the kernel directory has not been bound.
    pub fn new_user(memory: &Arc<KernelMemory>) -> Arc<Self> {
        let id = memory.register_user_space();
        let mut directory = PageDirectory::new();
        if let Some(kernel) = memory.kernel_space() {
            directory.inherit_kernel_entries(&kernel.directory());
        }

        log::debug!("address space {} created", id);
        Arc::new(Self {
            id,
            memory: Arc::clone(memory),
            state: Mutex::new(SpaceState {
                registry: Registry::new(),
                directory,
            }),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn memory(&self) -> &Arc<KernelMemory> {
        &self.memory
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, SpaceState> {
        self.state.lock()
    }

    /// Switches the CPU to this space's page directory.
    ///
    /// # Safety
    /// See [`PageDirectory::activate`].
    pub unsafe fn activate(&self) {
        // SAFETY: upheld by the caller.
        unsafe { self.state.lock().directory.activate() }
    }

    /// Returns a snapshot of every mapping, in address order.
    pub fn mappings(&self) -> Vec<Mapping> {
        self.lock().registry.iter().cloned().collect()
    }

    /// Returns the mapping containing `addr`.
    pub fn mapping_at(&self, addr: usize) -> Option<Mapping> {
        self.lock().registry.lookup(addr).cloned()
    }

    /// Returns the frame and entry flags currently resolving `addr`, if any.
    pub fn translate(&self, addr: usize) -> Option<(PhysicalAddress, PageFlags)> {
        if !pmm::is_user_address(addr) {
            return None;
        }
        let mut state = self.lock();
        state.binder(&self.memory).translate(addr)
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        let pending = lifecycle::teardown_all(state, &self.memory);
        if let Err(error) = lifecycle::finish_teardown(pending, &self.memory) {
            log::warn!("address space {} dropped with lost writes: {}", self.id, error);
        }
        log::debug!("address space {} released", self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{lifecycle::MappingRequest, mapping::Protection, testing};
    use pmm::PAGE_SIZE;

    #[test]
    fn spaces_get_distinct_ids() {
        let memory = testing::memory(8);
        let a = AddressSpace::new_user(&memory);
        let b = AddressSpace::new_user(&memory);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn dropping_a_space_frees_its_frames() {
        let memory = testing::memory(16);
        {
            let space = AddressSpace::new_user(&memory);
            space
                .create_mapping(
                    MappingRequest::anonymous(4 * PAGE_SIZE, Protection::READ | Protection::WRITE)
                        .populate(),
                )
                .unwrap();
            assert_eq!(memory.allocated_frames(), 5);
        }
        assert_eq!(memory.allocated_frames(), 1);
    }

    #[test]
    fn translate_ignores_kernel_addresses() {
        let memory = testing::memory(8);
        let space = AddressSpace::new_user(&memory);
        assert!(space.translate(0xFFFF_FFFF_FFFF_9000).is_none());
        assert!(space.translate(0x2000).is_none());
    }
}
