use std::sync::Arc;

use pmm::{AddressTranslator, FrameAllocator, PAGE_SIZE, PageDirectory, PhysicalAddress};
use vmm::KernelMemory;

/// Boots an emulated machine on the current thread with `frames` frames, one of
/// which becomes the zero frame.
pub fn boot(frames: usize) -> Arc<KernelMemory> {
    if AddressTranslator::try_current().is_none() {
        AddressTranslator::set_current(AddressTranslator::emulated(0x1_0000));
    }
    let base = AddressTranslator::current()
        .allocate(frames * PAGE_SIZE, PAGE_SIZE)
        .expect("emulated memory exhausted");
    let memory = KernelMemory::new(FrameAllocator::new(PhysicalAddress::new(base), frames * PAGE_SIZE))
        .expect("no room for the zero frame");
    memory.bind_initial_directory(PageDirectory::new());
    memory
}
