//! Shared setup for unit tests: an emulated machine per test thread.

use alloc::sync::Arc;

use pmm::{AddressTranslator, FrameAllocator, PAGE_SIZE, PageDirectory, PhysicalAddress};

use crate::kernel::KernelMemory;

/// Largest emulated memory the 16-bit model can address.
const EMULATED_BYTES: usize = 0x1_0000;

/// Kernel memory with `frames` frames (one of them the zero frame) and no kernel
/// directory yet.
pub(crate) fn memory_unbound(frames: usize) -> Arc<KernelMemory> {
    if AddressTranslator::try_current().is_none() {
        AddressTranslator::set_current(AddressTranslator::emulated(EMULATED_BYTES));
    }
    let base = AddressTranslator::current()
        .allocate(frames * PAGE_SIZE, PAGE_SIZE)
        .expect("emulated memory exhausted");
    let allocator = FrameAllocator::new(PhysicalAddress::new(base), frames * PAGE_SIZE);
    KernelMemory::new(allocator).expect("no room for the zero frame")
}

/// Kernel memory with the kernel directory bound, ready for user spaces.
pub(crate) fn memory(frames: usize) -> Arc<KernelMemory> {
    let memory = memory_unbound(frames);
    memory.bind_initial_directory(PageDirectory::new());
    memory
}
