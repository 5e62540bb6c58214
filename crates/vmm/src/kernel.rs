//! Kernel-wide memory state: the frame allocator, the zero frame and the kernel's
//! own address space.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use pmm::{FrameAllocator, PageDirectory, PhysicalAddress, copy_frame};
use spin::{Mutex, MutexGuard, Once};

use crate::{
    error::{VmError, invariant_violation},
    zero::ZeroPage,
};

/// Memory state shared by every address space.
///
/// Lock order: an address-space lock may be held while taking the frame lock, never
/// the other way round.
pub struct KernelMemory {
    frames: Mutex<FrameAllocator>,
    zero: ZeroPage,
    kernel_space: Once<KernelSpace>,
    kernel_bound: AtomicBool,
    user_spaces_created: AtomicBool,
    next_space_id: AtomicU64,
}

/// The kernel's own address space. Bound once at boot, never duplicated or destroyed.
pub struct KernelSpace {
    directory: Mutex<PageDirectory>,
}

impl KernelSpace {
    pub fn directory(&self) -> MutexGuard<'_, PageDirectory> {
        self.directory.lock()
    }

    /// Switches to the kernel directory.
    ///
    /// # Safety
    /// See [`PageDirectory::activate`].
    pub unsafe fn activate(&self) {
        // SAFETY: upheld by the caller.
        unsafe { self.directory.lock().activate() }
    }
}

impl KernelMemory {
    /// Takes ownership of `frames` and sets aside the zero frame.
    pub fn new(mut frames: FrameAllocator) -> Result<Arc<Self>, VmError> {
        let zero = ZeroPage::new(&mut frames)?;
        Ok(Arc::new(Self {
            frames: Mutex::new(frames),
            zero,
            kernel_space: Once::new(),
            kernel_bound: AtomicBool::new(false),
            user_spaces_created: AtomicBool::new(false),
            next_space_id: AtomicU64::new(1),
        }))
    }

    /// Binds the kernel's initial page directory.
    ///
    /// # Panics
    /// Panics if called twice, or after the first user address space exists.
    pub fn bind_initial_directory(&self, directory: PageDirectory) -> &KernelSpace {
        if self.user_spaces_created.load(Ordering::Acquire) {
            invariant_violation(format_args!(
                "kernel directory bound after a user address space was created"
            ));
        }
        if self
            .kernel_bound
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            invariant_violation(format_args!("kernel directory bound twice"));
        }

        log::debug!("kernel page directory bound");
        self.kernel_space.call_once(|| KernelSpace {
            directory: Mutex::new(directory),
        })
    }

    pub fn kernel_space(&self) -> Option<&KernelSpace> {
        self.kernel_space.get()
    }

    pub fn zero_page(&self) -> &ZeroPage {
        &self.zero
    }

    pub fn free_frames(&self) -> usize {
        self.frames.lock().free_frames()
    }

    pub fn allocated_frames(&self) -> usize {
        self.frames.lock().allocated_frames()
    }

    pub fn refcount(&self, frame: PhysicalAddress) -> usize {
        self.frames.lock().refcount(frame)
    }

    /// Registers a new user space and returns its id. Fails hard if the kernel
    /// directory is not bound yet.
    pub(crate) fn register_user_space(&self) -> u64 {
        if self.kernel_space.get().is_none() {
            invariant_violation(format_args!(
                "user address space created before the kernel directory was bound"
            ));
        }
        self.user_spaces_created.store(true, Ordering::Release);
        self.next_space_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn allocate_frame(&self) -> Result<PhysicalAddress, VmError> {
        Ok(self.frames.lock().allocate()?)
    }

    pub(crate) fn allocate_zeroed_frame(&self) -> Result<PhysicalAddress, VmError> {
        Ok(self.frames.lock().allocate_zeroed()?)
    }

    /// Allocates a frame holding a copy of `source`.
    pub(crate) fn allocate_copy(&self, source: PhysicalAddress) -> Result<PhysicalAddress, VmError> {
        let frame = self.allocate_frame()?;
        // SAFETY: `frame` is fresh; `source` is kept alive by the caller's mapping and
        // only read.
        unsafe { copy_frame(source, frame) };
        Ok(frame)
    }

    /// Adds a page-table reference to `frame`. The zero frame is not counted.
    pub(crate) fn retain_frame(&self, frame: PhysicalAddress) {
        if self.zero.is_zero_frame(frame) {
            return;
        }
        if let Err(error) = self.frames.lock().retain(frame) {
            invariant_violation(format_args!("retain of {} failed: {:?}", frame, error));
        }
    }

    /// Drops a page-table reference to `frame`, freeing it with the last one. The zero
    /// frame is not counted.
    pub(crate) fn release_frame(&self, frame: PhysicalAddress) {
        if self.zero.is_zero_frame(frame) {
            return;
        }
        if let Err(error) = self.frames.lock().release(frame) {
            invariant_violation(format_args!("release of {} failed: {:?}", frame, error));
        }
    }
}
