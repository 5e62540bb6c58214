use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::{PhysicalAddress, VirtualAddress, arch};

/// Holds metadata for a physical memory frame.
///
/// Modeled after Linux's `struct page`. Besides the state flags, a frame carries the
/// number of page table entries (across every address space) that point at it, so a
/// frame shared copy-on-write is only freed once its last mapping goes away.
pub struct Frame {
    pub flags: FrameFlags,
    refcount: AtomicUsize,
}

impl Frame {
    pub fn refcount(&self) -> usize {
        self.refcount.load(Ordering::Acquire)
    }

    pub(crate) fn set_refcount(&self, count: usize) {
        self.refcount.store(count, Ordering::Release);
    }

    /// Adds a reference and returns the new count.
    pub(crate) fn get(&self) -> usize {
        self.refcount.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Drops a reference and returns the new count.
    ///
    /// # Panics
    /// Panics if the count is already zero.
    pub(crate) fn put(&self) -> usize {
        let previous = self.refcount.fetch_sub(1, Ordering::AcqRel);
        assert!(previous > 0, "frame reference count underflow");
        previous - 1
    }
}

impl Default for Frame {
    fn default() -> Self {
        Self {
            flags: FrameFlags::new(),
            refcount: AtomicUsize::new(0),
        }
    }
}

pub enum FrameFlag {
    /// Frame is handed out.
    Allocated = 1 << 0,
    /// Frame is pinned and must never return to the free list.
    Pinned = 1 << 1,
}

/// Atomic flags for a physical memory frame.
#[derive(Default)]
pub struct FrameFlags(AtomicU64);

impl FrameFlags {
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn set(&self, flag: FrameFlag) {
        self.0.fetch_or(flag as u64, Ordering::AcqRel);
    }

    pub fn clear(&self, flag: FrameFlag) {
        self.0.fetch_and(!(flag as u64), Ordering::AcqRel);
    }

    pub fn test(&self, flag: FrameFlag) -> bool {
        (self.0.load(Ordering::Acquire) & flag as u64) != 0
    }
}

/// Returns the contents of `frame` through the kernel's direct map.
///
/// # Safety
/// The caller must own the frame (or hold every lock that guards its sharers) for the
/// lifetime of the returned slice, and no other slice over the same frame may exist.
pub unsafe fn frame_bytes<'a>(frame: PhysicalAddress) -> &'a mut [u8] {
    debug_assert!(frame.is_page_aligned(), "frame address must be page-aligned");
    let ptr = VirtualAddress::direct_mapped(frame).as_mut_ptr::<u8>();
    // SAFETY: a frame is PAGE_SIZE bytes of mapped memory; exclusivity is upheld by
    // the caller.
    unsafe { core::slice::from_raw_parts_mut(ptr, arch::PAGE_SIZE) }
}

/// Fills `frame` with zeroes.
///
/// # Safety
/// Same contract as [`frame_bytes`].
pub unsafe fn zero_frame(frame: PhysicalAddress) {
    unsafe { frame_bytes(frame) }.fill(0);
}

/// Copies the whole of `src` into `dst`.
///
/// # Safety
/// Same contract as [`frame_bytes`] for both frames; they must differ.
pub unsafe fn copy_frame(src: PhysicalAddress, dst: PhysicalAddress) {
    assert_ne!(src, dst, "cannot copy a frame onto itself");
    let (src, dst) = unsafe { (frame_bytes(src), frame_bytes(dst)) };
    dst.copy_from_slice(src);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AddressTranslator;

    #[test]
    fn refcount_get_and_put() {
        let frame = Frame::default();
        assert_eq!(frame.get(), 1);
        assert_eq!(frame.get(), 2);
        assert_eq!(frame.put(), 1);
        assert_eq!(frame.refcount(), 1);
    }

    #[test]
    #[should_panic(expected = "frame reference count underflow")]
    fn put_on_unreferenced_frame_panics() {
        Frame::default().put();
    }

    #[test]
    fn flags_set_and_clear() {
        let flags = FrameFlags::new();
        flags.set(FrameFlag::Allocated);
        assert!(flags.test(FrameFlag::Allocated));
        assert!(!flags.test(FrameFlag::Pinned));
        flags.clear(FrameFlag::Allocated);
        assert!(!flags.test(FrameFlag::Allocated));
    }

    #[test]
    fn copy_and_zero_frames() {
        AddressTranslator::set_current(AddressTranslator::emulated(4 * arch::PAGE_SIZE));
        let translator = AddressTranslator::current();
        let a = PhysicalAddress::new(translator.allocate(arch::PAGE_SIZE, arch::PAGE_SIZE).unwrap());
        let b = PhysicalAddress::new(translator.allocate(arch::PAGE_SIZE, arch::PAGE_SIZE).unwrap());

        unsafe {
            frame_bytes(a).fill(0xAB);
            copy_frame(a, b);
            assert!(frame_bytes(b).iter().all(|&byte| byte == 0xAB));
            zero_frame(a);
            assert!(frame_bytes(a).iter().all(|&byte| byte == 0));
            assert!(frame_bytes(b).iter().all(|&byte| byte == 0xAB));
        }
    }
}
