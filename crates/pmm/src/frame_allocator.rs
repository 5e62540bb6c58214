//! Physical frame allocator.
//!
//! Hands out single frames from one contiguous region and tracks, per frame, how many
//! page table entries reference it. Copy-on-write sharing bumps the count instead of
//! copying; a frame goes back on the free list only when the last reference is
//! dropped.

use alloc::{boxed::Box, vec::Vec};

use crate::{Frame, FrameFlag, FrameNumber, PhysicalAddress, arch, frame};

/// Errors that can occur during frame allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// No free frame is left.
    OutOfMemory,
    /// The address is not an allocated frame owned by this allocator.
    InvalidDeallocation,
}

/// Order-0 frame allocator with per-frame reference counts.
///
/// The free list is a LIFO stack sized for every frame up front, so freeing never
/// allocates.
pub struct FrameAllocator {
    first: FrameNumber,
    frames: Box<[Frame]>,
    free: Vec<FrameNumber>,
}

impl FrameAllocator {
    /// Creates an allocator owning every whole frame inside `[base, base + size)`.
    pub fn new(base: PhysicalAddress, size: usize) -> Self {
        let start = base.align_up(arch::PAGE_SIZE).as_usize();
        let end = (base.as_usize() + size) & !(arch::PAGE_SIZE - 1);
        let count = end.saturating_sub(start) / arch::PAGE_SIZE;
        let first = FrameNumber::new(start / arch::PAGE_SIZE);

        let frames = (0..count).map(|_| Frame::default()).collect();
        // Reversed so the lowest frame is handed out first.
        let free = first.range(count).rev().collect();

        log::debug!(
            "frame allocator: {} frames starting at {:#x}",
            count,
            start
        );

        Self {
            first,
            frames,
            free,
        }
    }

    /// Allocates one frame with a reference count of one. Contents are unspecified.
    pub fn allocate(&mut self) -> Result<PhysicalAddress, AllocError> {
        let number = self.free.pop().ok_or(AllocError::OutOfMemory)?;
        let frame = &self.frames[number - self.first];
        frame.flags.set(FrameFlag::Allocated);
        frame.set_refcount(1);
        Ok(number.start())
    }

    /// Allocates one frame and fills it with zeroes.
    pub fn allocate_zeroed(&mut self) -> Result<PhysicalAddress, AllocError> {
        let address = self.allocate()?;
        // SAFETY: the frame was just taken off the free list; nothing else maps it.
        unsafe { frame::zero_frame(address) };
        Ok(address)
    }

    /// Adds a reference to an allocated frame and returns the new count.
    pub fn retain(&self, address: PhysicalAddress) -> Result<usize, AllocError> {
        let frame = self.allocated(address)?;
        Ok(frame.get())
    }

    /// Drops a reference. Returns `true` if this freed the frame.
    ///
    /// Pinned frames keep their storage even when the count reaches zero.
    pub fn release(&mut self, address: PhysicalAddress) -> Result<bool, AllocError> {
        let frame = self.allocated(address)?;
        if frame.put() > 0 || frame.flags.test(FrameFlag::Pinned) {
            return Ok(false);
        }
        frame.flags.clear(FrameFlag::Allocated);
        self.free.push(address.frame_number());
        Ok(true)
    }

    /// Marks an allocated frame as never freeable.
    pub fn pin(&self, address: PhysicalAddress) -> Result<(), AllocError> {
        self.allocated(address)?.flags.set(FrameFlag::Pinned);
        Ok(())
    }

    /// Returns the reference count of `address`, or zero if it is free or foreign.
    pub fn refcount(&self, address: PhysicalAddress) -> usize {
        self.frame(address).map_or(0, Frame::refcount)
    }

    /// Returns the metadata for `address` if this allocator owns it.
    pub fn frame(&self, address: PhysicalAddress) -> Option<&Frame> {
        let number = address.frame_number();
        if number < self.first {
            return None;
        }
        self.frames.get(number - self.first)
    }

    pub fn contains(&self, address: PhysicalAddress) -> bool {
        self.frame(address).is_some()
    }

    pub fn total_frames(&self) -> usize {
        self.frames.len()
    }

    pub fn free_frames(&self) -> usize {
        self.free.len()
    }

    pub fn allocated_frames(&self) -> usize {
        self.total_frames() - self.free_frames()
    }

    fn allocated(&self, address: PhysicalAddress) -> Result<&Frame, AllocError> {
        if !address.is_page_aligned() {
            return Err(AllocError::InvalidDeallocation);
        }
        self.frame(address)
            .filter(|frame| frame.flags.test(FrameFlag::Allocated))
            .ok_or(AllocError::InvalidDeallocation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AddressTranslator;

    fn setup(frames: usize) -> FrameAllocator {
        AddressTranslator::set_current(AddressTranslator::emulated(frames * arch::PAGE_SIZE));
        let base = AddressTranslator::current()
            .allocate(frames * arch::PAGE_SIZE, arch::PAGE_SIZE)
            .unwrap();
        FrameAllocator::new(PhysicalAddress::new(base), frames * arch::PAGE_SIZE)
    }

    #[test]
    fn hands_out_lowest_frame_first() {
        let mut allocator = setup(4);
        assert_eq!(allocator.total_frames(), 4);
        assert_eq!(allocator.allocate(), Ok(PhysicalAddress::new(0)));
        assert_eq!(allocator.allocate(), Ok(PhysicalAddress::new(arch::PAGE_SIZE)));
        assert_eq!(allocator.free_frames(), 2);
    }

    #[test]
    fn exhaustion_reports_out_of_memory() {
        let mut allocator = setup(2);
        allocator.allocate().unwrap();
        allocator.allocate().unwrap();
        assert_eq!(allocator.allocate(), Err(AllocError::OutOfMemory));
    }

    #[test]
    fn shared_frame_is_freed_by_last_release() {
        let mut allocator = setup(2);
        let frame = allocator.allocate().unwrap();
        assert_eq!(allocator.retain(frame), Ok(2));

        assert_eq!(allocator.release(frame), Ok(false));
        assert_eq!(allocator.refcount(frame), 1);
        assert_eq!(allocator.free_frames(), 1);

        assert_eq!(allocator.release(frame), Ok(true));
        assert_eq!(allocator.free_frames(), 2);
        assert_eq!(allocator.refcount(frame), 0);
    }

    #[test]
    fn releasing_a_free_frame_is_rejected() {
        let mut allocator = setup(2);
        let frame = allocator.allocate().unwrap();
        allocator.release(frame).unwrap();
        assert_eq!(allocator.release(frame), Err(AllocError::InvalidDeallocation));
        assert_eq!(
            allocator.release(PhysicalAddress::new(0x4000)),
            Err(AllocError::InvalidDeallocation)
        );
    }

    #[test]
    fn pinned_frame_survives_last_release() {
        let mut allocator = setup(2);
        let frame = allocator.allocate().unwrap();
        allocator.pin(frame).unwrap();
        assert_eq!(allocator.release(frame), Ok(false));
        assert_eq!(allocator.allocated_frames(), 1);
    }

    #[test]
    fn allocate_zeroed_clears_previous_contents() {
        let mut allocator = setup(1);
        let frame = allocator.allocate().unwrap();
        unsafe { frame::frame_bytes(frame).fill(0x5A) };
        allocator.release(frame).unwrap();

        let again = allocator.allocate_zeroed().unwrap();
        assert_eq!(again, frame);
        assert!(unsafe { frame::frame_bytes(again) }.iter().all(|&b| b == 0));
    }
}
