//! The zero-page provider: one pinned all-zero frame shared by every space.

use pmm::{AllocError, FrameAllocator, PhysicalAddress};

/// The shared, read-only, all-zero frame behind untouched anonymous pages.
///
/// Allocated once and pinned. Page-table entries pointing at it do not count as
/// references, so it is never released through the allocator.
pub struct ZeroPage {
    frame: PhysicalAddress,
}

impl ZeroPage {
    pub fn new(frames: &mut FrameAllocator) -> Result<Self, AllocError> {
        let frame = frames.allocate_zeroed()?;
        frames.pin(frame)?;
        log::debug!("zero page at {}", frame);
        Ok(Self { frame })
    }

    pub fn frame(&self) -> PhysicalAddress {
        self.frame
    }

    pub fn is_zero_frame(&self, frame: PhysicalAddress) -> bool {
        frame == self.frame
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pmm::{AddressTranslator, PAGE_SIZE, frame_bytes};

    #[test]
    fn zero_page_is_zeroed_and_pinned() {
        AddressTranslator::set_current(AddressTranslator::emulated(4 * PAGE_SIZE));
        let base = AddressTranslator::current()
            .allocate(4 * PAGE_SIZE, PAGE_SIZE)
            .unwrap();
        let mut frames = FrameAllocator::new(PhysicalAddress::new(base), 4 * PAGE_SIZE);

        let zero = ZeroPage::new(&mut frames).unwrap();
        assert!(unsafe { frame_bytes(zero.frame()) }.iter().all(|&b| b == 0));
        assert!(zero.is_zero_frame(zero.frame()));

        assert_eq!(frames.release(zero.frame()), Ok(false));
        assert_eq!(frames.allocated_frames(), 1);
    }
}
