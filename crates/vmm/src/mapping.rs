//! Mapping records.

use alloc::sync::Arc;
use core::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

use bitflags::bitflags;
use pmm::{PAGE_SIZE, PageFlags};

use crate::{fault::Access, vfs::FileHandle};

bitflags! {
    /// Access permitted to a mapping. The empty set is `PROT_NONE`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Protection: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
    }
}

impl Protection {
    /// Returns true if an access of kind `access` is allowed.
    pub fn permits(self, access: Access) -> bool {
        match access {
            Access::Read => self.contains(Protection::READ),
            Access::Write => self.contains(Protection::WRITE),
            Access::Execute => self.contains(Protection::EXEC),
        }
    }
}

/// Whether writes stay private to one address space or reach the backing object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sharing {
    /// Copy-on-write: writes are never seen by other spaces or the backing object.
    Private,
    /// Writes are visible to every space sharing the frames and are written back.
    Shared,
}

/// Identifies one incarnation of a mapping.
///
/// Splitting or duplicating a mapping produces a fresh id, so a fault that dropped
/// the space lock can tell whether the mapping it started with is still in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MappingId(u64);

impl MappingId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// One contiguous virtual region of an address space.
///
/// `base`, `len` and `offset` are byte values and always page-aligned once the
/// mapping sits in a [`Registry`](crate::Registry).
#[derive(Clone)]
pub struct Mapping {
    id: MappingId,
    base: usize,
    len: usize,
    offset: usize,
    prot: Protection,
    sharing: Sharing,
    backing: Option<Arc<FileHandle>>,
}

impl Mapping {
    pub fn new(
        base: usize,
        len: usize,
        offset: usize,
        prot: Protection,
        sharing: Sharing,
        backing: Option<Arc<FileHandle>>,
    ) -> Self {
        Self {
            id: MappingId::next(),
            base,
            len,
            offset,
            prot,
            sharing,
            backing,
        }
    }

    pub fn id(&self) -> MappingId {
        self.id
    }

    pub fn base(&self) -> usize {
        self.base
    }

    /// Exclusive end address.
    pub fn end(&self) -> usize {
        self.base + self.len
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn page_count(&self) -> usize {
        self.len / PAGE_SIZE
    }

    /// Offset of `base` inside the backing object.
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn prot(&self) -> Protection {
        self.prot
    }

    pub fn sharing(&self) -> Sharing {
        self.sharing
    }

    pub fn is_shared(&self) -> bool {
        self.sharing == Sharing::Shared
    }

    pub fn is_anonymous(&self) -> bool {
        self.backing.is_none()
    }

    pub fn backing(&self) -> Option<&Arc<FileHandle>> {
        self.backing.as_ref()
    }

    /// Returns true if this mapping is backed by `handle`.
    pub fn is_backed_by(&self, handle: &FileHandle) -> bool {
        self.backing
            .as_ref()
            .is_some_and(|backing| core::ptr::eq(Arc::as_ptr(backing), handle))
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.end()
    }

    /// Returns true if `[start, end)` intersects this mapping.
    pub fn overlaps(&self, start: usize, end: usize) -> bool {
        start < self.end() && self.base < end
    }

    /// Offset inside the backing object of the page containing `addr`.
    pub fn file_offset(&self, addr: usize) -> usize {
        debug_assert!(self.contains(addr));
        self.offset + (addr & !(PAGE_SIZE - 1)) - self.base
    }

    /// Leaf entry flags for a page of this mapping once it owns a private or shared
    /// frame. Pages bound to the zero frame or shared copy-on-write drop `WRITABLE`.
    pub fn page_flags(&self) -> PageFlags {
        let mut flags = PageFlags::empty();
        flags.set_user(true);
        flags.set_writable(self.prot.contains(Protection::WRITE));
        flags.set_no_execute(!self.prot.contains(Protection::EXEC));
        flags
    }

    /// Same as [`Mapping::page_flags`] with writes disabled.
    pub fn read_only_flags(&self) -> PageFlags {
        let mut flags = self.page_flags();
        flags.set_writable(false);
        flags
    }

    /// Returns a copy under a fresh id, for another address space.
    pub(crate) fn duplicate(&self) -> Self {
        Self {
            id: MappingId::next(),
            ..self.clone()
        }
    }

    /// Returns the part of this mapping inside `[start, end)`, which must lie within
    /// it. The piece keeps this id only if it starts at `base`.
    pub(crate) fn slice(&self, start: usize, end: usize) -> Self {
        debug_assert!(start >= self.base && end <= self.end() && start < end);
        Self {
            id: if start == self.base {
                self.id
            } else {
                MappingId::next()
            },
            base: start,
            len: end - start,
            offset: self.offset + (start - self.base),
            ..self.clone()
        }
    }

    /// Returns this mapping with its length changed in place.
    pub(crate) fn resized(&self, len: usize) -> Self {
        Self {
            len,
            ..self.clone()
        }
    }
}

impl fmt::Debug for Mapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mapping")
            .field("id", &self.id)
            .field("range", &format_args!("{:#x}..{:#x}", self.base, self.end()))
            .field("offset", &format_args!("{:#x}", self.offset))
            .field("prot", &self.prot)
            .field("sharing", &self.sharing)
            .field("backing", &self.backing.as_ref().map(|handle| handle.id()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn anonymous(base: usize, pages: usize) -> Mapping {
        Mapping::new(
            base,
            pages * PAGE_SIZE,
            0,
            Protection::READ | Protection::WRITE,
            Sharing::Private,
            None,
        )
    }

    #[test]
    fn range_queries() {
        let mapping = anonymous(0x2000, 4);
        assert_eq!(mapping.end(), 0x2000 + 4 * PAGE_SIZE);
        assert!(mapping.contains(0x2000));
        assert!(!mapping.contains(mapping.end()));
        assert!(mapping.overlaps(0x1000, 0x2001));
        assert!(!mapping.overlaps(0x1000, 0x2000));
    }

    #[test]
    fn protection_checks_each_access_kind() {
        let prot = Protection::READ | Protection::EXEC;
        assert!(prot.permits(Access::Read));
        assert!(prot.permits(Access::Execute));
        assert!(!prot.permits(Access::Write));
        assert!(!Protection::empty().permits(Access::Read));
    }

    #[test]
    fn slice_keeps_file_offsets_consistent() {
        let mapping = Mapping::new(
            0x2000,
            8 * PAGE_SIZE,
            4 * PAGE_SIZE,
            Protection::READ,
            Sharing::Shared,
            None,
        );
        let head = mapping.slice(0x2000, 0x2000 + 2 * PAGE_SIZE);
        let tail = mapping.slice(0x2000 + 5 * PAGE_SIZE, mapping.end());

        assert_eq!(head.id(), mapping.id());
        assert_eq!(head.offset(), 4 * PAGE_SIZE);
        assert_ne!(tail.id(), mapping.id());
        assert_eq!(tail.offset(), 9 * PAGE_SIZE);
        assert_eq!(tail.page_count(), 3);
    }

    #[test]
    fn file_offset_rounds_to_page() {
        let mapping = Mapping::new(
            0x3000,
            4 * PAGE_SIZE,
            2 * PAGE_SIZE,
            Protection::READ,
            Sharing::Private,
            None,
        );
        assert_eq!(mapping.file_offset(0x3000 + PAGE_SIZE + 3), 3 * PAGE_SIZE);
    }

    #[test]
    fn page_flags_follow_protection() {
        let flags = anonymous(0x2000, 1).page_flags();
        assert!(flags.is_user());
        assert!(flags.is_writable());
        assert!(flags.is_no_execute());
        assert!(!anonymous(0x2000, 1).read_only_flags().is_writable());
    }

    #[test]
    fn duplicate_gets_fresh_id() {
        let mapping = anonymous(0x2000, 1);
        let copy = mapping.duplicate();
        assert_ne!(copy.id(), mapping.id());
        assert_eq!(copy.base(), mapping.base());
    }
}
