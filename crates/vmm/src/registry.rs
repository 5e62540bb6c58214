//! Per-space collection of mappings, ordered by base address.

use alloc::{collections::BTreeMap, vec::Vec};

use pmm::PAGE_SIZE;

use crate::{error::VmError, mapping::Mapping, vfs::FileHandle};

/// The source of truth for what is mapped where in one address space.
///
/// Mappings are keyed by base address, so the candidate for any address is the
/// last mapping starting at or below it. No two ranges overlap.
#[derive(Default)]
pub struct Registry {
    mappings: BTreeMap<usize, Mapping>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `mapping` after checking alignment and disjointness.
    pub fn insert(&mut self, mapping: Mapping) -> Result<(), VmError> {
        let aligned = |value: usize| value % PAGE_SIZE == 0;
        if mapping.len() == 0
            || !aligned(mapping.base())
            || !aligned(mapping.len())
            || !aligned(mapping.offset())
        {
            return Err(VmError::InvalidAlignment);
        }
        if mapping.base().checked_add(mapping.len()).is_none() {
            return Err(VmError::InvalidArgument);
        }
        if !self.is_free(mapping.base(), mapping.end()) {
            return Err(VmError::Overlap);
        }

        self.mappings.insert(mapping.base(), mapping);
        Ok(())
    }

    /// Returns the mapping whose range contains `addr`.
    pub fn lookup(&self, addr: usize) -> Option<&Mapping> {
        self.mappings
            .range(..=addr)
            .next_back()
            .map(|(_, mapping)| mapping)
            .filter(|mapping| mapping.contains(addr))
    }

    /// Removes the mapping starting exactly at `base`. Page tables are untouched.
    pub fn remove(&mut self, base: usize) -> Option<Mapping> {
        self.mappings.remove(&base)
    }

    /// Removes and returns every mapping backed by `handle`.
    pub fn remove_all_for_handle(&mut self, handle: &FileHandle) -> Vec<Mapping> {
        let bases: Vec<usize> = self
            .mappings
            .values()
            .filter(|mapping| mapping.is_backed_by(handle))
            .map(Mapping::base)
            .collect();
        bases
            .into_iter()
            .filter_map(|base| self.mappings.remove(&base))
            .collect()
    }

    /// Removes and returns every mapping.
    pub fn drain(&mut self) -> Vec<Mapping> {
        core::mem::take(&mut self.mappings).into_values().collect()
    }

    /// Returns true if nothing is mapped in `[start, end)`.
    pub fn is_free(&self, start: usize, end: usize) -> bool {
        // Only the last mapping starting before `end` can reach back past `start`.
        self.mappings
            .range(..end)
            .next_back()
            .is_none_or(|(_, mapping)| mapping.end() <= start)
    }

    /// Base addresses of every mapping intersecting `[start, end)`, in order.
    pub fn overlapping(&self, start: usize, end: usize) -> Vec<usize> {
        if start >= end {
            return Vec::new();
        }
        let first = self.lookup(start).map_or(start, Mapping::base);
        self.mappings
            .range(first..end)
            .map(|(&base, _)| base)
            .collect()
    }

    /// Finds the lowest page-aligned range of `len` bytes inside `[low, high)` that
    /// no mapping touches.
    pub fn find_gap(&self, len: usize, low: usize, high: usize) -> Option<usize> {
        let mut candidate = low;
        for mapping in self.mappings.values() {
            if mapping.end() <= candidate {
                continue;
            }
            if mapping.base() >= candidate.checked_add(len)? {
                break;
            }
            candidate = mapping.end();
        }
        (candidate.checked_add(len)? <= high).then_some(candidate)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Mapping> {
        self.mappings.values()
    }

    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::{Protection, Sharing};

    fn mapping(base: usize, pages: usize) -> Mapping {
        Mapping::new(
            base,
            pages * PAGE_SIZE,
            0,
            Protection::READ,
            Sharing::Private,
            None,
        )
    }

    fn assert_disjoint(registry: &Registry) {
        let mappings: Vec<_> = registry.iter().collect();
        for pair in mappings.windows(2) {
            assert!(pair[0].end() <= pair[1].base(), "{:?} overlaps {:?}", pair[0], pair[1]);
        }
    }

    #[test]
    fn lookup_finds_containing_mapping() {
        let mut registry = Registry::new();
        registry.insert(mapping(0x2000, 4)).unwrap();
        registry.insert(mapping(0x3000, 1)).unwrap();

        assert_eq!(registry.lookup(0x2000 + 3 * PAGE_SIZE + 1).map(Mapping::base), Some(0x2000));
        assert_eq!(registry.lookup(0x3000).map(Mapping::base), Some(0x3000));
        assert!(registry.lookup(0x2000 + 4 * PAGE_SIZE).is_none());
        assert!(registry.lookup(0x1000).is_none());
    }

    #[test]
    fn overlap_is_rejected_and_registry_unchanged() {
        let mut registry = Registry::new();
        registry.insert(mapping(0x2000, 4)).unwrap();

        for candidate in [
            mapping(0x2000 - PAGE_SIZE, 2),
            mapping(0x2000 + PAGE_SIZE, 1),
            mapping(0x2000 + 3 * PAGE_SIZE, 4),
            mapping(0x1000, 0x101),
        ] {
            assert_eq!(registry.insert(candidate), Err(VmError::Overlap));
        }
        assert_eq!(registry.len(), 1);

        // Touching ranges are fine.
        registry.insert(mapping(0x2000 + 4 * PAGE_SIZE, 1)).unwrap();
        registry.insert(mapping(0x2000 - PAGE_SIZE, 1)).unwrap();
        assert_disjoint(&registry);
    }

    #[test]
    fn misaligned_or_empty_mappings_are_rejected() {
        let mut registry = Registry::new();
        assert_eq!(registry.insert(mapping(0x2001, 1)), Err(VmError::InvalidAlignment));
        assert_eq!(registry.insert(mapping(0x2000, 0)), Err(VmError::InvalidAlignment));
        let odd_offset = Mapping::new(0x2000, PAGE_SIZE, 3, Protection::READ, Sharing::Private, None);
        assert_eq!(registry.insert(odd_offset), Err(VmError::InvalidAlignment));
        assert!(registry.is_empty());
    }

    #[test]
    fn find_gap_is_first_fit() {
        let mut registry = Registry::new();
        registry.insert(mapping(0x1000, 2)).unwrap();
        registry.insert(mapping(0x1000 + 3 * PAGE_SIZE, 2)).unwrap();

        assert_eq!(
            registry.find_gap(PAGE_SIZE, 0x1000, 0x8000),
            Some(0x1000 + 2 * PAGE_SIZE)
        );
        assert_eq!(
            registry.find_gap(2 * PAGE_SIZE, 0x1000, 0x8000),
            Some(0x1000 + 5 * PAGE_SIZE)
        );
        assert_eq!(registry.find_gap(0x8000, 0x1000, 0x8000), None);
    }

    #[test]
    fn overlapping_lists_partial_hits() {
        let mut registry = Registry::new();
        registry.insert(mapping(0x2000, 4)).unwrap();
        registry.insert(mapping(0x3000, 4)).unwrap();
        registry.insert(mapping(0x4000, 4)).unwrap();

        assert_eq!(registry.overlapping(0x2000 + PAGE_SIZE, 0x3001), [0x2000, 0x3000]);
        assert!(registry.overlapping(0x2000 + 4 * PAGE_SIZE, 0x3000).is_empty());
    }

    #[test]
    fn remove_takes_only_that_mapping() {
        let mut registry = Registry::new();
        registry.insert(mapping(0x2000, 1)).unwrap();
        registry.insert(mapping(0x3000, 1)).unwrap();

        assert_eq!(registry.remove(0x2000).map(|m| m.base()), Some(0x2000));
        assert!(registry.remove(0x2000).is_none());
        assert_eq!(registry.len(), 1);
    }
}
