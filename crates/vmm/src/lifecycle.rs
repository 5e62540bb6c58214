//! Mapping lifecycle: creation, removal, partial unmapping, handle teardown, fork,
//! write-back and anonymous resizing.
//!
//! Pages are released while the space lock is held, but dirty pages of shared file
//! mappings are collected and written back only after it is dropped.

use alloc::{sync::Arc, vec::Vec};

use pmm::{PAGE_SIZE, PhysicalAddress, USER_SPACE_END, USER_SPACE_START, VirtualAddress};

use crate::{
    binder::Binder,
    error::{VmError, invariant_violation},
    kernel::KernelMemory,
    mapping::{Mapping, MappingId, Protection, Sharing},
    registry::Registry,
    space::{AddressSpace, SpaceState},
    vfs::{FileHandle, read_page, write_back_page},
};

/// Parameters for [`AddressSpace::create_mapping`].
#[derive(Debug, Clone)]
pub struct MappingRequest {
    backing: Option<Arc<FileHandle>>,
    hint: Option<usize>,
    fixed: bool,
    len: usize,
    offset: usize,
    prot: Protection,
    sharing: Sharing,
    populate: bool,
}

impl MappingRequest {
    /// A private anonymous mapping of `len` bytes.
    pub fn anonymous(len: usize, prot: Protection) -> Self {
        Self {
            backing: None,
            hint: None,
            fixed: false,
            len,
            offset: 0,
            prot,
            sharing: Sharing::Private,
            populate: false,
        }
    }

    /// A private mapping of `len` bytes of `handle`, starting at `offset`.
    pub fn file(handle: Arc<FileHandle>, offset: usize, len: usize, prot: Protection) -> Self {
        Self {
            backing: Some(handle),
            offset,
            ..Self::anonymous(len, prot)
        }
    }

    pub fn shared(self) -> Self {
        Self {
            sharing: Sharing::Shared,
            ..self
        }
    }

    /// Prefers `addr` if that range is free.
    pub fn at(self, addr: usize) -> Self {
        Self {
            hint: Some(addr),
            fixed: false,
            ..self
        }
    }

    /// Requires exactly `addr`; an existing mapping there is an overlap.
    pub fn fixed(self, addr: usize) -> Self {
        Self {
            hint: Some(addr),
            fixed: true,
            ..self
        }
    }

    /// Backs an anonymous mapping with frames immediately.
    pub fn populate(self) -> Self {
        Self {
            populate: true,
            ..self
        }
    }
}

/// A dirty shared page removed from a page table, still holding its reference.
pub(crate) struct PendingWriteBack {
    handle: Arc<FileHandle>,
    offset: usize,
    frame: PhysicalAddress,
}

fn page_addresses(start: usize, end: usize) -> impl Iterator<Item = usize> {
    (start..end).step_by(PAGE_SIZE)
}

fn reinsert(registry: &mut Registry, mapping: Mapping) {
    if let Err(error) = registry.insert(mapping) {
        invariant_violation(format_args!("re-inserting a mapping failed: {}", error));
    }
}

/// Unmaps `[start, end)` of `mapping`. Dirty pages of shared file mappings are kept
/// for write-back; everything else is released now.
fn unmap_pages(
    binder: &mut Binder<'_>,
    mapping: &Mapping,
    start: usize,
    end: usize,
    pending: &mut Vec<PendingWriteBack>,
) {
    let memory = binder.memory();
    for page in page_addresses(start, end) {
        let Some((frame, flags)) = binder.take_page(page) else {
            continue;
        };
        match mapping.backing() {
            Some(handle)
                if mapping.is_shared()
                    && flags.is_dirty()
                    && !memory.zero_page().is_zero_frame(frame) =>
            {
                pending.push(PendingWriteBack {
                    handle: Arc::clone(handle),
                    offset: mapping.file_offset(page),
                    frame,
                });
            }
            _ => memory.release_frame(frame),
        }
    }
}

/// Removes every mapping of `state` and unmaps its pages.
pub(crate) fn teardown_all(state: &mut SpaceState, memory: &KernelMemory) -> Vec<PendingWriteBack> {
    let mappings = state.registry.drain();
    let mut binder = state.binder(memory);
    let mut pending = Vec::new();
    for mapping in &mappings {
        unmap_pages(&mut binder, mapping, mapping.base(), mapping.end(), &mut pending);
    }
    pending
}

/// Writes back and releases collected pages. Every frame is released even if a
/// write fails; the first failure is returned.
pub(crate) fn finish_teardown(
    pending: Vec<PendingWriteBack>,
    memory: &KernelMemory,
) -> Result<(), VmError> {
    let mut result = Ok(());
    for page in pending {
        let outcome = write_back_page(&page.handle, page.offset, page.frame);
        memory.release_frame(page.frame);
        if result.is_ok() {
            result = outcome;
        }
    }
    result
}

impl AddressSpace {
    /// Creates a mapping and returns its base address. Pages are populated lazily,
    /// except for anonymous requests marked [`MappingRequest::populate`] and, with
    /// the `mmap-no-cow` feature, every private anonymous request.
    pub fn create_mapping(self: &Arc<Self>, request: MappingRequest) -> Result<usize, VmError> {
        let MappingRequest {
            backing,
            hint,
            fixed,
            len,
            offset,
            prot,
            sharing,
            populate,
        } = request;

        if len == 0 {
            return Err(VmError::InvalidArgument);
        }
        if len % PAGE_SIZE != 0 || offset % PAGE_SIZE != 0 {
            return Err(VmError::InvalidAlignment);
        }
        let fits = |base: usize| {
            base >= USER_SPACE_START && base.checked_add(len).is_some_and(|end| end <= USER_SPACE_END)
        };

        let mut state = self.lock();
        let base = match hint {
            Some(addr) if fixed => {
                if addr % PAGE_SIZE != 0 {
                    return Err(VmError::InvalidAlignment);
                }
                if !fits(addr) {
                    return Err(VmError::InvalidArgument);
                }
                addr
            }
            _ => hint
                .filter(|&addr| {
                    addr % PAGE_SIZE == 0 && fits(addr) && state.registry.is_free(addr, addr + len)
                })
                .or_else(|| state.registry.find_gap(len, USER_SPACE_START, USER_SPACE_END))
                .ok_or(VmError::OutOfVirtualSpace)?,
        };

        if backing.as_ref().is_some_and(|handle| handle.is_closed()) {
            return Err(VmError::InvalidArgument);
        }

        let mapping = Mapping::new(base, len, offset, prot, sharing, backing.clone());
        let eager = mapping.is_anonymous()
            && !prot.is_empty()
            && (populate || (cfg!(feature = "mmap-no-cow") && !mapping.is_shared()));
        let flags = mapping.page_flags();
        log::debug!("address space {}: map {:?}", self.id(), mapping);
        state.registry.insert(mapping)?;

        // Only a mapping that exists gets a back-reference from its handle.
        if let Some(handle) = &backing {
            if !handle.register(self) {
                state.registry.remove(base);
                return Err(VmError::InvalidArgument);
            }
        }

        if eager {
            let state = &mut *state;
            let populated = state
                .binder(self.memory())
                .alloc_eager_range(base, len / PAGE_SIZE, flags);
            if let Err(error) = populated {
                state.registry.remove(base);
                return Err(error);
            }
        }

        Ok(base)
    }

    /// Removes the whole mapping starting at `base`, writing back its dirty shared
    /// pages. Pages never faulted in are skipped.
    pub fn remove_mapping(&self, base: usize) -> Result<(), VmError> {
        let pending = {
            let mut guard = self.lock();
            let state = &mut *guard;
            let mapping = state.registry.remove(base).ok_or(VmError::InvalidArgument)?;
            log::debug!("address space {}: unmap {:?}", self.id(), mapping);

            let mut pending = Vec::new();
            unmap_pages(
                &mut state.binder(self.memory()),
                &mapping,
                mapping.base(),
                mapping.end(),
                &mut pending,
            );
            pending
        };
        finish_teardown(pending, self.memory())
    }

    /// Unmaps `[addr, addr + len)`. Mappings straddling either end are split and
    /// keep their pages outside the range; a range with nothing mapped succeeds.
    pub fn unmap_range(&self, addr: usize, len: usize) -> Result<(), VmError> {
        if len == 0 {
            return Err(VmError::InvalidArgument);
        }
        if addr % PAGE_SIZE != 0 || len % PAGE_SIZE != 0 {
            return Err(VmError::InvalidAlignment);
        }
        let end = addr.checked_add(len).ok_or(VmError::InvalidArgument)?;

        let pending = {
            let mut guard = self.lock();
            let state = &mut *guard;
            let mut pending = Vec::new();

            for base in state.registry.overlapping(addr, end) {
                let Some(mapping) = state.registry.remove(base) else {
                    invariant_violation(format_args!("mapping at {:#x} vanished", base));
                };
                let cut_start = addr.max(mapping.base());
                let cut_end = end.min(mapping.end());

                if mapping.base() < cut_start {
                    reinsert(&mut state.registry, mapping.slice(mapping.base(), cut_start));
                }
                if cut_end < mapping.end() {
                    reinsert(&mut state.registry, mapping.slice(cut_end, mapping.end()));
                }

                log::debug!(
                    "address space {}: unmap {:#x}..{:#x} of {:?}",
                    self.id(),
                    cut_start,
                    cut_end,
                    mapping
                );
                unmap_pages(
                    &mut state.binder(self.memory()),
                    &mapping,
                    cut_start,
                    cut_end,
                    &mut pending,
                );
            }
            pending
        };
        finish_teardown(pending, self.memory())
    }

    /// Removes every mapping backed by `handle`.
    pub fn teardown_handle(&self, handle: &FileHandle) -> Result<(), VmError> {
        let pending = {
            let mut guard = self.lock();
            let state = &mut *guard;
            let mappings = state.registry.remove_all_for_handle(handle);
            log::debug!(
                "address space {}: tearing down {} mappings of file handle {}",
                self.id(),
                mappings.len(),
                handle.id()
            );

            let mut binder = state.binder(self.memory());
            let mut pending = Vec::new();
            for mapping in &mappings {
                unmap_pages(&mut binder, mapping, mapping.base(), mapping.end(), &mut pending);
            }
            pending
        };
        finish_teardown(pending, self.memory())
    }

    /// Process exit: removes every mapping. The space stays usable but empty.
    pub fn destroy(&self) -> Result<(), VmError> {
        let pending = teardown_all(&mut self.lock(), self.memory());
        log::debug!("address space {} destroyed", self.id());
        finish_teardown(pending, self.memory())
    }

    /// Duplicates this space for a forked child.
    ///
    /// Resolved pages of private mappings become copy-on-write: both spaces map the
    /// frame read-only and whoever writes first takes a copy. With the `fork-no-cow`
    /// feature the child gets its own copy of each such page right away instead.
    /// Zero-frame bindings are copied as they are.
    ///
    /// Every page of a shared mapping is backed before it is shared, so both spaces
    /// keep seeing one frame per page. Pages of a shared file mapping that cannot be
    /// read stay unmapped in both.
    pub fn fork(&self) -> Result<Arc<AddressSpace>, VmError> {
        loop {
            let unreadable = self.back_shared_file_pages()?;
            if let Some(child) = self.duplicate(&unreadable)? {
                log::debug!("address space {} forked into {}", self.id(), child.id());
                return Ok(child);
            }
            detail!("fork of space {} raced with a new shared mapping, retrying", self.id());
        }
    }

    /// Reads every absent page of the shared file mappings into a frame, with the
    /// lock dropped during the reads. Returns the pages whose read failed.
    fn back_shared_file_pages(&self) -> Result<Vec<(MappingId, usize)>, VmError> {
        let work: Vec<_> = {
            let mut guard = self.lock();
            let state = &mut *guard;
            let mut work = Vec::new();
            for mapping in state.registry.iter().filter(|m| m.is_shared()) {
                let Some(handle) = mapping.backing().filter(|_| !mapping.prot().is_empty()) else {
                    continue;
                };
                for page in page_addresses(mapping.base(), mapping.end()) {
                    if state.directory.translate(VirtualAddress::new(page)).is_none() {
                        let offset = mapping.file_offset(page);
                        work.push((mapping.id(), Arc::clone(handle), page, offset));
                    }
                }
            }
            work
        };

        let mut unreadable = Vec::new();
        for (id, handle, page, offset) in work {
            let frame = match read_page(&handle, offset, self.memory()) {
                Ok(frame) => frame,
                Err(VmError::IoFault) => {
                    unreadable.push((id, page));
                    continue;
                }
                Err(error) => return Err(error),
            };

            let mut guard = self.lock();
            let state = &mut *guard;
            let flags = state
                .registry
                .lookup(page)
                .filter(|current| current.id() == id)
                .map(Mapping::page_flags);
            let mut binder = state.binder(self.memory());
            match flags {
                Some(flags) if binder.translate(page).is_none() => {
                    binder.map_page(page, frame, flags);
                }
                _ => self.memory().release_frame(frame),
            }
        }
        Ok(unreadable)
    }

    /// Builds the child under both locks. Returns `None` if a shared file page
    /// outside `unreadable` is still absent, which means the registry changed since
    /// those pages were backed.
    fn duplicate(
        &self,
        unreadable: &[(MappingId, usize)],
    ) -> Result<Option<Arc<AddressSpace>>, VmError> {
        let memory = self.memory();
        let zero = memory.zero_page();
        let child = AddressSpace::new_user(memory);
        let mut parent_guard = self.lock();
        let parent = &mut *parent_guard;
        let mut child_guard = child.lock();
        let child_state = &mut *child_guard;

        for mapping in parent.registry.iter() {
            if let Some(handle) = mapping.backing() {
                if !handle.register(&child) {
                    log::warn!(
                        "fork of space {} skips {:?}: file handle closed",
                        self.id(),
                        mapping
                    );
                    continue;
                }
            }
            // Inserted first so that dropping the child on error releases its pages.
            reinsert(&mut child_state.registry, mapping.duplicate());

            for page in page_addresses(mapping.base(), mapping.end()) {
                let virt = VirtualAddress::new(page);
                let (frame, flags) = match parent.directory.translate(virt) {
                    Some(entry) => entry,
                    None if !mapping.is_shared() || mapping.prot().is_empty() => continue,
                    None if mapping.is_anonymous() => {
                        let frame = memory.allocate_zeroed_frame()?;
                        parent.directory.map(virt, frame, mapping.page_flags());
                        (frame, mapping.page_flags())
                    }
                    None if unreadable.contains(&(mapping.id(), page)) => continue,
                    None => return Ok(None),
                };

                let mut child_frame = frame;
                let mut child_flags = flags;
                if !zero.is_zero_frame(frame) {
                    if mapping.is_shared() {
                        memory.retain_frame(frame);
                    } else if cfg!(feature = "fork-no-cow") {
                        child_frame = memory.allocate_copy(frame)?;
                    } else {
                        memory.retain_frame(frame);
                        if flags.is_writable() {
                            parent.directory.update_flags(virt, |f| f.set_writable(false));
                            child_flags.set_writable(false);
                        }
                    }
                }
                // The child's reference was taken above.
                child_state.directory.map(virt, child_frame, child_flags);
            }
        }

        drop(child_guard);
        Ok(Some(child))
    }

    /// Writes dirty pages of shared file mappings in `[addr, addr + len)` back to
    /// their files and marks them clean.
    pub fn sync_range(&self, addr: usize, len: usize) -> Result<(), VmError> {
        if addr % PAGE_SIZE != 0 {
            return Err(VmError::InvalidAlignment);
        }
        let end = len
            .checked_next_multiple_of(PAGE_SIZE)
            .and_then(|len| addr.checked_add(len))
            .ok_or(VmError::InvalidArgument)?;

        let work = {
            let mut guard = self.lock();
            let state = &mut *guard;
            let zero = self.memory().zero_page();
            let mut work = Vec::new();

            for mapping in state.registry.iter().filter(|m| m.overlaps(addr, end)) {
                let Some(handle) = mapping.backing().filter(|_| mapping.is_shared()) else {
                    continue;
                };
                for page in page_addresses(addr.max(mapping.base()), end.min(mapping.end())) {
                    let virt = VirtualAddress::new(page);
                    let Some((frame, flags)) = state.directory.translate(virt) else {
                        continue;
                    };
                    if !flags.is_dirty() || zero.is_zero_frame(frame) {
                        continue;
                    }
                    // Keeps the frame alive if it is unmapped during the write.
                    self.memory().retain_frame(frame);
                    state.directory.update_flags(virt, |f| f.set_dirty(false));
                    work.push((
                        page,
                        PendingWriteBack {
                            handle: Arc::clone(handle),
                            offset: mapping.file_offset(page),
                            frame,
                        },
                    ));
                }
            }
            work
        };

        let mut result = Ok(());
        for (page, pending) in work {
            if let Err(error) = write_back_page(&pending.handle, pending.offset, pending.frame) {
                // Still mapped to the same frame: it is still dirty.
                let mut state = self.lock();
                let virt = VirtualAddress::new(page);
                if state.directory.translate(virt).map(|(frame, _)| frame) == Some(pending.frame) {
                    state.directory.update_flags(virt, |f| f.set_dirty(true));
                }
                if result.is_ok() {
                    result = Err(error);
                }
            }
            self.memory().release_frame(pending.frame);
        }
        result
    }

    /// Grows or shrinks the private anonymous mapping starting at `base` to
    /// `new_len` bytes. New pages are bound to the zero frame, or backed right away
    /// with the `mmap-no-cow` feature; cut pages are freed.
    pub fn resize_anonymous(&self, base: usize, new_len: usize) -> Result<(), VmError> {
        if new_len == 0 {
            return Err(VmError::InvalidArgument);
        }
        if new_len % PAGE_SIZE != 0 {
            return Err(VmError::InvalidAlignment);
        }

        let mut guard = self.lock();
        let state = &mut *guard;
        let mapping = state
            .registry
            .lookup(base)
            .filter(|mapping| mapping.base() == base)
            .filter(|mapping| mapping.is_anonymous() && !mapping.is_shared())
            .cloned()
            .ok_or(VmError::InvalidArgument)?;

        let old_end = mapping.end();
        let new_end = base.checked_add(new_len).ok_or(VmError::OutOfVirtualSpace)?;
        if new_end > old_end {
            if new_end > USER_SPACE_END {
                return Err(VmError::OutOfVirtualSpace);
            }
            if !state.registry.is_free(old_end, new_end) {
                return Err(VmError::Overlap);
            }
            if !mapping.prot().is_empty() {
                let count = (new_end - old_end) / PAGE_SIZE;
                let mut binder = state.binder(self.memory());
                if cfg!(feature = "mmap-no-cow") {
                    binder.alloc_eager_range(old_end, count, mapping.page_flags())?;
                } else {
                    binder.bind_zero_range(old_end, count, mapping.read_only_flags());
                }
            }
        } else if new_end < old_end {
            state
                .binder(self.memory())
                .free_range(new_end, (old_end - new_end) / PAGE_SIZE);
        }

        log::debug!(
            "address space {}: resize {:#x} from {:#x} to {:#x} bytes",
            self.id(),
            base,
            mapping.len(),
            new_len
        );
        state.registry.remove(base);
        reinsert(&mut state.registry, mapping.resized(new_len));
        Ok(())
    }
}
