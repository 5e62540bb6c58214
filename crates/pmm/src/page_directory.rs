//! Architecture-independent page table management.
//!
//! `PageDirectory` owns a root table and walks the hierarchy to install, inspect,
//! update and remove leaf entries. Intermediate tables are created on demand and
//! released when the directory is dropped.

use crate::{
    PhysicalAddress, VirtualAddress,
    address::AddressTranslator,
    arch::{self, PageEntry, PageFlags, PageTable},
};

use alloc::boxed::Box;

/// Allocates an intermediate page table from emulated memory, so that non-leaf
/// entries can hold its emulated physical address.
#[cfg(any(test, feature = "software-emulation"))]
fn alloc_page_table() -> *mut PageTable {
    let translator = AddressTranslator::current();
    let phys = translator
        .allocate(
            core::mem::size_of::<PageTable>(),
            core::mem::align_of::<PageTable>(),
        )
        .expect("out of emulated memory for page tables");
    let ptr = translator.phys_to_ptr::<PageTable>(phys);
    // SAFETY: freshly claimed, suitably aligned and unused.
    unsafe { ptr.write(PageTable::new()) };
    ptr
}

/// Emulated memory is a bump region; released tables are simply abandoned.
#[cfg(any(test, feature = "software-emulation"))]
unsafe fn free_page_table(_table: *mut PageTable) {}

/// Allocates an intermediate page table on the kernel heap.
#[cfg(not(any(test, feature = "software-emulation")))]
fn alloc_page_table() -> *mut PageTable {
    Box::into_raw(Box::new(PageTable::new()))
}

#[cfg(not(any(test, feature = "software-emulation")))]
unsafe fn free_page_table(table: *mut PageTable) {
    // SAFETY: upheld by the caller.
    drop(unsafe { Box::from_raw(table) });
}

fn table_at(phys: PhysicalAddress) -> *mut PageTable {
    AddressTranslator::current().phys_to_ptr::<PageTable>(phys.as_usize())
}

/// An architecture-independent page table manager.
pub struct PageDirectory {
    root: Box<PageTable>,
    /// Set once the kernel half is borrowed from another directory.
    shares_kernel_half: bool,
}

impl PageDirectory {
    /// Creates a new page directory with an empty root page table.
    pub fn new() -> Self {
        Self {
            root: Box::new(PageTable::new()),
            shares_kernel_half: false,
        }
    }

    /// Maps `virt` to `phys` with `flags`; the present bit is set implicitly.
    /// Any previous entry is overwritten.
    ///
    /// # Panics
    /// Panics if either address is not page-aligned.
    pub fn map(&mut self, virt: VirtualAddress, phys: PhysicalAddress, flags: PageFlags) {
        assert!(virt.is_page_aligned(), "virtual address must be page-aligned");
        assert!(phys.is_page_aligned(), "physical address must be page-aligned");

        let mut flags = flags;
        flags.set_present(true);
        *self.walk_or_create(virt) = PageEntry::new(phys, flags);
    }

    /// Clears the entry for `virt` and returns the frame it pointed at, or `None` if
    /// nothing was mapped.
    ///
    /// # Panics
    /// Panics if the virtual address is not page-aligned.
    pub fn unmap(&mut self, virt: VirtualAddress) -> Option<PhysicalAddress> {
        assert!(virt.is_page_aligned(), "virtual address must be page-aligned");

        let entry = self.walk(virt)?;
        let phys = entry.address()?;
        entry.clear();
        arch::flush_page(virt.as_usize());
        Some(phys)
    }

    /// Returns the frame and flags mapped at the page containing `virt`.
    pub fn translate(&mut self, virt: VirtualAddress) -> Option<(PhysicalAddress, PageFlags)> {
        let entry = *self.walk(virt.align_down(arch::PAGE_SIZE))?;
        entry.address().map(|phys| (phys, entry.flags()))
    }

    /// Rewrites the flags of a present entry, keeping its frame. Returns `false` if
    /// the page is not mapped.
    pub fn update_flags(
        &mut self,
        virt: VirtualAddress,
        update: impl FnOnce(&mut PageFlags),
    ) -> bool {
        let Some(entry) = self.walk(virt.align_down(arch::PAGE_SIZE)) else {
            return false;
        };
        if !entry.is_present() {
            return false;
        }
        let mut flags = entry.flags();
        update(&mut flags);
        flags.set_present(true);
        entry.set_flags(flags);
        arch::flush_page(virt.as_usize());
        true
    }

    /// Copies the kernel-half root entries of `kernel` into this directory so that
    /// the kernel stays mapped while this directory is active. The shared tables
    /// remain owned by `kernel`.
    pub fn inherit_kernel_entries(&mut self, kernel: &PageDirectory) {
        for index in arch::KERNEL_ROOT_INDEX..self.root.len() {
            *self.root.entry_mut(index) = kernel.root.entry(index);
        }
        self.shares_kernel_half = true;
    }

    /// Makes this directory the active translation.
    ///
    /// # Safety
    /// The directory must map the kernel and everything the caller is about to touch.
    pub unsafe fn activate(&self) {
        // SAFETY: upheld by the caller.
        unsafe { self.root.activate() }
    }

    fn walk(&mut self, virt: VirtualAddress) -> Option<&mut PageEntry> {
        let mut table = &mut *self.root;

        for level in (1..arch::PAGE_TABLE_LEVELS).rev() {
            let entry = table.entry_mut(virt.page_index(level));
            let next = entry.address()?;
            // SAFETY: non-leaf entries are only ever written by `walk_or_create` and
            // point at live tables owned by this directory.
            table = unsafe { &mut *table_at(next) };
        }

        Some(table.entry_mut(virt.page_index(0)))
    }

    fn walk_or_create(&mut self, virt: VirtualAddress) -> &mut PageEntry {
        let mut table = &mut *self.root;

        for level in (1..arch::PAGE_TABLE_LEVELS).rev() {
            let entry = table.entry_mut(virt.page_index(level));

            if !entry.is_present() {
                let new_table = alloc_page_table();
                let phys = PhysicalAddress::new(AddressTranslator::current().ptr_to_phys(new_table));

                // Intermediate entries are permissive; the leaf decides access.
                let mut flags = PageFlags::empty();
                flags.set_present(true);
                flags.set_writable(true);
                flags.set_user(true);
                *entry = PageEntry::new(phys, flags);
            }

            let next = entry.address().expect("entry should be present");
            // SAFETY: either created just above or by an earlier call.
            table = unsafe { &mut *table_at(next) };
        }

        table.entry_mut(virt.page_index(0))
    }

    /// Frees every intermediate table below `table`, which sits at `level`.
    ///
    /// # Safety
    /// Every present non-leaf entry below `table` must point at a table owned by this
    /// directory.
    unsafe fn release_tables(table: &mut PageTable, level: usize, range: core::ops::Range<usize>) {
        if level == 0 {
            return;
        }
        for index in range {
            let entry = table.entry_mut(index);
            let Some(phys) = entry.address() else {
                continue;
            };
            let child = table_at(phys);
            // SAFETY: upheld by the caller; each child is visited exactly once.
            unsafe {
                let len = (*child).len();
                Self::release_tables(&mut *child, level - 1, 0..len);
                free_page_table(child);
            }
            entry.clear();
        }
    }
}

impl Default for PageDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PageDirectory {
    fn drop(&mut self) {
        // Borrowed kernel-half slots belong to the kernel directory.
        let end = if self.shares_kernel_half {
            arch::KERNEL_ROOT_INDEX
        } else {
            self.root.len()
        };
        // SAFETY: every owned table was created by `walk_or_create`.
        unsafe {
            Self::release_tables(&mut self.root, arch::PAGE_TABLE_LEVELS - 1, 0..end);
        }
    }
}
