//! VFS mapping bridge.
//!
//! Moves single pages between backing objects and frames. Nothing is cached here:
//! a resolved frame in a page table is the only copy of the page.

use alloc::{
    sync::{Arc, Weak},
    vec::Vec,
};
use core::{
    fmt,
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
};

use pmm::{PAGE_SIZE, PhysicalAddress, frame_bytes};
use spin::Mutex;

use crate::{error::VmError, kernel::KernelMemory, space::AddressSpace};

/// Errors reported by a backing object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VfsError {
    /// The device or file system failed the transfer.
    Io,
    /// The object does not accept writes.
    ReadOnly,
}

/// A file as seen by the mapping layer.
pub trait VfsFile: Send + Sync {
    /// Reads up to `buf.len()` bytes at `offset`. Returns fewer at end of file.
    fn read(&self, buf: &mut [u8], offset: usize) -> Result<usize, VfsError>;

    /// Writes `buf` at `offset` and returns how many bytes were written.
    fn write(&self, buf: &[u8], offset: usize) -> Result<usize, VfsError>;

    /// Current size in bytes.
    fn size(&self) -> usize;
}

/// An open file that mappings can refer to.
///
/// The handle remembers which address spaces map it, without owning them, so that
/// closing it can tear those mappings down.
pub struct FileHandle {
    id: u64,
    file: Arc<dyn VfsFile>,
    mappers: Mutex<Vec<Weak<AddressSpace>>>,
    closed: AtomicBool,
}

impl FileHandle {
    pub fn new(file: Arc<dyn VfsFile>) -> Arc<Self> {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Arc::new(Self {
            id: NEXT.fetch_add(1, Ordering::Relaxed),
            file,
            mappers: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn file(&self) -> &Arc<dyn VfsFile> {
        &self.file
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Records that `space` maps this handle. Returns false once the handle is
    /// closed; the caller must not create the mapping then.
    pub(crate) fn register(&self, space: &Arc<AddressSpace>) -> bool {
        let mut mappers = self.mappers.lock();
        if self.is_closed() {
            return false;
        }
        mappers.retain(|weak| weak.strong_count() > 0);
        if !mappers
            .iter()
            .any(|weak| core::ptr::eq(weak.as_ptr(), Arc::as_ptr(space)))
        {
            mappers.push(Arc::downgrade(space));
        }
        true
    }

    #[cfg(test)]
    pub(crate) fn mapper_count(&self) -> usize {
        self.mappers
            .lock()
            .iter()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    /// Closes the handle and removes every mapping of it from every address space.
    ///
    /// All mappings are torn down even if writing back a dirty page fails; the
    /// first such failure is returned.
    pub fn close(&self) -> Result<(), VmError> {
        let mappers = {
            let mut mappers = self.mappers.lock();
            self.closed.store(true, Ordering::Release);
            core::mem::take(&mut *mappers)
        };

        log::debug!("closing file handle {} mapped by {} spaces", self.id, mappers.len());

        // The mappers lock is not held here: teardown takes space locks.
        let mut result = Ok(());
        for space in mappers.iter().filter_map(Weak::upgrade) {
            let outcome = space.teardown_handle(self);
            if result.is_ok() {
                result = outcome;
            }
        }
        result
    }
}

impl fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileHandle")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Reads the page at `offset` of `handle` into a fresh frame. Bytes past the end of
/// the file read as zero. An offset at or past the end is an [`VmError::IoFault`].
pub fn read_page(
    handle: &FileHandle,
    offset: usize,
    memory: &KernelMemory,
) -> Result<PhysicalAddress, VmError> {
    if offset >= handle.file.size() {
        log::warn!(
            "page read at {:#x} is past the end of file handle {}",
            offset,
            handle.id
        );
        return Err(VmError::IoFault);
    }

    let frame = memory.allocate_frame()?;
    // SAFETY: the frame is fresh and not mapped anywhere yet.
    let buf = unsafe { frame_bytes(frame) };
    match handle.file.read(buf, offset) {
        Ok(read) => {
            buf[read.min(PAGE_SIZE)..].fill(0);
            Ok(frame)
        }
        Err(error) => {
            log::warn!(
                "page read at {:#x} of file handle {} failed: {:?}",
                offset,
                handle.id,
                error
            );
            memory.release_frame(frame);
            Err(VmError::IoFault)
        }
    }
}

/// Writes `frame` back to `handle` at `offset`. Only the part inside the current
/// file size is written; the file is never extended.
pub fn write_back_page(
    handle: &FileHandle,
    offset: usize,
    frame: PhysicalAddress,
) -> Result<(), VmError> {
    let len = handle.file.size().saturating_sub(offset).min(PAGE_SIZE);
    if len == 0 {
        return Ok(());
    }

    // SAFETY: the caller holds a reference to the frame; it is only read.
    let buf = unsafe { frame_bytes(frame) };
    match handle.file.write(&buf[..len], offset) {
        Ok(written) if written == len => Ok(()),
        outcome => {
            log::warn!(
                "write-back at {:#x} of file handle {} failed: {:?}",
                offset,
                handle.id,
                outcome
            );
            Err(VmError::IoFault)
        }
    }
}

/// A file held entirely in memory.
pub struct RamFile {
    data: Mutex<Vec<u8>>,
}

impl RamFile {
    pub fn new(data: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            data: Mutex::new(data),
        })
    }

    /// Returns a copy of the current contents.
    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().clone()
    }
}

impl VfsFile for RamFile {
    fn read(&self, buf: &mut [u8], offset: usize) -> Result<usize, VfsError> {
        let data = self.data.lock();
        let Some(available) = data.get(offset..) else {
            return Ok(0);
        };
        let len = available.len().min(buf.len());
        buf[..len].copy_from_slice(&available[..len]);
        Ok(len)
    }

    fn write(&self, buf: &[u8], offset: usize) -> Result<usize, VfsError> {
        let mut data = self.data.lock();
        let end = offset + buf.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[offset..end].copy_from_slice(buf);
        Ok(buf.len())
    }

    fn size(&self) -> usize {
        self.data.lock().len()
    }
}
