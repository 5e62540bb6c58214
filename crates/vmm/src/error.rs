use core::fmt;

use pmm::AllocError;

/// Errors reported by address-space operations.
///
/// Violations of kernel invariants are not represented here; they go through
/// [`invariant_violation`] and stop the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// The requested range intersects an existing mapping.
    Overlap,
    /// An address, length or offset is not page-aligned.
    InvalidAlignment,
    /// No free virtual range is large enough.
    OutOfVirtualSpace,
    /// No physical frame is left.
    OutOfMemory,
    /// Reading or writing the backing object failed.
    IoFault,
    /// The access falls outside every mapping or violates its protection.
    SegmentationFault,
    /// Malformed arguments, such as a zero length or a closed handle.
    InvalidArgument,
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let message = match self {
            VmError::Overlap => "range overlaps an existing mapping",
            VmError::InvalidAlignment => "address, length or offset is not page-aligned",
            VmError::OutOfVirtualSpace => "no free virtual range of the requested size",
            VmError::OutOfMemory => "out of physical frames",
            VmError::IoFault => "backing object I/O failed",
            VmError::SegmentationFault => "access outside any mapping or against its protection",
            VmError::InvalidArgument => "invalid argument",
        };
        f.write_str(message)
    }
}

impl From<AllocError> for VmError {
    fn from(error: AllocError) -> Self {
        match error {
            AllocError::OutOfMemory => VmError::OutOfMemory,
            AllocError::InvalidDeallocation => {
                invariant_violation(format_args!("frame allocator rejected a release"))
            }
        }
    }
}

/// Reports a bug in kernel code and stops.
#[cold]
#[track_caller]
pub(crate) fn invariant_violation(message: fmt::Arguments<'_>) -> ! {
    log::error!("memory invariant violated: {}", message);
    panic!("memory invariant violated: {}", message);
}
