//! Where a queue or vector region lives: process-private heap or a named
//! shared-memory segment.
//!
//! The protocol on top never cares which; it only sees a zero-initialized,
//! cache-line aligned byte range that stays put for the life of the backing.

use crate::error::IccError;
use lithos_mmap::{Attach, ShmSegment};
use std::alloc::{self, Layout};
use std::path::Path;
use std::ptr::NonNull;

const CACHE_LINE: usize = 64;

pub(crate) enum Backing {
    Private(PrivateRegion),
    /// Dropping this unmaps the view; the segment itself is left in place.
    Shared(ShmSegment),
}

impl Backing {
    pub(crate) fn private(bytes: usize) -> Result<Self, IccError> {
        PrivateRegion::zeroed(bytes).map(Backing::Private)
    }

    pub(crate) fn create_or_open(path: &Path, bytes: usize) -> Result<(Self, Attach), IccError> {
        let (segment, attach) = ShmSegment::create_or_open(path, bytes as u64).map_err(|source| {
            IccError::CreateOrOpenFailed {
                path: path.to_path_buf(),
                source,
            }
        })?;
        Ok((Backing::Shared(segment), attach))
    }

    pub(crate) fn open(path: &Path) -> Result<Self, IccError> {
        let segment = ShmSegment::open(path).map_err(|source| IccError::CreateOrOpenFailed {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Backing::Shared(segment))
    }

    #[inline]
    pub(crate) fn as_mut_ptr(&mut self) -> *mut u8 {
        match self {
            Backing::Private(region) => region.ptr.as_ptr(),
            Backing::Shared(segment) => segment.as_mut_ptr(),
        }
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        match self {
            Backing::Private(region) => region.layout.size(),
            Backing::Shared(segment) => segment.len(),
        }
    }

    pub(crate) fn is_shared(&self) -> bool {
        matches!(self, Backing::Shared(_))
    }
}

/// Zeroed heap allocation aligned to a cache line.
pub(crate) struct PrivateRegion {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl PrivateRegion {
    fn zeroed(bytes: usize) -> Result<Self, IccError> {
        let layout = Layout::from_size_align(bytes.max(CACHE_LINE), CACHE_LINE)
            .map_err(|_| IccError::CapacityOverflow(bytes))?
            .pad_to_align();
        // SAFETY: layout has non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).unwrap_or_else(|| alloc::handle_alloc_error(layout));
        Ok(Self { ptr, layout })
    }
}

impl Drop for PrivateRegion {
    fn drop(&mut self) {
        // SAFETY: allocated in `zeroed` with this exact layout.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

// SAFETY: the region is plain bytes; synchronization is the job of the cells
// laid over it.
unsafe impl Send for PrivateRegion {}
unsafe impl Sync for PrivateRegion {}
