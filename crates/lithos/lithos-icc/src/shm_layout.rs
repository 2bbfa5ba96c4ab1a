//! Binary layout of queue and vector regions.
//!
//! Both structures are a one-cache-line header followed directly by the cell
//! array. The header is self-describing: a process that does not know `T` can
//! still compute the full region size from it.
//!
//! # Queue Layout
//!
//! ```text
//! offset
//!  0 ┌──────────────┬──────────────┬────────────┬────────────────┬─────────┐
//!    │ elem_size u32│ capacity u32 │ queue_type │ is_initialized │ pad (6) │
//! 16 ├──────────────┴──────────────┴────────────┴────────────────┴─────────┤
//!    │ mask u64                                                           │
//! 24 ├────────────────────────────────────────────────────────────────────┤
//!    │ write_cursor AtomicU64                                             │
//! 32 ├────────────────────────────────────────────────────────────────────┤
//!    │ pad to 64                                                          │
//! 64 ├────────────────────────────────────────────────────────────────────┤
//!    │ Seqlock<T>[0] │ Seqlock<T>[1] │ ...          │ Seqlock<T>[cap-1]   │
//!    └────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Vector Layout
//!
//! ```text
//!  0 ┌──────────────┬──────────┬────────────────┬──────────────┐
//!    │ elem_size u64│ len u64  │ is_initialized │ pad to 64    │
//! 64 ├──────────────┴──────────┴────────────────┴──────────────┤
//!    │ Seqlock<T>[0] │ ...                  │ Seqlock<T>[len-1]│
//!    └─────────────────────────────────────────────────────────┘
//! ```
//!
//! `elem_size` is the size of one cell (`Seqlock<T>`), not of `T`, so the
//! byte length is `header + count * elem_size` with no knowledge of `T`.

use crate::error::IccError;
use crate::seqlock::Seqlock;
use std::mem::size_of;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

/// Producer mode of a queue, stored as one byte in the shared header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum QueueType {
    /// Not configured. Valid for consumers that only attach; producing panics.
    Unknown = 0,
    /// Any number of producers; the cursor advances with `fetch_add`.
    MultiProducer = 1,
    /// Exactly one producer; the cursor advances with a plain load + store.
    SingleProducer = 2,
}

impl QueueType {
    /// Decodes the header byte. Unrecognized values decode as `Unknown`.
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Self::MultiProducer,
            2 => Self::SingleProducer,
            _ => Self::Unknown,
        }
    }
}

/// Header at offset 0 of every queue region.
#[repr(C, align(64))]
pub struct QueueHeader {
    /// Bytes per cell, `size_of::<Seqlock<T>>()`.
    pub elem_size: u32,
    /// Number of cells. Always a power of two.
    pub capacity: u32,
    /// Raw [`QueueType`].
    pub queue_type: u8,
    /// Set to 1 by the creator once every other field is written.
    pub is_initialized: AtomicU8,
    _pad: [u8; 6],
    /// `capacity - 1`.
    pub mask: u64,
    /// Sequence number the next producer will claim.
    pub write_cursor: AtomicU64,
}

impl QueueHeader {
    pub(crate) fn new<T>(capacity: usize, queue_type: QueueType) -> Self {
        Self {
            elem_size: size_of::<Seqlock<T>>() as u32,
            capacity: capacity as u32,
            queue_type: queue_type as u8,
            is_initialized: AtomicU8::new(0),
            _pad: [0; 6],
            mask: capacity as u64 - 1,
            write_cursor: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn queue_type(&self) -> QueueType {
        QueueType::from_raw(self.queue_type)
    }

    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.is_initialized.load(Ordering::Acquire) == 1
    }

    /// Total region size in bytes, computed from the header alone.
    ///
    /// # Errors
    /// [`IccError::CapacityOverflow`] if the header describes more bytes than
    /// fit in `usize`.
    pub fn byte_len(&self) -> Result<usize, IccError> {
        checked_region_len::<QueueHeader>(self.capacity as u64, self.elem_size as u64)
    }

    /// Checks a header found in an existing region of `region_len` bytes
    /// before it is used as a queue of `T`.
    pub fn validate<T>(&self, region_len: usize) -> Result<(), IccError> {
        if !self.is_initialized() {
            return Err(IccError::Uninitialized);
        }
        let capacity = self.capacity as usize;
        if capacity == 0 {
            return Err(IccError::ZeroLength);
        }
        if !capacity.is_power_of_two() || self.mask != capacity as u64 - 1 {
            return Err(IccError::LengthNotPowerOfTwo(capacity));
        }
        let expected = size_of::<Seqlock<T>>();
        if self.elem_size as usize != expected {
            return Err(IccError::ElementSizeMismatch {
                expected,
                found: self.elem_size as usize,
            });
        }
        let needed = self.byte_len()?;
        if needed > region_len {
            return Err(IccError::Truncated {
                needed,
                actual: region_len,
            });
        }
        Ok(())
    }
}

/// Header at offset 0 of every vector region.
#[repr(C, align(64))]
pub struct VectorHeader {
    /// Bytes per cell, `size_of::<Seqlock<T>>()`.
    pub elem_size: u64,
    /// Number of cells.
    pub len: u64,
    pub is_initialized: AtomicU8,
}

impl VectorHeader {
    pub(crate) fn new<T>(len: usize) -> Self {
        Self {
            elem_size: size_of::<Seqlock<T>>() as u64,
            len: len as u64,
            is_initialized: AtomicU8::new(0),
        }
    }

    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.is_initialized.load(Ordering::Acquire) == 1
    }

    /// Total region size in bytes. The header may come from another process,
    /// so every field is untrusted.
    pub fn byte_len(&self) -> Result<usize, IccError> {
        checked_region_len::<VectorHeader>(self.len, self.elem_size)
    }

    pub fn validate<T>(&self, region_len: usize) -> Result<(), IccError> {
        if !self.is_initialized() {
            return Err(IccError::Uninitialized);
        }
        let expected = size_of::<Seqlock<T>>();
        if self.elem_size as usize != expected {
            return Err(IccError::ElementSizeMismatch {
                expected,
                found: self.elem_size as usize,
            });
        }
        let needed = self.byte_len()?;
        if needed > region_len {
            return Err(IccError::Truncated {
                needed,
                actual: region_len,
            });
        }
        Ok(())
    }
}

/// `header + count * elem_size`, with both factors read from a header.
fn checked_region_len<H>(count: u64, elem_size: u64) -> Result<usize, IccError> {
    let overflow = || IccError::CapacityOverflow(usize::try_from(count).unwrap_or(usize::MAX));
    let count = usize::try_from(count).map_err(|_| overflow())?;
    let elem_size = usize::try_from(elem_size).map_err(|_| overflow())?;
    count
        .checked_mul(elem_size)
        .and_then(|cells| cells.checked_add(size_of::<H>()))
        .ok_or_else(overflow)
}

/// Bytes needed for a queue of `capacity` cells of `T`.
pub fn bytes_for_queue<T>(capacity: usize) -> Result<usize, IccError> {
    capacity
        .checked_mul(size_of::<Seqlock<T>>())
        .and_then(|cells| cells.checked_add(size_of::<QueueHeader>()))
        .ok_or(IccError::CapacityOverflow(capacity))
}

/// Bytes needed for a vector of `len` cells of `T`.
pub fn bytes_for_vector<T>(len: usize) -> Result<usize, IccError> {
    len.checked_mul(size_of::<Seqlock<T>>())
        .and_then(|cells| cells.checked_add(size_of::<VectorHeader>()))
        .ok_or(IccError::CapacityOverflow(len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::offset_of;

    #[test]
    fn queue_header_field_offsets() {
        assert_eq!(offset_of!(QueueHeader, elem_size), 0);
        assert_eq!(offset_of!(QueueHeader, capacity), 4);
        assert_eq!(offset_of!(QueueHeader, queue_type), 8);
        assert_eq!(offset_of!(QueueHeader, is_initialized), 9);
        assert_eq!(offset_of!(QueueHeader, mask), 16);
        assert_eq!(offset_of!(QueueHeader, write_cursor), 24);
        assert_eq!(size_of::<QueueHeader>(), 64);
    }

    #[test]
    fn vector_header_is_one_cache_line() {
        assert_eq!(offset_of!(VectorHeader, elem_size), 0);
        assert_eq!(offset_of!(VectorHeader, len), 8);
        assert_eq!(size_of::<VectorHeader>(), 64);
    }

    #[test]
    fn region_sizes() {
        assert_eq!(bytes_for_queue::<u64>(8).unwrap(), 64 + 8 * 64);
        assert_eq!(bytes_for_vector::<[u8; 100]>(3).unwrap(), 64 + 3 * 128);
        assert!(bytes_for_vector::<u64>(usize::MAX).is_err());
    }

    #[test]
    fn byte_len_needs_no_element_type() {
        let h = QueueHeader::new::<[u64; 10]>(16, QueueType::SingleProducer);
        assert_eq!(h.byte_len().unwrap(), bytes_for_queue::<[u64; 10]>(16).unwrap());
        let v = VectorHeader::new::<u32>(5);
        assert_eq!(v.byte_len().unwrap(), bytes_for_vector::<u32>(5).unwrap());
    }

    #[test]
    fn validate_rejects_uninitialized_and_wrong_type() {
        let h = QueueHeader::new::<u64>(8, QueueType::MultiProducer);
        assert!(matches!(h.validate::<u64>(4096), Err(IccError::Uninitialized)));

        h.is_initialized.store(1, Ordering::Release);
        assert!(h.validate::<u64>(4096).is_ok());
        assert!(matches!(
            h.validate::<[u8; 100]>(4096),
            Err(IccError::ElementSizeMismatch { expected: 128, found: 64 })
        ));
        assert!(matches!(
            h.validate::<u64>(100),
            Err(IccError::Truncated { .. })
        ));
    }

    #[test]
    fn oversized_header_fields_fail_instead_of_wrapping() {
        let v = VectorHeader {
            elem_size: 64,
            len: (1 << 58) + 1,
            is_initialized: AtomicU8::new(1),
        };
        assert!(matches!(v.byte_len(), Err(IccError::CapacityOverflow(_))));
        assert!(matches!(
            v.validate::<u64>(4096),
            Err(IccError::CapacityOverflow(_))
        ));

        let v = VectorHeader {
            elem_size: u64::MAX,
            len: 1,
            is_initialized: AtomicU8::new(1),
        };
        assert!(v.byte_len().is_err());

        // the widest queue header still fits a 64-bit usize, so it is
        // rejected against the region size instead
        let h = QueueHeader::new::<u64>(1 << 31, QueueType::SingleProducer);
        h.is_initialized.store(1, Ordering::Release);
        assert!(matches!(
            h.validate::<u64>(4096),
            Err(IccError::Truncated { actual: 4096, .. })
        ));
    }

    #[test]
    fn queue_type_decodes_unknown_bytes() {
        assert_eq!(QueueType::from_raw(1), QueueType::MultiProducer);
        assert_eq!(QueueType::from_raw(2), QueueType::SingleProducer);
        assert_eq!(QueueType::from_raw(0), QueueType::Unknown);
        assert_eq!(QueueType::from_raw(77), QueueType::Unknown);
    }
}
