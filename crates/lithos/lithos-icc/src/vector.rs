//! Randomly addressable array of seqlock cells for "latest value wins" data.
//!
//! Unlike the queue there is no cursor and no notion of loss: writers
//! overwrite slot `i`, readers get whatever slot `i` holds right now.

use crate::backing::Backing;
use crate::error::IccError;
use crate::seqlock::Seqlock;
use crate::shm_layout::{VectorHeader, bytes_for_vector};
use lithos_mmap::Attach;
use std::fmt;
use std::marker::PhantomData;
use std::mem::size_of;
use std::path::Path;
use std::ptr::{self, NonNull};
use std::sync::atomic::Ordering;
use tracing::{debug, info, warn};

/// Fixed-length array of [`Seqlock<T>`] cells behind a [`VectorHeader`],
/// in private or shared memory. Any number of writers and readers may use it
/// concurrently; two writers on the same slot must be serialized by the
/// caller.
pub struct SeqlockVector<T> {
    backing: Backing,
    header: NonNull<VectorHeader>,
    cells: NonNull<Seqlock<T>>,
    len: usize,
    _pd: PhantomData<T>,
}

// SAFETY: all shared state is atomics or seqlock-guarded cells.
unsafe impl<T: Copy + Send> Send for SeqlockVector<T> {}
unsafe impl<T: Copy + Send> Sync for SeqlockVector<T> {}

impl<T: Copy> SeqlockVector<T> {
    /// Allocates a zero-initialized vector of `len` slots in private memory.
    pub fn private(len: usize) -> Result<Self, IccError> {
        let backing = Backing::private(bytes_for_vector::<T>(len)?)?;
        Ok(Self::initialize(backing, len))
    }

    /// Creates the named shared vector, or attaches to it if it exists.
    ///
    /// An existing vector with at least `len` slots is adopted at its own
    /// length; a smaller one is an error.
    ///
    /// A creator that dies before writing the header leaves a segment that
    /// keeps failing with [`IccError::Uninitialized`]. Remove it with
    /// [`crate::destroy_shared`] and create it again.
    pub fn shared<P: AsRef<Path>>(path: P, len: usize) -> Result<Self, IccError> {
        let path = path.as_ref();
        let bytes = bytes_for_vector::<T>(len)?;

        match Backing::create_or_open(path, bytes)? {
            (backing, Attach::Created) => {
                info!(path = %path.display(), len, "created shared vector");
                Ok(Self::initialize(backing, len))
            }
            (backing, Attach::Opened) => {
                let vector = Self::attach_existing(backing)?;
                if vector.len() < len {
                    return Err(IccError::SegmentTooSmall {
                        path: path.to_path_buf(),
                        requested: len,
                        existing: vector.len(),
                    });
                }
                info!(
                    path = %path.display(),
                    requested = len,
                    len = vector.len(),
                    "attached to existing shared vector"
                );
                Ok(vector)
            }
        }
    }

    /// Attaches to an existing shared vector, taking its length from the header.
    pub fn open_shared<P: AsRef<Path>>(path: P) -> Result<Self, IccError> {
        let path = path.as_ref();
        let vector = Self::attach_existing(Backing::open(path)?)?;
        debug!(path = %path.display(), len = vector.len(), "opened shared vector");
        Ok(vector)
    }

    fn initialize(mut backing: Backing, len: usize) -> Self {
        let base = backing.as_mut_ptr();
        let header = base as *mut VectorHeader;
        // SAFETY: zeroed, aligned region of at least `bytes_for_vector(len)`.
        unsafe {
            ptr::write(header, VectorHeader::new::<T>(len));
            (*header).is_initialized.store(1, Ordering::Release);
        }
        Self::from_parts(backing, base, len)
    }

    fn attach_existing(mut backing: Backing) -> Result<Self, IccError> {
        if backing.len() < size_of::<VectorHeader>() {
            return Err(IccError::Uninitialized);
        }
        let base = backing.as_mut_ptr();
        // SAFETY: at least one header's worth of mapped bytes.
        let header = unsafe { &*(base as *const VectorHeader) };
        if let Err(e) = header.validate::<T>(backing.len()) {
            if !matches!(e, IccError::Uninitialized) {
                warn!(error = %e, "rejected vector header");
            }
            return Err(e);
        }
        let len = header.len as usize;
        Ok(Self::from_parts(backing, base, len))
    }

    fn from_parts(backing: Backing, base: *mut u8, len: usize) -> Self {
        // SAFETY: base is non-null and the cells follow the header.
        unsafe {
            Self {
                backing,
                header: NonNull::new_unchecked(base as *mut VectorHeader),
                cells: NonNull::new_unchecked(base.add(size_of::<VectorHeader>()) as *mut Seqlock<T>),
                len,
                _pd: PhantomData,
            }
        }
    }

    pub fn header(&self) -> &VectorHeader {
        // SAFETY: initialized header for the life of `backing`.
        unsafe { self.header.as_ref() }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_shared(&self) -> bool {
        self.backing.is_shared()
    }

    #[inline(always)]
    fn check(&self, index: usize) -> Result<(), IccError> {
        if index < self.len {
            Ok(())
        } else {
            Err(IccError::OutOfBounds {
                index,
                len: self.len,
            })
        }
    }

    #[inline(always)]
    fn cell(&self, index: usize) -> &Seqlock<T> {
        // SAFETY: callers guarantee index < len.
        unsafe { &*self.cells.as_ptr().add(index) }
    }

    /// Overwrites slot `index` with `item`.
    #[inline]
    pub fn write(&self, index: usize, item: &T) -> Result<(), IccError> {
        self.check(index)?;
        self.cell(index).write(item);
        Ok(())
    }

    /// # Safety
    /// `index` must be less than `self.len()`.
    #[inline]
    pub unsafe fn write_unchecked(&self, index: usize, item: &T) {
        self.cell(index).write(item);
    }

    /// Copies the latest value of slot `index` into `out`.
    ///
    /// Spins while a write to that slot is in progress. A slot that was never
    /// written reads as all-zero bytes.
    #[inline]
    pub fn read(&self, index: usize, out: &mut T) -> Result<(), IccError> {
        self.check(index)?;
        self.cell(index).read(out);
        Ok(())
    }

    /// # Safety
    /// `index` must be less than `self.len()`.
    #[inline]
    pub unsafe fn read_unchecked(&self, index: usize, out: &mut T) {
        self.cell(index).read(out);
    }

    /// Returns a copy of the latest value of slot `index`.
    #[inline]
    pub fn read_copy(&self, index: usize) -> Result<T, IccError> {
        self.check(index)?;
        Ok(self.cell(index).load())
    }

    /// Snapshot of every slot in index order. Each element is consistent on its
    /// own; there is no consistency across slots.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            vector: self,
            next: 0,
        }
    }
}

impl<T> fmt::Debug for SeqlockVector<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // SAFETY: see `header()`.
        let h = unsafe { self.header.as_ref() };
        f.debug_struct("SeqlockVector")
            .field("elem_size", &h.elem_size)
            .field("len", &h.len)
            .field("shared", &self.backing.is_shared())
            .finish()
    }
}

pub struct Iter<'a, T> {
    vector: &'a SeqlockVector<T>,
    next: usize,
}

impl<T: Copy> Iterator for Iter<'_, T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        if self.next >= self.vector.len {
            return None;
        }
        let out = self.vector.cell(self.next).load();
        self.next += 1;
        Some(out)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.vector.len - self.next;
        (left, Some(left))
    }
}

impl<T: Copy> ExactSizeIterator for Iter<'_, T> {}

impl<'a, T: Copy> IntoIterator for &'a SeqlockVector<T> {
    type Item = T;
    type IntoIter = Iter<'a, T>;

    fn into_iter(self) -> Iter<'a, T> {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn write_then_read_by_index() {
        let v = SeqlockVector::<u64>::private(4).unwrap();
        v.write(2, &7).unwrap();
        v.write(0, &1).unwrap();

        let mut out = 0;
        v.read(2, &mut out).unwrap();
        assert_eq!(out, 7);
        assert_eq!(v.read_copy(0).unwrap(), 1);
        assert_eq!(v.read_copy(1).unwrap(), 0, "unwritten slots read as zero");
    }

    #[test]
    fn latest_write_wins() {
        let v = SeqlockVector::<[u32; 8]>::private(4).unwrap();
        for value in [[1; 8], [2; 8], [3; 8]] {
            v.write(2, &value).unwrap();
        }
        assert_eq!(v.read_copy(2).unwrap(), [3; 8]);
    }

    #[test]
    fn out_of_bounds_is_an_error() {
        let v = SeqlockVector::<u8>::private(3).unwrap();
        let mut out = 0;
        assert!(matches!(
            v.write(3, &1),
            Err(IccError::OutOfBounds { index: 3, len: 3 })
        ));
        assert!(matches!(
            v.read(10, &mut out),
            Err(IccError::OutOfBounds { index: 10, len: 3 })
        ));
        assert!(v.read_copy(3).is_err());
    }

    #[test]
    fn unchecked_access_within_bounds() {
        let v = SeqlockVector::<i64>::private(2).unwrap();
        let mut out = 0;
        unsafe {
            v.write_unchecked(1, &-5);
            v.read_unchecked(1, &mut out);
        }
        assert_eq!(out, -5);
    }

    #[test]
    fn iter_yields_every_slot() {
        let v = SeqlockVector::<u16>::private(5).unwrap();
        for i in 0..5 {
            v.write(i, &(i as u16 * 10)).unwrap();
        }
        let all: Vec<u16> = v.iter().collect();
        assert_eq!(all, vec![0, 10, 20, 30, 40]);
        assert_eq!(v.iter().len(), 5);
        assert_eq!((&v).into_iter().count(), 5);
    }

    #[test]
    fn empty_vector() {
        let v = SeqlockVector::<u64>::private(0).unwrap();
        assert!(v.is_empty());
        assert_eq!(v.iter().next(), None);
        assert!(v.write(0, &1).is_err());
    }

    #[test]
    fn header_describes_region() {
        let v = SeqlockVector::<[u8; 100]>::private(3).unwrap();
        assert_eq!(v.header().len, 3);
        assert_eq!(v.header().elem_size, 128);
        assert_eq!(v.header().byte_len().unwrap(), 64 + 3 * 128);
        assert!(v.header().is_initialized());
        assert!(!v.is_shared());
        assert!(format!("{v:?}").contains("len: 3"));
    }

    #[test]
    fn concurrent_writers_on_distinct_slots() {
        let v = SeqlockVector::<[u64; 16]>::private(4).unwrap();
        let done = AtomicBool::new(false);
        std::thread::scope(|s| {
            for slot in 0..2usize {
                let v = &v;
                s.spawn(move || {
                    for generation in 1..=50_000u64 {
                        v.write(slot, &[generation; 16]).unwrap();
                    }
                });
            }
            s.spawn(|| {
                while !done.load(Ordering::Relaxed) {
                    for value in v.iter() {
                        assert!(value.iter().all(|&x| x == value[0]));
                    }
                }
            });
            // bounded reader lifetime; writers finish on their own
            std::thread::sleep(std::time::Duration::from_millis(50));
            done.store(true, Ordering::Relaxed);
        });
        assert_eq!(v.read_copy(0).unwrap(), [50_000; 16]);
        assert_eq!(v.read_copy(1).unwrap(), [50_000; 16]);
    }
}
