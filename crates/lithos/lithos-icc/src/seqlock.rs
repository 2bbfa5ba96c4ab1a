//! Seqlock (sequence lock) cell: one writer at a time, any number of readers.
//!
//! A seqlock lets readers take consistent snapshots of a value while a writer
//! keeps overwriting it, without either side ever blocking the other. The
//! writer bumps a version counter before and after each write; readers compare
//! the version they saw before and after copying the data.
//!
//! # Protocol
//!
//! **Writer:**
//! 1. `fetch_add(1)` on the version (now odd: write in progress)
//! 2. Release fence
//! 3. Copy the value in
//! 4. Store the starting version `+ 2` with Release (even again: published)
//!
//! **Reader:**
//! 1. Acquire-load version `v1`
//! 2. Copy the value out
//! 3. Acquire fence, load version `v2`
//! 4. `v1 == v2` and even: the copy is a single complete write. Otherwise retry.
//!
//! The fences are required for correctness, not tuning: without them the data
//! copy may be reordered across the version accesses and a torn value would
//! pass the check.
//!
//! # Versioned reads
//!
//! The broadcast queue knows which version a slot must carry for the message
//! it wants next (`2 * lap + 2`). [`Seqlock::read_with_version`] compares
//! against that before copying, turning "too old" into [`ReadError::Empty`] and
//! "too new" into [`ReadError::SpedPast`].

use crate::error::ReadError;
use std::cell::UnsafeCell;
use std::hint::spin_loop;
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering, compiler_fence, fence};

/// A value guarded by a sequence counter.
///
/// # Memory Layout
///
/// ```text
/// ┌──────────────────────────────────────────────┐
/// │ version: AtomicU64 │ data: T │ pad to 64 B   │
/// └──────────────────────────────────────────────┘
/// ```
///
/// Aligned to a cache line so neighbouring cells in a queue or vector never
/// share one.
///
/// # Version Semantics
///
/// - **Even**: data is a complete value
/// - **Odd**: a write is in progress
///
/// A zeroed cell (version 0) is valid; reading it yields all-zero bytes, so
/// `T` stored in a zero-initialized region must accept the all-zero pattern.
#[repr(C, align(64))]
pub struct Seqlock<T> {
    version: AtomicU64,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for Seqlock<T> {}
unsafe impl<T: Send> Sync for Seqlock<T> {}

impl<T: Default> Default for Seqlock<T> {
    fn default() -> Self {
        Self {
            version: AtomicU64::new(0),
            data: UnsafeCell::new(T::default()),
        }
    }
}

impl<T: Copy> Seqlock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            version: AtomicU64::new(0),
            data: UnsafeCell::new(value),
        }
    }

    /// Current version. Even means published, odd means mid-write.
    #[inline]
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Publishes `value`. Never blocks, never fails.
    ///
    /// Concurrent writers on the *same* cell are not supported: the queue
    /// hands each producer a distinct slot, and a vector index has one owner.
    #[inline(never)]
    pub fn write(&self, value: &T) {
        let v = self.version.fetch_add(1, Ordering::Acquire);
        fence(Ordering::Release);
        // SAFETY: the odd version keeps readers from accepting this copy
        // until the closing store below.
        unsafe { ptr::write_volatile(self.data.get(), *value) };
        compiler_fence(Ordering::AcqRel);
        self.version.store(v.wrapping_add(2), Ordering::Release);
    }

    /// Copies the latest published value into `out`, spinning across torn reads.
    #[inline(never)]
    pub fn read(&self, out: &mut T) {
        loop {
            let v1 = self.version.load(Ordering::Acquire);
            compiler_fence(Ordering::AcqRel);
            // SAFETY: a racing write may tear this copy; it is discarded
            // unless the version check below proves it whole.
            *out = unsafe { ptr::read_volatile(self.data.get()) };
            fence(Ordering::Acquire);
            let v2 = self.version.load(Ordering::Acquire);
            if v1 == v2 && v1 & 1 == 0 {
                return;
            }
            spin_loop();
        }
    }

    /// Like [`Seqlock::read`], but waits for an even version before copying.
    ///
    /// Cheaper under heavy write contention because it does not copy data it
    /// already knows will be thrown away.
    #[inline(never)]
    pub fn pessimistic_read(&self, out: &mut T) {
        loop {
            let v1 = self.version.load(Ordering::Acquire);
            if v1 & 1 == 1 {
                spin_loop();
                continue;
            }
            compiler_fence(Ordering::AcqRel);
            // SAFETY: `T: Copy`; a copy torn by a racing write is discarded
            // by the version re-check.
            *out = unsafe { ptr::read_volatile(self.data.get()) };
            fence(Ordering::Acquire);
            let v2 = self.version.load(Ordering::Acquire);
            if v1 == v2 {
                return;
            }
            spin_loop();
        }
    }

    /// Returns a copy of the latest published value.
    #[inline]
    pub fn load(&self) -> T {
        loop {
            let v1 = self.version.load(Ordering::Acquire);
            compiler_fence(Ordering::AcqRel);
            // SAFETY: `value` is only returned once the version re-check
            // proves no write overlapped the copy.
            let value = unsafe { ptr::read_volatile(self.data.get()) };
            fence(Ordering::Acquire);
            let v2 = self.version.load(Ordering::Acquire);
            if v1 == v2 && v1 & 1 == 0 {
                return value;
            }
            spin_loop();
        }
    }

    /// Copies the value into `out` only if the cell carries exactly `expected`.
    ///
    /// - version below `expected` (including the odd in-progress value just
    ///   beneath it): [`ReadError::Empty`], nothing copied
    /// - version above `expected`: [`ReadError::SpedPast`]
    /// - equal: copy, then re-verify; a write landing mid-copy is retried and
    ///   will then report `SpedPast`
    #[inline(never)]
    pub fn read_with_version(&self, out: &mut T, expected: u64) -> Result<(), ReadError> {
        loop {
            let v1 = self.version.load(Ordering::Acquire);
            if v1 != expected {
                return Err(if v1 < expected {
                    ReadError::Empty
                } else {
                    ReadError::SpedPast { expected, found: v1 }
                });
            }
            compiler_fence(Ordering::AcqRel);
            // SAFETY: `T: Copy`; a copy torn by a racing write is discarded
            // by the version re-check.
            *out = unsafe { ptr::read_volatile(self.data.get()) };
            fence(Ordering::Acquire);
            let v2 = self.version.load(Ordering::Acquire);
            if v1 == v2 {
                return Ok(());
            }
            spin_loop();
        }
    }
}
