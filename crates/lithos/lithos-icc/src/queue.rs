//! Broadcast ring buffer: one or many producers, any number of consumers.
//!
//! Every attached consumer sees every message, in production order, for as
//! long as it keeps up. Producers never wait for consumers; a consumer that
//! falls a full lap behind finds out on its next read via
//! [`ReadError::SpedPast`] instead of silently receiving newer data.
//!
//! # Design
//! - **Producers** claim a sequence number from the shared write cursor and
//!   write into slot `seq & mask` with the seqlock protocol.
//! - **Consumers** keep a private `(position, expected_version)` pair. The
//!   version a slot must carry for the next message is fully determined by
//!   how many laps the consumer has completed, so no shared read cursor exists.
//!
//! # Thread Safety
//! - `Queue` is `Sync`; share it by reference (or `Arc`) between threads.
//! - `Producer` and `Consumer` are per-thread handles borrowed from the queue.
//! - A `SingleProducer` queue must only ever have one producing thread across
//!   all processes attached to it.
//!
//! # Known limitation
//! A producer that laps the whole ring while an earlier write to the same slot
//! is still in flight races with that write. With realistic capacities this
//! needs one producer to stall for `capacity` productions mid-copy, and it is
//! not defended against.

use crate::backing::Backing;
use crate::error::{IccError, ReadError};
use crate::ring::{self, RingConfig};
use crate::seqlock::Seqlock;
use crate::shm_layout::{QueueHeader, QueueType, bytes_for_queue};
use lithos_mmap::Attach;
use std::fmt;
use std::marker::PhantomData;
use std::mem::size_of;
use std::path::Path;
use std::ptr::{self, NonNull};
use std::sync::atomic::Ordering;
use tracing::{debug, info, warn};

/// A broadcast queue of `T` over private or shared memory.
pub struct Queue<T> {
    /// Owns the region; the pointers below point into it.
    backing: Backing,
    header: NonNull<QueueHeader>,
    cells: NonNull<Seqlock<T>>,
    /// Copied from the header, which never changes after initialization.
    mask: u64,
    queue_type: QueueType,
    _pd: PhantomData<T>,
}

// SAFETY: all shared state is atomics or seqlock-guarded cells.
unsafe impl<T: Copy + Send> Send for Queue<T> {}
unsafe impl<T: Copy + Send> Sync for Queue<T> {}

impl<T: Copy> Queue<T> {
    /// Allocates a queue in process-private memory.
    ///
    /// # Errors
    /// `capacity` must be a non-zero power of two.
    pub fn private(capacity: usize, queue_type: QueueType) -> Result<Self, IccError> {
        let cfg = RingConfig::new(capacity)?;
        let backing = Backing::private(bytes_for_queue::<T>(cfg.capacity)?)?;
        Ok(Self::initialize(backing, cfg, queue_type))
    }

    /// Creates the named shared queue, or attaches to it if it already exists.
    ///
    /// An existing queue with at least `capacity` slots is adopted with its own
    /// (possibly larger) capacity. Passing `QueueType::Unknown` accepts whatever
    /// mode the existing queue was created with.
    ///
    /// # Errors
    /// - [`IccError::SegmentTooSmall`] if the existing queue is smaller
    /// - [`IccError::QueueTypeMismatch`] if the existing mode differs
    /// - [`IccError::Uninitialized`] if the creator has not finished writing
    ///   the header yet; retrying shortly after is expected to succeed. If
    ///   the creator died instead, the segment stays uninitialized until it
    ///   is removed with [`crate::destroy_shared`]
    /// - [`IccError::CreateOrOpenFailed`] for OS-level failures
    pub fn shared<P: AsRef<Path>>(
        path: P,
        capacity: usize,
        queue_type: QueueType,
    ) -> Result<Self, IccError> {
        let path = path.as_ref();
        let cfg = RingConfig::new(capacity)?;
        let bytes = bytes_for_queue::<T>(cfg.capacity)?;

        match Backing::create_or_open(path, bytes)? {
            (backing, Attach::Created) => {
                info!(path = %path.display(), capacity, ?queue_type, "created shared queue");
                Ok(Self::initialize(backing, cfg, queue_type))
            }
            (backing, Attach::Opened) => {
                let queue = Self::attach_existing(backing)?;
                if queue.capacity() < capacity {
                    return Err(IccError::SegmentTooSmall {
                        path: path.to_path_buf(),
                        requested: capacity,
                        existing: queue.capacity(),
                    });
                }
                if queue_type != QueueType::Unknown && queue.queue_type != queue_type {
                    return Err(IccError::QueueTypeMismatch {
                        requested: queue_type,
                        found: queue.queue_type,
                    });
                }
                info!(
                    path = %path.display(),
                    requested = capacity,
                    capacity = queue.capacity(),
                    "attached to existing shared queue"
                );
                Ok(queue)
            }
        }
    }

    /// Attaches to an existing shared queue, taking capacity and mode from
    /// its header.
    pub fn open_shared<P: AsRef<Path>>(path: P) -> Result<Self, IccError> {
        let path = path.as_ref();
        let queue = Self::attach_existing(Backing::open(path)?)?;
        debug!(path = %path.display(), capacity = queue.capacity(), "opened shared queue");
        Ok(queue)
    }

    /// Writes a fresh header into a zeroed region.
    fn initialize(mut backing: Backing, cfg: RingConfig, queue_type: QueueType) -> Self {
        let base = backing.as_mut_ptr();
        let header = base as *mut QueueHeader;
        // SAFETY: the region is at least `bytes_for_queue` long, 64-byte
        // aligned and not yet visible to anyone else as initialized.
        unsafe {
            ptr::write(header, QueueHeader::new::<T>(cfg.capacity, queue_type));
            (*header).is_initialized.store(1, Ordering::Release);
        }
        Self::from_parts(backing, base, cfg.mask(), queue_type)
    }

    /// Validates and adopts a header written by someone else.
    fn attach_existing(mut backing: Backing) -> Result<Self, IccError> {
        if backing.len() < size_of::<QueueHeader>() {
            // the creator has not sized the segment yet
            return Err(IccError::Uninitialized);
        }
        let base = backing.as_mut_ptr();
        // SAFETY: at least one header's worth of mapped bytes.
        let header = unsafe { &*(base as *const QueueHeader) };
        if let Err(e) = header.validate::<T>(backing.len()) {
            if !matches!(e, IccError::Uninitialized) {
                warn!(error = %e, "rejected queue header");
            }
            return Err(e);
        }
        let (mask, queue_type) = (header.mask, header.queue_type());
        Ok(Self::from_parts(backing, base, mask, queue_type))
    }

    fn from_parts(backing: Backing, base: *mut u8, mask: u64, queue_type: QueueType) -> Self {
        // SAFETY: base is non-null (heap allocation or live mapping) and the
        // cell array starts right after the header.
        unsafe {
            Self {
                backing,
                header: NonNull::new_unchecked(base as *mut QueueHeader),
                cells: NonNull::new_unchecked(base.add(size_of::<QueueHeader>()) as *mut Seqlock<T>),
                mask,
                queue_type,
                _pd: PhantomData,
            }
        }
    }

    #[inline(always)]
    pub fn header(&self) -> &QueueHeader {
        // SAFETY: points at an initialized header for the life of `backing`.
        unsafe { self.header.as_ref() }
    }

    #[inline(always)]
    fn cell(&self, idx: u64) -> &Seqlock<T> {
        // SAFETY: callers pass `seq & mask`, always below capacity.
        unsafe { &*self.cells.as_ptr().add(idx as usize) }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        (self.mask + 1) as usize
    }

    #[inline]
    pub fn queue_type(&self) -> QueueType {
        self.queue_type
    }

    /// Current write cursor: the number of messages claimed so far.
    ///
    /// Reading this from a non-producer core pulls the cursor's cache line
    /// away from the producers; keep it off hot consumer paths.
    #[inline]
    pub fn count(&self) -> u64 {
        self.header().write_cursor.load(Ordering::Relaxed)
    }

    pub fn is_shared(&self) -> bool {
        self.backing.is_shared()
    }

    /// Claims the next sequence number.
    ///
    /// # Panics
    /// On a queue whose mode is `Unknown`.
    #[inline(always)]
    fn next_count(&self) -> u64 {
        let cursor = &self.header().write_cursor;
        match self.queue_type {
            QueueType::MultiProducer => cursor.fetch_add(1, Ordering::AcqRel),
            QueueType::SingleProducer => {
                let c = cursor.load(Ordering::Relaxed);
                cursor.store(c.wrapping_add(1), Ordering::Relaxed);
                c
            }
            QueueType::Unknown => panic!("produce on a queue with unknown producer mode"),
        }
    }

    /// Publishes `item` and returns its sequence number. Never blocks.
    ///
    /// # Panics
    /// On a queue whose mode is `Unknown`. Use [`Producer::new`] to surface
    /// that as an error before producing.
    #[inline]
    pub fn produce(&self, item: &T) -> u64 {
        let seq = self.next_count();
        self.cell(ring::seq_to_index(seq, self.mask)).write(item);
        seq
    }

    #[inline(always)]
    fn consume(&self, out: &mut T, pos: u64, expected_version: u64) -> Result<(), ReadError> {
        self.cell(pos).read_with_version(out, expected_version)
    }

    /// Attaches a new consumer at the current write cursor.
    pub fn attach(&self) -> Consumer<'_, T> {
        Consumer::new(self)
    }
}

impl<T> fmt::Debug for Queue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // SAFETY: see `header()`.
        let h = unsafe { self.header.as_ref() };
        f.debug_struct("Queue")
            .field("elem_size", &h.elem_size)
            .field("capacity", &h.capacity)
            .field("queue_type", &h.queue_type())
            .field("write_cursor", &h.write_cursor.load(Ordering::Relaxed))
            .field("shared", &self.backing.is_shared())
            .finish()
    }
}

/// Producing handle for a queue whose mode is known.
pub struct Producer<'a, T> {
    queue: &'a Queue<T>,
}

impl<'a, T: Copy> Producer<'a, T> {
    /// # Errors
    /// [`IccError::UnknownQueueType`] if the queue has no producer mode.
    pub fn new(queue: &'a Queue<T>) -> Result<Self, IccError> {
        if queue.queue_type() == QueueType::Unknown {
            return Err(IccError::UnknownQueueType);
        }
        Ok(Self { queue })
    }

    /// Publishes `item`; returns its sequence number.
    #[inline]
    pub fn produce(&mut self, item: &T) -> u64 {
        self.queue.produce(item)
    }
}

/// A consumer's private read position.
///
/// Nothing here is shared: creating, dropping or stalling a consumer has no
/// effect on producers or on other consumers.
#[derive(Debug)]
pub struct Consumer<'a, T> {
    /// Slot index of the next message.
    pos: u64,
    mask: u64,
    /// Version that slot carries once the next message lands there.
    expected_version: u64,
    queue: &'a Queue<T>,
}

impl<'a, T: Copy> Consumer<'a, T> {
    /// Starts at the current write cursor; earlier messages are not visible.
    ///
    /// The cursor is read relaxed: it only picks a starting point, and a
    /// slightly stale value just means starting a few messages earlier.
    pub fn new(queue: &'a Queue<T>) -> Self {
        let mut consumer = Self {
            pos: 0,
            mask: queue.mask,
            expected_version: 2,
            queue,
        };
        consumer.seek(queue.count());
        consumer
    }

    fn seek(&mut self, seq: u64) {
        self.pos = ring::seq_to_index(seq, self.mask);
        self.expected_version = ring::expected_version(seq, self.mask + 1);
    }

    /// Reads the next message into `out` without blocking.
    ///
    /// - `Ok(())`: `out` holds the next message; the consumer advanced
    /// - `Err(Empty)`: nothing new yet; position unchanged
    /// - `Err(SpedPast { .. })`: the next message was overwritten; position
    ///   unchanged. Call [`Consumer::resync`] to skip ahead, or hand off.
    ///
    /// `out` is unspecified after an error.
    #[inline]
    pub fn try_consume(&mut self, out: &mut T) -> Result<(), ReadError> {
        self.queue.consume(out, self.pos, self.expected_version)?;
        (self.pos, self.expected_version) =
            ring::advance(self.pos, self.mask, self.expected_version);
        Ok(())
    }

    /// Sequence number of the message this consumer will read next.
    #[inline]
    pub fn sequence(&self) -> u64 {
        ring::sequence_at(self.pos, self.expected_version, self.mask + 1)
    }

    /// Jumps to the current write cursor, returning how many messages were
    /// skipped.
    ///
    /// Never called implicitly; after `SpedPast` the caller chooses whether
    /// to resync, log, or escalate.
    pub fn resync(&mut self) -> u64 {
        let cursor = self.queue.count();
        let skipped = cursor.saturating_sub(self.sequence());
        debug!(from = self.sequence(), to = cursor, skipped, "consumer resync");
        self.seek(cursor);
        skipped
    }
}

impl<'a, T: Copy> From<&'a Queue<T>> for Consumer<'a, T> {
    fn from(queue: &'a Queue<T>) -> Self {
        Self::new(queue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn basic() {
        for typ in [QueueType::SingleProducer, QueueType::MultiProducer] {
            let q = Queue::private(16, typ).unwrap();
            let mut p = Producer::new(&q).unwrap();
            let mut c = q.attach();
            let mut m = 0u64;

            p.produce(&1);
            assert_eq!(c.try_consume(&mut m), Ok(()));
            assert_eq!(m, 1);
            assert_eq!(c.try_consume(&mut m), Err(ReadError::Empty));

            for i in 0..16 {
                p.produce(&i);
            }
            for i in 0..16 {
                c.try_consume(&mut m).unwrap();
                assert_eq!(m, i);
            }
            assert_eq!(c.try_consume(&mut m), Err(ReadError::Empty));

            for _ in 0..20 {
                p.produce(&1);
            }
            assert!(matches!(
                c.try_consume(&mut m),
                Err(ReadError::SpedPast { expected: 4, found: 6 })
            ));
        }
    }

    #[test]
    fn produce_returns_sequence_numbers() {
        let q = Queue::private(4, QueueType::SingleProducer).unwrap();
        let seqs: Vec<u64> = (0..6u32).map(|i| q.produce(&i)).collect();
        assert_eq!(seqs, vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(q.count(), 6);
    }

    #[test]
    fn late_consumer_starts_at_cursor() {
        let q = Queue::private(8, QueueType::SingleProducer).unwrap();
        for i in 0..5u64 {
            q.produce(&i);
        }
        let mut c = q.attach();
        assert_eq!(c.sequence(), 5);

        let mut m = 0;
        assert_eq!(c.try_consume(&mut m), Err(ReadError::Empty));
        q.produce(&42);
        assert_eq!(c.try_consume(&mut m), Ok(()));
        assert_eq!(m, 42);
    }

    #[test]
    fn rejected_read_keeps_position() {
        let q = Queue::private(4, QueueType::SingleProducer).unwrap();
        let mut c = q.attach();
        let mut m = 0u32;
        assert!(c.try_consume(&mut m).is_err());
        assert_eq!(c.sequence(), 0);

        for i in 0..9 {
            q.produce(&i);
        }
        let err = c.try_consume(&mut m).unwrap_err();
        assert!(err.is_data_loss());
        assert_eq!(c.sequence(), 0);
        assert_eq!(c.try_consume(&mut m), Err(err));
    }

    #[test]
    fn resync_reports_skipped_messages() {
        let q = Queue::private(8, QueueType::SingleProducer).unwrap();
        let mut c = q.attach();
        for i in 0..30u64 {
            q.produce(&i);
        }
        let mut m = 0;
        assert!(c.try_consume(&mut m).unwrap_err().is_data_loss());

        assert_eq!(c.resync(), 30);
        assert_eq!(c.try_consume(&mut m), Err(ReadError::Empty));
        q.produce(&30);
        assert_eq!(c.try_consume(&mut m), Ok(()));
        assert_eq!(m, 30);
    }

    #[test]
    fn unknown_mode_is_rejected_by_producer_handle() {
        let q = Queue::<u64>::private(8, QueueType::Unknown).unwrap();
        assert!(matches!(Producer::new(&q), Err(IccError::UnknownQueueType)));
        // consumers may still attach
        let mut c = q.attach();
        let mut m = 0;
        assert_eq!(c.try_consume(&mut m), Err(ReadError::Empty));
    }

    #[test]
    #[should_panic(expected = "unknown producer mode")]
    fn unknown_mode_panics_on_produce() {
        let q = Queue::<u64>::private(8, QueueType::Unknown).unwrap();
        q.produce(&1);
    }

    #[test]
    fn capacity_must_be_power_of_two() {
        assert!(matches!(
            Queue::<u64>::private(10, QueueType::SingleProducer),
            Err(IccError::LengthNotPowerOfTwo(10))
        ));
        assert!(matches!(
            Queue::<u64>::private(0, QueueType::SingleProducer),
            Err(IccError::ZeroLength)
        ));
    }

    #[test]
    fn debug_shows_header() {
        let q = Queue::<u64>::private(8, QueueType::MultiProducer).unwrap();
        q.produce(&3);
        let s = format!("{q:?}");
        assert!(s.contains("capacity: 8"), "{s}");
        assert!(s.contains("MultiProducer"), "{s}");
        assert!(s.contains("write_cursor: 1"), "{s}");
    }

    /// Every reader must see every message exactly once. Producers wait
    /// until all readers are attached and the ring is large enough relative to
    /// the pacing that nobody gets sped past; if one is, the test fails.
    fn multithread(n_writers: u64, n_readers: usize, tot_messages: u64) {
        let q = Queue::private(1 << 12, QueueType::MultiProducer).unwrap();
        let start = AtomicBool::new(false);

        std::thread::scope(|s| {
            let mut readers = Vec::new();
            for _ in 0..n_readers {
                let mut c = q.attach();
                let start = &start;
                readers.push(s.spawn(move || {
                    while !start.load(Ordering::Acquire) {
                        std::hint::spin_loop();
                    }
                    let mut seen = 0u64;
                    let mut sum = 0u64;
                    let mut m = 0u64;
                    while seen < tot_messages {
                        match c.try_consume(&mut m) {
                            Ok(()) => {
                                sum += m;
                                seen += 1;
                            }
                            Err(ReadError::Empty) => std::hint::spin_loop(),
                            Err(e) => panic!("reader overtaken: {e}"),
                        }
                    }
                    sum
                }));
            }

            for n in 0..n_writers {
                let mut p = Producer::new(&q).unwrap();
                let start = &start;
                s.spawn(move || {
                    while !start.load(Ordering::Acquire) {
                        std::hint::spin_loop();
                    }
                    let mut i = n;
                    while i < tot_messages {
                        p.produce(&i);
                        i += n_writers;
                        if i % 256 < n_writers {
                            std::thread::yield_now();
                        }
                    }
                });
            }

            start.store(true, Ordering::Release);
            let expected: u64 = (0..tot_messages).sum();
            for r in readers {
                assert_eq!(r.join().unwrap(), expected);
            }
        });
    }

    #[test]
    fn multithread_1_2() {
        multithread(1, 2, 1000);
    }

    #[test]
    fn multithread_2_2() {
        multithread(2, 2, 1000);
    }

    #[test]
    fn multithread_4_4() {
        multithread(4, 4, 2000);
    }
}
