//! Lock-free inter-core / inter-process communication primitives.
//!
//! - [`Seqlock`]: one value, one writer at a time, many readers
//! - [`Queue`]: broadcast ring of seqlocks; every consumer sees every message
//! - [`SeqlockVector`]: indexable seqlocks for "latest value" publication
//!
//! Queues and vectors live either in private memory or in a named shared
//! segment any number of processes can attach to. Dropping a handle unmaps it;
//! only [`destroy_shared`] removes the segment.

mod backing;
mod error;
mod queue;
mod ring;
mod seqlock;
mod shm_layout;
mod vector;

pub use error::{IccError, ReadError};
pub use queue::{Consumer, Producer, Queue};
pub use ring::RingConfig;
pub use seqlock::Seqlock;
pub use shm_layout::{QueueHeader, QueueType, VectorHeader, bytes_for_queue, bytes_for_vector};
pub use vector::{Iter, SeqlockVector};

/// Removes a named shared queue or vector.
///
/// Processes that still have it mapped keep working on their mapping; new
/// attaches will create a fresh segment.
pub fn destroy_shared<P: AsRef<std::path::Path>>(path: P) -> std::io::Result<()> {
    lithos_mmap::ShmSegment::destroy(path)
}
