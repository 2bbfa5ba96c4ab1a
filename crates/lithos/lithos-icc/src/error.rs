//! Error types for cell reads and for building queues and vectors.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Outcome of a versioned read that did not yield a value.
///
/// Both variants are part of normal polling; neither leaves the consumer in a
/// broken state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ReadError {
    /// The message for this slot has not been produced yet.
    #[error("no message produced at this slot yet")]
    Empty,

    /// The slot was overwritten before this consumer got to it.
    ///
    /// `found - expected` is twice the number of laps the producer has
    /// completed past the consumer on this slot.
    #[error("sped past: expected slot version {expected}, found {found}")]
    SpedPast { expected: u64, found: u64 },
}

impl ReadError {
    /// `true` for [`ReadError::Empty`]: back off and poll again.
    #[inline]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Empty)
    }

    /// `true` for [`ReadError::SpedPast`]: messages were lost.
    #[inline]
    pub fn is_data_loss(&self) -> bool {
        matches!(self, Self::SpedPast { .. })
    }
}

/// Failures creating, opening or addressing a queue or vector.
#[derive(Debug, Error)]
pub enum IccError {
    #[error("queue capacity {0} is not a power of two")]
    LengthNotPowerOfTwo(usize),

    #[error("queue capacity must be non-zero")]
    ZeroLength,

    #[error("capacity {0} does not fit the shared header")]
    CapacityOverflow(usize),

    #[error("existing segment '{}' holds {existing} elements, {requested} requested", path.display())]
    SegmentTooSmall {
        path: PathBuf,
        requested: usize,
        existing: usize,
    },

    #[error("unable to create or open shared segment '{}'", path.display())]
    CreateOrOpenFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("shared segment header is not initialized yet")]
    Uninitialized,

    #[error("element size mismatch: expected {expected} bytes per cell, header says {found}")]
    ElementSizeMismatch { expected: usize, found: usize },

    #[error("segment is laid out for {found:?} production, {requested:?} requested")]
    QueueTypeMismatch {
        requested: crate::QueueType,
        found: crate::QueueType,
    },

    #[error("queue producer mode is unknown; production is not allowed")]
    UnknownQueueType,

    #[error("segment is {actual} bytes, header describes {needed}")]
    Truncated { needed: usize, actual: usize },

    #[error("index {index} out of bounds for length {len}")]
    OutOfBounds { index: usize, len: usize },
}
