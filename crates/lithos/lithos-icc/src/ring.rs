//! Ring buffer configuration and cursor/version arithmetic.
//!
//! This module provides the foundational primitives for power-of-two rings:
//! - Configuration with capacity validation
//! - Sequence-to-index mapping using bitmasks
//! - The slot version a consumer must expect for a given sequence number

use crate::error::IccError;

/// Configuration for a ring buffer.
///
/// The capacity must always be a power of 2, enabling index calculation via
/// bitmasking instead of modulo.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RingConfig {
    /// Number of slots in the ring. Must be a power of 2.
    pub capacity: usize,
}

impl RingConfig {
    /// Creates a ring configuration with the specified capacity.
    ///
    /// # Example
    /// ```
    /// use lithos_icc::RingConfig;
    /// assert!(RingConfig::new(1024).is_ok());
    /// assert!(RingConfig::new(1000).is_err());
    /// ```
    pub fn new(capacity: usize) -> Result<Self, IccError> {
        if capacity == 0 {
            return Err(IccError::ZeroLength);
        }
        if !capacity.is_power_of_two() {
            return Err(IccError::LengthNotPowerOfTwo(capacity));
        }
        if u32::try_from(capacity).is_err() {
            return Err(IccError::CapacityOverflow(capacity));
        }
        Ok(Self { capacity })
    }

    /// Returns the bitmask for index calculation, `capacity - 1`.
    ///
    /// # Example
    /// ```
    /// use lithos_icc::RingConfig;
    /// let cfg = RingConfig::new(8).unwrap();
    /// assert_eq!(cfg.mask(), 7);  // 0b111 in binary
    /// ```
    #[inline(always)]
    pub fn mask(&self) -> u64 {
        (self.capacity as u64) - 1
    }
}

/// Converts a sequence number to a ring buffer array index.
///
/// With `capacity = 8` (mask = 7 = `0b111`):
/// ```text
/// seq =  0 → 0 & 7 = 0
/// seq =  8 → 8 & 7 = 0  (wraps around)
/// seq = 20 → 20 & 7 = 4
/// ```
#[inline(always)]
pub fn seq_to_index(seq: u64, mask: u64) -> u64 {
    seq & mask
}

/// Version the slot for sequence `seq` carries once that message is published.
///
/// Every lap over the ring rewrites each slot once, and every write adds 2 to
/// the slot's version. Slots start at 0, so the message produced on lap
/// `seq / capacity` leaves its slot at `2 * lap + 2`.
///
/// ```text
/// capacity = 8
/// seq  0..=7  → version 2
/// seq  8..=15 → version 4
/// seq 20      → version 6
/// ```
#[inline(always)]
pub fn expected_version(seq: u64, capacity: u64) -> u64 {
    ((seq / capacity) << 1) + 2
}

/// Moves a consumer one slot forward.
///
/// Wrapping back to index 0 means a full lap was read, so every slot's next
/// message will carry a version 2 higher.
#[inline(always)]
pub fn advance(pos: u64, mask: u64, expected_version: u64) -> (u64, u64) {
    let next = (pos + 1) & mask;
    let bump = if next == 0 { 2 } else { 0 };
    (next, expected_version + bump)
}

/// Inverse of the (index, version) encoding: the sequence number a consumer
/// sitting at `pos` expecting `expected_version` will read next.
#[inline(always)]
pub fn sequence_at(pos: u64, expected_version: u64, capacity: u64) -> u64 {
    ((expected_version - 2) >> 1) * capacity + pos
}
