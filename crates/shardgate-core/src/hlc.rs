//! Hybrid Logical Clock (HLC) used to stamp consistency records.
//!
//! HLC combines physical wall-clock time with a logical counter so that every
//! stamp handed out by one process is strictly greater than the previous one,
//! even when the wall clock stalls or steps backwards.
//!
//! # Format
//!
//! The timestamp is packed into a 64-bit value:
//! - Bits 16-63 (48 bits): Physical time in milliseconds since Unix epoch
//! - Bits 0-15 (16 bits): Logical counter
//!
//! Raw u64 comparison orders timestamps by physical time, then counter.
//!
//! # Example
//!
//! ```
//! use shardgate_core::hlc::{HlcClock, HlcTimestamp};
//!
//! let clock = HlcClock::new();
//! let ts1 = clock.now();
//! let ts2 = clock.now();
//! assert!(ts2 > ts1);
//!
//! // A stamp read back from storage pushes the clock forward.
//! let stored = HlcTimestamp::from_parts(ts2.physical_time() + 5_000, 3);
//! clock.observe(stored);
//! assert!(clock.now() > stored);
//!
//! // Stamps from far in the future are refused before they reach the clock.
//! let bogus = HlcTimestamp::from_raw(u64::MAX);
//! assert!(clock.validate_timestamp(bogus).is_err());
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum distance a stamp taken from outside this clock may lie ahead of
/// the local wall clock.
pub const MAX_CLOCK_SKEW_MS: u64 = 500;

/// Error type for HLC operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClockError {
    /// The stamp is too far in the future.
    #[error(
        "clock skew violation: timestamp {remote_ms}ms is {skew_ms}ms ahead of local time \
         (max allowed: {max_skew_ms}ms)"
    )]
    ClockSkewViolation {
        /// Physical time of the rejected stamp in milliseconds.
        remote_ms: u64,
        /// Observed skew in milliseconds.
        skew_ms: u64,
        /// Maximum allowed skew in milliseconds.
        max_skew_ms: u64,
    },
}

/// Result type for HLC operations.
pub type ClockResult<T> = std::result::Result<T, ClockError>;

const LOGICAL_MASK: u64 = 0x0000_0000_0000_FFFF;
const LOGICAL_BITS: u32 = 16;
const MAX_LOGICAL: u16 = u16::MAX;
const MAX_PHYSICAL: u64 = u64::MAX >> LOGICAL_BITS;

/// A hybrid logical clock timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct HlcTimestamp(u64);

impl HlcTimestamp {
    /// Creates a new timestamp with the given physical time and logical counter.
    #[must_use]
    pub const fn from_parts(physical_ms: u64, logical: u16) -> Self {
        Self((physical_ms << LOGICAL_BITS) | (logical as u64))
    }

    /// Creates a timestamp from a raw packed u64 value.
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw packed u64 value.
    #[must_use]
    pub const fn as_raw(&self) -> u64 {
        self.0
    }

    /// Returns the physical time component in milliseconds since Unix epoch.
    #[must_use]
    pub const fn physical_time(&self) -> u64 {
        self.0 >> LOGICAL_BITS
    }

    /// Returns the logical counter component.
    #[must_use]
    pub const fn logical(&self) -> u16 {
        (self.0 & LOGICAL_MASK) as u16
    }

    /// Creates a zero timestamp (epoch).
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }

    /// Returns the successor of this timestamp within the same millisecond
    /// when possible. Saturates at the largest representable stamp.
    #[must_use]
    const fn next(&self) -> Self {
        let logical = self.logical();
        if logical < MAX_LOGICAL - 1 {
            Self::from_parts(self.physical_time(), logical + 1)
        } else if self.physical_time() < MAX_PHYSICAL {
            Self::from_parts(self.physical_time() + 1, 0)
        } else {
            Self(u64::MAX)
        }
    }
}

impl Default for HlcTimestamp {
    fn default() -> Self {
        Self::zero()
    }
}

impl std::fmt::Display for HlcTimestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.physical_time(), self.logical())
    }
}

impl From<u64> for HlcTimestamp {
    fn from(raw: u64) -> Self {
        Self::from_raw(raw)
    }
}

impl From<HlcTimestamp> for u64 {
    fn from(ts: HlcTimestamp) -> Self {
        ts.as_raw()
    }
}

/// A lock-free hybrid logical clock.
#[derive(Debug, Default)]
pub struct HlcClock {
    last: AtomicU64,
}

impl HlcClock {
    /// Creates a new HLC clock.
    #[must_use]
    pub fn new() -> Self {
        Self { last: AtomicU64::new(0) }
    }

    /// Generates a new timestamp for a local event.
    ///
    /// The returned timestamp is strictly greater than any timestamp
    /// previously returned or observed by this clock.
    pub fn now(&self) -> HlcTimestamp {
        let wall = wall_clock_ms();

        loop {
            let last = self.last.load(Ordering::Acquire);
            let last_ts = HlcTimestamp::from_raw(last);

            let new_ts = if wall > last_ts.physical_time() {
                HlcTimestamp::from_parts(wall, 0)
            } else {
                last_ts.next()
            };

            if self
                .last
                .compare_exchange(last, new_ts.as_raw(), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return new_ts;
            }
        }
    }

    /// Checks that a stamp taken from outside this clock is not more than
    /// [`MAX_CLOCK_SKEW_MS`] ahead of the local wall clock.
    ///
    /// # Errors
    ///
    /// Returns [`ClockError::ClockSkewViolation`] for stamps further ahead.
    pub fn validate_timestamp(&self, remote: HlcTimestamp) -> ClockResult<()> {
        let wall = wall_clock_ms();
        let remote_physical = remote.physical_time();

        if remote_physical > wall.saturating_add(MAX_CLOCK_SKEW_MS) {
            return Err(ClockError::ClockSkewViolation {
                remote_ms: remote_physical,
                skew_ms: remote_physical - wall,
                max_skew_ms: MAX_CLOCK_SKEW_MS,
            });
        }
        Ok(())
    }

    /// Advances the clock so that it never hands out a stamp at or below
    /// `seen`. Does not generate a new timestamp.
    pub fn observe(&self, seen: HlcTimestamp) {
        self.last.fetch_max(seen.as_raw(), Ordering::AcqRel);
    }

    /// Returns the current timestamp without advancing the clock.
    #[must_use]
    pub fn current(&self) -> HlcTimestamp {
        HlcTimestamp::from_raw(self.last.load(Ordering::Acquire))
    }
}

/// Returns the current wall clock time in milliseconds since Unix epoch.
fn wall_clock_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
