//! Hybrid timestamps and read times
//!
//! A [`HybridTime`] combines a physical component (microseconds since Unix
//! epoch) with a logical counter, packed into a single `u64`:
//!
//! ```text
//! | 52 bits physical microseconds | 12 bits logical |
//! ```
//!
//! Packing keeps the type `Copy` and totally ordered by plain integer
//! comparison. The logical counter disambiguates events that share a
//! physical microsecond and lets a clock move strictly forward after
//! observing a timestamp from another node.
//!
//! A [`ReadHybridTime`] is the snapshot a transaction reads at, together with
//! the uncertainty window `(read, global_limit]` caused by clock skew.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of bits reserved for the logical component
pub const LOGICAL_BITS: u32 = 12;

const LOGICAL_MASK: u64 = (1 << LOGICAL_BITS) - 1;

/// Totally ordered physical+logical timestamp
///
/// ## Invariants
///
/// - Ordering is the ordering of the packed `u64`
/// - `INVALID` sorts after every valid time and is never issued by a clock
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HybridTime(u64);

impl HybridTime {
    /// Smallest representable time
    pub const MIN: HybridTime = HybridTime(0);

    /// First time a fresh clock may issue
    pub const INITIAL: HybridTime = HybridTime(1);

    /// Largest valid time
    pub const MAX: HybridTime = HybridTime(u64::MAX - 1);

    /// Sentinel for "no time"
    pub const INVALID: HybridTime = HybridTime(u64::MAX);

    // =========================================================================
    // Constructors
    // =========================================================================

    /// Create a hybrid time from physical microseconds with logical zero
    #[inline]
    pub const fn from_micros(micros: u64) -> Self {
        HybridTime(micros << LOGICAL_BITS)
    }

    /// Create a hybrid time from both components
    ///
    /// The logical component is truncated to [`LOGICAL_BITS`].
    #[inline]
    pub const fn from_parts(micros: u64, logical: u64) -> Self {
        HybridTime((micros << LOGICAL_BITS) | (logical & LOGICAL_MASK))
    }

    /// Reconstruct from the packed representation
    #[inline]
    pub const fn from_u64(raw: u64) -> Self {
        HybridTime(raw)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Packed representation
    #[inline]
    pub const fn to_u64(self) -> u64 {
        self.0
    }

    /// Physical component in microseconds
    #[inline]
    pub const fn physical_micros(self) -> u64 {
        self.0 >> LOGICAL_BITS
    }

    /// Logical component
    #[inline]
    pub const fn logical(self) -> u64 {
        self.0 & LOGICAL_MASK
    }

    /// Whether this is a real time rather than the `INVALID` sentinel
    #[inline]
    pub const fn is_valid(self) -> bool {
        self.0 != u64::MAX
    }

    // =========================================================================
    // Arithmetic
    // =========================================================================

    /// Add physical microseconds, saturating at `MAX`
    pub fn add_micros(self, micros: u64) -> Self {
        if !self.is_valid() {
            return self;
        }
        let delta = micros.saturating_mul(1 << LOGICAL_BITS);
        HybridTime(self.0.saturating_add(delta).min(Self::MAX.0))
    }

    /// Subtract physical microseconds, saturating at `MIN`
    pub fn sub_micros(self, micros: u64) -> Self {
        if !self.is_valid() {
            return self;
        }
        let delta = micros.saturating_mul(1 << LOGICAL_BITS);
        HybridTime(self.0.saturating_sub(delta))
    }

    /// The next representable time
    pub fn incremented(self) -> Self {
        HybridTime(self.0.saturating_add(1).min(Self::MAX.0))
    }

    /// The previous representable time
    pub fn decremented(self) -> Self {
        HybridTime(self.0.saturating_sub(1))
    }

    /// Physical distance from `earlier` in microseconds, zero if `earlier` is later
    pub fn micros_since(self, earlier: HybridTime) -> u64 {
        self.physical_micros()
            .saturating_sub(earlier.physical_micros())
    }
}

impl Default for HybridTime {
    fn default() -> Self {
        HybridTime::INVALID
    }
}

impl fmt::Debug for HybridTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for HybridTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.is_valid() {
            return write!(f, "<invalid>");
        }
        if self.logical() == 0 {
            write!(f, "{}", self.physical_micros())
        } else {
            write!(f, "{}.{}", self.physical_micros(), self.logical())
        }
    }
}

/// Snapshot read time with its clock-skew uncertainty window
///
/// `read` is the snapshot instant. `global_limit = read + max_clock_skew` is
/// the latest time at which a write not yet observed could still belong to
/// this reader's past. `local_limit` narrows the window for one tablet once
/// that tablet's clock has been observed.
///
/// Invariant: `read <= local_limit <= global_limit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReadHybridTime {
    /// Snapshot instant
    pub read: HybridTime,
    /// Uncertainty limit for the tablet this read time is sent to
    pub local_limit: HybridTime,
    /// Uncertainty limit across all tablets
    pub global_limit: HybridTime,
}

impl ReadHybridTime {
    /// A read time without an uncertainty window
    pub fn single_time(time: HybridTime) -> Self {
        Self {
            read: time,
            local_limit: time,
            global_limit: time,
        }
    }

    /// Read at `read` with a window of `max_clock_skew_us`
    pub fn from_time_and_skew(read: HybridTime, max_clock_skew_us: u64) -> Self {
        let global_limit = read.add_micros(max_clock_skew_us);
        Self {
            read,
            local_limit: global_limit,
            global_limit,
        }
    }

    /// Read time to retry with after finding a version at `restart`
    ///
    /// The read moves up to `restart`; the window widens to keep covering
    /// the new read and the local limit resets to the global one.
    pub fn restarted_at(self, restart: HybridTime) -> Self {
        let read = self.read.max(restart);
        let global_limit = self.global_limit.max(read);
        Self {
            read,
            local_limit: global_limit,
            global_limit,
        }
    }

    /// Whether the read instant is set
    pub fn is_valid(&self) -> bool {
        self.read.is_valid()
    }

    /// Copy of this read time with `local_limit` narrowed to `limit`
    ///
    /// The result is clamped so the invariant holds.
    pub fn with_local_limit(self, limit: HybridTime) -> Self {
        Self {
            local_limit: limit.clamp(self.read, self.global_limit),
            ..self
        }
    }

    /// Whether a version written at `time` is uncertain for this reader
    ///
    /// Such a version may have happened before the read in real time even
    /// though its timestamp is larger than `read`.
    pub fn is_uncertain(&self, time: HybridTime) -> bool {
        time > self.read && time <= self.local_limit
    }

    /// Whether this read time satisfies `read <= local_limit <= global_limit`
    pub fn is_consistent(&self) -> bool {
        self.read <= self.local_limit && self.local_limit <= self.global_limit
    }
}

impl fmt::Display for ReadHybridTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{ read: {} local_limit: {} global_limit: {} }}",
            self.read, self.local_limit, self.global_limit
        )
    }
}
