//! Clock collaborator
//!
//! Physical time comes from a [`PhysicalClock`]; a [`HybridClock`] layers
//! hybrid-logical semantics on top of it:
//!
//! - `now()` is strictly increasing per clock, even if physical time stalls
//!   or moves backwards
//! - `update(observed)` is called on every message receipt so the next
//!   `now()` is strictly greater than anything the sender had seen
//!
//! Tests control time with [`ManualClock`] and simulate skewed nodes with
//! [`SkewedClock`].

use crate::hybrid_time::{HybridTime, ReadHybridTime};
use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Source of physical time in microseconds since Unix epoch
pub trait PhysicalClock: Send + Sync + fmt::Debug {
    /// Current physical time in microseconds
    fn now_micros(&self) -> u64;
}

/// Wall-clock physical time
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl PhysicalClock for SystemClock {
    fn now_micros(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_micros() as u64
    }
}

/// Physical clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    micros: AtomicU64,
}

impl ManualClock {
    /// Create a manual clock reading `micros`
    pub fn new(micros: u64) -> Self {
        Self {
            micros: AtomicU64::new(micros),
        }
    }

    /// Set the current time
    pub fn set_micros(&self, micros: u64) {
        self.micros.store(micros, Ordering::SeqCst);
    }

    /// Move time forward
    pub fn advance_micros(&self, micros: u64) {
        self.micros.fetch_add(micros, Ordering::SeqCst);
    }
}

impl PhysicalClock for ManualClock {
    fn now_micros(&self) -> u64 {
        self.micros.load(Ordering::SeqCst)
    }
}

/// Physical clock offset from another by an adjustable delta
///
/// Models a node whose clock runs ahead of (positive delta) or behind
/// (negative delta) the reference clock.
#[derive(Debug)]
pub struct SkewedClock {
    inner: Arc<dyn PhysicalClock>,
    delta_us: AtomicI64,
}

impl SkewedClock {
    /// Wrap `inner` with a zero delta
    pub fn new(inner: Arc<dyn PhysicalClock>) -> Self {
        Self {
            inner,
            delta_us: AtomicI64::new(0),
        }
    }

    /// Set the delta, returning the previous one
    pub fn set_delta_us(&self, delta_us: i64) -> i64 {
        self.delta_us.swap(delta_us, Ordering::SeqCst)
    }

    /// Current delta in microseconds
    pub fn delta_us(&self) -> i64 {
        self.delta_us.load(Ordering::SeqCst)
    }

    /// Apply `delta_us` until the returned guard is dropped
    pub fn delta_guard(self: &Arc<Self>, delta_us: i64) -> DeltaGuard {
        let previous = self.set_delta_us(delta_us);
        DeltaGuard {
            clock: Arc::clone(self),
            previous,
        }
    }
}

impl PhysicalClock for SkewedClock {
    fn now_micros(&self) -> u64 {
        let base = self.inner.now_micros();
        let delta = self.delta_us.load(Ordering::SeqCst);
        if delta >= 0 {
            base.saturating_add(delta as u64)
        } else {
            base.saturating_sub(delta.unsigned_abs())
        }
    }
}

/// Restores a [`SkewedClock`] delta on drop
#[must_use = "the delta is reverted when the guard is dropped"]
pub struct DeltaGuard {
    clock: Arc<SkewedClock>,
    previous: i64,
}

impl Drop for DeltaGuard {
    fn drop(&mut self) {
        self.clock.set_delta_us(self.previous);
    }
}

/// Hybrid clock interface consumed by the transaction protocol
pub trait ClockSource: Send + Sync + fmt::Debug {
    /// Strictly increasing hybrid time
    fn now(&self) -> HybridTime;

    /// `(now, now + max_clock_skew)`
    fn now_range(&self) -> (HybridTime, HybridTime);

    /// Advance so the next `now()` is strictly greater than `observed`
    fn update(&self, observed: HybridTime);

    /// Bound on clock skew between any two nodes
    fn max_clock_skew_us(&self) -> u64;

    /// A fresh read time at `now()` with the skew window attached
    fn read_time_now(&self) -> ReadHybridTime {
        ReadHybridTime::from_time_and_skew(self.now(), self.max_clock_skew_us())
    }
}

/// Shared handle to a clock
pub type ClockRef = Arc<dyn ClockSource>;

/// Hybrid-logical clock over a physical clock
pub struct HybridClock {
    physical: Arc<dyn PhysicalClock>,
    last: AtomicU64,
    max_clock_skew_us: u64,
}

impl HybridClock {
    /// Create a hybrid clock over `physical`
    pub fn new(physical: Arc<dyn PhysicalClock>, max_clock_skew_us: u64) -> Self {
        Self {
            physical,
            last: AtomicU64::new(HybridTime::MIN.to_u64()),
            max_clock_skew_us,
        }
    }

    /// Hybrid clock over wall-clock time
    pub fn system(max_clock_skew_us: u64) -> Self {
        Self::new(Arc::new(SystemClock), max_clock_skew_us)
    }

    /// Last issued or observed time, without advancing
    pub fn peek(&self) -> HybridTime {
        HybridTime::from_u64(self.last.load(Ordering::SeqCst))
    }
}

impl fmt::Debug for HybridClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HybridClock")
            .field("last", &self.peek())
            .field("max_clock_skew_us", &self.max_clock_skew_us)
            .finish()
    }
}

impl ClockSource for HybridClock {
    fn now(&self) -> HybridTime {
        let physical = HybridTime::from_micros(self.physical.now_micros());
        let mut current = self.last.load(Ordering::SeqCst);
        loop {
            let next = physical
                .max(HybridTime::from_u64(current).incremented())
                .max(HybridTime::INITIAL);
            match self.last.compare_exchange_weak(
                current,
                next.to_u64(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }

    fn now_range(&self) -> (HybridTime, HybridTime) {
        let now = self.now();
        (now, now.add_micros(self.max_clock_skew_us))
    }

    fn update(&self, observed: HybridTime) {
        if observed.is_valid() {
            self.last.fetch_max(observed.to_u64(), Ordering::SeqCst);
        }
    }

    fn max_clock_skew_us(&self) -> u64 {
        self.max_clock_skew_us
    }
}
