//! Read-time selection and read-restart arithmetic
//!
//! A [`ConsistentReadPoint`] fixes the snapshot a transaction reads at and
//! tracks everything that can move it:
//!
//! - per-tablet local limits learned from the first read at each tablet
//! - restart suggestions returned by tablets that found an uncertain version
//! - restart lower bounds handed back by finished child transactions
//!
//! ## Restart arithmetic
//!
//! Given the current read time `{read, local_limit, global_limit}` and the
//! largest suggested restart time `r`, the restarted read time is
//! `read' = max(read, r)` with `global_limit' = max(global_limit, r)`.
//! Local limits already established stay in force (clamped to `read'`),
//! since a write a tablet accepted after our first read there happened after
//! that read in real time.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use strata_core::{
    ChildTransactionResult, ClockRef, HybridTime, ReadHybridTime, StrataError, StrataResult,
    TabletId,
};

/// Restart suggestions collected during one statement
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestartTracker {
    suggestions: BTreeMap<TabletId, HybridTime>,
    lower_bound: Option<HybridTime>,
}

impl RestartTracker {
    /// Record that `tablet` asked for a restart at `restart_time`
    ///
    /// Repeated suggestions from one tablet keep the largest.
    pub fn record(&mut self, tablet: TabletId, restart_time: HybridTime) {
        let entry = self.suggestions.entry(tablet).or_insert(restart_time);
        if restart_time > *entry {
            *entry = restart_time;
        }
    }

    /// Record a lower bound that does not belong to any one tablet
    pub fn record_lower_bound(&mut self, time: HybridTime) {
        self.lower_bound = Some(self.lower_bound.map_or(time, |t| t.max(time)));
    }

    /// Largest suggested restart time, if any restart is pending
    pub fn restart_time(&self) -> Option<HybridTime> {
        self.suggestions
            .values()
            .copied()
            .chain(self.lower_bound)
            .max()
    }

    /// Whether any restart is pending
    pub fn is_empty(&self) -> bool {
        self.suggestions.is_empty() && self.lower_bound.is_none()
    }

    /// Tablets that asked for a restart
    pub fn tablets(&self) -> impl Iterator<Item = &TabletId> {
        self.suggestions.keys()
    }

    /// Forget every suggestion
    pub fn clear(&mut self) {
        self.suggestions.clear();
        self.lower_bound = None;
    }
}

#[derive(Debug, Default)]
struct ReadPointState {
    read_time: Option<ReadHybridTime>,
    local_limits: BTreeMap<TabletId, HybridTime>,
    restarts: RestartTracker,
}

/// The snapshot a transaction reads at
#[derive(Debug)]
pub struct ConsistentReadPoint {
    clock: ClockRef,
    state: Mutex<ReadPointState>,
}

impl ConsistentReadPoint {
    /// Read point with no read time picked yet
    pub fn new(clock: ClockRef) -> Self {
        Self {
            clock,
            state: Mutex::new(ReadPointState::default()),
        }
    }

    /// Whether a read time has been fixed
    pub fn is_set(&self) -> bool {
        self.state.lock().read_time.is_some()
    }

    /// Pick a read time from the local clock, discarding any previous state
    pub fn set_current_read_time(&self) -> ReadHybridTime {
        let read_time = self.clock.read_time_now();
        let mut state = self.state.lock();
        *state = ReadPointState {
            read_time: Some(read_time),
            ..Default::default()
        };
        read_time
    }

    /// Adopt an externally chosen read time (explicit, server-picked or inherited)
    pub fn set_read_time(
        &self,
        read_time: ReadHybridTime,
        local_limits: BTreeMap<TabletId, HybridTime>,
    ) -> StrataResult<()> {
        if !read_time.is_valid() || !read_time.is_consistent() {
            return Err(StrataError::invalid_input(format!(
                "inconsistent read time {}",
                read_time
            )));
        }
        let mut state = self.state.lock();
        state.read_time = Some(read_time);
        state.local_limits = local_limits;
        state.restarts.clear();
        Ok(())
    }

    /// Current read time, without per-tablet narrowing
    pub fn read_time(&self) -> Option<ReadHybridTime> {
        self.state.lock().read_time
    }

    /// Read time to send to `tablet`, narrowed by its local limit if known
    pub fn read_time_for(&self, tablet: &TabletId) -> Option<ReadHybridTime> {
        let state = self.state.lock();
        let read_time = state.read_time?;
        Some(match state.local_limits.get(tablet) {
            Some(limit) => read_time.with_local_limit(*limit),
            None => read_time,
        })
    }

    /// Local limits established so far
    pub fn local_limits(&self) -> BTreeMap<TabletId, HybridTime> {
        self.state.lock().local_limits.clone()
    }

    /// Record the clock reading `tablet` returned on its first read
    ///
    /// Only the first observation per tablet counts; later ones are ignored
    /// because a later reading would widen the window.
    pub fn update_local_limit(&self, tablet: &TabletId, tablet_now: HybridTime) {
        let mut state = self.state.lock();
        let Some(read_time) = state.read_time else {
            return;
        };
        if state.local_limits.contains_key(tablet) {
            return;
        }
        let limit = tablet_now.clamp(read_time.read, read_time.global_limit);
        state.local_limits.insert(tablet.clone(), limit);
    }

    /// Record a restart suggestion from `tablet`
    pub fn record_restart(&self, tablet: TabletId, restart_time: HybridTime) {
        self.state.lock().restarts.record(tablet, restart_time);
    }

    /// Whether a restart is pending
    pub fn is_restart_required(&self) -> bool {
        !self.state.lock().restarts.is_empty()
    }

    /// Largest pending restart time
    pub fn restart_time(&self) -> Option<HybridTime> {
        self.state.lock().restarts.restart_time()
    }

    /// Copy of the pending restart suggestions
    pub fn restarts(&self) -> RestartTracker {
        self.state.lock().restarts.clone()
    }

    /// Read time a restarted transaction should use
    ///
    /// Does not modify this read point.
    pub fn restarted_read_time(&self) -> StrataResult<ReadHybridTime> {
        let state = self.state.lock();
        let read_time = state
            .read_time
            .ok_or_else(|| StrataError::invalid_state("read time not picked"))?;
        let restart = state
            .restarts
            .restart_time()
            .ok_or_else(|| StrataError::invalid_state("no restart pending"))?;
        Ok(read_time.restarted_at(restart))
    }

    /// Apply the pending restart in place and return the new read time
    pub fn restart(&self) -> StrataResult<ReadHybridTime> {
        let restarted = self.restarted_read_time()?;
        let mut state = self.state.lock();
        state.read_time = Some(restarted);
        state.restarts.clear();
        Ok(restarted)
    }

    /// Merge the work summary of a finished child
    ///
    /// Local limits take the smaller value per tablet; a child restart bound
    /// becomes a pending restart of this read point.
    pub fn apply_child_result(&self, result: &ChildTransactionResult) {
        let mut state = self.state.lock();
        for (tablet, limit) in &result.local_limits {
            state
                .local_limits
                .entry(tablet.clone())
                .and_modify(|existing| *existing = (*existing).min(*limit))
                .or_insert(*limit);
        }
        if let Some(bound) = result.read_time_lower_bound {
            let below = state.read_time.map_or(true, |rt| rt.read < bound);
            if below {
                state.restarts.record_lower_bound(bound);
            }
        }
    }

    /// Clock this read point picks times from
    pub fn clock(&self) -> &ClockRef {
        &self.clock
    }
}
