//! One tablet: a participant and a status coordinator sharing a clock

use std::sync::Arc;
use strata_concurrency::ConflictResolver;
use strata_core::{ClockRef, HybridClock, PhysicalClock, SkewedClock, TabletId};
use strata_storage::Participant;

use crate::config::TxnConfig;
use crate::coordinator::{CoordinatorOptions, StatusCoordinator};

/// A tablet with its own hybrid clock
///
/// The physical clock is a [`SkewedClock`] so tests can make one tablet lag
/// or lead the rest of the cluster.
#[derive(Debug)]
pub struct Tablet {
    id: TabletId,
    physical: Arc<SkewedClock>,
    clock: ClockRef,
    participant: Participant,
    coordinator: StatusCoordinator,
}

impl Tablet {
    /// Create a tablet whose clock follows `base`
    pub fn new(
        id: TabletId,
        base: Arc<dyn PhysicalClock>,
        config: &TxnConfig,
        resolver: ConflictResolver,
    ) -> Self {
        let physical = Arc::new(SkewedClock::new(base));
        let clock: ClockRef = Arc::new(HybridClock::new(
            physical.clone(),
            config.max_clock_skew_us,
        ));
        let participant = Participant::new(
            id.clone(),
            Arc::clone(&clock),
            resolver,
            config.participant_options(),
        );
        let coordinator = StatusCoordinator::new(
            id.clone(),
            Arc::clone(&clock),
            CoordinatorOptions::from_config(config),
        );
        Self {
            id,
            physical,
            clock,
            participant,
            coordinator,
        }
    }

    /// Tablet id
    pub fn id(&self) -> &TabletId {
        &self.id
    }

    /// Hybrid clock of this tablet
    pub fn clock(&self) -> &ClockRef {
        &self.clock
    }

    /// Physical clock, for skew injection
    pub fn physical_clock(&self) -> &Arc<SkewedClock> {
        &self.physical
    }

    /// Intent and version store
    pub fn participant(&self) -> &Participant {
        &self.participant
    }

    /// Status table
    pub fn coordinator(&self) -> &StatusCoordinator {
        &self.coordinator
    }
}
