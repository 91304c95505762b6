//! Committed versions of one key
//!
//! Versions are kept newest-first so snapshot reads stop at the first
//! version at or below their read time. Commit times normally arrive in
//! increasing order, but a commit time chosen by a coordinator whose clock
//! runs ahead can land after a later local write is already stored, so
//! insertion keeps the order explicitly.

use std::collections::VecDeque;
use strata_core::{HybridTime, IntentValue};

/// One committed write
#[derive(Debug, Clone, PartialEq)]
pub struct CommittedVersion {
    /// Commit time of the writing transaction
    pub commit_time: HybridTime,
    /// Value or tombstone
    pub value: IntentValue,
}

/// Version chain for MVCC, newest first
#[derive(Debug, Clone, Default)]
pub struct VersionChain {
    versions: VecDeque<CommittedVersion>,
}

impl VersionChain {
    /// Insert a committed version, keeping newest-first order
    pub fn insert(&mut self, version: CommittedVersion) {
        match self.versions.front() {
            Some(newest) if newest.commit_time > version.commit_time => {
                let pos = self
                    .versions
                    .iter()
                    .position(|v| v.commit_time <= version.commit_time)
                    .unwrap_or(self.versions.len());
                self.versions.insert(pos, version);
            }
            _ => self.versions.push_front(version),
        }
    }

    /// Newest version committed at or before `time`
    pub fn at_or_before(&self, time: HybridTime) -> Option<&CommittedVersion> {
        self.versions.iter().find(|v| v.commit_time <= time)
    }

    /// Newest version overall
    pub fn latest(&self) -> Option<&CommittedVersion> {
        self.versions.front()
    }

    /// Number of versions stored
    pub fn len(&self) -> usize {
        self.versions.len()
    }

    /// Whether no version is stored
    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }

    /// Commit times, newest first
    pub fn commit_times(&self) -> impl Iterator<Item = HybridTime> + '_ {
        self.versions.iter().map(|v| v.commit_time)
    }
}
