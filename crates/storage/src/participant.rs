//! Per-tablet MVCC store with provisional writes
//!
//! A [`Participant`] holds, for every key of one tablet:
//! - the committed versions, newest first
//! - at most one intent (provisional write) of a transaction that has not
//!   been resolved here yet
//!
//! # Concurrency
//!
//! - Key entries live in a sharded `DashMap`; a shard lock is never held
//!   across an RPC. Reads and writes snapshot the entry, resolve any foreign
//!   intent through the owner's status tablet, then re-lock and re-check.
//! - The per-transaction intent index is a second map. The two maps are never
//!   locked at the same time.
//!
//! # Visibility
//!
//! - A reader sees its own transaction's intent (read-your-writes)
//! - A foreign intent is resolved via `GetStatus`: COMMITTED intents are
//!   applied, ABORTED (or unknown) ones discarded, PENDING ones ignored. The
//!   status query carries the reader's `global_limit`, so a PENDING owner can
//!   only commit above the reader's uncertainty window.
//! - A committed version inside `(read, local_limit]` makes the read uncertain
//!   and yields `RestartRequired` at that version's commit time.

use crate::version_chain::{CommittedVersion, VersionChain};
use dashmap::DashMap;
use rustc_hash::FxHasher;
use std::collections::BTreeSet;
use std::hash::BuildHasherDefault;
use std::sync::atomic::{AtomicU64, Ordering};
use strata_concurrency::{CommittedConflict, ConflictResolver, Contender, Resolution};
use strata_core::{
    AbortReason, ApplyRequest, ClockRef, GetStatusRequest, HybridTime, IntentValue, Key,
    ReadHybridTime, ReadRequest, ReadResponse, ReadResult, StatusResponse, StatusUpdate,
    StrataError, StrataResult, TabletId, TransactionId, TransactionMetadata, TransactionRpc,
    TransactionStatus, UpdateStatusRequest, Value, WriteRequest, WriteResponse,
};
use tracing::{debug, info, warn};

type FxBuildHasher = BuildHasherDefault<FxHasher>;

/// Tunables for a participant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParticipantOptions {
    /// Age after which compaction resolves intents on its own
    pub aborted_intent_cleanup_us: u64,
    /// Rounds of intent resolution one read or write may go through
    pub max_resolve_attempts: usize,
}

impl Default for ParticipantOptions {
    fn default() -> Self {
        Self {
            aborted_intent_cleanup_us: 60_000_000,
            max_resolve_attempts: 16,
        }
    }
}

#[derive(Debug, Clone)]
struct Intent {
    transaction: TransactionMetadata,
    value: IntentValue,
    write_time: HybridTime,
}

#[derive(Debug, Default)]
struct KeyEntry {
    versions: VersionChain,
    intent: Option<Intent>,
}

#[derive(Debug)]
struct TransactionIntents {
    metadata: TransactionMetadata,
    keys: BTreeSet<Key>,
    first_write_time: HybridTime,
}

/// What a key looked like when it was last inspected
struct KeySnapshot {
    intent: Option<Intent>,
    latest_commit: Option<HybridTime>,
}

/// Counter snapshot of one participant
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParticipantStats {
    /// Reads served
    pub reads: u64,
    /// Writes accepted
    pub writes: u64,
    /// Reads answered with `RestartRequired`
    pub restarts: u64,
    /// Writes rejected with `Conflict`
    pub conflicts: u64,
    /// Intents converted into committed versions
    pub applied_intents: u64,
    /// Intents removed because their owner aborted
    pub discarded_intents: u64,
}

#[derive(Debug, Default)]
struct Counters {
    reads: AtomicU64,
    writes: AtomicU64,
    restarts: AtomicU64,
    conflicts: AtomicU64,
    applied_intents: AtomicU64,
    discarded_intents: AtomicU64,
}

/// Outcome of one compaction pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactionStats {
    /// Transactions old enough to be checked
    pub examined: usize,
    /// Intents applied because their owner committed
    pub applied_intents: usize,
    /// Intents dropped because their owner aborted or is unknown
    pub discarded_intents: usize,
}

/// Storage side of the transaction protocol for one tablet
#[derive(Debug)]
pub struct Participant {
    tablet_id: TabletId,
    clock: ClockRef,
    resolver: ConflictResolver,
    options: ParticipantOptions,
    keys: DashMap<Key, KeyEntry, FxBuildHasher>,
    transactions: DashMap<TransactionId, TransactionIntents, FxBuildHasher>,
    counters: Counters,
}

impl Participant {
    /// Create an empty participant for `tablet_id`
    pub fn new(
        tablet_id: TabletId,
        clock: ClockRef,
        resolver: ConflictResolver,
        options: ParticipantOptions,
    ) -> Self {
        Self {
            tablet_id,
            clock,
            resolver,
            options,
            keys: DashMap::with_hasher(FxBuildHasher::default()),
            transactions: DashMap::with_hasher(FxBuildHasher::default()),
            counters: Counters::default(),
        }
    }

    /// Tablet this participant serves
    pub fn tablet_id(&self) -> &TabletId {
        &self.tablet_id
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Read one key at the requested (or a tablet-picked) read time
    pub fn read(&self, req: ReadRequest, rpc: &dyn TransactionRpc) -> StrataResult<ReadResponse> {
        self.clock.update(req.propagated_time);
        let read_time = match req.read_time {
            Some(rt) if !rt.is_valid() || !rt.is_consistent() => {
                return Err(StrataError::invalid_input(format!(
                    "inconsistent read time {}",
                    rt
                )));
            }
            Some(rt) => rt,
            None => {
                // Everything this tablet accepted so far is below `now`
                let now = self.clock.now();
                ReadHybridTime::from_time_and_skew(now, self.clock.max_clock_skew_us())
                    .with_local_limit(now)
            }
        };
        // A read time nobody has seen yet can move forward here instead of
        // sending the restart back to the caller
        let picked_here = req.read_time.is_none();
        let reader = req.transaction.as_ref().map(|m| m.transaction_id);
        let mut read_time = read_time;
        let mut server_restarts = 0;
        self.counters.reads.fetch_add(1, Ordering::Relaxed);
        let (result, tablet_now) = loop {
            let tablet_now = self.clock.now();
            let effective = read_time.with_local_limit(read_time.local_limit.min(tablet_now));
            let result = self.read_key(&req.key, reader, &effective, rpc)?;
            let restart_time = match result {
                ReadResult::RestartRequired(restart_time) => restart_time,
                ReadResult::Value(_) => break (result, tablet_now),
            };
            self.counters.restarts.fetch_add(1, Ordering::Relaxed);
            if picked_here && server_restarts < self.options.max_resolve_attempts {
                debug!(
                    target: "strata::participant",
                    tablet = %self.tablet_id,
                    key = %req.key,
                    read_time = %effective,
                    %restart_time,
                    "Restarting tablet-picked read"
                );
                read_time = read_time.restarted_at(restart_time);
                server_restarts += 1;
                continue;
            }
            debug!(
                target: "strata::participant",
                tablet = %self.tablet_id,
                key = %req.key,
                read_time = %effective,
                %restart_time,
                "Uncertain version found, restart required"
            );
            break (result, tablet_now);
        };
        if picked_here {
            read_time = read_time.with_local_limit(tablet_now);
        }

        Ok(ReadResponse {
            result,
            used_read_time: read_time,
            local_limit: tablet_now.clamp(read_time.read, read_time.global_limit),
            propagated_time: self.clock.now(),
        })
    }

    fn read_key(
        &self,
        key: &Key,
        reader: Option<TransactionId>,
        read_time: &ReadHybridTime,
        rpc: &dyn TransactionRpc,
    ) -> StrataResult<ReadResult> {
        let mut read_time = *read_time;
        for _ in 0..self.options.max_resolve_attempts {
            let (intent, visible) = match self.keys.get(key) {
                None => return Ok(ReadResult::Value(None)),
                Some(entry) => (
                    entry.intent.clone(),
                    entry.versions.at_or_before(read_time.local_limit).cloned(),
                ),
            };

            if let Some(intent) = intent {
                if Some(intent.transaction.transaction_id) == reader {
                    return Ok(ReadResult::Value(intent.value.visible_value()));
                }
                // A commit time always exceeds the write time, so intents
                // written above the window cannot become visible to us.
                if intent.write_time <= read_time.local_limit {
                    let propagated = read_time.global_limit.max(self.clock.now());
                    let status = self.resolve_holder(key, &intent.transaction, propagated, rpc)?;
                    if status.is_terminal() {
                        // The commit time came from the owner's status tablet,
                        // not from this tablet's clock
                        read_time.local_limit = read_time.global_limit;
                        continue;
                    }
                }
            }

            return Ok(match visible {
                Some(v) if v.commit_time > read_time.read => {
                    ReadResult::RestartRequired(v.commit_time)
                }
                Some(v) => ReadResult::Value(v.value.visible_value()),
                None => ReadResult::Value(None),
            });
        }
        Err(StrataError::TimedOut(format!(
            "intents on key {} kept changing while reading",
            key
        )))
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Write one key: an intent for transactional writes, a committed version
    /// for non-transactional ones
    pub fn write(
        &self,
        req: WriteRequest,
        rpc: &dyn TransactionRpc,
    ) -> StrataResult<WriteResponse> {
        self.clock.update(req.propagated_time);
        let response = match &req.transaction {
            Some(metadata) => self.write_intent(metadata, &req, rpc),
            None => self.write_direct(&req, rpc),
        };
        match &response {
            Ok(_) => {
                self.counters.writes.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) if e.is_retryable() => {
                self.counters.conflicts.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {}
        }
        response
    }

    fn write_intent(
        &self,
        metadata: &TransactionMetadata,
        req: &WriteRequest,
        rpc: &dyn TransactionRpc,
    ) -> StrataResult<WriteResponse> {
        let me = Contender::transaction(metadata);
        let id = metadata.transaction_id;
        for _ in 0..self.options.max_resolve_attempts {
            let snapshot = self.snapshot(&req.key);
            if let Some(holder) = snapshot.intent.filter(|i| i.transaction.transaction_id != id) {
                self.contend(&req.key, &me, &holder.transaction, rpc)?;
                continue;
            }

            if let (Some(read_time), Some(latest)) = (req.read_time, snapshot.latest_commit) {
                if self.resolver.classify_committed(latest, read_time.read)
                    == CommittedConflict::Newer
                {
                    warn!(
                        target: "strata::participant",
                        tablet = %self.tablet_id,
                        txn_id = %id,
                        key = %req.key,
                        commit_time = %latest,
                        read_time = %read_time.read,
                        "Write conflicts with a newer committed version"
                    );
                    return Err(StrataError::conflict(format!(
                        "key {} was committed at {} after read time {}",
                        req.key, latest, read_time.read
                    )));
                }
            }

            let write_time = self.clock.now();
            let installed = {
                let mut entry = self.keys.entry(req.key.clone()).or_default();
                let blocked = entry
                    .intent
                    .as_ref()
                    .map_or(false, |i| i.transaction.transaction_id != id);
                let moved = entry.versions.latest().map(|v| v.commit_time) != snapshot.latest_commit;
                if blocked || moved {
                    false
                } else {
                    entry.intent = Some(Intent {
                        transaction: metadata.clone(),
                        value: req.value.clone(),
                        write_time,
                    });
                    true
                }
            };
            if !installed {
                continue;
            }

            self.transactions
                .entry(id)
                .or_insert_with(|| TransactionIntents {
                    metadata: metadata.clone(),
                    keys: BTreeSet::new(),
                    first_write_time: write_time,
                })
                .keys
                .insert(req.key.clone());
            debug!(
                target: "strata::participant",
                tablet = %self.tablet_id,
                txn_id = %id,
                key = %req.key,
                %write_time,
                "Intent written"
            );
            return Ok(WriteResponse {
                write_time,
                propagated_time: self.clock.now(),
            });
        }
        Err(StrataError::conflict(format!(
            "key {} stayed contended after {} attempts",
            req.key, self.options.max_resolve_attempts
        )))
    }

    fn write_direct(
        &self,
        req: &WriteRequest,
        rpc: &dyn TransactionRpc,
    ) -> StrataResult<WriteResponse> {
        let me = Contender::non_transactional();
        for _ in 0..self.options.max_resolve_attempts {
            if let Some(holder) = self.snapshot(&req.key).intent {
                self.contend(&req.key, &me, &holder.transaction, rpc)?;
                continue;
            }
            let commit_time = self.clock.now();
            let written = {
                let mut entry = self.keys.entry(req.key.clone()).or_default();
                if entry.intent.is_some() {
                    false
                } else {
                    entry.versions.insert(CommittedVersion {
                        commit_time,
                        value: req.value.clone(),
                    });
                    true
                }
            };
            if written {
                debug!(
                    target: "strata::participant",
                    tablet = %self.tablet_id,
                    key = %req.key,
                    %commit_time,
                    "Non-transactional write applied"
                );
                return Ok(WriteResponse {
                    write_time: commit_time,
                    propagated_time: self.clock.now(),
                });
            }
        }
        Err(StrataError::conflict(format!(
            "key {} stayed contended after {} attempts",
            req.key, self.options.max_resolve_attempts
        )))
    }

    fn snapshot(&self, key: &Key) -> KeySnapshot {
        match self.keys.get(key) {
            Some(entry) => KeySnapshot {
                intent: entry.intent.clone(),
                latest_commit: entry.versions.latest().map(|v| v.commit_time),
            },
            None => KeySnapshot {
                intent: None,
                latest_commit: None,
            },
        }
    }

    /// Settle a conflict with the owner of an intent on `key`
    ///
    /// Returns `Ok` once the holder is no longer pending here, or a
    /// `Conflict` if the requester lost.
    fn contend(
        &self,
        key: &Key,
        requester: &Contender,
        holder: &TransactionMetadata,
        rpc: &dyn TransactionRpc,
    ) -> StrataResult<()> {
        let status = self.resolve_holder(key, holder, self.clock.now(), rpc)?;
        if status.is_terminal() {
            return Ok(());
        }

        match self.resolver.resolve(requester, &Contender::transaction(holder)) {
            Resolution::AbortRequester => {
                warn!(
                    target: "strata::participant",
                    tablet = %self.tablet_id,
                    key = %key,
                    holder = %holder.transaction_id,
                    "Lost conflict resolution"
                );
                Err(StrataError::conflict(format!(
                    "key {} is held by higher priority transaction {}",
                    key, holder.transaction_id
                )))
            }
            Resolution::AbortHolder => {
                info!(
                    target: "strata::participant",
                    tablet = %self.tablet_id,
                    key = %key,
                    holder = %holder.transaction_id,
                    "Aborting lower priority holder"
                );
                let req = UpdateStatusRequest {
                    transaction_id: holder.transaction_id,
                    update: StatusUpdate::Abort(AbortReason::Conflict),
                    participants: BTreeSet::new(),
                    proposed_commit_time: None,
                    propagated_time: self.clock.now(),
                };
                match rpc.update_status(&holder.status_tablet, req) {
                    Ok(resp) => {
                        self.clock.update(resp.propagated_time);
                        self.settle(key, &resp);
                        Ok(())
                    }
                    Err(e) if e.is_not_found() => {
                        self.resolve_transaction(holder.transaction_id, None, Some(key));
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }
        }
    }

    // ========================================================================
    // Resolution
    // ========================================================================

    fn resolve_holder(
        &self,
        key: &Key,
        holder: &TransactionMetadata,
        propagated_time: HybridTime,
        rpc: &dyn TransactionRpc,
    ) -> StrataResult<TransactionStatus> {
        let req = GetStatusRequest {
            transaction_id: holder.transaction_id,
            propagated_time,
        };
        match rpc.get_status(&holder.status_tablet, req) {
            Ok(resp) => {
                self.clock.update(resp.propagated_time);
                self.settle(key, &resp);
                Ok(resp.status)
            }
            Err(e) => match e.implied_status() {
                Some(status) => {
                    self.resolve_transaction(holder.transaction_id, None, Some(key));
                    Ok(status)
                }
                None => Err(e),
            },
        }
    }

    fn settle(&self, key: &Key, resp: &StatusResponse) {
        match resp.status {
            TransactionStatus::Committed => {
                self.resolve_transaction(resp.transaction_id, Some(resp.status_time), Some(key));
            }
            TransactionStatus::Aborted => {
                self.resolve_transaction(resp.transaction_id, None, Some(key));
            }
            TransactionStatus::Pending => {}
        }
    }

    /// Apply (`commit_time` set) or discard every intent of `transaction_id`
    ///
    /// `extra_key` is checked even if the index does not list it.
    fn resolve_transaction(
        &self,
        transaction_id: TransactionId,
        commit_time: Option<HybridTime>,
        extra_key: Option<&Key>,
    ) -> usize {
        let mut keys = self
            .transactions
            .remove(&transaction_id)
            .map(|(_, t)| t.keys)
            .unwrap_or_default();
        if let Some(key) = extra_key {
            keys.insert(key.clone());
        }

        let mut resolved = 0;
        for key in keys {
            if let Some(mut entry) = self.keys.get_mut(&key) {
                let owned = entry
                    .intent
                    .as_ref()
                    .map_or(false, |i| i.transaction.transaction_id == transaction_id);
                if !owned {
                    continue;
                }
                if let Some(intent) = entry.intent.take() {
                    if let Some(commit_time) = commit_time {
                        entry.versions.insert(CommittedVersion {
                            commit_time,
                            value: intent.value,
                        });
                    }
                    resolved += 1;
                }
            }
            self.keys
                .remove_if(&key, |_, e| e.intent.is_none() && e.versions.is_empty());
        }

        if resolved > 0 {
            let counter = match commit_time {
                Some(_) => &self.counters.applied_intents,
                None => &self.counters.discarded_intents,
            };
            counter.fetch_add(resolved as u64, Ordering::Relaxed);
        }
        resolved
    }

    /// Resolve a transaction's intents after its coordinator decided
    pub fn apply(&self, req: ApplyRequest) -> StrataResult<()> {
        self.clock.update(req.propagated_time);
        let commit_time = match req.status {
            TransactionStatus::Committed => {
                let commit_time = req.commit_time.ok_or_else(|| {
                    StrataError::invalid_input(format!(
                        "apply of committed transaction {} without commit time",
                        req.transaction_id
                    ))
                })?;
                self.clock.update(commit_time);
                Some(commit_time)
            }
            TransactionStatus::Aborted => None,
            TransactionStatus::Pending => {
                return Err(StrataError::invalid_input(format!(
                    "cannot apply pending transaction {}",
                    req.transaction_id
                )));
            }
        };
        let resolved = self.resolve_transaction(req.transaction_id, commit_time, None);
        debug!(
            target: "strata::participant",
            tablet = %self.tablet_id,
            txn_id = %req.transaction_id,
            status = %req.status,
            resolved,
            "Applied transaction outcome"
        );
        Ok(())
    }

    /// Resolve intents of transactions older than the cleanup age
    ///
    /// Runs without any apply notification: owners that are ABORTED or no
    /// longer known lose their intents, COMMITTED owners get them applied.
    /// Status lookups that fail are skipped until the next pass.
    pub fn compact(&self, rpc: &dyn TransactionRpc) -> CompactionStats {
        let now = self.clock.now();
        let stale: Vec<TransactionMetadata> = self
            .transactions
            .iter()
            .filter(|t| now.micros_since(t.first_write_time) >= self.options.aborted_intent_cleanup_us)
            .map(|t| t.metadata.clone())
            .collect();

        let mut stats = CompactionStats {
            examined: stale.len(),
            ..Default::default()
        };
        for metadata in stale {
            let req = GetStatusRequest {
                transaction_id: metadata.transaction_id,
                propagated_time: self.clock.now(),
            };
            let (status, status_time) = match rpc.get_status(&metadata.status_tablet, req) {
                Ok(resp) => {
                    self.clock.update(resp.propagated_time);
                    (resp.status, resp.status_time)
                }
                Err(e) if e.is_not_found() => (TransactionStatus::Aborted, HybridTime::INVALID),
                Err(e) => {
                    warn!(
                        target: "strata::participant",
                        tablet = %self.tablet_id,
                        txn_id = %metadata.transaction_id,
                        error = %e,
                        "Status lookup failed during compaction"
                    );
                    continue;
                }
            };
            match status {
                TransactionStatus::Committed => {
                    stats.applied_intents +=
                        self.resolve_transaction(metadata.transaction_id, Some(status_time), None);
                }
                TransactionStatus::Aborted => {
                    stats.discarded_intents +=
                        self.resolve_transaction(metadata.transaction_id, None, None);
                }
                TransactionStatus::Pending => {}
            }
        }
        if stats.applied_intents + stats.discarded_intents > 0 {
            info!(
                target: "strata::participant",
                tablet = %self.tablet_id,
                examined = stats.examined,
                applied = stats.applied_intents,
                discarded = stats.discarded_intents,
                "Compaction resolved stale intents"
            );
        }
        stats
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    /// Number of keys currently holding an intent
    pub fn intent_count(&self) -> usize {
        self.keys.iter().filter(|e| e.intent.is_some()).count()
    }

    /// Whether any intent of `transaction_id` is indexed here
    pub fn has_intents_of(&self, transaction_id: &TransactionId) -> bool {
        self.transactions.contains_key(transaction_id)
    }

    /// Number of transactions with indexed intents
    pub fn transaction_count(&self) -> usize {
        self.transactions.len()
    }

    /// Newest committed value of `key` with its commit time, tombstones as `None`
    pub fn latest_committed(&self, key: &Key) -> Option<(HybridTime, Option<Value>)> {
        let entry = self.keys.get(key)?;
        let latest = entry.versions.latest()?;
        Some((latest.commit_time, latest.value.visible_value()))
    }

    /// Number of committed versions stored for `key`
    pub fn version_count(&self, key: &Key) -> usize {
        self.keys.get(key).map_or(0, |e| e.versions.len())
    }

    /// Counter snapshot
    pub fn stats(&self) -> ParticipantStats {
        ParticipantStats {
            reads: self.counters.reads.load(Ordering::Relaxed),
            writes: self.counters.writes.load(Ordering::Relaxed),
            restarts: self.counters.restarts.load(Ordering::Relaxed),
            conflicts: self.counters.conflicts.load(Ordering::Relaxed),
            applied_intents: self.counters.applied_intents.load(Ordering::Relaxed),
            discarded_intents: self.counters.discarded_intents.load(Ordering::Relaxed),
        }
    }
}
