//! Child transactions
//!
//! A parent exports [`ChildTransactionData`]; a child built from it reads at
//! the parent's snapshot and writes under the parent's id. When done the
//! child returns a [`ChildTransactionResult`] the parent merges back. No
//! object references flow between the two, only these values.

use std::sync::Arc;
use strata_core::{
    ChildTransactionData, ChildTransactionResult, ClientState, StrataError, StrataResult,
};
use tracing::debug;

use super::handle::{Kind, Transaction};
use super::manager::ManagerShared;

impl Transaction {
    /// Export this transaction's snapshot for a child
    ///
    /// Picks the read time and registers the transaction if that has not
    /// happened yet, so the child's writes land under a live status record.
    pub fn prepare_child(&self) -> StrataResult<ChildTransactionData> {
        if self.is_child() {
            return Err(StrataError::invalid_state(
                "a child transaction cannot have children",
            ));
        }
        let metadata = self.running_metadata()?;
        self.ensure_read_time();
        self.ensure_registered(&metadata, None)?;
        let read_time = self
            .inner
            .read_point
            .read_time()
            .ok_or_else(|| StrataError::internal("read time missing after pick"))?;
        Ok(ChildTransactionData {
            metadata,
            read_time,
            local_limits: self.inner.read_point.local_limits(),
        })
    }

    pub(super) fn child(shared: Arc<ManagerShared>, data: ChildTransactionData) -> StrataResult<Self> {
        let txn = Transaction::with_kind(shared, Kind::Child, 0);
        txn.inner
            .read_point
            .set_read_time(data.read_time, data.local_limits)?;
        {
            let mut state = txn.inner.state.lock();
            state.client_state = ClientState::Running;
            state.isolation = data.metadata.isolation;
            state.metadata = Some(data.metadata);
            state.registered = true;
        }
        Ok(txn)
    }

    /// Finish a child and summarize its work for the parent
    pub fn finish_child(&self) -> StrataResult<ChildTransactionResult> {
        if !self.is_child() {
            return Err(StrataError::invalid_state(
                "finish_child called on a top-level transaction",
            ));
        }
        let mut state = self.inner.state.lock();
        match state.client_state {
            ClientState::Running | ClientState::RestartRequired => {}
            other => return Err(StrataError::invalid_state(other.to_string())),
        }
        state.client_state = ClientState::Committed;
        let result = ChildTransactionResult {
            read_time_lower_bound: self.inner.read_point.restart_time(),
            touched_tablets: state.touched.clone(),
            local_limits: self.inner.read_point.local_limits(),
        };
        debug!(
            target: "strata::txn",
            txn_id = ?state.metadata.as_ref().map(|m| m.transaction_id),
            touched = result.touched_tablets.len(),
            restart = ?result.read_time_lower_bound,
            "Child finished"
        );
        Ok(result)
    }

    /// Merge a finished child's work into this transaction
    ///
    /// Touched tablets join this transaction's participants. A restart the
    /// child ran into becomes a pending restart here.
    pub fn apply_child_result(&self, result: &ChildTransactionResult) -> StrataResult<()> {
        if self.is_child() {
            return Err(StrataError::invalid_state(
                "child results are applied to the parent",
            ));
        }
        let mut state = self.inner.state.lock();
        match state.client_state {
            ClientState::Running | ClientState::RestartRequired => {}
            other => return Err(StrataError::invalid_state(other.to_string())),
        }
        state
            .touched
            .extend(result.touched_tablets.iter().cloned());
        self.inner.read_point.apply_child_result(result);
        if self.inner.read_point.is_restart_required() {
            state.client_state = ClientState::RestartRequired;
        }
        Ok(())
    }
}
