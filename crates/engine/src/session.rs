//! Statement-level API over a transaction
//!
//! A [`Session`] runs reads and writes either inside a [`Transaction`] or,
//! without one, as single non-transactional operations. Inside a transaction
//! it recovers read restarts: a statement that hit an uncertain version is
//! re-run on the restarted transaction, as long as none of its rows reached
//! the caller and the transaction has not written yet. A restart after
//! writes aborts the transaction with a retryable
//! [`StrataError::Conflict`], so the whole transaction runs again.

use parking_lot::Mutex;
use strata_core::{
    IntentValue, Key, ReadRequest, ReadResult, StrataError, StrataResult, Value, WriteRequest,
};
use tracing::{debug, warn};

use crate::retry::RetryConfig;
use crate::transaction::{Transaction, TransactionManager};

/// Restarts a single statement may go through before giving up
pub const MAX_READ_RESTARTS: usize = 16;

/// Runs statements for one client
#[derive(Debug)]
pub struct Session {
    manager: TransactionManager,
    txn: Mutex<Option<Transaction>>,
}

impl Session {
    /// Session running non-transactional operations
    pub fn new(manager: &TransactionManager) -> Self {
        Self {
            manager: manager.clone(),
            txn: Mutex::new(None),
        }
    }

    /// Session running statements in a new transaction
    pub fn begin(manager: &TransactionManager) -> Self {
        Self::with_transaction(manager, manager.begin())
    }

    /// Session running statements in `txn`
    pub fn with_transaction(manager: &TransactionManager, txn: Transaction) -> Self {
        Self {
            manager: manager.clone(),
            txn: Mutex::new(Some(txn)),
        }
    }

    /// Current transaction; replaced after each transparent restart
    pub fn transaction(&self) -> Option<Transaction> {
        self.txn.lock().clone()
    }

    // ========================================================================
    // Statements
    // ========================================================================

    /// Read one key
    pub fn read(&self, key: impl Into<Key>) -> StrataResult<Option<Value>> {
        let key = key.into();
        if self.transaction().is_none() {
            return self.read_non_transactional(key);
        }
        self.run_statement(|txn| txn.read(key.clone()))
    }

    /// Read several keys at one snapshot
    pub fn read_many(&self, keys: &[Key]) -> StrataResult<Vec<Option<Value>>> {
        if self.transaction().is_none() {
            return keys
                .iter()
                .map(|key| self.read_non_transactional(key.clone()))
                .collect();
        }
        self.run_statement(|txn| txn.read_many(keys))
    }

    /// Read keys one by one, handing each row to `sink` as soon as it is read
    ///
    /// A restart before the first row is recovered; after that it fails the
    /// statement with [`StrataError::RestartRequired`].
    pub fn read_streaming(
        &self,
        keys: &[Key],
        mut sink: impl FnMut(&Key, Option<Value>),
    ) -> StrataResult<()> {
        if self.transaction().is_none() {
            for key in keys {
                sink(key, self.read_non_transactional(key.clone())?);
            }
            return Ok(());
        }
        self.run_statement(|txn| {
            for key in keys {
                let value = txn.read(key.clone())?;
                sink(key, value);
                txn.record_rows_delivered();
            }
            Ok(())
        })
    }

    /// Write one key
    pub fn write(&self, key: impl Into<Key>, value: impl Into<Value>) -> StrataResult<()> {
        let key = key.into();
        let value = value.into();
        match self.transaction() {
            Some(txn) => {
                txn.start_statement();
                txn.write(key, value)
            }
            None => self.write_non_transactional(key, IntentValue::Put(value)),
        }
    }

    /// Delete one key
    pub fn delete(&self, key: impl Into<Key>) -> StrataResult<()> {
        let key = key.into();
        match self.transaction() {
            Some(txn) => {
                txn.start_statement();
                txn.delete(key)
            }
            None => self.write_non_transactional(key, IntentValue::Delete),
        }
    }

    /// Commit the session's transaction and wait for the outcome
    pub fn commit(&self) -> StrataResult<()> {
        match self.transaction() {
            Some(txn) => txn.commit().wait(),
            None => Ok(()),
        }
    }

    /// Abort the session's transaction and wait for the coordinator
    pub fn abort(&self) -> StrataResult<()> {
        match self.transaction() {
            Some(txn) => txn.abort().wait().map(|_| ()),
            None => Ok(()),
        }
    }

    fn run_statement<T>(
        &self,
        mut statement: impl FnMut(&Transaction) -> StrataResult<T>,
    ) -> StrataResult<T> {
        let mut txn = self
            .transaction()
            .ok_or_else(|| StrataError::internal("statement without a transaction"))?;
        txn.start_statement();
        for restarts in 0..=MAX_READ_RESTARTS {
            match statement(&txn) {
                Err(StrataError::RestartRequired { restart_time })
                    if !txn.touched_tablets().is_empty() =>
                {
                    // Earlier statements wrote under this id; re-running only
                    // this one would drop their writes
                    debug!(
                        target: "strata::session",
                        txn_id = ?txn.id(),
                        %restart_time,
                        "Read restart after writes, aborting transaction"
                    );
                    let _ = txn.abort().wait();
                    return Err(StrataError::conflict(format!(
                        "read restart at {} after writes in this transaction",
                        restart_time
                    )));
                }
                Err(StrataError::RestartRequired { restart_time })
                    if !txn.rows_delivered() && restarts < MAX_READ_RESTARTS =>
                {
                    debug!(
                        target: "strata::session",
                        txn_id = ?txn.id(),
                        %restart_time,
                        restarts,
                        "Restarting statement"
                    );
                    txn = txn.create_restarted_transaction()?;
                    *self.txn.lock() = Some(txn.clone());
                }
                other => return other,
            }
        }
        Err(StrataError::internal("statement restart loop exited"))
    }

    // ========================================================================
    // Non-transactional operations
    // ========================================================================

    fn read_non_transactional(&self, key: Key) -> StrataResult<Option<Value>> {
        let rpc = self.manager.rpc();
        let clock = self.manager.clock();
        let tablet = rpc.tablet_for_key(&key)?;
        let resp = rpc.read(
            &tablet,
            ReadRequest {
                key,
                transaction: None,
                read_time: None,
                propagated_time: clock.now(),
            },
        )?;
        clock.update(resp.propagated_time);
        match resp.result {
            ReadResult::Value(value) => Ok(value),
            ReadResult::RestartRequired(restart_time) => {
                Err(StrataError::RestartRequired { restart_time })
            }
        }
    }

    fn write_non_transactional(&self, key: Key, value: IntentValue) -> StrataResult<()> {
        let rpc = self.manager.rpc();
        let clock = self.manager.clock();
        let tablet = rpc.tablet_for_key(&key)?;
        let resp = rpc.write(
            &tablet,
            WriteRequest {
                key,
                value,
                transaction: None,
                read_time: None,
                propagated_time: clock.now(),
            },
        )?;
        clock.update(resp.propagated_time);
        Ok(())
    }

    // ========================================================================
    // Retry
    // ========================================================================

    /// Run `work` in a transaction and commit it, retrying with a new
    /// transaction after the failures `config` retries
    ///
    /// Each retry gets a higher priority floor than the one before.
    ///
    /// # Example
    /// ```ignore
    /// let total = Session::run_with_retry(&manager, &RetryConfig::default(), |s| {
    ///     let n = s.read("counter")?.and_then(|v| v.as_int()).unwrap_or(0);
    ///     s.write("counter", n + 1)?;
    ///     Ok(n + 1)
    /// })?;
    /// ```
    pub fn run_with_retry<T>(
        manager: &TransactionManager,
        config: &RetryConfig,
        mut work: impl FnMut(&Session) -> StrataResult<T>,
    ) -> StrataResult<T> {
        let mut attempt = 0;
        loop {
            let attempt_no = u32::try_from(attempt).unwrap_or(u32::MAX);
            let session = Session::with_transaction(manager, manager.begin_attempt(attempt_no));
            let e = match work(&session).and_then(|value| session.commit().map(|_| value)) {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };
            let _ = session.abort();
            let Some(delay) = config.next_delay(attempt, &e) else {
                if config.retries(&e) {
                    warn!(
                        target: "strata::session",
                        attempts = attempt + 1,
                        error = %e,
                        "Giving up after retries"
                    );
                }
                return Err(e);
            };
            debug!(
                target: "strata::session",
                attempt,
                error = %e,
                "Retrying transaction"
            );
            std::thread::sleep(delay);
            attempt += 1;
        }
    }
}
