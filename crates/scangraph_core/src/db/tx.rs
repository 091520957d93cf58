//! Transaction handles shared through [`Context`](super::Context).
//!
//! # Responsibility
//! - Own one pooled connection for the lifetime of a transaction.
//! - Distinguish the owning handle from inner handles handed to nested calls.
//! - Run finish hooks and track keys written inside the transaction.
//!
//! # Invariants
//! - Only the owning handle finalizes; `commit`/`rollback` on an inner handle
//!   are no-ops.
//! - An owning handle dropped before finalization rolls back.
//! - Finish hooks run exactly once, after the connection left the transaction.
//! - Once SQLite rolls the transaction back on its own (an interrupted or
//!   failed write), every later statement fails with `TxAborted` instead of
//!   running in autocommit mode.

use super::classify;
use super::pool::PooledConn;
use super::{DbError, DbResult};
use crate::metrics::{self, Op};
use log::{debug, error, warn};
use parking_lot::Mutex;
use rusqlite::Connection;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// How a transaction ended; passed to finish hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxOutcome {
    Committed,
    RolledBack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxMode {
    /// `BEGIN IMMEDIATE`: takes the write lock up front.
    Write,
    /// `BEGIN DEFERRED`.
    Read,
}

impl TxMode {
    fn begin_sql(self) -> &'static str {
        match self {
            Self::Write => "BEGIN IMMEDIATE",
            Self::Read => "BEGIN DEFERRED",
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Write => "write",
            Self::Read => "read",
        }
    }
}

type FinishHook = Box<dyn FnOnce(TxOutcome) + Send>;

struct TxShared {
    id: Uuid,
    mode: TxMode,
    conn: Mutex<Option<PooledConn>>,
    aborted: AtomicBool,
    hooks: Mutex<Vec<FinishHook>>,
    dirty: Mutex<HashMap<&'static str, HashSet<String>>>,
}

/// Handle to an open transaction.
///
/// Cloning yields an inner (non-owning) handle.
pub struct Tx {
    shared: Arc<TxShared>,
    owner: bool,
}

impl std::fmt::Debug for Tx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tx")
            .field("id", &self.shared.id)
            .field("mode", &self.shared.mode.as_str())
            .field("owner", &self.owner)
            .finish()
    }
}

impl Tx {
    /// Issues `BEGIN` on `conn` and returns the owning handle.
    pub(crate) fn begin(conn: PooledConn, mode: TxMode) -> DbResult<Self> {
        let timer = metrics::timer(Op::Begin, "tx");
        let sql = mode.begin_sql();
        if let Err(err) = conn.execute_batch(sql) {
            timer.fail();
            return Err(classify(err, sql));
        }

        let id = Uuid::new_v4();
        debug!(
            "event=tx_begin module=db status=ok tx_id={} mode={}",
            id,
            mode.as_str()
        );
        Ok(Self {
            shared: Arc::new(TxShared {
                id,
                mode,
                conn: Mutex::new(Some(conn)),
                aborted: AtomicBool::new(false),
                hooks: Mutex::new(Vec::new()),
                dirty: Mutex::new(HashMap::new()),
            }),
            owner: true,
        })
    }

    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn mode(&self) -> TxMode {
        self.shared.mode
    }

    /// Whether this handle may finalize the transaction.
    pub fn is_owner(&self) -> bool {
        self.owner
    }

    pub fn is_finished(&self) -> bool {
        self.shared.conn.lock().is_none()
    }

    /// Whether SQLite already rolled this transaction back.
    pub fn is_aborted(&self) -> bool {
        self.shared.aborted.load(Ordering::Acquire)
    }

    /// Returns an inner handle to the same transaction.
    pub fn handle(&self) -> Tx {
        Tx {
            shared: Arc::clone(&self.shared),
            owner: false,
        }
    }

    /// Runs `f` on the transaction's connection.
    pub(crate) fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> DbResult<T>) -> DbResult<T> {
        let guard = self.shared.conn.lock();
        let conn = guard.as_ref().ok_or(DbError::TxFinished)?;
        if self.is_aborted() {
            return Err(DbError::TxAborted);
        }
        let result = f(conn);
        if let Err(err) = &result {
            if conn.is_autocommit() {
                self.shared.aborted.store(true, Ordering::Release);
                warn!(
                    "event=tx_abort module=db status=error tx_id={} error_kind={} error={}",
                    self.shared.id,
                    err.kind(),
                    err
                );
            }
        }
        result
    }

    /// Registers a hook that runs once the transaction commits or rolls back.
    pub fn on_finish(&self, hook: impl FnOnce(TxOutcome) + Send + 'static) -> DbResult<()> {
        if self.is_finished() {
            return Err(DbError::TxFinished);
        }
        self.shared.hooks.lock().push(Box::new(hook));
        Ok(())
    }

    /// Records keys of `scope` written inside this transaction.
    pub fn mark_dirty<I, S>(&self, scope: &'static str, keys: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut dirty = self.shared.dirty.lock();
        let entry = dirty.entry(scope).or_default();
        entry.extend(keys.into_iter().map(Into::into));
    }

    pub fn is_dirty(&self, scope: &'static str, key: &str) -> bool {
        self.shared
            .dirty
            .lock()
            .get(scope)
            .is_some_and(|keys| keys.contains(key))
    }

    /// Commits the transaction. No-op on an inner handle.
    pub fn commit(&self) -> DbResult<()> {
        if !self.owner {
            debug!(
                "event=tx_commit module=db status=skipped tx_id={} reason=inner_handle",
                self.shared.id
            );
            return Ok(());
        }
        self.finish(TxOutcome::Committed)
    }

    /// Rolls the transaction back. No-op on an inner handle.
    pub fn rollback(&self) -> DbResult<()> {
        if !self.owner {
            debug!(
                "event=tx_rollback module=db status=skipped tx_id={} reason=inner_handle",
                self.shared.id
            );
            return Ok(());
        }
        self.finish(TxOutcome::RolledBack)
    }

    fn finish(&self, requested: TxOutcome) -> DbResult<()> {
        let conn = self.shared.conn.lock().take().ok_or(DbError::TxFinished)?;
        if self.is_aborted() {
            return self.finish_aborted(conn, requested);
        }
        let (op, sql) = match requested {
            TxOutcome::Committed => (Op::Commit, "COMMIT"),
            TxOutcome::RolledBack => (Op::Rollback, "ROLLBACK"),
        };
        let timer = metrics::timer(op, "tx");

        let result = conn.execute_batch(sql).map_err(|err| classify(err, sql));
        let outcome = match &result {
            Ok(()) => {
                debug!(
                    "event=tx_{} module=db status=ok tx_id={}",
                    op.as_str(),
                    self.shared.id
                );
                requested
            }
            Err(err) => {
                timer.fail();
                error!(
                    "event=tx_{} module=db status=error tx_id={} error_kind={} error={}",
                    op.as_str(),
                    self.shared.id,
                    err.kind(),
                    err
                );
                TxOutcome::RolledBack
            }
        };
        release_connection(conn, self.shared.id);
        self.run_hooks(outcome);
        result
    }

    /// The database already rolled back: a requested rollback succeeds, a
    /// requested commit reports `TxAborted`.
    fn finish_aborted(&self, conn: PooledConn, requested: TxOutcome) -> DbResult<()> {
        release_connection(conn, self.shared.id);
        self.run_hooks(TxOutcome::RolledBack);
        match requested {
            TxOutcome::RolledBack => {
                debug!(
                    "event=tx_rollback module=db status=ok tx_id={} reason=already_aborted",
                    self.shared.id
                );
                Ok(())
            }
            TxOutcome::Committed => {
                error!(
                    "event=tx_commit module=db status=error tx_id={} error_kind={} error={}",
                    self.shared.id,
                    DbError::TxAborted.kind(),
                    DbError::TxAborted
                );
                Err(DbError::TxAborted)
            }
        }
    }

    fn run_hooks(&self, outcome: TxOutcome) {
        let hooks = std::mem::take(&mut *self.shared.hooks.lock());
        for hook in hooks {
            hook(outcome);
        }
    }
}

/// Returns the connection to the pool, or closes it when it is still inside
/// a transaction after a failed COMMIT/ROLLBACK.
fn release_connection(conn: PooledConn, tx_id: Uuid) {
    if conn.is_autocommit() {
        return;
    }
    if let Err(err) = conn.execute_batch("ROLLBACK") {
        warn!(
            "event=tx_release module=db status=error tx_id={} action=discard error={}",
            tx_id, err
        );
        conn.discard();
    }
}

impl Clone for Tx {
    fn clone(&self) -> Self {
        self.handle()
    }
}

impl Drop for Tx {
    fn drop(&mut self) {
        if !self.owner || self.is_finished() {
            return;
        }
        warn!(
            "event=tx_rollback module=db status=start tx_id={} reason=dropped_unfinished",
            self.shared.id
        );
        if let Err(err) = self.finish(TxOutcome::RolledBack) {
            warn!(
                "event=tx_rollback module=db status=error tx_id={} error={}",
                self.shared.id, err
            );
        }
    }
}
