//! SQLite storage bootstrap, connection/transaction plumbing and error taxonomy.
//!
//! # Responsibility
//! - Open and configure pooled SQLite connections for scangraph core.
//! - Apply schema migrations in deterministic order.
//! - Propagate transactions through an explicit call [`Context`].
//! - Classify driver errors into [`ErrorKind`] exactly once, at this boundary.
//!
//! # Invariants
//! - Migration version is tracked via `PRAGMA user_version`.
//! - Callers above this module never see raw `rusqlite` errors as their error
//!   type; they see a classified [`DbError`].
//! - Only the owner of a transaction may finalize it.

use std::error::Error;
use std::fmt::{Display, Formatter};

mod classify;
pub mod context;
mod database;
pub mod migrations;
mod open;
pub mod pool;
pub mod retry;
pub mod tx;

pub use classify::classify;
pub use context::{CancelToken, Context};
pub use database::{Database, OptionalExt};
pub use open::{open_db, open_db_in_memory};
pub use retry::{retry, RetryPolicy, Retryable};
pub use tx::Tx;

pub type DbResult<T> = Result<T, DbError>;

/// Domain error kinds that callers are allowed to branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A query expected a row and found none.
    NotFound,
    /// Insert collided with an existing unique key.
    UniqueViolation,
    /// Delete/update blocked because another row still references the target.
    ReferencedByAnotherObject,
    /// Insert/update points at a parent row that does not exist.
    ReferencedObjectNotFound,
    /// Lock contention or snapshot conflict; safe to retry the whole operation.
    Transient,
    /// Deadline passed or a pooled connection could not be acquired in time.
    Timeout,
    /// The call context was canceled.
    Canceled,
    /// Anything else, passed through verbatim.
    Unclassified,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::UniqueViolation => "unique_violation",
            Self::ReferencedByAnotherObject => "referenced_by_another_object",
            Self::ReferencedObjectNotFound => "referenced_object_not_found",
            Self::Transient => "transient",
            Self::Timeout => "timeout",
            Self::Canceled => "canceled",
            Self::Unclassified => "unclassified",
        }
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
pub enum DbError {
    NotFound,
    UniqueViolation {
        constraint: Option<String>,
        source: rusqlite::Error,
    },
    ReferencedByAnotherObject(rusqlite::Error),
    ReferencedObjectNotFound(rusqlite::Error),
    Transient(rusqlite::Error),
    /// Statement deadline or pool acquisition timeout.
    Timeout(String),
    Canceled,
    /// A transaction-scoped operation ran without a transaction in context.
    NoTransaction,
    /// The transaction was already committed or rolled back.
    TxFinished,
    /// SQLite rolled the transaction back after a failed statement; only
    /// `rollback` is still accepted.
    TxAborted,
    UnsupportedSchemaVersion {
        db_version: u32,
        latest_supported: u32,
    },
    Unclassified(rusqlite::Error),
}

impl DbError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound => ErrorKind::NotFound,
            Self::UniqueViolation { .. } => ErrorKind::UniqueViolation,
            Self::ReferencedByAnotherObject(_) => ErrorKind::ReferencedByAnotherObject,
            Self::ReferencedObjectNotFound(_) => ErrorKind::ReferencedObjectNotFound,
            Self::Transient(_) => ErrorKind::Transient,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Canceled => ErrorKind::Canceled,
            Self::NoTransaction
            | Self::TxFinished
            | Self::TxAborted
            | Self::UnsupportedSchemaVersion { .. }
            | Self::Unclassified(_) => ErrorKind::Unclassified,
        }
    }
}

impl Display for DbError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound => write!(f, "no rows in result set"),
            Self::UniqueViolation {
                constraint: Some(constraint),
                ..
            } => write!(f, "unique constraint violated: {constraint}"),
            Self::UniqueViolation {
                constraint: None,
                source,
            } => write!(f, "unique constraint violated: {source}"),
            Self::ReferencedByAnotherObject(err) => {
                write!(f, "object is referenced by another object: {err}")
            }
            Self::ReferencedObjectNotFound(err) => {
                write!(f, "referenced object not found: {err}")
            }
            Self::Transient(err) => write!(f, "transient database error: {err}"),
            Self::Timeout(details) => write!(f, "timed out: {details}"),
            Self::Canceled => write!(f, "operation canceled"),
            Self::NoTransaction => write!(f, "operation requires an open transaction"),
            Self::TxFinished => write!(f, "transaction already finished"),
            Self::TxAborted => write!(f, "transaction was rolled back by the database"),
            Self::UnsupportedSchemaVersion {
                db_version,
                latest_supported,
            } => write!(
                f,
                "database schema version {db_version} is newer than supported {latest_supported}"
            ),
            Self::Unclassified(err) => write!(f, "{err}"),
        }
    }
}

impl Error for DbError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::UniqueViolation { source, .. } => Some(source),
            Self::ReferencedByAnotherObject(err)
            | Self::ReferencedObjectNotFound(err)
            | Self::Transient(err)
            | Self::Unclassified(err) => Some(err),
            Self::NotFound
            | Self::Timeout(_)
            | Self::Canceled
            | Self::NoTransaction
            | Self::TxFinished
            | Self::TxAborted
            | Self::UnsupportedSchemaVersion { .. } => None,
        }
    }
}

impl From<rusqlite::Error> for DbError {
    /// Classifies without statement context; prefer [`classify`] when the
    /// statement text is at hand.
    fn from(value: rusqlite::Error) -> Self {
        classify(value, "")
    }
}
