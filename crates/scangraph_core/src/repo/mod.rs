//! Repository layer for the node scan graph.
//!
//! # Responsibility
//! - Define the [`node_repo::NodeRepository`] contract consumed by services.
//! - Keep SQL, batching and cache details inside the persistence boundary.
//!
//! # Invariants
//! - Repository writes validate nodes before any SQL mutation.
//! - Every multi-statement write runs inside one transaction.
//! - Errors reaching callers are classified ([`RepoError::kind`]); raw driver
//!   errors never escape.

pub mod bulk;
pub mod component_repo;
pub mod cve_repo;
pub mod node_repo;

use crate::db::{DbError, ErrorKind, Retryable};
use crate::model::node::NodeValidationError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::time::{SystemTime, UNIX_EPOCH};

pub type RepoResult<T> = Result<T, RepoError>;

#[derive(Debug)]
pub enum RepoError {
    Validation(NodeValidationError),
    Db(DbError),
    /// A stored payload could not be encoded or decoded.
    InvalidData(String),
}

impl RepoError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Db(err) => err.kind(),
            Self::Validation(_) | Self::InvalidData(_) => ErrorKind::Unclassified,
        }
    }
}

impl Display for RepoError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation(err) => write!(f, "{err}"),
            Self::Db(err) => write!(f, "{err}"),
            Self::InvalidData(message) => write!(f, "invalid persisted data: {message}"),
        }
    }
}

impl Error for RepoError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Validation(err) => Some(err),
            Self::Db(err) => Some(err),
            Self::InvalidData(_) => None,
        }
    }
}

impl From<NodeValidationError> for RepoError {
    fn from(value: NodeValidationError) -> Self {
        Self::Validation(value)
    }
}

impl From<DbError> for RepoError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl Retryable for RepoError {
    fn is_transient(&self) -> bool {
        matches!(self, Self::Db(err) if err.is_transient())
    }
}

/// Current wall-clock time in Unix epoch milliseconds.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

pub(crate) fn encode<T: Serialize>(value: &T) -> RepoResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|err| RepoError::InvalidData(err.to_string()))
}

pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> RepoResult<T> {
    serde_json::from_slice(bytes).map_err(|err| RepoError::InvalidData(err.to_string()))
}
