//! Driver error classification.
//!
//! SQLite reports foreign-key failures with one message for both directions,
//! so the statement verb decides between "still referenced" and "parent missing".

use super::DbError;
use once_cell::sync::Lazy;
use regex::Regex;
use rusqlite::{ffi, ErrorCode};

static STATEMENT_VERB_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*([A-Za-z]+)").expect("valid statement verb regex"));
static UNIQUE_CONSTRAINT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:UNIQUE|PRIMARY KEY) constraint failed: ([\w.]+(?:, [\w.]+)*)")
        .expect("valid unique constraint regex")
});

/// Translates one driver error into the domain taxonomy.
///
/// `sql` is the statement that failed; an empty string is allowed when the
/// statement is unknown (foreign-key failures then count as a missing parent).
pub fn classify(err: rusqlite::Error, sql: &str) -> DbError {
    match err {
        rusqlite::Error::QueryReturnedNoRows => DbError::NotFound,
        rusqlite::Error::SqliteFailure(failure, message) => {
            classify_failure(failure, message, sql)
        }
        other => DbError::Unclassified(other),
    }
}

fn classify_failure(failure: ffi::Error, message: Option<String>, sql: &str) -> DbError {
    let extended = failure.extended_code;
    match failure.code {
        ErrorCode::ConstraintViolation
            if extended == ffi::SQLITE_CONSTRAINT_UNIQUE
                || extended == ffi::SQLITE_CONSTRAINT_PRIMARYKEY =>
        {
            let constraint = message.as_deref().and_then(unique_constraint_name);
            DbError::UniqueViolation {
                constraint,
                source: rusqlite::Error::SqliteFailure(failure, message),
            }
        }
        ErrorCode::ConstraintViolation if extended == ffi::SQLITE_CONSTRAINT_FOREIGNKEY => {
            let err = rusqlite::Error::SqliteFailure(failure, message);
            match statement_verb(sql).as_deref() {
                Some("DELETE") | Some("UPDATE") => DbError::ReferencedByAnotherObject(err),
                _ => DbError::ReferencedObjectNotFound(err),
            }
        }
        ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => {
            DbError::Transient(rusqlite::Error::SqliteFailure(failure, message))
        }
        ErrorCode::OperationInterrupted => DbError::Timeout(
            message.unwrap_or_else(|| "statement interrupted".to_string()),
        ),
        _ => DbError::Unclassified(rusqlite::Error::SqliteFailure(failure, message)),
    }
}

fn statement_verb(sql: &str) -> Option<String> {
    STATEMENT_VERB_RE
        .captures(sql)
        .and_then(|captures| captures.get(1))
        .map(|verb| verb.as_str().to_ascii_uppercase())
}

fn unique_constraint_name(message: &str) -> Option<String> {
    UNIQUE_CONSTRAINT_RE
        .captures(message)
        .and_then(|captures| captures.get(1))
        .map(|name| name.as_str().to_string())
}
