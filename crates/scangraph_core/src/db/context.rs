//! Per-call context carrying the ambient transaction, deadline and cancellation.
//!
//! # Responsibility
//! - Let deeply nested calls discover an already-open transaction without
//!   threading a handle through every signature.
//! - Carry the deadline and cancel token that statement execution honors.
//!
//! # Invariants
//! - A `Context` is immutable; every builder returns a new value.
//! - A transaction stored in a context is always a non-owning handle, so
//!   cloning or dropping contexts never finalizes the transaction.

use super::tx::Tx;
use super::{DbError, DbResult};
use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Shared cancellation flag. Cloning yields a handle to the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    canceled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Default)]
pub struct Context {
    tx: Option<Tx>,
    deadline: Option<Instant>,
    cancel: Option<CancelToken>,
    identity: Option<Arc<str>>,
}

impl Context {
    /// Empty context: no transaction, no deadline, not cancelable.
    pub fn background() -> Self {
        Self::default()
    }

    /// Returns a context that routes statements through `tx`.
    pub fn with_tx(&self, tx: &Tx) -> Self {
        Self {
            tx: Some(tx.handle()),
            ..self.clone()
        }
    }

    /// Sets an absolute deadline. An earlier existing deadline is kept.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(existing) if existing < deadline => existing,
            _ => deadline,
        };
        Self {
            deadline: Some(deadline),
            ..self.clone()
        }
    }

    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_cancel(&self, token: CancelToken) -> Self {
        Self {
            cancel: Some(token),
            ..self.clone()
        }
    }

    /// Attaches an opaque caller identity, shown in `Debug` output.
    pub fn with_identity(&self, identity: impl Into<Arc<str>>) -> Self {
        Self {
            identity: Some(identity.into()),
            ..self.clone()
        }
    }

    pub fn tx(&self) -> Option<&Tx> {
        self.tx.as_ref()
    }

    pub fn require_tx(&self) -> DbResult<&Tx> {
        self.tx.as_ref().ok_or(DbError::NoTransaction)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left until the deadline; `None` when the context has no deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    pub fn cancel_token(&self) -> Option<&CancelToken> {
        self.cancel.as_ref()
    }

    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    pub fn is_canceled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancelToken::is_canceled)
    }

    pub fn deadline_exceeded(&self) -> bool {
        self.deadline
            .is_some_and(|deadline| Instant::now() >= deadline)
    }

    /// Fails fast when the context is already canceled or past its deadline.
    pub fn check(&self) -> DbResult<()> {
        if self.is_canceled() {
            return Err(DbError::Canceled);
        }
        if self.deadline_exceeded() {
            return Err(DbError::Timeout("context deadline exceeded".to_string()));
        }
        Ok(())
    }
}

impl Debug for Context {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("tx_id", &self.tx.as_ref().map(Tx::id))
            .field("deadline", &self.deadline)
            .field("canceled", &self.is_canceled())
            .field("identity", &self.identity)
            .finish()
    }
}
