//! Whole-operation retry on transient failures.
//!
//! # Invariants
//! - Only errors reporting `is_transient()` are retried.
//! - Nothing is retried when the context already carries a transaction; the
//!   transaction owner decides what to re-run.
//! - Backoff never sleeps past the context deadline.

use super::context::Context;
use super::{DbError, ErrorKind};
use crate::config::StoreConfig;
use log::{error, warn};
use std::fmt::Display;
use std::time::Duration;

/// Errors the retry loop can inspect.
pub trait Retryable {
    fn is_transient(&self) -> bool;
}

impl Retryable for DbError {
    fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &StoreConfig) -> Self {
        Self {
            max_attempts: config.max_retry_attempts,
            base_backoff: Duration::from_millis(config.retry_backoff_ms),
            max_backoff: Duration::from_millis(config.retry_backoff_ms.saturating_mul(32)),
        }
    }

    /// Backoff before attempt `attempt + 1` (1-based `attempt`).
    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.base_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&StoreConfig::default())
    }
}

/// Runs `f`, re-running it on transient errors according to `policy`.
///
/// `f` must be the whole operation (connection, transaction, work, commit).
pub fn retry<T, E, F>(ctx: &Context, policy: &RetryPolicy, op: &str, mut f: F) -> Result<T, E>
where
    E: Retryable + Display,
    F: FnMut() -> Result<T, E>,
{
    if ctx.tx().is_some() {
        return f();
    }

    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        let err = match f() {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        if !err.is_transient() {
            return Err(err);
        }
        if attempt >= max_attempts {
            error!(
                "event=retry module=db status=error op={} attempts={} error_kind=transient error={}",
                op, attempt, err
            );
            return Err(err);
        }

        let backoff = policy.backoff(attempt);
        let out_of_time = ctx.remaining().is_some_and(|remaining| remaining <= backoff);
        if ctx.is_canceled() || out_of_time {
            warn!(
                "event=retry module=db status=error op={} attempts={} reason=context_done error={}",
                op, attempt, err
            );
            return Err(err);
        }

        warn!(
            "event=retry module=db status=retry op={} attempt={} backoff_ms={} error={}",
            op,
            attempt,
            backoff.as_millis(),
            err
        );
        std::thread::sleep(backoff);
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::{retry, RetryPolicy};
    use crate::db::{CancelToken, Context, DbError, ErrorKind};
    use rusqlite::ffi;
    use std::cell::Cell;
    use std::time::Duration;

    fn busy() -> DbError {
        DbError::Transient(rusqlite::Error::SqliteFailure(
            ffi::Error::new(ffi::SQLITE_BUSY),
            None,
        ))
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
        }
    }

    #[test]
    fn transient_errors_are_retried_until_success() {
        let calls = Cell::new(0);
        let result = retry(&Context::background(), &fast_policy(3), "test", || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(busy())
            } else {
                Ok("done")
            }
        });
        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn exhaustion_returns_last_transient_error() {
        let calls = Cell::new(0);
        let result: Result<(), DbError> =
            retry(&Context::background(), &fast_policy(2), "test", || {
                calls.set(calls.get() + 1);
                Err(busy())
            });
        assert_eq!(result.unwrap_err().kind(), ErrorKind::Transient);
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn non_transient_errors_propagate_immediately() {
        let calls = Cell::new(0);
        let result: Result<(), DbError> =
            retry(&Context::background(), &fast_policy(5), "test", || {
                calls.set(calls.get() + 1);
                Err(DbError::NotFound)
            });
        assert_eq!(result.unwrap_err().kind(), ErrorKind::NotFound);
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn canceled_context_stops_retrying() {
        let token = CancelToken::new();
        let ctx = Context::background().with_cancel(token.clone());
        let calls = Cell::new(0);
        let result: Result<(), DbError> = retry(&ctx, &fast_policy(5), "test", || {
            calls.set(calls.get() + 1);
            token.cancel();
            Err(busy())
        });
        assert!(result.is_err());
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn backoff_doubles_and_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(35),
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(10));
        assert_eq!(policy.backoff(2), Duration::from_millis(20));
        assert_eq!(policy.backoff(3), Duration::from_millis(35));
        assert_eq!(policy.backoff(40), Duration::from_millis(35));
    }
}
