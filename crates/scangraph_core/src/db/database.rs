//! Statement routing over the pool and the context transaction.
//!
//! # Responsibility
//! - Run `exec`/`query`/`query_row`/`copy_in` on the context transaction
//!   when one is present, otherwise on a pooled connection.
//! - Bound every statement by the context deadline or the default timeout.
//! - Classify driver errors once and count every call.

use super::context::Context;
use super::pool::Pool;
use super::tx::{Tx, TxMode};
use super::{classify, DbError, DbResult};
use crate::metrics::{self, Op};
use log::debug;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, Params, Row};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Virtual machine instructions between two deadline checks.
const PROGRESS_CHECK_INTERVAL: i32 = 1_000;
const METRICS_TARGET: &str = "sqlite";

/// Cheap to clone; clones share the pool.
#[derive(Clone)]
pub struct Database {
    pool: Arc<Pool>,
    default_timeout: Duration,
}

impl Database {
    pub(crate) fn new(pool: Pool, default_timeout: Duration) -> Self {
        Self {
            pool: Arc::new(pool),
            default_timeout,
        }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Opens a write transaction, or joins the one carried by `ctx`.
    pub fn begin(&self, ctx: &Context) -> DbResult<Tx> {
        self.begin_with_mode(ctx, TxMode::Write)
    }

    /// Opens a deferred (read) transaction, or joins the one carried by `ctx`.
    pub fn begin_read(&self, ctx: &Context) -> DbResult<Tx> {
        self.begin_with_mode(ctx, TxMode::Read)
    }

    fn begin_with_mode(&self, ctx: &Context, mode: TxMode) -> DbResult<Tx> {
        if let Some(existing) = ctx.tx() {
            if existing.is_finished() {
                return Err(DbError::TxFinished);
            }
            debug!(
                "event=tx_begin module=db status=joined tx_id={}",
                existing.id()
            );
            return Ok(existing.handle());
        }
        ctx.check()?;
        let conn = match ctx.remaining() {
            Some(remaining) => self.pool.acquire_within(remaining)?,
            None => self.pool.acquire()?,
        };
        Tx::begin(conn, mode)
    }

    /// Executes one statement and returns the number of changed rows.
    pub fn exec<P: Params>(&self, ctx: &Context, sql: &str, params: P) -> DbResult<usize> {
        self.run(ctx, Op::Exec, sql, |conn| conn.execute(sql, params))
    }

    /// Runs a query and maps every row with `map`.
    pub fn query<T, P, F>(&self, ctx: &Context, sql: &str, params: P, map: F) -> DbResult<Vec<T>>
    where
        P: Params,
        F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
    {
        self.run(ctx, Op::Query, sql, |conn| {
            let mut stmt = conn.prepare_cached(sql)?;
            let rows = stmt.query_map(params, map)?;
            rows.collect()
        })
    }

    /// Runs a query expected to return one row; no row is `DbError::NotFound`.
    pub fn query_row<T, P, F>(&self, ctx: &Context, sql: &str, params: P, map: F) -> DbResult<T>
    where
        P: Params,
        F: FnOnce(&Row<'_>) -> rusqlite::Result<T>,
    {
        self.run(ctx, Op::QueryRow, sql, |conn| {
            let mut stmt = conn.prepare_cached(sql)?;
            stmt.query_row(params, map)
        })
    }

    /// Appends `rows` to `table` without any conflict handling.
    ///
    /// A row whose key already exists fails the whole call with
    /// `DbError::UniqueViolation`.
    pub fn copy_in(
        &self,
        ctx: &Context,
        table: &str,
        columns: &[&str],
        rows: &[Vec<Value>],
    ) -> DbResult<usize> {
        if rows.is_empty() {
            return Ok(0);
        }
        let sql = insert_statement(table, columns);
        self.run(ctx, Op::CopyIn, &sql, |conn| {
            let mut stmt = conn.prepare_cached(&sql)?;
            let mut inserted = 0;
            for row in rows {
                inserted += stmt.execute(params_from_iter(row.iter()))?;
            }
            Ok(inserted)
        })
    }

    fn run<T>(
        &self,
        ctx: &Context,
        op: Op,
        sql: &str,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> DbResult<T> {
        let timer = metrics::timer(op, METRICS_TARGET);
        let result = ctx.check().and_then(|()| match ctx.tx() {
            Some(tx) => tx.with_conn(|conn| self.guarded(ctx, conn, sql, f)),
            None => {
                let conn = match ctx.remaining() {
                    Some(remaining) => self.pool.acquire_within(remaining)?,
                    None => self.pool.acquire()?,
                };
                self.guarded(ctx, &conn, sql, f)
            }
        });
        timer.track(result)
    }

    /// Runs `f` with a progress handler that interrupts the statement once
    /// the deadline passes or the context is canceled.
    fn guarded<T>(
        &self,
        ctx: &Context,
        conn: &Connection,
        sql: &str,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> DbResult<T> {
        let deadline = ctx
            .deadline()
            .unwrap_or_else(|| Instant::now() + self.default_timeout);
        let cancel = ctx.cancel_token().cloned();
        conn.progress_handler(
            PROGRESS_CHECK_INTERVAL,
            Some(move || {
                Instant::now() >= deadline
                    || cancel.as_ref().is_some_and(|token| token.is_canceled())
            }),
        );
        let result = f(conn);
        conn.progress_handler(0, None::<fn() -> bool>);

        result.map_err(|err| match classify(err, sql) {
            DbError::Timeout(_) if ctx.is_canceled() => DbError::Canceled,
            other => other,
        })
    }
}

fn insert_statement(table: &str, columns: &[&str]) -> String {
    let placeholders = (1..=columns.len())
        .map(|index| format!("?{index}"))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "INSERT INTO {table} ({}) VALUES ({placeholders})",
        columns.join(", ")
    )
}

/// Converts `DbError::NotFound` into `Ok(None)`.
pub trait OptionalExt<T> {
    fn optional(self) -> DbResult<Option<T>>;
}

impl<T> OptionalExt<T> for DbResult<T> {
    fn optional(self) -> DbResult<Option<T>> {
        match self {
            Ok(value) => Ok(Some(value)),
            Err(DbError::NotFound) => Ok(None),
            Err(err) => Err(err),
        }
    }
}
