//! Bounded SQLite connection pool.
//!
//! # Invariants
//! - At most `max_connections` connections are open at any time.
//! - A connection checked out as [`PooledConn`] returns to the idle list on
//!   drop, unless it was discarded.
//! - Acquisition waits at most `acquire_timeout` and then fails with
//!   `DbError::Timeout`.

use super::{DbError, DbResult};
use log::{debug, warn};
use parking_lot::{Condvar, Mutex};
use rusqlite::Connection;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::{Duration, Instant};

type ConnectionFactory = dyn Fn() -> DbResult<Connection> + Send + Sync;

pub struct Pool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    state: Mutex<PoolState>,
    available: Condvar,
    factory: Box<ConnectionFactory>,
    max_connections: usize,
    acquire_timeout: Duration,
}

#[derive(Default)]
struct PoolState {
    idle: Vec<Connection>,
    open: usize,
}

impl Pool {
    /// Builds an empty pool. Connections are created lazily by `factory`.
    pub fn new(
        max_connections: usize,
        acquire_timeout: Duration,
        factory: impl Fn() -> DbResult<Connection> + Send + Sync + 'static,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                state: Mutex::new(PoolState::default()),
                available: Condvar::new(),
                factory: Box::new(factory),
                max_connections: max_connections.max(1),
                acquire_timeout,
            }),
        }
    }

    /// Checks out a connection, waiting up to the pool's acquire timeout.
    pub fn acquire(&self) -> DbResult<PooledConn> {
        self.acquire_within(self.inner.acquire_timeout)
    }

    /// Checks out a connection, waiting at most `timeout`.
    pub fn acquire_within(&self, timeout: Duration) -> DbResult<PooledConn> {
        let deadline = Instant::now() + timeout.min(self.inner.acquire_timeout);
        let mut state = self.inner.state.lock();
        loop {
            if let Some(conn) = state.idle.pop() {
                return Ok(self.wrap(conn));
            }

            if state.open < self.inner.max_connections {
                state.open += 1;
                drop(state);
                return match (self.inner.factory)() {
                    Ok(conn) => {
                        debug!("event=pool_connect module=db status=ok");
                        Ok(self.wrap(conn))
                    }
                    Err(err) => {
                        let mut state = self.inner.state.lock();
                        state.open -= 1;
                        self.inner.available.notify_one();
                        Err(err)
                    }
                };
            }

            if self
                .inner
                .available
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                warn!(
                    "event=pool_acquire module=db status=error error_kind=timeout open={} max={}",
                    state.open, self.inner.max_connections
                );
                return Err(DbError::Timeout(format!(
                    "no pooled connection available within {}ms",
                    timeout.as_millis()
                )));
            }
        }
    }

    pub fn max_connections(&self) -> usize {
        self.inner.max_connections
    }

    /// Number of connections currently open (idle or checked out).
    pub fn open_connections(&self) -> usize {
        self.inner.state.lock().open
    }

    fn wrap(&self, conn: Connection) -> PooledConn {
        PooledConn {
            conn: Some(conn),
            pool: Arc::clone(&self.inner),
        }
    }
}

/// A checked-out connection.
pub struct PooledConn {
    conn: Option<Connection>,
    pool: Arc<PoolInner>,
}

impl PooledConn {
    /// Closes the connection instead of returning it to the pool.
    ///
    /// Used when a connection is left in an unknown transaction state.
    pub fn discard(mut self) {
        if let Some(conn) = self.conn.take() {
            drop(conn);
            let mut state = self.pool.state.lock();
            state.open -= 1;
            self.pool.available.notify_one();
        }
    }
}

impl Deref for PooledConn {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        match self.conn.as_ref() {
            Some(conn) => conn,
            None => unreachable!("pooled connection used after discard"),
        }
    }
}

impl DerefMut for PooledConn {
    fn deref_mut(&mut self) -> &mut Connection {
        match self.conn.as_mut() {
            Some(conn) => conn,
            None => unreachable!("pooled connection used after discard"),
        }
    }
}

impl Drop for PooledConn {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            let mut state = self.pool.state.lock();
            state.idle.push(conn);
            self.pool.available.notify_one();
        }
    }
}
