//! Database bootstrap.
//!
//! # Responsibility
//! - Build the connection pool for a file or in-memory database.
//! - Configure every pooled connection the same way.
//! - Apply schema migrations before the database is handed out.
//!
//! # Invariants
//! - Every pooled connection has `foreign_keys=ON` and the `rarray` module.
//! - File databases run in WAL mode.
//! - In-memory databases use exactly one connection.

use super::database::Database;
use super::migrations::apply_migrations;
use super::pool::Pool;
use super::DbResult;
use crate::config::StoreConfig;
use log::{error, info};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Opens (or creates) a database file and applies pending migrations.
///
/// # Side effects
/// - Emits `db_open` logging events with duration and status.
pub fn open_db(path: impl AsRef<Path>, config: &StoreConfig) -> DbResult<Database> {
    let path = path.as_ref().to_path_buf();
    let busy_timeout = Duration::from_millis(config.busy_timeout_ms);
    let factory_path = path.clone();
    let pool = Pool::new(
        config.max_connections,
        Duration::from_millis(config.acquire_timeout_ms),
        move || connect_file(&factory_path, busy_timeout),
    );
    bootstrap(pool, config, "file", Some(path))
}

/// Opens a private in-memory database and applies all migrations.
///
/// The pool holds a single connection regardless of `max_connections`.
pub fn open_db_in_memory(config: &StoreConfig) -> DbResult<Database> {
    let busy_timeout = Duration::from_millis(config.busy_timeout_ms);
    let pool = Pool::new(
        1,
        Duration::from_millis(config.acquire_timeout_ms),
        move || connect_memory(busy_timeout),
    );
    bootstrap(pool, config, "memory", None)
}

fn bootstrap(
    pool: Pool,
    config: &StoreConfig,
    mode: &str,
    path: Option<PathBuf>,
) -> DbResult<Database> {
    let started_at = Instant::now();
    info!("event=db_open module=db status=start mode={mode}");

    let migrated = pool.acquire().and_then(|mut conn| {
        let conn: &mut Connection = &mut conn;
        apply_migrations(conn)
    });
    match migrated {
        Ok(()) => {
            info!(
                "event=db_open module=db status=ok mode={} path={} max_connections={} duration_ms={}",
                mode,
                path.as_deref().map_or("-".into(), Path::to_string_lossy),
                pool.max_connections(),
                started_at.elapsed().as_millis()
            );
            Ok(Database::new(
                pool,
                Duration::from_millis(config.default_query_timeout_ms),
            ))
        }
        Err(err) => {
            error!(
                "event=db_open module=db status=error mode={} duration_ms={} error_kind={} error={}",
                mode,
                started_at.elapsed().as_millis(),
                err.kind(),
                err
            );
            Err(err)
        }
    }
}

fn connect_file(path: &Path, busy_timeout: Duration) -> DbResult<Connection> {
    let conn = Connection::open(path)?;
    conn.query_row("PRAGMA journal_mode = WAL;", [], |row| row.get::<_, String>(0))?;
    configure_connection(&conn, busy_timeout)?;
    Ok(conn)
}

fn connect_memory(busy_timeout: Duration) -> DbResult<Connection> {
    let conn = Connection::open_in_memory()?;
    configure_connection(&conn, busy_timeout)?;
    Ok(conn)
}

fn configure_connection(conn: &Connection, busy_timeout: Duration) -> DbResult<()> {
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    conn.busy_timeout(busy_timeout)?;
    rusqlite::vtab::array::load_module(conn)?;
    Ok(())
}
