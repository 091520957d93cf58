//! Scan graph schema and its migration runner.
//!
//! # Responsibility
//! - Create the five scan graph tables: `nodes`, `node_components`,
//!   `node_cves`, `node_component_edges` and `node_component_cve_edges`.
//! - Bring an older database file up to the latest schema on open.
//!
//! # Invariants
//! - Deleting a node removes its node edges, and deleting a component removes
//!   its CVE edges (`ON DELETE CASCADE`); the orphan sweeps rely on this.
//! - CVE rows have no foreign key to their edges: they outlive them as
//!   orphans until purged.
//! - Migration versions are strictly increasing and mirrored to
//!   `PRAGMA user_version`; all pending ones apply in one transaction.
//! - A database newer than the latest known version is rejected, never
//!   downgraded.

use crate::db::{DbError, DbResult};
use log::info;
use rusqlite::Connection;

#[derive(Debug, Clone, Copy)]
struct Migration {
    version: u32,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    sql: include_str!("0001_init.sql"),
}];

/// Returns the latest schema version known by this binary.
pub fn latest_version() -> u32 {
    MIGRATIONS.last().map_or(0, |migration| migration.version)
}

/// Applies every migration newer than the database's `user_version`.
pub fn apply_migrations(conn: &mut Connection) -> DbResult<()> {
    let from_version = current_user_version(conn)?;
    let latest = latest_version();
    if from_version > latest {
        return Err(DbError::UnsupportedSchemaVersion {
            db_version: from_version,
            latest_supported: latest,
        });
    }

    let pending: Vec<&Migration> = MIGRATIONS
        .iter()
        .filter(|migration| migration.version > from_version)
        .collect();
    if pending.is_empty() {
        return Ok(());
    }

    let tx = conn.transaction()?;
    for migration in &pending {
        tx.execute_batch(migration.sql)?;
        tx.pragma_update(None, "user_version", migration.version)?;
    }
    tx.commit()?;

    info!(
        "event=db_migrate module=db status=ok from_version={} to_version={} applied={}",
        from_version,
        latest,
        pending.len()
    );
    Ok(())
}

pub fn current_user_version(conn: &Connection) -> DbResult<u32> {
    let version = conn.query_row("PRAGMA user_version;", [], |row| row.get::<_, u32>(0))?;
    Ok(version)
}
