//! Upsert emulation over the append-only `copy_in` primitive.
//!
//! # Responsibility
//! - Replace rows by id: delete matching ids, then bulk-load the batch.
//! - Bound statement size and lock duration with fixed-size batches.
//!
//! # Invariants
//! - Writes only run inside a transaction carried by the context; a failed
//!   batch therefore never leaves earlier batches committed on their own.
//! - The first column of every row is the row id.

use crate::db::{Context, Database, DbResult};
use log::debug;
use rusqlite::params;
use rusqlite::types::Value;
use std::rc::Rc;

/// Builds the `rarray` parameter for `WHERE id IN rarray(?1)`.
pub fn id_array<S: AsRef<str>>(ids: &[S]) -> Rc<Vec<Value>> {
    Rc::new(
        ids.iter()
            .map(|id| Value::Text(id.as_ref().to_string()))
            .collect(),
    )
}

/// Deletes every row of `table` whose `id` is in `ids`, in batches.
pub fn delete_by_ids<S: AsRef<str>>(
    db: &Database,
    ctx: &Context,
    table: &str,
    ids: &[S],
    batch_size: usize,
) -> DbResult<usize> {
    ctx.require_tx()?;
    let sql = format!("DELETE FROM {table} WHERE id IN rarray(?1)");
    let mut deleted = 0;
    for chunk in ids.chunks(batch_size.max(1)) {
        deleted += db.exec(ctx, &sql, params![id_array(chunk)])?;
    }
    Ok(deleted)
}

/// Appends `rows` to `table` in batches, without deleting first.
pub fn copy_in_batches(
    db: &Database,
    ctx: &Context,
    table: &str,
    columns: &[&str],
    rows: &[Vec<Value>],
    batch_size: usize,
) -> DbResult<usize> {
    ctx.require_tx()?;
    let mut inserted = 0;
    for chunk in rows.chunks(batch_size.max(1)) {
        inserted += db.copy_in(ctx, table, columns, chunk)?;
    }
    Ok(inserted)
}

/// Replaces rows by id: per batch, delete the batch's ids then copy it in.
pub fn copy_upsert(
    db: &Database,
    ctx: &Context,
    table: &str,
    columns: &[&str],
    rows: &[Vec<Value>],
    batch_size: usize,
) -> DbResult<usize> {
    ctx.require_tx()?;
    let delete_sql = format!("DELETE FROM {table} WHERE id IN rarray(?1)");
    let mut written = 0;
    for (index, chunk) in rows.chunks(batch_size.max(1)).enumerate() {
        let ids: Vec<Value> = chunk.iter().filter_map(|row| row.first().cloned()).collect();
        let replaced = db.exec(ctx, &delete_sql, params![Rc::new(ids)])?;
        written += db.copy_in(ctx, table, columns, chunk)?;
        debug!(
            "event=bulk_upsert module=repo status=ok table={} batch={} rows={} replaced={}",
            table,
            index,
            chunk.len(),
            replaced
        );
    }
    Ok(written)
}
