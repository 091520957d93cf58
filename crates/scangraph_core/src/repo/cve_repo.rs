//! CVE rows behind the process-wide snapshot cache.
//!
//! # Responsibility
//! - Rewrite CVE rows while carrying forward user state and provenance.
//! - Mark unreferenced CVEs as orphaned and purge them on request.
//! - Serve reads from [`SharedCache`] without ever exposing stale rows.
//!
//! # Invariants
//! - Ids written by the current transaction bypass the cache (they are not
//!   committed yet, or not visible to other readers yet).
//! - Every write invalidates its ids immediately and again when the writing
//!   transaction finishes.
//! - Reads populate the cache only with a [`ReadToken`] taken before their
//!   transaction started, so rows read from an old snapshot are discarded.

use super::bulk::{copy_upsert, id_array};
use super::{decode, encode, RepoResult};
use crate::cache::{ReadToken, SharedCache};
use crate::db::{Context, Database, Tx};
use crate::model::cve::{NodeCve, OrphanState, SnoozeState};
use log::{debug, info};
use rusqlite::params;
use rusqlite::types::Value;
use std::collections::HashMap;
use std::sync::Arc;

const CVES_TABLE: &str = "node_cves";
const CVE_COLUMNS: &[&str] = &[
    "id",
    "cve",
    "operating_system",
    "published_on",
    "created_at",
    "cvss",
    "severity",
    "impact_score",
    "snoozed",
    "snooze_expiry",
    "orphaned",
    "orphaned_time",
    "serialized",
];
const DIRTY_SCOPE: &str = "node_cves";

pub struct CveStore {
    cache: Arc<SharedCache<NodeCve>>,
}

impl Default for CveStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CveStore {
    pub fn new() -> Self {
        Self {
            cache: Arc::new(SharedCache::new()),
        }
    }

    pub fn cache(&self) -> &SharedCache<NodeCve> {
        &self.cache
    }

    pub fn read_token(&self) -> ReadToken {
        self.cache.read_token()
    }

    /// Loads CVEs by id.
    ///
    /// `populate` carries the token taken before the surrounding read
    /// transaction began; `None` skips cache population.
    pub fn get_many(
        &self,
        db: &Database,
        ctx: &Context,
        ids: &[String],
        populate: Option<ReadToken>,
    ) -> RepoResult<HashMap<String, Arc<NodeCve>>> {
        let tx = ctx.tx();
        let (dirty, cacheable): (Vec<String>, Vec<String>) = ids
            .iter()
            .cloned()
            .partition(|id| tx.is_some_and(|tx| tx.is_dirty(DIRTY_SCOPE, id)));

        let (mut found, mut missing) = self.cache.get_many(&cacheable);
        let from_cache = found.len();

        if !missing.is_empty() {
            let loaded = load_rows(db, ctx, &missing)?;
            if let Some(token) = populate {
                self.cache.set_many_if_fresh(
                    token,
                    loaded.iter().map(|cve| (cve.id.clone(), cve.clone())),
                );
            }
            found.extend(loaded.into_iter().map(|cve| (cve.id.clone(), Arc::new(cve))));
        }
        if !dirty.is_empty() {
            missing.extend(dirty.iter().cloned());
            let loaded = load_rows(db, ctx, &dirty)?;
            found.extend(loaded.into_iter().map(|cve| (cve.id.clone(), Arc::new(cve))));
        }

        debug!(
            "event=cve_cache module=repo status=ok requested={} hits={} db_reads={}",
            ids.len(),
            from_cache,
            missing.len()
        );
        Ok(found)
    }

    /// Rewrites `cves`, keeping `created_at` and snooze state of stored rows.
    /// CVEs without a stored row get `created_at = now`.
    pub fn upsert(
        &self,
        db: &Database,
        ctx: &Context,
        mut cves: Vec<NodeCve>,
        now: i64,
        batch_size: usize,
    ) -> RepoResult<usize> {
        let tx = ctx.require_tx()?;
        if cves.is_empty() {
            return Ok(0);
        }
        let ids: Vec<String> = cves.iter().map(|cve| cve.id.clone()).collect();

        let stored: HashMap<String, NodeCve> = load_rows(db, ctx, &ids)?
            .into_iter()
            .map(|cve| (cve.id.clone(), cve))
            .collect();
        for cve in &mut cves {
            match stored.get(&cve.id) {
                Some(existing) => cve.carry_forward_from(existing),
                None => cve.created_at = now,
            }
            cve.orphan = OrphanState::Active;
        }

        self.invalidate_in_tx(tx, ids)?;
        let rows = cves.iter().map(cve_row).collect::<RepoResult<Vec<_>>>()?;
        Ok(copy_upsert(db, ctx, CVES_TABLE, CVE_COLUMNS, &rows, batch_size)?)
    }

    /// Marks every active CVE without a component edge as orphaned at `now`.
    pub fn mark_orphaned(&self, db: &Database, ctx: &Context, now: i64) -> RepoResult<usize> {
        let tx = ctx.require_tx()?;
        let blobs = db.query(
            ctx,
            "SELECT serialized FROM node_cves
             WHERE orphaned = 0
               AND NOT EXISTS (
                   SELECT 1 FROM node_component_cve_edges edges
                   WHERE edges.node_cve_id = node_cves.id
               )",
            [],
            |row| row.get::<_, Vec<u8>>(0),
        )?;
        if blobs.is_empty() {
            return Ok(0);
        }

        let mut orphaned = blobs
            .iter()
            .map(|blob| decode::<NodeCve>(blob))
            .collect::<RepoResult<Vec<_>>>()?;
        let ids: Vec<String> = orphaned.iter().map(|cve| cve.id.clone()).collect();
        self.invalidate_in_tx(tx, ids)?;

        for cve in &mut orphaned {
            cve.orphan = OrphanState::Orphaned { since: now };
            db.exec(
                ctx,
                "UPDATE node_cves
                 SET orphaned = 1, orphaned_time = ?1, serialized = ?2
                 WHERE id = ?3",
                params![now, encode(&*cve)?, cve.id],
            )?;
        }
        info!(
            "event=cve_orphan_mark module=repo status=ok marked={}",
            orphaned.len()
        );
        Ok(orphaned.len())
    }

    /// Deletes orphaned CVEs; with `cutoff` only those orphaned at or before it.
    pub fn remove_orphaned(
        &self,
        db: &Database,
        ctx: &Context,
        cutoff: Option<i64>,
    ) -> RepoResult<usize> {
        let tx = ctx.require_tx()?;
        let removed = db.query(
            ctx,
            "DELETE FROM node_cves
             WHERE orphaned = 1
               AND (?1 IS NULL OR orphaned_time <= ?1)
               AND NOT EXISTS (
                   SELECT 1 FROM node_component_cve_edges edges
                   WHERE edges.node_cve_id = node_cves.id
               )
             RETURNING id",
            params![cutoff],
            |row| row.get::<_, String>(0),
        )?;
        let count = removed.len();
        if count > 0 {
            self.invalidate_in_tx(tx, removed)?;
        }
        info!("event=cve_orphan_purge module=repo status=ok removed={count}");
        Ok(count)
    }

    /// Replaces the snooze state of the given CVEs. Unknown ids are ignored.
    pub fn set_snooze(
        &self,
        db: &Database,
        ctx: &Context,
        ids: &[String],
        snooze: SnoozeState,
    ) -> RepoResult<usize> {
        let tx = ctx.require_tx()?;
        let mut rows = load_rows(db, ctx, ids)?;
        if rows.is_empty() {
            return Ok(0);
        }
        self.invalidate_in_tx(tx, rows.iter().map(|cve| cve.id.clone()).collect())?;

        for cve in &mut rows {
            cve.snooze = snooze;
            db.exec(
                ctx,
                "UPDATE node_cves
                 SET snoozed = ?1, snooze_expiry = ?2, serialized = ?3
                 WHERE id = ?4",
                params![
                    snooze.is_snoozed(),
                    snooze.expiry(),
                    encode(&*cve)?,
                    cve.id
                ],
            )?;
        }
        Ok(rows.len())
    }

    pub fn count(&self, db: &Database, ctx: &Context) -> RepoResult<usize> {
        let count = db.query_row(ctx, "SELECT COUNT(*) FROM node_cves", [], |row| {
            row.get::<_, i64>(0)
        })?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    /// Marks `ids` dirty in `tx`, drops them from the cache now and again once
    /// `tx` finishes.
    fn invalidate_in_tx(&self, tx: &Tx, ids: Vec<String>) -> RepoResult<()> {
        tx.mark_dirty(DIRTY_SCOPE, ids.iter().cloned());
        self.cache.delete_many(&ids);
        let cache = Arc::clone(&self.cache);
        tx.on_finish(move |_| cache.delete_many(&ids))?;
        Ok(())
    }
}

fn load_rows(db: &Database, ctx: &Context, ids: &[String]) -> RepoResult<Vec<NodeCve>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let blobs = db.query(
        ctx,
        "SELECT serialized FROM node_cves WHERE id IN rarray(?1)",
        params![id_array(ids)],
        |row| row.get::<_, Vec<u8>>(0),
    )?;
    blobs.iter().map(|blob| decode(blob)).collect()
}

fn cve_row(cve: &NodeCve) -> RepoResult<Vec<Value>> {
    let optional = |value: Option<i64>| value.map_or(Value::Null, Value::Integer);
    Ok(vec![
        Value::Text(cve.id.clone()),
        Value::Text(cve.cve.clone()),
        Value::Text(cve.operating_system.clone()),
        optional(cve.published_on),
        Value::Integer(cve.created_at),
        Value::Real(f64::from(cve.cvss)),
        Value::Text(cve.severity.as_str().to_string()),
        Value::Real(f64::from(cve.impact_score)),
        Value::Integer(i64::from(cve.snooze.is_snoozed())),
        optional(cve.snooze.expiry()),
        Value::Integer(i64::from(cve.orphan.is_orphaned())),
        optional(cve.orphan.since()),
        Value::Blob(encode(cve)?),
    ])
}
