//! Node repository contract and SQLite implementation.
//!
//! # Responsibility
//! - Persist a node as five row kinds and read it back as one graph.
//! - Reject stale scans so an older scan never replaces a newer one.
//! - Keep child rows alive only while referenced (orphan sweeps).
//!
//! # Invariants
//! - Write order inside one transaction: node row, node edges, components
//!   (then component sweep), component-to-CVE edges, CVEs (then CVE orphan
//!   marking).
//! - Upserts touching overlapping node/component/CVE ids never run their
//!   delete-then-load cycles concurrently (key fence).
//! - Every entry point is retried as a whole on transient errors, except
//!   inside a caller-supplied transaction.

use super::component_repo;
use super::cve_repo::CveStore;
use super::{decode, encode, now_ms, RepoResult};
use crate::cache::{ReadToken, TxCache};
use crate::concurrency::{KeyFence, KeySet};
use crate::config::StoreConfig;
use crate::db::{retry, Context, Database, OptionalExt, RetryPolicy};
use crate::metrics::{self, Op};
use crate::model::component::NodeComponent;
use crate::model::cve::SnoozeState;
use crate::model::node::Node;
use crate::model::parts::{merge, split, ComponentParts, CveParts, NodeParts};
use log::{error, info, warn};
use rusqlite::params;

const METRICS_TARGET: &str = "node";

const NODE_UPSERT_SQL: &str = "INSERT INTO nodes (
    id,
    name,
    cluster_id,
    cluster_name,
    os_image,
    container_runtime_version,
    joined_at,
    last_updated,
    scan_time,
    risk_score,
    components,
    cves,
    fixable_cves,
    top_cvss,
    serialized
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
ON CONFLICT(id) DO UPDATE SET
    name = excluded.name,
    cluster_id = excluded.cluster_id,
    cluster_name = excluded.cluster_name,
    os_image = excluded.os_image,
    container_runtime_version = excluded.container_runtime_version,
    joined_at = excluded.joined_at,
    last_updated = excluded.last_updated,
    scan_time = excluded.scan_time,
    risk_score = excluded.risk_score,
    components = excluded.components,
    cves = excluded.cves,
    fixable_cves = excluded.fixable_cves,
    top_cvss = excluded.top_cvss,
    serialized = excluded.serialized";

/// Repository interface for the node scan graph.
pub trait NodeRepository {
    /// Full node with components and vulnerabilities; `None` when absent.
    fn get(&self, ctx: &Context, id: &str) -> RepoResult<Option<Node>>;
    /// Found nodes in request order plus the indices of ids not found.
    fn get_many(&self, ctx: &Context, ids: &[String]) -> RepoResult<(Vec<Node>, Vec<usize>)>;
    /// Stored node row only; its scan carries no components.
    fn get_node_metadata(&self, ctx: &Context, id: &str) -> RepoResult<Option<Node>>;
    fn get_many_node_metadata(
        &self,
        ctx: &Context,
        ids: &[String],
    ) -> RepoResult<(Vec<Node>, Vec<usize>)>;
    fn upsert(&self, ctx: &Context, node: &Node) -> RepoResult<()>;
    fn delete(&self, ctx: &Context, id: &str) -> RepoResult<()>;
    fn delete_many(&self, ctx: &Context, ids: &[String]) -> RepoResult<()>;
    fn count(&self, ctx: &Context) -> RepoResult<usize>;
    fn exists(&self, ctx: &Context, id: &str) -> RepoResult<bool>;
    /// Marks unreferenced CVEs as orphaned; returns how many were marked.
    fn sweep_orphaned_cves(&self, ctx: &Context) -> RepoResult<usize>;
    /// Deletes every orphaned CVE; returns how many were deleted.
    fn purge_orphaned_cves(&self, ctx: &Context) -> RepoResult<usize>;
    /// Deletes CVEs orphaned at or before `cutoff_ms`.
    fn purge_orphaned_cves_before(&self, ctx: &Context, cutoff_ms: i64) -> RepoResult<usize>;
    fn snooze_cves(
        &self,
        ctx: &Context,
        cve_ids: &[String],
        expiry: Option<i64>,
    ) -> RepoResult<usize>;
    fn unsnooze_cves(&self, ctx: &Context, cve_ids: &[String]) -> RepoResult<usize>;
    fn count_components(&self, ctx: &Context) -> RepoResult<usize>;
    fn count_cves(&self, ctx: &Context) -> RepoResult<usize>;
}

/// SQLite-backed node repository.
///
/// Holds the key fence and the CVE cache, so one instance should be shared
/// by every writer of the same database.
pub struct SqliteNodeRepository {
    db: Database,
    fence: KeyFence,
    cves: CveStore,
    retry: RetryPolicy,
    batch_size: usize,
    no_update_timestamps: bool,
}

impl SqliteNodeRepository {
    pub fn new(db: Database, config: &StoreConfig) -> Self {
        Self {
            db,
            fence: KeyFence::new(),
            cves: CveStore::new(),
            retry: RetryPolicy::from_config(config),
            batch_size: config.batch_size.max(1),
            no_update_timestamps: config.no_update_timestamps,
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn cve_store(&self) -> &CveStore {
        &self.cves
    }

    /// Runs `f` inside a transaction: a new one, or the one carried by `ctx`.
    ///
    /// Commits on success and rolls back on error; both are no-ops when the
    /// transaction belongs to the caller.
    fn transact<T>(
        &self,
        ctx: &Context,
        write: bool,
        f: impl FnOnce(&Context) -> RepoResult<T>,
    ) -> RepoResult<T> {
        let tx = if write {
            self.db.begin(ctx)?
        } else {
            self.db.begin_read(ctx)?
        };
        let tx_ctx = ctx.with_tx(&tx);
        match f(&tx_ctx) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback() {
                    warn!(
                        "event=tx_rollback module=repo status=error tx_id={} error={}",
                        tx.id(),
                        rollback_err
                    );
                }
                Err(err)
            }
        }
    }

    /// Applies the stale-scan rule against the stored row.
    ///
    /// Returns whether the incoming scan is accepted. When it is not, the
    /// stored scan and its derived fields replace the incoming ones.
    fn reconcile_scan(&self, ctx: &Context, node: &mut Node) -> RepoResult<bool> {
        let Some(stored) = self.read_node_row(ctx, &node.id)? else {
            return Ok(true);
        };
        if node.scan_is_newer_or_equal(&stored) {
            return Ok(true);
        }
        info!(
            "event=node_upsert module=repo status=stale node_id={} stored_scan_time={:?} incoming_scan_time={:?}",
            node.id,
            stored.scan_time(),
            node.scan_time()
        );
        node.adopt_scan_state(&stored);
        Ok(false)
    }

    fn upsert_once(&self, ctx: &Context, node: &Node) -> RepoResult<()> {
        let now = now_ms();
        let mut node = node.clone();
        if !self.no_update_timestamps {
            node.last_updated = Some(now);
        }
        node.refresh_summary();

        // A stale write touches a subset of these keys.
        let parts = split(&node, true, now);
        let keys = KeySet::new(parts.keys());
        self.fence.do_with_lock(&keys, || {
            self.transact(ctx, true, |tx_ctx| {
                if self.reconcile_scan(tx_ctx, &mut node)? {
                    self.write_parts(tx_ctx, &parts, true, now)
                } else {
                    self.write_parts(tx_ctx, &split(&node, false, now), false, now)
                }
            })
        })
    }

    fn write_parts(
        &self,
        ctx: &Context,
        parts: &NodeParts,
        scan_updated: bool,
        now: i64,
    ) -> RepoResult<()> {
        self.write_node_row(ctx, &parts.node)?;
        if !scan_updated {
            return Ok(());
        }

        component_repo::replace_node_edges(
            &self.db,
            ctx,
            &parts.node.id,
            parts.component_edges(),
            self.batch_size,
        )?;
        component_repo::upsert_components(&self.db, ctx, parts.components(), self.batch_size)?;
        component_repo::remove_orphaned_components(&self.db, ctx)?;
        component_repo::upsert_cve_edges(&self.db, ctx, parts.cve_edges(), self.batch_size)?;
        self.cves
            .upsert(&self.db, ctx, parts.unique_cves(), now, self.batch_size)?;
        self.cves.mark_orphaned(&self.db, ctx, now)?;
        Ok(())
    }

    fn write_node_row(&self, ctx: &Context, node: &Node) -> RepoResult<()> {
        self.db.exec(
            ctx,
            NODE_UPSERT_SQL,
            params![
                node.id,
                node.name,
                node.cluster_id,
                node.cluster_name,
                node.os_image,
                node.container_runtime_version,
                node.joined_at,
                node.last_updated,
                node.scan_time(),
                f64::from(node.risk_score),
                node.components,
                node.cves,
                node.fixable_cves,
                f64::from(node.top_cvss),
                encode(node)?,
            ],
        )?;
        Ok(())
    }

    fn read_node_row(&self, ctx: &Context, id: &str) -> RepoResult<Option<Node>> {
        let blob = self
            .db
            .query_row(
                ctx,
                "SELECT serialized FROM nodes WHERE id = ?1",
                params![id],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()?;
        blob.map(|blob| decode(&blob)).transpose()
    }

    /// Reads the node graph outward from the node row: node edges, components
    /// (through `components`), component-to-CVE edges, CVEs.
    fn load_graph(
        &self,
        ctx: &Context,
        node: Node,
        components: &mut TxCache<NodeComponent>,
        cve_token: Option<ReadToken>,
    ) -> RepoResult<Node> {
        let edges = component_repo::node_edges(&self.db, ctx, &node.id)?;
        if edges.is_empty() {
            return Ok(node);
        }
        let component_ids: Vec<String> = edges
            .iter()
            .map(|edge| edge.component_id.clone())
            .collect();
        let mut by_id =
            component_repo::components_by_id(&self.db, ctx, &component_ids, components)?;
        if by_id.len() != edges.len() {
            error!(
                "event=node_get module=repo status=inconsistent node_id={} edges={} components={}",
                node.id,
                edges.len(),
                by_id.len()
            );
        }

        let mut cve_edges =
            component_repo::cve_edges_by_component(&self.db, ctx, &component_ids)?;
        let mut cve_ids: Vec<String> = cve_edges
            .values()
            .flatten()
            .map(|edge| edge.cve_id.clone())
            .collect();
        cve_ids.sort_unstable();
        cve_ids.dedup();
        let cves = self.cves.get_many(&self.db, ctx, &cve_ids, cve_token)?;

        let mut children = Vec::with_capacity(edges.len());
        for edge in edges {
            let Some(component) = by_id.remove(&edge.component_id) else {
                continue;
            };
            let cve_children = cve_edges
                .remove(&component.id)
                .unwrap_or_default()
                .into_iter()
                .filter_map(|cve_edge| match cves.get(&cve_edge.cve_id) {
                    Some(cve) => Some(CveParts {
                        cve: cve.as_ref().clone(),
                        edge: cve_edge,
                    }),
                    None => {
                        error!(
                            "event=node_get module=repo status=inconsistent node_id={} missing_cve={}",
                            node.id, cve_edge.cve_id
                        );
                        None
                    }
                })
                .collect();
            children.push(ComponentParts {
                edge,
                component,
                children: cve_children,
            });
        }

        Ok(merge(NodeParts { node, children }))
    }

    fn get_many_with<F>(
        &self,
        ctx: &Context,
        ids: &[String],
        op: Op,
        mut load: F,
    ) -> RepoResult<(Vec<Node>, Vec<usize>)>
    where
        F: FnMut(&Context, Node) -> RepoResult<Node>,
    {
        self.transact(ctx, false, |tx_ctx| {
            let mut found = Vec::with_capacity(ids.len());
            let mut missing = Vec::new();
            for (index, id) in ids.iter().enumerate() {
                match self.read_node_row(tx_ctx, id)? {
                    Some(row) => found.push(load(tx_ctx, row)?),
                    None => missing.push(index),
                }
            }
            info!(
                "event=node_{} module=repo status=ok requested={} found={}",
                op.as_str(),
                ids.len(),
                found.len()
            );
            Ok((found, missing))
        })
    }

    fn remove_nodes(&self, ctx: &Context, ids: &[String]) -> RepoResult<()> {
        let keys = KeySet::new(ids.iter().cloned());
        self.fence.do_with_lock(&keys, || {
            self.transact(ctx, true, |tx_ctx| {
                let mut removed = 0;
                for id in ids {
                    removed += self
                        .db
                        .exec(tx_ctx, "DELETE FROM nodes WHERE id = ?1", params![id])?;
                }
                let components = component_repo::remove_orphaned_components(&self.db, tx_ctx)?;
                let orphaned = self.cves.mark_orphaned(&self.db, tx_ctx, now_ms())?;
                info!(
                    "event=node_delete module=repo status=ok requested={} removed={} components_removed={} cves_orphaned={}",
                    ids.len(),
                    removed,
                    components,
                    orphaned
                );
                Ok(())
            })
        })
    }

    fn timed<T>(
        &self,
        ctx: &Context,
        op: Op,
        f: impl FnMut() -> RepoResult<T>,
    ) -> RepoResult<T> {
        let timer = metrics::timer(op, METRICS_TARGET);
        let result = retry(ctx, &self.retry, op.as_str(), f);
        if let Err(err) = &result {
            error!(
                "event=node_{} module=repo status=error error_kind={} error={}",
                op.as_str(),
                err.kind(),
                err
            );
        }
        timer.track(result)
    }
}

impl NodeRepository for SqliteNodeRepository {
    fn get(&self, ctx: &Context, id: &str) -> RepoResult<Option<Node>> {
        self.timed(ctx, Op::Get, || {
            let token = ctx.tx().is_none().then(|| self.cves.read_token());
            self.transact(ctx, false, |tx_ctx| {
                let Some(row) = self.read_node_row(tx_ctx, id)? else {
                    return Ok(None);
                };
                let mut components = TxCache::new();
                self.load_graph(tx_ctx, row, &mut components, token)
                    .map(Some)
            })
        })
    }

    fn get_many(&self, ctx: &Context, ids: &[String]) -> RepoResult<(Vec<Node>, Vec<usize>)> {
        self.timed(ctx, Op::GetMany, || {
            let token = ctx.tx().is_none().then(|| self.cves.read_token());
            let mut components = TxCache::new();
            self.get_many_with(ctx, ids, Op::GetMany, |tx_ctx, row| {
                self.load_graph(tx_ctx, row, &mut components, token)
            })
        })
    }

    fn get_node_metadata(&self, ctx: &Context, id: &str) -> RepoResult<Option<Node>> {
        self.timed(ctx, Op::GetMetadata, || self.read_node_row(ctx, id))
    }

    fn get_many_node_metadata(
        &self,
        ctx: &Context,
        ids: &[String],
    ) -> RepoResult<(Vec<Node>, Vec<usize>)> {
        self.timed(ctx, Op::GetMetadata, || {
            self.get_many_with(ctx, ids, Op::GetMetadata, |_, row| Ok(row))
        })
    }

    fn upsert(&self, ctx: &Context, node: &Node) -> RepoResult<()> {
        node.validate()?;
        self.timed(ctx, Op::Upsert, || self.upsert_once(ctx, node))?;
        info!(
            "event=node_upsert module=repo status=ok node_id={}",
            node.id
        );
        Ok(())
    }

    fn delete(&self, ctx: &Context, id: &str) -> RepoResult<()> {
        let ids = [id.to_string()];
        self.timed(ctx, Op::Remove, || self.remove_nodes(ctx, &ids))
    }

    fn delete_many(&self, ctx: &Context, ids: &[String]) -> RepoResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        self.timed(ctx, Op::RemoveMany, || self.remove_nodes(ctx, ids))
    }

    fn count(&self, ctx: &Context) -> RepoResult<usize> {
        self.timed(ctx, Op::Count, || {
            let count = self
                .db
                .query_row(ctx, "SELECT COUNT(*) FROM nodes", [], |row| row.get::<_, i64>(0))?;
            Ok(usize::try_from(count).unwrap_or_default())
        })
    }

    fn exists(&self, ctx: &Context, id: &str) -> RepoResult<bool> {
        self.timed(ctx, Op::Exists, || {
            Ok(self.db.query_row(
                ctx,
                "SELECT EXISTS (SELECT 1 FROM nodes WHERE id = ?1)",
                params![id],
                |row| row.get::<_, bool>(0),
            )?)
        })
    }

    fn sweep_orphaned_cves(&self, ctx: &Context) -> RepoResult<usize> {
        self.timed(ctx, Op::SweepOrphans, || {
            self.transact(ctx, true, |tx_ctx| {
                component_repo::remove_orphaned_components(&self.db, tx_ctx)?;
                self.cves.mark_orphaned(&self.db, tx_ctx, now_ms())
            })
        })
    }

    fn purge_orphaned_cves(&self, ctx: &Context) -> RepoResult<usize> {
        self.timed(ctx, Op::PurgeOrphans, || {
            self.transact(ctx, true, |tx_ctx| {
                self.cves.remove_orphaned(&self.db, tx_ctx, None)
            })
        })
    }

    fn purge_orphaned_cves_before(&self, ctx: &Context, cutoff_ms: i64) -> RepoResult<usize> {
        self.timed(ctx, Op::PurgeOrphans, || {
            self.transact(ctx, true, |tx_ctx| {
                self.cves.remove_orphaned(&self.db, tx_ctx, Some(cutoff_ms))
            })
        })
    }

    fn snooze_cves(
        &self,
        ctx: &Context,
        cve_ids: &[String],
        expiry: Option<i64>,
    ) -> RepoResult<usize> {
        let snooze = SnoozeState::Snoozed {
            since: now_ms(),
            until: expiry,
        };
        self.timed(ctx, Op::UpdateState, || {
            self.transact(ctx, true, |tx_ctx| {
                self.cves.set_snooze(&self.db, tx_ctx, cve_ids, snooze)
            })
        })
    }

    fn unsnooze_cves(&self, ctx: &Context, cve_ids: &[String]) -> RepoResult<usize> {
        self.timed(ctx, Op::UpdateState, || {
            self.transact(ctx, true, |tx_ctx| {
                self.cves
                    .set_snooze(&self.db, tx_ctx, cve_ids, SnoozeState::Active)
            })
        })
    }

    fn count_components(&self, ctx: &Context) -> RepoResult<usize> {
        self.timed(ctx, Op::Count, || component_repo::count_components(&self.db, ctx))
    }

    fn count_cves(&self, ctx: &Context) -> RepoResult<usize> {
        self.timed(ctx, Op::Count, || self.cves.count(&self.db, ctx))
    }
}
