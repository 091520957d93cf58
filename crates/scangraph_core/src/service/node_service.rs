//! Node use-case service.
//!
//! # Responsibility
//! - Provide stable entry points for scanners and maintenance jobs.
//! - Delegate persistence to repository implementations.
//! - Run the orphan maintenance cycle (sweep, then retention-aware purge).
//!
//! # Invariants
//! - Nodes are validated before any repository write.
//! - Service layer remains storage-agnostic.

use crate::db::{Context, ErrorKind};
use crate::model::node::{Node, NodeValidationError};
use crate::repo::node_repo::NodeRepository;
use crate::repo::{now_ms, RepoError};
use log::info;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::time::Instant;

pub type ServiceResult<T> = Result<T, ServiceError>;

#[derive(Debug)]
pub enum ServiceError {
    Validation(NodeValidationError),
    NodeNotFound(String),
    Repo(RepoError),
}

impl ServiceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NodeNotFound(_) => ErrorKind::NotFound,
            Self::Repo(err) => err.kind(),
            Self::Validation(_) => ErrorKind::Unclassified,
        }
    }
}

impl Display for ServiceError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation(err) => write!(f, "invalid node: {err}"),
            Self::NodeNotFound(id) => write!(f, "node `{id}` not found"),
            Self::Repo(err) => write!(f, "{err}"),
        }
    }
}

impl Error for ServiceError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Validation(err) => Some(err),
            Self::Repo(err) => Some(err),
            Self::NodeNotFound(_) => None,
        }
    }
}

impl From<RepoError> for ServiceError {
    fn from(value: RepoError) -> Self {
        match value {
            RepoError::Validation(err) => Self::Validation(err),
            other => Self::Repo(other),
        }
    }
}

impl From<NodeValidationError> for ServiceError {
    fn from(value: NodeValidationError) -> Self {
        Self::Validation(value)
    }
}

/// Row counts of the scan graph.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GraphCounts {
    pub nodes: usize,
    pub components: usize,
    pub cves: usize,
}

/// Outcome of one [`NodeService::run_orphan_maintenance`] cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceSummary {
    /// CVEs newly marked as orphaned by the sweep.
    pub orphaned: usize,
    /// Orphaned CVEs deleted by the purge.
    pub purged: usize,
    /// Purge cutoff in epoch milliseconds.
    pub cutoff_ms: i64,
}

/// Use-case service wrapper for the node scan graph.
pub struct NodeService<R: NodeRepository> {
    repo: R,
}

impl<R: NodeRepository> NodeService<R> {
    pub fn new(repo: R) -> Self {
        Self { repo }
    }

    pub fn repository(&self) -> &R {
        &self.repo
    }

    /// Stores a scanned node.
    ///
    /// # Contract
    /// - Rejects invalid nodes with [`ServiceError::Validation`] before any write.
    /// - A scan older than the stored one keeps the stored scan; the remaining
    ///   node fields are still written.
    pub fn upsert_node(&self, ctx: &Context, node: &Node) -> ServiceResult<()> {
        node.validate()?;
        self.repo.upsert(ctx, node)?;
        Ok(())
    }

    pub fn get_node(&self, ctx: &Context, id: &str) -> ServiceResult<Option<Node>> {
        Ok(self.repo.get(ctx, id)?)
    }

    /// Like [`Self::get_node`], but a missing node is an error.
    pub fn require_node(&self, ctx: &Context, id: &str) -> ServiceResult<Node> {
        self.repo
            .get(ctx, id)?
            .ok_or_else(|| ServiceError::NodeNotFound(id.to_string()))
    }

    pub fn get_nodes(&self, ctx: &Context, ids: &[String]) -> ServiceResult<(Vec<Node>, Vec<usize>)> {
        Ok(self.repo.get_many(ctx, ids)?)
    }

    pub fn get_node_metadata(&self, ctx: &Context, id: &str) -> ServiceResult<Option<Node>> {
        Ok(self.repo.get_node_metadata(ctx, id)?)
    }

    pub fn delete_node(&self, ctx: &Context, id: &str) -> ServiceResult<()> {
        Ok(self.repo.delete(ctx, id)?)
    }

    pub fn delete_nodes(&self, ctx: &Context, ids: &[String]) -> ServiceResult<()> {
        Ok(self.repo.delete_many(ctx, ids)?)
    }

    pub fn node_exists(&self, ctx: &Context, id: &str) -> ServiceResult<bool> {
        Ok(self.repo.exists(ctx, id)?)
    }

    pub fn counts(&self, ctx: &Context) -> ServiceResult<GraphCounts> {
        Ok(GraphCounts {
            nodes: self.repo.count(ctx)?,
            components: self.repo.count_components(ctx)?,
            cves: self.repo.count_cves(ctx)?,
        })
    }

    pub fn snooze_cves(
        &self,
        ctx: &Context,
        cve_ids: &[String],
        expiry: Option<i64>,
    ) -> ServiceResult<usize> {
        Ok(self.repo.snooze_cves(ctx, cve_ids, expiry)?)
    }

    pub fn unsnooze_cves(&self, ctx: &Context, cve_ids: &[String]) -> ServiceResult<usize> {
        Ok(self.repo.unsnooze_cves(ctx, cve_ids)?)
    }

    /// Marks unreferenced CVEs as orphaned without deleting anything.
    pub fn sweep_orphans(&self, ctx: &Context) -> ServiceResult<usize> {
        Ok(self.repo.sweep_orphaned_cves(ctx)?)
    }

    /// Marks unreferenced CVEs as orphaned, then deletes those orphaned for
    /// at least `retention_ms`.
    ///
    /// A zero retention purges every orphan, including the ones just marked.
    pub fn run_orphan_maintenance(
        &self,
        ctx: &Context,
        retention_ms: u64,
    ) -> ServiceResult<MaintenanceSummary> {
        let started_at = Instant::now();
        info!(
            "event=orphan_maintenance module=service status=start retention_ms={}",
            retention_ms
        );

        let orphaned = self.repo.sweep_orphaned_cves(ctx)?;
        let retention = i64::try_from(retention_ms).unwrap_or(i64::MAX);
        let cutoff_ms = now_ms().saturating_sub(retention);
        let purged = self.repo.purge_orphaned_cves_before(ctx, cutoff_ms)?;

        info!(
            "event=orphan_maintenance module=service status=ok orphaned={} purged={} cutoff_ms={} duration_ms={}",
            orphaned,
            purged,
            cutoff_ms,
            started_at.elapsed().as_millis()
        );
        Ok(MaintenanceSummary {
            orphaned,
            purged,
            cutoff_ms,
        })
    }
}
