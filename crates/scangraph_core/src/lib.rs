//! Core storage for the node vulnerability scan graph.
//! Nodes, their components and the CVEs affecting them live in one SQLite
//! database; this crate is the single source of truth for its invariants.

pub mod cache;
pub mod concurrency;
pub mod config;
pub mod db;
pub mod logging;
pub mod metrics;
pub mod model;
pub mod repo;
pub mod service;

pub use config::{ConfigError, StoreConfig};
pub use db::{open_db, open_db_in_memory, CancelToken, Context, Database, DbError, ErrorKind};
pub use logging::{default_log_level, init_logging, logging_status, LoggingConfig};
pub use model::cve::{NodeCve, OrphanState, Severity, SnoozeState};
pub use model::node::{
    EmbeddedComponent, EmbeddedVulnerability, Node, NodeId, NodeScan, NodeValidationError,
};
pub use repo::node_repo::{NodeRepository, SqliteNodeRepository};
pub use repo::{RepoError, RepoResult};
pub use service::node_service::{
    GraphCounts, MaintenanceSummary, NodeService, ServiceError, ServiceResult,
};

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
