//! Component rows and the two edge tables.
//!
//! # Responsibility
//! - Replace a node's component edges as one set.
//! - Replace component rows and component-to-CVE edges by id.
//! - Remove component rows that no node references anymore.
//!
//! # Invariants
//! - After [`remove_orphaned_components`] every component row is referenced
//!   by at least one node edge.
//! - Deleting a component row cascades to its component-to-CVE edges.

use super::bulk::{copy_in_batches, copy_upsert, id_array};
use super::{decode, encode, RepoResult};
use crate::cache::TxCache;
use crate::db::{Context, Database};
use crate::model::component::NodeComponent;
use crate::model::edge::{ComponentCveEdge, NodeComponentEdge};
use log::debug;
use rusqlite::params;
use rusqlite::types::Value;
use std::collections::HashMap;

const COMPONENTS_TABLE: &str = "node_components";
const COMPONENT_COLUMNS: &[&str] = &[
    "id",
    "name",
    "version",
    "operating_system",
    "priority",
    "risk_score",
    "top_cvss",
    "serialized",
];

const NODE_EDGES_TABLE: &str = "node_component_edges";
const NODE_EDGE_COLUMNS: &[&str] = &["id", "node_id", "node_component_id", "serialized"];

const CVE_EDGES_TABLE: &str = "node_component_cve_edges";
const CVE_EDGE_COLUMNS: &[&str] = &[
    "id",
    "is_fixable",
    "fixed_by",
    "node_component_id",
    "node_cve_id",
    "serialized",
];

/// Replaces every component edge of `node_id` with `edges`.
pub fn replace_node_edges<'a>(
    db: &Database,
    ctx: &Context,
    node_id: &str,
    edges: impl IntoIterator<Item = &'a NodeComponentEdge>,
    batch_size: usize,
) -> RepoResult<usize> {
    ctx.require_tx()?;
    db.exec(
        ctx,
        "DELETE FROM node_component_edges WHERE node_id = ?1",
        params![node_id],
    )?;

    let rows = edges
        .into_iter()
        .map(|edge| {
            Ok(vec![
                Value::Text(edge.id.clone()),
                Value::Text(edge.node_id.clone()),
                Value::Text(edge.component_id.clone()),
                Value::Blob(encode(edge)?),
            ])
        })
        .collect::<RepoResult<Vec<_>>>()?;
    Ok(copy_in_batches(
        db,
        ctx,
        NODE_EDGES_TABLE,
        NODE_EDGE_COLUMNS,
        &rows,
        batch_size,
    )?)
}

pub fn upsert_components<'a>(
    db: &Database,
    ctx: &Context,
    components: impl IntoIterator<Item = &'a NodeComponent>,
    batch_size: usize,
) -> RepoResult<usize> {
    let rows = components
        .into_iter()
        .map(|component| {
            Ok(vec![
                Value::Text(component.id.clone()),
                Value::Text(component.name.clone()),
                Value::Text(component.version.clone()),
                Value::Text(component.operating_system.clone()),
                Value::Integer(component.priority),
                Value::Real(f64::from(component.risk_score)),
                Value::Real(f64::from(component.top_cvss)),
                Value::Blob(encode(component)?),
            ])
        })
        .collect::<RepoResult<Vec<_>>>()?;
    Ok(copy_upsert(
        db,
        ctx,
        COMPONENTS_TABLE,
        COMPONENT_COLUMNS,
        &rows,
        batch_size,
    )?)
}

pub fn upsert_cve_edges<'a>(
    db: &Database,
    ctx: &Context,
    edges: impl IntoIterator<Item = &'a ComponentCveEdge>,
    batch_size: usize,
) -> RepoResult<usize> {
    let rows = edges
        .into_iter()
        .map(|edge| {
            Ok(vec![
                Value::Text(edge.id.clone()),
                Value::Integer(i64::from(edge.is_fixable)),
                edge.fixed_by.clone().map_or(Value::Null, Value::Text),
                Value::Text(edge.component_id.clone()),
                Value::Text(edge.cve_id.clone()),
                Value::Blob(encode(edge)?),
            ])
        })
        .collect::<RepoResult<Vec<_>>>()?;
    Ok(copy_upsert(
        db,
        ctx,
        CVE_EDGES_TABLE,
        CVE_EDGE_COLUMNS,
        &rows,
        batch_size,
    )?)
}

/// Deletes component rows without any node edge.
pub fn remove_orphaned_components(db: &Database, ctx: &Context) -> RepoResult<usize> {
    ctx.require_tx()?;
    let removed = db.exec(
        ctx,
        "DELETE FROM node_components
         WHERE NOT EXISTS (
             SELECT 1 FROM node_component_edges edges
             WHERE edges.node_component_id = node_components.id
         )",
        [],
    )?;
    if removed > 0 {
        debug!("event=component_sweep module=repo status=ok removed={removed}");
    }
    Ok(removed)
}

/// Component edges of one node, ordered by id.
pub fn node_edges(db: &Database, ctx: &Context, node_id: &str) -> RepoResult<Vec<NodeComponentEdge>> {
    let blobs = db.query(
        ctx,
        "SELECT serialized FROM node_component_edges WHERE node_id = ?1 ORDER BY id",
        params![node_id],
        |row| row.get::<_, Vec<u8>>(0),
    )?;
    blobs.iter().map(|blob| decode(blob)).collect()
}

/// Loads components by id, consulting and filling `cache` first.
pub fn components_by_id(
    db: &Database,
    ctx: &Context,
    ids: &[String],
    cache: &mut TxCache<NodeComponent>,
) -> RepoResult<HashMap<String, NodeComponent>> {
    let (mut found, missing) = cache.get_many(ids);
    if missing.is_empty() {
        return Ok(found);
    }

    let blobs = db.query(
        ctx,
        "SELECT serialized FROM node_components WHERE id IN rarray(?1)",
        params![id_array(missing.as_slice())],
        |row| row.get::<_, Vec<u8>>(0),
    )?;
    let loaded = blobs
        .iter()
        .map(|blob| decode::<NodeComponent>(blob))
        .collect::<RepoResult<Vec<_>>>()?;

    cache.set_many(
        loaded
            .iter()
            .map(|component| (component.id.clone(), component.clone())),
    );
    found.extend(
        loaded
            .into_iter()
            .map(|component| (component.id.clone(), component)),
    );
    Ok(found)
}

/// Component-to-CVE edges of the given components, grouped by component id.
pub fn cve_edges_by_component(
    db: &Database,
    ctx: &Context,
    component_ids: &[String],
) -> RepoResult<HashMap<String, Vec<ComponentCveEdge>>> {
    if component_ids.is_empty() {
        return Ok(HashMap::new());
    }
    let blobs = db.query(
        ctx,
        "SELECT serialized FROM node_component_cve_edges
         WHERE node_component_id IN rarray(?1)
         ORDER BY id",
        params![id_array(component_ids)],
        |row| row.get::<_, Vec<u8>>(0),
    )?;

    let mut grouped: HashMap<String, Vec<ComponentCveEdge>> = HashMap::new();
    for blob in &blobs {
        let edge: ComponentCveEdge = decode(blob)?;
        grouped.entry(edge.component_id.clone()).or_default().push(edge);
    }
    Ok(grouped)
}

pub fn count_components(db: &Database, ctx: &Context) -> RepoResult<usize> {
    let count = db.query_row(ctx, "SELECT COUNT(*) FROM node_components", [], |row| {
        row.get::<_, i64>(0)
    })?;
    Ok(usize::try_from(count).unwrap_or_default())
}
