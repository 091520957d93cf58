//! Splitting a node into storable rows and merging rows back.
//!
//! # Invariants
//! - `split` emits each component and each CVE of a component at most once,
//!   keyed by content-derived id.
//! - The node row never carries embedded components; they live in the
//!   component and edge rows.
//! - `merge` orders components by (name, version) and vulnerabilities by CVE,
//!   so the same rows always yield the same node.

use super::component::NodeComponent;
use super::cve::{NodeCve, OrphanState};
use super::edge::{ComponentCveEdge, NodeComponentEdge};
use super::ids;
use super::node::{EmbeddedComponent, EmbeddedVulnerability, Node};
use std::collections::{HashMap, HashSet};

/// A node broken into the five row kinds.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeParts {
    /// The node row, with its scan stripped of components.
    pub node: Node,
    pub children: Vec<ComponentParts>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ComponentParts {
    pub edge: NodeComponentEdge,
    pub component: NodeComponent,
    pub children: Vec<CveParts>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CveParts {
    pub edge: ComponentCveEdge,
    pub cve: NodeCve,
}

impl NodeParts {
    /// Every row key this node touches: node id, component ids, CVE ids.
    pub fn keys(&self) -> Vec<String> {
        let mut keys = vec![self.node.id.clone()];
        for component in &self.children {
            keys.push(component.component.id.clone());
            keys.extend(component.children.iter().map(|cve| cve.cve.id.clone()));
        }
        keys
    }

    pub fn component_edges(&self) -> impl Iterator<Item = &NodeComponentEdge> {
        self.children.iter().map(|component| &component.edge)
    }

    pub fn components(&self) -> impl Iterator<Item = &NodeComponent> {
        self.children.iter().map(|component| &component.component)
    }

    pub fn cve_edges(&self) -> impl Iterator<Item = &ComponentCveEdge> {
        self.children
            .iter()
            .flat_map(|component| component.children.iter().map(|cve| &cve.edge))
    }

    /// CVE rows de-duplicated across components; first occurrence wins.
    pub fn unique_cves(&self) -> Vec<NodeCve> {
        let mut seen = HashSet::new();
        let mut cves = Vec::new();
        for cve in self
            .children
            .iter()
            .flat_map(|component| component.children.iter().map(|cve| &cve.cve))
        {
            if seen.insert(cve.id.as_str()) {
                cves.push(cve.clone());
            }
        }
        cves
    }
}

/// Splits `node` into rows.
///
/// With `with_components == false` (a stale scan) only the node row is
/// produced. `now` becomes the provisional `created_at` of every CVE; the
/// writer replaces it with the stored value when the CVE already exists.
pub fn split(node: &Node, with_components: bool, now: i64) -> NodeParts {
    let mut row = node.clone();
    let embedded = match row.scan.as_mut() {
        Some(scan) => std::mem::take(&mut scan.components),
        None => Vec::new(),
    };
    if !with_components {
        return NodeParts {
            node: row,
            children: Vec::new(),
        };
    }

    let operating_system = row
        .scan
        .as_ref()
        .map(|scan| scan.operating_system.clone())
        .unwrap_or_default();

    let mut children: Vec<ComponentParts> = Vec::new();
    let mut index_by_id: HashMap<String, usize> = HashMap::new();
    for component in &embedded {
        let component_id = ids::component_id(&component.name, &component.version, &operating_system);
        let position = match index_by_id.get(&component_id) {
            Some(position) => *position,
            None => {
                index_by_id.insert(component_id.clone(), children.len());
                children.push(ComponentParts {
                    edge: NodeComponentEdge {
                        id: ids::node_component_edge_id(&node.id, &component_id),
                        node_id: node.id.clone(),
                        component_id: component_id.clone(),
                    },
                    component: NodeComponent {
                        id: component_id.clone(),
                        name: component.name.clone(),
                        version: component.version.clone(),
                        operating_system: operating_system.clone(),
                        priority: component.priority,
                        risk_score: component.risk_score,
                        top_cvss: component.top_cvss,
                    },
                    children: Vec::new(),
                });
                children.len() - 1
            }
        };

        let parts = &mut children[position];
        for vuln in &component.vulns {
            let cve_id = ids::cve_id(&vuln.cve, &operating_system);
            if parts.children.iter().any(|existing| existing.cve.id == cve_id) {
                continue;
            }
            parts.children.push(CveParts {
                edge: ComponentCveEdge {
                    id: ids::component_cve_edge_id(&component_id, &cve_id),
                    component_id: component_id.clone(),
                    cve_id: cve_id.clone(),
                    is_fixable: vuln.is_fixable(),
                    fixed_by: vuln.fixed_by.clone(),
                },
                cve: NodeCve {
                    id: cve_id,
                    cve: vuln.cve.clone(),
                    operating_system: operating_system.clone(),
                    cvss: vuln.cvss,
                    impact_score: vuln.impact_score,
                    severity: vuln.severity,
                    summary: vuln.summary.clone(),
                    link: vuln.link.clone(),
                    published_on: vuln.published_on,
                    created_at: now,
                    snooze: vuln.snooze,
                    orphan: OrphanState::Active,
                },
            });
        }
    }

    NodeParts {
        node: row,
        children,
    }
}

/// Rebuilds the caller-facing node from its rows.
pub fn merge(parts: NodeParts) -> Node {
    let NodeParts { mut node, children } = parts;
    let Some(scan) = node.scan.as_mut() else {
        return node;
    };

    let mut components: Vec<EmbeddedComponent> = children
        .into_iter()
        .map(|component| {
            let mut vulns: Vec<EmbeddedVulnerability> = component
                .children
                .into_iter()
                .map(|parts| EmbeddedVulnerability {
                    cve: parts.cve.cve,
                    cvss: parts.cve.cvss,
                    impact_score: parts.cve.impact_score,
                    severity: parts.cve.severity,
                    summary: parts.cve.summary,
                    link: parts.cve.link,
                    published_on: parts.cve.published_on,
                    created_at: Some(parts.cve.created_at),
                    snooze: parts.cve.snooze,
                    fixed_by: parts.edge.fixed_by,
                })
                .collect();
            vulns.sort_by(|left, right| left.cve.cmp(&right.cve));
            EmbeddedComponent {
                name: component.component.name,
                version: component.component.version,
                priority: component.component.priority,
                risk_score: component.component.risk_score,
                top_cvss: component.component.top_cvss,
                vulns,
            }
        })
        .collect();
    components.sort_by(|left, right| {
        (left.name.as_str(), left.version.as_str()).cmp(&(right.name.as_str(), right.version.as_str()))
    });

    scan.components = components;
    node
}
