//! Edge rows linking nodes to components and components to CVEs.
//!
//! Edges are first-class rows with their own id and payload; the
//! component-to-CVE edge carries fixability, which differs per component
//! even when the CVE row is shared.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeComponentEdge {
    pub id: String,
    pub node_id: String,
    pub component_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentCveEdge {
    pub id: String,
    pub component_id: String,
    pub cve_id: String,
    pub is_fixable: bool,
    pub fixed_by: Option<String>,
}
