//! Installed software component rows.

use serde::{Deserialize, Serialize};

/// One component row, shared by every node that reports the same
/// name/version on the same operating system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeComponent {
    pub id: String,
    pub name: String,
    pub version: String,
    pub operating_system: String,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub risk_score: f32,
    #[serde(default)]
    pub top_cvss: f32,
}
