//! Node (scanned host) model with its embedded scan.
//!
//! # Responsibility
//! - Define the caller-facing node shape, including the nested scan.
//! - Derive the denormalized summary fields from the scan.
//! - Validate a node before it is written.
//!
//! # Invariants
//! - `components`, `cves`, `fixable_cves` and `top_cvss` describe the scan
//!   they were computed from; a stale write copies them together with the
//!   stored scan.
//! - Scan timestamps order writes: a node whose scan is older than the stored
//!   one never replaces the stored scan.

use super::cve::{Severity, SnoozeState};
use super::ids;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::error::Error;
use std::fmt::{Display, Formatter};

pub type NodeId = String;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    #[serde(default)]
    pub cluster_id: String,
    #[serde(default)]
    pub cluster_name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub os_image: String,
    #[serde(default)]
    pub container_runtime_version: String,
    /// Unix epoch milliseconds.
    pub joined_at: Option<i64>,
    /// Unix epoch milliseconds of the last accepted write.
    pub last_updated: Option<i64>,
    #[serde(default)]
    pub risk_score: f32,
    pub scan: Option<NodeScan>,
    #[serde(default)]
    pub components: u32,
    #[serde(default)]
    pub cves: u32,
    #[serde(default)]
    pub fixable_cves: u32,
    #[serde(default)]
    pub top_cvss: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeScan {
    /// Unix epoch milliseconds.
    pub scan_time: Option<i64>,
    pub operating_system: String,
    #[serde(default)]
    pub components: Vec<EmbeddedComponent>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddedComponent {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub risk_score: f32,
    #[serde(default)]
    pub top_cvss: f32,
    #[serde(default)]
    pub vulns: Vec<EmbeddedVulnerability>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddedVulnerability {
    pub cve: String,
    pub cvss: f32,
    #[serde(default)]
    pub impact_score: f32,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub link: String,
    pub published_on: Option<i64>,
    /// First time the store saw this CVE; filled in on reads.
    pub created_at: Option<i64>,
    #[serde(default)]
    pub snooze: SnoozeState,
    /// Version that fixes the vulnerability in this component, if any.
    pub fixed_by: Option<String>,
}

impl EmbeddedVulnerability {
    pub fn is_fixable(&self) -> bool {
        self.fixed_by
            .as_deref()
            .is_some_and(|version| !version.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeValidationError {
    EmptyId,
    EmptyComponentName { index: usize },
    EmptyCve { component: String },
    CvssOutOfRange { cve: String, cvss: f32 },
}

impl Display for NodeValidationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyId => write!(f, "node id must not be empty"),
            Self::EmptyComponentName { index } => {
                write!(f, "scan component #{index} has an empty name")
            }
            Self::EmptyCve { component } => {
                write!(f, "component `{component}` reports a vulnerability without a CVE")
            }
            Self::CvssOutOfRange { cve, cvss } => {
                write!(f, "cvss {cvss} of `{cve}` is outside 0..=10")
            }
        }
    }
}

impl Error for NodeValidationError {}

impl Node {
    /// Creates a node without scan data.
    pub fn new(id: impl Into<NodeId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            cluster_id: String::new(),
            cluster_name: String::new(),
            labels: BTreeMap::new(),
            os_image: String::new(),
            container_runtime_version: String::new(),
            joined_at: None,
            last_updated: None,
            risk_score: 0.0,
            scan: None,
            components: 0,
            cves: 0,
            fixable_cves: 0,
            top_cvss: 0.0,
        }
    }

    pub fn validate(&self) -> Result<(), NodeValidationError> {
        if self.id.trim().is_empty() {
            return Err(NodeValidationError::EmptyId);
        }
        let Some(scan) = &self.scan else {
            return Ok(());
        };
        for (index, component) in scan.components.iter().enumerate() {
            if component.name.trim().is_empty() {
                return Err(NodeValidationError::EmptyComponentName { index });
            }
            for vuln in &component.vulns {
                if vuln.cve.trim().is_empty() {
                    return Err(NodeValidationError::EmptyCve {
                        component: component.name.clone(),
                    });
                }
                if !(0.0..=10.0).contains(&vuln.cvss) {
                    return Err(NodeValidationError::CvssOutOfRange {
                        cve: vuln.cve.clone(),
                        cvss: vuln.cvss,
                    });
                }
            }
        }
        Ok(())
    }

    pub fn scan_time(&self) -> Option<i64> {
        self.scan.as_ref().and_then(|scan| scan.scan_time)
    }

    /// Whether this node's scan may replace the scan of `stored`.
    ///
    /// A missing scan time orders before any present one.
    pub fn scan_is_newer_or_equal(&self, stored: &Node) -> bool {
        stored.scan_time() <= self.scan_time()
    }

    /// Replaces scan-derived state with the stored node's.
    pub fn adopt_scan_state(&mut self, stored: &Node) {
        self.scan = stored.scan.clone();
        self.risk_score = stored.risk_score;
        self.components = stored.components;
        self.cves = stored.cves;
        self.fixable_cves = stored.fixable_cves;
        self.top_cvss = stored.top_cvss;
    }

    /// Recomputes the summary fields from the scan.
    ///
    /// Components and CVEs are counted by row id, so duplicates inside the
    /// scan count once. A CVE is fixable when any component can fix it.
    pub fn refresh_summary(&mut self) {
        let Some(scan) = &self.scan else {
            self.components = 0;
            self.cves = 0;
            self.fixable_cves = 0;
            self.top_cvss = 0.0;
            return;
        };

        let mut component_ids = Vec::with_capacity(scan.components.len());
        let mut fixable_by_cve: HashMap<String, bool> = HashMap::new();
        let mut top_cvss = 0.0_f32;
        for component in &scan.components {
            component_ids.push(ids::component_id(
                &component.name,
                &component.version,
                &scan.operating_system,
            ));
            for vuln in &component.vulns {
                let fixable = fixable_by_cve
                    .entry(ids::cve_id(&vuln.cve, &scan.operating_system))
                    .or_insert(false);
                *fixable |= vuln.is_fixable();
                top_cvss = top_cvss.max(vuln.cvss);
            }
        }
        component_ids.sort_unstable();
        component_ids.dedup();

        self.components = count(component_ids.len());
        self.cves = count(fixable_by_cve.len());
        self.fixable_cves = count(fixable_by_cve.values().filter(|fixable| **fixable).count());
        self.top_cvss = top_cvss;
    }
}

fn count(len: usize) -> u32 {
    u32::try_from(len).unwrap_or(u32::MAX)
}
