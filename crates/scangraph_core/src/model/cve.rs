//! Shared vulnerability records.
//!
//! # Invariants
//! - A `NodeCve` row is shared by every component reporting the same CVE on
//!   the same operating system.
//! - `created_at` and `snooze` are owned by the stored row once it exists;
//!   rewrites copy them forward instead of taking the incoming values.
//! - `orphan` is `Orphaned` only while no component references the row.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    #[default]
    Unknown,
    Low,
    Moderate,
    Important,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Low => "low",
            Self::Moderate => "moderate",
            Self::Important => "important",
            Self::Critical => "critical",
        }
    }
}

/// User-managed suppression of a vulnerability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SnoozeState {
    #[default]
    Active,
    /// `until: None` snoozes indefinitely.
    Snoozed { since: i64, until: Option<i64> },
}

impl SnoozeState {
    pub fn is_snoozed(&self) -> bool {
        matches!(self, Self::Snoozed { .. })
    }

    pub fn expiry(&self) -> Option<i64> {
        match self {
            Self::Active => None,
            Self::Snoozed { until, .. } => *until,
        }
    }
}

/// Soft-delete marker for CVE rows no component references anymore.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum OrphanState {
    #[default]
    Active,
    Orphaned { since: i64 },
}

impl OrphanState {
    pub fn is_orphaned(&self) -> bool {
        matches!(self, Self::Orphaned { .. })
    }

    pub fn since(&self) -> Option<i64> {
        match self {
            Self::Active => None,
            Self::Orphaned { since } => Some(*since),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeCve {
    pub id: String,
    pub cve: String,
    pub operating_system: String,
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
    /// Unix epoch milliseconds of the first write that stored this CVE.
    pub created_at: i64,
    #[serde(default)]
    pub snooze: SnoozeState,
    #[serde(default)]
    pub orphan: OrphanState,
}

impl NodeCve {
    /// Copies user-managed and provenance state from the stored row.
    pub fn carry_forward_from(&mut self, stored: &NodeCve) {
        self.created_at = stored.created_at;
        self.snooze = stored.snooze;
    }
}

#[cfg(test)]
mod tests {
    use super::{NodeCve, OrphanState, Severity, SnoozeState};

    fn cve(created_at: i64, snooze: SnoozeState) -> NodeCve {
        NodeCve {
            id: "CVE-1#os".to_string(),
            cve: "CVE-1".to_string(),
            operating_system: "os".to_string(),
            cvss: 5.0,
            impact_score: 0.0,
            severity: Severity::Moderate,
            summary: String::new(),
            link: String::new(),
            published_on: None,
            created_at,
            snooze,
            orphan: OrphanState::Active,
        }
    }

    #[test]
    fn carry_forward_keeps_stored_user_state_and_provenance() {
        let stored = cve(
            100,
            SnoozeState::Snoozed {
                since: 150,
                until: Some(900),
            },
        );
        let mut incoming = cve(500, SnoozeState::Active);
        incoming.cvss = 9.8;

        incoming.carry_forward_from(&stored);

        assert_eq!(incoming.created_at, 100);
        assert!(incoming.snooze.is_snoozed());
        assert_eq!(incoming.snooze.expiry(), Some(900));
        assert_eq!(incoming.cvss, 9.8);
    }

    #[test]
    fn severity_column_text_matches_serialized_name() {
        for severity in [
            Severity::Unknown,
            Severity::Low,
            Severity::Moderate,
            Severity::Important,
            Severity::Critical,
        ] {
            let json = serde_json::to_value(severity).unwrap();
            assert_eq!(json, serde_json::json!(severity.as_str()));
        }
    }

    #[test]
    fn orphan_state_serializes_as_tagged_object() {
        let json = serde_json::to_value(OrphanState::Orphaned { since: 42 }).unwrap();
        assert_eq!(json, serde_json::json!({ "state": "orphaned", "since": 42 }));
    }
}
