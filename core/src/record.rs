//! Issue record model and lifecycle status machine.
//!
//! One record per captured issue, serialized as one JSON object per line in
//! the log. Unknown fields are preserved across a round trip so newer
//! writers can add fields without older readers discarding them.

use serde::{Deserialize, Serialize};

/// Lifecycle status of an issue record.
///
/// Linear, strictly ordered: `captured → researching → researched →
/// debating → debated → converging → converged → resolved`. The side-state
/// `quarantined` is terminal and only reachable through the schema guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueStatus {
    Captured,
    Researching,
    Researched,
    Debating,
    Debated,
    Converging,
    Converged,
    Resolved,
    Quarantined,
}

impl IssueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueStatus::Captured => "captured",
            IssueStatus::Researching => "researching",
            IssueStatus::Researched => "researched",
            IssueStatus::Debating => "debating",
            IssueStatus::Debated => "debated",
            IssueStatus::Converging => "converging",
            IssueStatus::Converged => "converged",
            IssueStatus::Resolved => "resolved",
            IssueStatus::Quarantined => "quarantined",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "captured" => Some(IssueStatus::Captured),
            "researching" => Some(IssueStatus::Researching),
            "researched" => Some(IssueStatus::Researched),
            "debating" => Some(IssueStatus::Debating),
            "debated" => Some(IssueStatus::Debated),
            "converging" => Some(IssueStatus::Converging),
            "converged" => Some(IssueStatus::Converged),
            "resolved" => Some(IssueStatus::Resolved),
            "quarantined" => Some(IssueStatus::Quarantined),
            _ => None,
        }
    }

    /// All normal-path statuses in pipeline order (excludes `quarantined`).
    pub fn sequence() -> [Self; 8] {
        [
            IssueStatus::Captured,
            IssueStatus::Researching,
            IssueStatus::Researched,
            IssueStatus::Debating,
            IssueStatus::Debated,
            IssueStatus::Converging,
            IssueStatus::Converged,
            IssueStatus::Resolved,
        ]
    }
}

/// Classification of the captured issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueType {
    Error,
    Warning,
    Failure,
    Regression,
    Performance,
    Design,
    Manual,
    Unknown,
}

impl IssueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueType::Error => "error",
            IssueType::Warning => "warning",
            IssueType::Failure => "failure",
            IssueType::Regression => "regression",
            IssueType::Performance => "performance",
            IssueType::Design => "design",
            IssueType::Manual => "manual",
            IssueType::Unknown => "unknown",
        }
    }
}

/// One captured issue.
///
/// Timestamps are carried as RFC 3339 strings so records round-trip
/// byte-for-byte regardless of sub-second precision or offset style.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IssueRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub issue_type: IssueType,
    pub timestamp: String,
    pub description: String,
    pub status: IssueStatus,

    // Provenance.
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub tool_name: String,
    #[serde(default)]
    pub git_branch: String,
    #[serde(default)]
    pub recent_files: Vec<String>,
    #[serde(default)]
    pub working_directory: String,
    #[serde(default)]
    pub raw_error: String,

    // Dedup fields, absent on legacy records until migration backfills them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub occurrence_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_seen: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<String>,

    /// Fields this version does not know about, preserved on round trip.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl IssueRecord {
    /// Primary source file for fingerprinting: first of `recent_files`.
    pub fn source_file(&self) -> &str {
        self.recent_files.first().map(String::as_str).unwrap_or("")
    }
}
