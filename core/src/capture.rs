//! Turning a tool-failure payload into a captured issue record.
//!
//! Capture is an observer: it never blocks the failing tool. Git context
//! is best-effort and text fields are truncated before they reach the log.

use std::path::Path;
use std::process::Command;

use chrono::Utc;
use rand::Rng;
use serde::Deserialize;

use crate::record::{IssueRecord, IssueStatus, IssueType};

const MAX_INPUT_SUMMARY: usize = 500;
const MAX_RAW_ERROR: usize = 2_000;
const MAX_RECENT_FILES: usize = 20;
const ID_SUFFIX_CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Failure payload as delivered by a tool-use hook on stdin.
#[derive(Debug, Clone, Deserialize)]
pub struct CapturePayload {
    #[serde(default = "default_tool_name")]
    pub tool_name: String,
    #[serde(default)]
    pub tool_input: serde_json::Value,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub source: Option<String>,
}

fn default_tool_name() -> String {
    "unknown".to_string()
}

/// Best-effort git context for the capturing repository.
#[derive(Debug, Clone, Default)]
pub struct GitContext {
    pub branch: String,
    pub recent_files: Vec<String>,
}

impl GitContext {
    /// Query the local repo for branch and recently changed files. Any
    /// git failure degrades to empty context rather than an error.
    pub fn detect(root: &Path) -> Self {
        let branch = git_stdout(root, &["rev-parse", "--abbrev-ref", "HEAD"])
            .unwrap_or_else(|| "unknown".to_string());

        let recent_files = git_stdout(root, &["diff", "--name-only", "HEAD~3"])
            .map(|out| {
                out.lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .take(MAX_RECENT_FILES)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Self {
            branch,
            recent_files,
        }
    }
}

fn git_stdout(root: &Path, args: &[&str]) -> Option<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(root)
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!text.is_empty()).then_some(text)
}

/// Generate a unique record id: `issue_{YYYYMMDD}_{HHMMSS}_{rand4}`.
pub fn make_issue_id() -> String {
    let now = Utc::now();
    let mut rng = rand::rng();
    let suffix: String = (0..4)
        .map(|_| ID_SUFFIX_CHARS[rng.random_range(0..ID_SUFFIX_CHARS.len())] as char)
        .collect();
    format!("issue_{}_{suffix}", now.format("%Y%m%d_%H%M%S"))
}

/// Classify a failure into an issue type from the tool and error text.
pub fn classify(tool_name: &str, error_text: &str) -> IssueType {
    let error = error_text.to_lowercase();

    if error.contains("permission") || error.contains("access denied") {
        return IssueType::Error;
    }
    if error.contains("timeout") {
        return IssueType::Performance;
    }
    if error.contains("not found")
        || error.contains("no such file")
        || error.contains("syntax")
        || error.contains("unexpected token")
    {
        return IssueType::Error;
    }
    if error.contains("deprecated") {
        return IssueType::Warning;
    }
    if matches!(tool_name, "Bash" | "Execute") {
        return IssueType::Failure;
    }
    IssueType::Error
}

/// Build a captured record from a failure payload.
///
/// Dedup fields are left unset so the gate fills them under its lock.
pub fn build_record(payload: &CapturePayload, git: &GitContext, working_dir: &Path) -> IssueRecord {
    let input_summary = match &payload.tool_input {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(s) => truncate_chars(s, MAX_INPUT_SUMMARY),
        other => truncate_chars(&other.to_string(), MAX_INPUT_SUMMARY),
    };

    let mut description = format!("Tool '{}' failed: {}", payload.tool_name, payload.error);
    if !input_summary.is_empty() {
        description.push_str("\n\nTool input: ");
        description.push_str(&input_summary);
    }

    IssueRecord {
        id: make_issue_id(),
        issue_type: classify(&payload.tool_name, &payload.error),
        timestamp: Utc::now().to_rfc3339(),
        description,
        status: IssueStatus::Captured,
        source: payload
            .source
            .clone()
            .unwrap_or_else(|| "hook:PostToolUseFailure".to_string()),
        tool_name: payload.tool_name.clone(),
        git_branch: git.branch.clone(),
        recent_files: git.recent_files.clone(),
        working_directory: working_dir.display().to_string(),
        raw_error: truncate_chars(&payload.error, MAX_RAW_ERROR),
        fingerprint: None,
        occurrence_count: None,
        first_seen: None,
        last_seen: None,
        extra: serde_json::Map::new(),
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn payload(tool: &str, error: &str) -> CapturePayload {
        CapturePayload {
            tool_name: tool.to_string(),
            tool_input: serde_json::json!({"command": "cargo test"}),
            error: error.to_string(),
            source: None,
        }
    }

    #[test]
    fn classifies_by_error_content_before_tool() {
        assert_eq!(classify("Bash", "operation timeout"), IssueType::Performance);
        assert_eq!(classify("Bash", "file not found"), IssueType::Error);
        assert_eq!(classify("Edit", "API is deprecated"), IssueType::Warning);
        assert_eq!(classify("Bash", "exit status 1"), IssueType::Failure);
        assert_eq!(classify("Edit", "exit status 1"), IssueType::Error);
    }

    #[test]
    fn issue_id_format_is_stable() {
        let id = make_issue_id();
        let parts: Vec<&str> = id.split('_').collect();
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0], "issue");
        assert_eq!(parts[1].len(), 8);
        assert_eq!(parts[2].len(), 6);
        assert_eq!(parts[3].len(), 4);
    }

    #[test]
    fn build_record_sets_capture_fields() {
        let record = build_record(
            &payload("Bash", "command failed: exit 1"),
            &GitContext {
                branch: "main".to_string(),
                recent_files: vec!["src/lib.rs".to_string()],
            },
            Path::new("/work/project"),
        );

        assert_eq!(record.status, IssueStatus::Captured);
        assert_eq!(record.issue_type, IssueType::Failure);
        assert!(record.description.starts_with("Tool 'Bash' failed:"));
        assert!(record.description.contains("Tool input:"));
        assert_eq!(record.git_branch, "main");
        assert_eq!(record.raw_error, "command failed: exit 1");
        assert!(record.fingerprint.is_none());
    }

    #[test]
    fn long_error_text_is_truncated() {
        let record = build_record(
            &payload("Bash", &"x".repeat(5_000)),
            &GitContext::default(),
            Path::new("/"),
        );
        assert_eq!(record.raw_error.len(), MAX_RAW_ERROR);
    }
}
