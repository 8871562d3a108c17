//! Error fingerprinting.
//!
//! Computes deterministic sha256 fingerprints for issue records so repeat
//! captures of the same underlying error converge to one record across
//! sessions. Normalization strips run-to-run noise (paths, timestamps,
//! UUIDs, hashes, line numbers, pids, addresses) by replacing each with a
//! fixed placeholder token; structural shape is preserved for readability.
//!
//! The pattern table and field order are versioned: changing either is a
//! breaking change that requires recomputing every stored fingerprint.

use std::sync::LazyLock;

use regex_lite::Regex;
use sha2::{Digest, Sha256};

use crate::record::IssueRecord;

/// Version of the normalization rules and digest field layout.
pub const FINGERPRINT_VERSION: u32 = 1;

/// Replacement patterns, applied in order. More specific patterns come
/// first so they are not partially consumed by broader ones.
static PATTERNS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    [
        // UUIDs: 8-4-4-4-12 hex.
        (
            r"(?i)[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}",
            "<UUID>",
        ),
        // ISO 8601 timestamps, with optional fraction and Z/offset.
        (
            r"\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}(?:\.\d+)?(?:Z|[+-]\d{2}:?\d{2})",
            "<TIMESTAMP>",
        ),
        // Date-time with space separator.
        (r"\d{4}-\d{2}-\d{2}\s+\d{2}:\d{2}:\d{2}", "<TIMESTAMP>"),
        // Hex hashes (md5 and longer): 32+ hex chars in a row.
        (r"(?i)\b[0-9a-f]{32,}\b", "<HASH>"),
        // File paths, Unix or Windows drive-letter.
        (
            r#"(?:/[^\s:"']+(?:\.[a-zA-Z0-9]+)?|[A-Z]:\\[^\s:"']+)"#,
            "<PATH>",
        ),
        // Line numbers: ":42", "line 42", "L42".
        (r"(?::|[Ll]ine\s*|[Ll])\d+", "<LINE>"),
        // Process ids.
        (r"(?:pid|PID|process)\s*[=:]?\s*\d+", "<PID>"),
        // Memory addresses.
        (r"0x[0-9a-fA-F]{4,}", "<ADDR>"),
        // Port numbers in error context.
        (r"(?i)port\s+\d{2,5}", "port <PORT>"),
        // Remaining long numeric sequences (ids, offsets).
        (r"\b\d{4,}\b", "<NUM>"),
    ]
    .into_iter()
    .map(|(pattern, replacement)| {
        // Pattern table is a compile-time constant; a bad entry is a bug.
        (Regex::new(pattern).unwrap(), replacement)
    })
    .collect()
});

static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

/// Normalize an error message by replacing volatile substrings with fixed
/// placeholder tokens, collapsing whitespace, and lowercasing.
///
/// Identical logical errors captured in different sessions, differing only
/// in paths, timestamps, or ids, normalize to the same string.
pub fn normalize_error_message(message: &str) -> String {
    if message.is_empty() {
        return String::new();
    }

    let mut result = message.to_string();
    for (pattern, replacement) in PATTERNS.iter() {
        result = pattern.replace_all(&result, *replacement).into_owned();
    }

    WHITESPACE
        .replace_all(&result, " ")
        .trim()
        .to_lowercase()
}

/// Compute the sha256 fingerprint of a record.
///
/// The digest covers a canonical key-sorted JSON object of the identity
/// fields: `type`, `tool_name`, normalized error text, `source_file`
/// (first recent file, or empty), and `git_branch`. `raw_error` is
/// preferred over `description` as the normalization input because it is
/// richer.
pub fn compute_fingerprint(record: &IssueRecord) -> String {
    let raw = if record.raw_error.is_empty() {
        &record.description
    } else {
        &record.raw_error
    };

    let git_branch = if record.git_branch.is_empty() {
        "unknown"
    } else {
        &record.git_branch
    };
    let tool_name = if record.tool_name.is_empty() {
        "unknown"
    } else {
        &record.tool_name
    };

    // serde_json's default map is ordered by key, which gives us the same
    // canonical sorted-key encoding every time.
    let canonical = serde_json::json!({
        "type": record.issue_type.as_str(),
        "tool_name": tool_name,
        "error_normalized": normalize_error_message(raw),
        "source_file": record.source_file(),
        "git_branch": git_branch,
    });

    let mut hasher = Sha256::new();
    hasher.update(canonical.to_string().as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Exact fingerprint equality.
///
/// Trivial today; kept as the single seam where a structural or semantic
/// matcher could be added without touching the dedup gate's contract.
pub fn fingerprints_match(a: &str, b: &str) -> bool {
    !a.is_empty() && !b.is_empty() && a == b
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{IssueStatus, IssueType};
    use pretty_assertions::assert_eq;

    fn record_with_error(raw_error: &str) -> IssueRecord {
        IssueRecord {
            id: "issue_1".to_string(),
            issue_type: IssueType::Error,
            timestamp: "2026-08-28T12:00:00+00:00".to_string(),
            description: "desc".to_string(),
            status: IssueStatus::Captured,
            source: String::new(),
            tool_name: "Bash".to_string(),
            git_branch: "main".to_string(),
            recent_files: vec!["src/lib.rs".to_string()],
            working_directory: String::new(),
            raw_error: raw_error.to_string(),
            fingerprint: None,
            occurrence_count: None,
            first_seen: None,
            last_seen: None,
            extra: serde_json::Map::new(),
        }
    }

    #[test]
    fn normalization_replaces_volatile_tokens() {
        let raw = "error in /home/user/app/main.py at 2026-08-28T11:22:33Z \
                   pid=4321 address 0x7fff5fbff8c0";
        let normalized = normalize_error_message(raw);
        assert!(normalized.contains("<path>"));
        assert!(normalized.contains("<timestamp>"));
        assert!(normalized.contains("<pid>"));
        assert!(normalized.contains("<addr>"));
        assert!(!normalized.contains("4321"));
        assert!(!normalized.contains("/home/user"));
    }

    #[test]
    fn normalization_preserves_structure() {
        let normalized = normalize_error_message("FileNotFoundError: /tmp/data.csv missing");
        // Placeholder stands in for the path; surrounding words survive.
        assert_eq!(normalized, "filenotfounderror: <path> missing");
    }

    #[test]
    fn normalization_collapses_whitespace_and_lowercases() {
        assert_eq!(
            normalize_error_message("  Multiple   SPACES\n\nand Lines  "),
            "multiple spaces and lines"
        );
        assert_eq!(normalize_error_message(""), "");
    }

    #[test]
    fn uuids_hashes_and_ports_are_masked() {
        let raw = "request 123e4567-e89b-12d3-a456-426614174000 failed, \
                   commit d41d8cd98f00b204e9800998ecf8427e, port 8080";
        let normalized = normalize_error_message(raw);
        assert!(normalized.contains("<uuid>"));
        assert!(normalized.contains("<hash>"));
        assert!(normalized.contains("port <port>"));
    }

    #[test]
    fn identical_errors_with_different_noise_share_a_fingerprint() {
        let a = record_with_error(
            "Timeout connecting at 2026-08-28T10:00:00Z from /home/alice/project/x.rs pid=100",
        );
        let b = record_with_error(
            "Timeout connecting at 2026-08-28T18:45:12Z from /home/bob/work/x.rs pid=99182",
        );
        assert_eq!(compute_fingerprint(&a), compute_fingerprint(&b));
    }

    #[test]
    fn fingerprint_changes_with_tool_or_branch() {
        let a = record_with_error("boom");
        let mut b = record_with_error("boom");
        b.tool_name = "Edit".to_string();
        assert_ne!(compute_fingerprint(&a), compute_fingerprint(&b));

        let mut c = record_with_error("boom");
        c.git_branch = "feature".to_string();
        assert_ne!(compute_fingerprint(&a), compute_fingerprint(&c));
    }

    #[test]
    fn fingerprint_is_64_hex_chars() {
        let fp = compute_fingerprint(&record_with_error("x"));
        assert_eq!(fp.len(), 64);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn empty_fingerprints_never_match() {
        assert!(!fingerprints_match("", ""));
        assert!(!fingerprints_match("abc", ""));
        assert!(fingerprints_match("abc", "abc"));
        assert!(!fingerprints_match("abc", "abd"));
    }
}
