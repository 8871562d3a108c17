//! Schema validation and migration for issue records.
//!
//! Records that fail validation are never silently dropped: they are
//! written verbatim to the quarantine sink with the failure reasons, and
//! the caller gets the quarantine count. Migration is purely additive and
//! idempotent: it backfills dedup fields on legacy records and never
//! touches a field it does not own.

use chrono::DateTime;
use serde::Serialize;

use crate::error::{ConvergenceError, Result};
use crate::fingerprint::compute_fingerprint;
use crate::record::IssueRecord;
use crate::store::LogStore;

/// Upper bound on free-text fields; anything longer indicates a capture
/// path that failed to truncate.
const MAX_TEXT_LEN: usize = 20_000;

/// Validate a record.
///
/// Type- and enum-level checks are already enforced by deserialization;
/// this covers the semantic rules: non-empty id, parsable RFC 3339
/// timestamp, bounded text fields, and a sane occurrence count.
pub fn validate(record: &IssueRecord) -> std::result::Result<(), Vec<String>> {
    let mut reasons = Vec::new();

    if record.id.trim().is_empty() {
        reasons.push("field 'id' cannot be empty".to_string());
    }
    if DateTime::parse_from_rfc3339(&record.timestamp).is_err() {
        reasons.push(format!(
            "field 'timestamp' is not valid RFC 3339: '{}'",
            record.timestamp
        ));
    }
    if record.description.len() > MAX_TEXT_LEN {
        reasons.push(format!(
            "field 'description' exceeds {MAX_TEXT_LEN} bytes"
        ));
    }
    if record.raw_error.len() > MAX_TEXT_LEN {
        reasons.push(format!("field 'raw_error' exceeds {MAX_TEXT_LEN} bytes"));
    }
    if record.occurrence_count == Some(0) {
        reasons.push("field 'occurrence_count' must be at least 1".to_string());
    }

    if reasons.is_empty() { Ok(()) } else { Err(reasons) }
}

/// Backfill dedup fields on a legacy record. Idempotent: migrating an
/// already-current record is a no-op.
///
/// A populated field is never altered; a populated field holding a value
/// migration could not have produced is a [`ConvergenceError::MigrationConflict`].
pub fn migrate(mut record: IssueRecord) -> Result<IssueRecord> {
    match &record.fingerprint {
        Some(fp) if fp.is_empty() => {
            return Err(ConvergenceError::MigrationConflict {
                id: record.id,
                field: "fingerprint".to_string(),
            });
        }
        Some(_) => {}
        None => record.fingerprint = Some(compute_fingerprint(&record)),
    }

    if record.occurrence_count == Some(0) {
        return Err(ConvergenceError::MigrationConflict {
            id: record.id,
            field: "occurrence_count".to_string(),
        });
    }
    record.occurrence_count.get_or_insert(1);
    record
        .first_seen
        .get_or_insert_with(|| record.timestamp.clone());
    record
        .last_seen
        .get_or_insert_with(|| record.timestamp.clone());

    Ok(record)
}

/// Outcome of a whole-log validation pass.
#[derive(Debug, Default)]
pub struct ValidationSummary {
    pub valid: usize,
    pub quarantined: usize,
    pub reasons: Vec<String>,
}

#[derive(Serialize)]
struct QuarantineEnvelope<'a> {
    #[serde(flatten)]
    record: &'a IssueRecord,
    _quarantine_reason: &'a [String],
    _quarantined_at: String,
}

/// Validate and migrate every record in the log.
///
/// Invalid records move verbatim (plus reasons) to the quarantine sink;
/// valid ones are migrated and, where migration gave two legacy records
/// the same fingerprint, folded into a single record whose occurrence
/// count is the sum. The log is rewritten atomically only when something
/// changed.
pub fn validate_log(store: &LogStore) -> Result<ValidationSummary> {
    let records = store.read_all()?;
    let lock = store.lock()?;

    let mut summary = ValidationSummary::default();
    let mut kept: Vec<IssueRecord> = Vec::new();
    let mut changed = false;

    for record in records {
        match validate(&record) {
            Ok(()) => {
                let migrated = migrate(record.clone())?;
                if migrated != record {
                    changed = true;
                }

                // Fold fingerprint duplicates produced by backfill.
                let fp = migrated.fingerprint.clone().unwrap_or_default();
                if let Some(existing) = kept
                    .iter_mut()
                    .find(|r| r.fingerprint.as_deref() == Some(fp.as_str()))
                {
                    merge_occurrence(existing, &migrated);
                    summary.reasons.push(format!(
                        "{}: merged into {} (duplicate fingerprint)",
                        migrated.id, existing.id
                    ));
                    changed = true;
                } else {
                    kept.push(migrated);
                    summary.valid += 1;
                }
            }
            Err(reasons) => {
                tracing::warn!(id = %record.id, reasons = ?reasons, "quarantining invalid record");
                let envelope = QuarantineEnvelope {
                    record: &record,
                    _quarantine_reason: &reasons,
                    _quarantined_at: chrono::Utc::now().to_rfc3339(),
                };
                store.quarantine_value(&lock, &serde_json::to_value(&envelope)?)?;
                summary
                    .reasons
                    .push(format!("{}: {}", record.id, reasons.join("; ")));
                summary.quarantined += 1;
                changed = true;
            }
        }
    }

    if changed {
        store.rewrite_locked(&lock, &kept)?;
    }
    Ok(summary)
}

/// Merge a duplicate capture into the record that owns the fingerprint.
pub(crate) fn merge_occurrence(existing: &mut IssueRecord, duplicate: &IssueRecord) {
    let added = duplicate.occurrence_count.unwrap_or(1);
    let count = existing.occurrence_count.unwrap_or(1) + added;
    existing.occurrence_count = Some(count);

    let dup_first = duplicate
        .first_seen
        .clone()
        .unwrap_or_else(|| duplicate.timestamp.clone());
    let dup_last = duplicate
        .last_seen
        .clone()
        .unwrap_or_else(|| duplicate.timestamp.clone());

    match &existing.first_seen {
        Some(first) if *first <= dup_first => {}
        _ => existing.first_seen = Some(dup_first),
    }
    match &existing.last_seen {
        Some(last) if *last >= dup_last => {}
        _ => existing.last_seen = Some(dup_last),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConvergenceConfig;
    use crate::record::{IssueStatus, IssueType};
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn record(id: &str, error: &str) -> IssueRecord {
        IssueRecord {
            id: id.to_string(),
            issue_type: IssueType::Error,
            timestamp: "2026-08-28T12:00:00+00:00".to_string(),
            description: "a failure".to_string(),
            status: IssueStatus::Captured,
            source: "test".to_string(),
            tool_name: "Bash".to_string(),
            git_branch: "main".to_string(),
            recent_files: vec![],
            working_directory: String::new(),
            raw_error: error.to_string(),
            fingerprint: None,
            occurrence_count: None,
            first_seen: None,
            last_seen: None,
            extra: serde_json::Map::new(),
        }
    }

    #[test]
    fn migration_backfills_dedup_fields() {
        let migrated = migrate(record("a", "boom")).unwrap();
        assert!(migrated.fingerprint.is_some());
        assert_eq!(migrated.occurrence_count, Some(1));
        assert_eq!(
            migrated.first_seen.as_deref(),
            Some("2026-08-28T12:00:00+00:00")
        );
        assert_eq!(migrated.first_seen, migrated.last_seen);
    }

    #[test]
    fn migration_is_idempotent() {
        let once = migrate(record("a", "boom")).unwrap();
        let twice = migrate(once.clone()).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn migration_never_alters_populated_fields() {
        let mut populated = record("a", "boom");
        populated.fingerprint = Some("f".repeat(64));
        populated.occurrence_count = Some(7);
        populated.first_seen = Some("2026-01-01T00:00:00+00:00".to_string());
        populated.last_seen = Some("2026-02-01T00:00:00+00:00".to_string());

        let migrated = migrate(populated.clone()).unwrap();
        assert_eq!(migrated, populated);
    }

    #[test]
    fn migration_conflict_fails_loudly() {
        let mut bad = record("a", "boom");
        bad.fingerprint = Some(String::new());
        assert!(matches!(
            migrate(bad).unwrap_err(),
            ConvergenceError::MigrationConflict { .. }
        ));

        let mut zero = record("b", "boom");
        zero.occurrence_count = Some(0);
        assert!(matches!(
            migrate(zero).unwrap_err(),
            ConvergenceError::MigrationConflict { .. }
        ));
    }

    #[test]
    fn validate_rejects_bad_timestamp_and_empty_id() {
        let mut bad = record(" ", "boom");
        bad.timestamp = "yesterday".to_string();
        let reasons = validate(&bad).unwrap_err();
        assert_eq!(reasons.len(), 2);
        assert!(reasons[0].contains("'id'"));
        assert!(reasons[1].contains("RFC 3339"));
    }

    #[test]
    fn validate_log_quarantines_invalid_records_with_reason() {
        let dir = TempDir::new().unwrap();
        let config = ConvergenceConfig::with_root(dir.path());
        let store = LogStore::new(&config);

        store.append(&record("ok", "boom")).unwrap();
        let mut bad = record("bad", "boom other");
        bad.timestamp = "not-a-time".to_string();
        store.append(&bad).unwrap();

        let summary = validate_log(&store).unwrap();
        assert_eq!(summary.valid, 1);
        assert_eq!(summary.quarantined, 1);

        let remaining = store.read_all().unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, "ok");
        // Backfill happened on the rewrite.
        assert!(remaining[0].fingerprint.is_some());

        let quarantine = store.read_quarantine().unwrap();
        assert_eq!(quarantine.len(), 1);
        assert_eq!(quarantine[0]["id"].as_str().unwrap(), "bad");
        assert!(quarantine[0]["_quarantine_reason"].is_array());
    }

    #[test]
    fn validate_log_folds_fingerprint_duplicates() {
        let dir = TempDir::new().unwrap();
        let config = ConvergenceConfig::with_root(dir.path());
        let store = LogStore::new(&config);

        // Two legacy records for the same logical error, different noise.
        let mut first = record("dup_1", "timeout at /home/alice/x.rs pid=1");
        first.timestamp = "2026-08-28T10:00:00+00:00".to_string();
        let mut second = record("dup_2", "timeout at /home/bob/x.rs pid=2");
        second.timestamp = "2026-08-28T11:00:00+00:00".to_string();
        store.append(&first).unwrap();
        store.append(&second).unwrap();

        let summary = validate_log(&store).unwrap();
        assert_eq!(summary.valid, 1);

        let all = store.read_all().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, "dup_1");
        assert_eq!(all[0].occurrence_count, Some(2));
        assert_eq!(
            all[0].first_seen.as_deref(),
            Some("2026-08-28T10:00:00+00:00")
        );
        assert_eq!(
            all[0].last_seen.as_deref(),
            Some("2026-08-28T11:00:00+00:00")
        );
    }
}
