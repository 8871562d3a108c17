//! Dedup gate: every new capture passes through here before it reaches
//! the log.
//!
//! The fingerprint lookup and the resulting append-or-merge happen under
//! a single store lock, so two processes capturing the same error cannot
//! both insert it.

use crate::error::Result;
use crate::fingerprint::{compute_fingerprint, fingerprints_match};
use crate::record::IssueRecord;
use crate::schema;
use crate::store::LogStore;

/// What the gate did with a capture.
#[derive(Debug, Clone, PartialEq)]
pub enum DedupOutcome {
    /// First sighting; the record was appended as-is.
    Inserted { id: String },
    /// A record with the same fingerprint already exists; its occurrence
    /// count and seen-window were updated instead.
    Merged { id: String, occurrence_count: u32 },
}

impl DedupOutcome {
    pub fn id(&self) -> &str {
        match self {
            DedupOutcome::Inserted { id } | DedupOutcome::Merged { id, .. } => id,
        }
    }
}

pub struct DedupGate<'a> {
    store: &'a LogStore,
}

impl<'a> DedupGate<'a> {
    pub fn new(store: &'a LogStore) -> Self {
        Self { store }
    }

    /// Admit a freshly captured record.
    ///
    /// Fills the dedup fields, then under one lock either appends the
    /// record or merges it into the existing record with the matching
    /// fingerprint. Merging never changes the existing record's status or
    /// description; only the occurrence bookkeeping moves.
    pub fn admit(&self, mut record: IssueRecord) -> Result<DedupOutcome> {
        let fingerprint = match &record.fingerprint {
            Some(fp) => fp.clone(),
            None => {
                let fp = compute_fingerprint(&record);
                record.fingerprint = Some(fp.clone());
                fp
            }
        };
        record.occurrence_count.get_or_insert(1);
        record
            .first_seen
            .get_or_insert_with(|| record.timestamp.clone());
        record
            .last_seen
            .get_or_insert_with(|| record.timestamp.clone());

        let lock = self.store.lock()?;
        let existing = self
            .store
            .read_all_locked(&lock)?
            .into_iter()
            .find(|r| fingerprints_match(r.fingerprint.as_deref().unwrap_or(""), &fingerprint));

        match existing {
            Some(found) => {
                let updated = self.store.update_by_id_locked(&lock, &found.id, |r| {
                    schema::merge_occurrence(r, &record);
                })?;
                let occurrence_count = updated.occurrence_count.unwrap_or(1);
                tracing::debug!(
                    id = %updated.id,
                    occurrence_count,
                    "duplicate capture merged"
                );
                Ok(DedupOutcome::Merged {
                    id: updated.id,
                    occurrence_count,
                })
            }
            None => {
                self.store.append_locked(&lock, &record)?;
                tracing::debug!(id = %record.id, "new issue captured");
                Ok(DedupOutcome::Inserted { id: record.id })
            }
        }
    }
}
