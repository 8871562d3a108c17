//! Per-record checkpoint ledger.
//!
//! One `checkpoint.json` per record, holding the latest state of each
//! pipeline phase plus an append-only trajectory of every transition.
//! Phase states may be cleared to force a re-run; the trajectory is never
//! truncated, so the full history survives resets.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::{ConvergenceError, Result};
use crate::pipeline::Phase;

pub const LEDGER_FILENAME: &str = "checkpoint.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PhaseStatus {
    Pending,
    Running,
    Done,
    Failed,
    Skipped,
}

impl PhaseStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PhaseStatus::Pending => "pending",
            PhaseStatus::Running => "running",
            PhaseStatus::Done => "done",
            PhaseStatus::Failed => "failed",
            PhaseStatus::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseState {
    pub status: PhaseStatus,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// One entry in the append-only history. `phase` is a plain string so
/// clear events ("all") fit alongside real phases.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrajectoryEvent {
    pub phase: String,
    pub status: String,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LedgerDoc {
    issue_id: String,
    #[serde(default)]
    phases: BTreeMap<Phase, PhaseState>,
    #[serde(default)]
    trajectory: Vec<TrajectoryEvent>,
    created_at: String,
    last_updated: String,
}

impl LedgerDoc {
    fn empty(issue_id: &str) -> Self {
        let now = Utc::now().to_rfc3339();
        Self {
            issue_id: issue_id.to_string(),
            phases: BTreeMap::new(),
            trajectory: Vec::new(),
            created_at: now.clone(),
            last_updated: now,
        }
    }
}

/// Answers "do the phase's output artifacts still exist on disk". Implemented
/// by the orchestrator, which knows the artifact layout per phase.
pub trait ArtifactCheck {
    fn artifacts_present(&self, phase: Phase) -> bool;
}

/// Ledger handle bound to one record's checkpoint file.
pub struct CheckpointLedger {
    path: PathBuf,
    doc: LedgerDoc,
}

impl CheckpointLedger {
    /// Load the ledger for a record, or start an empty one. A corrupt
    /// ledger file is treated as absent (the pipeline re-runs rather than
    /// failing on old state) and a warning is traced.
    pub fn load(research_dir: &Path, issue_id: &str) -> Self {
        let path = research_dir.join(LEDGER_FILENAME);
        let doc = match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<LedgerDoc>(&raw) {
                Ok(doc) => doc,
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        reason = %e,
                        "corrupt checkpoint ledger, starting fresh"
                    );
                    LedgerDoc::empty(issue_id)
                }
            },
            Err(_) => LedgerDoc::empty(issue_id),
        };
        Self { path, doc }
    }

    pub fn issue_id(&self) -> &str {
        &self.doc.issue_id
    }

    /// Latest state of a phase; a phase never touched is `Pending`.
    pub fn phase_status(&self, phase: Phase) -> PhaseStatus {
        self.doc
            .phases
            .get(&phase)
            .map(|s| s.status)
            .unwrap_or(PhaseStatus::Pending)
    }

    pub fn phase_state(&self, phase: Phase) -> Option<&PhaseState> {
        self.doc.phases.get(&phase)
    }

    /// Full append-only transition history, oldest first.
    pub fn trajectory(&self) -> &[TrajectoryEvent] {
        &self.doc.trajectory
    }

    /// Mark a phase as started and persist.
    pub fn record_phase_start(&mut self, phase: Phase) -> Result<()> {
        self.set_phase(phase, PhaseStatus::Running, None)
    }

    /// Record a phase outcome and persist.
    pub fn record_phase_result(
        &mut self,
        phase: Phase,
        status: PhaseStatus,
        note: Option<String>,
    ) -> Result<()> {
        self.set_phase(phase, status, note)
    }

    /// Note a checkpoint-satisfied skip in the trajectory. The phase's
    /// stored `done` state is left alone so a later run can skip it again.
    pub fn record_phase_skipped(&mut self, phase: Phase) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.doc.trajectory.push(TrajectoryEvent {
            phase: phase.as_str().to_string(),
            status: PhaseStatus::Skipped.as_str().to_string(),
            timestamp: now.clone(),
            note: None,
        });
        self.doc.last_updated = now;
        self.save()
    }

    /// A phase may be skipped only when the ledger says `done` AND its
    /// output artifacts still exist. A missing artifact makes the phase
    /// look pending again, so a deleted output re-runs instead of being
    /// trusted.
    pub fn can_skip(&self, phase: Phase, artifacts: &dyn ArtifactCheck) -> bool {
        self.phase_status(phase) == PhaseStatus::Done && artifacts.artifacts_present(phase)
    }

    /// Drop phase states from `from` onward (inclusive), or all of them
    /// when `from` is `None`. The clearing itself is appended to the
    /// trajectory; history is never rewritten.
    pub fn clear_from(&mut self, from: Option<Phase>) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        match from {
            None => {
                self.doc.phases.clear();
                self.doc.trajectory.push(TrajectoryEvent {
                    phase: "all".to_string(),
                    status: "cleared".to_string(),
                    timestamp: now.clone(),
                    note: None,
                });
            }
            Some(from) => {
                let cleared: Vec<&str> = Phase::sequence()
                    .iter()
                    .filter(|p| **p >= from)
                    .map(|p| p.as_str())
                    .collect();
                self.doc.phases.retain(|p, _| *p < from);
                self.doc.trajectory.push(TrajectoryEvent {
                    phase: from.as_str().to_string(),
                    status: "cleared".to_string(),
                    timestamp: now.clone(),
                    note: Some(format!("cleared: {}", cleared.join(", "))),
                });
            }
        }
        self.doc.last_updated = now;
        self.save()
    }

    /// First phase not yet `done`, in pipeline order. `None` means the
    /// whole pipeline has completed for this record.
    pub fn resume_phase(&self) -> Option<Phase> {
        Phase::sequence()
            .into_iter()
            .find(|p| self.phase_status(*p) != PhaseStatus::Done)
    }

    fn set_phase(&mut self, phase: Phase, status: PhaseStatus, note: Option<String>) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.doc.phases.insert(
            phase,
            PhaseState {
                status,
                timestamp: now.clone(),
                note: note.clone(),
            },
        );
        self.doc.trajectory.push(TrajectoryEvent {
            phase: phase.as_str().to_string(),
            status: status.as_str().to_string(),
            timestamp: now.clone(),
            note,
        });
        self.doc.last_updated = now;
        self.save()
    }

    fn save(&self) -> Result<()> {
        let parent = self
            .path
            .parent()
            .ok_or_else(|| ConvergenceError::Config("ledger path has no parent".to_string()))?;
        std::fs::create_dir_all(parent).map_err(|e| ConvergenceError::io(parent, e))?;

        let tmp = self.path.with_extension("json.tmp");
        let mut file = std::fs::File::create(&tmp).map_err(|e| ConvergenceError::io(&tmp, e))?;
        let body = serde_json::to_vec_pretty(&self.doc)?;
        file.write_all(&body)
            .and_then(|_| file.sync_all())
            .map_err(|e| ConvergenceError::io(&tmp, e))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| ConvergenceError::io(&self.path, e))?;
        Ok(())
    }
}
