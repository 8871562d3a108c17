//! Pipeline orchestration: research, debate, converge, one record at a
//! time.
//!
//! The orchestrator owns phase sequencing and status transitions; all
//! actual phase work is delegated to a [`Worker`]. Before running a phase
//! it consults the checkpoint ledger, and a phase whose outputs already
//! exist is skipped instead of re-run. A later phase never starts until
//! the previous one is durably marked complete.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::checkpoint::{ArtifactCheck, CheckpointLedger, PhaseStatus};
use crate::config::ConvergenceConfig;
use crate::error::{ConvergenceError, Result};
use crate::outputs::extract_markdown_output;
use crate::record::{IssueRecord, IssueStatus};
use crate::schema;
use crate::store::LogStore;
use crate::worker::{Worker, WorkerOutput, WorkerRequest};

/// Pipeline phases in execution order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Research,
    Debate,
    Converge,
}

impl Phase {
    pub fn sequence() -> [Phase; 3] {
        [Phase::Research, Phase::Debate, Phase::Converge]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Research => "research",
            Phase::Debate => "debate",
            Phase::Converge => "converge",
        }
    }

    /// Record status while this phase is running.
    pub fn running_status(self) -> IssueStatus {
        match self {
            Phase::Research => IssueStatus::Researching,
            Phase::Debate => IssueStatus::Debating,
            Phase::Converge => IssueStatus::Converging,
        }
    }

    /// Record status once this phase completed.
    pub fn done_status(self) -> IssueStatus {
        match self {
            Phase::Research => IssueStatus::Researched,
            Phase::Debate => IssueStatus::Debated,
            Phase::Converge => IssueStatus::Converged,
        }
    }

    /// Record status before this phase has run; failures roll back here.
    pub fn entry_status(self) -> IssueStatus {
        match self {
            Phase::Research => IssueStatus::Captured,
            Phase::Debate => IssueStatus::Researched,
            Phase::Converge => IssueStatus::Debated,
        }
    }
}

impl std::str::FromStr for Phase {
    type Err = ConvergenceError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "research" => Ok(Phase::Research),
            "debate" => Ok(Phase::Debate),
            "converge" | "convergence" => Ok(Phase::Converge),
            other => Err(ConvergenceError::Config(format!(
                "unknown phase '{other}' (expected research, debate, or converge)"
            ))),
        }
    }
}

/// Worker roles run inside the research phase, in artifact-file order.
pub const RESEARCH_ROLES: [&str; 3] = ["root_cause", "solutions", "impact"];

/// Outcome of one phase within a pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum PhaseSummary {
    /// Checkpoint satisfied (or phase earlier than the start phase).
    Skipped,
    Done {
        #[serde(skip_serializing_if = "Option::is_none")]
        note: Option<String>,
    },
    /// Only produced by batch runs, which keep going past one bad record.
    Failed { note: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct PhaseRun {
    pub phase: Phase,
    pub summary: PhaseSummary,
}

#[derive(Debug, Serialize)]
pub struct PipelineReport {
    pub record_id: String,
    pub phases: Vec<PhaseRun>,
}

#[derive(Debug, Serialize)]
pub struct PipelineStatus {
    pub total: usize,
    pub by_status: BTreeMap<String, usize>,
}

/// Existence checks for per-phase output artifacts.
struct PhaseArtifacts {
    research_dir: PathBuf,
}

impl ArtifactCheck for PhaseArtifacts {
    fn artifacts_present(&self, phase: Phase) -> bool {
        match phase {
            Phase::Research => RESEARCH_ROLES
                .iter()
                .any(|role| self.research_dir.join(format!("{role}.md")).exists()),
            Phase::Debate => self.research_dir.join("debate.md").exists(),
            // Converge synthesizes from everything upstream; it is never
            // trusted from a previous run.
            Phase::Converge => false,
        }
    }
}

pub struct Orchestrator {
    config: ConvergenceConfig,
    store: LogStore,
    worker: Arc<dyn Worker>,
}

impl Orchestrator {
    pub fn new(config: ConvergenceConfig, worker: Arc<dyn Worker>) -> Self {
        let store = LogStore::new(&config);
        Self {
            config,
            store,
            worker,
        }
    }

    pub fn store(&self) -> &LogStore {
        &self.store
    }

    /// Run the pipeline for one record.
    ///
    /// `force` clears the checkpoint and re-runs every phase; `from_phase`
    /// clears checkpoints from that phase onward and starts there. With
    /// neither, the run resumes at the first phase the ledger does not
    /// mark done.
    pub async fn run(
        &self,
        record_id: &str,
        from_phase: Option<Phase>,
        force: bool,
    ) -> Result<PipelineReport> {
        if !self.config.enabled {
            return Err(ConvergenceError::Config(
                "convergence is disabled in config".to_string(),
            ));
        }
        let record = self.store.read_by_id(record_id)?;
        if record.status == IssueStatus::Quarantined {
            return Err(ConvergenceError::Validation {
                id: record_id.to_string(),
                reasons: vec!["record is quarantined".to_string()],
            });
        }

        let research_dir = self.config.research_dir(record_id);
        let mut ledger = CheckpointLedger::load(&research_dir, record_id);

        let start = if force {
            ledger.clear_from(None)?;
            Phase::Research
        } else if let Some(phase) = from_phase {
            ledger.clear_from(Some(phase))?;
            phase
        } else {
            ledger.resume_phase().unwrap_or(Phase::Research)
        };

        tracing::info!(
            id = %record_id,
            start = start.as_str(),
            force,
            "running pipeline"
        );

        let artifacts = PhaseArtifacts {
            research_dir: research_dir.clone(),
        };
        let mut phases = Vec::new();
        for phase in Phase::sequence() {
            if phase < start {
                phases.push(PhaseRun {
                    phase,
                    summary: PhaseSummary::Skipped,
                });
                continue;
            }
            if !force && ledger.can_skip(phase, &artifacts) {
                tracing::info!(
                    id = %record_id,
                    phase = phase.as_str(),
                    "checkpoint satisfied, skipping phase"
                );
                ledger.record_phase_skipped(phase)?;
                self.advance_status_to(record_id, phase.done_status())?;
                phases.push(PhaseRun {
                    phase,
                    summary: PhaseSummary::Skipped,
                });
                continue;
            }

            let summary = self
                .run_phase(&mut ledger, record_id, phase, &research_dir)
                .await?;
            phases.push(PhaseRun { phase, summary });
        }

        Ok(PipelineReport {
            record_id: record_id.to_string(),
            phases,
        })
    }

    /// Research every record still in `captured`, validating the log
    /// first. One bad record does not stop the batch.
    pub async fn research_all(&self) -> Result<Vec<(String, PhaseSummary)>> {
        let validation = schema::validate_log(&self.store)?;
        if validation.quarantined > 0 {
            tracing::warn!(
                quarantined = validation.quarantined,
                "invalid records quarantined before batch research"
            );
        }

        let captured: Vec<String> = self
            .store
            .read_all()?
            .into_iter()
            .filter(|r| r.status == IssueStatus::Captured)
            .map(|r| r.id)
            .collect();
        if captured.is_empty() {
            tracing::info!("no unresearched records");
            return Ok(Vec::new());
        }
        tracing::info!(count = captured.len(), "researching captured records");

        let mut results = Vec::new();
        for id in captured {
            let research_dir = self.config.research_dir(&id);
            let mut ledger = CheckpointLedger::load(&research_dir, &id);
            let artifacts = PhaseArtifacts {
                research_dir: research_dir.clone(),
            };

            let summary = if ledger.can_skip(Phase::Research, &artifacts) {
                ledger.record_phase_skipped(Phase::Research)?;
                self.advance_status_to(&id, Phase::Research.done_status())?;
                PhaseSummary::Skipped
            } else {
                match self
                    .run_phase(&mut ledger, &id, Phase::Research, &research_dir)
                    .await
                {
                    Ok(summary) => summary,
                    Err(e) => {
                        tracing::error!(id = %id, error = %e, "research failed");
                        PhaseSummary::Failed {
                            note: e.to_string(),
                        }
                    }
                }
            };
            results.push((id, summary));
        }
        Ok(results)
    }

    /// Counts per record status.
    pub fn status(&self) -> Result<PipelineStatus> {
        let all = self.store.read_all()?;
        let mut by_status = BTreeMap::new();
        for record in &all {
            *by_status
                .entry(record.status.as_str().to_string())
                .or_insert(0usize) += 1;
        }
        Ok(PipelineStatus {
            total: all.len(),
            by_status,
        })
    }

    /// Records, optionally filtered by status.
    pub fn list(&self, status: Option<IssueStatus>) -> Result<Vec<IssueRecord>> {
        Ok(self
            .store
            .read_all()?
            .into_iter()
            .filter(|r| status.is_none_or(|s| r.status == s))
            .collect())
    }

    /// Close out a converged record.
    pub fn resolve(&self, record_id: &str) -> Result<IssueRecord> {
        let record = self.store.read_by_id(record_id)?;
        if record.status != IssueStatus::Converged {
            return Err(ConvergenceError::Validation {
                id: record_id.to_string(),
                reasons: vec![format!(
                    "only converged records can be resolved (status is '{}')",
                    record.status.as_str()
                )],
            });
        }
        self.store
            .update_by_id(record_id, |r| r.status = IssueStatus::Resolved)
    }

    async fn run_phase(
        &self,
        ledger: &mut CheckpointLedger,
        record_id: &str,
        phase: Phase,
        research_dir: &Path,
    ) -> Result<PhaseSummary> {
        ledger.record_phase_start(phase)?;
        self.set_status(record_id, phase.running_status())?;

        let result = match phase {
            Phase::Research => self.run_research(record_id, research_dir).await,
            Phase::Debate => self.run_debate(record_id, research_dir).await,
            Phase::Converge => self.run_converge(record_id, research_dir).await,
        };

        match result {
            Ok(note) => {
                ledger.record_phase_result(phase, PhaseStatus::Done, note.clone())?;
                self.set_status(record_id, phase.done_status())?;
                tracing::info!(id = %record_id, phase = phase.as_str(), "phase complete");
                Ok(PhaseSummary::Done { note })
            }
            Err(e) => {
                ledger.record_phase_result(phase, PhaseStatus::Failed, Some(e.to_string()))?;
                // Roll the record back to the phase's entry status so the
                // failure leaves last-known-good state, never a half-done
                // phase that looks complete.
                self.set_status(record_id, phase.entry_status())?;
                Err(e)
            }
        }
    }

    /// Research: root_cause and solutions run in parallel (bounded by
    /// `max_parallel_agents`), impact runs after both complete so it can
    /// reference their outputs. The phase succeeds if at least one role
    /// produced an artifact.
    async fn run_research(&self, record_id: &str, research_dir: &Path) -> Result<Option<String>> {
        let record = self.store.read_by_id(record_id)?;
        let semaphore = Arc::new(Semaphore::new(self.config.budget.max_parallel_agents.max(1)));

        let mut join_set: JoinSet<(&'static str, Result<WorkerOutput>)> = JoinSet::new();
        for role in ["root_cause", "solutions"] {
            let semaphore = semaphore.clone();
            let worker = self.worker.clone();
            let request = WorkerRequest {
                issue_id: record_id.to_string(),
                role: role.to_string(),
                prompt: research_prompt(role, &record),
            };
            join_set.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                (role, worker.invoke(Phase::Research, &request).await)
            });
        }

        // A task that panics leaves its role at the seeded failure entry.
        let mut outcomes: BTreeMap<&'static str, std::result::Result<(), String>> =
            [("root_cause", Err("did not complete".to_string())),
             ("solutions", Err("did not complete".to_string()))]
            .into();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((role, Ok(output))) => {
                    write_worker_artifacts(research_dir, role, &output)?;
                    outcomes.insert(role, Ok(()));
                }
                Ok((role, Err(e))) => {
                    tracing::error!(id = %record_id, role, error = %e, "research role failed");
                    outcomes.insert(role, Err(e.to_string()));
                }
                Err(join_err) => {
                    tracing::error!(id = %record_id, error = %join_err, "research task panicked");
                }
            }
        }

        // Barrier: impact only starts once the parallel roles are done.
        let impact_request = WorkerRequest {
            issue_id: record_id.to_string(),
            role: "impact".to_string(),
            prompt: research_prompt("impact", &record),
        };
        match self.worker.invoke(Phase::Research, &impact_request).await {
            Ok(output) => {
                write_worker_artifacts(research_dir, "impact", &output)?;
                outcomes.insert("impact", Ok(()));
            }
            Err(e) => {
                tracing::error!(id = %record_id, role = "impact", error = %e, "research role failed");
                outcomes.insert("impact", Err(e.to_string()));
            }
        }

        let note = outcomes
            .iter()
            .map(|(role, result)| match result {
                Ok(()) => format!("{role}=ok"),
                Err(_) => format!("{role}=failed"),
            })
            .collect::<Vec<_>>()
            .join(", ");

        if outcomes.values().all(|r| r.is_err()) {
            return Err(ConvergenceError::Worker {
                phase: Phase::Research.as_str().to_string(),
                id: record_id.to_string(),
                note: format!("all research roles failed ({note})"),
            });
        }
        Ok(Some(note))
    }

    /// Debate: one adversarial pass over the research outputs; with
    /// `debate_rounds >= 2` a refinement round follows, falling back to
    /// the round-1 output if the refinement fails.
    async fn run_debate(&self, record_id: &str, research_dir: &Path) -> Result<Option<String>> {
        let record = self.store.read_by_id(record_id)?;
        let context = read_research_context(research_dir);
        if context.is_empty() {
            return Err(ConvergenceError::Worker {
                phase: Phase::Debate.as_str().to_string(),
                id: record_id.to_string(),
                note: "no research outputs present; run research first".to_string(),
            });
        }

        let multi_round = self.config.budget.debate_rounds >= 2;
        let round1 = self
            .worker
            .invoke(
                Phase::Debate,
                &WorkerRequest {
                    issue_id: record_id.to_string(),
                    role: "debate".to_string(),
                    prompt: debate_prompt(&record, &context),
                },
            )
            .await?;

        if !multi_round {
            write_worker_artifacts(research_dir, "debate", &round1)?;
            return Ok(None);
        }

        write_worker_artifacts(research_dir, "debate_round1", &round1)?;
        let round2 = self
            .worker
            .invoke(
                Phase::Debate,
                &WorkerRequest {
                    issue_id: record_id.to_string(),
                    role: "debate_round2".to_string(),
                    prompt: debate_round2_prompt(&record, &round1.text),
                },
            )
            .await;

        match round2 {
            Ok(output) => {
                write_worker_artifacts(research_dir, "debate", &output)?;
                Ok(Some("2 rounds".to_string()))
            }
            Err(e) => {
                tracing::warn!(
                    id = %record_id,
                    error = %e,
                    "debate round 2 failed, keeping round 1 output"
                );
                write_worker_artifacts(research_dir, "debate", &round1)?;
                Ok(Some("round 2 failed, round 1 output kept".to_string()))
            }
        }
    }

    async fn run_converge(&self, record_id: &str, research_dir: &Path) -> Result<Option<String>> {
        let record = self.store.read_by_id(record_id)?;
        let mut context = read_research_context(research_dir);
        if let Ok(debate) = std::fs::read_to_string(research_dir.join("debate.md")) {
            context.push_str("\n## Debate\n\n");
            context.push_str(&debate);
        }

        let output = self
            .worker
            .invoke(
                Phase::Converge,
                &WorkerRequest {
                    issue_id: record_id.to_string(),
                    role: "converge".to_string(),
                    prompt: converge_prompt(&record, &context),
                },
            )
            .await?;
        write_worker_artifacts(research_dir, "convergence", &output)?;
        Ok(None)
    }

    fn set_status(&self, record_id: &str, status: IssueStatus) -> Result<()> {
        self.store.update_by_id(record_id, |r| r.status = status)?;
        Ok(())
    }

    /// Move the record's status forward to `target` if it is currently
    /// earlier in the sequence; never moves a status backwards.
    fn advance_status_to(&self, record_id: &str, target: IssueStatus) -> Result<()> {
        let sequence = IssueStatus::sequence();
        let target_idx = sequence.iter().position(|s| *s == target);
        self.store.update_by_id(record_id, |r| {
            let current_idx = sequence.iter().position(|s| *s == r.status);
            if let (Some(current), Some(target_pos)) = (current_idx, target_idx)
                && current < target_pos
            {
                r.status = target;
            }
        })?;
        Ok(())
    }
}

fn research_prompt(role: &str, record: &IssueRecord) -> String {
    let focus = match role {
        "root_cause" => "Identify the most likely root cause and the evidence for it.",
        "solutions" => "Propose concrete, ranked fixes with their tradeoffs.",
        _ => "Assess the blast radius: affected files, users, and workflows.",
    };
    format!(
        "Issue {id} ({kind}) on branch {branch}, tool {tool}.\n\n\
         {description}\n\nRaw error:\n{raw}\n\n{focus}",
        id = record.id,
        kind = record.issue_type.as_str(),
        branch = record.git_branch,
        tool = record.tool_name,
        description = record.description,
        raw = record.raw_error,
        focus = focus,
    )
}

fn debate_prompt(record: &IssueRecord, research_context: &str) -> String {
    format!(
        "Issue {id}: {description}\n\nResearch findings:\n{context}\n\n\
         Challenge the findings above adversarially: where is the evidence \
         weak, which fix is actually safest, and what did research miss?",
        id = record.id,
        description = record.description,
        context = research_context,
    )
}

fn debate_round2_prompt(record: &IssueRecord, round1: &str) -> String {
    format!(
        "Issue {id}.\n\nRound 1 debate:\n{round1}\n\n\
         Resolve the open challenges from round 1 into a final position.",
        id = record.id,
    )
}

fn converge_prompt(record: &IssueRecord, context: &str) -> String {
    format!(
        "Issue {id}: {description}\n\n{context}\n\n\
         Synthesize the above into a final recommendation: the accepted \
         root cause, the chosen fix, and the concrete next steps.",
        id = record.id,
        description = record.description,
        context = context,
    )
}

/// Concatenate whichever research artifacts exist, with role headers.
fn read_research_context(research_dir: &Path) -> String {
    let mut context = String::new();
    for role in RESEARCH_ROLES {
        if let Ok(content) = std::fs::read_to_string(research_dir.join(format!("{role}.md"))) {
            context.push_str(&format!("## {role}\n\n{content}\n\n"));
        }
    }
    context
}

/// Persist a worker's output: `<name>.md` with the markdown portion, plus
/// `<name>.json` when a structured block was extracted.
fn write_worker_artifacts(research_dir: &Path, name: &str, output: &WorkerOutput) -> Result<()> {
    std::fs::create_dir_all(research_dir).map_err(|e| ConvergenceError::io(research_dir, e))?;

    let md_path = research_dir.join(format!("{name}.md"));
    std::fs::write(&md_path, extract_markdown_output(&output.text))
        .map_err(|e| ConvergenceError::io(&md_path, e))?;

    if let Some(structured) = &output.structured {
        let json_path = research_dir.join(format!("{name}.json"));
        std::fs::write(&json_path, serde_json::to_vec_pretty(structured)?)
            .map_err(|e| ConvergenceError::io(&json_path, e))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::IssueType;
    use crate::worker::MockWorker;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn seeded(dir: &TempDir) -> (ConvergenceConfig, LogStore) {
        let config = ConvergenceConfig::with_root(dir.path());
        let store = LogStore::new(&config);
        store
            .append(&IssueRecord {
                id: "issue_x".to_string(),
                issue_type: IssueType::Error,
                timestamp: "2025-01-01T10:00:00+00:00".to_string(),
                description: "build broke".to_string(),
                status: IssueStatus::Captured,
                source: "test".to_string(),
                tool_name: "Bash".to_string(),
                git_branch: "main".to_string(),
                recent_files: vec![],
                working_directory: String::new(),
                raw_error: "error: expected `;`".to_string(),
                fingerprint: None,
                occurrence_count: None,
                first_seen: None,
                last_seen: None,
                extra: serde_json::Map::new(),
            })
            .unwrap();
        (config, store)
    }

    #[tokio::test]
    async fn full_run_advances_through_all_phases() {
        let dir = TempDir::new().unwrap();
        let (config, store) = seeded(&dir);
        let orchestrator = Orchestrator::new(config.clone(), Arc::new(MockWorker::default()));

        let report = orchestrator.run("issue_x", None, false).await.unwrap();
        assert_eq!(report.phases.len(), 3);
        for run in &report.phases {
            assert!(matches!(run.summary, PhaseSummary::Done { .. }));
        }

        assert_eq!(
            store.read_by_id("issue_x").unwrap().status,
            IssueStatus::Converged
        );
        let research_dir = config.research_dir("issue_x");
        for artifact in ["root_cause.md", "solutions.md", "impact.md", "debate.md", "convergence.md"] {
            assert!(research_dir.join(artifact).exists(), "missing {artifact}");
        }

        let ledger = CheckpointLedger::load(&research_dir, "issue_x");
        for phase in Phase::sequence() {
            assert_eq!(ledger.phase_status(phase), PhaseStatus::Done);
        }
    }

    #[tokio::test]
    async fn second_run_skips_completed_phases_but_reruns_converge() {
        let dir = TempDir::new().unwrap();
        let (config, _store) = seeded(&dir);
        let orchestrator = Orchestrator::new(config.clone(), Arc::new(MockWorker::default()));

        orchestrator.run("issue_x", None, false).await.unwrap();
        let report = orchestrator.run("issue_x", None, false).await.unwrap();

        assert_eq!(report.phases[0].summary, PhaseSummary::Skipped);
        assert_eq!(report.phases[1].summary, PhaseSummary::Skipped);
        // Converge aggregates and always re-runs.
        assert!(matches!(
            report.phases[2].summary,
            PhaseSummary::Done { .. }
        ));

        // The skips themselves are on the record's trajectory.
        let ledger = CheckpointLedger::load(&config.research_dir("issue_x"), "issue_x");
        let skipped: Vec<&str> = ledger
            .trajectory()
            .iter()
            .filter(|e| e.status == "skipped")
            .map(|e| e.phase.as_str())
            .collect();
        assert_eq!(skipped, vec!["research", "debate"]);
    }

    #[tokio::test]
    async fn from_phase_clears_downstream_checkpoints_and_reruns() {
        let dir = TempDir::new().unwrap();
        let (config, _store) = seeded(&dir);
        let orchestrator = Orchestrator::new(config.clone(), Arc::new(MockWorker::default()));

        orchestrator.run("issue_x", None, false).await.unwrap();
        let research_dir = config.research_dir("issue_x");
        let root_cause_before = std::fs::metadata(research_dir.join("root_cause.md"))
            .unwrap()
            .modified()
            .unwrap();

        let report = orchestrator
            .run("issue_x", Some(Phase::Debate), false)
            .await
            .unwrap();

        // Research stays untouched; debate and converge ran again.
        assert_eq!(report.phases[0].summary, PhaseSummary::Skipped);
        assert!(matches!(report.phases[1].summary, PhaseSummary::Done { .. }));
        assert!(matches!(report.phases[2].summary, PhaseSummary::Done { .. }));
        let root_cause_after = std::fs::metadata(research_dir.join("root_cause.md"))
            .unwrap()
            .modified()
            .unwrap();
        assert_eq!(root_cause_before, root_cause_after);

        let ledger = CheckpointLedger::load(&research_dir, "issue_x");
        assert_eq!(ledger.phase_status(Phase::Research), PhaseStatus::Done);
        assert!(
            ledger
                .trajectory()
                .iter()
                .any(|e| e.phase == "debate" && e.status == "cleared")
        );
    }

    #[tokio::test]
    async fn force_reruns_every_phase_despite_checkpoints() {
        let dir = TempDir::new().unwrap();
        let (config, _store) = seeded(&dir);
        let orchestrator = Orchestrator::new(config.clone(), Arc::new(MockWorker::default()));

        orchestrator.run("issue_x", None, false).await.unwrap();
        let report = orchestrator.run("issue_x", None, true).await.unwrap();

        for run in &report.phases {
            assert!(
                matches!(run.summary, PhaseSummary::Done { .. }),
                "{:?} was not re-run",
                run.phase
            );
        }

        // The full clear is on the trajectory, after the first run's events.
        let ledger = CheckpointLedger::load(&config.research_dir("issue_x"), "issue_x");
        assert!(
            ledger
                .trajectory()
                .iter()
                .any(|e| e.phase == "all" && e.status == "cleared")
        );
    }

    #[tokio::test]
    async fn debate_round_two_failure_falls_back_to_round_one() {
        let dir = TempDir::new().unwrap();
        let (mut config, _store) = seeded(&dir);
        config.budget.debate_rounds = 2;
        let orchestrator = Orchestrator::new(
            config.clone(),
            Arc::new(MockWorker::failing(&["debate_round2"])),
        );

        let report = orchestrator.run("issue_x", None, false).await.unwrap();
        assert!(matches!(
            &report.phases[1].summary,
            PhaseSummary::Done { note: Some(note) } if note.contains("round 1")
        ));

        // The kept output is round 1's.
        let research_dir = config.research_dir("issue_x");
        let debate = std::fs::read_to_string(research_dir.join("debate.md")).unwrap();
        assert!(debate.contains("Mock debate ("));
        assert!(research_dir.join("debate_round1.md").exists());
    }

    #[tokio::test]
    async fn debate_round_two_output_wins_when_it_succeeds() {
        let dir = TempDir::new().unwrap();
        let (mut config, _store) = seeded(&dir);
        config.budget.debate_rounds = 2;
        let orchestrator = Orchestrator::new(config.clone(), Arc::new(MockWorker::default()));

        orchestrator.run("issue_x", None, false).await.unwrap();
        let debate =
            std::fs::read_to_string(config.research_dir("issue_x").join("debate.md")).unwrap();
        assert!(debate.contains("Mock debate_round2"));
    }

    #[tokio::test]
    async fn deleted_research_artifacts_force_a_rerun() {
        let dir = TempDir::new().unwrap();
        let (config, _store) = seeded(&dir);
        let orchestrator = Orchestrator::new(config.clone(), Arc::new(MockWorker::default()));

        orchestrator.run("issue_x", None, false).await.unwrap();
        let research_dir = config.research_dir("issue_x");
        for role in RESEARCH_ROLES {
            std::fs::remove_file(research_dir.join(format!("{role}.md"))).unwrap();
        }

        let report = orchestrator.run("issue_x", None, false).await.unwrap();
        // Ledger says done, artifacts are gone: research must re-run.
        assert!(matches!(
            report.phases[0].summary,
            PhaseSummary::Done { .. }
        ));
        assert!(research_dir.join("root_cause.md").exists());
    }

    #[tokio::test]
    async fn debate_failure_freezes_status_and_surfaces_error() {
        let dir = TempDir::new().unwrap();
        let (config, store) = seeded(&dir);
        let orchestrator =
            Orchestrator::new(config.clone(), Arc::new(MockWorker::failing(&["debate"])));

        let err = orchestrator.run("issue_x", None, false).await.unwrap_err();
        assert!(matches!(err, ConvergenceError::Worker { .. }));

        // Research completed; the failed debate rolled back to its entry
        // status rather than advancing.
        assert_eq!(
            store.read_by_id("issue_x").unwrap().status,
            IssueStatus::Researched
        );
        let ledger = CheckpointLedger::load(&config.research_dir("issue_x"), "issue_x");
        assert_eq!(ledger.phase_status(Phase::Research), PhaseStatus::Done);
        assert_eq!(ledger.phase_status(Phase::Debate), PhaseStatus::Failed);
    }

    #[tokio::test]
    async fn all_research_roles_failing_fails_the_phase() {
        let dir = TempDir::new().unwrap();
        let (config, store) = seeded(&dir);
        let orchestrator = Orchestrator::new(
            config,
            Arc::new(MockWorker::failing(&["root_cause", "solutions", "impact"])),
        );

        let err = orchestrator.run("issue_x", None, false).await.unwrap_err();
        assert!(matches!(err, ConvergenceError::Worker { .. }));
        assert_eq!(
            store.read_by_id("issue_x").unwrap().status,
            IssueStatus::Captured
        );
    }

    #[tokio::test]
    async fn partial_research_success_completes_the_phase() {
        let dir = TempDir::new().unwrap();
        let (config, store) = seeded(&dir);
        let orchestrator = Orchestrator::new(
            config.clone(),
            Arc::new(MockWorker::failing(&["solutions"])),
        );

        let report = orchestrator.run("issue_x", None, false).await.unwrap();
        match &report.phases[0].summary {
            PhaseSummary::Done { note: Some(note) } => {
                assert!(note.contains("solutions=failed"));
                assert!(note.contains("root_cause=ok"));
            }
            other => panic!("unexpected research summary: {other:?}"),
        }
        assert_eq!(
            store.read_by_id("issue_x").unwrap().status,
            IssueStatus::Converged
        );
        assert!(!config.research_dir("issue_x").join("solutions.md").exists());
    }

    #[tokio::test]
    async fn research_all_processes_only_captured_records() {
        let dir = TempDir::new().unwrap();
        let (config, store) = seeded(&dir);
        store
            .update_by_id("issue_x", |r| r.status = IssueStatus::Resolved)
            .unwrap();
        let orchestrator = Orchestrator::new(config, Arc::new(MockWorker::default()));

        let results = orchestrator.research_all().await.unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn resolve_requires_converged_status() {
        let dir = TempDir::new().unwrap();
        let (config, store) = seeded(&dir);
        let orchestrator = Orchestrator::new(config, Arc::new(MockWorker::default()));

        let err = orchestrator.resolve("issue_x").unwrap_err();
        assert!(matches!(err, ConvergenceError::Validation { .. }));

        orchestrator.run("issue_x", None, false).await.unwrap();
        let resolved = orchestrator.resolve("issue_x").unwrap();
        assert_eq!(resolved.status, IssueStatus::Resolved);
        assert_eq!(
            store.read_by_id("issue_x").unwrap().status,
            IssueStatus::Resolved
        );
    }
}
