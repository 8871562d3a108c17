//! Worker collaborators: the pipeline delegates phase work to a worker
//! and only interprets the result.
//!
//! The real worker spawns a configured agent CLI in print mode, feeding
//! the prompt on stdin under a hard timeout. Sandbox mode and tests use
//! [`MockWorker`] so no subprocess is ever spawned.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::config::{ConvergenceConfig, PROJECT_DIR_ENV};
use crate::error::{ConvergenceError, Result};
use crate::outputs::extract_json_output;
use crate::pipeline::Phase;

/// A single unit of phase work handed to a worker.
#[derive(Debug, Clone)]
pub struct WorkerRequest {
    pub issue_id: String,
    /// Role within the phase, e.g. `root_cause`, `solutions`, `impact`.
    pub role: String,
    pub prompt: String,
}

#[derive(Debug, Clone)]
pub struct WorkerOutput {
    pub text: String,
    pub structured: Option<serde_json::Value>,
}

#[async_trait]
pub trait Worker: Send + Sync {
    async fn invoke(&self, phase: Phase, request: &WorkerRequest) -> Result<WorkerOutput>;
}

/// Spawns the configured agent CLI (`<command> -p [--model M]`) with the
/// prompt on stdin.
pub struct CliWorker {
    command: String,
    models: HashMap<Phase, String>,
    timeout: Duration,
    project_root: PathBuf,
}

impl CliWorker {
    pub fn new(config: &ConvergenceConfig) -> Self {
        let models = Phase::sequence()
            .into_iter()
            .map(|p| (p, config.model_for(p).to_string()))
            .collect();
        Self {
            command: config.worker_command.clone(),
            models,
            timeout: Duration::from_secs(config.budget.timeout_seconds),
            project_root: config.project_root().to_path_buf(),
        }
    }

    fn worker_err(&self, phase: Phase, request: &WorkerRequest, note: String) -> ConvergenceError {
        ConvergenceError::Worker {
            phase: phase.as_str().to_string(),
            id: request.issue_id.clone(),
            note,
        }
    }
}

#[async_trait]
impl Worker for CliWorker {
    async fn invoke(&self, phase: Phase, request: &WorkerRequest) -> Result<WorkerOutput> {
        let mut cmd = Command::new(&self.command);
        cmd.arg("-p");
        if let Some(model) = self.models.get(&phase)
            && model != "default"
        {
            cmd.args(["--model", model]);
        }
        cmd.current_dir(&self.project_root)
            .env(PROJECT_DIR_ENV, &self.project_root)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::info!(
            phase = phase.as_str(),
            id = %request.issue_id,
            role = %request.role,
            prompt_len = request.prompt.len(),
            "spawning worker subprocess"
        );

        let mut child = cmd
            .spawn()
            .map_err(|e| self.worker_err(phase, request, format!("spawn failed: {e}")))?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(request.prompt.as_bytes())
                .await
                .map_err(|e| self.worker_err(phase, request, format!("stdin write failed: {e}")))?;
            // Dropping closes the pipe so the child sees EOF.
        }

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                self.worker_err(
                    phase,
                    request,
                    format!("timed out after {} seconds", self.timeout.as_secs()),
                )
            })?
            .map_err(|e| self.worker_err(phase, request, format!("wait failed: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let note = if stderr.is_empty() {
                format!("exit code {:?}", output.status.code())
            } else {
                stderr
            };
            return Err(self.worker_err(phase, request, note));
        }

        let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let structured = extract_json_output(&text);
        if structured.is_some() {
            tracing::debug!(id = %request.issue_id, "structured block extracted from worker output");
        }
        Ok(WorkerOutput { text, structured })
    }
}

/// Canned per-phase output for sandbox mode and tests.
#[derive(Default)]
pub struct MockWorker {
    /// Roles that should fail instead of producing output.
    pub failing_roles: Vec<String>,
}

impl MockWorker {
    pub fn failing(roles: &[&str]) -> Self {
        Self {
            failing_roles: roles.iter().map(|r| r.to_string()).collect(),
        }
    }
}

#[async_trait]
impl Worker for MockWorker {
    async fn invoke(&self, phase: Phase, request: &WorkerRequest) -> Result<WorkerOutput> {
        if self.failing_roles.contains(&request.role) {
            return Err(ConvergenceError::Worker {
                phase: phase.as_str().to_string(),
                id: request.issue_id.clone(),
                note: format!("mock failure for role '{}'", request.role),
            });
        }
        let text = format!(
            "## Mock {} ({})\n\nSandboxed output for {}.\n\n===JSON_OUTPUT===\n{{\"role\": \"{}\", \"mock\": true}}\n===JSON_OUTPUT_END===",
            request.role,
            phase.as_str(),
            request.issue_id,
            request.role,
        );
        let structured = extract_json_output(&text);
        Ok(WorkerOutput { text, structured })
    }
}
