//! Configuration for the convergence pipeline.
//!
//! Everything path- or budget-related is resolved once at startup into a
//! [`ConvergenceConfig`] value and passed down through component
//! constructors. Components never consult environment variables or process
//! state themselves.
//!
//! Project root resolution (priority order):
//!   1. explicit override (CLI flag)
//!   2. `CONVERGENCE_PROJECT_DIR` env var
//!   3. current working directory
//!   4. the executable's install directory, as a last resort
//!
//! Runtime data lives under `{project_root}/.convergence/` so the tool does
//! not pollute its own install directory with per-project state.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{ConvergenceError, Result};

/// Env var naming the target project (set by the embedding tool).
pub const PROJECT_DIR_ENV: &str = "CONVERGENCE_PROJECT_DIR";

/// Config filename looked up at the project root.
pub const CONFIG_FILENAME: &str = "convergence.toml";

/// Budget controls for worker invocation.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    /// Max number of concurrent worker subprocesses within one phase.
    pub max_parallel_agents: usize,
    /// Timeout in seconds for each worker subprocess.
    pub timeout_seconds: u64,
    /// Debate rounds; a value of 2 enables the refinement pass.
    pub debate_rounds: u32,
    /// Model override per phase ("default" means no `--model` flag).
    pub research_model: String,
    pub debate_model: String,
    pub converge_model: String,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            max_parallel_agents: 2,
            timeout_seconds: 60,
            debate_rounds: 1,
            research_model: "default".to_string(),
            debate_model: "default".to_string(),
            converge_model: "default".to_string(),
        }
    }
}

/// Tuning for store lock acquisition.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Lock acquisition attempts before giving up with `LockTimeout`.
    pub max_attempts: usize,
    /// Initial backoff between attempts, doubled each retry.
    pub initial_backoff_ms: u64,
    /// Backoff ceiling.
    pub max_backoff_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            max_attempts: 20,
            initial_backoff_ms: 100,
            max_backoff_ms: 2_000,
        }
    }
}

/// Top-level configuration, deserialized from `convergence.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConvergenceConfig {
    /// Master kill switch for the whole pipeline.
    pub enabled: bool,
    /// When true, workers return canned output instead of spawning
    /// subprocesses. Used in tests and demos.
    pub sandbox_mode: bool,
    /// Command invoked for worker calls (print-mode agent CLI).
    pub worker_command: String,
    pub budget: BudgetConfig,
    pub lock: LockConfig,
    /// Resolved project root; filled in by [`ConvergenceConfig::load`],
    /// never read from the config file.
    #[serde(skip)]
    project_root: PathBuf,
}

impl Default for ConvergenceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sandbox_mode: false,
            worker_command: "claude".to_string(),
            budget: BudgetConfig::default(),
            lock: LockConfig::default(),
            project_root: PathBuf::new(),
        }
    }
}

impl ConvergenceConfig {
    /// Load configuration for the resolved project root.
    ///
    /// Missing config file means defaults; a present but malformed file is
    /// a hard error (silent fallback would mask operator typos).
    pub fn load(explicit_root: Option<&Path>) -> Result<Self> {
        let root = resolve_project_root(explicit_root);
        let path = root.join(CONFIG_FILENAME);

        let mut config = if path.exists() {
            let raw =
                std::fs::read_to_string(&path).map_err(|e| ConvergenceError::io(&path, e))?;
            toml::from_str::<Self>(&raw)
                .map_err(|e| ConvergenceError::Config(format!("{}: {e}", path.display())))?
        } else {
            Self::default()
        };

        config.project_root = root;
        Ok(config)
    }

    /// Construct a config rooted at an arbitrary directory (tests, demos).
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            project_root: root.into(),
            ..Self::default()
        }
    }

    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    /// Directory holding the record log, quarantine sink, and checkpoints.
    pub fn data_dir(&self) -> PathBuf {
        self.project_root.join(".convergence").join("data")
    }

    /// Path to the live record log.
    pub fn log_path(&self) -> PathBuf {
        self.data_dir().join("issues.jsonl")
    }

    /// Path to the quarantine sink.
    pub fn quarantine_path(&self) -> PathBuf {
        self.data_dir().join("quarantine.jsonl")
    }

    /// Per-record directory for phase outputs and the checkpoint file.
    pub fn research_dir(&self, record_id: &str) -> PathBuf {
        self.data_dir().join("research").join(record_id)
    }

    /// Archive directory used by reset; logs are moved here, never deleted.
    pub fn archive_dir(&self) -> PathBuf {
        self.project_root
            .join(".convergence")
            .join("archive")
    }

    /// Model override for a pipeline phase.
    pub fn model_for(&self, phase: crate::pipeline::Phase) -> &str {
        match phase {
            crate::pipeline::Phase::Research => &self.budget.research_model,
            crate::pipeline::Phase::Debate => &self.budget.debate_model,
            crate::pipeline::Phase::Converge => &self.budget.converge_model,
        }
    }
}

fn resolve_project_root(explicit: Option<&Path>) -> PathBuf {
    if let Some(path) = explicit
        && path.is_dir()
    {
        return canonical(path);
    }

    if let Ok(env_dir) = std::env::var(PROJECT_DIR_ENV) {
        let path = PathBuf::from(env_dir);
        if path.is_dir() {
            return canonical(&path);
        }
    }

    if let Ok(cwd) = std::env::current_dir() {
        return canonical(&cwd);
    }

    // Last resort: the directory the binary lives in.
    std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."))
}

fn canonical(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}
