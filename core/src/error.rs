//! Error types for the convergence core.

use std::path::PathBuf;

use thiserror::Error;

/// Convergence result type alias.
pub type Result<T> = std::result::Result<T, ConvergenceError>;

/// Error taxonomy for the record store and pipeline.
///
/// Store- and guard-level failures (`Corrupt`, `Validation`) are handled
/// locally by quarantining; they appear here only when a caller asks for a
/// specific record that turned out to be unusable. Worker failures are
/// surfaced to the caller, which decides whether to retry, skip, or force.
#[derive(Debug, Error)]
pub enum ConvergenceError {
    /// Lock acquisition retries exhausted.
    #[error("could not acquire lock on {path} after {attempts} attempts")]
    LockTimeout { path: PathBuf, attempts: usize },

    /// A log line that does not parse as a record.
    #[error("corrupt record at {path}:{line}: {reason}")]
    Corrupt {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    /// A record that parses but fails schema validation.
    #[error("record {id} failed validation: {}", reasons.join("; "))]
    Validation { id: String, reasons: Vec<String> },

    /// Lookup by id found nothing.
    #[error("record not found: {id}")]
    NotFound { id: String },

    /// A worker collaborator failed or timed out during a phase.
    #[error("worker failed in phase {phase} for {id}: {note}")]
    Worker {
        phase: String,
        id: String,
        note: String,
    },

    /// Migration would overwrite a field it does not own. Additive-only
    /// migration makes this unreachable in practice; if it fires, the log
    /// was mutated by something outside the store contract.
    #[error("migration conflict on {id}: field {field} already populated with a different value")]
    MigrationConflict { id: String, field: String },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

impl ConvergenceError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
