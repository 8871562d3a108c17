//! Convergence Engine core.
//!
//! Durable issue-record pipeline: tool failures are captured into a
//! locked JSONL log, deduplicated by content fingerprint, and processed
//! through a crash-resumable research → debate → converge pipeline backed
//! by per-record checkpoint ledgers.
//!
//! This crate is the whole engine; the `convergence-cli` binary is a thin
//! operational surface over it.

#![deny(clippy::print_stdout, clippy::print_stderr)]

pub mod capture;
pub mod checkpoint;
pub mod config;
pub mod dedup;
pub mod error;
pub mod fingerprint;
pub mod outputs;
pub mod pipeline;
pub mod record;
pub mod schema;
pub mod store;
pub mod worker;

pub use config::ConvergenceConfig;
pub use dedup::{DedupGate, DedupOutcome};
pub use error::{ConvergenceError, Result};
pub use pipeline::{Orchestrator, Phase};
pub use record::{IssueRecord, IssueStatus, IssueType};
pub use store::LogStore;
pub use worker::{CliWorker, MockWorker, Worker};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
