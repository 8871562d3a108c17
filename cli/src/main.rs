//! Operational surface over the convergence core.
//!
//! ## Commands
//!
//! - `convergence list [--status S]`
//! - `convergence show <ID>`
//! - `convergence capture` (hook payload on stdin)
//! - `convergence run <ID> [--from PHASE] [--force]`
//! - `convergence run-all`
//! - `convergence status`
//! - `convergence checkpoint <ID>`
//! - `convergence resolve <ID>`
//! - `convergence reset`

use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};

use convergence_core::capture::{CapturePayload, GitContext, build_record};
use convergence_core::checkpoint::CheckpointLedger;
use convergence_core::pipeline::Phase;
use convergence_core::{
    CliWorker, ConvergenceConfig, DedupGate, DedupOutcome, IssueStatus, LogStore, MockWorker,
    Orchestrator, Worker,
};

#[derive(Debug, Parser)]
#[command(name = "convergence", version, about = "Issue capture and convergence pipeline")]
struct Cli {
    /// Project root (defaults to $CONVERGENCE_PROJECT_DIR, then cwd).
    #[arg(long = "project-root", short = 'C', global = true)]
    project_root: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List issue records, optionally filtered by status.
    List {
        /// Status filter (captured, researching, ..., resolved).
        #[arg(long)]
        status: Option<String>,
    },
    /// Show one record and its phase artifacts.
    Show { id: String },
    /// Capture a tool-failure payload (JSON on stdin) into the log.
    Capture,
    /// Run the pipeline for one record.
    Run {
        id: String,
        /// Start from this phase, clearing its checkpoint and later ones.
        #[arg(long = "from")]
        from: Option<String>,
        /// Ignore checkpoints and re-run every phase.
        #[arg(long)]
        force: bool,
    },
    /// Research every record still in `captured`.
    RunAll,
    /// Record counts per status.
    Status,
    /// Show a record's checkpoint state and full trajectory.
    Checkpoint { id: String },
    /// Mark a converged record resolved.
    Resolve { id: String },
    /// Archive the record log and start fresh (never deletes in place).
    Reset,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = ConvergenceConfig::load(cli.project_root.as_deref())?;

    match cli.command {
        Command::List { status } => {
            let status = status
                .map(|s| {
                    IssueStatus::from_str(&s)
                        .ok_or_else(|| anyhow::anyhow!("unknown status '{s}'"))
                })
                .transpose()?;
            let orchestrator = orchestrator(config);
            for record in orchestrator.list(status)? {
                println!(
                    "{}  {:12}  x{:<3}  {}",
                    record.id,
                    record.status.as_str(),
                    record.occurrence_count.unwrap_or(1),
                    first_line(&record.description),
                );
            }
        }
        Command::Show { id } => {
            let store = LogStore::new(&config);
            let record = store.read_by_id(&id)?;
            println!("{}", serde_json::to_string_pretty(&record)?);

            let research_dir = config.research_dir(&id);
            if research_dir.is_dir() {
                println!("\nartifacts in {}:", research_dir.display());
                let mut entries: Vec<_> = std::fs::read_dir(&research_dir)
                    .with_context(|| format!("reading {}", research_dir.display()))?
                    .filter_map(|e| e.ok())
                    .map(|e| e.file_name().to_string_lossy().into_owned())
                    .collect();
                entries.sort();
                for entry in entries {
                    println!("  {entry}");
                }
            }
        }
        Command::Capture => {
            // Capture is an observer: whatever happens, the failing tool
            // call is allowed through.
            if let Err(e) = capture_from_stdin(&config) {
                tracing::error!(error = %e, "capture failed");
            }
            println!("{}", serde_json::json!({ "result": "allow" }));
        }
        Command::Run { id, from, force } => {
            let from = from.map(|s| s.parse::<Phase>()).transpose()?;
            let orchestrator = orchestrator(config);
            let report = orchestrator.run(&id, from, force).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::RunAll => {
            let orchestrator = orchestrator(config);
            let results = orchestrator.research_all().await?;
            println!("researched {} records", results.len());
            for (id, summary) in results {
                println!("  {id}: {}", serde_json::to_string(&summary)?);
            }
        }
        Command::Status => {
            let orchestrator = orchestrator(config);
            println!("{}", serde_json::to_string_pretty(&orchestrator.status()?)?);
        }
        Command::Checkpoint { id } => {
            let ledger = CheckpointLedger::load(&config.research_dir(&id), &id);
            let phases: serde_json::Map<String, serde_json::Value> = Phase::sequence()
                .into_iter()
                .map(|phase| {
                    let state = ledger
                        .phase_state(phase)
                        .map(|s| serde_json::to_value(s))
                        .transpose()?
                        .unwrap_or(serde_json::Value::String("pending".to_string()));
                    Ok((phase.as_str().to_string(), state))
                })
                .collect::<anyhow::Result<_>>()?;
            let doc = serde_json::json!({
                "issue_id": id,
                "phases": phases,
                "trajectory": ledger.trajectory(),
            });
            println!("{}", serde_json::to_string_pretty(&doc)?);
        }
        Command::Resolve { id } => {
            let orchestrator = orchestrator(config);
            let record = orchestrator.resolve(&id)?;
            println!("{} resolved", record.id);
        }
        Command::Reset => {
            let store = LogStore::new(&config);
            match store.archive()? {
                Some(path) => println!("log archived to {}", path.display()),
                None => println!("nothing to archive"),
            }
        }
    }

    Ok(())
}

fn orchestrator(config: ConvergenceConfig) -> Orchestrator {
    let worker: Arc<dyn Worker> = if config.sandbox_mode {
        Arc::new(MockWorker::default())
    } else {
        Arc::new(CliWorker::new(&config))
    };
    Orchestrator::new(config, worker)
}

fn capture_from_stdin(config: &ConvergenceConfig) -> anyhow::Result<()> {
    if !config.enabled {
        return Ok(());
    }

    let mut raw = String::new();
    std::io::stdin()
        .read_to_string(&mut raw)
        .context("reading hook payload from stdin")?;
    if raw.trim().is_empty() {
        bail!("empty hook payload");
    }
    let payload: CapturePayload =
        serde_json::from_str(&raw).context("parsing hook payload")?;

    let git = GitContext::detect(config.project_root());
    let working_dir = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let record = build_record(&payload, &git, &working_dir);

    let store = LogStore::new(config);
    let gate = DedupGate::new(&store);
    match gate.admit(record)? {
        DedupOutcome::Inserted { id } => tracing::info!(id = %id, "issue captured"),
        DedupOutcome::Merged {
            id,
            occurrence_count,
        } => tracing::info!(id = %id, occurrence_count, "duplicate capture merged"),
    }
    Ok(())
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or_default()
}
