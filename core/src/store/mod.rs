//! Locked, append-mostly record log.
//!
//! One JSON object per line. All mutation happens under the cross-process
//! [`StoreLock`]; reads are lock-free unless a corrupt line forces a
//! read-repair. Updates rewrite the whole file to a temp sibling and rename
//! over the original, so an interrupted write can never leave a torn file.
//!
//! A line that fails to parse never fails the read: it is moved to the
//! quarantine sink with its raw content intact and the rest of the log is
//! returned as usual.

mod lock;

pub use lock::{StoreLock, lock_path_for};

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::config::{ConvergenceConfig, LockConfig};
use crate::error::{ConvergenceError, Result};
use crate::record::IssueRecord;

/// A raw log line that failed to parse, as stored in the quarantine sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuarantinedLine {
    pub raw_line: String,
    pub line_number: usize,
    pub error: String,
    pub quarantined_at: String,
}

/// Handle to the record log and its quarantine sink.
///
/// Constructed once from config and injected into every component that
/// needs it; nothing else writes these files.
pub struct LogStore {
    log_path: PathBuf,
    quarantine_path: PathBuf,
    archive_dir: PathBuf,
    lock_config: LockConfig,
}

impl LogStore {
    pub fn new(config: &ConvergenceConfig) -> Self {
        Self {
            log_path: config.log_path(),
            quarantine_path: config.quarantine_path(),
            archive_dir: config.archive_dir(),
            lock_config: config.lock.clone(),
        }
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn quarantine_path(&self) -> &Path {
        &self.quarantine_path
    }

    /// Acquire the store's exclusive lock. Required by every `*_locked`
    /// primitive; hold it across a read-check-write sequence to make the
    /// sequence atomic with respect to other processes.
    pub fn lock(&self) -> Result<StoreLock> {
        StoreLock::acquire(&self.log_path, &self.lock_config)
    }

    /// Append one record as a single line. Serialization happens before any
    /// I/O so a non-serializable record is rejected without touching the
    /// file.
    pub fn append(&self, record: &IssueRecord) -> Result<()> {
        let lock = self.lock()?;
        self.append_locked(&lock, record)
    }

    pub fn append_locked(&self, _lock: &StoreLock, record: &IssueRecord) -> Result<()> {
        let line = serde_json::to_string(record)?;
        self.append_raw_line(&self.log_path, &line)
    }

    /// Read every well-formed record in insertion order.
    ///
    /// Corrupt lines are moved to the quarantine sink (read-repair under
    /// the store lock) and excluded from the result. The common clean-log
    /// path takes no lock.
    pub fn read_all(&self) -> Result<Vec<IssueRecord>> {
        let (records, corrupt) = self.parse_log()?;
        if corrupt.is_empty() {
            return Ok(records);
        }

        let lock = self.lock()?;
        // Re-read under the lock; the file may have changed since the
        // optimistic pass.
        let (records, corrupt) = self.parse_log()?;
        if corrupt.is_empty() {
            return Ok(records);
        }

        for entry in &corrupt {
            tracing::warn!(
                path = %self.log_path.display(),
                line = entry.line_number,
                reason = %entry.error,
                "quarantining corrupt log line"
            );
            let line = serde_json::to_string(entry)?;
            self.append_raw_line(&self.quarantine_path, &line)?;
        }
        self.rewrite_locked(&lock, &records)?;

        Ok(records)
    }

    /// Read variant for callers already holding the store lock. Corrupt
    /// lines are skipped here and left for the next [`read_all`] pass to
    /// repair.
    ///
    /// [`read_all`]: LogStore::read_all
    pub fn read_all_locked(&self, _lock: &StoreLock) -> Result<Vec<IssueRecord>> {
        Ok(self.parse_log()?.0)
    }

    /// Fetch a single record by id.
    pub fn read_by_id(&self, id: &str) -> Result<IssueRecord> {
        self.read_all()?
            .into_iter()
            .find(|r| r.id == id)
            .ok_or_else(|| ConvergenceError::NotFound { id: id.to_string() })
    }

    /// Apply `mutator` to the record with `id` and persist the result.
    pub fn update_by_id(
        &self,
        id: &str,
        mutator: impl FnOnce(&mut IssueRecord),
    ) -> Result<IssueRecord> {
        let lock = self.lock()?;
        self.update_by_id_locked(&lock, id, mutator)
    }

    /// Locked variant for callers already holding the store lock.
    ///
    /// The rewrite copies lines it cannot parse verbatim; unparsable lines
    /// are isolated by the read path, never dropped by an update.
    pub fn update_by_id_locked(
        &self,
        lock: &StoreLock,
        id: &str,
        mutator: impl FnOnce(&mut IssueRecord),
    ) -> Result<IssueRecord> {
        let raw = self.read_raw()?;
        // Taken on the first id match, so each later line is copied as-is.
        let mut mutator = Some(mutator);
        let mut updated: Option<IssueRecord> = None;
        let mut lines: Vec<String> = Vec::new();

        for line in raw.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<IssueRecord>(line) {
                Ok(mut record) if record.id == id && updated.is_none() => {
                    if let Some(mutate) = mutator.take() {
                        mutate(&mut record);
                    }
                    lines.push(serde_json::to_string(&record)?);
                    updated = Some(record);
                }
                Ok(_) | Err(_) => lines.push(line.to_string()),
            }
        }

        let record = updated.ok_or_else(|| ConvergenceError::NotFound { id: id.to_string() })?;
        self.write_lines_locked(lock, &lines)?;
        Ok(record)
    }

    /// Append an arbitrary JSON value to the quarantine sink (used by the
    /// schema guard for records that parse but fail validation).
    pub fn quarantine_value(&self, _lock: &StoreLock, value: &serde_json::Value) -> Result<()> {
        let line = serde_json::to_string(value)?;
        self.append_raw_line(&self.quarantine_path, &line)
    }

    /// Replace the log's contents with `records`, atomically.
    pub fn rewrite_locked(&self, lock: &StoreLock, records: &[IssueRecord]) -> Result<()> {
        let mut lines = Vec::with_capacity(records.len());
        for record in records {
            lines.push(serde_json::to_string(record)?);
        }
        self.write_lines_locked(lock, &lines)
    }

    /// Read quarantine sink entries as raw JSON values.
    pub fn read_quarantine(&self) -> Result<Vec<serde_json::Value>> {
        if !self.quarantine_path.exists() {
            return Ok(Vec::new());
        }
        let raw = std::fs::read_to_string(&self.quarantine_path)
            .map_err(|e| ConvergenceError::io(&self.quarantine_path, e))?;
        Ok(raw
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect())
    }

    /// Move the live log (and quarantine sink) into the archive directory
    /// and start fresh. Nothing is ever deleted in place.
    pub fn archive(&self) -> Result<Option<PathBuf>> {
        let _lock = self.lock()?;
        if !self.log_path.exists() {
            return Ok(None);
        }

        std::fs::create_dir_all(&self.archive_dir)
            .map_err(|e| ConvergenceError::io(&self.archive_dir, e))?;
        let stamp = Utc::now().format("%Y%m%d_%H%M%S");

        let archived = self.archive_dir.join(format!("issues_{stamp}.jsonl"));
        std::fs::rename(&self.log_path, &archived)
            .map_err(|e| ConvergenceError::io(&self.log_path, e))?;

        if self.quarantine_path.exists() {
            let dest = self.archive_dir.join(format!("quarantine_{stamp}.jsonl"));
            std::fs::rename(&self.quarantine_path, &dest)
                .map_err(|e| ConvergenceError::io(&self.quarantine_path, e))?;
        }

        tracing::info!(archived = %archived.display(), "record log archived");
        Ok(Some(archived))
    }

    // ── internals ────────────────────────────────────────────────────────

    fn parse_log(&self) -> Result<(Vec<IssueRecord>, Vec<QuarantinedLine>)> {
        let raw = self.read_raw()?;
        let mut records = Vec::new();
        let mut corrupt = Vec::new();

        for (idx, line) in raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<IssueRecord>(line) {
                Ok(record) => records.push(record),
                Err(e) => {
                    let err = ConvergenceError::Corrupt {
                        path: self.log_path.clone(),
                        line: idx + 1,
                        reason: e.to_string(),
                    };
                    corrupt.push(QuarantinedLine {
                        raw_line: line.to_string(),
                        line_number: idx + 1,
                        error: err.to_string(),
                        quarantined_at: Utc::now().to_rfc3339(),
                    });
                }
            }
        }

        Ok((records, corrupt))
    }

    fn read_raw(&self) -> Result<String> {
        if !self.log_path.exists() {
            return Ok(String::new());
        }
        std::fs::read_to_string(&self.log_path).map_err(|e| ConvergenceError::io(&self.log_path, e))
    }

    fn append_raw_line(&self, path: &Path, line: &str) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConvergenceError::io(parent, e))?;
        }
        let mut file = OpenAppend::open(path)?;
        file.write_line(line)
    }

    fn write_lines_locked(&self, _lock: &StoreLock, lines: &[String]) -> Result<()> {
        let parent = self
            .log_path
            .parent()
            .ok_or_else(|| ConvergenceError::Config("log path has no parent".to_string()))?;
        std::fs::create_dir_all(parent).map_err(|e| ConvergenceError::io(parent, e))?;

        let tmp = self.log_path.with_extension("jsonl.tmp");
        let mut file =
            std::fs::File::create(&tmp).map_err(|e| ConvergenceError::io(&tmp, e))?;
        for line in lines {
            file.write_all(line.as_bytes())
                .and_then(|_| file.write_all(b"\n"))
                .map_err(|e| ConvergenceError::io(&tmp, e))?;
        }
        file.sync_all().map_err(|e| ConvergenceError::io(&tmp, e))?;

        std::fs::rename(&tmp, &self.log_path)
            .map_err(|e| ConvergenceError::io(&self.log_path, e))?;
        Ok(())
    }
}

/// Append handle that fsyncs per line, keeping appends line-atomic.
struct OpenAppend {
    file: std::fs::File,
    path: PathBuf,
}

impl OpenAppend {
    fn open(path: &Path) -> Result<Self> {
        let file = std::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(path)
            .map_err(|e| ConvergenceError::io(path, e))?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    fn write_line(&mut self, line: &str) -> Result<()> {
        let mut buf = Vec::with_capacity(line.len() + 1);
        buf.extend_from_slice(line.as_bytes());
        buf.push(b'\n');
        // Single write_all keeps the line plus terminator in one syscall
        // path; concurrent appenders each hold the store lock anyway.
        self.file
            .write_all(&buf)
            .and_then(|_| self.file.sync_all())
            .map_err(|e| ConvergenceError::io(&self.path, e))
    }
}
