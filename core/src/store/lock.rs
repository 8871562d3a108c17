//! Cross-process lock for the record log.
//!
//! A sidecar `<file>.lock` is created with `O_CREAT | O_EXCL`, doubled up
//! with an advisory OS lock, and holds JSON metadata identifying the
//! holder. The metadata makes lock contention diagnosable and lets a later
//! process detect and remove a lock left behind by a crashed holder, so the
//! lock is time-bounded in practice rather than held forever.
//!
//! Acquisition retries with bounded exponential backoff and fails with
//! [`ConvergenceError::LockTimeout`] once the attempt budget is exhausted.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::LockConfig;
use crate::error::{ConvergenceError, Result};

/// Metadata written into the lock file for diagnostics and stale detection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockMetadata {
    pub pid: u32,
    pub host: String,
    pub started_at: DateTime<Utc>,
}

impl LockMetadata {
    fn current() -> Self {
        Self {
            pid: std::process::id(),
            host: hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "unknown".to_string()),
            started_at: Utc::now(),
        }
    }

    /// Best-effort staleness check: only reliable on the same host.
    fn is_stale(&self) -> bool {
        let current_host = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_default();
        if self.host != current_host {
            return false;
        }
        !is_process_running(self.pid)
    }
}

#[cfg(unix)]
fn is_process_running(pid: u32) -> bool {
    // kill(pid, 0) probes for existence without signalling.
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

#[cfg(not(unix))]
fn is_process_running(_pid: u32) -> bool {
    true
}

/// A held exclusive lock on the log file. Released on drop.
///
/// Functions that require the store lock take `&StoreLock` as a witness, so
/// the type system keeps the read-check-write sequence under one guard.
#[derive(Debug)]
pub struct StoreLock {
    file: File,
    path: PathBuf,
}

impl StoreLock {
    /// Acquire the lock for `data_path`, retrying per `config`.
    pub fn acquire(data_path: &Path, config: &LockConfig) -> Result<Self> {
        let lock_path = lock_path_for(data_path);
        // The sidecar may be the first file ever created under the data
        // directory; `create_new` does not create parents.
        if let Some(parent) = lock_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConvergenceError::io(parent, e))?;
        }
        let mut backoff_ms = config.initial_backoff_ms;

        for attempt in 0..config.max_attempts {
            match Self::try_acquire(&lock_path)? {
                Some(lock) => return Ok(lock),
                None => {
                    if attempt + 1 == config.max_attempts {
                        break;
                    }
                    // Jitter desynchronizes contenders that woke together.
                    let jitter = rand::rng().random_range(0..=backoff_ms / 2);
                    tracing::debug!(
                        path = %lock_path.display(),
                        attempt,
                        backoff_ms,
                        jitter,
                        "log store lock held elsewhere, backing off"
                    );
                    std::thread::sleep(std::time::Duration::from_millis(backoff_ms + jitter));
                    backoff_ms = (backoff_ms * 2).min(config.max_backoff_ms);
                }
            }
        }

        Err(ConvergenceError::LockTimeout {
            path: lock_path,
            attempts: config.max_attempts,
        })
    }

    /// One acquisition attempt. `Ok(None)` means a live holder exists.
    fn try_acquire(lock_path: &Path) -> Result<Option<Self>> {
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(lock_path)
        {
            Ok(mut file) => {
                if let Err(e) = file.try_lock_exclusive() {
                    let _ = std::fs::remove_file(lock_path);
                    return Err(ConvergenceError::io(lock_path, e));
                }

                let metadata = LockMetadata::current();
                let json = serde_json::to_string(&metadata)?;
                file.write_all(json.as_bytes())
                    .and_then(|_| file.sync_all())
                    .map_err(|e| ConvergenceError::io(lock_path, e))?;

                Ok(Some(StoreLock {
                    file,
                    path: lock_path.to_path_buf(),
                }))
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                if let Some(existing) = read_metadata(lock_path)
                    && existing.is_stale()
                {
                    tracing::warn!(
                        pid = existing.pid,
                        host = %existing.host,
                        "removing stale lock from terminated process"
                    );
                    let _ = std::fs::remove_file(lock_path);
                    return Self::try_acquire(lock_path);
                }
                Ok(None)
            }
            Err(e) => Err(ConvergenceError::io(lock_path, e)),
        }
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Sidecar lock path: `<data_path>.lock`.
pub fn lock_path_for(data_path: &Path) -> PathBuf {
    let mut path = data_path.as_os_str().to_owned();
    path.push(".lock");
    PathBuf::from(path)
}

fn read_metadata(lock_path: &Path) -> Option<LockMetadata> {
    let raw = std::fs::read_to_string(lock_path).ok()?;
    serde_json::from_str(&raw).ok()
}
