//! Persisted quota record.
//!
//! One JSON document per calendar date holds the shared daily call budget.
//! The record is readable and writable independently of the orchestrator
//! process: stage workers update the same file through their own store
//! handle. All mutation happens under an exclusive advisory lock on a
//! sidecar lock file, and the document is replaced atomically (temp file +
//! rename), so a reader never observes a partial write and concurrent
//! writers never lose an increment.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How many call history entries the record retains. Oldest entries beyond
/// this are dropped on each write.
pub const HISTORY_RETENTION: usize = 200;

/// Errors raised by quota persistence.
#[derive(Debug, Error)]
pub enum QuotaError {
    /// The state could not be durably saved. The in-memory count is kept
    /// and merged into the next successful persist.
    #[error("failed to persist quota state to '{path}': {source}")]
    Persistence {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The persisted record could not be parsed.
    #[error("quota record '{path}' is corrupt: {source}")]
    Corrupt {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    /// The exclusive lock could not be acquired.
    #[error("failed to lock quota record '{path}': {source}")]
    Lock {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The record could not be read.
    #[error("failed to read quota record '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// One recorded billable call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallRecord {
    /// Caller-supplied label (e.g. "generateImage").
    pub label: String,
    pub timestamp: DateTime<Utc>,
}

/// The persisted daily quota state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaState {
    /// Calendar day this counter is scoped to.
    pub date: NaiveDate,
    pub call_count: u32,
    pub limit: u32,
    /// Per-label call counts for the day.
    #[serde(default)]
    pub per_function_counts: BTreeMap<String, u32>,
    /// Bounded recent call history.
    #[serde(default)]
    pub history: Vec<CallRecord>,
}

impl QuotaState {
    /// Creates a fresh zeroed state for `date`.
    pub fn new(date: NaiveDate, limit: u32) -> Self {
        Self {
            date,
            call_count: 0,
            limit,
            per_function_counts: BTreeMap::new(),
            history: Vec::new(),
        }
    }

    /// Remaining budget for the day, floored at zero.
    pub fn remaining(&self) -> u32 {
        self.limit.saturating_sub(self.call_count)
    }

    /// Resets the counters when the stored date is not `today`.
    pub fn roll_to(&mut self, today: NaiveDate) {
        if self.date != today {
            *self = Self::new(today, self.limit);
        }
    }

    /// Records one call under `label` and trims the history.
    pub fn record(&mut self, label: &str, timestamp: DateTime<Utc>) {
        self.call_count += 1;
        *self
            .per_function_counts
            .entry(label.to_string())
            .or_insert(0) += 1;
        self.history.push(CallRecord {
            label: label.to_string(),
            timestamp,
        });
        if self.history.len() > HISTORY_RETENTION {
            let excess = self.history.len() - HISTORY_RETENTION;
            self.history.drain(..excess);
        }
    }
}

/// File-backed store for the quota record.
#[derive(Debug, Clone)]
pub struct QuotaStore {
    path: PathBuf,
}

impl QuotaStore {
    /// Creates a store for the record at `path`. The file and its parent
    /// directory are created lazily on first write.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the persisted record.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the record, applying the date rollover and the configured
    /// limit. A missing file yields a fresh state; nothing is written.
    pub fn load(&self, limit: u32, today: NaiveDate) -> Result<QuotaState, QuotaError> {
        let _lock = self.lock()?;
        self.load_locked(limit, today)
    }

    /// Runs a read-modify-write transaction on the record under the
    /// exclusive lock.
    ///
    /// The mutation `f` is applied to the freshly loaded, date-rolled
    /// state; the result is persisted atomically before the lock is
    /// released. Concurrent callers (in-process or other processes using
    /// the same record) serialize here, so no increment is ever lost.
    pub fn update<F, T>(&self, limit: u32, today: NaiveDate, f: F) -> Result<T, QuotaError>
    where
        F: FnOnce(&mut QuotaState) -> T,
    {
        let _lock = self.lock()?;
        let mut state = self.load_locked(limit, today)?;
        let out = f(&mut state);
        self.persist_locked(&state)?;
        Ok(out)
    }

    /// Like [`QuotaStore::update`], but reports a persistence failure
    /// alongside the mutation result instead of discarding it. Used by the
    /// guard's at-least-once accounting.
    pub fn try_update<F, T>(
        &self,
        limit: u32,
        today: NaiveDate,
        f: F,
    ) -> Result<(T, Result<(), QuotaError>), QuotaError>
    where
        F: FnOnce(&mut QuotaState) -> T,
    {
        let _lock = self.lock()?;
        let mut state = self.load_locked(limit, today)?;
        let out = f(&mut state);
        let persisted = self.persist_locked(&state);
        Ok((out, persisted))
    }

    fn load_locked(&self, limit: u32, today: NaiveDate) -> Result<QuotaState, QuotaError> {
        let mut state = match std::fs::read_to_string(&self.path) {
            Ok(content) => {
                serde_json::from_str(&content).map_err(|source| QuotaError::Corrupt {
                    path: self.path.display().to_string(),
                    source,
                })?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => QuotaState::new(today, limit),
            Err(source) => {
                return Err(QuotaError::Read {
                    path: self.path.display().to_string(),
                    source,
                })
            }
        };
        state.roll_to(today);
        state.limit = limit;
        Ok(state)
    }

    fn persist_locked(&self, state: &QuotaState) -> Result<(), QuotaError> {
        let persist = || -> std::io::Result<()> {
            let dir = self.path.parent().filter(|p| !p.as_os_str().is_empty());
            if let Some(dir) = dir {
                std::fs::create_dir_all(dir)?;
            }
            let dir = dir.unwrap_or_else(|| Path::new("."));

            let json = serde_json::to_string_pretty(state)?;
            let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
            tmp.write_all(json.as_bytes())?;
            tmp.flush()?;
            tmp.persist(&self.path).map_err(|e| e.error)?;
            Ok(())
        };

        persist().map_err(|source| QuotaError::Persistence {
            path: self.path.display().to_string(),
            source,
        })
    }

    /// Acquires the exclusive advisory lock on the sidecar lock file.
    /// Released when the returned handle drops.
    fn lock(&self) -> Result<LockGuard, QuotaError> {
        let lock_path = self.path.with_extension("lock");
        if let Some(dir) = lock_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(|source| QuotaError::Lock {
                path: lock_path.display().to_string(),
                source,
            })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(|source| QuotaError::Lock {
                path: lock_path.display().to_string(),
                source,
            })?;
        file.lock_exclusive().map_err(|source| QuotaError::Lock {
            path: lock_path.display().to_string(),
            source,
        })?;
        Ok(LockGuard { file })
    }
}

struct LockGuard {
    file: File,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}
