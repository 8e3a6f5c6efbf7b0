//! Single-host process lock
//!
//! A JSON lock file in the data directory names the running instance. Only
//! one live record may exist: one refreshed within the stuck threshold.
//! Older or unreadable records are reclaimed by the next starter, so a
//! long-running owner must call [`ProcessLock::refresh`] periodically.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use anyhow::{Context, Result};
use chrono::Utc;
use log::{debug, error, info, warn};

use crate::models::LockRecord;

/// File name of the lock inside the data directory
pub const LOCK_FILE: &str = "sync.lock";

static INSTANCE_SEQ: AtomicU64 = AtomicU64::new(0);

/// Cross-process mutual exclusion for the sync service
///
/// Cloning shares the same ownership, so a clone can be handed to a panic
/// hook or signal handler and released from there.
#[derive(Debug, Clone)]
pub struct ProcessLock {
    inner: Arc<LockInner>,
}

#[derive(Debug)]
struct LockInner {
    path: PathBuf,
    owner_id: String,
    acquired: AtomicBool,
}

enum Existing {
    Missing,
    Record(LockRecord),
    Unreadable(String),
}

impl ProcessLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let owner_id = format!(
            "{}-{}-{}",
            std::process::id(),
            Utc::now().timestamp_millis(),
            INSTANCE_SEQ.fetch_add(1, Ordering::Relaxed)
        );
        Self {
            inner: Arc::new(LockInner {
                path: path.into(),
                owner_id,
                acquired: AtomicBool::new(false),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn owner_id(&self) -> &str {
        &self.inner.owner_id
    }

    /// Whether this instance currently owns the lock
    pub fn is_acquired(&self) -> bool {
        self.inner.acquired.load(Ordering::SeqCst)
    }

    /// Take the lock. Returns `false` if another live instance holds it.
    pub fn acquire(&self) -> Result<bool> {
        if self.is_acquired() {
            return Ok(true);
        }

        let path = self.path();
        let now = Utc::now();
        match read_existing(path)? {
            Existing::Missing => {}
            Existing::Record(record) if !record.is_stale_at(now) => {
                warn!(
                    "Sync lock held by pid {} since {} (last active {})",
                    record.pid,
                    record.acquired_at,
                    record.last_active_at()
                );
                return Ok(false);
            }
            Existing::Record(record) => {
                warn!(
                    "Reclaiming stale sync lock from pid {} (last active {})",
                    record.pid,
                    record.last_active_at()
                );
                remove_if_present(path)?;
            }
            Existing::Unreadable(reason) => {
                warn!("Reclaiming unreadable sync lock: {}", reason);
                remove_if_present(path)?;
            }
        }

        let record = LockRecord::new(self.owner_id(), std::process::id(), now);
        if !create_exclusive(path, &record)? {
            warn!("Lost the race for the sync lock at {}", path.display());
            return Ok(false);
        }

        self.inner.acquired.store(true, Ordering::SeqCst);
        info!("Acquired sync lock at {}", path.display());
        Ok(true)
    }

    /// Mark the lock as alive by rewriting its record with a new timestamp.
    ///
    /// Returns `false` when this instance no longer owns the file (it was
    /// removed or reclaimed); local ownership is dropped in that case.
    pub fn refresh(&self) -> Result<bool> {
        if !self.is_acquired() {
            return Ok(false);
        }

        let path = self.path();
        let lost = match read_existing(path)? {
            Existing::Record(mut record) if record.owner_id == self.inner.owner_id => {
                record.refreshed_at = Some(Utc::now());
                config::save_json_atomic(path, &record)?;
                debug!("Refreshed sync lock");
                return Ok(true);
            }
            Existing::Record(record) => {
                format!("now owned by {} (pid {})", record.owner_id, record.pid)
            }
            Existing::Missing => "lock file was removed".to_string(),
            Existing::Unreadable(reason) => format!("lock file is unreadable: {}", reason),
        };

        error!("Lost the sync lock at {}: {}", path.display(), lost);
        self.inner.acquired.store(false, Ordering::SeqCst);
        Ok(false)
    }

    /// Give the lock up. Idempotent.
    ///
    /// The file is only deleted if it still names this instance.
    pub fn release(&self) -> Result<()> {
        if !self.inner.acquired.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        let path = self.path();
        match read_existing(path)? {
            Existing::Record(record) if record.owner_id == self.inner.owner_id => {
                remove_if_present(path)?;
                info!("Released sync lock");
            }
            Existing::Record(record) => {
                warn!(
                    "Sync lock now owned by {} (pid {}), leaving it",
                    record.owner_id, record.pid
                );
            }
            Existing::Missing => debug!("Sync lock already removed"),
            Existing::Unreadable(reason) => {
                warn!("Not removing unreadable sync lock: {}", reason);
            }
        }
        Ok(())
    }

    /// Take the lock for the lifetime of the returned guard
    pub fn acquire_guard(&self) -> Result<Option<ProcessLockGuard>> {
        if self.acquire()? {
            Ok(Some(ProcessLockGuard { lock: self.clone() }))
        } else {
            Ok(None)
        }
    }

    /// Whether a live lock exists at `path`, owned by anyone
    pub fn is_held(path: &Path) -> bool {
        match read_existing(path) {
            Ok(Existing::Record(record)) => !record.is_stale_at(Utc::now()),
            _ => false,
        }
    }
}

/// Releases the lock when dropped
#[derive(Debug)]
pub struct ProcessLockGuard {
    lock: ProcessLock,
}

impl ProcessLockGuard {
    pub fn lock(&self) -> &ProcessLock {
        &self.lock
    }
}

impl Drop for ProcessLockGuard {
    fn drop(&mut self) {
        if let Err(e) = self.lock.release() {
            error!("Failed to release sync lock: {:#}", e);
        }
    }
}

fn read_existing(path: &Path) -> Result<Existing> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Existing::Missing),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read lock file: {}", path.display()));
        }
    };
    Ok(match serde_json::from_str(&content) {
        Ok(record) => Existing::Record(record),
        Err(e) => Existing::Unreadable(e.to_string()),
    })
}

fn remove_if_present(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != ErrorKind::NotFound => {
            Err(e).with_context(|| format!("Failed to remove lock file: {}", path.display()))
        }
        _ => Ok(()),
    }
}

/// Publish `record` at `path` only if nothing is there yet.
///
/// The record is written in full to a private temp file and hard-linked
/// into place, so the lock file never exists half-written and the link
/// fails if another starter got there first.
fn create_exclusive(path: &Path, record: &LockRecord) -> Result<bool> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }

    let tmp_path = path.with_extension(format!("{}.tmp", record.owner_id));
    let content = serde_json::to_string_pretty(record)?;
    std::fs::write(&tmp_path, content)
        .with_context(|| format!("Failed to write lock file: {}", tmp_path.display()))?;

    let linked = std::fs::hard_link(&tmp_path, path);
    let _ = std::fs::remove_file(&tmp_path);
    match linked {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e).with_context(|| format!("Failed to create lock file: {}", path.display())),
    }
}
