//! Exclusive run lock.
//!
//! `<state dir>/lock` guards the version file and the checkpoint. It is
//! created with `create_new`, so of two racing runs exactly one wins; the
//! loser reads the holder's metadata and reports it.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, RolloutError};
use crate::state;

pub const LOCK_FILE: &str = "lock";

/// Holder metadata kept inside the lock file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: u32,
    pub hostname: String,
    pub acquired_at: DateTime<Utc>,
    /// Set once the holder has built its plan.
    pub plan_id: Option<String>,
}

impl LockInfo {
    fn for_this_process() -> Self {
        Self {
            pid: std::process::id(),
            hostname: gethostname::gethostname().to_string_lossy().into_owned(),
            acquired_at: Utc::now(),
            plan_id: None,
        }
    }

    fn into_error(self) -> RolloutError {
        RolloutError::AlreadyRunning {
            pid: self.pid,
            hostname: self.hostname,
            since: self.acquired_at.to_rfc3339(),
        }
    }

    fn age(&self) -> Option<Duration> {
        (Utc::now() - self.acquired_at).to_std().ok()
    }
}

/// A held lock. Dropping it removes the file.
#[derive(Debug)]
pub struct LockFile {
    path: PathBuf,
    held: bool,
}

impl LockFile {
    /// Take the lock, or fail with `AlreadyRunning` naming the holder.
    pub fn acquire(state_dir: &Path) -> Result<Self> {
        fs::create_dir_all(state_dir)
            .with_context(|| format!("cannot create state dir {}", state_dir.display()))?;

        let path = lock_path(state_dir);
        let body = serde_json::to_vec_pretty(&LockInfo::for_this_process())
            .context("cannot encode lock metadata")?;

        let created = OpenOptions::new().write(true).create_new(true).open(&path);
        let mut file = match created {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                // The holder may not have written its metadata yet.
                return Err(match read_info(&path) {
                    Ok(holder) => holder.into_error(),
                    Err(_) => unknown_holder(),
                });
            }
            Err(e) => {
                return Err(anyhow::Error::new(e)
                    .context(format!("cannot create {}", path.display()))
                    .into());
            }
        };

        if let Err(e) = file.write_all(&body).and_then(|()| file.sync_all()) {
            let _ = fs::remove_file(&path);
            return Err(anyhow::Error::new(e)
                .context(format!("cannot write {}", path.display()))
                .into());
        }

        Ok(Self { path, held: true })
    }

    /// Like [`LockFile::acquire`], but first reclaims a lock older than
    /// `stale_after`. Age comes from the holder's `acquired_at`, or from the
    /// file's mtime while its metadata is unreadable (a holder that has
    /// created the file but not yet written it).
    pub fn acquire_with_timeout(state_dir: &Path, stale_after: Duration) -> Result<Self> {
        let path = lock_path(state_dir);
        if let Some(seen) = Snapshot::read(&path)? {
            if !seen.is_stale(stale_after) {
                return Err(seen.into_error());
            }
            reclaim(&path, &seen)?;
        }
        Self::acquire(state_dir)
    }

    pub fn release(&mut self) -> Result<()> {
        if self.held && self.path.exists() {
            fs::remove_file(&self.path)
                .with_context(|| format!("cannot remove {}", self.path.display()))?;
        }
        self.held = false;
        Ok(())
    }

    /// Record the plan this run is executing.
    pub fn set_plan_id(&self, plan_id: &str) -> Result<()> {
        let mut info = read_info(&self.path)?;
        info.plan_id = Some(plan_id.to_string());
        state::atomic_write_json(&self.path, &info)?;
        Ok(())
    }

    pub fn is_locked(state_dir: &Path) -> bool {
        lock_path(state_dir).exists()
    }

    pub fn read_lock_info(state_dir: &Path) -> Result<LockInfo> {
        Ok(read_info(&lock_path(state_dir))?)
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

fn unknown_holder() -> RolloutError {
    RolloutError::AlreadyRunning {
        pid: 0,
        hostname: "unknown".to_string(),
        since: "unknown".to_string(),
    }
}

/// Lock file contents and mtime as seen at one moment.
#[derive(Debug, PartialEq, Eq)]
struct Snapshot {
    bytes: Vec<u8>,
    modified: Option<SystemTime>,
}

impl Snapshot {
    fn read(path: &Path) -> Result<Option<Self>> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(anyhow::Error::new(e)
                    .context(format!("cannot read {}", path.display()))
                    .into());
            }
        };
        let modified = fs::metadata(path).and_then(|m| m.modified()).ok();
        Ok(Some(Self { bytes, modified }))
    }

    fn info(&self) -> Option<LockInfo> {
        serde_json::from_slice(&self.bytes).ok()
    }

    fn is_stale(&self, stale_after: Duration) -> bool {
        let age = match self.info() {
            Some(holder) => holder.age(),
            None => self.modified.and_then(|m| m.elapsed().ok()),
        };
        age.is_some_and(|age| age > stale_after)
    }

    fn into_error(self) -> RolloutError {
        self.info().map_or_else(unknown_holder, LockInfo::into_error)
    }
}

/// Move the stale lock `seen` out of the way.
///
/// The file is renamed to a private tombstone first, so a contender that
/// replaced it after `seen` was read is never deleted: its lock is linked
/// back and the contender is reported as the holder.
fn reclaim(path: &Path, seen: &Snapshot) -> Result<()> {
    let tombstone = path.with_file_name(format!(
        "{LOCK_FILE}.stale-{}-{}",
        std::process::id(),
        Utc::now().timestamp_nanos_opt().unwrap_or_default()
    ));
    match fs::rename(path, &tombstone) {
        Ok(()) => {}
        // Another contender reclaimed it first.
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => {
            return Err(anyhow::Error::new(e)
                .context(format!("cannot move stale {}", path.display()))
                .into());
        }
    }

    let taken = Snapshot::read(&tombstone)?;
    if taken.as_ref() == Some(seen) {
        fs::remove_file(&tombstone)
            .with_context(|| format!("cannot remove {}", tombstone.display()))?;
        return Ok(());
    }

    // Fails only if yet another run holds the lock now, which is reported the same way.
    let _ = fs::hard_link(&tombstone, path);
    let _ = fs::remove_file(&tombstone);
    Err(taken.map_or_else(unknown_holder, Snapshot::into_error))
}

fn read_info(path: &Path) -> anyhow::Result<LockInfo> {
    let raw = fs::read_to_string(path).with_context(|| format!("cannot read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("invalid lock metadata in {}", path.display()))
}

pub fn lock_path(state_dir: &Path) -> PathBuf {
    state_dir.join(LOCK_FILE)
}
