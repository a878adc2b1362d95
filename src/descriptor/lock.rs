//! Sentinel lock-file protocol for descriptor aggregation.
//!
//! Independent device computers merge their stubs into one shared
//! descriptor file; mutual exclusion across processes (and hosts sharing a
//! filesystem) is provided by a sidecar `<target>.lock` file carrying
//! acquisition metadata. A lock older than the configured staleness window
//! is reclaimed as abandoned; a fresh lock that outlives the bounded retry
//! loop is an acquisition timeout.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::LockConfig;
use crate::{rlog, rlog_debug, Error, Result};

/// Metadata written into the lock file to ease debugging a stuck writer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockMetadata {
    pub acquired_at: DateTime<Utc>,
    pub pid: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
}

impl LockMetadata {
    fn now(owner: Option<&str>) -> Self {
        Self {
            acquired_at: Utc::now(),
            pid: std::process::id(),
            owner: owner.map(str::to_string),
        }
    }
}

/// A held aggregation lock. Released explicitly or on drop.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    released: bool,
}

impl LockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Delete the lock file. Idempotent.
    pub fn release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

/// Acquire the aggregation lock for `target`.
///
/// Blocks in a time-bounded retry loop while a fresh lock is held by
/// another writer. A lock whose own timestamp (file mtime as fallback) is
/// older than `config.staleness()` is assumed abandoned by a crashed
/// writer and reclaimed; this is informational, not an error.
pub fn acquire(target: &Path, config: &LockConfig, owner: Option<&str>) -> Result<LockGuard> {
    let lock_path = lock_path(target);
    let mut attempts: u32 = 0;
    loop {
        match lock_age(&lock_path) {
            None => {}
            Some(age) if age >= config.staleness() => {
                rlog!(
                    "stale lock recovered (age {:?}), deleting {}",
                    age,
                    lock_path.display()
                );
                let _ = fs::remove_file(&lock_path);
            }
            Some(_) => {
                if attempts >= config.max_retries {
                    return Err(Error::LockTimeout(lock_path, attempts));
                }
                rlog!(
                    "lock found, waiting {:?} for {}",
                    config.retry_interval(),
                    lock_path.display()
                );
                std::thread::sleep(config.retry_interval());
                attempts += 1;
                continue;
            }
        }

        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent)?;
        }
        // create_new makes acquisition atomic: a concurrent writer that
        // slipped in since the age check shows up as AlreadyExists and we
        // fall back into the wait loop.
        let meta = LockMetadata::now(owner);
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_path)
        {
            Ok(mut file) => {
                file.write_all(serde_yaml::to_string(&meta)?.as_bytes())?;
                rlog_debug!("lock acquired at {}", lock_path.display());
                return Ok(LockGuard {
                    path: lock_path,
                    released: false,
                });
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

/// Path of the sentinel lock for a descriptor file.
pub fn lock_path(target: &Path) -> PathBuf {
    target.with_extension("lock")
}

/// Age of an existing lock, judged by its own metadata timestamp with a
/// file-mtime fallback for unparseable contents. `None` if absent.
fn lock_age(lock_path: &Path) -> Option<std::time::Duration> {
    let contents = fs::read_to_string(lock_path).ok()?;
    if let Ok(meta) = serde_yaml::from_str::<LockMetadata>(&contents) {
        let age = Utc::now().signed_duration_since(meta.acquired_at);
        return Some(age.to_std().unwrap_or_default());
    }
    let mtime = fs::metadata(lock_path).ok()?.modified().ok()?;
    Some(mtime.elapsed().unwrap_or_default())
}
