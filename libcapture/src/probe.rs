use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Local, NaiveDateTime, Utc};
use log::{debug, info, warn};
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;

pub const LOCK_FILE: &str = "lock";
const LOCK_MAX_AGE_MINUTES: i64 = 30;

/// Tells whether a capture directory is still being written.
pub trait ActivityProbe: Send + Sync {
    fn is_active(&self, dir: &Path) -> bool;
}

/// Probe based on the `lock` file a capture process keeps in its directory.
///
/// The lock content is `<timestamp>;<pid>`. A lock whose pid is gone or
/// whose timestamp is older than 30 minutes is stale: it is removed and the
/// directory counts as inactive.
#[derive(Debug, Clone)]
pub struct LockFileProbe {
    max_age: Duration,
}

impl Default for LockFileProbe {
    fn default() -> Self {
        Self {
            max_age: Duration::minutes(LOCK_MAX_AGE_MINUTES),
        }
    }
}

impl LockFileProbe {
    pub fn new(max_age: Duration) -> Self {
        Self { max_age }
    }

    fn remove_stale(lock_file: &Path) {
        if let Err(e) = fs::remove_file(lock_file) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("Unable to remove stale lock {}: {e}", lock_file.display());
            }
        }
    }
}

impl ActivityProbe for LockFileProbe {
    fn is_active(&self, dir: &Path) -> bool {
        let lock_file = dir.join(LOCK_FILE);
        let content = match fs::read_to_string(&lock_file) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return false,
            Err(e) => {
                warn!("Unable to read lock {}: {e}", lock_file.display());
                return false;
            }
        };

        let content = content.trim();
        if content.is_empty() {
            // The writer created the file but has not filled it yet.
            info!("Lock file empty ({}), treating as active", lock_file.display());
            return true;
        }

        let Some((ts, pid)) = content.split_once(';') else {
            info!("Malformed lock {}, removing it", lock_file.display());
            Self::remove_stale(&lock_file);
            return false;
        };

        let pid = match pid.trim().parse::<i32>() {
            Ok(pid) if pid > 0 => pid,
            _ => {
                info!("Lock with invalid pid {}, removing it", lock_file.display());
                Self::remove_stale(&lock_file);
                return false;
            }
        };
        if !process_alive(pid) {
            info!("Lock by dead process {}, removing it", lock_file.display());
            Self::remove_stale(&lock_file);
            return false;
        }

        match parse_lock_timestamp(ts.trim()) {
            Some(locked_at) if locked_at >= Utc::now() - self.max_age => {
                debug!("Directory {} locked by {pid}", dir.display());
                true
            }
            Some(locked_at) => {
                info!(
                    "Old lock ({}) {}, removing it",
                    locked_at.to_rfc3339(),
                    lock_file.display()
                );
                Self::remove_stale(&lock_file);
                false
            }
            None => {
                info!("Lock with invalid timestamp {}, removing it", lock_file.display());
                Self::remove_stale(&lock_file);
                false
            }
        }
    }
}

/// Lock a builder holds on a capture directory while it derives the artifact.
///
/// Written in the format [`LockFileProbe`] reads, so other instances skip the
/// directory. The file is removed when the guard drops.
#[derive(Debug)]
pub struct BuildLock {
    path: PathBuf,
}

impl BuildLock {
    /// Take the lock, `Ok(None)` if a lock file is already present.
    pub fn acquire(dir: &Path) -> io::Result<Option<Self>> {
        let path = dir.join(LOCK_FILE);
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => return Ok(None),
            Err(e) => return Err(e),
        };
        let lock = BuildLock { path };
        write!(file, "{};{}", Utc::now().to_rfc3339(), std::process::id())?;
        file.sync_all()?;
        Ok(Some(lock))
    }
}

impl Drop for BuildLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("Unable to remove build lock {}: {e}", self.path.display());
            }
        }
    }
}

fn process_alive(pid: i32) -> bool {
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        // The process exists but belongs to another user.
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Accepts RFC 3339 timestamps and naive ISO timestamps in local time.
fn parse_lock_timestamp(ts: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(ts) {
        return Some(dt.with_timezone(&Utc));
    }
    let naive = NaiveDateTime::parse_from_str(ts, "%Y-%m-%dT%H:%M:%S%.f").ok()?;
    naive
        .and_local_timezone(Local)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_lock(dir: &Path, content: &str) {
        fs::write(dir.join(LOCK_FILE), content).unwrap();
    }

    #[test]
    fn test_no_lock_is_inactive() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!LockFileProbe::default().is_active(dir.path()));
    }

    #[test]
    fn test_fresh_lock_by_live_process_is_active() {
        let dir = tempfile::tempdir().unwrap();
        let content = format!("{};{}", Utc::now().to_rfc3339(), std::process::id());
        write_lock(dir.path(), &content);
        assert!(LockFileProbe::default().is_active(dir.path()));
        assert!(dir.path().join(LOCK_FILE).exists());
    }

    #[test]
    fn test_old_lock_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let old = Utc::now() - Duration::hours(2);
        write_lock(dir.path(), &format!("{};{}", old.to_rfc3339(), std::process::id()));
        assert!(!LockFileProbe::default().is_active(dir.path()));
        assert!(!dir.path().join(LOCK_FILE).exists());
    }

    #[test]
    fn test_garbage_lock_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        write_lock(dir.path(), "not a lock");
        assert!(!LockFileProbe::default().is_active(dir.path()));
        assert!(!dir.path().join(LOCK_FILE).exists());
    }

    #[test]
    fn test_empty_lock_is_active() {
        let dir = tempfile::tempdir().unwrap();
        write_lock(dir.path(), "");
        assert!(LockFileProbe::default().is_active(dir.path()));
    }

    #[test]
    fn test_build_lock_is_exclusive_and_seen_by_probe() {
        let dir = tempfile::tempdir().unwrap();
        let lock = BuildLock::acquire(dir.path()).unwrap().unwrap();
        assert!(LockFileProbe::default().is_active(dir.path()));
        assert!(BuildLock::acquire(dir.path()).unwrap().is_none());

        drop(lock);
        assert!(!dir.path().join(LOCK_FILE).exists());
        assert!(!LockFileProbe::default().is_active(dir.path()));
        assert!(BuildLock::acquire(dir.path()).unwrap().is_some());
    }

    #[test]
    fn test_naive_timestamp_is_accepted() {
        let now = Local::now().naive_local().format("%Y-%m-%dT%H:%M:%S%.6f").to_string();
        assert!(parse_lock_timestamp(&now).is_some());
    }
}
