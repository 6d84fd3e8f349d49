//! The per-cwd session lock.
//!
//! `<cwd>/.ralph-tui/ralph.lock` holds `{sessionId, pid, startedAt}`. A
//! live pid in the lock refuses a second session; a dead pid is stale and
//! silently replaced. The guard removes the file on drop so every exit
//! path (including panics) releases the lock.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::errors::RalphError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockContents {
    pub session_id: String,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
}

/// Scoped ownership of the lock file.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    released: bool,
}

impl LockGuard {
    /// Acquire the lock for a session. `force` overrides a live holder.
    pub fn acquire(path: &Path, session_id: &str, force: bool) -> Result<Self, RalphError> {
        if let Some(existing) = read_lock(path) {
            let alive = pid_alive(existing.pid);
            if alive && !force {
                // lock path is <cwd>/.ralph-tui/ralph.lock
                let cwd = path
                    .parent()
                    .and_then(Path::parent)
                    .map(Path::to_path_buf)
                    .unwrap_or_default();
                return Err(RalphError::LockConflict {
                    session_id: existing.session_id,
                    pid: existing.pid,
                    cwd,
                });
            }
            if alive {
                warn!(pid = existing.pid, "forcibly overriding live lock");
            }
        }

        let contents = LockContents {
            session_id: session_id.to_string(),
            pid: std::process::id(),
            started_at: Utc::now(),
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| RalphError::Config(format!("cannot create {}: {e}", parent.display())))?;
        }
        let serialized = serde_json::to_string_pretty(&contents)
            .map_err(|e| RalphError::Config(format!("cannot serialize lock: {e}")))?;
        std::fs::write(path, serialized)
            .map_err(|e| RalphError::Config(format!("cannot write {}: {e}", path.display())))?;

        Ok(Self {
            path: path.to_path_buf(),
            released: false,
        })
    }

    /// Remove the lock file now instead of at drop.
    pub fn release(mut self) {
        self.remove();
    }

    fn remove(&mut self) {
        if !self.released {
            let _ = std::fs::remove_file(&self.path);
            self.released = true;
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.remove();
    }
}

/// Parse the lock file; unreadable or malformed counts as absent (stale).
pub fn read_lock(path: &Path) -> Option<LockContents> {
    let content = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&content).ok()
}

/// Best-effort liveness probe: procfs where available, `kill -0`
/// otherwise.
pub fn pid_alive(pid: u32) -> bool {
    let proc_path = PathBuf::from(format!("/proc/{pid}"));
    if PathBuf::from("/proc").is_dir() {
        return proc_path.exists();
    }
    std::process::Command::new("kill")
        .args(["-0", &pid.to_string()])
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn acquire_writes_lock_and_drop_removes_it() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(".ralph-tui/ralph.lock");
        {
            let _guard = LockGuard::acquire(&path, "session-1", false).unwrap();
            let contents = read_lock(&path).unwrap();
            assert_eq!(contents.session_id, "session-1");
            assert_eq!(contents.pid, std::process::id());
        }
        assert!(!path.exists());
    }

    #[test]
    fn live_holder_conflicts() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ralph.lock");
        let _guard = LockGuard::acquire(&path, "first", false).unwrap();

        // Our own pid is alive, so a second acquire must conflict.
        let err = LockGuard::acquire(&path, "second", false).unwrap_err();
        match err {
            RalphError::LockConflict { session_id, pid, .. } => {
                assert_eq!(session_id, "first");
                assert_eq!(pid, std::process::id());
            }
            other => panic!("expected LockConflict, got {other}"),
        }
    }

    #[test]
    fn force_overrides_live_holder() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ralph.lock");
        let first = LockGuard::acquire(&path, "first", false).unwrap();
        let second = LockGuard::acquire(&path, "second", true).unwrap();
        assert_eq!(read_lock(&path).unwrap().session_id, "second");
        // Keep both alive until here so the first drop doesn't race.
        drop(first);
        drop(second);
    }

    #[test]
    fn stale_lock_is_replaced() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ralph.lock");
        let stale = LockContents {
            session_id: "ghost".into(),
            // A pid from the far end of the range is almost certainly dead;
            // if it happens to be alive the test environment is hostile.
            pid: u32::MAX - 1,
            started_at: Utc::now(),
        };
        std::fs::write(&path, serde_json::to_string(&stale).unwrap()).unwrap();

        let guard = LockGuard::acquire(&path, "fresh", false).unwrap();
        assert_eq!(read_lock(&path).unwrap().session_id, "fresh");
        guard.release();
        assert!(!path.exists());
    }

    #[test]
    fn malformed_lock_counts_as_stale() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ralph.lock");
        std::fs::write(&path, "not json").unwrap();
        assert!(read_lock(&path).is_none());
        let _guard = LockGuard::acquire(&path, "fresh", false).unwrap();
    }

    #[test]
    fn own_pid_is_alive() {
        assert!(pid_alive(std::process::id()));
    }
}
