//! Typed error taxonomy for the orchestrator.
//!
//! One top-level enum covers the failure kinds that cross subsystem
//! boundaries; everything that stays inside a subsystem travels as
//! `anyhow::Error` and is wrapped at the boundary. The variants map to
//! process exit codes in `RalphError::exit_code`.

use std::path::PathBuf;

use thiserror::Error;

/// Failure kinds surfaced to the session manager and the CLI.
#[derive(Debug, Error)]
pub enum RalphError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Another session ({session_id}) holds the lock in {} (pid {pid})", cwd.display())]
    LockConflict {
        session_id: String,
        pid: u32,
        cwd: PathBuf,
    },

    #[error("Tracker unavailable: {0}")]
    TrackerUnavailable(String),

    #[error("Agent unavailable: {reason}")]
    AgentUnavailable {
        reason: String,
        suggestion: Option<String>,
    },

    #[error("Agent exceeded its {timeout_secs}s timeout")]
    AgentTimeout { timeout_secs: u64 },

    #[error("Merge conflict in {files} file(s); worktree preserved at {}", worktree.display())]
    MergeConflict { files: usize, worktree: PathBuf },

    #[error("Insufficient disk space for worktree: {available_mib} MiB available, {required_mib} MiB required")]
    DiskPressure {
        available_mib: u64,
        required_mib: u64,
    },

    #[error("Session state corrupted: {0}. Run `ralph-tui resume --cleanup` to repair the registry")]
    StateCorrupted(String),

    #[error("Failed to spawn agent process: {0}")]
    SpawnFailed(#[source] std::io::Error),

    #[error("Git operation `{command}` failed (exit {code}): {stderr}")]
    GitFailed {
        command: String,
        code: i32,
        stderr: String,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RalphError {
    /// Map an error to the process exit code contract: 2 for configuration
    /// or state-level failures, 3 for lock conflicts, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        match self {
            RalphError::Config(_) | RalphError::StateCorrupted(_) => 2,
            RalphError::LockConflict { .. } => 3,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_maps_to_exit_2() {
        let err = RalphError::Config("unknown tracker 'xyz'".into());
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn lock_conflict_maps_to_exit_3() {
        let err = RalphError::LockConflict {
            session_id: "abc".into(),
            pid: 1234,
            cwd: PathBuf::from("/work"),
        };
        assert_eq!(err.exit_code(), 3);
        assert!(err.to_string().contains("1234"));
    }

    #[test]
    fn runtime_errors_map_to_exit_1() {
        let err = RalphError::AgentTimeout { timeout_secs: 900 };
        assert_eq!(err.exit_code(), 1);
        let err = RalphError::MergeConflict {
            files: 2,
            worktree: PathBuf::from("/wt"),
        };
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn spawn_failed_preserves_io_kind() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "claude not found");
        let err = RalphError::SpawnFailed(io_err);
        match &err {
            RalphError::SpawnFailed(e) => assert_eq!(e.kind(), std::io::ErrorKind::NotFound),
            _ => panic!("Expected SpawnFailed variant"),
        }
    }

    #[test]
    fn state_corrupted_suggests_cleanup() {
        let err = RalphError::StateCorrupted("registry entry without session file".into());
        assert!(err.to_string().contains("--cleanup"));
    }

    #[test]
    fn converts_from_anyhow() {
        let inner = anyhow::anyhow!("something else");
        let err: RalphError = inner.into();
        assert!(matches!(err, RalphError::Other(_)));
        assert_eq!(err.exit_code(), 1);
    }
}
