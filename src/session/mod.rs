//! Session lifecycle and persistence.
//!
//! A session is the sequence of iterations sharing one lock, cwd, and
//! configuration. `session.json` in the working directory is the
//! authoritative state; the user-scope registry mirrors enough of it for
//! cross-directory discovery. The stop reason is recorded exactly once and
//! implies the terminal status; the session file is deleted only when the
//! session completed with every task closed.

pub mod lock;
pub mod registry;

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::Config;
use crate::errors::RalphError;
use crate::worktree::WorktreeHandle;

pub use lock::{pid_alive, read_lock, LockGuard};
pub use registry::{RegistryEntry, ResumeMatch, SessionRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Paused,
    Interrupted,
    Completed,
    Failed,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionStatus::Running => "running",
            SessionStatus::Paused => "paused",
            SessionStatus::Interrupted => "interrupted",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// The single-valued explanation for a session's terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    NoTasks,
    Completed,
    MaxIterations,
    UserQuit,
    UserPause,
    FatalError,
    ExternalSignal,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StopReason::NoTasks => "no_tasks",
            StopReason::Completed => "completed",
            StopReason::MaxIterations => "max_iterations",
            StopReason::UserQuit => "user_quit",
            StopReason::UserPause => "user_pause",
            StopReason::FatalError => "fatal_error",
            StopReason::ExternalSignal => "external_signal",
        };
        write!(f, "{s}")
    }
}

impl StopReason {
    /// The lifecycle status a stop reason implies.
    pub fn implied_status(&self) -> SessionStatus {
        match self {
            StopReason::Completed | StopReason::NoTasks => SessionStatus::Completed,
            StopReason::MaxIterations | StopReason::ExternalSignal => SessionStatus::Interrupted,
            StopReason::UserQuit | StopReason::UserPause => SessionStatus::Paused,
            StopReason::FatalError => SessionStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCounts {
    pub total: u32,
    pub closed: u32,
    pub failed: u32,
}

/// The persisted session state (`.ralph-tui/session.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    pub session_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: SessionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<StopReason>,
    /// Accumulated iteration count across resumes.
    pub iteration: u32,
    pub tasks: TaskCounts,
    pub tracker: String,
    pub agent: String,
    pub config_fingerprint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktree: Option<WorktreeHandle>,
}

impl SessionState {
    pub fn new(config: &Config) -> Self {
        let now = Utc::now();
        Self {
            session_id: Uuid::new_v4(),
            started_at: now,
            updated_at: now,
            status: SessionStatus::Running,
            stop_reason: None,
            iteration: 0,
            tasks: TaskCounts::default(),
            tracker: config.file.tracker.clone(),
            agent: config.file.agent.clone(),
            config_fingerprint: config.fingerprint(),
            worktree: None,
        }
    }

    /// Record the stop reason. It is set exactly once; later calls are
    /// ignored so an outer handler cannot overwrite the first cause.
    pub fn finish(&mut self, reason: StopReason) {
        if self.stop_reason.is_none() {
            self.stop_reason = Some(reason);
            self.status = reason.implied_status();
        }
    }

    /// The deletion rule: completed with every known task closed.
    pub fn is_fully_complete(&self) -> bool {
        self.stop_reason == Some(StopReason::Completed) && self.tasks.closed >= self.tasks.total
    }
}

pub struct SessionManager {
    config: Config,
    registry: SessionRegistry,
}

impl SessionManager {
    pub fn new(config: Config, registry: SessionRegistry) -> Self {
        Self { config, registry }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn session_file(&self) -> &Path {
        &self.config.session_file
    }

    /// Acquire the lock and create a fresh session.
    pub fn start(&self) -> Result<(SessionState, LockGuard), RalphError> {
        let state = SessionState::new(&self.config);
        let guard = LockGuard::acquire(
            &self.config.lock_file,
            &state.session_id.to_string(),
            self.config.force,
        )?;
        self.persist(&state)?;
        Ok((state, guard))
    }

    /// Re-acquire the lock for a persisted session.
    pub fn reacquire(&self, state: &SessionState) -> Result<LockGuard, RalphError> {
        LockGuard::acquire(
            &self.config.lock_file,
            &state.session_id.to_string(),
            self.config.force,
        )
    }

    /// Load `session.json` from the working directory.
    pub fn load(&self) -> Result<Option<SessionState>, RalphError> {
        let path = &self.config.session_file;
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| RalphError::StateCorrupted(format!("cannot read {}: {e}", path.display())))?;
        let state = serde_json::from_str(&content)
            .map_err(|e| RalphError::StateCorrupted(format!("cannot parse {}: {e}", path.display())))?;
        Ok(Some(state))
    }

    /// Persist state atomically and mirror it into the registry.
    pub fn persist(&self, state: &SessionState) -> Result<(), RalphError> {
        let path = &self.config.session_file;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                RalphError::Config(format!("cannot create {}: {e}", parent.display()))
            })?;
        }
        let mut serialized = serde_json::to_string_pretty(state)
            .map_err(|e| RalphError::Config(format!("cannot serialize session: {e}")))?;
        serialized.push('\n');
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serialized)
            .map_err(|e| RalphError::Config(format!("cannot write {}: {e}", tmp.display())))?;
        std::fs::rename(&tmp, path)
            .map_err(|e| RalphError::Config(format!("cannot replace {}: {e}", path.display())))?;

        self.registry.upsert(self.registry_entry(state))?;
        Ok(())
    }

    fn registry_entry(&self, state: &SessionState) -> RegistryEntry {
        RegistryEntry {
            session_id: state.session_id.to_string(),
            cwd: self.config.cwd.clone(),
            status: state.status,
            started_at: state.started_at,
            updated_at: Utc::now(),
            agent: state.agent.clone(),
            tracker: state.tracker.clone(),
            epic_id: self.config.file.tracker_options.epic_id.clone(),
            prd_path: self.config.file.tracker_options.path.clone(),
            sandbox: self.config.file.sandbox.enabled,
        }
    }

    /// Terminal bookkeeping: record the stop reason, persist, and delete
    /// the record only on full completion. Every other terminal reason
    /// keeps the session file for resume.
    pub fn finish(&self, state: &mut SessionState, reason: StopReason) -> Result<(), RalphError> {
        state.finish(reason);
        state.updated_at = Utc::now();
        self.persist(state)?;

        if state.is_fully_complete() {
            let _ = std::fs::remove_file(&self.config.session_file);
            self.registry.remove(&state.session_id.to_string())?;
        }
        Ok(())
    }

    /// Locate the session to resume: explicit id (exact, then unique
    /// prefix) first, then the session recorded for this cwd. Verifies the
    /// session file actually exists for the chosen entry.
    pub fn resume_target(
        &self,
        explicit_id: Option<&str>,
    ) -> Result<RegistryEntry, RalphError> {
        let entry = match explicit_id {
            Some(id) => match self.registry.resolve(id) {
                ResumeMatch::Found(entry) => entry,
                ResumeMatch::Ambiguous(candidates) => {
                    return Err(RalphError::Config(format!(
                        "session id prefix '{}' is ambiguous: {}",
                        id,
                        candidates.join(", ")
                    )))
                }
                ResumeMatch::NotFound => {
                    return Err(RalphError::StateCorrupted(format!(
                        "no session matches '{id}'"
                    )))
                }
            },
            None => self.registry.find_by_cwd(&self.config.cwd).ok_or_else(|| {
                RalphError::StateCorrupted(format!(
                    "no session recorded for {}; start one with `run`",
                    self.config.cwd.display()
                ))
            })?,
        };

        if !entry.cwd.join(".ralph-tui/session.json").exists() {
            return Err(RalphError::StateCorrupted(format!(
                "registry entry {} points at {} but no session file exists there",
                entry.session_id,
                entry.cwd.display()
            )));
        }
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CliOverrides;
    use tempfile::tempdir;

    fn manager(dir: &Path) -> SessionManager {
        let config = Config::new(dir.to_path_buf(), CliOverrides::default()).unwrap();
        let registry = SessionRegistry::with_path(dir.join("registry.json"));
        SessionManager::new(config, registry)
    }

    #[test]
    fn start_persists_state_and_registry() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path());
        let (state, guard) = mgr.start().unwrap();

        assert!(mgr.session_file().exists());
        assert!(mgr.registry().get(&state.session_id.to_string()).is_some());
        let loaded = mgr.load().unwrap().unwrap();
        assert_eq!(loaded.session_id, state.session_id);
        assert_eq!(loaded.status, SessionStatus::Running);
        guard.release();
    }

    #[test]
    fn second_start_conflicts_on_lock() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path());
        let (_state, _guard) = mgr.start().unwrap();
        let err = mgr.start().unwrap_err();
        assert_eq!(err.exit_code(), 3);
    }

    #[test]
    fn stop_reason_is_set_exactly_once() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path());
        let (mut state, _guard) = mgr.start().unwrap();

        state.finish(StopReason::UserPause);
        state.finish(StopReason::Completed);
        assert_eq!(state.stop_reason, Some(StopReason::UserPause));
        assert_eq!(state.status, SessionStatus::Paused);
    }

    #[test]
    fn user_quit_keeps_session_file() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path());
        let (mut state, guard) = mgr.start().unwrap();
        state.tasks = TaskCounts {
            total: 5,
            closed: 1,
            failed: 0,
        };
        mgr.finish(&mut state, StopReason::UserQuit).unwrap();
        guard.release();

        assert!(mgr.session_file().exists());
        let loaded = mgr.load().unwrap().unwrap();
        assert_eq!(loaded.stop_reason, Some(StopReason::UserQuit));
        assert!(mgr.registry().get(&state.session_id.to_string()).is_some());
    }

    #[test]
    fn full_completion_deletes_session_file_and_registry_entry() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path());
        let (mut state, guard) = mgr.start().unwrap();
        state.tasks = TaskCounts {
            total: 3,
            closed: 3,
            failed: 0,
        };
        mgr.finish(&mut state, StopReason::Completed).unwrap();
        guard.release();

        assert!(!mgr.session_file().exists());
        assert!(mgr.registry().get(&state.session_id.to_string()).is_none());
    }

    #[test]
    fn completed_with_open_tasks_keeps_the_record() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path());
        let (mut state, guard) = mgr.start().unwrap();
        state.tasks = TaskCounts {
            total: 3,
            closed: 2,
            failed: 1,
        };
        mgr.finish(&mut state, StopReason::Completed).unwrap();
        guard.release();
        assert!(mgr.session_file().exists());
    }

    #[test]
    fn resume_by_cwd_finds_the_session() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path());
        let (mut state, guard) = mgr.start().unwrap();
        mgr.finish(&mut state, StopReason::UserQuit).unwrap();
        guard.release();

        let entry = mgr.resume_target(None).unwrap();
        assert_eq!(entry.session_id, state.session_id.to_string());
    }

    #[test]
    fn resume_by_prefix_and_ambiguity() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path());
        let (mut state, guard) = mgr.start().unwrap();
        mgr.finish(&mut state, StopReason::UserQuit).unwrap();
        guard.release();

        let id = state.session_id.to_string();
        let entry = mgr.resume_target(Some(&id[..8])).unwrap();
        assert_eq!(entry.session_id, id);

        let err = mgr.resume_target(Some("zzzz")).unwrap_err();
        assert!(matches!(err, RalphError::StateCorrupted(_)));
    }

    #[test]
    fn resume_rejects_registry_entry_without_session_file() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path());
        let (mut state, guard) = mgr.start().unwrap();
        mgr.finish(&mut state, StopReason::UserQuit).unwrap();
        guard.release();

        std::fs::remove_file(mgr.session_file()).unwrap();
        let err = mgr.resume_target(None).unwrap_err();
        assert!(err.to_string().contains("--cleanup") || err.to_string().contains("session file"));
    }

    #[test]
    fn state_round_trips_with_worktree_descriptor() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path());
        let (mut state, guard) = mgr.start().unwrap();
        state.worktree = Some(WorktreeHandle {
            path: dir.path().join("wt"),
            branch: "ralph-session/x".into(),
            mode: crate::worktree::WorktreeMode::Created,
            base_branch: "main".into(),
        });
        mgr.persist(&state).unwrap();
        let loaded = mgr.load().unwrap().unwrap();
        assert_eq!(loaded.worktree.unwrap().branch, "ralph-session/x");
        guard.release();
    }
}
