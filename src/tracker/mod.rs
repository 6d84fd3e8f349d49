//! Tracker abstraction -- a uniform view over heterogeneous task sources.
//!
//! Concrete adapters (JSON PRD file, bead-based CLIs) implement
//! [`TrackerAdapter`] and are registered into a [`TrackerRegistry`] indexed
//! by plugin id. The orchestrator only ever holds read-through [`Task`]
//! views and issues status-change commands; the tracker owns the tasks.

pub mod beads;
pub mod json_prd;
pub mod ordering;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::errors::RalphError;
use crate::ralph_config::TrackerOptions;

pub use beads::{BeadsTracker, BeadsVariant};
pub use json_prd::JsonPrdTracker;

/// Lifecycle state of a task as reported by its tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Open,
    InProgress,
    Blocked,
    Closed,
}

impl TaskStatus {
    /// Whether the scheduler may consider this task for selection.
    pub fn is_workable(&self) -> bool {
        matches!(self, TaskStatus::Open | TaskStatus::InProgress)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Open => write!(f, "open"),
            TaskStatus::InProgress => write!(f, "in_progress"),
            TaskStatus::Blocked => write!(f, "blocked"),
            TaskStatus::Closed => write!(f, "closed"),
        }
    }
}

/// A unit of work authored outside the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// Free-form acceptance-criteria text. Never parsed or graded.
    #[serde(default)]
    pub acceptance: String,
    #[serde(default)]
    pub status: TaskStatus,
    /// Lower number = higher urgency.
    #[serde(default = "default_priority")]
    pub priority: i64,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub labels: Vec<String>,
    /// Per-task model hint; overrides CLI `--model`, which overrides the
    /// agent default.
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

pub(crate) fn default_priority() -> i64 {
    1_000
}

impl Task {
    /// Minimal constructor for tests and synthetic tasks.
    pub fn new(id: &str, title: &str) -> Self {
        Self {
            id: id.to_string(),
            title: title.to_string(),
            description: String::new(),
            acceptance: String::new(),
            status: TaskStatus::Open,
            priority: default_priority(),
            dependencies: Vec::new(),
            labels: Vec::new(),
            model: None,
            parent: None,
            metadata: None,
        }
    }
}

/// Adapter interface over one concrete task source.
///
/// Object-safe so adapters can be stored as `Arc<dyn TrackerAdapter>` in a
/// [`TrackerRegistry`]. `close_task` and `update_task_status` are
/// idempotent: repeating them with the same arguments is a no-op.
#[async_trait]
pub trait TrackerAdapter: Send + Sync {
    /// Plugin id ("json", "beads", "beads-rust", "beads-bv").
    fn id(&self) -> &str;

    /// List tasks that are not closed, in the source's deterministic order
    /// (dotted-child ordering already applied).
    async fn list_open_tasks(&self) -> Result<Vec<Task>, RalphError>;

    /// Fetch a single task by id. `Ok(None)` when the id is unknown.
    async fn get_task(&self, id: &str) -> Result<Option<Task>, RalphError>;

    /// Close a task, recording a short reason.
    async fn close_task(&self, id: &str, reason: &str) -> Result<(), RalphError>;

    /// Move a task to a new status.
    async fn update_task_status(&self, id: &str, status: TaskStatus) -> Result<(), RalphError>;

    /// Tracker-specific text telling the agent how closure happens, embedded
    /// into the iteration prompt.
    fn closure_instruction(&self, task: &Task) -> String;
}

/// Named collection of tracker adapters, keyed by plugin id.
#[derive(Default)]
pub struct TrackerRegistry {
    adapters: HashMap<String, Arc<dyn TrackerAdapter>>,
}

impl TrackerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter under its own id, replacing any previous one.
    pub fn register(&mut self, adapter: Arc<dyn TrackerAdapter>) {
        self.adapters.insert(adapter.id().to_string(), adapter);
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn TrackerAdapter>> {
        self.adapters.get(id).cloned()
    }

    pub fn list(&self) -> Vec<&str> {
        self.adapters.keys().map(|s| s.as_str()).collect()
    }
}

impl std::fmt::Debug for TrackerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackerRegistry")
            .field("adapters", &self.adapters.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Build the adapter selected by the session configuration.
pub fn build_tracker(config: &Config) -> Result<Arc<dyn TrackerAdapter>, RalphError> {
    build_tracker_from_options(
        &config.file.tracker,
        &config.file.tracker_options,
        &config.cwd,
    )
}

/// Build an adapter from raw options (used when re-rooting into worktrees).
pub fn build_tracker_from_options(
    tracker_id: &str,
    options: &TrackerOptions,
    cwd: &std::path::Path,
) -> Result<Arc<dyn TrackerAdapter>, RalphError> {
    match tracker_id {
        "json" => {
            let path = options.path.clone().ok_or_else(|| {
                RalphError::Config("json tracker requires trackerOptions.path or --prd".into())
            })?;
            let path = if path.is_absolute() { path } else { cwd.join(path) };
            Ok(Arc::new(JsonPrdTracker::new(path)))
        }
        "beads" => Ok(Arc::new(BeadsTracker::new(
            BeadsVariant::Beads,
            cwd.to_path_buf(),
            options.epic_id.clone(),
        ))),
        "beads-rust" => Ok(Arc::new(BeadsTracker::new(
            BeadsVariant::BeadsRust,
            cwd.to_path_buf(),
            options.epic_id.clone(),
        ))),
        "beads-bv" => Ok(Arc::new(BeadsTracker::new(
            BeadsVariant::BeadsBv,
            cwd.to_path_buf(),
            options.epic_id.clone(),
        ))),
        other => Err(RalphError::Config(format!("unknown tracker '{}'", other))),
    }
}

/// The "tracker cannot find my tasks" heuristic: the tracker reports zero
/// tasks while the session's recorded history shows previously-seen tasks.
/// The caller warns and proceeds with an empty selection; this is never a
/// failure.
pub fn is_task_count_mismatch(engine_task_count: usize, session_known_task_count: usize) -> bool {
    engine_task_count == 0 && session_known_task_count > 0
}
