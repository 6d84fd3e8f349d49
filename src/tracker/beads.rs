//! Bead-based trackers.
//!
//! All three variants share one adapter that shells out to the variant's
//! CLI (`bd`, `br`, `bv`) with `--json` and parses the bead records. The
//! per-task model hint is read from `metadata.model` when it is a string;
//! any other shape is ignored.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::debug;

use super::ordering::apply_dotted_child_order;
use super::{default_priority, Task, TaskStatus, TrackerAdapter};
use crate::errors::RalphError;

/// Per-CLI-call timeout.
const BEADS_TIMEOUT: Duration = Duration::from_secs(30);

/// The three concrete bead CLIs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeadsVariant {
    Beads,
    BeadsRust,
    BeadsBv,
}

impl BeadsVariant {
    /// Executable name for this variant.
    pub fn binary(&self) -> &'static str {
        match self {
            BeadsVariant::Beads => "bd",
            BeadsVariant::BeadsRust => "br",
            BeadsVariant::BeadsBv => "bv",
        }
    }

    pub fn plugin_id(&self) -> &'static str {
        match self {
            BeadsVariant::Beads => "beads",
            BeadsVariant::BeadsRust => "beads-rust",
            BeadsVariant::BeadsBv => "beads-bv",
        }
    }
}

pub struct BeadsTracker {
    variant: BeadsVariant,
    cwd: PathBuf,
    epic_id: Option<String>,
    write_lock: Mutex<()>,
}

impl BeadsTracker {
    pub fn new(variant: BeadsVariant, cwd: PathBuf, epic_id: Option<String>) -> Self {
        Self {
            variant,
            cwd,
            epic_id,
            write_lock: Mutex::new(()),
        }
    }

    pub fn variant(&self) -> BeadsVariant {
        self.variant
    }

    async fn run_cli(&self, args: &[&str]) -> Result<String, RalphError> {
        let binary = self.variant.binary();
        debug!(binary, ?args, "running bead CLI");

        let child = Command::new(binary)
            .args(args)
            .current_dir(&self.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                RalphError::TrackerUnavailable(format!("cannot spawn {}: {}", binary, e))
            })?;

        let output = tokio::time::timeout(BEADS_TIMEOUT, child.wait_with_output())
            .await
            .map_err(|_| {
                RalphError::TrackerUnavailable(format!(
                    "{} {} timed out after {}s",
                    binary,
                    args.join(" "),
                    BEADS_TIMEOUT.as_secs()
                ))
            })?
            .map_err(|e| RalphError::TrackerUnavailable(format!("{} failed: {}", binary, e)))?;

        if !output.status.success() {
            return Err(RalphError::TrackerUnavailable(format!(
                "{} {} exited with {}: {}",
                binary,
                args.join(" "),
                output.status.code().unwrap_or(-1),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Flush in-memory bead state to the JSONL store. Used before tracker
    /// data is copied into a worktree.
    pub async fn sync_flush(&self) -> Result<(), RalphError> {
        let _guard = self.write_lock.lock().await;
        self.run_cli(&["sync", "--flush-only"]).await.map(|_| ())
    }

    fn parse_bead(bead: &Value) -> Option<Task> {
        let id = bead.get("id")?.as_str()?.to_string();
        Some(Task {
            title: bead
                .get("title")
                .and_then(|v| v.as_str())
                .unwrap_or(&id)
                .to_string(),
            description: bead
                .get("description")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            acceptance: bead
                .get("acceptance_criteria")
                .or_else(|| bead.get("acceptance"))
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            status: parse_status(bead.get("status").and_then(|v| v.as_str())),
            priority: bead
                .get("priority")
                .and_then(|v| v.as_i64())
                .unwrap_or_else(default_priority),
            dependencies: parse_dependencies(bead.get("dependencies")),
            labels: bead
                .get("labels")
                .and_then(|v| v.as_array())
                .map(|arr| {
                    arr.iter()
                        .filter_map(|v| v.as_str().map(String::from))
                        .collect()
                })
                .unwrap_or_default(),
            // Only a string-typed metadata.model counts; anything else is
            // ignored.
            model: bead
                .get("metadata")
                .and_then(|m| m.get("model"))
                .and_then(|v| v.as_str())
                .map(String::from),
            parent: bead
                .get("parent")
                .and_then(|v| v.as_str())
                .map(String::from),
            metadata: bead.get("metadata").cloned(),
            id,
        })
    }

    fn parse_listing(&self, raw: &str) -> Result<Vec<Task>, RalphError> {
        let value: Value = serde_json::from_str(raw).map_err(|e| {
            RalphError::TrackerUnavailable(format!(
                "{} produced invalid JSON: {}",
                self.variant.binary(),
                e
            ))
        })?;
        // Either a bare array or an object with an `issues`/`beads` array.
        let beads = value
            .as_array()
            .cloned()
            .or_else(|| {
                value
                    .get("issues")
                    .or_else(|| value.get("beads"))
                    .and_then(|v| v.as_array())
                    .cloned()
            })
            .unwrap_or_default();
        Ok(beads.iter().filter_map(Self::parse_bead).collect())
    }
}

fn parse_status(raw: Option<&str>) -> TaskStatus {
    match raw {
        Some("closed") | Some("done") => TaskStatus::Closed,
        Some("in_progress") => TaskStatus::InProgress,
        Some("blocked") => TaskStatus::Blocked,
        _ => TaskStatus::Open,
    }
}

/// Dependencies arrive as plain id strings or `{id: ...}` objects.
fn parse_dependencies(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| {
                    v.as_str()
                        .map(String::from)
                        .or_else(|| v.get("id").and_then(|id| id.as_str()).map(String::from))
                })
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
impl TrackerAdapter for BeadsTracker {
    fn id(&self) -> &str {
        self.variant.plugin_id()
    }

    async fn list_open_tasks(&self) -> Result<Vec<Task>, RalphError> {
        let mut args = vec!["list", "--json", "--status=open,in_progress"];
        let epic_arg;
        if let Some(epic) = &self.epic_id {
            epic_arg = format!("--epic={}", epic);
            args.push(&epic_arg);
        }
        let raw = self.run_cli(&args).await?;
        let mut tasks: Vec<Task> = self
            .parse_listing(&raw)?
            .into_iter()
            .filter(|t| t.status.is_workable())
            .collect();
        apply_dotted_child_order(&mut tasks);
        Ok(tasks)
    }

    async fn get_task(&self, id: &str) -> Result<Option<Task>, RalphError> {
        let raw = match self.run_cli(&["show", id, "--json"]).await {
            Ok(raw) => raw,
            // `show` on an unknown id exits non-zero; treat as missing.
            Err(RalphError::TrackerUnavailable(msg)) if msg.contains("exited with") => {
                return Ok(None)
            }
            Err(e) => return Err(e),
        };
        let value: Value = serde_json::from_str(&raw).map_err(|e| {
            RalphError::TrackerUnavailable(format!(
                "{} show produced invalid JSON: {}",
                self.variant.binary(),
                e
            ))
        })?;
        Ok(Self::parse_bead(&value))
    }

    async fn close_task(&self, id: &str, reason: &str) -> Result<(), RalphError> {
        let _guard = self.write_lock.lock().await;
        let close_reason = format!("--close_reason={}", reason);
        self.run_cli(&["update", id, "--status=closed", &close_reason])
            .await
            .map(|_| ())
    }

    async fn update_task_status(&self, id: &str, status: TaskStatus) -> Result<(), RalphError> {
        let _guard = self.write_lock.lock().await;
        let status_arg = format!("--status={}", status);
        self.run_cli(&["update", id, &status_arg]).await.map(|_| ())
    }

    fn closure_instruction(&self, task: &Task) -> String {
        format!(
            "Do NOT run `{bin} update` yourself. When the task is done, the orchestrator \
             closes it with `{bin} update {id} --status=closed --close_reason=...` after \
             it sees your completion token.",
            bin = self.variant.binary(),
            id = task.id
        )
    }
}
