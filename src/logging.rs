//! Per-iteration structured logs.
//!
//! One append-only file per iteration, named `<iteration>-<startedAt>.log`,
//! holding JSON lines tagged `iteration_start`, `agent_stdout`,
//! `conflict_*`, `task_closed`, `iteration_end`. Every record is also teed
//! onto the in-process event bus for the UI collaborator; file I/O never
//! blocks on subscribers.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::events::{EventBus, OrchestratorEvent};

/// The rich closing record of an iteration, beyond the bus-visible event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterationSummary {
    pub iteration: u32,
    pub task_ids: Vec<String>,
    /// sha256 of the prompt bytes.
    pub prompt_sha256: String,
    pub prompt_bytes: usize,
    pub model: Option<String>,
    pub model_source: String,
    /// The command line that ran (environment already redacted upstream).
    pub command_line: Vec<String>,
    pub env_summary: String,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    pub sentinel_found: bool,
    pub success: bool,
    pub retries: u32,
    pub commit: Option<String>,
}

pub struct IterationLogger {
    file: File,
    path: PathBuf,
    bus: EventBus,
    iteration: u32,
}

impl IterationLogger {
    /// Open the log file for one iteration and write the opening record.
    pub fn start(
        iterations_dir: &Path,
        iteration: u32,
        task_ids: Vec<String>,
        bus: EventBus,
    ) -> Result<Self> {
        std::fs::create_dir_all(iterations_dir)
            .with_context(|| format!("cannot create {}", iterations_dir.display()))?;
        let started_at = Utc::now();
        let path = iterations_dir.join(format!(
            "{}-{}.log",
            iteration,
            started_at.format("%Y-%m-%dT%H-%M-%S")
        ));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("cannot open iteration log {}", path.display()))?;

        let mut logger = Self {
            file,
            path,
            bus,
            iteration,
        };
        logger.record(&OrchestratorEvent::IterationStart {
            iteration,
            task_ids,
            started_at,
        })?;
        Ok(logger)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_line(&mut self, value: &serde_json::Value) -> Result<()> {
        let mut line = serde_json::to_string(value)?;
        line.push('\n');
        self.file
            .write_all(line.as_bytes())
            .with_context(|| format!("cannot append to {}", self.path.display()))?;
        Ok(())
    }

    /// Append an event record and tee it to the bus.
    pub fn record(&mut self, event: &OrchestratorEvent) -> Result<()> {
        let mut value = serde_json::to_value(event)?;
        if let Some(map) = value.as_object_mut() {
            map.insert("ts".into(), json!(Utc::now()));
        }
        self.write_line(&value)?;
        self.bus.emit(event.clone());
        Ok(())
    }

    /// Convenience wrapper for streamed stdout.
    pub fn stdout_chunk(&mut self, chunk: &str) -> Result<()> {
        self.record(&OrchestratorEvent::AgentStdout {
            iteration: self.iteration,
            chunk: chunk.to_string(),
        })
    }

    /// Write the closing record with the full iteration bookkeeping, plus
    /// the compact `iteration_end` bus event.
    pub fn end(&mut self, summary: &IterationSummary) -> Result<()> {
        let mut value = serde_json::to_value(summary)?;
        if let Some(map) = value.as_object_mut() {
            map.insert("type".into(), json!("iteration_end"));
            map.insert("ts".into(), json!(Utc::now()));
        }
        self.write_line(&value)?;
        self.bus.emit(OrchestratorEvent::IterationEnd {
            iteration: summary.iteration,
            success: summary.success,
            exit_code: summary.exit_code,
            duration_ms: summary.duration_ms,
        });
        Ok(())
    }
}

/// sha256 hex digest of prompt bytes, recorded instead of the prompt
/// itself.
pub fn prompt_digest(prompt: &str) -> String {
    use sha2::{Digest, Sha256};
    format!("{:x}", Sha256::digest(prompt.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn summary(iteration: u32) -> IterationSummary {
        IterationSummary {
            iteration,
            task_ids: vec!["TEST-001".into()],
            prompt_sha256: prompt_digest("prompt"),
            prompt_bytes: 6,
            model: Some("claude-opus-4".into()),
            model_source: "task".into(),
            command_line: vec!["claude".into(), "--print".into()],
            env_summary: "env: 10 passed, 1 blocked".into(),
            exit_code: Some(0),
            duration_ms: 1200,
            sentinel_found: true,
            success: true,
            retries: 0,
            commit: Some("abc123".into()),
        }
    }

    #[test]
    fn log_file_is_named_by_iteration_and_start_time() {
        let dir = tempdir().unwrap();
        let logger =
            IterationLogger::start(dir.path(), 3, vec!["T-1".into()], EventBus::new()).unwrap();
        let name = logger.path().file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("3-"));
        assert!(name.ends_with(".log"));
    }

    #[test]
    fn records_are_json_lines_with_type_tags() {
        let dir = tempdir().unwrap();
        let mut logger =
            IterationLogger::start(dir.path(), 1, vec!["T-1".into()], EventBus::new()).unwrap();
        logger.stdout_chunk("working...").unwrap();
        logger
            .record(&OrchestratorEvent::TaskClosed {
                task_id: "T-1".into(),
                reason: "done".into(),
            })
            .unwrap();
        logger.end(&summary(1)).unwrap();

        let content = std::fs::read_to_string(logger.path()).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 4);
        for line in &lines {
            let value: serde_json::Value = serde_json::from_str(line).unwrap();
            assert!(value.get("type").is_some());
            assert!(value.get("ts").is_some());
        }
        assert!(lines[0].contains("iteration_start"));
        assert!(lines[1].contains("agent_stdout"));
        assert!(lines[2].contains("task_closed"));
        assert!(lines[3].contains("iteration_end"));
        assert!(lines[3].contains("prompt_sha256"));
    }

    #[tokio::test]
    async fn records_tee_to_the_bus() {
        let dir = tempdir().unwrap();
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let mut logger =
            IterationLogger::start(dir.path(), 2, vec![], bus.clone()).unwrap();
        logger.stdout_chunk("hello").unwrap();

        // start + chunk
        assert!(matches!(
            rx.recv().await.unwrap(),
            OrchestratorEvent::IterationStart { iteration: 2, .. }
        ));
        match rx.recv().await.unwrap() {
            OrchestratorEvent::AgentStdout { chunk, .. } => assert_eq!(chunk, "hello"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn prompt_digest_is_stable() {
        assert_eq!(prompt_digest("abc"), prompt_digest("abc"));
        assert_ne!(prompt_digest("abc"), prompt_digest("abd"));
        assert_eq!(prompt_digest("abc").len(), 64);
    }
}
