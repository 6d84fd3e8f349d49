//! Model resolution.
//!
//! Precedence: per-task hint, then CLI/session `--model`, then the agent
//! default (no flag injected). An invalid model at any level warns and
//! falls through; a task never fails on model validation alone.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::agent::AgentAdapter;
use crate::tracker::Task;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelSource {
    Task,
    Cli,
    AgentDefault,
}

impl ModelSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelSource::Task => "task",
            ModelSource::Cli => "cli",
            ModelSource::AgentDefault => "agent_default",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedModel {
    /// `None` means no `--model` flag is injected.
    pub model: Option<String>,
    pub source: ModelSource,
}

/// Resolve the model for one task.
pub fn resolve_model(
    agent: &dyn AgentAdapter,
    task: &Task,
    cli_model: Option<&str>,
) -> ResolvedModel {
    if let Some(requested) = task.model.as_deref() {
        match agent.validate_model(requested) {
            Ok(()) => {
                return ResolvedModel {
                    model: Some(requested.to_string()),
                    source: ModelSource::Task,
                }
            }
            Err(reason) => warn!(
                task = %task.title,
                model = requested,
                %reason,
                "task-level model rejected; falling back"
            ),
        }
    }

    if let Some(requested) = cli_model {
        match agent.validate_model(requested) {
            Ok(()) => {
                return ResolvedModel {
                    model: Some(requested.to_string()),
                    source: ModelSource::Cli,
                }
            }
            Err(reason) => warn!(
                task = %task.title,
                model = requested,
                %reason,
                "session-level model rejected; using agent default"
            ),
        }
    }

    ResolvedModel {
        model: None,
        source: ModelSource::AgentDefault,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{ClaudeAdapter, CustomAdapter};

    fn task_with_model(model: Option<&str>) -> Task {
        let mut t = Task::new("T-1", "a task");
        t.model = model.map(String::from);
        t
    }

    #[test]
    fn task_model_wins_when_valid() {
        let agent = ClaudeAdapter::new(None);
        let resolved = resolve_model(
            &agent,
            &task_with_model(Some("claude-opus-4")),
            Some("claude-sonnet-4"),
        );
        assert_eq!(resolved.model.as_deref(), Some("claude-opus-4"));
        assert_eq!(resolved.source, ModelSource::Task);
    }

    #[test]
    fn invalid_task_model_falls_back_to_cli() {
        let agent = ClaudeAdapter::new(None);
        let resolved = resolve_model(
            &agent,
            &task_with_model(Some("gpt-4o")),
            Some("claude-sonnet-4"),
        );
        assert_eq!(resolved.model.as_deref(), Some("claude-sonnet-4"));
        assert_eq!(resolved.source, ModelSource::Cli);
    }

    #[test]
    fn invalid_everything_falls_back_to_agent_default() {
        let agent = ClaudeAdapter::new(None);
        let resolved = resolve_model(&agent, &task_with_model(Some("bad model")), Some(""));
        assert!(resolved.model.is_none());
        assert_eq!(resolved.source, ModelSource::AgentDefault);
    }

    #[test]
    fn no_hints_means_agent_default() {
        let agent = ClaudeAdapter::new(None);
        let resolved = resolve_model(&agent, &task_with_model(None), None);
        assert!(resolved.model.is_none());
        assert_eq!(resolved.source, ModelSource::AgentDefault);
    }

    #[test]
    fn custom_agent_rejects_all_levels() {
        let agent = CustomAdapter::new("my-agent");
        let resolved = resolve_model(
            &agent,
            &task_with_model(Some("claude-opus-4")),
            Some("claude-sonnet-4"),
        );
        assert!(resolved.model.is_none());
        assert_eq!(resolved.source, ModelSource::AgentDefault);
    }
}
