//! Merge-conflict resolution.
//!
//! Two tiers: a deterministic fast path (one side whitespace-only, or both
//! sides identical) and an agent-backed path that asks the session's agent
//! for the resolved file content. Anything the agent cannot resolve leaves
//! the worktree preserved for manual resolution.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::agent::{run_agent, AgentAdapter, EnvPolicy, InvocationRequest, InvocationStatus};
use crate::errors::RalphError;
use crate::events::{EventBus, OrchestratorEvent};
use crate::ralph_config::ConflictResolutionConfig;
use crate::worktree::WorktreeManager;

/// Confidence recorded for an accepted agent resolution. Fast-path
/// resolutions record 1.0.
const AGENT_CONFIDENCE: f64 = 0.9;

/// One 3-way merge record.
#[derive(Debug, Clone)]
pub struct FileConflict {
    /// Path relative to the merge root.
    pub path: String,
    /// Base version; `None` when the file did not exist on the merge base.
    pub base: Option<String>,
    /// Destination-branch version.
    pub ours: String,
    /// Source-branch version.
    pub theirs: String,
    /// The conflict-markered content currently on disk.
    pub raw: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionStrategy {
    FastPath,
    Agent,
}

impl ResolutionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionStrategy::FastPath => "fast-path",
            ResolutionStrategy::Agent => "agent",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Resolution {
    pub content: String,
    pub strategy: ResolutionStrategy,
    pub confidence: f64,
}

/// Deterministic resolution without an agent: a whitespace-only side loses
/// to the other, byte-identical sides collapse to one.
pub fn fast_path(conflict: &FileConflict) -> Option<Resolution> {
    let resolved = if conflict.ours == conflict.theirs {
        Some(conflict.ours.clone())
    } else if conflict.ours.trim().is_empty() {
        Some(conflict.theirs.clone())
    } else if conflict.theirs.trim().is_empty() {
        Some(conflict.ours.clone())
    } else {
        None
    };
    resolved.map(|content| Resolution {
        content,
        strategy: ResolutionStrategy::FastPath,
        confidence: 1.0,
    })
}

/// Prompt instructing the agent to emit only the resolved file content.
pub fn build_resolution_prompt(
    conflict: &FileConflict,
    task_id: Option<&str>,
    task_title: Option<&str>,
) -> String {
    let context = match (task_id, task_title) {
        (Some(id), Some(title)) => format!("This merge is part of task {id}: {title}.\n"),
        (Some(id), None) => format!("This merge is part of task {id}.\n"),
        _ => String::new(),
    };
    let base_block = conflict
        .base
        .as_deref()
        .unwrap_or("(file did not exist)");

    format!(
        "Resolve a git merge conflict in the file `{path}`.\n\
         {context}\
         \n\
         === BASE (common ancestor) ===\n\
         {base}\n\
         === OURS (destination branch) ===\n\
         {ours}\n\
         === THEIRS (source branch) ===\n\
         {theirs}\n\
         === END ===\n\
         \n\
         Combine both sides so no intended change is lost.\n\
         Output ONLY the complete resolved file content. No code fences, no\n\
         commentary, no conflict markers.",
        path = conflict.path,
        context = context,
        base = base_block,
        ours = conflict.ours,
        theirs = conflict.theirs,
    )
}

/// Strip a single outer triple-backtick fence, with optional language tag.
pub fn strip_code_fence(output: &str) -> String {
    let trimmed = output.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return output.to_string();
    };
    let Some(body) = rest.strip_suffix("```") else {
        return output.to_string();
    };
    // Drop the language tag line, if any.
    match body.split_once('\n') {
        Some((_tag, content)) => content.to_string(),
        None => String::new(),
    }
}

pub struct ConflictResolver {
    agent: Arc<dyn AgentAdapter>,
    worktree: WorktreeManager,
    config: ConflictResolutionConfig,
    env_policy: Arc<EnvPolicy>,
    bus: EventBus,
}

impl ConflictResolver {
    pub fn new(
        agent: Arc<dyn AgentAdapter>,
        worktree: WorktreeManager,
        config: ConflictResolutionConfig,
        env_policy: Arc<EnvPolicy>,
        bus: EventBus,
    ) -> Self {
        Self {
            agent,
            worktree,
            config,
            env_policy,
            bus,
        }
    }

    /// Capture base/ours/theirs for every conflicted path of an in-progress
    /// merge at `dir`.
    pub async fn collect_conflicts(&self, dir: &Path) -> Result<Vec<FileConflict>, RalphError> {
        let files = self.worktree.conflicted_files(dir).await?;
        let mut conflicts = Vec::with_capacity(files.len());
        for path in files {
            let base = self.worktree.show_index_stage(dir, 1, &path).await?;
            let ours = self
                .worktree
                .show_index_stage(dir, 2, &path)
                .await?
                .unwrap_or_default();
            let theirs = self
                .worktree
                .show_index_stage(dir, 3, &path)
                .await?
                .unwrap_or_default();
            let raw = std::fs::read_to_string(dir.join(&path)).unwrap_or_default();
            conflicts.push(FileConflict {
                path,
                base,
                ours,
                theirs,
                raw,
            });
        }
        Ok(conflicts)
    }

    async fn resolve_one(
        &self,
        dir: &Path,
        conflict: &FileConflict,
        task: Option<(&str, &str)>,
    ) -> Result<Resolution, String> {
        if let Some(resolution) = fast_path(conflict) {
            return Ok(resolution);
        }
        if !self.config.enabled {
            return Err("agent conflict resolution is disabled".to_string());
        }

        self.bus.emit(OrchestratorEvent::ConflictAiResolving {
            path: conflict.path.clone(),
        });

        let (task_id, task_title) = match task {
            Some((id, title)) => (Some(id), Some(title)),
            None => (None, None),
        };
        let request = InvocationRequest {
            prompt: build_resolution_prompt(conflict, task_id, task_title),
            cwd: dir.to_path_buf(),
            timeout: Duration::from_millis(self.config.timeout_ms),
            ..Default::default()
        };

        let result = run_agent(self.agent.as_ref(), &request, &self.env_policy, None, |_| {})
            .await
            .map_err(|e| format!("agent unavailable: {e}"))?;

        if result.status != InvocationStatus::Completed {
            return Err(format!(
                "agent returned {:?} (exit code {:?})",
                result.status, result.exit_code
            ));
        }

        let content = strip_code_fence(&result.stdout);
        if content.trim().is_empty() {
            return Err("agent produced empty output".to_string());
        }

        let resolution = Resolution {
            content,
            strategy: ResolutionStrategy::Agent,
            confidence: AGENT_CONFIDENCE,
        };
        if resolution.confidence < self.config.confidence_threshold {
            return Err(format!(
                "resolution confidence {} below threshold {}",
                resolution.confidence, self.config.confidence_threshold
            ));
        }
        Ok(resolution)
    }

    /// Resolve every conflict of the in-progress merge at `dir`, stage the
    /// results, and conclude the merge. On error the merge is left as-is;
    /// the caller aborts it and preserves the worktree.
    pub async fn resolve_merge(
        &self,
        dir: &Path,
        task: Option<(&str, &str)>,
    ) -> Result<usize, RalphError> {
        let conflicts = self.collect_conflicts(dir).await?;
        self.bus.emit(OrchestratorEvent::ConflictDetected {
            files: conflicts.iter().map(|c| c.path.clone()).collect(),
        });

        if conflicts.len() > self.config.max_files {
            return Err(RalphError::MergeConflict {
                files: conflicts.len(),
                worktree: dir.to_path_buf(),
            });
        }

        for conflict in &conflicts {
            match self.resolve_one(dir, conflict, task).await {
                Ok(resolution) => {
                    std::fs::write(dir.join(&conflict.path), &resolution.content).map_err(
                        |e| RalphError::Config(format!(
                            "cannot write resolved {}: {e}",
                            conflict.path
                        )),
                    )?;
                    self.worktree.stage_file(dir, &conflict.path).await?;
                    info!(
                        path = conflict.path,
                        strategy = resolution.strategy.as_str(),
                        "conflict resolved"
                    );
                    self.bus.emit(OrchestratorEvent::ConflictResolved {
                        path: conflict.path.clone(),
                        strategy: resolution.strategy.as_str().to_string(),
                        confidence: resolution.confidence,
                    });
                }
                Err(reason) => {
                    warn!(path = %conflict.path, %reason, "conflict resolution failed");
                    self.bus.emit(OrchestratorEvent::ConflictFailed {
                        path: conflict.path.clone(),
                        reason,
                    });
                    return Err(RalphError::MergeConflict {
                        files: conflicts.len(),
                        worktree: dir.to_path_buf(),
                    });
                }
            }
        }

        self.worktree.conclude_merge(dir).await?;
        Ok(conflicts.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conflict(ours: &str, theirs: &str) -> FileConflict {
        FileConflict {
            path: "FEATURES.md".to_string(),
            base: Some("# Features\n".to_string()),
            ours: ours.to_string(),
            theirs: theirs.to_string(),
            raw: String::new(),
        }
    }

    #[test]
    fn fast_path_takes_other_side_when_one_is_whitespace() {
        let c = conflict("   \n\t\n", "# Features\n## A\n");
        let r = fast_path(&c).unwrap();
        assert_eq!(r.content, "# Features\n## A\n");
        assert_eq!(r.strategy, ResolutionStrategy::FastPath);
        assert_eq!(r.confidence, 1.0);

        let c = conflict("# Features\n## B\n", "");
        let r = fast_path(&c).unwrap();
        assert_eq!(r.content, "# Features\n## B\n");
    }

    #[test]
    fn fast_path_takes_either_side_when_identical() {
        let c = conflict("same\n", "same\n");
        let r = fast_path(&c).unwrap();
        assert_eq!(r.content, "same\n");
        assert_eq!(r.confidence, 1.0);
    }

    #[test]
    fn fast_path_declines_real_divergence() {
        let c = conflict("# A\n", "# B\n");
        assert!(fast_path(&c).is_none());
    }

    #[test]
    fn fast_path_handles_both_sides_empty() {
        let c = conflict("", "  ");
        // Both whitespace-only: either side works; completion without an
        // agent is what matters.
        assert!(fast_path(&c).is_some());
    }

    #[test]
    fn prompt_includes_all_blocks_and_task_context() {
        let c = conflict("ours content", "theirs content");
        let prompt = build_resolution_prompt(&c, Some("TEST-004"), Some("Merge A and B"));
        assert!(prompt.contains("FEATURES.md"));
        assert!(prompt.contains("task TEST-004: Merge A and B"));
        assert!(prompt.contains("# Features"));
        assert!(prompt.contains("ours content"));
        assert!(prompt.contains("theirs content"));
        assert!(prompt.contains("Output ONLY"));
    }

    #[test]
    fn prompt_marks_missing_base() {
        let mut c = conflict("a", "b");
        c.base = None;
        let prompt = build_resolution_prompt(&c, None, None);
        assert!(prompt.contains("(file did not exist)"));
    }

    #[test]
    fn strips_outer_fence_with_language_tag() {
        assert_eq!(strip_code_fence("```rust\nfn main() {}\n```"), "fn main() {}\n");
        assert_eq!(strip_code_fence("```\ncontent\n```"), "content\n");
    }

    #[test]
    fn leaves_unfenced_output_alone() {
        assert_eq!(strip_code_fence("plain output\n"), "plain output\n");
    }

    #[test]
    fn inner_fences_survive() {
        let input = "```markdown\nSee ```code``` inline\n```";
        assert_eq!(strip_code_fence(input), "See ```code``` inline\n");
    }
}
