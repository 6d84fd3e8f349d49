//! The iteration engine.
//!
//! One iteration = one agent invocation plus its bookkeeping: claim the
//! task, resolve the model, assemble the prompt, run the agent, detect the
//! completion sentinel, commit the tree, close the task, log. The serial
//! session loop drives iterations until a stop condition and always exits
//! with an explicit [`StopReason`]; outer callers never infer completion
//! from an idle flag.

pub mod model;
pub mod prompt;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::agent::{
    run_agent, AgentAdapter, EnvPolicy, InvocationRequest, InvocationResult, InvocationStatus,
};
use crate::config::Config;
use crate::errors::RalphError;
use crate::events::{EventBus, OrchestratorEvent};
use crate::logging::{prompt_digest, IterationLogger, IterationSummary};
use crate::scheduler::Scheduler;
use crate::session::StopReason;
use crate::tracker::{is_task_count_mismatch, Task, TaskStatus, TrackerAdapter};
use crate::worktree::commit::{render_commit_message, RepoCommitter};

pub use model::{resolve_model, ModelSource, ResolvedModel};
pub use prompt::{build_prompt, COMPLETION_SENTINEL};

/// Cap on the close-reason text derived from agent output.
const CLOSE_REASON_MAX_CHARS: usize = 200;

/// Why an iteration did not close its task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationFailureKind {
    /// Spawn failure or agent-level unavailability; retryable.
    AgentUnavailable,
    /// Exceeded the per-call timeout; retryable.
    AgentTimeout,
    /// Agent exited non-zero; retryable unless configured to continue.
    NonZeroExit,
    /// Exit zero but no sentinel: an unproductive iteration, not an error.
    CompletionMissing,
    /// Cancellation arrived mid-run.
    Interrupted,
    /// The tracker could not be read or written.
    Tracker,
}

/// Everything one iteration produced.
#[derive(Debug)]
pub struct IterationOutcome {
    pub task_id: String,
    pub success: bool,
    pub sentinel_found: bool,
    pub invocation: Option<InvocationResult>,
    pub commit: Option<String>,
    pub close_reason: Option<String>,
    pub model: ResolvedModel,
    pub failure: Option<IterationFailureKind>,
}

/// Summary of a finished (or stopped) session loop.
#[derive(Debug, Clone)]
pub struct LoopReport {
    pub stop_reason: StopReason,
    pub iterations_run: u32,
    pub tasks_closed: u32,
    pub tasks_failed: u32,
    /// Open tasks remaining at the last refresh.
    pub tasks_remaining: usize,
}

pub struct IterationEngine {
    config: Config,
    tracker: Arc<dyn TrackerAdapter>,
    agent: Arc<dyn AgentAdapter>,
    env_policy: Arc<EnvPolicy>,
    bus: EventBus,
    project_context: Option<String>,
}

impl IterationEngine {
    pub fn new(
        config: Config,
        tracker: Arc<dyn TrackerAdapter>,
        agent: Arc<dyn AgentAdapter>,
        bus: EventBus,
    ) -> Result<Self, RalphError> {
        let env_policy = EnvPolicy::new(
            &config.file.agent_options.env_exclude,
            &config.file.agent_options.env_passthrough,
        )
        .map_err(|e| RalphError::Config(e.to_string()))?;
        Ok(Self {
            config,
            tracker,
            agent,
            env_policy: Arc::new(env_policy),
            bus,
            project_context: None,
        })
    }

    /// Static project notes prepended to every prompt.
    pub fn with_project_context(mut self, context: Option<String>) -> Self {
        self.project_context = context;
        self
    }

    pub fn tracker(&self) -> Arc<dyn TrackerAdapter> {
        Arc::clone(&self.tracker)
    }

    fn engine_flags(&self, resolved: &ResolvedModel) -> Vec<String> {
        let mut flags = Vec::new();
        let caps = self.agent.capabilities();
        if caps.supports_subagent_tracing && caps.structured_output_format.is_some() {
            flags.extend(self.agent.structured_output_flags());
        }
        if let Some(model) = &resolved.model {
            flags.push("--model".to_string());
            flags.push(model.clone());
        }
        flags
    }

    /// Execute one iteration for one task. Fatal filesystem/invariant
    /// errors propagate; everything the retry policy can reason about is
    /// classified in the outcome.
    pub async fn run_task_iteration(
        &self,
        task: &Task,
        iteration: u32,
        retries: u32,
        cancel: Option<watch::Receiver<bool>>,
    ) -> Result<IterationOutcome, RalphError> {
        let resolved = resolve_model(self.agent.as_ref(), task, self.config.cli_model.as_deref());

        let mut outcome = IterationOutcome {
            task_id: task.id.clone(),
            success: false,
            sentinel_found: false,
            invocation: None,
            commit: None,
            close_reason: None,
            model: resolved,
            failure: None,
        };

        // Claim the task in the tracker first; a failure here is a tracker
        // failure before any agent cost is spent.
        if let Err(e) = self
            .tracker
            .update_task_status(&task.id, TaskStatus::InProgress)
            .await
        {
            warn!(task = %task.id, "cannot mark in_progress: {e}");
            outcome.failure = Some(IterationFailureKind::Tracker);
            return Ok(outcome);
        }

        let prompt = build_prompt(
            task,
            &self.tracker.closure_instruction(task),
            self.project_context.as_deref(),
        );

        let mut logger = IterationLogger::start(
            &self.config.iterations_dir,
            iteration,
            vec![task.id.clone()],
            self.bus.clone(),
        )?;

        let request = InvocationRequest {
            prompt: prompt.clone(),
            cwd: self.config.cwd.clone(),
            timeout: Duration::from_secs(self.config.file.agent_options.timeout),
            extra_flags: self.config.file.agent_options.default_flags.clone(),
            engine_flags: self.engine_flags(&outcome.model),
            ..Default::default()
        };

        let env_summary = self.env_policy.filter(std::env::vars()).summary();

        let invocation = match run_agent(
            self.agent.as_ref(),
            &request,
            &self.env_policy,
            cancel,
            |chunk| {
                let _ = logger.stdout_chunk(chunk);
            },
        )
        .await
        {
            Ok(result) => result,
            Err(e) => {
                warn!(task = %task.id, "agent invocation failed: {e}");
                outcome.failure = Some(IterationFailureKind::AgentUnavailable);
                let _ = logger.end(&self.summary(&outcome, iteration, retries, &prompt, &env_summary));
                return Ok(outcome);
            }
        };

        outcome.sentinel_found = invocation.stdout.contains(COMPLETION_SENTINEL);
        let exit_zero = invocation.exit_code == Some(0);

        outcome.failure = match invocation.status {
            InvocationStatus::Timeout => Some(IterationFailureKind::AgentTimeout),
            InvocationStatus::Interrupted => Some(IterationFailureKind::Interrupted),
            InvocationStatus::Failed => Some(IterationFailureKind::NonZeroExit),
            InvocationStatus::Completed if !outcome.sentinel_found => {
                Some(IterationFailureKind::CompletionMissing)
            }
            InvocationStatus::Completed => None,
        };

        let completed = outcome.sentinel_found && exit_zero;

        // Commit before closing: uncommitted changes must never cross an
        // iteration boundary (fatal when auto-commit cannot run).
        outcome.commit = self.commit_iteration(task)?;

        if completed {
            let close_reason = derive_close_reason(&invocation.stdout);
            match self
                .tracker
                .close_task(&task.id, &close_reason)
                .await
            {
                Ok(()) => {
                    info!(task = %task.id, reason = %close_reason, "task closed");
                    let _ = logger.record(&OrchestratorEvent::TaskClosed {
                        task_id: task.id.clone(),
                        reason: close_reason.clone(),
                    });
                    outcome.close_reason = Some(close_reason);
                    outcome.success = true;
                    outcome.failure = None;
                }
                Err(e) => {
                    warn!(task = %task.id, "close_task failed: {e}");
                    outcome.failure = Some(IterationFailureKind::Tracker);
                }
            }
        }

        outcome.invocation = Some(invocation);
        let _ = logger.end(&self.summary(&outcome, iteration, retries, &prompt, &env_summary));
        Ok(outcome)
    }

    fn summary(
        &self,
        outcome: &IterationOutcome,
        iteration: u32,
        retries: u32,
        prompt: &str,
        env_summary: &str,
    ) -> IterationSummary {
        IterationSummary {
            iteration,
            task_ids: vec![outcome.task_id.clone()],
            prompt_sha256: prompt_digest(prompt),
            prompt_bytes: prompt.len(),
            model: outcome.model.model.clone(),
            model_source: outcome.model.source.as_str().to_string(),
            command_line: outcome
                .invocation
                .as_ref()
                .map(|i| i.command_line.clone())
                .unwrap_or_default(),
            env_summary: env_summary.to_string(),
            exit_code: outcome.invocation.as_ref().and_then(|i| i.exit_code),
            duration_ms: outcome
                .invocation
                .as_ref()
                .map(|i| i.duration_ms)
                .unwrap_or_default(),
            sentinel_found: outcome.sentinel_found,
            success: outcome.success,
            retries,
            commit: outcome.commit.clone(),
        }
    }

    /// Stage-and-commit the working tree. With auto-commit off, the agent
    /// owns commits and a dirty tree at the boundary violates the session
    /// invariant.
    fn commit_iteration(&self, task: &Task) -> Result<Option<String>, RalphError> {
        let committer = match RepoCommitter::new(&self.config.cwd) {
            Ok(c) => c,
            Err(e) => {
                warn!("not committing: {e}");
                return Ok(None);
            }
        };

        if !self.config.file.auto_commit {
            // The tracker's own PRD writes land after the commit step and
            // do not count against the clean-boundary invariant.
            let prd_rel = self.config.prd_path().and_then(|p| {
                p.strip_prefix(&self.config.cwd)
                    .ok()
                    .map(|r| r.to_string_lossy().to_string())
            });
            let excludes: Vec<&str> = prd_rel.as_deref().into_iter().collect();
            if committer
                .has_uncommitted_changes_excluding(&excludes)
                .map_err(RalphError::Other)?
            {
                return Err(RalphError::Other(anyhow::anyhow!(
                    "uncommitted changes at iteration boundary with autoCommit disabled"
                )));
            }
            return Ok(None);
        }

        let message = render_commit_message(
            &self.config.file.commit_message_template,
            &task.id,
            &task.title,
        );
        committer.commit_all(&message).map_err(RalphError::Other)
    }

    /// Serial session loop: refresh, claim one, run, apply the error
    /// policy, persist via `on_progress`, delay, repeat.
    ///
    /// `start_iteration` carries the accumulated count on resume;
    /// `session_known_task_count` feeds the tracker-mismatch warning.
    pub async fn run_session_loop(
        &self,
        scheduler: &mut Scheduler,
        start_iteration: u32,
        session_known_task_count: usize,
        cancel: watch::Receiver<bool>,
        mut on_progress: impl FnMut(&LoopReport),
    ) -> Result<LoopReport, RalphError> {
        let policy = self.config.file.error_handling.clone();
        let mut report = LoopReport {
            stop_reason: StopReason::NoTasks,
            iterations_run: 0,
            tasks_closed: 0,
            tasks_failed: 0,
            tasks_remaining: 0,
        };
        let mut iteration = start_iteration;
        let mut consecutive_tracker_failures = 0u32;
        let mut attempts: HashMap<String, u32> = HashMap::new();

        loop {
            if *cancel.borrow() {
                report.stop_reason = StopReason::UserPause;
                break;
            }
            if iteration >= self.config.file.max_iterations {
                report.stop_reason = StopReason::MaxIterations;
                break;
            }

            match self.tracker.list_open_tasks().await {
                Ok(tasks) => {
                    consecutive_tracker_failures = 0;
                    report.tasks_remaining = tasks.len();
                    if tasks.is_empty() {
                        if is_task_count_mismatch(0, session_known_task_count) {
                            warn!(
                                session_known_task_count,
                                "tracker returned no tasks but this session has seen tasks \
                                 before; check the configured epic id or PRD path"
                            );
                            report.stop_reason = StopReason::NoTasks;
                        } else if report.tasks_closed > 0 || session_known_task_count > 0 {
                            report.stop_reason = StopReason::Completed;
                        } else {
                            report.stop_reason = StopReason::NoTasks;
                        }
                        break;
                    }
                    scheduler.refresh(tasks);
                }
                Err(e) => {
                    consecutive_tracker_failures += 1;
                    warn!("tracker listing failed ({consecutive_tracker_failures}x): {e}");
                    if consecutive_tracker_failures >= 2 {
                        report.stop_reason = StopReason::FatalError;
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(policy.retry_delay_ms)).await;
                    continue;
                }
            }

            let claimed = scheduler.claim(1);
            let Some(task) = claimed.into_iter().next() else {
                warn!("open tasks remain but none are eligible (blocked, failed, or cyclic)");
                report.stop_reason = StopReason::NoTasks;
                break;
            };

            iteration += 1;
            report.iterations_run += 1;
            let retry_count = attempts.get(&task.id).copied().unwrap_or(0);

            let outcome = match self
                .run_task_iteration(&task, iteration, retry_count, Some(cancel.clone()))
                .await
            {
                Ok(outcome) => outcome,
                Err(fatal) => {
                    scheduler.release(&task.id);
                    report.stop_reason = StopReason::FatalError;
                    on_progress(&report);
                    return Err(fatal);
                }
            };

            if outcome.success {
                scheduler.mark_closed(&task.id);
                attempts.remove(&task.id);
                report.tasks_closed += 1;
            } else {
                match outcome.failure {
                    Some(IterationFailureKind::Interrupted) => {
                        scheduler.release(&task.id);
                        report.stop_reason = StopReason::UserPause;
                        break;
                    }
                    Some(IterationFailureKind::CompletionMissing) => {
                        // Unproductive, not an error: the task stays open
                        // and the loop keeps going.
                        scheduler.release(&task.id);
                    }
                    Some(IterationFailureKind::NonZeroExit)
                        if policy.continue_on_non_zero_exit =>
                    {
                        scheduler.release(&task.id);
                    }
                    Some(_) => {
                        let next_attempt = retry_count + 1;
                        match policy.strategy {
                            crate::ralph_config::ErrorStrategy::Abort => {
                                scheduler.release(&task.id);
                                report.stop_reason = StopReason::FatalError;
                                break;
                            }
                            crate::ralph_config::ErrorStrategy::Retry
                                if next_attempt <= policy.max_retries =>
                            {
                                attempts.insert(task.id.clone(), next_attempt);
                                scheduler.release(&task.id);
                                let backoff = policy.retry_delay_ms * next_attempt as u64;
                                info!(
                                    task = %task.id,
                                    attempt = next_attempt,
                                    backoff_ms = backoff,
                                    "retrying after failure"
                                );
                                tokio::time::sleep(Duration::from_millis(backoff)).await;
                            }
                            _ => {
                                // Skip strategy, or retries exhausted.
                                scheduler.mark_failed(&task.id);
                                attempts.remove(&task.id);
                                report.tasks_failed += 1;
                            }
                        }
                    }
                    None => scheduler.release(&task.id),
                }
            }

            report.tasks_remaining = scheduler.open_count();
            on_progress(&report);

            tokio::time::sleep(Duration::from_secs(self.config.file.iteration_delay)).await;
        }

        on_progress(&report);
        Ok(report)
    }
}

/// Short close reason from the output heuristics: the last non-empty line
/// that is not just the sentinel, whitespace-collapsed and capped.
pub fn derive_close_reason(stdout: &str) -> String {
    let collapse = regex::Regex::new(r"\s+").expect("static regex");
    for line in stdout.lines().rev() {
        let cleaned = line.replace(COMPLETION_SENTINEL, "");
        let cleaned = collapse.replace_all(cleaned.trim(), " ");
        if cleaned.is_empty() {
            continue;
        }
        let mut reason: String = cleaned.chars().take(CLOSE_REASON_MAX_CHARS).collect();
        if cleaned.chars().count() > CLOSE_REASON_MAX_CHARS {
            reason.push_str("...");
        }
        return reason;
    }
    "closed by agent".to_string()
}
