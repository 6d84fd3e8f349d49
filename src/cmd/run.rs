//! Session execution — `ralph-tui run` and the execute half of `resume`.

use std::path::Path;
use std::sync::Arc;

use console::style;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::agent::{build_agent, preflight, AgentAdapter};
use crate::config::Config;
use crate::conflict::ConflictResolver;
use crate::engine::{IterationEngine, LoopReport};
use crate::errors::RalphError;
use crate::events::EventBus;
use crate::parallel::ParallelExecutor;
use crate::scheduler::Scheduler;
use crate::session::{SessionManager, SessionRegistry, SessionState, StopReason};
use crate::tracker::build_tracker_from_options;
use crate::worktree::{derive_name, MergeOutcome, WorktreeHandle, WorktreeManager};

/// Start (or resume, with `resume = true`) a session in `config.cwd`.
/// Returns the process exit code.
pub async fn cmd_run(
    config: Config,
    resume: bool,
    no_setup: bool,
    registry: SessionRegistry,
) -> Result<i32, RalphError> {
    config.ensure_directories().map_err(RalphError::Other)?;
    let manager = SessionManager::new(config.clone(), registry);

    let (mut state, guard) = if resume {
        let state = manager.load()?.ok_or_else(|| {
            RalphError::StateCorrupted(format!(
                "no session file in {}; start one with `run`",
                config.cwd.display()
            ))
        })?;
        let fingerprint = config.fingerprint();
        if state.config_fingerprint != fingerprint {
            warn!(
                "configuration changed since this session was created \
                 (fingerprint {} -> {})",
                state.config_fingerprint, fingerprint
            );
        }
        let guard = manager.reacquire(&state)?;
        (state, guard)
    } else {
        manager.start()?
    };

    let agent = build_agent(&config)?;

    if !no_setup {
        let report = preflight(agent.as_ref(), &config.cwd).await;
        if !report.ok {
            let reason = report.fail_reason.unwrap_or_else(|| "unknown".into());
            manager.finish(&mut state, StopReason::FatalError)?;
            return Err(RalphError::AgentUnavailable {
                reason,
                suggestion: report.suggestion,
            });
        }
    }

    let result = execute_session(&config, &manager, &mut state, agent, resume).await;
    drop(guard);

    if result.is_err() {
        // Errors that escaped the loop still deserve a terminal record.
        let _ = manager.finish(&mut state, StopReason::FatalError);
    }
    let report = result?;
    let exit_code = if state.is_fully_complete() { 0 } else { 1 };

    if !config.headless {
        let line = format!(
            "session {}: {} after {} iteration(s), {}/{} task(s) closed ({} failed)",
            state.session_id,
            state
                .stop_reason
                .map(|r| r.to_string())
                .unwrap_or_else(|| "stopped".into()),
            report.iterations_run,
            state.tasks.closed,
            state.tasks.total,
            state.tasks.failed,
        );
        if exit_code == 0 {
            println!("{}", style(line).green());
        } else {
            println!("{}", style(line).yellow());
        }
    }

    Ok(exit_code)
}

/// The shared run/resume body: worktree setup, engine construction, the
/// loop, merge-back, terminal bookkeeping.
async fn execute_session(
    config: &Config,
    manager: &SessionManager,
    state: &mut SessionState,
    agent: Arc<dyn AgentAdapter>,
    resume: bool,
) -> Result<LoopReport, RalphError> {
    let bus = EventBus::new();

    // Session worktree, when requested.
    let mut engine_config = config.clone();
    let mut wt_main: Option<WorktreeManager> = None;
    let mut session_handle: Option<WorktreeHandle> = None;
    let mut session_name = String::new();

    if config.file.worktree {
        let manager_wt = WorktreeManager::new(&config.cwd).await?;
        let name = match (&state.worktree, resume) {
            (Some(handle), true) => handle
                .branch
                .strip_prefix("ralph-session/")
                .unwrap_or(&handle.branch)
                .to_string(),
            _ => derive_name(
                config.worktree_name.as_deref(),
                config.file.tracker_options.epic_id.as_deref(),
                config.prd_path().as_deref(),
                &state.session_id.to_string(),
            ),
        };
        let handle = manager_wt.create_session(&name).await?;

        manager_wt.propagate_config(&handle.path).map_err(|e| {
            RalphError::Config(format!("cannot copy config into worktree: {e}"))
        })?;
        let rebased_prd = manager_wt
            .propagate_tracker_data(
                &handle.path,
                &config.file.tracker,
                &config.file.tracker_options,
            )
            .await?;

        engine_config = config.rebased_into(&handle.path);
        if let Some(prd) = rebased_prd {
            engine_config.file.tracker_options.path = Some(prd);
        }

        state.worktree = Some(handle.clone());
        manager.persist(state)?;
        session_name = name;
        session_handle = Some(handle);
        wt_main = Some(manager_wt);
    }

    let tracker = build_tracker_from_options(
        &engine_config.file.tracker,
        &engine_config.file.tracker_options,
        &engine_config.cwd,
    )?;

    // Totals feed both the completion rule and the mismatch warning.
    let session_known_task_count = if resume { state.tasks.total as usize } else { 0 };
    match tracker.list_open_tasks().await {
        Ok(tasks) => {
            state.tasks.total = state.tasks.total.max(state.tasks.closed + tasks.len() as u32);
        }
        Err(e) => warn!("initial tracker listing failed: {e}"),
    }
    manager.persist(state)?;

    // First SIGINT requests a graceful stop; a second one aborts.
    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = cancel_tx.send(true);
        }
        if tokio::signal::ctrl_c().await.is_ok() {
            std::process::exit(130);
        }
    });

    let project_context = read_project_context(&engine_config.ralph_dir);
    let base_closed = state.tasks.closed;
    let start_iteration = state.iteration;

    let mut scheduler = Scheduler::new();
    let report = if engine_config.file.parallel > 1 {
        let integration_dir = engine_config.cwd.clone();
        let wt_integration = WorktreeManager::new(&integration_dir)
            .await?
            .with_worktree_root(
                wt_main
                    .as_ref()
                    .map(|m| m.worktree_root())
                    .unwrap_or_else(|| {
                        WorktreeManager::worktree_root_for(&config.cwd)
                    }),
            );
        let integration = match &session_handle {
            Some(handle) => handle.clone(),
            None => {
                let branch = wt_integration.current_branch().await?;
                WorktreeHandle {
                    path: integration_dir.clone(),
                    branch: branch.clone(),
                    mode: crate::worktree::WorktreeMode::Reused,
                    base_branch: branch,
                }
            }
        };
        let name = if session_name.is_empty() {
            derive_name(
                config.worktree_name.as_deref(),
                config.file.tracker_options.epic_id.as_deref(),
                config.prd_path().as_deref(),
                &state.session_id.to_string(),
            )
        } else {
            session_name.clone()
        };
        let env_policy = crate::agent::EnvPolicy::new(
            &engine_config.file.agent_options.env_exclude,
            &engine_config.file.agent_options.env_passthrough,
        )
        .map_err(|e| RalphError::Config(e.to_string()))?;
        let resolver = Arc::new(ConflictResolver::new(
            Arc::clone(&agent),
            wt_integration.clone(),
            engine_config.file.conflict_resolution.clone(),
            Arc::new(env_policy),
            bus.clone(),
        ));
        let executor = Arc::new(
            ParallelExecutor::new(
                engine_config.clone(),
                Arc::clone(&agent),
                Arc::clone(&tracker),
                wt_integration,
                integration,
                resolver,
                bus.clone(),
                name,
            )
            .with_project_context(project_context.clone()),
        );
        executor
            .execute(
                &mut scheduler,
                start_iteration,
                session_known_task_count,
                cancel_rx,
                |progress| persist_progress(manager, state, base_closed, start_iteration, progress),
            )
            .await?
    } else {
        let engine = IterationEngine::new(
            engine_config.clone(),
            Arc::clone(&tracker),
            Arc::clone(&agent),
            bus.clone(),
        )?
        .with_project_context(project_context);
        engine
            .run_session_loop(
                &mut scheduler,
                start_iteration,
                session_known_task_count,
                cancel_rx,
                |progress| persist_progress(manager, state, base_closed, start_iteration, progress),
            )
            .await?
    };

    // SIGINT is the only quit surface here; map the engine's pause onto
    // the user-quit stop reason.
    let stop_reason = match report.stop_reason {
        StopReason::UserPause => StopReason::UserQuit,
        other => other,
    };

    // Merge the session worktree back only on full completion; every other
    // exit preserves it for resume.
    if let (Some(manager_wt), Some(handle)) = (&wt_main, &session_handle) {
        if stop_reason == StopReason::Completed {
            merge_back_session(manager_wt, handle, &agent, &engine_config, &bus).await?;
            state.worktree = None;
        } else {
            info!(
                "session worktree preserved at {} for resume",
                handle.path.display()
            );
        }
    }

    manager.finish(state, stop_reason)?;
    Ok(report)
}

fn persist_progress(
    manager: &SessionManager,
    state: &mut SessionState,
    base_closed: u32,
    start_iteration: u32,
    progress: &LoopReport,
) {
    state.iteration = start_iteration + progress.iterations_run;
    state.tasks.closed = base_closed + progress.tasks_closed;
    state.tasks.failed = progress.tasks_failed;
    state.tasks.total = state
        .tasks
        .total
        .max(state.tasks.closed + progress.tasks_remaining as u32);
    state.updated_at = chrono::Utc::now();
    if let Err(e) = manager.persist(state) {
        warn!("cannot persist session state: {e}");
    }
}

async fn merge_back_session(
    manager_wt: &WorktreeManager,
    handle: &WorktreeHandle,
    agent: &Arc<dyn AgentAdapter>,
    engine_config: &Config,
    bus: &EventBus,
) -> Result<(), RalphError> {
    // The last close_task lands after the last iteration commit; sweep any
    // leftover tracker-state changes into a final commit so the merge
    // carries them.
    if let Ok(committer) = crate::worktree::RepoCommitter::new(&handle.path) {
        if let Err(e) = committer.commit_all("chore: record final tracker state") {
            warn!("final tracker-state commit failed: {e}");
        }
    }

    match manager_wt.merge_back(handle).await? {
        MergeOutcome::Merged => {
            manager_wt.cleanup_after_merge(handle).await?;
            info!("session worktree merged back and removed");
            Ok(())
        }
        MergeOutcome::Conflicted { files } => {
            warn!(files = files.len(), "merge-back conflicted");
            let env_policy = crate::agent::EnvPolicy::new(
                &engine_config.file.agent_options.env_exclude,
                &engine_config.file.agent_options.env_passthrough,
            )
            .map_err(|e| RalphError::Config(e.to_string()))?;
            let resolver = ConflictResolver::new(
                Arc::clone(agent),
                manager_wt.clone(),
                engine_config.file.conflict_resolution.clone(),
                Arc::new(env_policy),
                bus.clone(),
            );
            match resolver.resolve_merge(manager_wt.cwd(), None).await {
                Ok(resolved) => {
                    info!(resolved, "merge-back conflicts resolved");
                    manager_wt.cleanup_after_merge(handle).await?;
                    Ok(())
                }
                Err(e) => {
                    manager_wt.abort_merge(manager_wt.cwd()).await?;
                    eprintln!("{}", manager_wt.manual_merge_instructions(handle));
                    Err(e)
                }
            }
        }
    }
}

/// Static project notes (`.ralph-tui/context.md`) prepended to every
/// prompt when present.
fn read_project_context(ralph_dir: &Path) -> Option<String> {
    let path = ralph_dir.join("context.md");
    std::fs::read_to_string(path).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_context_is_optional() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_project_context(dir.path()).is_none());
        std::fs::write(dir.path().join("context.md"), "tabs not spaces").unwrap();
        assert_eq!(
            read_project_context(dir.path()).unwrap(),
            "tabs not spaces"
        );
    }
}
