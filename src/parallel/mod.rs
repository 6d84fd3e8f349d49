//! Parallel execution.
//!
//! Up to `N` workers run concurrently, each in a private worktree branched
//! from the integration branch (the session branch, or the main branch
//! when no session worktree is active). Worker completion merges back
//! through a serialized merge queue; conflicts go to the conflict
//! resolver. A worker failure preserves its worktree and surfaces the task
//! through the normal error policy.
//!
//! Task closure is authoritative in the integration checkout: a worker's
//! tracker copy is discarded with its worktree, and the integration
//! tracker is only updated after the worker's branch has merged. A
//! dependent task therefore cannot be admitted before its dependency's
//! merge has been serialized.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex, Semaphore};
use tracing::{info, warn};

use crate::agent::AgentAdapter;
use crate::config::Config;
use crate::conflict::ConflictResolver;
use crate::engine::{derive_close_reason, IterationEngine, IterationFailureKind, LoopReport};
use crate::errors::RalphError;
use crate::events::{EventBus, OrchestratorEvent};
use crate::ralph_config::ErrorStrategy;
use crate::scheduler::Scheduler;
use crate::session::StopReason;
use crate::tracker::{build_tracker_from_options, is_task_count_mismatch, Task, TrackerAdapter};
use crate::worktree::{MergeOutcome, WorktreeHandle, WorktreeManager};

/// What one worker reports back to the admission loop.
struct WorkerResult {
    task: Task,
    worker: WorktreeHandle,
    /// Sentinel seen and exit zero; merge decides final success.
    completed: bool,
    failure: Option<IterationFailureKind>,
    stdout_tail: String,
}

pub struct ParallelExecutor {
    /// Config rooted at the integration checkout.
    config: Config,
    agent: Arc<dyn AgentAdapter>,
    /// Tracker over the integration checkout; authoritative for closure.
    tracker: Arc<dyn TrackerAdapter>,
    /// Manager rooted at the integration checkout (worker lifecycle,
    /// merges, log preservation all happen relative to it).
    worktree: WorktreeManager,
    /// The branch workers fork from and merge into.
    integration: WorktreeHandle,
    resolver: Arc<ConflictResolver>,
    bus: EventBus,
    /// Serializes merge + conflict resolution on the integration branch.
    merge_queue: Mutex<()>,
    /// Session-worktree name used in worker branch names.
    name: String,
    /// Static project notes for worker prompts.
    project_context: Option<String>,
}

impl ParallelExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        agent: Arc<dyn AgentAdapter>,
        tracker: Arc<dyn TrackerAdapter>,
        worktree: WorktreeManager,
        integration: WorktreeHandle,
        resolver: Arc<ConflictResolver>,
        bus: EventBus,
        name: String,
    ) -> Self {
        Self {
            config,
            agent,
            tracker,
            worktree,
            integration,
            resolver,
            bus,
            merge_queue: Mutex::new(()),
            name,
            project_context: None,
        }
    }

    pub fn with_project_context(mut self, context: Option<String>) -> Self {
        self.project_context = context;
        self
    }

    /// Prepare a worker worktree with config and tracker data from the
    /// integration checkout and run one iteration in it.
    async fn run_worker(
        &self,
        task: Task,
        worker_index: usize,
        iteration: u32,
        cancel: watch::Receiver<bool>,
    ) -> Result<WorkerResult, RalphError> {
        let worker = self
            .worktree
            .create_worker(&self.integration, &self.name, worker_index)
            .await?;

        self.worktree.propagate_config(&worker.path).map_err(|e| {
            RalphError::Config(format!("cannot propagate config into worker: {e}"))
        })?;
        let rebased_prd = self
            .worktree
            .propagate_tracker_data(
                &worker.path,
                &self.config.file.tracker,
                &self.config.file.tracker_options,
            )
            .await?;

        let mut worker_config = self.config.rebased_into(&worker.path);
        if let Some(prd) = rebased_prd {
            worker_config.file.tracker_options.path = Some(prd);
        }
        let worker_tracker = build_tracker_from_options(
            &worker_config.file.tracker,
            &worker_config.file.tracker_options,
            &worker.path,
        )?;
        let engine = IterationEngine::new(
            worker_config,
            worker_tracker,
            Arc::clone(&self.agent),
            self.bus.clone(),
        )?
        .with_project_context(self.project_context.clone());

        let outcome = engine
            .run_task_iteration(&task, iteration, 0, Some(cancel))
            .await?;

        Ok(WorkerResult {
            completed: outcome.sentinel_found
                && outcome
                    .invocation
                    .as_ref()
                    .map(|i| i.exit_code == Some(0))
                    .unwrap_or(false),
            failure: outcome.failure,
            stdout_tail: outcome
                .invocation
                .map(|i| i.stdout)
                .unwrap_or_default(),
            task,
            worker,
        })
    }

    /// Merge a finished worker into the integration branch and close its
    /// task in the authoritative tracker. Returns false when the merge
    /// could not be completed (worker preserved).
    async fn merge_worker(&self, result: &WorkerResult) -> Result<bool, RalphError> {
        let _queue = self.merge_queue.lock().await;

        let outcome = self
            .worktree
            .merge_branch_into(&self.integration.path, &result.worker.branch)
            .await?;

        match outcome {
            MergeOutcome::Merged => {}
            MergeOutcome::Conflicted { ref files } => {
                info!(
                    task = %result.task.id,
                    files = files.len(),
                    "worker merge conflicted; invoking resolver"
                );
                let resolved = self
                    .resolver
                    .resolve_merge(
                        &self.integration.path,
                        Some((result.task.id.as_str(), result.task.title.as_str())),
                    )
                    .await;
                if let Err(e) = resolved {
                    warn!(task = %result.task.id, "conflict resolution failed: {e}");
                    self.worktree.abort_merge(&self.integration.path).await?;
                    return Ok(false);
                }
            }
        }

        let reason = derive_close_reason(&result.stdout_tail);
        self.tracker.close_task(&result.task.id, &reason).await?;
        self.bus.emit(OrchestratorEvent::TaskClosed {
            task_id: result.task.id.clone(),
            reason,
        });

        // Commit the tracker-state write so later worker branches see a
        // clean integration tree and a current branch point.
        if let Ok(committer) = crate::worktree::RepoCommitter::new(&self.integration.path) {
            if let Err(e) =
                committer.commit_all(&format!("chore: record closure of {}", result.task.id))
            {
                warn!(task = %result.task.id, "tracker-state commit failed: {e}");
            }
        }

        // Merged workers lose their worktree and branch.
        self.worktree.cleanup_after_merge(&result.worker).await?;
        Ok(true)
    }

    /// Admission loop: claim up to `parallel` dependency-disjoint tasks,
    /// run them in workers, merge completions, apply the error policy.
    pub async fn execute(
        self: &Arc<Self>,
        scheduler: &mut Scheduler,
        start_iteration: u32,
        session_known_task_count: usize,
        cancel: watch::Receiver<bool>,
        mut on_progress: impl FnMut(&LoopReport),
    ) -> Result<LoopReport, RalphError> {
        let policy = self.config.file.error_handling.clone();
        let parallel = self.config.file.parallel.max(1);
        let semaphore = Arc::new(Semaphore::new(parallel));
        let iteration_counter = Arc::new(AtomicU32::new(start_iteration));
        let (result_tx, mut result_rx) =
            mpsc::channel::<Result<WorkerResult, (String, RalphError)>>(parallel.max(1) * 2);

        let mut report = LoopReport {
            stop_reason: StopReason::NoTasks,
            iterations_run: 0,
            tasks_closed: 0,
            tasks_failed: 0,
            tasks_remaining: 0,
        };
        let mut attempts: HashMap<String, u32> = HashMap::new();
        let mut active = 0usize;
        let mut next_worker_index = 1usize;
        let mut stop: Option<StopReason> = None;

        loop {
            if stop.is_none() && *cancel.borrow() {
                stop = Some(StopReason::UserPause);
            }

            if stop.is_none()
                && iteration_counter.load(Ordering::SeqCst) >= self.config.file.max_iterations
            {
                stop = Some(StopReason::MaxIterations);
            }

            // Admit new work while slots are free and no stop is pending.
            if stop.is_none() {
                match self.tracker.list_open_tasks().await {
                    Ok(tasks) => {
                        report.tasks_remaining = tasks.len();
                        if tasks.is_empty() && active == 0 {
                            if is_task_count_mismatch(0, session_known_task_count) {
                                warn!(
                                    session_known_task_count,
                                    "tracker returned no tasks but this session has seen \
                                     tasks before; check the configured epic id or PRD path"
                                );
                                stop = Some(StopReason::NoTasks);
                            } else if report.tasks_closed > 0 || session_known_task_count > 0 {
                                stop = Some(StopReason::Completed);
                            } else {
                                stop = Some(StopReason::NoTasks);
                            }
                        } else {
                            scheduler.refresh(tasks);
                        }
                    }
                    Err(e) => {
                        warn!("tracker listing failed: {e}");
                    }
                }
            }

            if stop.is_none() && active < parallel {
                let claimed = scheduler.claim(parallel - active);
                if claimed.is_empty() && active == 0 && report.tasks_remaining > 0 {
                    warn!("open tasks remain but none are eligible (blocked, failed, or cyclic)");
                    stop = Some(StopReason::NoTasks);
                }
                for task in claimed {
                    let permit = Arc::clone(&semaphore).acquire_owned().await.map_err(|e| {
                        RalphError::Other(anyhow::anyhow!("semaphore closed: {e}"))
                    })?;
                    let iteration = iteration_counter.fetch_add(1, Ordering::SeqCst) + 1;
                    report.iterations_run += 1;
                    let worker_index = next_worker_index;
                    next_worker_index += 1;
                    active += 1;

                    let tx = result_tx.clone();
                    let cancel_rx = cancel.clone();
                    let this = Arc::clone(self);
                    let task_id = task.id.clone();
                    tokio::spawn(async move {
                        let result = this
                            .run_worker(task, worker_index, iteration, cancel_rx)
                            .await
                            .map_err(|e| (task_id, e));
                        let _ = tx.send(result).await;
                        drop(permit);
                    });
                }
            }

            if active == 0 {
                report.stop_reason = stop.unwrap_or(StopReason::NoTasks);
                break;
            }

            // Wait for one worker to finish.
            let Some(done) = result_rx.recv().await else {
                report.stop_reason = stop.unwrap_or(StopReason::FatalError);
                break;
            };
            active -= 1;

            match done {
                Ok(result) => {
                    if result.completed {
                        match self.merge_worker(&result).await {
                            Ok(true) => {
                                scheduler.mark_closed(&result.task.id);
                                attempts.remove(&result.task.id);
                                report.tasks_closed += 1;
                            }
                            Ok(false) => {
                                // Merge failed: worker preserved, task
                                // failed for this session.
                                scheduler.mark_failed(&result.task.id);
                                report.tasks_failed += 1;
                            }
                            Err(e) => {
                                warn!(task = %result.task.id, "merge failed: {e}");
                                scheduler.mark_failed(&result.task.id);
                                report.tasks_failed += 1;
                            }
                        }
                    } else {
                        // Worker finished without completing the task.
                        self.handle_failure(
                            scheduler,
                            &mut attempts,
                            &mut report,
                            &mut stop,
                            &policy,
                            &result.task.id,
                            result.failure,
                        );
                        // Unmerged worker worktrees are preserved for
                        // diagnosis; a retry gets a fresh one.
                    }
                }
                Err((task_id, e)) => {
                    warn!(task = %task_id, "worker died: {e}");
                    self.handle_failure(
                        scheduler,
                        &mut attempts,
                        &mut report,
                        &mut stop,
                        &policy,
                        &task_id,
                        Some(IterationFailureKind::AgentUnavailable),
                    );
                }
            }

            report.tasks_remaining = scheduler.open_count();
            on_progress(&report);

            if stop.is_none() {
                tokio::time::sleep(Duration::from_secs(self.config.file.iteration_delay)).await;
            }
        }

        on_progress(&report);
        Ok(report)
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_failure(
        &self,
        scheduler: &mut Scheduler,
        attempts: &mut HashMap<String, u32>,
        report: &mut LoopReport,
        stop: &mut Option<StopReason>,
        policy: &crate::ralph_config::ErrorHandlingConfig,
        task_id: &str,
        failure: Option<IterationFailureKind>,
    ) {
        match failure {
            Some(IterationFailureKind::Interrupted) => {
                scheduler.release(task_id);
                stop.get_or_insert(StopReason::UserPause);
            }
            Some(IterationFailureKind::CompletionMissing) => {
                scheduler.release(task_id);
            }
            Some(IterationFailureKind::NonZeroExit) if policy.continue_on_non_zero_exit => {
                scheduler.release(task_id);
            }
            _ => {
                let attempt = attempts.entry(task_id.to_string()).or_insert(0);
                *attempt += 1;
                match policy.strategy {
                    ErrorStrategy::Abort => {
                        scheduler.release(task_id);
                        stop.get_or_insert(StopReason::FatalError);
                    }
                    ErrorStrategy::Retry if *attempt <= policy.max_retries => {
                        scheduler.release(task_id);
                    }
                    _ => {
                        scheduler.mark_failed(task_id);
                        attempts.remove(task_id);
                        report.tasks_failed += 1;
                    }
                }
            }
        }
    }
}
