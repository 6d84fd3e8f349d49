//! Git worktree isolation.
//!
//! The manager owns every git interaction in the process: session and
//! worker worktree lifecycle, merges, conflict-stage extraction, and the
//! iteration-boundary commits (via [`commit::RepoCommitter`]). Git does not
//! support concurrent mutating operations on one repository, so everything
//! that writes goes through an internal async mutex. Each git subprocess
//! runs under a 30 second timeout.
//!
//! Layout: session worktrees live at
//! `<parent_of_cwd>/.ralph-worktrees/<project>/<name>` on branch
//! `ralph-session/<name>`; workers are siblings on
//! `ralph-worker/<name>-<n>`.

pub mod commit;
pub mod naming;

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::errors::RalphError;
use crate::ralph_config::TrackerOptions;

pub use commit::RepoCommitter;
pub use naming::{derive_name, sanitize_name};

/// Per-git-subprocess timeout.
const GIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Free space required before creating a worktree.
const MIN_FREE_MIB: u64 = 500;

/// Files never copied out of `.beads/`.
const BEADS_COPY_EXCLUDES: [&str; 6] = [
    "*.db",
    "*.db-shm",
    "*.db-wal",
    "*.lock",
    "*.tmp",
    "last-touched",
];

/// How an existing or new worktree was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorktreeMode {
    Created,
    Reused,
    Attached,
}

/// Descriptor for one worktree, persisted in the session state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorktreeHandle {
    pub path: PathBuf,
    pub branch: String,
    pub mode: WorktreeMode,
    /// Branch (or commit) checked out in the main working copy when the
    /// worktree was created; merge-back targets it.
    pub base_branch: String,
}

/// Result of a merge attempt. On `Conflicted` the merge is left in
/// progress so the conflict resolver can inspect index stages; the caller
/// must conclude or abort it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    Merged,
    Conflicted { files: Vec<String> },
}

pub struct WorktreeManager {
    cwd: PathBuf,
    /// Overrides the derived `.ralph-worktrees/<project>` base (used when a
    /// manager is re-rooted into a session worktree but workers must stay
    /// siblings of it).
    root_override: Option<PathBuf>,
    git_lock: Arc<Mutex<()>>,
}

impl Clone for WorktreeManager {
    fn clone(&self) -> Self {
        Self {
            cwd: self.cwd.clone(),
            root_override: self.root_override.clone(),
            git_lock: Arc::clone(&self.git_lock),
        }
    }
}

struct GitOutput {
    code: i32,
    stdout: String,
    stderr: String,
}

impl WorktreeManager {
    /// Open the manager for a working copy. Fails when `cwd` is not inside
    /// a git repository.
    pub async fn new(cwd: impl Into<PathBuf>) -> Result<Self, RalphError> {
        let manager = Self {
            cwd: cwd.into(),
            root_override: None,
            git_lock: Arc::new(Mutex::new(())),
        };
        let probe = manager.run_git(&manager.cwd, &["rev-parse", "--git-dir"]).await?;
        if probe.code != 0 {
            return Err(RalphError::Config(format!(
                "{} is not a git repository",
                manager.cwd.display()
            )));
        }
        Ok(manager)
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    /// Pin the worktree base directory instead of deriving it from `cwd`.
    pub fn with_worktree_root(mut self, root: PathBuf) -> Self {
        self.root_override = Some(root);
        self
    }

    /// `<parent_of_cwd>/.ralph-worktrees/<project>`.
    pub fn worktree_root(&self) -> PathBuf {
        if let Some(root) = &self.root_override {
            return root.clone();
        }
        Self::worktree_root_for(&self.cwd)
    }

    /// The derived worktree base for an arbitrary working copy.
    pub fn worktree_root_for(cwd: &Path) -> PathBuf {
        let project = cwd
            .file_name()
            .and_then(|n| n.to_str())
            .map(sanitize_name)
            .unwrap_or_else(|| "project".to_string());
        cwd.parent()
            .unwrap_or(cwd)
            .join(".ralph-worktrees")
            .join(project)
    }

    pub fn session_branch(name: &str) -> String {
        format!("ralph-session/{name}")
    }

    pub fn worker_branch(name: &str, index: usize) -> String {
        format!("ralph-worker/{name}-{index}")
    }

    async fn run_git(&self, dir: &Path, args: &[&str]) -> Result<GitOutput, RalphError> {
        let child = Command::new("git")
            .args(args)
            .current_dir(dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| RalphError::GitFailed {
                command: args.join(" "),
                code: -1,
                stderr: format!("cannot spawn git: {e}"),
            })?;

        let output = tokio::time::timeout(GIT_TIMEOUT, child.wait_with_output())
            .await
            .map_err(|_| RalphError::GitFailed {
                command: args.join(" "),
                code: -1,
                stderr: format!("timed out after {}s", GIT_TIMEOUT.as_secs()),
            })?
            .map_err(|e| RalphError::GitFailed {
                command: args.join(" "),
                code: -1,
                stderr: e.to_string(),
            })?;

        Ok(GitOutput {
            code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    /// Run git and require success.
    async fn git_ok(&self, dir: &Path, args: &[&str]) -> Result<String, RalphError> {
        let out = self.run_git(dir, args).await?;
        if out.code != 0 {
            return Err(RalphError::GitFailed {
                command: args.join(" "),
                code: out.code,
                stderr: out.stderr.trim().to_string(),
            });
        }
        Ok(out.stdout)
    }

    /// Branch (or commit sha when detached) of the main checkout.
    pub async fn current_branch(&self) -> Result<String, RalphError> {
        let out = self
            .run_git(&self.cwd, &["symbolic-ref", "--short", "-q", "HEAD"])
            .await?;
        if out.code == 0 {
            return Ok(out.stdout.trim().to_string());
        }
        let sha = self.git_ok(&self.cwd, &["rev-parse", "HEAD"]).await?;
        Ok(sha.trim().to_string())
    }

    pub async fn branch_exists(&self, branch: &str) -> Result<bool, RalphError> {
        let reference = format!("refs/heads/{branch}");
        let out = self
            .run_git(&self.cwd, &["rev-parse", "--verify", "-q", &reference])
            .await?;
        Ok(out.code == 0)
    }

    /// `(path, branch)` pairs from `git worktree list --porcelain`.
    async fn list_worktrees(&self) -> Result<Vec<(PathBuf, Option<String>)>, RalphError> {
        let raw = self
            .git_ok(&self.cwd, &["worktree", "list", "--porcelain"])
            .await?;
        Ok(parse_worktree_porcelain(&raw))
    }

    /// Fail fast when the volume holding the worktrees is low on space.
    /// Parsing `df` is the fallback the platform always has; when even that
    /// yields no number, proceed optimistically.
    pub async fn check_disk_space(&self) -> Result<(), RalphError> {
        let target = self
            .cwd
            .parent()
            .unwrap_or(&self.cwd)
            .to_path_buf();
        let available = query_available_mib(&target).await;
        match available {
            Some(mib) if mib < MIN_FREE_MIB => Err(RalphError::DiskPressure {
                available_mib: mib,
                required_mib: MIN_FREE_MIB,
            }),
            Some(_) => Ok(()),
            None => {
                warn!("cannot determine free disk space; proceeding optimistically");
                Ok(())
            }
        }
    }

    /// Create (or re-enter) the session worktree for `name`.
    pub async fn create_session(&self, name: &str) -> Result<WorktreeHandle, RalphError> {
        let _guard = self.git_lock.lock().await;

        self.check_disk_space().await?;

        let root = self.worktree_root();
        std::fs::create_dir_all(&root).map_err(|e| RalphError::Config(format!(
            "cannot create worktree base {}: {e}",
            root.display()
        )))?;

        let branch = Self::session_branch(name);
        let path = root.join(name);
        let base_branch = self.current_branch().await?;

        if self.branch_exists(&branch).await? {
            // Resume: reuse the worktree holding the branch, else attach a
            // fresh one to it.
            for (wt_path, wt_branch) in self.list_worktrees().await? {
                if wt_branch.as_deref() == Some(branch.as_str()) {
                    info!(path = %wt_path.display(), %branch, "reusing session worktree");
                    return Ok(WorktreeHandle {
                        path: wt_path,
                        branch,
                        mode: WorktreeMode::Reused,
                        base_branch,
                    });
                }
            }
            self.clear_stale_path(&path).await;
            let path_str = path.to_string_lossy().to_string();
            self.git_ok(&self.cwd, &["worktree", "add", &path_str, &branch])
                .await?;
            info!(path = %path.display(), %branch, "attached worktree to existing branch");
            return Ok(WorktreeHandle {
                path,
                branch,
                mode: WorktreeMode::Attached,
                base_branch,
            });
        }

        self.clear_stale_path(&path).await;
        let path_str = path.to_string_lossy().to_string();
        self.git_ok(
            &self.cwd,
            &["worktree", "add", "-b", &branch, &path_str],
        )
        .await?;
        info!(path = %path.display(), %branch, "created session worktree");
        Ok(WorktreeHandle {
            path,
            branch,
            mode: WorktreeMode::Created,
            base_branch,
        })
    }

    /// Create a worker worktree branched off the session branch. Workers
    /// are never resumed; a leftover branch from a crashed run is deleted
    /// first.
    pub async fn create_worker(
        &self,
        session: &WorktreeHandle,
        name: &str,
        index: usize,
    ) -> Result<WorktreeHandle, RalphError> {
        let _guard = self.git_lock.lock().await;

        let branch = Self::worker_branch(name, index);
        let path = self.worktree_root().join(format!("{name}-worker-{index}"));

        self.clear_stale_path(&path).await;
        if self.branch_exists(&branch).await? {
            self.git_ok(&self.cwd, &["branch", "-D", &branch]).await?;
        }

        let path_str = path.to_string_lossy().to_string();
        self.git_ok(
            &self.cwd,
            &["worktree", "add", "-b", &branch, &path_str, &session.branch],
        )
        .await?;
        Ok(WorktreeHandle {
            path,
            branch,
            mode: WorktreeMode::Created,
            base_branch: session.branch.clone(),
        })
    }

    /// Force-remove whatever occupies `path`, then prune bookkeeping.
    async fn clear_stale_path(&self, path: &Path) {
        if !path.exists() {
            return;
        }
        warn!(path = %path.display(), "clearing stale worktree path");
        let path_str = path.to_string_lossy().to_string();
        let removed = self
            .run_git(&self.cwd, &["worktree", "remove", "--force", &path_str])
            .await
            .map(|o| o.code == 0)
            .unwrap_or(false);
        if !removed {
            let _ = std::fs::remove_dir_all(path);
        }
        let _ = self.run_git(&self.cwd, &["worktree", "prune"]).await;
    }

    /// Merge `branch` into the checkout at `target_dir`: fast-forward when
    /// possible, merge commit otherwise. On conflict the merge is left in
    /// progress and the conflicted paths are returned.
    pub async fn merge_branch_into(
        &self,
        target_dir: &Path,
        branch: &str,
    ) -> Result<MergeOutcome, RalphError> {
        let _guard = self.git_lock.lock().await;

        let ff = self
            .run_git(target_dir, &["merge", "--ff-only", branch])
            .await?;
        if ff.code == 0 {
            return Ok(MergeOutcome::Merged);
        }

        let merge = self
            .run_git(target_dir, &["merge", "--no-edit", branch])
            .await?;
        if merge.code == 0 {
            return Ok(MergeOutcome::Merged);
        }

        let noise = format!("{}\n{}", merge.stdout, merge.stderr);
        if noise.contains("CONFLICT") || noise.contains("Automatic merge failed") {
            let files = self.conflicted_files(target_dir).await?;
            return Ok(MergeOutcome::Conflicted { files });
        }

        Err(RalphError::GitFailed {
            command: format!("merge --no-edit {branch}"),
            code: merge.code,
            stderr: merge.stderr.trim().to_string(),
        })
    }

    /// Paths with unresolved index stages in an in-progress merge.
    pub async fn conflicted_files(&self, dir: &Path) -> Result<Vec<String>, RalphError> {
        let raw = self
            .git_ok(dir, &["diff", "--name-only", "--diff-filter=U"])
            .await?;
        Ok(raw.lines().map(str::to_string).collect())
    }

    /// Content of one index stage (1 = base, 2 = ours, 3 = theirs) for a
    /// conflicted path. `Ok(None)` when the stage is absent (e.g. the file
    /// did not exist on the base).
    pub async fn show_index_stage(
        &self,
        dir: &Path,
        stage: u8,
        path: &str,
    ) -> Result<Option<String>, RalphError> {
        let spec = format!(":{stage}:{path}");
        let out = self.run_git(dir, &["show", &spec]).await?;
        if out.code == 0 {
            Ok(Some(out.stdout))
        } else {
            Ok(None)
        }
    }

    pub async fn stage_file(&self, dir: &Path, path: &str) -> Result<(), RalphError> {
        self.git_ok(dir, &["add", "--", path]).await.map(|_| ())
    }

    /// Conclude an in-progress merge once every conflict is staged.
    pub async fn conclude_merge(&self, dir: &Path) -> Result<(), RalphError> {
        self.git_ok(dir, &["commit", "--no-edit"]).await.map(|_| ())
    }

    pub async fn abort_merge(&self, dir: &Path) -> Result<(), RalphError> {
        self.git_ok(dir, &["merge", "--abort"]).await.map(|_| ())
    }

    /// Merge the session branch back into the branch the session started
    /// from. On `Conflicted` the merge is left in progress in the main
    /// checkout.
    pub async fn merge_back(&self, handle: &WorktreeHandle) -> Result<MergeOutcome, RalphError> {
        {
            let _guard = self.git_lock.lock().await;
            self.git_ok(&self.cwd, &["checkout", &handle.base_branch])
                .await?;
        }
        self.merge_branch_into(&self.cwd, &handle.branch).await
    }

    /// Operator guidance printed when a merge-back is preserved for manual
    /// resolution.
    pub fn manual_merge_instructions(&self, handle: &WorktreeHandle) -> String {
        format!(
            "Merge of {branch} into {base} has conflicts.\n\
             The worktree and branch were preserved:\n\
             worktree: {path}\n\
             To finish manually:\n\
             cd {cwd}\n\
             git merge {branch}\n\
             # resolve conflicts, then\n\
             git worktree remove {path}\n\
             git branch -d {branch}",
            branch = handle.branch,
            base = handle.base_branch,
            path = handle.path.display(),
            cwd = self.cwd.display(),
        )
    }

    /// Copy `.ralph-tui/iterations/*.log` out of a worktree into the main
    /// working copy, never overwriting existing files.
    pub fn preserve_iteration_logs(&self, worktree_path: &Path) -> std::io::Result<usize> {
        let src = worktree_path.join(".ralph-tui/iterations");
        if !src.is_dir() {
            return Ok(0);
        }
        let dst = self.cwd.join(".ralph-tui/iterations");
        std::fs::create_dir_all(&dst)?;
        let mut copied = 0;
        for entry in std::fs::read_dir(&src)? {
            let entry = entry?;
            let name = entry.file_name();
            let is_log = Path::new(&name)
                .extension()
                .map(|e| e == "log")
                .unwrap_or(false);
            if !is_log {
                continue;
            }
            let target = dst.join(&name);
            if target.exists() {
                continue;
            }
            std::fs::copy(entry.path(), &target)?;
            copied += 1;
        }
        Ok(copied)
    }

    /// Remove a merged worktree: preserve logs, remove the checkout, delete
    /// the branch, prune empty parents. Only called after a successful
    /// merge; failures preserve everything (invariant).
    pub async fn cleanup_after_merge(&self, handle: &WorktreeHandle) -> Result<(), RalphError> {
        if let Err(e) = self.preserve_iteration_logs(&handle.path) {
            warn!("could not preserve iteration logs: {e}");
        }

        let _guard = self.git_lock.lock().await;
        let path_str = handle.path.to_string_lossy().to_string();
        let removed = self
            .run_git(&self.cwd, &["worktree", "remove", "--force", &path_str])
            .await?;
        if removed.code != 0 && handle.path.exists() {
            let _ = std::fs::remove_dir_all(&handle.path);
            let _ = self.run_git(&self.cwd, &["worktree", "prune"]).await;
        }
        self.git_ok(&self.cwd, &["branch", "-D", &handle.branch])
            .await?;

        prune_empty_parents(&handle.path);
        Ok(())
    }

    /// Copy the `.ralph-tui/config.*` file into a worktree, if one exists.
    pub fn propagate_config(&self, dest: &Path) -> std::io::Result<()> {
        let Some(src) = crate::ralph_config::RalphConfig::find_config_file(&self.cwd) else {
            return Ok(());
        };
        let dest_dir = dest.join(".ralph-tui");
        std::fs::create_dir_all(&dest_dir)?;
        let name = src.file_name().expect("config file has a name");
        std::fs::copy(&src, dest_dir.join(name))?;
        Ok(())
    }

    /// Copy tracker data into a worktree.
    ///
    /// Bead sources flush their store first, then `.beads/` is copied
    /// minus database/lock artifacts. A JSON PRD inside the cwd keeps its
    /// relative path; one outside the cwd is rebased under
    /// `.ralph-tui/external-prd/` and the source file is never written
    /// through. Returns the PRD path the worktree should use, when the
    /// tracker has one.
    pub async fn propagate_tracker_data(
        &self,
        dest: &Path,
        tracker_id: &str,
        options: &TrackerOptions,
    ) -> Result<Option<PathBuf>, RalphError> {
        match tracker_id {
            "beads" | "beads-rust" | "beads-bv" => {
                let binary = match tracker_id {
                    "beads" => "bd",
                    "beads-rust" => "br",
                    _ => "bv",
                };
                self.flush_beads(binary).await;
                let src = self.cwd.join(".beads");
                if src.is_dir() {
                    copy_dir_filtered(&src, &dest.join(".beads"), &BEADS_COPY_EXCLUDES)
                        .map_err(|e| RalphError::Config(format!(
                            "cannot copy .beads into worktree: {e}"
                        )))?;
                }
                Ok(None)
            }
            "json" => {
                let Some(prd) = &options.path else {
                    return Ok(None);
                };
                let prd = if prd.is_absolute() {
                    prd.clone()
                } else {
                    self.cwd.join(prd)
                };
                let rebased = rebase_prd_into_worktree(&self.cwd, dest, &prd)?;
                Ok(Some(rebased))
            }
            _ => Ok(None),
        }
    }

    async fn flush_beads(&self, binary: &str) {
        let mut command = Command::new(binary);
        command
            .args(["sync", "--flush-only"])
            .current_dir(&self.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        match tokio::time::timeout(GIT_TIMEOUT, command.status()).await {
            Ok(Ok(status)) if status.success() => {}
            Ok(Ok(status)) => warn!("{} sync --flush-only exited with {}", binary, status),
            Ok(Err(e)) => warn!("{} sync --flush-only failed to run: {}", binary, e),
            Err(_) => warn!("{} sync --flush-only timed out", binary),
        }
    }
}

/// Copy the PRD into the worktree. Inside-cwd paths keep their relative
/// location; outside paths land under `.ralph-tui/external-prd/` with a
/// content-address suffix so distinct sources cannot collide.
fn rebase_prd_into_worktree(
    cwd: &Path,
    worktree: &Path,
    prd: &Path,
) -> Result<PathBuf, RalphError> {
    let read_err = |e: std::io::Error| {
        RalphError::TrackerUnavailable(format!("cannot read PRD {}: {e}", prd.display()))
    };
    let bytes = std::fs::read(prd).map_err(read_err)?;

    let target = match prd.strip_prefix(cwd) {
        Ok(relative) => worktree.join(relative),
        Err(_) => {
            use sha1::{Digest, Sha1};
            let digest = format!("{:x}", Sha1::digest(prd.to_string_lossy().as_bytes()));
            let stem = prd
                .file_stem()
                .and_then(|s| s.to_str())
                .map(sanitize_name)
                .unwrap_or_else(|| "prd".to_string());
            let ext = prd
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| format!(".{e}"))
                .unwrap_or_default();
            let rebased = worktree
                .join(".ralph-tui/external-prd")
                .join(format!("{stem}-{}{ext}", &digest[..8]));
            info!("JSON PRD rebased into worktree: {}", rebased.display());
            rebased
        }
    };

    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            RalphError::Config(format!("cannot create {}: {e}", parent.display()))
        })?;
    }
    std::fs::write(&target, &bytes).map_err(|e| {
        RalphError::Config(format!("cannot write {}: {e}", target.display()))
    })?;
    Ok(target)
}

/// Recursive copy skipping glob-matched names.
fn copy_dir_filtered(src: &Path, dst: &Path, excludes: &[&str]) -> std::io::Result<()> {
    let patterns: Vec<glob::Pattern> = excludes
        .iter()
        .filter_map(|p| glob::Pattern::new(p).ok())
        .collect();
    copy_dir_inner(src, dst, &patterns)
}

fn copy_dir_inner(src: &Path, dst: &Path, excludes: &[glob::Pattern]) -> std::io::Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let name = entry.file_name();
        let name_str = name.to_string_lossy();
        if excludes.iter().any(|p| p.matches(&name_str)) {
            continue;
        }
        let target = dst.join(&name);
        if entry.file_type()?.is_dir() {
            copy_dir_inner(&entry.path(), &target, excludes)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Remove now-empty ancestors up to and including `.ralph-worktrees`.
fn prune_empty_parents(worktree_path: &Path) {
    let mut current = worktree_path.parent();
    while let Some(dir) = current {
        let is_ours = dir
            .file_name()
            .map(|n| n == ".ralph-worktrees")
            .unwrap_or(false)
            || dir
                .parent()
                .and_then(|p| p.file_name())
                .map(|n| n == ".ralph-worktrees")
                .unwrap_or(false);
        if !is_ours {
            break;
        }
        if std::fs::remove_dir(dir).is_err() {
            break;
        }
        current = dir.parent();
    }
}

fn parse_worktree_porcelain(raw: &str) -> Vec<(PathBuf, Option<String>)> {
    let mut result = Vec::new();
    let mut path: Option<PathBuf> = None;
    let mut branch: Option<String> = None;
    for line in raw.lines().chain(std::iter::once("")) {
        if line.is_empty() {
            if let Some(p) = path.take() {
                result.push((p, branch.take()));
            }
            branch = None;
            continue;
        }
        if let Some(rest) = line.strip_prefix("worktree ") {
            path = Some(PathBuf::from(rest));
        } else if let Some(rest) = line.strip_prefix("branch ") {
            branch = Some(
                rest.strip_prefix("refs/heads/")
                    .unwrap_or(rest)
                    .to_string(),
            );
        }
    }
    result
}

/// Available MiB on the volume holding `path`, from `df -Pk`.
async fn query_available_mib(path: &Path) -> Option<u64> {
    let output = Command::new("df")
        .arg("-Pk")
        .arg(path)
        .stdin(Stdio::null())
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout);
    let line = text.lines().nth(1)?;
    let avail_kib: u64 = line.split_whitespace().nth(3)?.parse().ok()?;
    Some(avail_kib / 1024)
}
