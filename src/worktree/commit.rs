//! Iteration-boundary commits.
//!
//! Every iteration that touched the tree commits before the next one
//! begins; an uncommitted tree at an iteration boundary is a fatal error.
//! This is the one place the repository is driven through libgit2 instead
//! of a subprocess: staging + committing needs no timeout and benefits
//! from the unborn-branch handling.

use std::path::Path;

use anyhow::{Context, Result};
use git2::{Repository, Signature, StatusOptions};

pub struct RepoCommitter {
    repo: Repository,
}

impl RepoCommitter {
    pub fn new(workdir: &Path) -> Result<Self> {
        let repo = Repository::open(workdir).context("Failed to open git repository")?;
        Ok(Self { repo })
    }

    fn signature(&self) -> Result<Signature<'static>> {
        Ok(Signature::now("ralph-tui", "ralph-tui@localhost")?)
    }

    fn head_commit(&self) -> Option<git2::Commit<'_>> {
        self.repo
            .head()
            .ok()
            .and_then(|head| head.peel_to_commit().ok())
    }

    /// Whether the working tree differs from HEAD (untracked files count).
    /// The orchestrator's own `.ralph-tui/` state directory is never
    /// project work and is ignored here and by `commit_all`.
    pub fn has_uncommitted_changes(&self) -> Result<bool> {
        self.has_uncommitted_changes_excluding(&[])
    }

    /// Like [`Self::has_uncommitted_changes`], additionally ignoring the
    /// given repo-relative paths (the tracker's own PRD writes, which land
    /// after the commit step by design).
    pub fn has_uncommitted_changes_excluding(&self, exclude: &[&str]) -> Result<bool> {
        let mut options = StatusOptions::new();
        options.include_untracked(true).include_ignored(false);
        options.recurse_untracked_dirs(true);
        let statuses = self.repo.statuses(Some(&mut options))?;
        Ok(statuses.iter().any(|entry| {
            entry
                .path()
                .map(|p| !is_state_path(p) && !exclude.contains(&p))
                .unwrap_or(true)
        }))
    }

    /// Stage everything outside `.ralph-tui/` and commit. Returns the
    /// commit sha, or `None` when the tree is clean and there is nothing
    /// to record.
    pub fn commit_all(&self, message: &str) -> Result<Option<String>> {
        if !self.has_uncommitted_changes()? {
            return Ok(None);
        }

        let mut index = self.repo.index()?;
        let mut skip_state = |path: &Path, _spec: &[u8]| -> i32 {
            if is_state_path(&path.to_string_lossy()) {
                1
            } else {
                0
            }
        };
        index.add_all(
            ["*"].iter(),
            git2::IndexAddOption::DEFAULT,
            Some(&mut skip_state),
        )?;
        index.write()?;

        let tree_id = index.write_tree()?;
        let tree = self.repo.find_tree(tree_id)?;
        let sig = self.signature()?;

        let commit_id = if let Some(parent) = self.head_commit() {
            if parent.tree_id() == tree_id {
                // Status noise without content change (e.g. mode churn).
                return Ok(None);
            }
            self.repo
                .commit(Some("HEAD"), &sig, &sig, message, &tree, &[&parent])?
        } else {
            // Unborn branch: first commit of the repository.
            self.repo
                .commit(Some("HEAD"), &sig, &sig, message, &tree, &[])?
        };

        Ok(Some(commit_id.to_string()))
    }
}

/// Orchestrator state lives under `.ralph-tui/` and stays out of project
/// history; it propagates between checkouts by copy, never by merge.
fn is_state_path(path: &str) -> bool {
    path == ".ralph-tui" || path.starts_with(".ralph-tui/")
}

/// Render the commit message template. Placeholders: `{task_id}`,
/// `{task_title}`.
pub fn render_commit_message(template: &str, task_id: &str, task_title: &str) -> String {
    template
        .replace("{task_id}", task_id)
        .replace("{task_title}", task_title)
}

#[cfg(test)]
mod tests {
    use super::*;
    use git2::Repository;
    use std::fs;
    use tempfile::tempdir;

    fn setup_repo() -> (RepoCommitter, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        let mut config = repo.config().unwrap();
        config.set_str("user.name", "test").unwrap();
        config.set_str("user.email", "test@test.com").unwrap();
        drop(config);
        let committer = RepoCommitter::new(dir.path()).unwrap();
        (committer, dir)
    }

    #[test]
    fn clean_tree_has_no_changes_and_no_commit() {
        let (committer, dir) = setup_repo();
        fs::write(dir.path().join("a.txt"), "one\n").unwrap();
        committer.commit_all("init").unwrap().unwrap();

        assert!(!committer.has_uncommitted_changes().unwrap());
        assert!(committer.commit_all("noop").unwrap().is_none());
    }

    #[test]
    fn commits_on_unborn_branch() {
        let (committer, dir) = setup_repo();
        fs::write(dir.path().join("first.txt"), "hello\n").unwrap();
        let sha = committer.commit_all("feat: [T-1] - first").unwrap();
        assert!(sha.is_some());
        assert_eq!(sha.unwrap().len(), 40);
    }

    #[test]
    fn detects_untracked_files() {
        let (committer, dir) = setup_repo();
        fs::write(dir.path().join("a.txt"), "one\n").unwrap();
        committer.commit_all("init").unwrap();

        fs::write(dir.path().join("b.txt"), "two\n").unwrap();
        assert!(committer.has_uncommitted_changes().unwrap());
        let sha = committer.commit_all("feat: [T-2] - add b").unwrap();
        assert!(sha.is_some());
        assert!(!committer.has_uncommitted_changes().unwrap());
    }

    #[test]
    fn detects_modified_files() {
        let (committer, dir) = setup_repo();
        fs::write(dir.path().join("a.txt"), "one\n").unwrap();
        committer.commit_all("init").unwrap();

        fs::write(dir.path().join("a.txt"), "one\ntwo\n").unwrap();
        assert!(committer.has_uncommitted_changes().unwrap());
    }

    #[test]
    fn state_directory_is_invisible_to_commits() {
        let (committer, dir) = setup_repo();
        fs::write(dir.path().join("code.txt"), "work\n").unwrap();
        committer.commit_all("init").unwrap().unwrap();

        fs::create_dir_all(dir.path().join(".ralph-tui/iterations")).unwrap();
        fs::write(dir.path().join(".ralph-tui/session.json"), "{}\n").unwrap();
        fs::write(dir.path().join(".ralph-tui/iterations/1-x.log"), "{}\n").unwrap();

        assert!(!committer.has_uncommitted_changes().unwrap());
        assert!(committer.commit_all("noop").unwrap().is_none());

        // Project files still commit while state stays untracked.
        fs::write(dir.path().join("more.txt"), "more\n").unwrap();
        assert!(committer.has_uncommitted_changes().unwrap());
        let sha = committer.commit_all("feat: [T-3] - more").unwrap();
        assert!(sha.is_some());
    }

    #[test]
    fn commit_message_template_renders() {
        assert_eq!(
            render_commit_message("feat: [{task_id}] - {task_title}", "TEST-004", "Merge A and B"),
            "feat: [TEST-004] - Merge A and B"
        );
        assert_eq!(
            render_commit_message("{task_title} ({task_id})", "X-1", "thing"),
            "thing (X-1)"
        );
    }
}
