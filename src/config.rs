//! Runtime configuration.
//!
//! Bridges the file-level [`RalphConfig`] with CLI flags and resolves the
//! paths the orchestrator works with. CLI flags win over file values.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};

use crate::errors::RalphError;
use crate::ralph_config::RalphConfig;

/// CLI-level overrides applied on top of the config file.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub tracker: Option<String>,
    pub agent: Option<String>,
    pub prd: Option<PathBuf>,
    pub epic: Option<String>,
    pub model: Option<String>,
    pub iterations: Option<u32>,
    pub parallel: Option<usize>,
    /// `Some(None)` = `--worktree`, `Some(Some(name))` = `--worktree name`.
    pub worktree: Option<Option<String>>,
    pub headless: bool,
    pub force: bool,
}

/// Resolved runtime configuration for one session.
#[derive(Debug, Clone)]
pub struct Config {
    /// Canonicalized working directory.
    pub cwd: PathBuf,
    /// `<cwd>/.ralph-tui`.
    pub ralph_dir: PathBuf,
    /// `<cwd>/.ralph-tui/iterations`.
    pub iterations_dir: PathBuf,
    /// `<cwd>/.ralph-tui/session.json`.
    pub session_file: PathBuf,
    /// `<cwd>/.ralph-tui/ralph.lock`.
    pub lock_file: PathBuf,
    /// Effective file config after CLI overrides.
    pub file: RalphConfig,
    /// Model requested at CLI level (`--model`), distinct from per-task hints.
    pub cli_model: Option<String>,
    /// Custom session-worktree name from `--worktree <name>`.
    pub worktree_name: Option<String>,
    pub headless: bool,
    pub force: bool,
}

impl Config {
    pub fn new(cwd: PathBuf, overrides: CliOverrides) -> Result<Self, RalphError> {
        let cwd = cwd
            .canonicalize()
            .map_err(|e| RalphError::Config(format!("cannot resolve cwd: {}", e)))?;

        let mut file = RalphConfig::load(&cwd)?;

        if let Some(tracker) = overrides.tracker {
            file.tracker = tracker;
        }
        if let Some(agent) = overrides.agent {
            file.agent = agent;
        }
        if let Some(prd) = overrides.prd {
            file.tracker_options.path = Some(prd);
        }
        if let Some(epic) = overrides.epic {
            file.tracker_options.epic_id = Some(epic);
        }
        if let Some(iterations) = overrides.iterations {
            file.max_iterations = iterations;
        }
        if let Some(parallel) = overrides.parallel {
            file.parallel = parallel;
        }
        let mut worktree_name = None;
        if let Some(wt) = overrides.worktree {
            file.worktree = true;
            worktree_name = wt;
        }
        let cli_model = overrides.model.or_else(|| file.agent_options.model.clone());

        file.validate()?;

        let ralph_dir = cwd.join(".ralph-tui");
        Ok(Self {
            iterations_dir: ralph_dir.join("iterations"),
            session_file: ralph_dir.join("session.json"),
            lock_file: ralph_dir.join("ralph.lock"),
            ralph_dir,
            cwd,
            file,
            cli_model,
            worktree_name,
            headless: overrides.headless,
            force: overrides.force,
        })
    }

    /// Create the on-disk state layout if missing.
    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.iterations_dir)
            .context("Failed to create iterations directory")?;
        Ok(())
    }

    /// Re-root this configuration into another checkout of the same project
    /// (a session or worker worktree).
    pub fn rebased_into(&self, new_cwd: &Path) -> Self {
        let ralph_dir = new_cwd.join(".ralph-tui");
        Self {
            cwd: new_cwd.to_path_buf(),
            iterations_dir: ralph_dir.join("iterations"),
            session_file: ralph_dir.join("session.json"),
            lock_file: ralph_dir.join("ralph.lock"),
            ralph_dir,
            file: self.file.clone(),
            cli_model: self.cli_model.clone(),
            worktree_name: self.worktree_name.clone(),
            headless: self.headless,
            force: self.force,
        }
    }

    /// Stable digest of the effective configuration, persisted in the
    /// session state to detect config drift across resumes.
    pub fn fingerprint(&self) -> String {
        let serialized =
            serde_json::to_string(&self.file).unwrap_or_else(|_| String::from("unserializable"));
        let digest = Sha256::digest(serialized.as_bytes());
        format!("{:x}", digest)[..16].to_string()
    }

    /// PRD path resolved against the cwd (json tracker only).
    pub fn prd_path(&self) -> Option<PathBuf> {
        self.file.tracker_options.path.as_ref().map(|p| {
            if p.is_absolute() {
                p.clone()
            } else {
                self.cwd.join(p)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn cli_overrides_win_over_file() {
        let dir = tempdir().unwrap();
        let ralph_dir = dir.path().join(".ralph-tui");
        fs::create_dir_all(&ralph_dir).unwrap();
        fs::write(
            ralph_dir.join("config.toml"),
            "tracker = \"beads\"\nmaxIterations = 10\n",
        )
        .unwrap();

        let config = Config::new(
            dir.path().to_path_buf(),
            CliOverrides {
                tracker: Some("json".into()),
                iterations: Some(3),
                ..Default::default()
            },
        )
        .unwrap();

        assert_eq!(config.file.tracker, "json");
        assert_eq!(config.file.max_iterations, 3);
    }

    #[test]
    fn worktree_flag_enables_and_names() {
        let dir = tempdir().unwrap();
        let config = Config::new(
            dir.path().to_path_buf(),
            CliOverrides {
                worktree: Some(Some("feature-x".into())),
                ..Default::default()
            },
        )
        .unwrap();
        assert!(config.file.worktree);
        assert_eq!(config.worktree_name.as_deref(), Some("feature-x"));
    }

    #[test]
    fn paths_are_rooted_in_ralph_dir() {
        let dir = tempdir().unwrap();
        let config = Config::new(dir.path().to_path_buf(), CliOverrides::default()).unwrap();
        assert!(config.session_file.ends_with(".ralph-tui/session.json"));
        assert!(config.lock_file.ends_with(".ralph-tui/ralph.lock"));
        assert!(config.iterations_dir.ends_with(".ralph-tui/iterations"));
    }

    #[test]
    fn fingerprint_is_stable_and_sensitive() {
        let dir = tempdir().unwrap();
        let a = Config::new(dir.path().to_path_buf(), CliOverrides::default()).unwrap();
        let b = Config::new(dir.path().to_path_buf(), CliOverrides::default()).unwrap();
        assert_eq!(a.fingerprint(), b.fingerprint());

        let c = Config::new(
            dir.path().to_path_buf(),
            CliOverrides {
                iterations: Some(99),
                ..Default::default()
            },
        )
        .unwrap();
        assert_ne!(a.fingerprint(), c.fingerprint());
    }

    #[test]
    fn rebased_config_points_into_new_cwd() {
        let dir = tempdir().unwrap();
        let other = tempdir().unwrap();
        let config = Config::new(dir.path().to_path_buf(), CliOverrides::default()).unwrap();
        let moved = config.rebased_into(other.path());
        assert!(moved.session_file.starts_with(other.path()));
        assert_eq!(moved.file.max_iterations, config.file.max_iterations);
    }

    #[test]
    fn relative_prd_resolves_against_cwd() {
        let dir = tempdir().unwrap();
        let config = Config::new(
            dir.path().to_path_buf(),
            CliOverrides {
                prd: Some(PathBuf::from("prd.json")),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(config.prd_path().unwrap(), config.cwd.join("prd.json"));
    }
}
