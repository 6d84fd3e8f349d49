//! File-level configuration: `.ralph-tui/config.{toml,yaml,yml}`.
//!
//! One serde model backs both formats. Keys are camelCase to match the
//! on-disk format. Every section has serde defaults so a partial file (or
//! no file at all) yields a usable configuration.
//!
//! ```toml
//! configVersion = 1
//! agent = "claude"
//! tracker = "json"
//! maxIterations = 50
//! iterationDelay = 1
//! parallel = 3
//! worktree = true
//!
//! [trackerOptions]
//! path = "prd.json"
//!
//! [errorHandling]
//! strategy = "retry"
//! maxRetries = 2
//! retryDelayMs = 5000
//!
//! [agentOptions]
//! model = "claude-sonnet-4"
//! timeout = 900
//! envExclude = ["MY_TOKEN*"]
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::RalphError;

/// How the iteration engine reacts to a failed iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorStrategy {
    /// Mark the task failed for this session and move on.
    Skip,
    /// Re-run the same task up to `maxRetries` with increasing delay.
    #[default]
    Retry,
    /// End the session with a fatal error.
    Abort,
}

impl std::fmt::Display for ErrorStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorStrategy::Skip => write!(f, "skip"),
            ErrorStrategy::Retry => write!(f, "retry"),
            ErrorStrategy::Abort => write!(f, "abort"),
        }
    }
}

impl std::str::FromStr for ErrorStrategy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "skip" => Ok(ErrorStrategy::Skip),
            "retry" => Ok(ErrorStrategy::Retry),
            "abort" => Ok(ErrorStrategy::Abort),
            _ => anyhow::bail!("Invalid error strategy '{}'. Valid values: skip, retry, abort", s),
        }
    }
}

/// `errorHandling` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorHandlingConfig {
    #[serde(default)]
    pub strategy: ErrorStrategy,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default)]
    pub continue_on_non_zero_exit: bool,
}

fn default_max_retries() -> u32 {
    2
}

fn default_retry_delay_ms() -> u64 {
    5_000
}

impl Default for ErrorHandlingConfig {
    fn default() -> Self {
        Self {
            strategy: ErrorStrategy::default(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            continue_on_non_zero_exit: false,
        }
    }
}

/// `conflictResolution` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictResolutionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,
    #[serde(default = "default_conflict_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_conflict_max_files")]
    pub max_files: usize,
}

fn default_true() -> bool {
    true
}

fn default_confidence_threshold() -> f64 {
    0.7
}

fn default_conflict_timeout_ms() -> u64 {
    120_000
}

fn default_conflict_max_files() -> usize {
    10
}

impl Default for ConflictResolutionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            confidence_threshold: default_confidence_threshold(),
            timeout_ms: default_conflict_timeout_ms(),
            max_files: default_conflict_max_files(),
        }
    }
}

/// `agentOptions` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentOptions {
    /// Session-level model, overridden per task, overriding the agent default.
    #[serde(default)]
    pub model: Option<String>,
    /// Per-invocation timeout in seconds.
    #[serde(default = "default_agent_timeout_secs")]
    pub timeout: u64,
    /// Additional environment deny patterns (glob).
    #[serde(default)]
    pub env_exclude: Vec<String>,
    /// Patterns exempt from the deny list (glob).
    #[serde(default)]
    pub env_passthrough: Vec<String>,
    /// Extra flags appended by the user, before engine-injected flags.
    #[serde(default)]
    pub default_flags: Vec<String>,
}

fn default_agent_timeout_secs() -> u64 {
    900
}

/// `trackerOptions` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackerOptions {
    /// PRD file path (json tracker).
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Epic id (bead-based trackers).
    #[serde(default)]
    pub epic_id: Option<String>,
}

/// `sandbox` section. Parsed and recorded; the process-level sandbox
/// wrapper is an external collaborator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub allow_paths: Vec<PathBuf>,
    #[serde(default)]
    pub read_only_paths: Vec<PathBuf>,
    #[serde(default = "default_true")]
    pub network: bool,
}

/// The full configuration file model.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RalphConfig {
    #[serde(default = "default_config_version")]
    pub config_version: u32,
    /// Agent plugin id (default "claude").
    #[serde(default = "default_agent")]
    pub agent: String,
    /// Command line for the `custom` agent.
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Seconds slept between iterations.
    #[serde(default = "default_iteration_delay")]
    pub iteration_delay: u64,
    #[serde(default = "default_true")]
    pub auto_commit: bool,
    /// Tracker plugin id (default "json").
    #[serde(default = "default_tracker")]
    pub tracker: String,
    #[serde(default)]
    pub tracker_options: TrackerOptions,
    #[serde(default = "default_parallel")]
    pub parallel: usize,
    /// Run inside a session worktree.
    #[serde(default)]
    pub worktree: bool,
    #[serde(default = "default_commit_message_template")]
    pub commit_message_template: String,
    #[serde(default)]
    pub error_handling: ErrorHandlingConfig,
    #[serde(default)]
    pub conflict_resolution: ConflictResolutionConfig,
    #[serde(default)]
    pub agent_options: AgentOptions,
    #[serde(default)]
    pub sandbox: SandboxConfig,
}

fn default_config_version() -> u32 {
    1
}

fn default_agent() -> String {
    "claude".to_string()
}

fn default_tracker() -> String {
    "json".to_string()
}

fn default_max_iterations() -> u32 {
    50
}

fn default_iteration_delay() -> u64 {
    1
}

fn default_parallel() -> usize {
    1
}

fn default_commit_message_template() -> String {
    "feat: [{task_id}] - {task_title}".to_string()
}

impl Default for RalphConfig {
    fn default() -> Self {
        // An empty TOML document deserializes to all serde defaults.
        toml::from_str("").expect("empty config must deserialize")
    }
}

/// Candidate config file names inside `.ralph-tui/`, checked in order.
pub const CONFIG_FILE_NAMES: [&str; 3] = ["config.toml", "config.yaml", "config.yml"];

impl RalphConfig {
    /// Locate the config file for a working directory, if any.
    pub fn find_config_file(cwd: &Path) -> Option<PathBuf> {
        let dir = cwd.join(".ralph-tui");
        CONFIG_FILE_NAMES
            .iter()
            .map(|name| dir.join(name))
            .find(|p| p.exists())
    }

    /// Load the config from a working directory, falling back to defaults
    /// when no file exists. Malformed files are a [`RalphError::Config`].
    pub fn load(cwd: &Path) -> Result<Self, RalphError> {
        match Self::find_config_file(cwd) {
            Some(path) => Self::load_file(&path),
            None => Ok(Self::default()),
        }
    }

    /// Parse one concrete config file, dispatching on extension.
    pub fn load_file(path: &Path) -> Result<Self, RalphError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| RalphError::Config(format!("cannot read {}: {}", path.display(), e)))?;

        let parsed = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => toml::from_str::<RalphConfig>(&content)
                .map_err(|e| RalphError::Config(format!("invalid {}: {}", path.display(), e)))?,
            Some("yaml") | Some("yml") => serde_yaml::from_str::<RalphConfig>(&content)
                .map_err(|e| RalphError::Config(format!("invalid {}: {}", path.display(), e)))?,
            other => {
                return Err(RalphError::Config(format!(
                    "unsupported config extension {:?} for {}",
                    other,
                    path.display()
                )))
            }
        };

        parsed.validate()?;
        Ok(parsed)
    }

    /// Reject ids the registries cannot resolve and out-of-range values.
    pub fn validate(&self) -> Result<(), RalphError> {
        const TRACKERS: [&str; 4] = ["json", "beads", "beads-rust", "beads-bv"];
        const AGENTS: [&str; 2] = ["claude", "custom"];

        if !TRACKERS.contains(&self.tracker.as_str()) {
            return Err(RalphError::Config(format!(
                "unknown tracker '{}' (expected one of: {})",
                self.tracker,
                TRACKERS.join(", ")
            )));
        }
        if !AGENTS.contains(&self.agent.as_str()) {
            return Err(RalphError::Config(format!(
                "unknown agent '{}' (expected one of: {})",
                self.agent,
                AGENTS.join(", ")
            )));
        }
        if self.agent == "custom" && self.command.is_none() {
            return Err(RalphError::Config(
                "agent 'custom' requires the `command` key".to_string(),
            ));
        }
        if self.parallel == 0 {
            return Err(RalphError::Config("`parallel` must be >= 1".to_string()));
        }
        if !(0.0..=1.0).contains(&self.conflict_resolution.confidence_threshold) {
            return Err(RalphError::Config(
                "conflictResolution.confidenceThreshold must be within [0, 1]".to_string(),
            ));
        }
        Ok(())
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn defaults_are_sensible() {
        let config = RalphConfig::default();
        assert_eq!(config.agent, "claude");
        assert_eq!(config.tracker, "json");
        assert_eq!(config.max_iterations, 50);
        assert_eq!(config.parallel, 1);
        assert!(config.auto_commit);
        assert!(config.conflict_resolution.enabled);
        assert_eq!(config.conflict_resolution.max_files, 10);
        assert_eq!(config.agent_options.timeout, 900);
        assert_eq!(config.error_handling.strategy, ErrorStrategy::Retry);
    }

    #[test]
    fn load_without_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let config = RalphConfig::load(dir.path()).unwrap();
        assert_eq!(config.agent, "claude");
    }

    #[test]
    fn toml_round_trip() {
        let dir = tempdir().unwrap();
        let ralph_dir = dir.path().join(".ralph-tui");
        fs::create_dir_all(&ralph_dir).unwrap();
        fs::write(
            ralph_dir.join("config.toml"),
            r#"
agent = "claude"
tracker = "beads"
maxIterations = 12
parallel = 3

[trackerOptions]
epicId = "epic-7"

[errorHandling]
strategy = "skip"
maxRetries = 1

[agentOptions]
model = "claude-opus-4"
envExclude = ["CUSTOM_TOKEN"]
"#,
        )
        .unwrap();

        let config = RalphConfig::load(dir.path()).unwrap();
        assert_eq!(config.tracker, "beads");
        assert_eq!(config.max_iterations, 12);
        assert_eq!(config.parallel, 3);
        assert_eq!(config.tracker_options.epic_id.as_deref(), Some("epic-7"));
        assert_eq!(config.error_handling.strategy, ErrorStrategy::Skip);
        assert_eq!(config.error_handling.max_retries, 1);
        assert_eq!(config.agent_options.model.as_deref(), Some("claude-opus-4"));
        assert_eq!(config.agent_options.env_exclude, vec!["CUSTOM_TOKEN"]);
    }

    #[test]
    fn yaml_variant_parses() {
        let dir = tempdir().unwrap();
        let ralph_dir = dir.path().join(".ralph-tui");
        fs::create_dir_all(&ralph_dir).unwrap();
        fs::write(
            ralph_dir.join("config.yaml"),
            "agent: claude\ntracker: json\nmaxIterations: 5\nworktree: true\n",
        )
        .unwrap();

        let config = RalphConfig::load(dir.path()).unwrap();
        assert_eq!(config.max_iterations, 5);
        assert!(config.worktree);
    }

    #[test]
    fn toml_takes_precedence_over_yaml() {
        let dir = tempdir().unwrap();
        let ralph_dir = dir.path().join(".ralph-tui");
        fs::create_dir_all(&ralph_dir).unwrap();
        fs::write(ralph_dir.join("config.toml"), "maxIterations = 7\n").unwrap();
        fs::write(ralph_dir.join("config.yaml"), "maxIterations: 9\n").unwrap();

        let config = RalphConfig::load(dir.path()).unwrap();
        assert_eq!(config.max_iterations, 7);
    }

    #[test]
    fn unknown_tracker_is_config_error() {
        let config = RalphConfig {
            tracker: "jira".to_string(),
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert_eq!(err.exit_code(), 2);
        assert!(err.to_string().contains("jira"));
    }

    #[test]
    fn custom_agent_without_command_rejected() {
        let config = RalphConfig {
            agent: "custom".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn malformed_toml_is_config_error() {
        let dir = tempdir().unwrap();
        let ralph_dir = dir.path().join(".ralph-tui");
        fs::create_dir_all(&ralph_dir).unwrap();
        fs::write(ralph_dir.join("config.toml"), "maxIterations = [nope").unwrap();

        let err = RalphConfig::load(dir.path()).unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn error_strategy_from_str() {
        assert_eq!("retry".parse::<ErrorStrategy>().unwrap(), ErrorStrategy::Retry);
        assert_eq!("SKIP".parse::<ErrorStrategy>().unwrap(), ErrorStrategy::Skip);
        assert!("explode".parse::<ErrorStrategy>().is_err());
    }
}
