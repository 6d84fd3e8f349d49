//! Agent abstraction -- running one external coding-agent CLI.
//!
//! Adapters describe a concrete CLI (command, flags, capabilities, model
//! validation) and are registered into an [`AgentRegistry`] indexed by
//! plugin id. The actual spawn/stream/interrupt machinery is shared and
//! lives in [`invocation`]; adapters only contribute command-line pieces.

pub mod claude;
pub mod custom;
pub mod env;
pub mod invocation;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::errors::RalphError;

pub use claude::ClaudeAdapter;
pub use custom::CustomAdapter;
pub use env::{EnvPolicy, EnvReport, DEFAULT_ENV_DENY};
pub use invocation::{run_agent, InvocationRequest, InvocationResult, InvocationStatus};

/// Structured output formats an agent may speak on stdout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StructuredOutputFormat {
    Json,
    Jsonl,
}

/// What an adapter declares it can do. The iteration engine consults these
/// before enabling structured output or passing file attachments.
#[derive(Debug, Clone, Copy)]
pub struct AgentCapabilities {
    pub supports_streaming: bool,
    pub supports_interrupt: bool,
    pub supports_file_context: bool,
    pub supports_subagent_tracing: bool,
    pub structured_output_format: Option<StructuredOutputFormat>,
}

/// Adapter interface over one agent CLI.
pub trait AgentAdapter: Send + Sync {
    /// Plugin id ("claude", "custom").
    fn id(&self) -> &str;

    /// The executable to spawn.
    fn command(&self) -> &str;

    fn capabilities(&self) -> AgentCapabilities;

    /// Flags always present, first on the command line.
    fn default_flags(&self) -> Vec<String>;

    /// Flags derived from the request (adapter-level model, attachments).
    /// Engine-injected flags are appended after these and win under
    /// "last flag wins" CLIs.
    fn build_args(&self, request: &InvocationRequest) -> Vec<String>;

    /// Flags enabling the adapter's structured output, when the engine
    /// decides to use it.
    fn structured_output_flags(&self) -> Vec<String> {
        Vec::new()
    }

    /// Validate a model name. `Err` carries an operator-readable reason;
    /// the engine warns and falls back to the next precedence level, never
    /// failing the task.
    fn validate_model(&self, name: &str) -> Result<(), String>;

    /// Extract the human-visible text from one stdout line. Structured
    /// formats decode their event envelope; the default passes the line
    /// through.
    fn decode_stream_line(&self, line: &str) -> Option<String> {
        Some(line.to_string())
    }
}

/// Named collection of agent adapters, keyed by plugin id.
#[derive(Default)]
pub struct AgentRegistry {
    adapters: HashMap<String, Arc<dyn AgentAdapter>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn AgentAdapter>) {
        self.adapters.insert(adapter.id().to_string(), adapter);
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn AgentAdapter>> {
        self.adapters.get(id).cloned()
    }

    pub fn list(&self) -> Vec<&str> {
        self.adapters.keys().map(|s| s.as_str()).collect()
    }
}

impl std::fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRegistry")
            .field("adapters", &self.adapters.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Build the adapter selected by the session configuration.
pub fn build_agent(config: &Config) -> Result<Arc<dyn AgentAdapter>, RalphError> {
    match config.file.agent.as_str() {
        "claude" => Ok(Arc::new(ClaudeAdapter::new(None))),
        "custom" => {
            let command = config.file.command.clone().ok_or_else(|| {
                RalphError::Config("agent 'custom' requires the `command` key".into())
            })?;
            Ok(Arc::new(CustomAdapter::new(&command)))
        }
        other => Err(RalphError::Config(format!("unknown agent '{}'", other))),
    }
}

/// Result of the session-start dry run.
#[derive(Debug)]
pub struct PreflightReport {
    pub ok: bool,
    pub fail_reason: Option<String>,
    pub suggestion: Option<String>,
}

impl PreflightReport {
    fn failed(reason: String, suggestion: String) -> Self {
        Self {
            ok: false,
            fail_reason: Some(reason),
            suggestion: Some(suggestion),
        }
    }
}

/// Probe the agent before the first iteration: (a) a detect probe
/// (`<cmd> --version`), (b) a minimal prompt expecting non-empty output.
pub async fn preflight(adapter: &dyn AgentAdapter, cwd: &Path) -> PreflightReport {
    let detect = tokio::time::timeout(
        Duration::from_secs(10),
        tokio::process::Command::new(adapter.command())
            .arg("--version")
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status(),
    )
    .await;

    match detect {
        Err(_) => {
            return PreflightReport::failed(
                format!("`{} --version` timed out", adapter.command()),
                "check that the agent CLI is responsive on this machine".into(),
            )
        }
        Ok(Err(e)) => {
            return PreflightReport::failed(
                format!("cannot execute `{}`: {}", adapter.command(), e),
                format!("install the `{}` CLI or point `command` at it", adapter.command()),
            )
        }
        Ok(Ok(status)) if !status.success() => {
            return PreflightReport::failed(
                format!("`{} --version` exited with {}", adapter.command(), status),
                "the agent CLI is present but unhealthy; try running it manually".into(),
            )
        }
        Ok(Ok(_)) => {}
    }

    let request = InvocationRequest {
        prompt: "Reply with the single word: ready".to_string(),
        cwd: cwd.to_path_buf(),
        timeout: Duration::from_secs(60),
        ..InvocationRequest::default()
    };
    let policy = match EnvPolicy::new(&[], &[]) {
        Ok(p) => p,
        Err(e) => {
            return PreflightReport::failed(
                format!("env policy: {}", e),
                "fix envExclude/envPassthrough patterns".into(),
            )
        }
    };

    match run_agent(adapter, &request, &policy, None, |_| {}).await {
        Ok(result) if result.status == InvocationStatus::Completed && !result.stdout.trim().is_empty() => {
            PreflightReport {
                ok: true,
                fail_reason: None,
                suggestion: None,
            }
        }
        Ok(result) => PreflightReport::failed(
            format!(
                "dry run returned status {:?} with {} bytes of output",
                result.status,
                result.stdout.len()
            ),
            "run the agent manually with a trivial prompt to diagnose".into(),
        ),
        Err(e) => PreflightReport::failed(
            e.to_string(),
            "run the agent manually with a trivial prompt to diagnose".into(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_lookup_by_plugin_id() {
        let mut registry = AgentRegistry::new();
        registry.register(Arc::new(ClaudeAdapter::new(None)));
        registry.register(Arc::new(CustomAdapter::new("echo hello")));
        assert!(registry.get("claude").is_some());
        assert!(registry.get("custom").is_some());
        assert!(registry.get("gpt").is_none());
        let mut names = registry.list();
        names.sort();
        assert_eq!(names, vec!["claude", "custom"]);
    }

    #[tokio::test]
    async fn preflight_fails_for_missing_binary() {
        let adapter = CustomAdapter::new("definitely-not-a-real-binary-xyz");
        let report = preflight(&adapter, Path::new("/tmp")).await;
        assert!(!report.ok);
        assert!(report.fail_reason.is_some());
        assert!(report.suggestion.is_some());
    }

    #[tokio::test]
    async fn preflight_succeeds_for_echo_like_agent() {
        // `sh` ignores stdin prompts but `--version`-probing it fails, so use
        // a tiny wrapper script.
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake-agent");
        std::fs::write(&script, "#!/bin/sh\nif [ \"$1\" = \"--version\" ]; then echo 0.1; exit 0; fi\ncat >/dev/null\necho ready\n").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        let adapter = CustomAdapter::new(script.to_str().unwrap());
        let report = preflight(&adapter, dir.path()).await;
        assert!(report.ok, "fail: {:?}", report.fail_reason);
    }
}
