//! Custom agent adapter.
//!
//! Wraps a user-supplied command line from the `command` config key. The
//! first token is the executable, the rest become default flags. The
//! adapter declares conservative capabilities and validates no models, so
//! engine model resolution always falls through to the agent default.

use super::invocation::InvocationRequest;
use super::{AgentAdapter, AgentCapabilities};

pub struct CustomAdapter {
    command: String,
    flags: Vec<String>,
}

impl CustomAdapter {
    pub fn new(command_line: &str) -> Self {
        let mut parts = command_line.split_whitespace().map(String::from);
        let command = parts.next().unwrap_or_default();
        Self {
            command,
            flags: parts.collect(),
        }
    }
}

impl AgentAdapter for CustomAdapter {
    fn id(&self) -> &str {
        "custom"
    }

    fn command(&self) -> &str {
        &self.command
    }

    fn capabilities(&self) -> AgentCapabilities {
        AgentCapabilities {
            supports_streaming: true,
            supports_interrupt: false,
            supports_file_context: false,
            supports_subagent_tracing: false,
            structured_output_format: None,
        }
    }

    fn default_flags(&self) -> Vec<String> {
        self.flags.clone()
    }

    fn build_args(&self, _request: &InvocationRequest) -> Vec<String> {
        Vec::new()
    }

    fn validate_model(&self, name: &str) -> Result<(), String> {
        Err(format!(
            "custom agent does not accept model overrides (requested '{}')",
            name
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_command_and_flags() {
        let adapter = CustomAdapter::new("aider --yes --no-git");
        assert_eq!(adapter.command(), "aider");
        assert_eq!(adapter.default_flags(), vec!["--yes", "--no-git"]);
    }

    #[test]
    fn bare_command_has_no_flags() {
        let adapter = CustomAdapter::new("my-agent");
        assert_eq!(adapter.command(), "my-agent");
        assert!(adapter.default_flags().is_empty());
    }

    #[test]
    fn every_model_is_rejected() {
        let adapter = CustomAdapter::new("my-agent");
        assert!(adapter.validate_model("claude-opus-4").is_err());
        assert!(adapter.validate_model("anything").is_err());
    }

    #[test]
    fn capabilities_are_conservative() {
        let adapter = CustomAdapter::new("my-agent");
        let caps = adapter.capabilities();
        assert!(caps.supports_streaming);
        assert!(!caps.supports_interrupt);
        assert!(!caps.supports_subagent_tracing);
        assert!(caps.structured_output_format.is_none());
    }
}
