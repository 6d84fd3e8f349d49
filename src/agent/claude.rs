//! Claude CLI adapter.
//!
//! Speaks the `claude` command line: prompt on stdin, `--print` output,
//! optional `stream-json` structured output whose event envelope is decoded
//! back into plain text for sentinel matching and logging.

use serde::Deserialize;

use super::invocation::InvocationRequest;
use super::{AgentAdapter, AgentCapabilities, StructuredOutputFormat};

/// Model names the adapter accepts without complaint. Anything else that
/// still looks like a model id (a `claude-` prefix) also passes; the CLI is
/// the final authority.
const KNOWN_MODEL_ALIASES: [&str; 3] = ["opus", "sonnet", "haiku"];

pub struct ClaudeAdapter {
    command: String,
    /// Adapter-level model, emitted by `build_args`. Engine-injected
    /// `--model` flags land after it and win.
    default_model: Option<String>,
}

impl ClaudeAdapter {
    /// `command` overrides the executable name (used by tests and by
    /// installs where the CLI is not on PATH as `claude`).
    pub fn new(command: Option<String>) -> Self {
        Self {
            command: command.unwrap_or_else(|| "claude".to_string()),
            default_model: None,
        }
    }

    pub fn with_default_model(default_model: Option<String>) -> Self {
        Self {
            command: "claude".to_string(),
            default_model,
        }
    }
}

/// Subset of the stream-json event envelope that carries visible text.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum StreamEvent {
    #[serde(rename = "assistant")]
    Assistant { message: AssistantMessage },
    #[serde(rename = "result")]
    Result {
        #[serde(default)]
        result: Option<String>,
    },
    #[serde(rename = "user")]
    User {},
    #[serde(rename = "system")]
    System {},
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse { name: String },
}

impl AgentAdapter for ClaudeAdapter {
    fn id(&self) -> &str {
        "claude"
    }

    fn command(&self) -> &str {
        &self.command
    }

    fn capabilities(&self) -> AgentCapabilities {
        AgentCapabilities {
            supports_streaming: true,
            supports_interrupt: true,
            supports_file_context: false,
            supports_subagent_tracing: true,
            structured_output_format: Some(StructuredOutputFormat::Jsonl),
        }
    }

    fn default_flags(&self) -> Vec<String> {
        vec![
            "--print".to_string(),
            "--dangerously-skip-permissions".to_string(),
        ]
    }

    fn build_args(&self, _request: &InvocationRequest) -> Vec<String> {
        match &self.default_model {
            Some(model) => vec!["--model".to_string(), model.clone()],
            None => Vec::new(),
        }
    }

    fn structured_output_flags(&self) -> Vec<String> {
        vec![
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
        ]
    }

    fn validate_model(&self, name: &str) -> Result<(), String> {
        let trimmed = name.trim();
        if trimmed.is_empty() {
            return Err("model name is empty".to_string());
        }
        if trimmed.chars().any(char::is_whitespace) {
            return Err(format!("model name '{}' contains whitespace", trimmed));
        }
        if KNOWN_MODEL_ALIASES.contains(&trimmed) || trimmed.starts_with("claude-") {
            return Ok(());
        }
        Err(format!(
            "model '{}' is not a known alias ({}) or claude-* id",
            trimmed,
            KNOWN_MODEL_ALIASES.join(", ")
        ))
    }

    /// Decode a stream-json line into its visible text. Non-JSON lines pass
    /// through unchanged (plain `--print` mode); envelope lines without
    /// visible text are dropped.
    fn decode_stream_line(&self, line: &str) -> Option<String> {
        let Ok(event) = serde_json::from_str::<StreamEvent>(line) else {
            return Some(line.to_string());
        };
        match event {
            StreamEvent::Assistant { message } => {
                let mut text = String::new();
                for block in message.content {
                    match block {
                        ContentBlock::Text { text: t } => {
                            if !text.is_empty() {
                                text.push('\n');
                            }
                            text.push_str(&t);
                        }
                        ContentBlock::ToolUse { name } => {
                            if !text.is_empty() {
                                text.push('\n');
                            }
                            text.push_str(&format!("[tool: {}]", name));
                        }
                    }
                }
                if text.is_empty() { None } else { Some(text) }
            }
            StreamEvent::Result { result } => result,
            StreamEvent::User {} | StreamEvent::System {} => None,
        }
    }
}
