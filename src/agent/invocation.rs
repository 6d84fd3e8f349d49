//! Shared spawn/stream/interrupt machinery for agent invocations.
//!
//! Flag ordering is the contract that matters here: the final command line
//! is `[cmd] [default_flags] [build_args] [user extra flags] [engine
//! flags]`, so engine-injected flags always win under "last flag wins"
//! CLIs.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::env::EnvPolicy;
use super::AgentAdapter;
use crate::errors::RalphError;

/// Grace period between the cancellation signal and the force kill.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Default cap on the captured output transcript.
const DEFAULT_MAX_OUTPUT_BYTES: usize = 10 * 1024 * 1024;

/// One agent invocation.
#[derive(Debug, Clone)]
pub struct InvocationRequest {
    /// Sent on stdin.
    pub prompt: String,
    pub cwd: PathBuf,
    pub timeout: Duration,
    pub max_output_bytes: usize,
    /// File-attachment references, honored only when the adapter declares
    /// `supports_file_context`.
    pub attachments: Vec<PathBuf>,
    /// User-supplied additional flags.
    pub extra_flags: Vec<String>,
    /// Engine-injected flags; always last.
    pub engine_flags: Vec<String>,
}

impl Default for InvocationRequest {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            cwd: PathBuf::from("."),
            timeout: Duration::from_secs(900),
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            attachments: Vec::new(),
            extra_flags: Vec::new(),
            engine_flags: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationStatus {
    Completed,
    Failed,
    Timeout,
    Interrupted,
}

/// What one invocation produced.
#[derive(Debug, Clone)]
pub struct InvocationResult {
    pub status: InvocationStatus,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub interrupted: bool,
    /// The transcript hit `max_output_bytes` and was truncated.
    pub truncated: bool,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    /// The full command line that ran, for the iteration log.
    pub command_line: Vec<String>,
}

/// Assemble the flag sequence for an invocation. Public so the ordering
/// contract is directly testable.
pub fn assemble_args(adapter: &dyn AgentAdapter, request: &InvocationRequest) -> Vec<String> {
    let mut args = adapter.default_flags();
    args.extend(adapter.build_args(request));
    args.extend(request.extra_flags.iter().cloned());
    args.extend(request.engine_flags.iter().cloned());
    args
}

/// Run one agent invocation to completion, timeout, or cancellation.
///
/// `on_chunk` observes each decoded stdout line as it streams; the full
/// (capped) transcript is also returned. A cancellation signal arrives via
/// the watch channel flipping to `true`.
pub async fn run_agent(
    adapter: &dyn AgentAdapter,
    request: &InvocationRequest,
    env_policy: &EnvPolicy,
    cancel: Option<watch::Receiver<bool>>,
    mut on_chunk: impl FnMut(&str),
) -> Result<InvocationResult, RalphError> {
    let args = assemble_args(adapter, request);
    let env_report = env_policy.filter(std::env::vars());
    info!(agent = adapter.id(), "{}", env_report.summary());

    let mut command_line = vec![adapter.command().to_string()];
    command_line.extend(args.iter().cloned());
    debug!(agent = adapter.id(), ?command_line, "spawning agent");

    let started_at = Utc::now();
    let start = Instant::now();

    let mut child = Command::new(adapter.command())
        .args(&args)
        .current_dir(&request.cwd)
        .env_clear()
        .envs(env_report.allowed.iter().cloned())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(RalphError::SpawnFailed)?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(request.prompt.as_bytes())
            .await
            .map_err(|e| RalphError::AgentUnavailable {
                reason: format!("cannot write prompt to agent stdin: {}", e),
                suggestion: None,
            })?;
        stdin.shutdown().await.ok();
    }

    let stderr_handle = child.stderr.take().map(|stderr| {
        tokio::spawn(async move {
            let mut collected = String::new();
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if collected.len() < DEFAULT_MAX_OUTPUT_BYTES {
                    collected.push_str(&line);
                    collected.push('\n');
                }
            }
            collected
        })
    });

    let stdout = child.stdout.take().ok_or_else(|| RalphError::AgentUnavailable {
        reason: "agent stdout unavailable".into(),
        suggestion: None,
    })?;
    let mut lines = BufReader::new(stdout).lines();

    let mut transcript = String::new();
    let mut truncated = false;
    let mut timed_out = false;
    let mut interrupted = false;

    let deadline = tokio::time::sleep(request.timeout);
    tokio::pin!(deadline);
    let mut cancel_rx = cancel;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line {
                    Ok(Some(raw)) => {
                        if let Some(decoded) = adapter.decode_stream_line(&raw) {
                            if transcript.len() + decoded.len() < request.max_output_bytes {
                                transcript.push_str(&decoded);
                                transcript.push('\n');
                            } else {
                                truncated = true;
                            }
                            on_chunk(&decoded);
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(agent = adapter.id(), "stdout read error: {}", e);
                        break;
                    }
                }
            }
            _ = &mut deadline => {
                timed_out = true;
                break;
            }
            _ = wait_cancelled(&mut cancel_rx) => {
                interrupted = true;
                break;
            }
        }
    }

    let exit_code = if timed_out || interrupted {
        terminate(&mut child).await
    } else {
        match child.wait().await {
            Ok(status) => status.code(),
            Err(e) => {
                warn!(agent = adapter.id(), "wait failed: {}", e);
                None
            }
        }
    };

    let stderr = match stderr_handle {
        Some(handle) => handle.await.unwrap_or_default(),
        None => String::new(),
    };

    let ended_at = Utc::now();
    let status = if timed_out {
        InvocationStatus::Timeout
    } else if interrupted {
        InvocationStatus::Interrupted
    } else if exit_code == Some(0) {
        InvocationStatus::Completed
    } else {
        InvocationStatus::Failed
    };

    Ok(InvocationResult {
        status,
        exit_code,
        stdout: transcript,
        stderr,
        duration_ms: start.elapsed().as_millis() as u64,
        interrupted,
        truncated,
        started_at,
        ended_at,
        command_line,
    })
}

/// Resolve when the watch channel flips to `true`; never resolves without a
/// channel.
async fn wait_cancelled(rx: &mut Option<watch::Receiver<bool>>) {
    match rx {
        Some(rx) => {
            if *rx.borrow() {
                return;
            }
            while rx.changed().await.is_ok() {
                if *rx.borrow() {
                    return;
                }
            }
            // Sender dropped without signalling: treat as never-cancelled.
            std::future::pending::<()>().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Cancellation signal, grace period, then force kill.
async fn terminate(child: &mut tokio::process::Child) -> Option<i32> {
    if let Some(pid) = child.id() {
        let _ = std::process::Command::new("kill")
            .args(["-TERM", &pid.to_string()])
            .status();
    }
    match tokio::time::timeout(KILL_GRACE, child.wait()).await {
        Ok(Ok(status)) => status.code(),
        _ => {
            let _ = child.kill().await;
            child.try_wait().ok().flatten().and_then(|s| s.code())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{ClaudeAdapter, CustomAdapter};

    fn script_adapter(dir: &std::path::Path, body: &str) -> CustomAdapter {
        let script = dir.join("agent.sh");
        std::fs::write(&script, format!("#!/bin/sh\n{}\n", body)).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        CustomAdapter::new(script.to_str().unwrap())
    }

    fn policy() -> EnvPolicy {
        EnvPolicy::new(&[], &[]).unwrap()
    }

    #[test]
    fn engine_flags_come_last() {
        let adapter = ClaudeAdapter::with_default_model(Some("claude-sonnet-4".into()));
        let request = InvocationRequest {
            extra_flags: vec!["--user-flag".into()],
            engine_flags: vec!["--model".into(), "claude-opus-4".into()],
            ..Default::default()
        };
        let args = assemble_args(&adapter, &request);

        // The adapter-built --model appears before the engine-injected one,
        // so the engine value wins under last-flag-wins parsing.
        let model_positions: Vec<usize> = args
            .iter()
            .enumerate()
            .filter(|(_, a)| *a == "--model")
            .map(|(i, _)| i)
            .collect();
        assert_eq!(model_positions.len(), 2);
        assert_eq!(args[model_positions[1] + 1], "claude-opus-4");
        assert_eq!(args.last().unwrap(), "claude-opus-4");

        let user_pos = args.iter().position(|a| a == "--user-flag").unwrap();
        assert!(user_pos < model_positions[1]);
    }

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = script_adapter(dir.path(), "cat >/dev/null\necho hello\necho world");
        let request = InvocationRequest {
            prompt: "hi".into(),
            cwd: dir.path().to_path_buf(),
            ..Default::default()
        };
        let mut chunks = Vec::new();
        let result = run_agent(&adapter, &request, &policy(), None, |c| {
            chunks.push(c.to_string())
        })
        .await
        .unwrap();

        assert_eq!(result.status, InvocationStatus::Completed);
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.stdout, "hello\nworld\n");
        assert_eq!(chunks, vec!["hello", "world"]);
        assert!(!result.interrupted);
    }

    #[tokio::test]
    async fn nonzero_exit_is_failed() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = script_adapter(dir.path(), "cat >/dev/null\nexit 3");
        let request = InvocationRequest {
            cwd: dir.path().to_path_buf(),
            ..Default::default()
        };
        let result = run_agent(&adapter, &request, &policy(), None, |_| {})
            .await
            .unwrap();
        assert_eq!(result.status, InvocationStatus::Failed);
        assert_eq!(result.exit_code, Some(3));
    }

    #[tokio::test]
    async fn timeout_kills_the_agent() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = script_adapter(dir.path(), "cat >/dev/null\nsleep 60");
        let request = InvocationRequest {
            cwd: dir.path().to_path_buf(),
            timeout: Duration::from_millis(200),
            ..Default::default()
        };
        let start = Instant::now();
        let result = run_agent(&adapter, &request, &policy(), None, |_| {})
            .await
            .unwrap();
        assert_eq!(result.status, InvocationStatus::Timeout);
        assert!(start.elapsed() < Duration::from_secs(30));
    }

    #[tokio::test]
    async fn cancellation_interrupts() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = script_adapter(dir.path(), "cat >/dev/null\nsleep 60");
        let request = InvocationRequest {
            cwd: dir.path().to_path_buf(),
            ..Default::default()
        };
        let (tx, rx) = watch::channel(false);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let _ = tx.send(true);
        });
        let result = run_agent(&adapter, &request, &policy(), Some(rx), |_| {})
            .await
            .unwrap();
        assert_eq!(result.status, InvocationStatus::Interrupted);
        assert!(result.interrupted);
    }

    #[tokio::test]
    async fn denied_env_is_absent_from_agent() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = script_adapter(
            dir.path(),
            "cat >/dev/null\necho \"key=${FAKE_THING_API_KEY:-absent}\"",
        );
        // SAFETY-free std env mutation confined to this test.
        std::env::set_var("FAKE_THING_API_KEY", "supersecret");
        let request = InvocationRequest {
            cwd: dir.path().to_path_buf(),
            ..Default::default()
        };
        let result = run_agent(&adapter, &request, &policy(), None, |_| {})
            .await
            .unwrap();
        std::env::remove_var("FAKE_THING_API_KEY");
        assert!(result.stdout.contains("key=absent"));
    }

    #[tokio::test]
    async fn transcript_respects_byte_cap() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = script_adapter(
            dir.path(),
            "cat >/dev/null\ni=0\nwhile [ $i -lt 100 ]; do echo 0123456789; i=$((i+1)); done",
        );
        let request = InvocationRequest {
            cwd: dir.path().to_path_buf(),
            max_output_bytes: 50,
            ..Default::default()
        };
        let result = run_agent(&adapter, &request, &policy(), None, |_| {})
            .await
            .unwrap();
        assert!(result.truncated);
        assert!(result.stdout.len() <= 50 + 11);
    }

    #[tokio::test]
    async fn missing_binary_is_spawn_failure() {
        let adapter = CustomAdapter::new("no-such-agent-binary-qq");
        let request = InvocationRequest::default();
        let err = run_agent(&adapter, &request, &policy(), None, |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, RalphError::SpawnFailed(_)));
    }
}
