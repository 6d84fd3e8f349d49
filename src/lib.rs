//! ralph-tui — an autonomous task-orchestration harness.
//!
//! Given a tracker of tasks (dependencies, priorities, per-task model
//! hints), the orchestrator repeatedly invokes an external coding-agent
//! CLI inside a git working copy until every task is closed or a stop
//! condition is reached. Isolation comes from git worktrees; completion
//! from a literal sentinel token in the agent's output stream.

pub mod agent;
pub mod cmd;
pub mod config;
pub mod conflict;
pub mod engine;
pub mod errors;
pub mod events;
pub mod logging;
pub mod parallel;
pub mod ralph_config;
pub mod scheduler;
pub mod session;
pub mod tracker;
pub mod worktree;
