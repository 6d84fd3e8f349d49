//! `ralph-tui resume` — continue, list, or clean up sessions.

use console::style;

use crate::config::{CliOverrides, Config};
use crate::errors::RalphError;
use crate::session::{SessionManager, SessionRegistry};

/// Render the registry as an aligned table, most recent first.
pub fn list_sessions(registry: &SessionRegistry) -> String {
    let entries = registry.list();
    if entries.is_empty() {
        return "no recorded sessions".to_string();
    }
    let mut out = format!(
        "{:<10} {:<11} {:<8} {:<20} cwd\n",
        "SESSION", "STATUS", "TRACKER", "UPDATED"
    );
    for entry in entries {
        out.push_str(&format!(
            "{:<10} {:<11} {:<8} {:<20} {}\n",
            &entry.session_id[..entry.session_id.len().min(8)],
            entry.status.to_string(),
            entry.tracker,
            entry.updated_at.format("%Y-%m-%d %H:%M:%S"),
            entry.cwd.display(),
        ));
    }
    out
}

/// `resume [session-id] [--list] [--cleanup]`.
pub async fn cmd_resume(
    cwd: std::path::PathBuf,
    session_id: Option<String>,
    list: bool,
    cleanup: bool,
    overrides: CliOverrides,
    no_setup: bool,
    registry: SessionRegistry,
) -> Result<i32, RalphError> {
    if list {
        println!("{}", list_sessions(&registry));
        return Ok(0);
    }
    if cleanup {
        let removed = registry.cleanup()?;
        println!("removed {removed} stale registry entr{}", if removed == 1 { "y" } else { "ies" });
        return Ok(0);
    }

    // Locate the target session, then re-root execution into its cwd.
    let probe_config = Config::new(cwd, overrides.clone())?;
    let probe_registry = SessionRegistry::with_path(registry.path().to_path_buf());
    let manager = SessionManager::new(probe_config, probe_registry);
    let entry = manager.resume_target(session_id.as_deref())?;

    if !overrides.headless {
        println!(
            "{}",
            style(format!(
                "resuming session {} in {}",
                &entry.session_id[..entry.session_id.len().min(8)],
                entry.cwd.display()
            ))
            .dim()
        );
    }

    let mut resume_overrides = overrides;
    if resume_overrides.epic.is_none() {
        resume_overrides.epic = entry.epic_id.clone();
    }
    if resume_overrides.prd.is_none() {
        resume_overrides.prd = entry.prd_path.clone();
    }
    let config = Config::new(entry.cwd.clone(), resume_overrides)?;
    super::run::cmd_run(config, true, no_setup, registry).await
}
