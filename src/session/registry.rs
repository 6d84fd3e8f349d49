//! The user-scope session registry.
//!
//! A JSON mapping from session id to a discoverability record, stored in
//! the user's config directory so `resume --list` works from any cwd. The
//! registry is bookkeeping only; the per-cwd `session.json` remains the
//! authoritative state.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::RalphError;
use crate::session::SessionStatus;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryEntry {
    pub session_id: String,
    pub cwd: PathBuf,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub agent: String,
    pub tracker: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epic_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prd_path: Option<PathBuf>,
    #[serde(default)]
    pub sandbox: bool,
}

/// How a resume identifier matched the registry.
#[derive(Debug)]
pub enum ResumeMatch {
    Found(RegistryEntry),
    NotFound,
    Ambiguous(Vec<String>),
}

pub struct SessionRegistry {
    path: PathBuf,
}

impl SessionRegistry {
    /// Registry in the process user's config directory. The
    /// `RALPH_TUI_REGISTRY` environment variable overrides the location
    /// (isolated test runs, shared-home machines).
    pub fn open_default() -> Result<Self, RalphError> {
        if let Ok(path) = std::env::var("RALPH_TUI_REGISTRY") {
            return Ok(Self { path: path.into() });
        }
        let base = dirs::config_dir()
            .or_else(|| dirs::home_dir().map(|h| h.join(".config")))
            .ok_or_else(|| {
                RalphError::Config("cannot determine a user config directory".into())
            })?;
        Ok(Self {
            path: base.join("ralph-tui").join("registry.json"),
        })
    }

    /// Registry at an explicit path (tests, alternate homes).
    pub fn with_path(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> BTreeMap<String, RegistryEntry> {
        let Ok(content) = std::fs::read_to_string(&self.path) else {
            return BTreeMap::new();
        };
        serde_json::from_str(&content).unwrap_or_default()
    }

    fn store(&self, entries: &BTreeMap<String, RegistryEntry>) -> Result<(), RalphError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                RalphError::Config(format!("cannot create {}: {e}", parent.display()))
            })?;
        }
        let mut serialized = serde_json::to_string_pretty(entries)
            .map_err(|e| RalphError::Config(format!("cannot serialize registry: {e}")))?;
        serialized.push('\n');
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serialized)
            .map_err(|e| RalphError::Config(format!("cannot write {}: {e}", tmp.display())))?;
        std::fs::rename(&tmp, &self.path)
            .map_err(|e| RalphError::Config(format!("cannot replace {}: {e}", self.path.display())))?;
        Ok(())
    }

    pub fn upsert(&self, entry: RegistryEntry) -> Result<(), RalphError> {
        let mut entries = self.load();
        entries.insert(entry.session_id.clone(), entry);
        self.store(&entries)
    }

    pub fn remove(&self, session_id: &str) -> Result<(), RalphError> {
        let mut entries = self.load();
        if entries.remove(session_id).is_some() {
            self.store(&entries)?;
        }
        Ok(())
    }

    pub fn get(&self, session_id: &str) -> Option<RegistryEntry> {
        self.load().get(session_id).cloned()
    }

    /// All entries, most recently updated first.
    pub fn list(&self) -> Vec<RegistryEntry> {
        let mut entries: Vec<RegistryEntry> = self.load().into_values().collect();
        entries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        entries
    }

    /// Resolve a resume identifier: exact id first, then a unique prefix;
    /// multiple prefix hits are ambiguous.
    pub fn resolve(&self, identifier: &str) -> ResumeMatch {
        let entries = self.load();
        if let Some(entry) = entries.get(identifier) {
            return ResumeMatch::Found(entry.clone());
        }
        let hits: Vec<&RegistryEntry> = entries
            .values()
            .filter(|e| e.session_id.starts_with(identifier))
            .collect();
        match hits.len() {
            0 => ResumeMatch::NotFound,
            1 => ResumeMatch::Found(hits[0].clone()),
            _ => ResumeMatch::Ambiguous(hits.iter().map(|e| e.session_id.clone()).collect()),
        }
    }

    /// Most recently updated entry whose cwd matches.
    pub fn find_by_cwd(&self, cwd: &Path) -> Option<RegistryEntry> {
        self.list().into_iter().find(|e| e.cwd == cwd)
    }

    /// Drop entries whose session file no longer exists; returns how many
    /// were removed.
    pub fn cleanup(&self) -> Result<usize, RalphError> {
        let entries = self.load();
        let mut kept = BTreeMap::new();
        let mut removed = 0;
        for (id, entry) in entries {
            if entry.cwd.join(".ralph-tui/session.json").exists() {
                kept.insert(id, entry);
            } else {
                removed += 1;
            }
        }
        if removed > 0 {
            self.store(&kept)?;
        }
        Ok(removed)
    }
}
