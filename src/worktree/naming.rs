//! Worktree name derivation and sanitization.
//!
//! Names come from, in priority order: a user-supplied custom name, the
//! epic id, the PRD basename (extension stripped), the first 8 characters
//! of the session UUID. Each candidate is sanitized into something git and
//! the filesystem both accept; a candidate that sanitizes to nothing falls
//! back to a hash of the raw input.

use std::path::Path;

use sha1::{Digest, Sha1};

/// Characters git refuses in ref names, replaced with `-` alongside
/// whitespace.
const GIT_INVALID: [char; 9] = ['~', '^', ':', '?', '*', '[', '\\', '@', '{'];

/// Sanitize one name candidate.
pub fn sanitize_name(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        if c.is_control() {
            continue;
        }
        if c.is_whitespace() || GIT_INVALID.contains(&c) {
            out.push('-');
        } else {
            out.push(c);
        }
    }

    // Collapse runs of separators.
    let mut collapsed = String::with_capacity(out.len());
    let mut prev_dash = false;
    for c in out.chars() {
        if c == '-' {
            if !prev_dash {
                collapsed.push(c);
            }
            prev_dash = true;
        } else {
            collapsed.push(c);
            prev_dash = false;
        }
    }

    let mut trimmed = collapsed.trim_matches(|c| c == '.' || c == '/' || c == '-');

    // A ref component must not end in `.lock`.
    while let Some(stripped) = trimmed.strip_suffix(".lock") {
        trimmed = stripped.trim_matches(|c| c == '.' || c == '/' || c == '-');
    }

    if trimmed.is_empty() {
        return fallback_hash(input);
    }
    trimmed.to_string()
}

fn fallback_hash(input: &str) -> String {
    let digest = Sha1::digest(input.as_bytes());
    format!("wt-{:x}", digest)[..10].to_string()
}

/// Derive the session worktree name from the available hints.
pub fn derive_name(
    custom: Option<&str>,
    epic_id: Option<&str>,
    prd_path: Option<&Path>,
    session_id: &str,
) -> String {
    if let Some(custom) = custom {
        return sanitize_name(custom);
    }
    if let Some(epic) = epic_id {
        return sanitize_name(epic);
    }
    if let Some(prd) = prd_path {
        if let Some(stem) = prd.file_stem().and_then(|s| s.to_str()) {
            return sanitize_name(stem);
        }
    }
    sanitize_name(&session_id[..session_id.len().min(8)])
}
