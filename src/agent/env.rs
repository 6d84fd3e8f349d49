//! Environment filtering for spawned agents.
//!
//! The default deny list blocks the common secret-bearing variable shapes.
//! User config can extend the deny list and punch passthrough holes in it;
//! both are glob-capable. The filter reports the blocked and allowed sets
//! so the iteration log can record what the agent actually saw.

use anyhow::{Context, Result};
use glob::Pattern;

/// Variables blocked unless explicitly passed through.
pub const DEFAULT_ENV_DENY: [&str; 3] = ["*_API_KEY", "*_SECRET_KEY", "*_SECRET"];

#[derive(Debug)]
pub struct EnvPolicy {
    deny: Vec<Pattern>,
    passthrough: Vec<Pattern>,
}

/// Outcome of filtering one environment.
#[derive(Debug)]
pub struct EnvReport {
    /// Name/value pairs handed to the subprocess.
    pub allowed: Vec<(String, String)>,
    /// Names withheld from the subprocess.
    pub blocked: Vec<String>,
}

impl EnvReport {
    /// One-line summary for the iteration log.
    pub fn summary(&self) -> String {
        format!(
            "env: {} passed, {} blocked{}",
            self.allowed.len(),
            self.blocked.len(),
            if self.blocked.is_empty() {
                String::new()
            } else {
                format!(" ({})", self.blocked.join(", "))
            }
        )
    }
}

impl EnvPolicy {
    /// Build a policy from user additions. Invalid glob patterns are a
    /// configuration error.
    pub fn new(extra_deny: &[String], passthrough: &[String]) -> Result<Self> {
        let mut deny = Vec::with_capacity(DEFAULT_ENV_DENY.len() + extra_deny.len());
        for raw in DEFAULT_ENV_DENY.iter().copied().map(String::from).chain(extra_deny.iter().cloned()) {
            deny.push(
                Pattern::new(&raw)
                    .with_context(|| format!("invalid envExclude pattern '{}'", raw))?,
            );
        }
        let passthrough = passthrough
            .iter()
            .map(|raw| {
                Pattern::new(raw)
                    .with_context(|| format!("invalid envPassthrough pattern '{}'", raw))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { deny, passthrough })
    }

    fn is_blocked(&self, name: &str) -> bool {
        if self.passthrough.iter().any(|p| p.matches(name)) {
            return false;
        }
        self.deny.iter().any(|p| p.matches(name))
    }

    /// Partition an environment into allowed and blocked sets.
    pub fn filter<I>(&self, vars: I) -> EnvReport
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut allowed = Vec::new();
        let mut blocked = Vec::new();
        for (name, value) in vars {
            if self.is_blocked(&name) {
                blocked.push(name);
            } else {
                allowed.push((name, value));
            }
        }
        blocked.sort();
        EnvReport { allowed, blocked }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn default_deny_blocks_secret_shapes() {
        let policy = EnvPolicy::new(&[], &[]).unwrap();
        let report = policy.filter(vars(&[
            ("OPENAI_API_KEY", "sk-1"),
            ("AWS_SECRET_KEY", "x"),
            ("DB_SECRET", "y"),
            ("HOME", "/root"),
            ("PATH", "/bin"),
        ]));
        assert_eq!(
            report.blocked,
            vec!["AWS_SECRET_KEY", "DB_SECRET", "OPENAI_API_KEY"]
        );
        assert_eq!(report.allowed.len(), 2);
    }

    #[test]
    fn user_deny_patterns_extend_the_default() {
        let policy = EnvPolicy::new(&["MY_TOKEN*".to_string()], &[]).unwrap();
        let report = policy.filter(vars(&[("MY_TOKEN_A", "1"), ("OTHER", "2")]));
        assert_eq!(report.blocked, vec!["MY_TOKEN_A"]);
    }

    #[test]
    fn passthrough_wins_over_deny() {
        let policy =
            EnvPolicy::new(&[], &["ANTHROPIC_API_KEY".to_string()]).unwrap();
        let report = policy.filter(vars(&[
            ("ANTHROPIC_API_KEY", "keep"),
            ("OPENAI_API_KEY", "drop"),
        ]));
        assert_eq!(report.blocked, vec!["OPENAI_API_KEY"]);
        assert!(report
            .allowed
            .iter()
            .any(|(k, _)| k == "ANTHROPIC_API_KEY"));
    }

    #[test]
    fn passthrough_is_glob_capable() {
        let policy = EnvPolicy::new(&[], &["RALPH_*".to_string()]).unwrap();
        let report = policy.filter(vars(&[("RALPH_TEST_SECRET", "keep")]));
        assert!(report.blocked.is_empty());
    }

    #[test]
    fn invalid_pattern_is_an_error() {
        assert!(EnvPolicy::new(&["[".to_string()], &[]).is_err());
    }

    #[test]
    fn summary_always_has_counts() {
        let policy = EnvPolicy::new(&[], &[]).unwrap();
        let report = policy.filter(vars(&[("HOME", "/root")]));
        assert_eq!(report.summary(), "env: 1 passed, 0 blocked");
        let report = policy.filter(vars(&[("X_SECRET", "v")]));
        assert!(report.summary().contains("1 blocked (X_SECRET)"));
    }
}
