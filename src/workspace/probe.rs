//! Structural snapshot of a materialised slot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::PathBuf;

use super::tooling::Tooling;
use crate::vcs::CommitSummary;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepoProbe {
    pub name: String,
    pub path: PathBuf,
    pub remote_url: String,
    pub default_branch: String,
    pub current_branch: Option<String>,
    pub dirty: bool,
    pub last_commit: Option<CommitSummary>,
    pub tooling: Tooling,
    /// Cloned during this acquisition rather than synced.
    pub freshly_cloned: bool,
    /// Tracked changes were discarded by auto-clean.
    #[serde(default)]
    pub cleaned: bool,
}

/// Persisted as the `workspace_snapshot` artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceSnapshot {
    pub slot: String,
    pub root: PathBuf,
    pub primary_repository: String,
    pub repositories: Vec<RepoProbe>,
    pub captured_at: DateTime<Utc>,
}

impl WorkspaceSnapshot {
    pub fn repository(&self, name: &str) -> Option<&RepoProbe> {
        self.repositories.iter().find(|r| r.name == name)
    }

    /// Short plain-text description for engine prompts.
    pub fn summary(&self) -> String {
        let mut out = format!("Workspace slot '{}' at {}\n", self.slot, self.root.display());
        for repo in &self.repositories {
            let primary = if repo.name == self.primary_repository { " (primary)" } else { "" };
            let _ = writeln!(
                out,
                "- {}{}: {} on branch {}",
                repo.name,
                primary,
                repo.path.display(),
                repo.current_branch.as_deref().unwrap_or("<detached>")
            );
            if let Some(language) = &repo.tooling.language {
                let _ = writeln!(
                    out,
                    "  language: {}, build tool: {}",
                    language,
                    repo.tooling.build_tool.as_deref().unwrap_or("unknown")
                );
            }
            if let Some(commit) = &repo.last_commit {
                let _ = writeln!(out, "  last commit: {}", commit.summary);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_marks_primary() {
        let repo = |name: &str| RepoProbe {
            name: name.into(),
            path: PathBuf::from(format!("/slots/env0/{name}")),
            remote_url: "url".into(),
            default_branch: "main".into(),
            current_branch: Some("main".into()),
            dirty: false,
            last_commit: None,
            tooling: Tooling {
                language: Some("rust".into()),
                build_tool: Some("cargo".into()),
                ..Tooling::default()
            },
            freshly_cloned: true,
            cleaned: false,
        };
        let snapshot = WorkspaceSnapshot {
            slot: "env0".into(),
            root: PathBuf::from("/slots/env0"),
            primary_repository: "api".into(),
            repositories: vec![repo("api"), repo("web")],
            captured_at: Utc::now(),
        };
        let text = snapshot.summary();
        assert!(text.contains("- api (primary)"));
        assert!(text.contains("- web: /slots/env0/web"));
        assert!(text.contains("build tool: cargo"));
        assert!(snapshot.repository("web").is_some());
    }
}
