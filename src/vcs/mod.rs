//! Version control collaborator.
//!
//! Keyed by repository path and branch; never inspects diff content.

mod git;

pub use git::GitVcs;

#[cfg(test)]
pub(crate) use git::tests::{commit_file, fixture_remote};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::errors::Result;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitSummary {
    pub id: String,
    pub summary: String,
    pub author: String,
    pub time: DateTime<Utc>,
}

/// Structural state of one working copy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RepoStatus {
    pub current_branch: Option<String>,
    /// Tracked files with uncommitted changes; untracked files do not count.
    pub dirty: bool,
    #[serde(default)]
    pub dirty_files: Vec<String>,
    pub last_commit: Option<CommitSummary>,
}

/// What a submitted pull request needs.
#[derive(Debug, Clone)]
pub struct PullRequestSpec<'a> {
    pub branch: &'a str,
    pub base: &'a str,
    pub title: &'a str,
    pub body: &'a str,
}

#[async_trait]
pub trait VersionControl: Send + Sync {
    async fn clone_repo(&self, url: &str, dest: &Path, branch: &str) -> Result<()>;

    /// Fetch and fast-forward `branch`, leaving it checked out.
    async fn sync(&self, path: &Path, branch: &str) -> Result<()>;

    async fn status(&self, path: &Path) -> Result<RepoStatus>;

    /// Discard tracked changes (auto-clean).
    async fn hard_reset(&self, path: &Path) -> Result<()>;

    /// Create `branch` at HEAD (or reuse it) and check it out, keeping local changes.
    async fn create_branch(&self, path: &Path, branch: &str) -> Result<()>;

    /// Check out an existing branch, discarding local changes when `force`.
    async fn checkout(&self, path: &Path, branch: &str, force: bool) -> Result<()>;

    /// Delete a local branch; a missing branch is not an error.
    async fn delete_branch(&self, path: &Path, branch: &str) -> Result<()>;

    /// Commit every change; `None` when there was nothing to commit.
    async fn commit_all(&self, path: &Path, message: &str) -> Result<Option<String>>;

    async fn push(&self, path: &Path, branch: &str) -> Result<()>;

    async fn delete_remote_branch(&self, path: &Path, branch: &str) -> Result<()>;

    /// Return the reference (usually a URL) of the open pull request for the
    /// branch, opening one if there is none.
    async fn create_pull_request(&self, path: &Path, pr: &PullRequestSpec<'_>) -> Result<String>;
}
