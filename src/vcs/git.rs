use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use git2::build::{CheckoutBuilder, RepoBuilder};
use git2::{BranchType, Cred, FetchOptions, RemoteCallbacks, Repository, ResetType, Signature, StatusOptions};
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info};

use super::{CommitSummary, PullRequestSpec, RepoStatus, VersionControl};
use crate::errors::{Result, ShipyardError};

/// libgit2 for local operations; the `git` and `gh` executables for push and
/// pull requests so the user's own credentials and auth setup apply.
#[derive(Debug, Default, Clone)]
pub struct GitVcs;

impl GitVcs {
    pub fn new() -> Self {
        Self
    }
}

fn label(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn open(path: &Path) -> Result<Repository> {
    Repository::open(path).map_err(|e| ShipyardError::vcs(&label(path), e))
}

fn fetch_options<'a>() -> FetchOptions<'a> {
    let mut callbacks = RemoteCallbacks::new();
    callbacks.credentials(|url, username, allowed| {
        if allowed.contains(git2::CredentialType::SSH_KEY) {
            return Cred::ssh_key_from_agent(username.unwrap_or("git"));
        }
        if allowed.contains(git2::CredentialType::USER_PASS_PLAINTEXT)
            && let Ok(config) = git2::Config::open_default()
        {
            return Cred::credential_helper(&config, url, username);
        }
        Cred::default()
    });
    let mut options = FetchOptions::new();
    options.remote_callbacks(callbacks);
    options
}

fn head_commit(repo: &Repository) -> Option<git2::Commit<'_>> {
    repo.head().ok().and_then(|head| head.peel_to_commit().ok())
}

async fn run_cli(path: &Path, program: &str, args: &[&str]) -> Result<String> {
    debug!(program, ?args, dir = %path.display(), "running vcs command");
    let output = Command::new(program)
        .args(args)
        .current_dir(path)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| ShipyardError::vcs(&label(path), format!("failed to run {program}: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ShipyardError::vcs(
            &label(path),
            format!("{program} {} failed: {}", args.join(" "), stderr.trim()),
        ));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

#[async_trait]
impl VersionControl for GitVcs {
    async fn clone_repo(&self, url: &str, dest: &Path, branch: &str) -> Result<()> {
        info!(%url, dest = %dest.display(), %branch, "cloning repository");
        RepoBuilder::new()
            .branch(branch)
            .fetch_options(fetch_options())
            .clone(url, dest)
            .map_err(|e| ShipyardError::vcs(&label(dest), format!("clone of {url} failed: {e}")))?;
        Ok(())
    }

    async fn sync(&self, path: &Path, branch: &str) -> Result<()> {
        let name = label(path);
        let repo = open(path)?;
        let vcs = |e: git2::Error| ShipyardError::vcs(&name, e);

        let mut remote = repo.find_remote("origin").map_err(vcs)?;
        let refspec = format!("+refs/heads/{branch}:refs/remotes/origin/{branch}");
        remote
            .fetch(&[refspec.as_str()], Some(&mut fetch_options()), None)
            .map_err(vcs)?;

        let remote_oid = repo
            .find_reference(&format!("refs/remotes/origin/{branch}"))
            .map_err(vcs)?
            .target()
            .ok_or_else(|| ShipyardError::vcs(&name, format!("origin/{branch} has no target")))?;
        let remote_commit = repo.find_commit(remote_oid).map_err(vcs)?;

        match repo.find_branch(branch, BranchType::Local) {
            Ok(local) => {
                let local_oid = local
                    .get()
                    .target()
                    .ok_or_else(|| ShipyardError::vcs(&name, format!("{branch} has no target")))?;
                if local_oid != remote_oid {
                    if !repo.graph_descendant_of(remote_oid, local_oid).map_err(vcs)? {
                        return Err(ShipyardError::vcs(
                            &name,
                            format!("{branch} has diverged from origin/{branch}; cannot fast-forward"),
                        ));
                    }
                    let mut reference = local.into_reference();
                    reference
                        .set_target(remote_oid, "shipyard: fast-forward")
                        .map_err(vcs)?;
                }
            }
            Err(_) => {
                repo.branch(branch, &remote_commit, false).map_err(vcs)?;
            }
        }

        repo.set_head(&format!("refs/heads/{branch}")).map_err(vcs)?;
        repo.checkout_head(Some(CheckoutBuilder::new().force()))
            .map_err(vcs)?;
        info!(repository = %name, %branch, commit = %remote_oid, "synced");
        Ok(())
    }

    async fn status(&self, path: &Path) -> Result<RepoStatus> {
        let name = label(path);
        let repo = open(path)?;

        let current_branch = repo.head().ok().and_then(|head| {
            if head.is_branch() {
                head.shorthand().map(str::to_string)
            } else {
                None
            }
        });

        let mut options = StatusOptions::new();
        options.include_untracked(false).include_ignored(false);
        let statuses = repo
            .statuses(Some(&mut options))
            .map_err(|e| ShipyardError::vcs(&name, e))?;
        let dirty_files: Vec<String> = statuses
            .iter()
            .filter(|entry| entry.status() != git2::Status::CURRENT)
            .filter_map(|entry| entry.path().map(str::to_string))
            .collect();

        let last_commit = head_commit(&repo).map(|commit| CommitSummary {
            id: commit.id().to_string(),
            summary: commit.summary().unwrap_or_default().to_string(),
            author: commit.author().name().unwrap_or_default().to_string(),
            time: Utc
                .timestamp_opt(commit.time().seconds(), 0)
                .single()
                .unwrap_or_else(Utc::now),
        });

        Ok(RepoStatus {
            current_branch,
            dirty: !dirty_files.is_empty(),
            dirty_files,
            last_commit,
        })
    }

    async fn hard_reset(&self, path: &Path) -> Result<()> {
        let name = label(path);
        let repo = open(path)?;
        let commit = head_commit(&repo)
            .ok_or_else(|| ShipyardError::vcs(&name, "no HEAD commit to reset to"))?;
        repo.reset(commit.as_object(), ResetType::Hard, None)
            .map_err(|e| ShipyardError::vcs(&name, e))?;
        info!(repository = %name, "hard reset to HEAD");
        Ok(())
    }

    async fn create_branch(&self, path: &Path, branch: &str) -> Result<()> {
        let name = label(path);
        let repo = open(path)?;
        let vcs = |e: git2::Error| ShipyardError::vcs(&name, e);

        if repo.find_branch(branch, BranchType::Local).is_err() {
            let commit = head_commit(&repo)
                .ok_or_else(|| ShipyardError::vcs(&name, "no HEAD commit to branch from"))?;
            repo.branch(branch, &commit, false).map_err(vcs)?;
            // Same tree as HEAD, so switching keeps local modifications.
            repo.set_head(&format!("refs/heads/{branch}")).map_err(vcs)?;
            debug!(repository = %name, %branch, "branch created");
            return Ok(());
        }
        drop(repo);
        self.checkout(path, branch, false).await
    }

    async fn checkout(&self, path: &Path, branch: &str, force: bool) -> Result<()> {
        let name = label(path);
        let repo = open(path)?;
        let vcs = |e: git2::Error| ShipyardError::vcs(&name, e);

        let target = repo
            .find_branch(branch, BranchType::Local)
            .map_err(vcs)?
            .get()
            .peel_to_commit()
            .map_err(vcs)?;
        let mut builder = CheckoutBuilder::new();
        if force {
            builder.force();
        } else {
            builder.safe();
        }
        repo.checkout_tree(target.as_object(), Some(&mut builder))
            .map_err(vcs)?;
        repo.set_head(&format!("refs/heads/{branch}")).map_err(vcs)?;
        debug!(repository = %name, %branch, force, "checked out");
        Ok(())
    }

    async fn delete_branch(&self, path: &Path, branch: &str) -> Result<()> {
        let name = label(path);
        let repo = open(path)?;
        match repo.find_branch(branch, BranchType::Local) {
            Ok(mut local) => {
                local.delete().map_err(|e| ShipyardError::vcs(&name, e))?;
                info!(repository = %name, %branch, "local branch deleted");
                Ok(())
            }
            Err(_) => Ok(()),
        }
    }

    async fn commit_all(&self, path: &Path, message: &str) -> Result<Option<String>> {
        let name = label(path);
        let repo = open(path)?;
        let vcs = |e: git2::Error| ShipyardError::vcs(&name, e);

        let mut index = repo.index().map_err(vcs)?;
        index
            .add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)
            .map_err(vcs)?;
        index.update_all(["*"].iter(), None).map_err(vcs)?;
        index.write().map_err(vcs)?;
        let tree_id = index.write_tree().map_err(vcs)?;

        let parent = head_commit(&repo);
        if let Some(parent) = &parent
            && parent.tree_id() == tree_id
        {
            return Ok(None);
        }

        let tree = repo.find_tree(tree_id).map_err(vcs)?;
        let signature = repo
            .signature()
            .or_else(|_| Signature::now("shipyard", "shipyard@localhost"))
            .map_err(vcs)?;
        let parents: Vec<&git2::Commit<'_>> = parent.iter().collect();
        let oid = repo
            .commit(Some("HEAD"), &signature, &signature, message, &tree, &parents)
            .map_err(vcs)?;
        info!(repository = %name, commit = %oid, "committed");
        Ok(Some(oid.to_string()))
    }

    async fn push(&self, path: &Path, branch: &str) -> Result<()> {
        run_cli(path, "git", &["push", "-u", "origin", branch]).await?;
        info!(repository = %label(path), %branch, "pushed");
        Ok(())
    }

    async fn delete_remote_branch(&self, path: &Path, branch: &str) -> Result<()> {
        run_cli(path, "git", &["push", "origin", "--delete", branch]).await?;
        info!(repository = %label(path), %branch, "remote branch deleted");
        Ok(())
    }

    async fn create_pull_request(&self, path: &Path, pr: &PullRequestSpec<'_>) -> Result<String> {
        match run_cli(
            path,
            "gh",
            &[
                "pr", "list", "--head", pr.branch, "--state", "open", "--json", "url", "--jq", ".[0].url // empty",
            ],
        )
        .await
        {
            Ok(url) if !url.is_empty() => {
                info!(repository = %label(path), %url, "reusing open pull request");
                return Ok(url);
            }
            Ok(_) => {}
            Err(e) => debug!(repository = %label(path), error = %e, "pull request lookup failed"),
        }

        let url = run_cli(
            path,
            "gh",
            &[
                "pr", "create", "--head", pr.branch, "--base", pr.base, "--title", pr.title, "--body", pr.body,
            ],
        )
        .await?;
        info!(repository = %label(path), %url, "pull request created");
        Ok(url)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;
    use tempfile::tempdir;

    /// A repository with one commit on `main`, usable as a file-path remote.
    pub(crate) fn fixture_remote(dir: &Path) -> PathBuf {
        let path = dir.join("remote");
        let repo = Repository::init(&path).unwrap();
        fs::write(path.join("README.md"), "hello\n").unwrap();
        commit_file(&repo, "initial commit");
        path
    }

    pub(crate) fn commit_file(repo: &Repository, message: &str) {
        let mut index = repo.index().unwrap();
        index
            .add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)
            .unwrap();
        index.write().unwrap();
        let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
        let sig = Signature::now("test", "test@test.com").unwrap();
        let parent = repo
            .find_reference("refs/heads/main")
            .ok()
            .and_then(|r| r.peel_to_commit().ok());
        let parents: Vec<&git2::Commit<'_>> = parent.iter().collect();
        repo.commit(Some("refs/heads/main"), &sig, &sig, message, &tree, &parents)
            .unwrap();
        repo.set_head("refs/heads/main").unwrap();
    }

    #[tokio::test]
    async fn test_clone_and_status() {
        let dir = tempdir().unwrap();
        let remote = fixture_remote(dir.path());
        let clone = dir.path().join("slot").join("demo");
        let vcs = GitVcs::new();
        vcs.clone_repo(remote.to_str().unwrap(), &clone, "main").await.unwrap();

        let status = vcs.status(&clone).await.unwrap();
        assert_eq!(status.current_branch.as_deref(), Some("main"));
        assert!(!status.dirty);
        assert_eq!(status.last_commit.unwrap().summary, "initial commit");

        fs::write(clone.join("README.md"), "changed\n").unwrap();
        fs::write(clone.join("untracked.txt"), "new\n").unwrap();
        let status = vcs.status(&clone).await.unwrap();
        assert!(status.dirty);
        assert_eq!(status.dirty_files, vec!["README.md"]);

        vcs.hard_reset(&clone).await.unwrap();
        assert!(!vcs.status(&clone).await.unwrap().dirty);
    }

    #[tokio::test]
    async fn test_sync_fast_forwards() {
        let dir = tempdir().unwrap();
        let remote = fixture_remote(dir.path());
        let clone = dir.path().join("clone");
        let vcs = GitVcs::new();
        vcs.clone_repo(remote.to_str().unwrap(), &clone, "main").await.unwrap();

        let remote_repo = Repository::open(&remote).unwrap();
        fs::write(remote.join("CHANGELOG.md"), "v2\n").unwrap();
        commit_file(&remote_repo, "second commit");

        vcs.sync(&clone, "main").await.unwrap();
        let status = vcs.status(&clone).await.unwrap();
        assert_eq!(status.last_commit.unwrap().summary, "second commit");
        assert!(clone.join("CHANGELOG.md").exists());
    }

    #[tokio::test]
    async fn test_branch_commit_and_cleanup() {
        let dir = tempdir().unwrap();
        let remote = fixture_remote(dir.path());
        let clone = dir.path().join("clone");
        let vcs = GitVcs::new();
        vcs.clone_repo(remote.to_str().unwrap(), &clone, "main").await.unwrap();

        fs::write(clone.join("fix.rs"), "fn main() {}\n").unwrap();
        vcs.create_branch(&clone, "shipyard/fix").await.unwrap();
        assert!(clone.join("fix.rs").exists());
        let status = vcs.status(&clone).await.unwrap();
        assert_eq!(status.current_branch.as_deref(), Some("shipyard/fix"));

        let commit = vcs.commit_all(&clone, "add fix").await.unwrap();
        assert!(commit.is_some());
        assert_eq!(vcs.commit_all(&clone, "again").await.unwrap(), None);

        vcs.checkout(&clone, "main", true).await.unwrap();
        assert!(!clone.join("fix.rs").exists());
        vcs.delete_branch(&clone, "shipyard/fix").await.unwrap();
        vcs.delete_branch(&clone, "shipyard/fix").await.unwrap();
        let repo = Repository::open(&clone).unwrap();
        assert!(repo.find_branch("shipyard/fix", BranchType::Local).is_err());
    }

    #[tokio::test]
    async fn test_open_missing_repository_is_vcs_error() {
        let dir = tempdir().unwrap();
        let err = GitVcs::new().status(&dir.path().join("nope")).await.unwrap_err();
        assert!(matches!(err, ShipyardError::Vcs { .. }));
    }
}
