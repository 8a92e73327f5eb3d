//! Workspace allocator: resolves repositories and a slot to a lease-held
//! working tree, materialises every repository in it, and snapshots the
//! result.

pub mod probe;
pub mod tooling;

pub use probe::{RepoProbe, WorkspaceSnapshot};
pub use tooling::Tooling;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use shipyard_common::{Lease, LeaseParams};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::errors::{LockHolder, Result, ShipyardError};
use crate::lease::{LeaseLock, LockState};
use crate::registry::{Registry, RepositoryConfig, WorkspaceSlot};
use crate::state::{Artifact, StateStore};
use crate::vcs::VersionControl;

const MAX_SEARCH_FILE_BYTES: u64 = 1024 * 1024;

#[derive(Debug, Clone, Default)]
pub struct AcquireRequest {
    pub repositories: Vec<String>,
    pub task_description: String,
    pub engine: String,
    pub slot: Option<String>,
    pub environment: Option<String>,
    pub owner: String,
    /// Hard-reset dirty clones instead of failing with `GitDirty`.
    pub auto_clean: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct Acquisition {
    pub lease: Lease,
    pub snapshot: WorkspaceSnapshot,
}

pub struct WorkspaceAllocator<'a> {
    registry: &'a Registry,
    config: &'a Config,
    vcs: &'a dyn VersionControl,
}

impl<'a> WorkspaceAllocator<'a> {
    pub fn new(registry: &'a Registry, config: &'a Config, vcs: &'a dyn VersionControl) -> Self {
        Self { registry, config, vcs }
    }

    pub async fn check_and_acquire(&self, request: &AcquireRequest, now: DateTime<Utc>) -> Result<Acquisition> {
        if request.repositories.is_empty() {
            return Err(ShipyardError::InvalidInput(
                "at least one repository is required".to_string(),
            ));
        }
        if request.task_description.trim().is_empty() {
            return Err(ShipyardError::InvalidInput("task description is empty".to_string()));
        }
        let mut seen = BTreeSet::new();
        if let Some(dup) = request.repositories.iter().find(|r| !seen.insert(r.as_str())) {
            return Err(ShipyardError::InvalidInput(format!("repository '{dup}' named twice")));
        }

        let repos: Vec<RepositoryConfig> = request
            .repositories
            .iter()
            .map(|name| self.registry.repository(name))
            .collect::<Result<_>>()?;
        if let Some(env) = &request.environment {
            self.registry.environment(env)?;
        }

        let params = LeaseParams {
            slot: String::new(),
            task_description: request.task_description.clone(),
            repository_names: request.repositories.clone(),
            engine_id: request.engine.clone(),
            associated_environment: request.environment.clone(),
            owner: request.owner.clone(),
        };
        let (slot, lock, mut lease) = self.claim_slot(request.slot.as_deref(), params, now)?;

        match self.materialize(&slot, &repos, request.auto_clean, now).await {
            Ok(snapshot) => {
                let state = StateStore::new(&slot.root_path);
                let path = state.write(Artifact::WorkspaceSnapshot, &snapshot)?;
                lease.record_artifact(Artifact::WorkspaceSnapshot.name(), path);
                for repo in &snapshot.repositories {
                    if let Some(branch) = &repo.current_branch {
                        lease.original_branches.insert(repo.name.clone(), branch.clone());
                    }
                }
                lock.save(&lease)?;
                info!(slot = %slot.name, repositories = repos.len(), "workspace acquired");
                Ok(Acquisition { lease, snapshot })
            }
            Err(e) => {
                warn!(slot = %slot.name, error = %e, "materialisation failed; releasing fresh lease");
                if let Err(cleanup) = lock.destroy() {
                    warn!(slot = %slot.name, error = %cleanup, "failed to remove lease after error");
                }
                Err(e)
            }
        }
    }

    /// Create the lease on the requested slot, or on the first free one.
    fn claim_slot(
        &self,
        requested: Option<&str>,
        params: LeaseParams,
        now: DateTime<Utc>,
    ) -> Result<(WorkspaceSlot, LeaseLock, Lease)> {
        let duration = self.config.lease_duration;
        if let Some(name) = requested {
            let slot = self.registry.workspace(name)?;
            let lock = LeaseLock::new(&slot.name, &slot.root_path);
            let lease = lock.acquire(with_slot(&params, &slot.name), now, duration)?;
            return Ok((slot, lock, lease));
        }

        let slots = self.registry.workspaces()?;
        if slots.is_empty() {
            return Err(ShipyardError::InvalidInput(
                "no workspace slots are registered".to_string(),
            ));
        }
        let mut holders: Vec<LockHolder> = Vec::new();
        for slot in slots {
            let lock = LeaseLock::new(&slot.name, &slot.root_path);
            match lock.acquire(with_slot(&params, &slot.name), now, duration) {
                Ok(lease) => return Ok((slot, lock, lease)),
                Err(ShipyardError::WorkspaceLocked { holder }) => {
                    debug!(slot = %slot.name, "slot busy");
                    holders.push(holder);
                }
                Err(e) => return Err(e),
            }
        }
        Err(ShipyardError::AllSlotsLocked { holders })
    }

    async fn materialize(
        &self,
        slot: &WorkspaceSlot,
        repos: &[RepositoryConfig],
        auto_clean: bool,
        now: DateTime<Utc>,
    ) -> Result<WorkspaceSnapshot> {
        let mut probes = Vec::with_capacity(repos.len());
        for repo in repos {
            let path = slot.root_path.join(&repo.name);
            let mut cleaned = false;
            let freshly_cloned = !path.join(".git").exists();

            if freshly_cloned {
                self.vcs
                    .clone_repo(&repo.remote_url, &path, &repo.default_branch)
                    .await?;
            } else {
                let status = self.vcs.status(&path).await?;
                if status.dirty {
                    if !auto_clean {
                        return Err(ShipyardError::GitDirty {
                            repository: repo.name.clone(),
                            files: status.dirty_files,
                        });
                    }
                    self.vcs.hard_reset(&path).await?;
                    cleaned = true;
                }
                self.vcs.sync(&path, &repo.default_branch).await?;
            }

            let status = self.vcs.status(&path).await?;
            probes.push(RepoProbe {
                name: repo.name.clone(),
                tooling: tooling::detect_for(&path, repo),
                path,
                remote_url: repo.remote_url.clone(),
                default_branch: repo.default_branch.clone(),
                current_branch: status.current_branch,
                dirty: status.dirty,
                last_commit: status.last_commit,
                freshly_cloned,
                cleaned,
            });
        }

        Ok(WorkspaceSnapshot {
            slot: slot.name.clone(),
            root: slot.root_path.clone(),
            primary_repository: repos
                .first()
                .map(|r| r.name.clone())
                .unwrap_or_default(),
            repositories: probes,
            captured_at: now,
        })
    }
}

fn with_slot(params: &LeaseParams, slot: &str) -> LeaseParams {
    LeaseParams {
        slot: slot.to_string(),
        ..params.clone()
    }
}

/// Lock state of one slot, for `status`.
#[derive(Debug, Clone, Serialize)]
pub struct SlotStatus {
    pub slot: String,
    pub root: PathBuf,
    pub state: &'static str,
    pub lease: Option<Lease>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Read-only view of one slot or all of them.
pub fn slot_statuses(registry: &Registry, slot: Option<&str>, now: DateTime<Utc>) -> Result<Vec<SlotStatus>> {
    let slots = match slot {
        Some(name) => vec![registry.workspace(name)?],
        None => registry.workspaces()?,
    };
    Ok(slots
        .into_iter()
        .map(|slot| {
            let state = LeaseLock::new(&slot.name, &slot.root_path).inspect(now);
            let label = state.label();
            let (lease, detail) = match state {
                LockState::Free => (None, None),
                LockState::Active(lease) => (Some(*lease), None),
                LockState::Stale(lease) => (
                    Some(*lease),
                    Some("lease expired; the next acquire reclaims this slot".to_string()),
                ),
                LockState::Unreadable(reason) => (None, Some(reason)),
            };
            SlotStatus {
                slot: slot.name,
                root: slot.root_path,
                state: label,
                lease,
                detail,
            }
        })
        .collect())
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub repository: String,
    pub slot: String,
    pub path: String,
    pub line: usize,
    pub text: String,
}

/// Grep the tracked files of a repository clone in any slot. Never touches
/// the lock, so it works while the slot is leased by someone else.
pub fn search(
    registry: &Registry,
    repository: &str,
    pattern: &str,
    slot: Option<&str>,
    limit: usize,
) -> Result<Vec<SearchHit>> {
    registry.repository(repository)?;
    let regex = Regex::new(pattern)
        .map_err(|e| ShipyardError::InvalidInput(format!("invalid search pattern: {e}")))?;

    let slots = match slot {
        Some(name) => vec![registry.workspace(name)?],
        None => registry.workspaces()?,
    };
    let (slot, clone) = slots
        .into_iter()
        .map(|s| {
            let clone = s.root_path.join(repository);
            (s, clone)
        })
        .find(|(_, clone)| clone.join(".git").exists())
        .ok_or_else(|| ShipyardError::not_found("clone", repository))?;

    let repo = git2::Repository::open(&clone).map_err(|e| ShipyardError::vcs(repository, e))?;
    let index = repo.index().map_err(|e| ShipyardError::vcs(repository, e))?;

    let mut hits = Vec::new();
    for entry in index.iter() {
        let relative = String::from_utf8_lossy(&entry.path).into_owned();
        let file = clone.join(&relative);
        if !is_searchable(&file) {
            continue;
        }
        let Ok(content) = std::fs::read_to_string(&file) else {
            continue;
        };
        for (n, line) in content.lines().enumerate() {
            if regex.is_match(line) {
                hits.push(SearchHit {
                    repository: repository.to_string(),
                    slot: slot.name.clone(),
                    path: relative.clone(),
                    line: n + 1,
                    text: line.trim_end().to_string(),
                });
                if hits.len() >= limit {
                    return Ok(hits);
                }
            }
        }
    }
    Ok(hits)
}

fn is_searchable(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.len() <= MAX_SEARCH_FILE_BYTES)
        .unwrap_or(false)
}
