//! Lease lock: exclusive, time-boxed ownership of a workspace slot.
//!
//! ## Race safety
//!
//! `acquire()` creates `{slot}/.lock` with `O_CREAT | O_EXCL`. Two racing
//! acquirers cannot both win the create; the loser reads the winner's lease
//! and reports `WorkspaceLocked`.
//!
//! ## Stale leases
//!
//! Staleness is purely time-based: a lease whose `lease_expires_at` has
//! passed. The file is re-read and the expiry re-checked right before it is
//! removed, then the create is retried exactly once. A lock file that cannot
//! be parsed is never reclaimed because its expiry cannot be proven.
//!
//! ## Lost leases
//!
//! A long command can outlive its lease and have the slot reclaimed under
//! it. Every write re-reads the lock file first and refuses to overwrite a
//! lease with a different id.

use anyhow::Context;
use chrono::{DateTime, Duration, Utc};
use shipyard_common::{Lease, LeaseParams, Phase};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::errors::{LockHolder, Result, ShipyardError};
use crate::util::write_atomic;

pub const LOCK_FILE: &str = ".lock";
pub const STATE_DIR: &str = ".state";

/// What the lock file of a slot currently says.
#[derive(Debug, Clone)]
pub enum LockState {
    Free,
    Active(Box<Lease>),
    Stale(Box<Lease>),
    /// Present but unreadable; treated as held.
    Unreadable(String),
}

impl LockState {
    pub fn is_free(&self) -> bool {
        matches!(self, LockState::Free)
    }

    pub fn label(&self) -> &'static str {
        match self {
            LockState::Free => "free",
            LockState::Active(_) => "active",
            LockState::Stale(_) => "stale",
            LockState::Unreadable(_) => "unreadable",
        }
    }
}

enum CreateOutcome {
    Created,
    Exists,
}

pub fn holder_of(lease: &Lease) -> LockHolder {
    LockHolder {
        slot: lease.slot.clone(),
        task_description: lease.task_description.clone(),
        phase: Some(lease.phase),
        owner: Some(lease.owner.clone()),
        lease_expires_at: Some(lease.lease_expires_at),
    }
}

fn unreadable_holder(slot: &str, reason: &str) -> LockHolder {
    LockHolder {
        slot: slot.to_string(),
        task_description: format!("<unreadable lock file: {reason}>"),
        phase: None,
        owner: None,
        lease_expires_at: None,
    }
}

/// Handle on one slot's lock file.
#[derive(Debug, Clone)]
pub struct LeaseLock {
    slot: String,
    root: PathBuf,
}

impl LeaseLock {
    pub fn new(slot: &str, root: &Path) -> Self {
        Self {
            slot: slot.to_string(),
            root: root.to_path_buf(),
        }
    }

    pub fn slot(&self) -> &str {
        &self.slot
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn lock_path(&self) -> PathBuf {
        self.root.join(LOCK_FILE)
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.join(STATE_DIR)
    }

    fn read(&self) -> std::result::Result<Option<Lease>, String> {
        let path = self.lock_path();
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.to_string()),
        };
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| e.to_string())
    }

    /// Classify the lock file without touching it.
    pub fn inspect(&self, now: DateTime<Utc>) -> LockState {
        match self.read() {
            Ok(None) => LockState::Free,
            Ok(Some(lease)) if lease.is_expired_at(now) => LockState::Stale(Box::new(lease)),
            Ok(Some(lease)) => LockState::Active(Box::new(lease)),
            Err(reason) => LockState::Unreadable(reason),
        }
    }

    fn try_create(&self, lease: &Lease) -> Result<CreateOutcome> {
        std::fs::create_dir_all(&self.root)
            .with_context(|| format!("Failed to create slot root {}", self.root.display()))?;
        let path = self.lock_path();
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                let json = serde_json::to_string_pretty(lease).context("Failed to serialize lease")?;
                file.write_all(json.as_bytes())
                    .and_then(|_| file.sync_all())
                    .with_context(|| format!("Failed to write {}", path.display()))?;
                Ok(CreateOutcome::Created)
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(CreateOutcome::Exists),
            Err(e) => Err(anyhow::Error::new(e)
                .context(format!("Failed to create {}", path.display()))
                .into()),
        }
    }

    /// Atomically claim the slot with a fresh lease.
    pub fn acquire(&self, params: LeaseParams, now: DateTime<Utc>, duration: Duration) -> Result<Lease> {
        let lease = Lease::new(params, now, duration);

        for attempt in 0..2 {
            if let CreateOutcome::Created = self.try_create(&lease)? {
                info!(slot = %self.slot, lease_id = %lease.lease_id, "lease acquired");
                return Ok(lease);
            }
            match self.inspect(now) {
                LockState::Active(current) => {
                    return Err(ShipyardError::WorkspaceLocked {
                        holder: holder_of(&current),
                    });
                }
                LockState::Unreadable(reason) => {
                    warn!(slot = %self.slot, %reason, "lock file unreadable; treating slot as locked");
                    return Err(ShipyardError::WorkspaceLocked {
                        holder: unreadable_holder(&self.slot, &reason),
                    });
                }
                LockState::Stale(old) if attempt == 0 => {
                    self.reclaim_stale(&old, now)?;
                }
                // Removed between our create and our read: retry once.
                LockState::Free if attempt == 0 => {}
                LockState::Stale(old) => {
                    return Err(ShipyardError::WorkspaceLocked {
                        holder: holder_of(&old),
                    });
                }
                LockState::Free => break,
            }
        }

        // Lost the recreate race after reclaiming.
        match self.inspect(now) {
            LockState::Active(current) | LockState::Stale(current) => Err(ShipyardError::WorkspaceLocked {
                holder: holder_of(&current),
            }),
            LockState::Unreadable(reason) => Err(ShipyardError::WorkspaceLocked {
                holder: unreadable_holder(&self.slot, &reason),
            }),
            LockState::Free => Err(ShipyardError::WorkspaceLocked {
                holder: unreadable_holder(&self.slot, "contended"),
            }),
        }
    }

    /// Remove a stale lease after proving, on a fresh read, that it is the
    /// same lease and still expired.
    fn reclaim_stale(&self, seen: &Lease, now: DateTime<Utc>) -> Result<()> {
        match self.read() {
            Ok(Some(current)) if current.lease_id == seen.lease_id && current.is_expired_at(now) => {
                match std::fs::remove_file(self.lock_path()) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => {
                        return Err(anyhow::Error::new(e)
                            .context("Failed to remove stale lock file")
                            .into());
                    }
                }
                self.remove_state()?;
                info!(
                    slot = %self.slot,
                    previous_task = %current.task_description,
                    expired_at = %current.lease_expires_at,
                    "reclaimed stale lease"
                );
                Ok(())
            }
            Ok(Some(current)) if current.is_active_at(now) => Err(ShipyardError::WorkspaceLocked {
                holder: holder_of(&current),
            }),
            // Already gone, or replaced by another stale lease: let the retry decide.
            Ok(_) => Ok(()),
            Err(reason) => Err(ShipyardError::WorkspaceLocked {
                holder: unreadable_holder(&self.slot, &reason),
            }),
        }
    }

    /// The live lease, or `NoActiveLease` / `LeaseExpired`.
    pub fn load_active(&self, now: DateTime<Utc>) -> Result<Lease> {
        match self.inspect(now) {
            LockState::Active(lease) => Ok(*lease),
            LockState::Stale(lease) => Err(ShipyardError::LeaseExpired {
                slot: self.slot.clone(),
                expired_at: lease.lease_expires_at,
                phase: lease.phase,
            }),
            LockState::Free => Err(ShipyardError::NoActiveLease {
                slot: self.slot.clone(),
            }),
            LockState::Unreadable(reason) => Err(anyhow::anyhow!(
                "Lock file {} is unreadable: {}",
                self.lock_path().display(),
                reason
            )
            .into()),
        }
    }

    /// Fails unless the lock file still holds `lease` (same `lease_id`).
    pub fn verify_held(&self, lease: &Lease) -> Result<()> {
        match self.read() {
            Ok(Some(current)) if current.lease_id == lease.lease_id => Ok(()),
            Ok(Some(current)) => {
                warn!(
                    slot = %self.slot,
                    lost = %lease.lease_id,
                    holder = %current.lease_id,
                    "lease was reclaimed by another caller"
                );
                Err(ShipyardError::WorkspaceLocked {
                    holder: holder_of(&current),
                })
            }
            Ok(None) => Err(ShipyardError::NoActiveLease {
                slot: self.slot.clone(),
            }),
            Err(reason) => Err(ShipyardError::WorkspaceLocked {
                holder: unreadable_holder(&self.slot, &reason),
            }),
        }
    }

    /// Persist the lease through temp file + rename. The slot must still
    /// hold this lease.
    pub fn save(&self, lease: &Lease) -> Result<()> {
        self.verify_held(lease)?;
        let mut json = serde_json::to_string_pretty(lease).context("Failed to serialize lease")?;
        json.push('\n');
        write_atomic(&self.lock_path(), json.as_bytes())?;
        debug!(slot = %self.slot, phase = %lease.phase, "lease saved");
        Ok(())
    }

    /// Record a completed transition and persist it before returning.
    pub fn advance(&self, lease: &mut Lease, next: Phase, now: DateTime<Utc>, duration: Duration) -> Result<()> {
        let from = lease.phase;
        lease.record_phase(next, now, duration);
        self.save(lease)?;
        info!(slot = %self.slot, %from, to = %next, round = lease.round, "phase transition");
        Ok(())
    }

    /// Push out the expiry of a live lease. No history entry is written.
    pub fn renew(&self, owner: Option<&str>, now: DateTime<Utc>, duration: Duration) -> Result<Lease> {
        let mut lease = self.load_active(now)?;
        check_owner(&lease, owner)?;
        lease.refresh(now, duration);
        self.save(&lease)?;
        info!(slot = %self.slot, expires_at = %lease.lease_expires_at, "lease renewed");
        Ok(lease)
    }

    /// The lease as stored, expired or not. Used by release.
    pub fn load_any(&self) -> Result<Lease> {
        match self.read() {
            Ok(Some(lease)) => Ok(lease),
            Ok(None) => Err(ShipyardError::NoActiveLease {
                slot: self.slot.clone(),
            }),
            Err(reason) => Err(anyhow::anyhow!(
                "Lock file {} is unreadable: {}",
                self.lock_path().display(),
                reason
            )
            .into()),
        }
    }

    /// Delete the lock file and every derived artifact.
    pub fn destroy(&self) -> Result<()> {
        self.remove_state()?;
        match std::fs::remove_file(self.lock_path()) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ShipyardError::NoActiveLease {
                    slot: self.slot.clone(),
                });
            }
            Err(e) => {
                return Err(anyhow::Error::new(e)
                    .context("Failed to remove lock file")
                    .into());
            }
        }
        info!(slot = %self.slot, "lease released");
        Ok(())
    }

    fn remove_state(&self) -> Result<()> {
        let dir = self.state_dir();
        if dir.exists() {
            std::fs::remove_dir_all(&dir)
                .with_context(|| format!("Failed to remove {}", dir.display()))?;
        }
        Ok(())
    }
}

/// A supplied owner must match the lease owner.
pub fn check_owner(lease: &Lease, owner: Option<&str>) -> Result<()> {
    match owner {
        Some(owner) if owner != lease.owner => Err(ShipyardError::WorkspaceLocked {
            holder: holder_of(lease),
        }),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn params(task: &str) -> LeaseParams {
        LeaseParams {
            slot: "env0".into(),
            task_description: task.into(),
            repository_names: vec!["demo".into()],
            engine_id: "claude".into(),
            associated_environment: None,
            owner: "agent".into(),
        }
    }

    fn hours(n: i64) -> Duration {
        Duration::hours(n)
    }

    #[test]
    fn test_acquire_creates_lock_file() {
        let dir = tempdir().unwrap();
        let lock = LeaseLock::new("env0", dir.path());
        let now = Utc::now();
        let lease = lock.acquire(params("fix bug"), now, hours(2)).unwrap();
        assert!(lock.lock_path().exists());
        assert_eq!(lease.phase, Phase::WorkspaceCheck);
        assert_eq!(lease.lease_expires_at, now + hours(2));
        assert!(matches!(lock.inspect(now), LockState::Active(_)));
    }

    #[test]
    fn test_second_acquire_reports_holder() {
        let dir = tempdir().unwrap();
        let lock = LeaseLock::new("env0", dir.path());
        let now = Utc::now();
        lock.acquire(params("first"), now, hours(2)).unwrap();
        let err = lock.acquire(params("second"), now, hours(2)).unwrap_err();
        match err {
            ShipyardError::WorkspaceLocked { holder } => {
                assert_eq!(holder.task_description, "first");
                assert_eq!(holder.phase, Some(Phase::WorkspaceCheck));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_stale_lease_is_reclaimed() {
        let dir = tempdir().unwrap();
        let lock = LeaseLock::new("env0", dir.path());
        let then = Utc::now() - hours(5);
        let old = lock.acquire(params("old"), then, hours(2)).unwrap();
        std::fs::create_dir_all(lock.state_dir()).unwrap();
        std::fs::write(lock.state_dir().join("test_report"), "{}").unwrap();

        let now = Utc::now();
        let fresh = lock.acquire(params("new"), now, hours(2)).unwrap();
        assert_ne!(fresh.lease_id, old.lease_id);
        assert!(fresh.started_at > old.updated_at);
        assert!(!lock.state_dir().exists());
        assert_eq!(lock.load_active(now).unwrap().task_description, "new");
    }

    #[test]
    fn test_corrupt_lock_is_never_reclaimed() {
        let dir = tempdir().unwrap();
        let lock = LeaseLock::new("env0", dir.path());
        std::fs::write(lock.lock_path(), "not json").unwrap();
        let err = lock.acquire(params("task"), Utc::now(), hours(2)).unwrap_err();
        assert!(matches!(err, ShipyardError::WorkspaceLocked { .. }));
        assert!(lock.lock_path().exists());
    }

    #[test]
    fn test_load_active_distinguishes_missing_and_expired() {
        let dir = tempdir().unwrap();
        let lock = LeaseLock::new("env0", dir.path());
        let now = Utc::now();
        assert!(matches!(
            lock.load_active(now).unwrap_err(),
            ShipyardError::NoActiveLease { .. }
        ));
        lock.acquire(params("task"), now - hours(3), hours(2)).unwrap();
        assert!(matches!(
            lock.load_active(now).unwrap_err(),
            ShipyardError::LeaseExpired { .. }
        ));
    }

    #[test]
    fn test_renew_refreshes_expiry_without_history() {
        let dir = tempdir().unwrap();
        let lock = LeaseLock::new("env0", dir.path());
        let start = Utc::now() - Duration::minutes(30);
        lock.acquire(params("task"), start, hours(2)).unwrap();
        let now = Utc::now();
        let renewed = lock.renew(None, now, hours(2)).unwrap();
        assert_eq!(renewed.lease_expires_at, now + hours(2));
        assert_eq!(renewed.phase_history.len(), 1);

        let again = lock.renew(Some("agent"), now, hours(2)).unwrap();
        assert_eq!(again.lease_expires_at, renewed.lease_expires_at);
        assert!(lock.renew(Some("intruder"), now, hours(2)).is_err());
    }

    #[test]
    fn test_advance_persists_transition() {
        let dir = tempdir().unwrap();
        let lock = LeaseLock::new("env0", dir.path());
        let now = Utc::now();
        let mut lease = lock.acquire(params("task"), now, hours(2)).unwrap();
        lock.advance(&mut lease, Phase::Analyzing, now, hours(2)).unwrap();
        let stored = lock.load_active(now).unwrap();
        assert_eq!(stored.phase, Phase::Analyzing);
        assert_eq!(stored.phase_history.len(), 2);
    }

    #[test]
    fn test_save_refuses_to_overwrite_a_reclaimed_slot() {
        let dir = tempdir().unwrap();
        let lock = LeaseLock::new("env0", dir.path());
        let start = Utc::now() - hours(3);
        let mut first = lock.acquire(params("first"), start, hours(2)).unwrap();

        let second = lock.acquire(params("second"), Utc::now(), hours(2)).unwrap();

        first.refresh(Utc::now(), hours(2));
        let err = lock.save(&first).unwrap_err();
        match err {
            ShipyardError::WorkspaceLocked { holder } => assert_eq!(holder.task_description, "second"),
            other => panic!("unexpected error: {other:?}"),
        }
        let err = lock
            .advance(&mut first, Phase::Analyzing, Utc::now(), hours(2))
            .unwrap_err();
        assert!(matches!(err, ShipyardError::WorkspaceLocked { .. }));

        let stored = lock.load_active(Utc::now()).unwrap();
        assert_eq!(stored.lease_id, second.lease_id);
        assert_eq!(stored.phase, Phase::WorkspaceCheck);
    }

    #[test]
    fn test_save_after_release_reports_no_lease() {
        let dir = tempdir().unwrap();
        let lock = LeaseLock::new("env0", dir.path());
        let lease = lock.acquire(params("task"), Utc::now(), hours(2)).unwrap();
        lock.destroy().unwrap();
        assert!(matches!(
            lock.save(&lease).unwrap_err(),
            ShipyardError::NoActiveLease { .. }
        ));
        assert!(!lock.lock_path().exists());
    }

    #[test]
    fn test_destroy_twice_reports_no_lease() {
        let dir = tempdir().unwrap();
        let lock = LeaseLock::new("env0", dir.path());
        lock.acquire(params("task"), Utc::now(), hours(2)).unwrap();
        std::fs::create_dir_all(lock.state_dir().join("features")).unwrap();
        lock.destroy().unwrap();
        assert!(!lock.lock_path().exists());
        assert!(!lock.state_dir().exists());
        assert!(matches!(
            lock.destroy().unwrap_err(),
            ShipyardError::NoActiveLease { .. }
        ));
    }

    #[test]
    fn test_concurrent_acquire_has_one_winner() {
        let dir = tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let root = root.clone();
                std::thread::spawn(move || {
                    let lock = LeaseLock::new("env0", &root);
                    lock.acquire(params(&format!("task-{i}")), Utc::now(), hours(2))
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(
            results
                .iter()
                .filter_map(|r| r.as_ref().err())
                .all(|e| matches!(e, ShipyardError::WorkspaceLocked { .. }))
        );
    }
}
