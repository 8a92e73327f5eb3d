//! The lease record persisted in a slot's `.lock` file.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use uuid::Uuid;

use crate::phase::{Complexity, Phase};

/// One completed phase in a lease's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub phase: Phase,
    pub completed_at: DateTime<Utc>,
    /// Loop-back counter at the time the phase completed.
    #[serde(default)]
    pub round: u32,
}

/// Inputs for creating a fresh lease.
#[derive(Debug, Clone)]
pub struct LeaseParams {
    pub slot: String,
    pub task_description: String,
    pub repository_names: Vec<String>,
    pub engine_id: String,
    pub associated_environment: Option<String>,
    pub owner: String,
}

/// Exclusive, time-boxed claim on a workspace slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lease {
    pub lease_id: Uuid,
    pub slot: String,
    pub task_description: String,
    pub repository_names: Vec<String>,
    #[serde(default)]
    pub branch_per_repository: BTreeMap<String, String>,
    /// Branch each repository was on right after sync; cleanup returns here.
    #[serde(default)]
    pub original_branches: BTreeMap<String, String>,
    pub engine_id: String,
    #[serde(default)]
    pub associated_environment: Option<String>,
    pub owner: String,
    pub phase: Phase,
    #[serde(default)]
    pub phase_history: Vec<PhaseRecord>,
    #[serde(default)]
    pub artifact_paths: BTreeMap<String, PathBuf>,
    #[serde(default)]
    pub pushed_to_remote: bool,
    #[serde(default)]
    pub pull_requests: BTreeMap<String, String>,
    /// Branches pushed whose pull request has not been recorded yet.
    #[serde(default)]
    pub pending_pull_requests: BTreeMap<String, String>,
    #[serde(default)]
    pub complexity: Option<Complexity>,
    #[serde(default)]
    pub awaiting_confirmation: bool,
    #[serde(default)]
    pub test_fix_rounds: u32,
    #[serde(default)]
    pub lint_fix_used: bool,
    #[serde(default)]
    pub round: u32,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub lease_expires_at: DateTime<Utc>,
}

impl Lease {
    /// A new lease in `workspace-check`, expiring `duration` from `now`.
    pub fn new(params: LeaseParams, now: DateTime<Utc>, duration: Duration) -> Self {
        Self {
            lease_id: Uuid::new_v4(),
            slot: params.slot,
            task_description: params.task_description,
            repository_names: params.repository_names,
            branch_per_repository: BTreeMap::new(),
            original_branches: BTreeMap::new(),
            engine_id: params.engine_id,
            associated_environment: params.associated_environment,
            owner: params.owner,
            phase: Phase::WorkspaceCheck,
            phase_history: vec![PhaseRecord {
                phase: Phase::WorkspaceCheck,
                completed_at: now,
                round: 0,
            }],
            artifact_paths: BTreeMap::new(),
            pushed_to_remote: false,
            pull_requests: BTreeMap::new(),
            pending_pull_requests: BTreeMap::new(),
            complexity: None,
            awaiting_confirmation: false,
            test_fix_rounds: 0,
            lint_fix_used: false,
            round: 0,
            started_at: now,
            updated_at: now,
            lease_expires_at: now + duration,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.lease_expires_at <= now
    }

    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        !self.is_expired_at(now)
    }

    /// The primary repository is the first one named at allocation.
    pub fn primary_repository(&self) -> Option<&str> {
        self.repository_names.first().map(String::as_str)
    }

    /// Push the lease expiry out without recording a transition.
    pub fn refresh(&mut self, now: DateTime<Utc>, duration: Duration) {
        self.updated_at = now;
        self.lease_expires_at = now + duration;
    }

    /// Record a completed transition into `next` and refresh the lease.
    ///
    /// Callers validate the transition first; a loop-back starts a new round
    /// and resets the per-round fix budgets.
    pub fn record_phase(&mut self, next: Phase, now: DateTime<Utc>, duration: Duration) {
        if self.phase.is_loop_back(next) {
            self.round += 1;
            self.test_fix_rounds = 0;
            self.lint_fix_used = false;
        }
        self.phase = next;
        self.phase_history.push(PhaseRecord {
            phase: next,
            completed_at: now,
            round: self.round,
        });
        self.refresh(now, duration);
    }

    pub fn record_artifact(&mut self, name: &str, path: PathBuf) {
        self.artifact_paths.insert(name.to_string(), path);
    }

    /// `(round, phase)` never decreases along the history.
    pub fn history_is_monotonic(&self) -> bool {
        self.phase_history
            .windows(2)
            .all(|w| (w[0].round, w[0].phase) <= (w[1].round, w[1].phase))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> LeaseParams {
        LeaseParams {
            slot: "env0".into(),
            task_description: "fix timezone bug".into(),
            repository_names: vec!["demo".into(), "docs".into()],
            engine_id: "claude".into(),
            associated_environment: None,
            owner: "agent-1".into(),
        }
    }

    #[test]
    fn new_lease_starts_in_workspace_check() {
        let now = Utc::now();
        let lease = Lease::new(params(), now, Duration::hours(2));
        assert_eq!(lease.phase, Phase::WorkspaceCheck);
        assert_eq!(lease.phase_history.len(), 1);
        assert_eq!(lease.lease_expires_at, now + Duration::hours(2));
        assert_eq!(lease.primary_repository(), Some("demo"));
        assert!(lease.is_active_at(now));
        assert!(lease.is_expired_at(now + Duration::hours(2)));
    }

    #[test]
    fn record_phase_refreshes_expiry() {
        let start = Utc::now();
        let mut lease = Lease::new(params(), start, Duration::hours(2));
        let later = start + Duration::minutes(90);
        lease.record_phase(Phase::Analyzing, later, Duration::hours(2));
        assert_eq!(lease.phase, Phase::Analyzing);
        assert_eq!(lease.updated_at, later);
        assert_eq!(lease.lease_expires_at, later + Duration::hours(2));
    }

    #[test]
    fn loop_back_starts_new_round_and_resets_budgets() {
        let now = Utc::now();
        let mut lease = Lease::new(params(), now, Duration::hours(2));
        for phase in [
            Phase::Analyzing,
            Phase::Confirmed,
            Phase::Developing,
            Phase::Testing,
            Phase::Submitted,
        ] {
            lease.record_phase(phase, now, Duration::hours(2));
        }
        lease.test_fix_rounds = 2;
        lease.lint_fix_used = true;
        lease.record_phase(Phase::Developing, now, Duration::hours(2));
        assert_eq!(lease.round, 1);
        assert_eq!(lease.test_fix_rounds, 0);
        assert!(!lease.lint_fix_used);
        assert!(lease.history_is_monotonic());
    }

    #[test]
    fn history_out_of_order_is_detected() {
        let now = Utc::now();
        let mut lease = Lease::new(params(), now, Duration::hours(2));
        lease.phase_history.push(PhaseRecord {
            phase: Phase::Testing,
            completed_at: now,
            round: 0,
        });
        lease.phase_history.push(PhaseRecord {
            phase: Phase::Analyzing,
            completed_at: now,
            round: 0,
        });
        assert!(!lease.history_is_monotonic());
    }

    #[test]
    fn lease_json_tolerates_missing_optional_fields() {
        let now = Utc::now();
        let lease = Lease::new(params(), now, Duration::hours(2));
        let mut value = serde_json::to_value(&lease).unwrap();
        let obj = value.as_object_mut().unwrap();
        obj.remove("pull_requests");
        obj.remove("round");
        obj.remove("complexity");
        let parsed: Lease = serde_json::from_value(value).unwrap();
        assert_eq!(parsed.round, 0);
        assert!(parsed.pull_requests.is_empty());
    }
}
