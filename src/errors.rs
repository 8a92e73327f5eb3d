//! Typed error hierarchy for shipyard.
//!
//! Every variant maps onto one stable [`ErrorKind`] classifier and carries the
//! state a caller needs to decide what to do next (lock holder, unmet
//! criteria, current phase). Internal plumbing uses `anyhow` and lands in
//! `Other`, which classifies as `Internal`.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Value, json};
use shipyard_common::{ErrorKind, ErrorPayload, Phase};
use thiserror::Error;

pub type Result<T, E = ShipyardError> = std::result::Result<T, E>;

/// Who currently holds a slot, as far as the lock file tells.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LockHolder {
    pub slot: String,
    pub task_description: String,
    pub phase: Option<Phase>,
    pub owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Error)]
pub enum ShipyardError {
    #[error("{entity} '{name}' is not registered")]
    PathNotFound { entity: String, name: String },

    #[error("Workspace slot '{}' is locked by task '{}'", .holder.slot, .holder.task_description)]
    WorkspaceLocked { holder: LockHolder },

    #[error("All {} workspace slots are locked", .holders.len())]
    AllSlotsLocked { holders: Vec<LockHolder> },

    #[error("Repository '{repository}' has uncommitted changes")]
    GitDirty {
        repository: String,
        files: Vec<String>,
    },

    #[error("No active lease on slot '{slot}'")]
    NoActiveLease { slot: String },

    #[error("Lease on slot '{slot}' expired at {expired_at}")]
    LeaseExpired {
        slot: String,
        expired_at: DateTime<Utc>,
        phase: Phase,
    },

    #[error("Engine '{engine}' timed out after {seconds}s")]
    EngineTimeout { engine: String, seconds: u64 },

    #[error("Engine '{engine}' failed: {message}")]
    EngineError { engine: String, message: String },

    #[error("Command '{command}' denied on environment '{environment}': {reason}")]
    CommandDenied {
        environment: String,
        command: String,
        reason: String,
    },

    #[error("Checks failed after {fix_rounds} automatic fix rounds")]
    TestFailed {
        fix_rounds: u32,
        lint_only: bool,
        decision_required: bool,
        failing_repositories: Vec<String>,
    },

    #[error("Feature {index} has unmet criteria: {}", .unmet.join(", "))]
    CriteriaNotMet { index: usize, unmet: Vec<String> },

    #[error("Invalid feature dependency graph: {message}")]
    DependencyCycle { message: String, involved: Vec<usize> },

    #[error("{entity} '{name}' already exists")]
    DuplicateName { entity: String, name: String },

    #[error("Cannot run '{command}' while in phase {phase}")]
    InvalidTransition {
        command: String,
        phase: Phase,
        allowed: Vec<String>,
    },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Version control error in '{repository}': {message}")]
    Vcs { repository: String, message: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ShipyardError {
    pub fn not_found(entity: &str, name: &str) -> Self {
        Self::PathNotFound {
            entity: entity.to_string(),
            name: name.to_string(),
        }
    }

    pub fn vcs(repository: &str, message: impl std::fmt::Display) -> Self {
        Self::Vcs {
            repository: repository.to_string(),
            message: message.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::PathNotFound { .. } => ErrorKind::PathNotFound,
            Self::WorkspaceLocked { .. } => ErrorKind::WorkspaceLocked,
            Self::AllSlotsLocked { .. } => ErrorKind::AllSlotsLocked,
            Self::GitDirty { .. } => ErrorKind::GitDirty,
            Self::NoActiveLease { .. } => ErrorKind::NoActiveLease,
            Self::LeaseExpired { .. } => ErrorKind::LeaseExpired,
            Self::EngineTimeout { .. } => ErrorKind::EngineTimeout,
            Self::EngineError { .. } => ErrorKind::EngineError,
            Self::CommandDenied { .. } => ErrorKind::CommandDenied,
            Self::TestFailed { .. } => ErrorKind::TestFailed,
            Self::CriteriaNotMet { .. } => ErrorKind::CriteriaNotMet,
            Self::DependencyCycle { .. } => ErrorKind::DependencyCycle,
            Self::DuplicateName { .. } => ErrorKind::DuplicateName,
            Self::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            Self::InvalidInput(_) => ErrorKind::InvalidInput,
            Self::Vcs { .. } => ErrorKind::VcsError,
            Self::Other(_) => ErrorKind::Internal,
        }
    }

    pub fn hint(&self) -> &'static str {
        self.kind().hint()
    }

    /// Structured context for the caller, beyond the message.
    pub fn details(&self) -> Option<Value> {
        match self {
            Self::PathNotFound { entity, name } => Some(json!({ "entity": entity, "name": name })),
            Self::WorkspaceLocked { holder } => Some(json!({ "holder": holder })),
            Self::AllSlotsLocked { holders } => Some(json!({ "holders": holders })),
            Self::GitDirty { repository, files } => {
                Some(json!({ "repository": repository, "files": files }))
            }
            Self::NoActiveLease { slot } => Some(json!({ "slot": slot })),
            Self::LeaseExpired {
                slot,
                expired_at,
                phase,
            } => Some(json!({ "slot": slot, "expired_at": expired_at, "phase": phase })),
            Self::EngineTimeout { engine, seconds } => {
                Some(json!({ "engine": engine, "timeout_secs": seconds }))
            }
            Self::EngineError { engine, .. } => Some(json!({ "engine": engine })),
            Self::CommandDenied {
                environment,
                command,
                reason,
            } => Some(json!({ "environment": environment, "command": command, "reason": reason })),
            Self::TestFailed {
                fix_rounds,
                lint_only,
                decision_required,
                failing_repositories,
            } => Some(json!({
                "fix_rounds": fix_rounds,
                "lint_only": lint_only,
                "decision_required": decision_required,
                "failing_repositories": failing_repositories,
                "options": ["retry", "abandon", "keep-branch"],
            })),
            Self::CriteriaNotMet { index, unmet } => {
                Some(json!({ "index": index, "unmet_criteria": unmet }))
            }
            Self::DependencyCycle { involved, .. } => Some(json!({ "involved": involved })),
            Self::DuplicateName { entity, name } => Some(json!({ "entity": entity, "name": name })),
            Self::InvalidTransition {
                command,
                phase,
                allowed,
            } => Some(json!({ "command": command, "phase": phase, "allowed_commands": allowed })),
            Self::Vcs { repository, .. } => Some(json!({ "repository": repository })),
            Self::InvalidInput(_) | Self::Other(_) => None,
        }
    }

    pub fn to_payload(&self) -> ErrorPayload {
        let message = match self {
            // Keep the whole context chain for internal failures.
            Self::Other(e) => format!("{:#}", e),
            other => other.to_string(),
        };
        ErrorPayload {
            kind: self.kind(),
            message,
            hint: self.hint().to_string(),
            details: self.details(),
        }
    }
}
