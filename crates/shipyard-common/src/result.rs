//! The structured result every command returns.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Stable error classifier callers branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    PathNotFound,
    WorkspaceLocked,
    AllSlotsLocked,
    GitDirty,
    NoActiveLease,
    LeaseExpired,
    EngineTimeout,
    EngineError,
    CommandDenied,
    TestFailed,
    CriteriaNotMet,
    DependencyCycle,
    DuplicateName,
    InvalidTransition,
    InvalidInput,
    VcsError,
    Internal,
}

impl ErrorKind {
    /// What the caller is expected to do next.
    pub fn hint(&self) -> &'static str {
        match self {
            ErrorKind::PathNotFound => {
                "List the registry and correct the repository, slot, or environment name"
            }
            ErrorKind::WorkspaceLocked => {
                "Wait for the holder to finish, use read-only search, or ask the holder to release"
            }
            ErrorKind::AllSlotsLocked => {
                "Retry later, use read-only search, or ask a human to release a slot"
            }
            ErrorKind::GitDirty => {
                "Re-run with --auto-clean, or ask a human to stash or commit the changes"
            }
            ErrorKind::NoActiveLease => "Run `acquire` to allocate a workspace first",
            ErrorKind::LeaseExpired => {
                "Run `acquire` again; the expired lease is reclaimed automatically"
            }
            ErrorKind::EngineTimeout | ErrorKind::EngineError => {
                "Release the slot or retry with a different engine or a simpler task"
            }
            ErrorKind::CommandDenied => {
                "The command is outside the environment allow-list; inform a human"
            }
            ErrorKind::TestFailed => {
                "Decide: `test --retry`, `release --cleanup` to abandon, or `release` to keep the branch"
            }
            ErrorKind::CriteriaNotMet => {
                "Fix the unmet criteria and verify again, or complete with --force"
            }
            ErrorKind::DependencyCycle => "Submit a plan whose dependencies form no cycle",
            ErrorKind::DuplicateName => "Pick another name or use `registry set` to edit the entry",
            ErrorKind::InvalidTransition => "Issue one of the commands allowed from the current phase",
            ErrorKind::InvalidInput => "Check the command arguments",
            ErrorKind::VcsError => "Inspect the repository and remote, then retry",
            ErrorKind::Internal => "Check the logs; the on-disk state was left as it was",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Failure detail carried by a [`CommandResult`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub kind: ErrorKind,
    pub message: String,
    pub hint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// Envelope printed for every command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResult {
    pub success: bool,
    pub command: String,
    pub data: Option<Value>,
    pub error: Option<ErrorPayload>,
}

impl CommandResult {
    pub fn ok<T: Serialize>(command: &str, data: &T) -> Self {
        Self {
            success: true,
            command: command.to_string(),
            data: serde_json::to_value(data).ok(),
            error: None,
        }
    }

    pub fn failure(command: &str, error: ErrorPayload) -> Self {
        Self {
            success: false,
            command: command.to_string(),
            data: None,
            error: Some(error),
        }
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }
}
