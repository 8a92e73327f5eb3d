//! Phase orchestrator.
//!
//! One [`Orchestrator`] call is one unit of work: load the slot's lease,
//! check that the command is allowed from the current phase, do the work
//! through the collaborators, persist the artifact and the transition, and
//! return a serialisable result. Nothing here waits for a human.
//!
//! | Command      | Allowed from                                        |
//! |--------------|-----------------------------------------------------|
//! | `probe-env`  | workspace-check, env-probe                          |
//! | `analyze`    | workspace-check, env-probe, analyzing               |
//! | `confirm`    | analyzing (awaiting confirmation)                   |
//! | `develop`    | confirmed, developing, submitted, env-verified      |
//! | `test`       | developing, testing                                 |
//! | `submit`     | testing                                             |
//! | `verify-env` | submitted, env-verified                             |
//! | `accept`     | submitted (after a failed verify-env)               |
//! | `release`    | any                                                 |
//! | `renew`      | any                                                 |

pub mod features;
pub mod phases;
pub mod prompts;
pub mod testing;

pub use features::{FeatureVerifyResult, PlanEvaluator, PlanView};
pub use phases::{
    AnalysisReport, AnalyzeResult, DevelopReport, DevelopResult, EnvSnapshot, EnvVerifyReport, ReleaseResult,
    SubmitResult, SubmittedRepository, VerifyEnvResult,
};
pub use testing::{RepoCheckReport, TestReport};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use shipyard_common::{Complexity, Lease, Phase};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

use crate::checks::{CheckRunner, ShellCheckRunner};
use crate::config::Config;
use crate::engine::{CodeEngine, ConfiguredEngines, EngineFactory};
use crate::envprobe::{EnvironmentProbe, SshProbe};
use crate::errors::{Result, ShipyardError};
use crate::lease::{LeaseLock, check_owner};
use crate::plan::FeaturePlanManager;
use crate::registry::{Registry, WorkspaceSlot};
use crate::state::{Artifact, StateStore};
use crate::vcs::{GitVcs, VersionControl};
use crate::workspace::{AcquireRequest, Acquisition, WorkspaceAllocator, WorkspaceSnapshot};

/// External systems the orchestrator drives.
#[derive(Clone)]
pub struct Collaborators {
    pub vcs: Arc<dyn VersionControl>,
    pub checks: Arc<dyn CheckRunner>,
    pub probe: Arc<dyn EnvironmentProbe>,
    pub engines: Arc<dyn EngineFactory>,
}

impl Collaborators {
    /// git2/git/gh, `sh -c` checks, `ssh` probes, and CLI engines from config.
    pub fn from_config(config: &Config) -> Self {
        Self {
            vcs: Arc::new(GitVcs::new()),
            checks: Arc::new(ShellCheckRunner::new(config.check_timeout())),
            probe: Arc::new(SshProbe::default()),
            engines: Arc::new(ConfiguredEngines::new(config.toml.clone())),
        }
    }
}

/// A command that operates on a leased slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseCommand {
    ProbeEnv,
    Analyze,
    Confirm,
    Develop,
    Test,
    Submit,
    VerifyEnv,
    Accept,
    Feature,
}

impl PhaseCommand {
    const ALL: [PhaseCommand; 9] = [
        PhaseCommand::ProbeEnv,
        PhaseCommand::Analyze,
        PhaseCommand::Confirm,
        PhaseCommand::Develop,
        PhaseCommand::Test,
        PhaseCommand::Submit,
        PhaseCommand::VerifyEnv,
        PhaseCommand::Accept,
        PhaseCommand::Feature,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            PhaseCommand::ProbeEnv => "probe-env",
            PhaseCommand::Analyze => "analyze",
            PhaseCommand::Confirm => "confirm",
            PhaseCommand::Develop => "develop",
            PhaseCommand::Test => "test",
            PhaseCommand::Submit => "submit",
            PhaseCommand::VerifyEnv => "verify-env",
            PhaseCommand::Accept => "accept",
            PhaseCommand::Feature => "feature",
        }
    }

    /// Phases the command may run from. Some commands add state checks of
    /// their own on top of this.
    pub fn allowed_from(&self) -> &'static [Phase] {
        use Phase::*;
        match self {
            PhaseCommand::ProbeEnv => &[WorkspaceCheck, EnvProbe],
            PhaseCommand::Analyze => &[WorkspaceCheck, EnvProbe, Analyzing],
            PhaseCommand::Confirm => &[Analyzing],
            PhaseCommand::Develop => &[Confirmed, Developing, Submitted, EnvVerified],
            PhaseCommand::Test => &[Developing, Testing],
            PhaseCommand::Submit => &[Testing],
            PhaseCommand::VerifyEnv => &[Submitted, EnvVerified],
            PhaseCommand::Accept => &[Submitted],
            PhaseCommand::Feature => &[Analyzing, Confirmed, Developing, Testing, Submitted, EnvVerified],
        }
    }
}

/// Commands a caller may issue from `phase`.
pub fn allowed_commands(phase: Phase) -> Vec<String> {
    let mut allowed: Vec<String> = PhaseCommand::ALL
        .iter()
        .filter(|c| c.allowed_from().contains(&phase))
        .map(|c| c.name().to_string())
        .collect();
    if !phase.is_terminal() {
        allowed.push("release".to_string());
        allowed.push("renew".to_string());
    }
    allowed
}

pub(crate) fn invalid_transition(command: PhaseCommand, phase: Phase) -> ShipyardError {
    ShipyardError::InvalidTransition {
        command: command.name().to_string(),
        phase,
        allowed: allowed_commands(phase),
    }
}

/// Implicit renewals are stamped no earlier than the wall clock at write time.
fn renewal_time(command_time: DateTime<Utc>) -> DateTime<Utc> {
    command_time.max(Utc::now())
}

/// A live lease opened for one command.
pub(crate) struct Session {
    pub slot: WorkspaceSlot,
    pub lock: LeaseLock,
    pub lease: Lease,
    pub state: StateStore,
    duration: Duration,
}

impl Session {
    pub fn require(&self, command: PhaseCommand) -> Result<()> {
        if command.allowed_from().contains(&self.lease.phase) {
            Ok(())
        } else {
            Err(invalid_transition(command, self.lease.phase))
        }
    }

    /// Move to `next` and persist. Re-entering the current phase refreshes
    /// the lease without a new history entry.
    pub fn enter(&mut self, next: Phase, now: DateTime<Utc>) -> Result<()> {
        let now = renewal_time(now);
        if self.lease.phase == next {
            self.lease.refresh(now, self.duration);
            return self.lock.save(&self.lease);
        }
        if !self.lease.phase.can_transition_to(next) {
            return Err(ShipyardError::InvalidTransition {
                command: next.to_string(),
                phase: self.lease.phase,
                allowed: allowed_commands(self.lease.phase),
            });
        }
        self.lock.advance(&mut self.lease, next, now, self.duration)
    }

    /// Persist lease fields without a transition.
    pub fn save(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.lease.refresh(renewal_time(now), self.duration);
        self.lock.save(&self.lease)
    }

    /// Write an artifact and reference it from the lease (saved by the caller).
    pub fn write_artifact<T: Serialize>(&mut self, artifact: Artifact, value: &T) -> Result<PathBuf> {
        self.lock.verify_held(&self.lease)?;
        let path = self.state.write(artifact, value)?;
        self.lease.record_artifact(artifact.name(), path.clone());
        Ok(path)
    }

    pub fn snapshot(&self) -> Result<WorkspaceSnapshot> {
        self.state
            .read(Artifact::WorkspaceSnapshot)?
            .ok_or_else(|| ShipyardError::not_found("workspace snapshot", &self.slot.name))
    }

    pub fn repo_path(&self, repository: &str) -> PathBuf {
        self.slot.root_path.join(repository)
    }

    pub fn is_complex(&self) -> bool {
        self.lease.complexity == Some(Complexity::Complex)
    }
}

pub struct Orchestrator {
    config: Config,
    registry: Registry,
    collab: Collaborators,
}

impl Orchestrator {
    pub fn new(config: Config, registry: Registry, collab: Collaborators) -> Self {
        Self {
            config,
            registry,
            collab,
        }
    }

    /// Read the registry named by the config and wire the default collaborators.
    pub fn load(config: Config) -> Result<Self> {
        let registry = Registry::load(&config.registry_file)?;
        let collab = Collaborators::from_config(&config);
        Ok(Self::new(config, registry, collab))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn collaborators(&self) -> &Collaborators {
        &self.collab
    }

    /// Allocate a slot for a new task. The engine key must resolve first.
    pub async fn acquire(&self, request: &AcquireRequest, now: DateTime<Utc>) -> Result<Acquisition> {
        self.collab.engines.engine(&request.engine)?;
        WorkspaceAllocator::new(&self.registry, &self.config, self.collab.vcs.as_ref())
            .check_and_acquire(request, now)
            .await
    }

    pub(crate) fn open(&self, slot: &str, owner: Option<&str>, now: DateTime<Utc>) -> Result<Session> {
        let slot = self.registry.workspace(slot)?;
        let lock = LeaseLock::new(&slot.name, &slot.root_path);
        let lease = lock.load_active(now)?;
        check_owner(&lease, owner)?;
        debug!(slot = %slot.name, phase = %lease.phase, "session opened");
        Ok(Session {
            state: StateStore::new(&slot.root_path),
            slot,
            lock,
            lease,
            duration: self.config.lease_duration,
        })
    }

    pub(crate) fn engine_for(&self, lease: &Lease) -> Result<Arc<dyn CodeEngine>> {
        self.collab.engines.engine(&lease.engine_id)
    }

    pub(crate) fn plan_manager(&self, session: &Session) -> FeaturePlanManager {
        FeaturePlanManager::new(session.state.clone(), self.config.max_verify_attempts())
    }

    /// Push out the lease expiry without a transition.
    pub fn renew(&self, slot: &str, owner: Option<&str>, now: DateTime<Utc>) -> Result<Lease> {
        let slot = self.registry.workspace(slot)?;
        LeaseLock::new(&slot.name, &slot.root_path).renew(owner, now, self.config.lease_duration)
    }

    /// The live lease on a slot.
    pub fn lease(&self, slot: &str, owner: Option<&str>, now: DateTime<Utc>) -> Result<Lease> {
        Ok(self.open(slot, owner, now)?.lease)
    }

    /// Pick the slot a command targets: the explicit name, the slot containing
    /// `cwd`, or the only registered slot.
    pub fn resolve_slot(&self, explicit: Option<&str>, cwd: Option<&std::path::Path>) -> Result<String> {
        if let Some(name) = explicit {
            return Ok(self.registry.workspace(name)?.name);
        }
        if let Some(cwd) = cwd
            && let Some(slot) = self.registry.slot_for_path(cwd)?
        {
            return Ok(slot.name);
        }
        let mut slots = self.registry.workspaces()?;
        match slots.len() {
            1 => Ok(slots.remove(0).name),
            0 => Err(ShipyardError::InvalidInput(
                "no workspace slots are registered".to_string(),
            )),
            _ => Err(ShipyardError::InvalidInput(
                "several slots are registered; pass --slot".to_string(),
            )),
        }
    }
}
