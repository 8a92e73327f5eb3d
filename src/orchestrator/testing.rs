//! The bounded test loop behind `test` (and the tail of `develop`).
//!
//! Each run executes lint then tests in every repository and persists the
//! report. A lint-only failure gets one engine fix; a test failure gets fix
//! rounds until the lease's budget is spent, then the caller decides.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shipyard_common::Phase;
use tracing::{info, warn};

use super::{Orchestrator, PhaseCommand, Session, prompts};
use crate::checks::{CheckKind, CheckOutcome};
use crate::engine::{EngineRequest, EngineTask};
use crate::errors::{Result, ShipyardError};
use crate::state::Artifact;
use crate::workspace::WorkspaceSnapshot;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepoCheckReport {
    pub repository: String,
    pub lint: Option<CheckOutcome>,
    pub test: Option<CheckOutcome>,
}

impl RepoCheckReport {
    pub fn passed(&self) -> bool {
        self.lint.as_ref().is_none_or(|o| o.passed) && self.test.as_ref().is_none_or(|o| o.passed)
    }

    pub fn failures(&self) -> impl Iterator<Item = &CheckOutcome> {
        self.lint.iter().chain(self.test.iter()).filter(|o| !o.passed)
    }
}

/// Persisted as the `test_report` artifact after every run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestReport {
    pub passed: bool,
    /// Every failing check is a lint check.
    pub lint_only: bool,
    pub round: u32,
    pub run: u32,
    pub fix_rounds: u32,
    pub lint_fix_used: bool,
    pub repositories: Vec<RepoCheckReport>,
    pub finished_at: DateTime<Utc>,
}

impl TestReport {
    pub fn failing_repositories(&self) -> Vec<String> {
        self.repositories
            .iter()
            .filter(|r| !r.passed())
            .map(|r| r.repository.clone())
            .collect()
    }
}

impl Orchestrator {
    /// `test [--retry]`: run the loop from `developing` or `testing`.
    pub async fn test(&self, slot: &str, owner: Option<&str>, retry: bool, now: DateTime<Utc>) -> Result<TestReport> {
        let mut session = self.open(slot, owner, now)?;
        session.require(PhaseCommand::Test)?;
        if retry {
            info!(slot, previous_rounds = session.lease.test_fix_rounds, "test budget reset");
            session.lease.test_fix_rounds = 0;
            session.lease.lint_fix_used = false;
        }
        self.test_loop(&mut session, now).await
    }

    pub(crate) async fn test_loop(&self, session: &mut Session, now: DateTime<Utc>) -> Result<TestReport> {
        session.enter(Phase::Testing, now)?;
        let snapshot = session.snapshot()?;
        let max_rounds = self.config().max_test_fix_rounds();
        let mut run = 0;

        loop {
            run += 1;
            let report = self.run_checks(session, &snapshot, run, now).await?;
            session.write_artifact(Artifact::TestReport, &report)?;
            session.save(now)?;

            if report.passed {
                info!(slot = %session.slot.name, run, "checks green");
                return Ok(report);
            }

            let fix_allowed = if report.lint_only {
                !session.lease.lint_fix_used
            } else {
                session.lease.test_fix_rounds < max_rounds
            };
            if !fix_allowed {
                warn!(
                    slot = %session.slot.name,
                    fix_rounds = session.lease.test_fix_rounds,
                    lint_only = report.lint_only,
                    "automatic fixes exhausted"
                );
                return Err(ShipyardError::TestFailed {
                    fix_rounds: session.lease.test_fix_rounds,
                    lint_only: report.lint_only,
                    decision_required: true,
                    failing_repositories: report.failing_repositories(),
                });
            }

            if report.lint_only {
                session.lease.lint_fix_used = true;
            } else {
                session.lease.test_fix_rounds += 1;
            }
            session.save(now)?;
            info!(
                slot = %session.slot.name,
                lint_only = report.lint_only,
                fix_round = session.lease.test_fix_rounds,
                "requesting engine fix"
            );

            let ctx = self.prompt_context(session, &[Artifact::Analysis, Artifact::DevelopReport])?;
            let engine = self.engine_for(&session.lease)?;
            engine
                .run(&EngineRequest {
                    purpose: EngineTask::Fix,
                    working_dir: session.slot.root_path.clone(),
                    prompt: prompts::fix(&ctx, &report),
                })
                .await?;
        }
    }

    async fn run_checks(
        &self,
        session: &Session,
        snapshot: &WorkspaceSnapshot,
        run: u32,
        now: DateTime<Utc>,
    ) -> Result<TestReport> {
        let mut repositories = Vec::with_capacity(session.lease.repository_names.len());
        for name in &session.lease.repository_names {
            let path = session.repo_path(name);
            let tooling = snapshot
                .repository(name)
                .map(|r| r.tooling.clone())
                .unwrap_or_default();

            let lint = match &tooling.lint_command {
                Some(cmd) => Some(self.collaborators().checks.run(&path, cmd, CheckKind::Lint, None).await?),
                None => None,
            };
            let test = match &tooling.test_command {
                Some(cmd) => Some(self.collaborators().checks.run(&path, cmd, CheckKind::Test, None).await?),
                None => None,
            };
            if lint.is_none() && test.is_none() {
                warn!(repository = %name, "no lint or test command detected; nothing to run");
            }
            repositories.push(RepoCheckReport {
                repository: name.clone(),
                lint,
                test,
            });
        }

        let passed = repositories.iter().all(RepoCheckReport::passed);
        let lint_only = !passed
            && repositories
                .iter()
                .flat_map(RepoCheckReport::failures)
                .all(|o| o.kind == CheckKind::Lint);
        Ok(TestReport {
            passed,
            lint_only,
            round: session.lease.round,
            run,
            fix_rounds: session.lease.test_fix_rounds,
            lint_fix_used: session.lease.lint_fix_used,
            repositories,
            finished_at: now,
        })
    }
}
