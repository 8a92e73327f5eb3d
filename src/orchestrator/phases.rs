//! Phase commands other than the test loop and the feature commands.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shipyard_common::{Complexity, Feature, FeatureStatus, Lease, Phase, PlanSummary};
use std::collections::BTreeMap;
use tracing::{info, warn};

use super::prompts::{self, PromptContext};
use super::testing::TestReport;
use super::{Orchestrator, PhaseCommand, Session, invalid_transition};
use crate::envprobe::{self, ErrorScan, Observation};
use crate::engine::{EngineRequest, EngineTask};
use crate::errors::{Result, ShipyardError};
use crate::lease::{LeaseLock, check_owner};
use crate::plan::NextFeature;
use crate::registry::EnvironmentConfig;
use crate::state::Artifact;
use crate::util::slugify;
use crate::vcs::PullRequestSpec;

const BRANCH_SLUG_LEN: usize = 40;
const FEATURE_SLUG_LEN: usize = 30;

/// Persisted as `env_snapshot`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvSnapshot {
    pub environment: String,
    pub host: String,
    pub observations: Vec<Observation>,
    pub errors: ErrorScan,
    pub captured_at: DateTime<Utc>,
}

/// Persisted as `phase2_analysis`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisReport {
    pub engine: String,
    pub complexity: Complexity,
    pub summary: String,
    pub feature_count: usize,
    pub analyzed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalyzeResult {
    pub phase: Phase,
    pub awaiting_confirmation: bool,
    pub report: AnalysisReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<PlanSummary>,
}

/// Persisted as `develop_report`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DevelopReport {
    pub engine: String,
    pub round: u32,
    #[serde(default)]
    pub feature: Option<usize>,
    pub branches: BTreeMap<String, String>,
    pub summary: String,
    pub changed_files: Vec<String>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DevelopResult {
    pub develop: DevelopReport,
    pub test: TestReport,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubmittedRepository {
    pub repository: String,
    pub branch: String,
    pub commit: Option<String>,
    pub pull_request: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubmitResult {
    pub repositories: Vec<SubmittedRepository>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feature: Option<Feature>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<PlanSummary>,
    /// A complex plan still has features to develop.
    pub remaining_work: bool,
}

/// Persisted as `env_verify_report`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvVerifyReport {
    pub environment: String,
    pub passed: bool,
    pub round: u32,
    pub errors: ErrorScan,
    pub observations: Vec<Observation>,
    pub verified_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerifyEnvResult {
    pub phase: Phase,
    pub report: EnvVerifyReport,
    /// Follow-ups on failure: another round, accept as-is, or roll back.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReleaseResult {
    pub slot: String,
    pub lease: Lease,
    pub cleanup: bool,
    pub deleted_branches: Vec<String>,
    /// Cleanup steps that failed; the lease is released regardless.
    pub cleanup_errors: Vec<String>,
}

impl Orchestrator {
    pub(crate) fn prompt_context(&self, session: &Session, artifacts: &[Artifact]) -> Result<PromptContext> {
        Ok(PromptContext {
            task: session.lease.task_description.clone(),
            workspace: session.snapshot()?.summary(),
            artifacts: session.state.collect(artifacts)?,
        })
    }

    fn environment_of(&self, session: &Session) -> Result<EnvironmentConfig> {
        let name = session.lease.associated_environment.as_deref().ok_or_else(|| {
            ShipyardError::InvalidInput(format!(
                "the task on slot '{}' has no associated environment",
                session.slot.name
            ))
        })?;
        self.registry().environment(name)
    }

    /// `probe-env`: read-only observations of the associated environment.
    pub async fn probe_env(&self, slot: &str, owner: Option<&str>, now: DateTime<Utc>) -> Result<EnvSnapshot> {
        let mut session = self.open(slot, owner, now)?;
        session.require(PhaseCommand::ProbeEnv)?;
        let env = self.environment_of(&session)?;

        let observations = envprobe::probe_all(self.collaborators().probe.as_ref(), &env).await?;
        let snapshot = EnvSnapshot {
            environment: env.name.clone(),
            host: env.host.clone(),
            errors: envprobe::scan_errors(&env, &observations)?,
            observations,
            captured_at: now,
        };
        session.write_artifact(Artifact::EnvSnapshot, &snapshot)?;
        session.enter(Phase::EnvProbe, now)?;
        Ok(snapshot)
    }

    /// `analyze`: classify the task; a complex task gets a feature plan.
    pub async fn analyze(&self, slot: &str, owner: Option<&str>, now: DateTime<Utc>) -> Result<AnalyzeResult> {
        let mut session = self.open(slot, owner, now)?;
        session.require(PhaseCommand::Analyze)?;

        let engine = self.engine_for(&session.lease)?;
        let ctx = self.prompt_context(&session, &[Artifact::EnvSnapshot])?;
        let response = engine
            .run(&EngineRequest {
                purpose: EngineTask::Analyze,
                working_dir: session.slot.root_path.clone(),
                prompt: prompts::analysis(&ctx),
            })
            .await?;

        let complexity = response.complexity.unwrap_or(Complexity::Standard);
        let manager = self.plan_manager(&session);
        let plan = match complexity {
            Complexity::Complex => {
                if response.features.is_empty() {
                    return Err(ShipyardError::EngineError {
                        engine: engine.id().to_string(),
                        message: "classified the task as complex without a feature decomposition".to_string(),
                    });
                }
                Some(
                    manager
                        .create_plan(&session.lease.task_description, &response.features, now)?
                        .summary(),
                )
            }
            _ => {
                if manager.exists() {
                    manager.store().clear_features()?;
                    session.state.remove(Artifact::FeaturePlan)?;
                    session.lease.artifact_paths.remove(Artifact::FeaturePlan.name());
                }
                None
            }
        };
        if plan.is_some() {
            let path = manager.store().path();
            session.lease.record_artifact(Artifact::FeaturePlan.name(), path);
        }

        let report = AnalysisReport {
            engine: engine.id().to_string(),
            complexity,
            summary: response.summary,
            feature_count: response.features.len(),
            analyzed_at: now,
        };
        session.write_artifact(Artifact::Analysis, &report)?;
        session.lease.complexity = Some(complexity);
        session.lease.awaiting_confirmation = complexity.needs_confirmation();
        session.enter(Phase::Analyzing, now)?;
        if !complexity.needs_confirmation() {
            session.enter(Phase::Confirmed, now)?;
        }
        info!(slot, %complexity, "analysis recorded");

        Ok(AnalyzeResult {
            phase: session.lease.phase,
            awaiting_confirmation: session.lease.awaiting_confirmation,
            report,
            plan,
        })
    }

    /// `confirm`: the external go-ahead after a standard or complex analysis.
    pub fn confirm(&self, slot: &str, owner: Option<&str>, now: DateTime<Utc>) -> Result<Lease> {
        let mut session = self.open(slot, owner, now)?;
        session.require(PhaseCommand::Confirm)?;
        if !session.lease.awaiting_confirmation {
            return Err(invalid_transition(PhaseCommand::Confirm, session.lease.phase));
        }
        session.lease.awaiting_confirmation = false;
        session.enter(Phase::Confirmed, now)?;
        Ok(session.lease)
    }

    /// `develop [--context]`: one engine round on the task (or the current
    /// feature), then the test loop.
    pub async fn develop(
        &self,
        slot: &str,
        owner: Option<&str>,
        extra_context: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<DevelopResult> {
        let mut session = self.open(slot, owner, now)?;
        session.require(PhaseCommand::Develop)?;
        if session.lease.phase == Phase::Submitted && !self.may_reopen_submitted(&session)? {
            return Err(invalid_transition(PhaseCommand::Develop, session.lease.phase));
        }

        let feature = if session.is_complex() {
            match self.plan_manager(&session).next_feature(now)? {
                NextFeature::Started { feature, .. } => Some(feature),
                NextFeature::AllDone { .. } => {
                    return Err(ShipyardError::InvalidInput(
                        "every feature of the plan is settled; nothing left to develop".to_string(),
                    ));
                }
                NextFeature::Blocked { blocked } => {
                    let waiting: Vec<String> = blocked
                        .iter()
                        .map(|b| format!("{} waits on {:?}", b.index, b.waiting_on))
                        .collect();
                    return Err(ShipyardError::InvalidInput(format!(
                        "no feature can start: {}",
                        waiting.join("; ")
                    )));
                }
            }
        } else {
            None
        };

        self.checkout_task_branches(&mut session, feature.as_ref()).await?;
        session.enter(Phase::Developing, now)?;

        let engine = self.engine_for(&session.lease)?;
        let ctx = self.prompt_context(
            &session,
            &[
                Artifact::EnvSnapshot,
                Artifact::Analysis,
                Artifact::TestReport,
                Artifact::EnvVerifyReport,
            ],
        )?;
        let response = engine
            .run(&EngineRequest {
                purpose: EngineTask::Develop,
                working_dir: session.slot.root_path.clone(),
                prompt: prompts::develop(&ctx, feature.as_ref(), extra_context),
            })
            .await?;

        let develop = DevelopReport {
            engine: engine.id().to_string(),
            round: session.lease.round,
            feature: feature.as_ref().map(|f| f.index),
            branches: session.lease.branch_per_repository.clone(),
            summary: response.summary,
            changed_files: response.changed_files,
            finished_at: now,
        };
        session.write_artifact(Artifact::DevelopReport, &develop)?;
        session.save(now)?;
        info!(slot, changed = develop.changed_files.len(), "development round finished");

        let test = self.test_loop(&mut session, now).await?;
        Ok(DevelopResult { develop, test })
    }

    /// Leaving `submitted` for another round needs a reason: remaining plan
    /// work or a failed environment verification.
    fn may_reopen_submitted(&self, session: &Session) -> Result<bool> {
        if session.is_complex() {
            let manager = self.plan_manager(session);
            if manager.exists() && !manager.summary()?.all_settled() {
                return Ok(true);
            }
        }
        let report: Option<EnvVerifyReport> = session.state.read(Artifact::EnvVerifyReport)?;
        Ok(report.is_some_and(|r| !r.passed))
    }

    /// Create or reuse the task branch in every repository. Feature branches
    /// stack on whatever is checked out.
    async fn checkout_task_branches(&self, session: &mut Session, feature: Option<&Feature>) -> Result<()> {
        let task_slug = slugify(&session.lease.task_description, BRANCH_SLUG_LEN);
        let task_slug = if task_slug.is_empty() {
            session.lease.lease_id.simple().to_string()[..8].to_string()
        } else {
            task_slug
        };
        let vcs = &self.collaborators().vcs;

        for name in session.lease.repository_names.clone() {
            let repo = self.registry().repository(&name)?;
            let branch = match feature {
                Some(f) => format!(
                    "{}{}/f{}-{}",
                    repo.branch_prefix(),
                    slugify(&session.lease.task_description, FEATURE_SLUG_LEN),
                    f.index,
                    slugify(&f.title, FEATURE_SLUG_LEN)
                ),
                None => format!("{}{}", repo.branch_prefix(), task_slug),
            };
            vcs.create_branch(&session.repo_path(&name), &branch).await?;
            session.lease.branch_per_repository.insert(name, branch);
        }
        Ok(())
    }

    /// `submit [--force]`: commit, push, and open a pull request per
    /// repository. In complex mode the current feature's criteria gate it and
    /// it is marked done.
    pub async fn submit(&self, slot: &str, owner: Option<&str>, force: bool, now: DateTime<Utc>) -> Result<SubmitResult> {
        let mut session = self.open(slot, owner, now)?;
        session.require(PhaseCommand::Submit)?;

        let report: Option<TestReport> = session.state.read(Artifact::TestReport)?;
        match report {
            Some(report) if report.passed => {}
            Some(report) => {
                return Err(ShipyardError::TestFailed {
                    fix_rounds: session.lease.test_fix_rounds,
                    lint_only: report.lint_only,
                    decision_required: true,
                    failing_repositories: report.failing_repositories(),
                });
            }
            None => return Err(invalid_transition(PhaseCommand::Submit, session.lease.phase)),
        }

        let manager = self.plan_manager(&session);
        let feature = if session.is_complex() {
            let plan = manager.load()?;
            let current = plan.in_progress().cloned().ok_or_else(|| {
                ShipyardError::InvalidInput("no feature is in progress".to_string())
            })?;
            let mut unmet = manager.unmet_criteria(current.index)?;
            if !unmet.is_empty() {
                let evaluator = self.evaluator(&session)?;
                unmet = manager.verify(current.index, &evaluator, now).await?.unmet;
            }
            if !unmet.is_empty() && !force {
                return Err(ShipyardError::CriteriaNotMet {
                    index: current.index,
                    unmet,
                });
            }
            Some(current)
        } else {
            None
        };

        let vcs = &self.collaborators().vcs;
        let title = match &feature {
            Some(f) => format!("{} ({})", f.title, session.lease.task_description),
            None => session.lease.task_description.clone(),
        };
        let body = self.pull_request_body(&session, feature.as_ref())?;
        let mut submitted = Vec::new();
        for name in session.lease.repository_names.clone() {
            let Some(branch) = session.lease.branch_per_repository.get(&name).cloned() else {
                continue;
            };
            let repo = self.registry().repository(&name)?;
            let path = session.repo_path(&name);
            let commit = vcs.commit_all(&path, &title).await?;
            // One branch per task outside complex mode, so a later round
            // updates the pull request opened by the first.
            let existing = match feature {
                None => session.lease.pull_requests.get(&name).cloned(),
                Some(_) => None,
            };
            // Pushed by an earlier attempt whose pull request never opened.
            let unopened = session.lease.pending_pull_requests.get(&name) == Some(&branch);
            if commit.is_none() && existing.is_none() && !unopened {
                info!(repository = %name, "nothing to submit");
                submitted.push(SubmittedRepository {
                    repository: name,
                    branch,
                    commit: None,
                    pull_request: None,
                });
                continue;
            }
            vcs.push(&path, &branch).await?;
            session.lease.pushed_to_remote = true;
            if existing.is_none() {
                session.lease.pending_pull_requests.insert(name.clone(), branch.clone());
            }
            session.save(now)?;
            let pr = match existing {
                Some(pr) => pr,
                None => {
                    vcs.create_pull_request(
                        &path,
                        &PullRequestSpec {
                            branch: &branch,
                            base: &repo.default_branch,
                            title: &title,
                            body: &body,
                        },
                    )
                    .await?
                }
            };
            session.lease.pending_pull_requests.remove(&name);
            session.lease.pull_requests.insert(name.clone(), pr.clone());
            session.save(now)?;
            submitted.push(SubmittedRepository {
                repository: name,
                branch,
                commit,
                pull_request: Some(pr),
            });
        }

        let (feature, plan) = match feature {
            Some(current) => {
                let primary = submitted.first();
                let done = manager.mark_done(
                    current.index,
                    primary.map(|s| s.branch.clone()),
                    primary.and_then(|s| s.pull_request.clone()),
                    force,
                    now,
                )?;
                (Some(done), Some(manager.summary()?))
            }
            None => (None, None),
        };
        let remaining_work = plan.as_ref().is_some_and(|p| !p.all_settled());
        session.enter(Phase::Submitted, now)?;
        info!(slot, repositories = submitted.len(), remaining_work, "submitted");

        Ok(SubmitResult {
            repositories: submitted,
            feature,
            plan,
            remaining_work,
        })
    }

    fn pull_request_body(&self, session: &Session, feature: Option<&Feature>) -> Result<String> {
        let develop: Option<DevelopReport> = session.state.read(Artifact::DevelopReport)?;
        let mut body = format!("Task: {}\n", session.lease.task_description);
        if let Some(f) = feature {
            body.push_str(&format!("\nFeature {}: {}\n{}\n", f.index, f.title, f.task));
        }
        if let Some(develop) = develop
            && !develop.summary.trim().is_empty()
        {
            body.push_str(&format!("\n## Summary\n{}\n", develop.summary.trim()));
        }
        Ok(body)
    }

    /// `verify-env`: probe the environment after submission and count error
    /// patterns. The report is written either way.
    pub async fn verify_env(&self, slot: &str, owner: Option<&str>, now: DateTime<Utc>) -> Result<VerifyEnvResult> {
        let mut session = self.open(slot, owner, now)?;
        session.require(PhaseCommand::VerifyEnv)?;
        let env = self.environment_of(&session)?;

        let observations = envprobe::probe_all(self.collaborators().probe.as_ref(), &env).await?;
        let errors = envprobe::scan_errors(&env, &observations)?;
        let report = EnvVerifyReport {
            environment: env.name.clone(),
            passed: errors.is_clean(),
            round: session.lease.round,
            errors,
            observations,
            verified_at: now,
        };
        session.write_artifact(Artifact::EnvVerifyReport, &report)?;

        let options = if report.passed {
            session.enter(Phase::EnvVerified, now)?;
            Vec::new()
        } else {
            warn!(slot, matches = report.errors.total_matches, "environment verification failed");
            session.save(now)?;
            vec!["develop".to_string(), "accept".to_string(), "release --cleanup".to_string()]
        };
        Ok(VerifyEnvResult {
            phase: session.lease.phase,
            report,
            options,
        })
    }

    /// `accept`: take the submission as-is after a failed verification.
    pub fn accept(&self, slot: &str, owner: Option<&str>, now: DateTime<Utc>) -> Result<Lease> {
        let mut session = self.open(slot, owner, now)?;
        session.require(PhaseCommand::Accept)?;
        let report: Option<EnvVerifyReport> = session.state.read(Artifact::EnvVerifyReport)?;
        if !report.is_some_and(|r| !r.passed) {
            return Err(invalid_transition(PhaseCommand::Accept, session.lease.phase));
        }
        session.enter(Phase::EnvVerified, now)?;
        info!(slot, "verification failure accepted");
        Ok(session.lease)
    }

    /// `release [--cleanup]`: destroy the lease and every artifact. Works on
    /// an expired lease too, since release doubles as cancellation.
    pub async fn release(
        &self,
        slot: &str,
        owner: Option<&str>,
        cleanup: bool,
        now: DateTime<Utc>,
    ) -> Result<ReleaseResult> {
        let slot = self.registry().workspace(slot)?;
        let lock = LeaseLock::new(&slot.name, &slot.root_path);
        let mut lease = lock.load_any()?;
        check_owner(&lease, owner)?;

        let mut deleted_branches = Vec::new();
        let mut cleanup_errors = Vec::new();
        if cleanup {
            let feature_branches = self.feature_branches(&lock, &lease);
            for (name, branch) in &lease.branch_per_repository {
                let path = slot.root_path.join(name);
                let mut branches: Vec<&String> = feature_branches.iter().collect();
                branches.push(branch);
                branches.sort();
                branches.dedup();
                let original = match lease.original_branches.get(name) {
                    Some(b) => b.clone(),
                    None => match self.registry().repository(name) {
                        Ok(repo) => repo.default_branch,
                        Err(e) => {
                            cleanup_errors.push(format!("{name}: {e}"));
                            continue;
                        }
                    },
                };
                if let Err(e) = self.collaborators().vcs.checkout(&path, &original, true).await {
                    cleanup_errors.push(format!("{name}: checkout {original}: {e}"));
                    continue;
                }
                for branch in branches {
                    if *branch == original {
                        continue;
                    }
                    match self.collaborators().vcs.delete_branch(&path, branch).await {
                        Ok(()) => deleted_branches.push(format!("{name}:{branch}")),
                        Err(e) => cleanup_errors.push(format!("{name}: delete {branch}: {e}")),
                    }
                    if lease.pushed_to_remote
                        && let Err(e) = self.collaborators().vcs.delete_remote_branch(&path, branch).await
                    {
                        cleanup_errors.push(format!("{name}: delete remote {branch}: {e}"));
                    }
                }
            }
        }

        lock.destroy()?;
        lease.record_phase(Phase::Released, now, self.config().lease_duration);
        if !cleanup_errors.is_empty() {
            warn!(slot = %slot.name, errors = cleanup_errors.len(), "cleanup was incomplete");
        }
        Ok(ReleaseResult {
            slot: slot.name,
            lease,
            cleanup,
            deleted_branches,
            cleanup_errors,
        })
    }

    /// Branches recorded on plan features, read before the state is deleted.
    fn feature_branches(&self, lock: &LeaseLock, lease: &Lease) -> Vec<String> {
        if lease.complexity != Some(Complexity::Complex) {
            return Vec::new();
        }
        let manager = crate::plan::FeaturePlanManager::new(
            crate::state::StateStore::new(lock.root()),
            self.config().max_verify_attempts(),
        );
        match manager.load() {
            Ok(plan) => plan
                .features
                .iter()
                .filter(|f| f.status != FeatureStatus::Pending)
                .filter_map(|f| f.branch.clone())
                .collect(),
            Err(_) => Vec::new(),
        }
    }
}
