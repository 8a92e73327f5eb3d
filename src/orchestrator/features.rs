//! `feature ...` commands and the criterion evaluator they share with submit.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use shipyard_common::{AcceptanceCriterion, Complexity, CriterionKind, Feature, FeaturePlan, FeatureSpec, PlanSummary};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use super::{Orchestrator, PhaseCommand, Session, prompts};
use crate::checks::{CheckKind, CheckRunner};
use crate::engine::{CodeEngine, EngineRequest, EngineTask};
use crate::errors::{Result, ShipyardError};
use crate::plan::{CriterionEvaluator, FeatureUpdate, NextFeature, VerifyOutcome};
use crate::state::Artifact;

/// `test` criteria run the primary repository's test command scoped to the
/// target; `assert` criteria ask the engine for a verdict.
pub struct PlanEvaluator {
    checks: Arc<dyn CheckRunner>,
    engine: Arc<dyn CodeEngine>,
    repo_path: PathBuf,
    slot_root: PathBuf,
    test_command: Option<String>,
}

impl PlanEvaluator {
    pub fn new(
        checks: Arc<dyn CheckRunner>,
        engine: Arc<dyn CodeEngine>,
        repo_path: PathBuf,
        slot_root: PathBuf,
        test_command: Option<String>,
    ) -> Self {
        Self {
            checks,
            engine,
            repo_path,
            slot_root,
            test_command,
        }
    }
}

#[async_trait]
impl CriterionEvaluator for PlanEvaluator {
    async fn evaluate(&self, feature: &Feature, criterion: &AcceptanceCriterion) -> Result<(bool, String)> {
        match criterion.kind {
            CriterionKind::Test => {
                let Some(command) = &self.test_command else {
                    return Ok((false, "no test command is known for the primary repository".to_string()));
                };
                let outcome = self
                    .checks
                    .run(
                        &self.repo_path,
                        command,
                        CheckKind::Test,
                        Some(&criterion.target_or_description),
                    )
                    .await?;
                Ok((outcome.passed, outcome.output))
            }
            CriterionKind::Assert => {
                let response = self
                    .engine
                    .run(&EngineRequest {
                        purpose: EngineTask::Assert,
                        working_dir: self.slot_root.clone(),
                        prompt: prompts::assertion(feature, criterion),
                    })
                    .await?;
                Ok((response.satisfied.unwrap_or(false), response.summary))
            }
            CriterionKind::Manual => Ok((false, "manual criteria are confirmed by a human".to_string())),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PlanView {
    pub plan: FeaturePlan,
    pub summary: PlanSummary,
}

#[derive(Debug, Clone, Serialize)]
pub struct FeatureVerifyResult {
    pub outcome: VerifyOutcome,
    /// Engine fix rounds spent by `--fix`.
    pub fix_rounds: u32,
}

impl Orchestrator {
    pub(crate) fn evaluator(&self, session: &Session) -> Result<PlanEvaluator> {
        let primary = session.lease.primary_repository().ok_or_else(|| {
            ShipyardError::InvalidInput("the lease names no repository".to_string())
        })?;
        let test_command = session
            .snapshot()?
            .repository(primary)
            .and_then(|r| r.tooling.test_command.clone());
        Ok(PlanEvaluator::new(
            self.collaborators().checks.clone(),
            self.engine_for(&session.lease)?,
            session.repo_path(primary),
            session.slot.root_path.clone(),
            test_command,
        ))
    }

    fn feature_session(&self, slot: &str, owner: Option<&str>, now: DateTime<Utc>) -> Result<Session> {
        let session = self.open(slot, owner, now)?;
        session.require(PhaseCommand::Feature)?;
        Ok(session)
    }

    /// `feature create`: install a caller-supplied plan, switching the task
    /// to complex mode.
    pub fn feature_create(
        &self,
        slot: &str,
        owner: Option<&str>,
        specs: &[FeatureSpec],
        now: DateTime<Utc>,
    ) -> Result<PlanView> {
        let mut session = self.feature_session(slot, owner, now)?;
        let manager = self.plan_manager(&session);
        let plan = manager.create_plan(&session.lease.task_description, specs, now)?;
        session.lease.complexity = Some(Complexity::Complex);
        session
            .lease
            .record_artifact(Artifact::FeaturePlan.name(), manager.store().path());
        session.save(now)?;
        Ok(PlanView {
            summary: plan.summary(),
            plan,
        })
    }

    pub fn feature_list(&self, slot: &str, owner: Option<&str>, now: DateTime<Utc>) -> Result<PlanView> {
        let session = self.feature_session(slot, owner, now)?;
        let plan = self.plan_manager(&session).load()?;
        Ok(PlanView {
            summary: plan.summary(),
            plan,
        })
    }

    pub fn feature_next(&self, slot: &str, owner: Option<&str>, now: DateTime<Utc>) -> Result<NextFeature> {
        let mut session = self.feature_session(slot, owner, now)?;
        let next = self.plan_manager(&session).next_feature(now)?;
        session.save(now)?;
        Ok(next)
    }

    /// `feature verify [--fix]`. With `fix`, failing automatic criteria get
    /// engine fix rounds until they pass or the feature needs escalation.
    pub async fn feature_verify(
        &self,
        slot: &str,
        owner: Option<&str>,
        index: usize,
        fix: bool,
        now: DateTime<Utc>,
    ) -> Result<FeatureVerifyResult> {
        let mut session = self.feature_session(slot, owner, now)?;
        let manager = self.plan_manager(&session);
        let evaluator = self.evaluator(&session)?;

        let mut outcome = manager.verify(index, &evaluator, now).await?;
        let mut fix_rounds = 0;
        while fix && !outcome.all_auto_passed && !outcome.needs_escalation {
            fix_rounds += 1;
            let feature = manager
                .load()?
                .get(index)
                .cloned()
                .ok_or_else(|| ShipyardError::InvalidInput(format!("feature index {index} is out of range")))?;
            let unmet: Vec<AcceptanceCriterion> = manager
                .store()
                .criteria(index)?
                .into_iter()
                .filter(|c| outcome.unmet.contains(&c.id))
                .collect();
            info!(slot, index, fix_rounds, unmet = unmet.len(), "criteria fix round");

            let ctx = self.prompt_context(&session, &[Artifact::Analysis, Artifact::DevelopReport])?;
            self.engine_for(&session.lease)?
                .run(&EngineRequest {
                    purpose: EngineTask::Fix,
                    working_dir: session.slot.root_path.clone(),
                    prompt: prompts::criteria_fix(&ctx, &feature, &unmet),
                })
                .await?;
            outcome = manager.verify(index, &evaluator, now).await?;
        }
        session.save(now)?;
        Ok(FeatureVerifyResult { outcome, fix_rounds })
    }

    pub fn feature_done(
        &self,
        slot: &str,
        owner: Option<&str>,
        index: usize,
        branch: Option<String>,
        pr_reference: Option<String>,
        force: bool,
        now: DateTime<Utc>,
    ) -> Result<Feature> {
        let mut session = self.feature_session(slot, owner, now)?;
        let feature = self
            .plan_manager(&session)
            .mark_done(index, branch, pr_reference, force, now)?;
        session.save(now)?;
        Ok(feature)
    }

    pub fn feature_update(
        &self,
        slot: &str,
        owner: Option<&str>,
        index: usize,
        update: FeatureUpdate,
        now: DateTime<Utc>,
    ) -> Result<PlanView> {
        let mut session = self.feature_session(slot, owner, now)?;
        let plan = self.plan_manager(&session).update(index, update, now)?;
        session.save(now)?;
        Ok(PlanView {
            summary: plan.summary(),
            plan,
        })
    }
}
