//! Feature plan manager for tasks classified as complex.
//!
//! A plan is a dependency-ordered list of features, each with acceptance
//! criteria. Features are started one at a time through [`FeaturePlanManager::next_feature`],
//! verified against their automatic criteria, and completed through
//! [`FeaturePlanManager::mark_done`]. A failed verification increments the
//! feature's attempts; past the ceiling the feature is flagged for a human
//! but never failed automatically.

pub mod graph;
pub mod store;

pub use graph::FeatureGraph;
pub use store::PlanStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use shipyard_common::{
    AcceptanceCriterion, Feature, FeaturePlan, FeatureSpec, FeatureStatus, PlanSummary, VerificationRecord,
};
use tracing::{info, warn};

use crate::errors::{Result, ShipyardError};
use crate::state::StateStore;

/// Evaluates one automatic criterion for a feature.
#[async_trait]
pub trait CriterionEvaluator: Send + Sync {
    /// Returns whether the criterion holds and the evidence.
    async fn evaluate(&self, feature: &Feature, criterion: &AcceptanceCriterion) -> Result<(bool, String)>;
}

#[derive(Debug, Clone, Serialize)]
pub struct BlockedFeature {
    pub index: usize,
    pub title: String,
    /// Dependencies that are not `done`.
    pub waiting_on: Vec<usize>,
}

/// Result of asking for the next feature.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum NextFeature {
    /// The returned feature is now (or still) in progress.
    Started { feature: Feature, resumed: bool },
    AllDone { summary: PlanSummary },
    Blocked { blocked: Vec<BlockedFeature> },
}

#[derive(Debug, Clone, Serialize)]
pub struct VerifyOutcome {
    pub index: usize,
    pub all_auto_passed: bool,
    pub records: Vec<VerificationRecord>,
    pub unmet: Vec<String>,
    pub manual_pending: Vec<String>,
    pub attempts: u32,
    pub needs_escalation: bool,
}

/// Edits accepted by [`FeaturePlanManager::update`].
#[derive(Debug, Clone)]
pub enum FeatureUpdate {
    Status(FeatureStatus),
    Task(String),
    InsertAfter(FeatureSpec),
    MoveTo(usize),
}

pub struct FeaturePlanManager {
    store: PlanStore,
    max_attempts: u32,
}

impl FeaturePlanManager {
    pub fn new(state: StateStore, max_attempts: u32) -> Self {
        Self {
            store: PlanStore::new(state),
            max_attempts,
        }
    }

    pub fn store(&self) -> &PlanStore {
        &self.store
    }

    pub fn exists(&self) -> bool {
        self.store.exists()
    }

    pub fn load(&self) -> Result<FeaturePlan> {
        self.store.load()
    }

    pub fn summary(&self) -> Result<PlanSummary> {
        Ok(self.store.load()?.summary())
    }

    /// Write a new plan, replacing any previous one.
    pub fn create_plan(&self, origin_task: &str, specs: &[FeatureSpec], now: DateTime<Utc>) -> Result<FeaturePlan> {
        if specs.is_empty() {
            return Err(ShipyardError::InvalidInput(
                "a feature plan needs at least one feature".to_string(),
            ));
        }
        let features: Vec<Feature> = specs
            .iter()
            .enumerate()
            .map(|(i, spec)| Feature::from_spec(i, spec, now))
            .collect();
        FeatureGraph::build(features.iter().map(|f| &f.depends_on))?;

        self.store.clear_features()?;
        for (i, spec) in specs.iter().enumerate() {
            self.store.save_criteria(i, &criteria_from(spec))?;
        }
        let plan = FeaturePlan {
            origin_task: origin_task.to_string(),
            created_at: now,
            features,
        };
        self.store.save(&plan)?;
        info!(features = plan.features.len(), "feature plan created");
        Ok(plan)
    }

    /// Resume the in-progress feature, or start the first runnable one.
    pub fn next_feature(&self, now: DateTime<Utc>) -> Result<NextFeature> {
        let mut plan = self.store.load()?;

        if let Some(current) = plan.in_progress() {
            return Ok(NextFeature::Started {
                feature: current.clone(),
                resumed: true,
            });
        }

        let runnable = plan
            .features
            .iter()
            .position(|f| f.status == FeatureStatus::Pending && plan.dependencies_done(f.index));
        if let Some(index) = runnable {
            let feature = &mut plan.features[index];
            feature.status = FeatureStatus::InProgress;
            feature.started_at = Some(now);
            let feature = feature.clone();
            self.store.save(&plan)?;
            info!(index, title = %feature.title, "feature started");
            return Ok(NextFeature::Started {
                feature,
                resumed: false,
            });
        }

        let blocked: Vec<BlockedFeature> = plan
            .features
            .iter()
            .filter(|f| f.status == FeatureStatus::Pending)
            .map(|f| BlockedFeature {
                index: f.index,
                title: f.title.clone(),
                waiting_on: f
                    .depends_on
                    .iter()
                    .copied()
                    .filter(|d| plan.get(*d).is_none_or(|dep| dep.status != FeatureStatus::Done))
                    .collect(),
            })
            .collect();
        if blocked.is_empty() {
            Ok(NextFeature::AllDone {
                summary: plan.summary(),
            })
        } else {
            warn!(blocked = blocked.len(), "no runnable feature");
            Ok(NextFeature::Blocked { blocked })
        }
    }

    /// Evaluate every automatic criterion; manual ones stay undecided.
    pub async fn verify(
        &self,
        index: usize,
        evaluator: &dyn CriterionEvaluator,
        now: DateTime<Utc>,
    ) -> Result<VerifyOutcome> {
        let mut plan = self.store.load()?;
        let feature = feature_at(&plan, index)?.clone();
        let criteria = self.store.criteria(index)?;

        let mut records = Vec::with_capacity(criteria.len());
        let mut unmet = Vec::new();
        let mut manual_pending = Vec::new();
        for criterion in &criteria {
            if !criterion.auto {
                manual_pending.push(criterion.id.clone());
                records.push(VerificationRecord {
                    criterion_id: criterion.id.clone(),
                    passed: None,
                    output: "awaiting manual confirmation".to_string(),
                    evaluated_at: now,
                });
                continue;
            }
            let (passed, output) = evaluator.evaluate(&feature, criterion).await?;
            if !passed {
                unmet.push(criterion.id.clone());
            }
            records.push(VerificationRecord {
                criterion_id: criterion.id.clone(),
                passed: Some(passed),
                output,
                evaluated_at: now,
            });
        }
        self.store.save_verification(index, &records)?;

        let all_auto_passed = unmet.is_empty();
        let max_attempts = self.max_attempts;
        let entry = &mut plan.features[index];
        entry.verified_count = records.iter().filter(|r| r.passed == Some(true)).count();
        entry.criteria_count = criteria.len();
        if !all_auto_passed {
            entry.attempts += 1;
            if entry.attempts > max_attempts && !entry.needs_escalation {
                entry.needs_escalation = true;
                warn!(index, attempts = entry.attempts, "feature needs human escalation");
            }
        }
        let (attempts, needs_escalation) = (entry.attempts, entry.needs_escalation);
        self.store.save(&plan)?;
        info!(index, all_auto_passed, unmet = unmet.len(), "feature verified");

        Ok(VerifyOutcome {
            index,
            all_auto_passed,
            records,
            unmet,
            manual_pending,
            attempts,
            needs_escalation,
        })
    }

    /// Automatic criteria whose latest record is not a pass.
    pub fn unmet_criteria(&self, index: usize) -> Result<Vec<String>> {
        let criteria = self.store.criteria(index)?;
        let records = self.store.verification(index)?;
        Ok(criteria
            .iter()
            .filter(|c| c.auto)
            .filter(|c| {
                !records
                    .iter()
                    .rev()
                    .find(|r| r.criterion_id == c.id)
                    .is_some_and(|r| r.passed == Some(true))
            })
            .map(|c| c.id.clone())
            .collect())
    }

    /// Complete a feature. Without `force`, every automatic criterion must
    /// have passed and every dependency must be done; `force` overrides both
    /// and flags the feature as forced.
    pub fn mark_done(
        &self,
        index: usize,
        branch: Option<String>,
        pr_reference: Option<String>,
        force: bool,
        now: DateTime<Utc>,
    ) -> Result<Feature> {
        let mut plan = self.store.load()?;
        feature_at(&plan, index)?;
        let dependencies_done = plan.dependencies_done(index);
        if !dependencies_done && !force {
            return Err(ShipyardError::InvalidInput(format!(
                "feature {index} cannot be completed before its dependencies"
            )));
        }

        let unmet = self.unmet_criteria(index)?;
        if !unmet.is_empty() && !force {
            return Err(ShipyardError::CriteriaNotMet { index, unmet });
        }

        let feature = &mut plan.features[index];
        if !unmet.is_empty() {
            feature.forced = true;
            warn!(index, ?unmet, "feature completed by override with unmet criteria");
        }
        if !dependencies_done {
            feature.forced = true;
            warn!(index, depends_on = ?feature.depends_on, "feature completed by override before its dependencies");
        }
        feature.status = FeatureStatus::Done;
        feature.completed_at = Some(now);
        feature.started_at.get_or_insert(now);
        if branch.is_some() {
            feature.branch = branch;
        }
        if pr_reference.is_some() {
            feature.pr_reference = pr_reference;
        }
        let feature = feature.clone();
        self.store.save(&plan)?;
        info!(index, forced = feature.forced, "feature done");
        Ok(feature)
    }

    pub fn update(&self, index: usize, update: FeatureUpdate, now: DateTime<Utc>) -> Result<FeaturePlan> {
        let mut plan = self.store.load()?;
        feature_at(&plan, index)?;

        match update {
            FeatureUpdate::Status(status) => set_status(&mut plan, index, status)?,
            FeatureUpdate::Task(task) => {
                let feature = &mut plan.features[index];
                if feature.status == FeatureStatus::Done {
                    return Err(ShipyardError::InvalidInput(format!(
                        "feature {index} is done; its task can no longer change"
                    )));
                }
                feature.task = task;
            }
            FeatureUpdate::InsertAfter(spec) => {
                self.insert_after(&mut plan, index, &spec, now)?;
            }
            FeatureUpdate::MoveTo(to) => self.move_feature(&mut plan, index, to)?,
        }

        self.store.save(&plan)?;
        info!(index, "feature plan updated");
        Ok(plan)
    }

    fn insert_after(&self, plan: &mut FeaturePlan, after: usize, spec: &FeatureSpec, now: DateTime<Utc>) -> Result<()> {
        if let Some(bad) = spec.depends_on.iter().find(|d| **d > after) {
            return Err(ShipyardError::InvalidInput(format!(
                "a feature inserted after {after} can only depend on features 0..={after}, not {bad}"
            )));
        }
        let position = after + 1;
        let mapping = graph::insert_mapping(plan.features.len(), position);

        for feature in plan.features.iter_mut() {
            feature.index = mapping[feature.index];
            feature.depends_on = graph::remap(&feature.depends_on, &mapping);
        }
        plan.features
            .insert(position, Feature::from_spec(position, spec, now));
        FeatureGraph::build(plan.features.iter().map(|f| &f.depends_on))?;

        self.store.reindex(&mapping)?;
        self.store.save_criteria(position, &criteria_from(spec))?;
        info!(position, title = %spec.title, "feature inserted");
        Ok(())
    }

    fn move_feature(&self, plan: &mut FeaturePlan, from: usize, to: usize) -> Result<()> {
        let len = plan.features.len();
        if to >= len {
            return Err(ShipyardError::InvalidInput(format!(
                "cannot move feature {from} to {to}: the plan has {len} features"
            )));
        }
        if from == to {
            return Ok(());
        }
        let mapping = graph::move_mapping(len, from, to);

        let moved = &plan.features[from];
        if let Some(dep) = moved.depends_on.iter().find(|d| mapping[**d] > to) {
            return Err(ShipyardError::InvalidInput(format!(
                "moving feature {from} to {to} would place it before its dependency {dep}"
            )));
        }
        if let Some(dependent) = plan
            .features
            .iter()
            .find(|f| f.depends_on.contains(&from) && mapping[f.index] < to)
        {
            return Err(ShipyardError::InvalidInput(format!(
                "moving feature {from} to {to} would place it after its dependent {}",
                dependent.index
            )));
        }

        let feature = plan.features.remove(from);
        plan.features.insert(to, feature);
        for feature in plan.features.iter_mut() {
            feature.index = mapping[feature.index];
            feature.depends_on = graph::remap(&feature.depends_on, &mapping);
        }
        self.store.reindex(&mapping)?;
        info!(from, to, "feature moved");
        Ok(())
    }
}

fn criteria_from(spec: &FeatureSpec) -> Vec<AcceptanceCriterion> {
    spec.criteria
        .iter()
        .enumerate()
        .map(|(i, c)| AcceptanceCriterion::from_spec(i, c))
        .collect()
}

fn feature_at(plan: &FeaturePlan, index: usize) -> Result<&Feature> {
    plan.get(index).ok_or_else(|| {
        ShipyardError::InvalidInput(format!(
            "feature index {index} is out of range (plan has {} features)",
            plan.features.len()
        ))
    })
}

fn set_status(plan: &mut FeaturePlan, index: usize, status: FeatureStatus) -> Result<()> {
    let feature = &mut plan.features[index];
    match status {
        FeatureStatus::Skipped | FeatureStatus::Failed => {
            if feature.status == FeatureStatus::Done {
                return Err(ShipyardError::InvalidInput(format!(
                    "feature {index} is already done"
                )));
            }
            feature.status = status;
        }
        FeatureStatus::Pending => {
            feature.status = FeatureStatus::Pending;
            feature.started_at = None;
            feature.completed_at = None;
            feature.forced = false;
        }
        FeatureStatus::InProgress | FeatureStatus::Done => {
            return Err(ShipyardError::InvalidInput(format!(
                "status '{status}' is set through 'feature next' and 'feature done', not update"
            )));
        }
    }
    Ok(())
}
