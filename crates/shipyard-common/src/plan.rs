//! Feature plan records for tasks classified as complex.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Status of a single feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureStatus {
    #[default]
    Pending,
    InProgress,
    Done,
    Failed,
    Skipped,
}

impl FeatureStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Skipped)
    }
}

impl std::fmt::Display for FeatureStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for FeatureStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            _ => anyhow::bail!(
                "Invalid feature status '{}'. Valid values: pending, in_progress, done, failed, skipped",
                s
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CriterionKind {
    /// Run the project's test command scoped to a target path.
    Test,
    /// Ask the code-generation engine whether a structural condition holds.
    Assert,
    /// Needs a human; never blocks automatic completion.
    Manual,
}

/// A condition that must hold before a feature counts as complete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcceptanceCriterion {
    pub id: String,
    pub kind: CriterionKind,
    pub target_or_description: String,
    pub auto: bool,
}

impl AcceptanceCriterion {
    /// Build a criterion; `manual` criteria are never automatic.
    pub fn from_spec(position: usize, spec: &CriterionSpec) -> Self {
        let auto = match spec.kind {
            CriterionKind::Manual => false,
            _ => spec.auto.unwrap_or(true),
        };
        Self {
            id: spec
                .id
                .clone()
                .filter(|id| !id.trim().is_empty())
                .unwrap_or_else(|| format!("c{}", position + 1)),
            kind: spec.kind,
            target_or_description: spec.target.clone(),
            auto,
        }
    }
}

/// Criterion as supplied by the caller or the engine's decomposition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriterionSpec {
    #[serde(default)]
    pub id: Option<String>,
    pub kind: CriterionKind,
    #[serde(alias = "target_or_description", alias = "description")]
    pub target: String,
    #[serde(default)]
    pub auto: Option<bool>,
}

/// Outcome of evaluating one criterion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationRecord {
    pub criterion_id: String,
    /// `None` means not evaluated yet or waiting on a human.
    pub passed: Option<bool>,
    #[serde(default)]
    pub output: String,
    pub evaluated_at: DateTime<Utc>,
}

/// Feature as supplied to plan creation or insertion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureSpec {
    pub title: String,
    pub task: String,
    #[serde(default)]
    pub depends_on: Vec<usize>,
    #[serde(default)]
    pub criteria: Vec<CriterionSpec>,
}

/// One dependency-ordered sub-task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    pub index: usize,
    pub title: String,
    pub task: String,
    #[serde(default)]
    pub status: FeatureStatus,
    #[serde(default)]
    pub depends_on: BTreeSet<usize>,
    #[serde(default)]
    pub criteria_count: usize,
    #[serde(default)]
    pub verified_count: usize,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub pr_reference: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub attempts: u32,
    /// Completed through the override despite unmet automatic criteria.
    #[serde(default)]
    pub forced: bool,
    #[serde(default)]
    pub needs_escalation: bool,
}

impl Feature {
    pub fn from_spec(index: usize, spec: &FeatureSpec, now: DateTime<Utc>) -> Self {
        Self {
            index,
            title: spec.title.clone(),
            task: spec.task.clone(),
            status: FeatureStatus::Pending,
            depends_on: spec.depends_on.iter().copied().collect(),
            criteria_count: spec.criteria.len(),
            verified_count: 0,
            branch: None,
            pr_reference: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            attempts: 0,
            forced: false,
            needs_escalation: false,
        }
    }
}

/// The plan index stored at `.state/feature_plan`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeaturePlan {
    pub origin_task: String,
    pub created_at: DateTime<Utc>,
    pub features: Vec<Feature>,
}

impl FeaturePlan {
    pub fn get(&self, index: usize) -> Option<&Feature> {
        self.features.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Feature> {
        self.features.get_mut(index)
    }

    pub fn in_progress(&self) -> Option<&Feature> {
        self.features
            .iter()
            .find(|f| f.status == FeatureStatus::InProgress)
    }

    /// True when every dependency of `index` is `done`.
    pub fn dependencies_done(&self, index: usize) -> bool {
        self.get(index).is_some_and(|feature| {
            feature.depends_on.iter().all(|dep| {
                self.get(*dep)
                    .is_some_and(|d| d.status == FeatureStatus::Done)
            })
        })
    }

    pub fn summary(&self) -> PlanSummary {
        let mut summary = PlanSummary {
            total: self.features.len(),
            ..PlanSummary::default()
        };
        for feature in &self.features {
            match feature.status {
                FeatureStatus::Pending => summary.pending += 1,
                FeatureStatus::InProgress => summary.in_progress += 1,
                FeatureStatus::Done => summary.done += 1,
                FeatureStatus::Failed => summary.failed += 1,
                FeatureStatus::Skipped => summary.skipped += 1,
            }
            if feature.needs_escalation {
                summary.escalated += 1;
            }
        }
        summary.progress_percent = summary.completion_percentage();
        summary
    }
}

/// Aggregate progress across a plan.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanSummary {
    pub total: usize,
    pub pending: usize,
    pub in_progress: usize,
    pub done: usize,
    pub failed: usize,
    pub skipped: usize,
    pub escalated: usize,
    pub progress_percent: f32,
}

impl PlanSummary {
    /// No feature is waiting or running.
    pub fn all_settled(&self) -> bool {
        self.pending == 0 && self.in_progress == 0
    }

    pub fn completion_percentage(&self) -> f32 {
        if self.total == 0 {
            100.0
        } else {
            ((self.done + self.skipped) as f32 / self.total as f32) * 100.0
        }
    }
}
