//! Plan persistence: the index at `.state/feature_plan` plus
//! `.state/features/{index}/criteria` and `.../verification`.

use anyhow::Context;
use shipyard_common::{AcceptanceCriterion, FeaturePlan, VerificationRecord};
use std::path::Path;
use tracing::debug;

use crate::errors::{Result, ShipyardError};
use crate::state::{Artifact, StateStore};
use crate::util::{read_json, write_json_atomic};

#[derive(Debug, Clone)]
pub struct PlanStore {
    state: StateStore,
}

fn read_list<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    Ok(read_json(path)?)
}

impl PlanStore {
    pub fn new(state: StateStore) -> Self {
        Self { state }
    }

    pub fn exists(&self) -> bool {
        self.state.exists(Artifact::FeaturePlan)
    }

    pub fn load(&self) -> Result<FeaturePlan> {
        self.state
            .read::<FeaturePlan>(Artifact::FeaturePlan)?
            .ok_or_else(|| ShipyardError::not_found("feature plan", &self.state.dir().display().to_string()))
    }

    pub fn save(&self, plan: &FeaturePlan) -> Result<()> {
        self.state.write(Artifact::FeaturePlan, plan)?;
        Ok(())
    }

    pub fn path(&self) -> std::path::PathBuf {
        self.state.path(Artifact::FeaturePlan)
    }

    pub fn criteria(&self, index: usize) -> Result<Vec<AcceptanceCriterion>> {
        read_list(&self.state.criteria_path(index))
    }

    pub fn save_criteria(&self, index: usize, criteria: &[AcceptanceCriterion]) -> Result<()> {
        write_json_atomic(&self.state.criteria_path(index), &criteria)?;
        Ok(())
    }

    pub fn verification(&self, index: usize) -> Result<Vec<VerificationRecord>> {
        read_list(&self.state.verification_path(index))
    }

    pub fn save_verification(&self, index: usize, records: &[VerificationRecord]) -> Result<()> {
        write_json_atomic(&self.state.verification_path(index), &records)?;
        Ok(())
    }

    /// Drop every per-feature directory.
    pub fn clear_features(&self) -> Result<()> {
        let dir = self.state.features_dir();
        if dir.exists() {
            std::fs::remove_dir_all(&dir)
                .with_context(|| format!("Failed to remove {}", dir.display()))?;
        }
        Ok(())
    }

    /// Move per-feature files to their new indices (`mapping[old] = new`).
    pub fn reindex(&self, mapping: &[usize]) -> Result<()> {
        let mut moved = Vec::with_capacity(mapping.len());
        for (old, &new) in mapping.iter().enumerate() {
            moved.push((new, self.criteria(old)?, self.verification(old)?));
        }
        self.clear_features()?;
        for (new, criteria, records) in moved {
            self.save_criteria(new, &criteria)?;
            if !records.is_empty() {
                self.save_verification(new, &records)?;
            }
        }
        debug!(features = mapping.len(), "feature directories re-indexed");
        Ok(())
    }
}
