//! Per-slot artifact store under `{slot}/.state/`.
//!
//! Every artifact is a pretty-printed JSON file written through temp file +
//! rename. The directory is owned by the slot's lease and is deleted with it.

use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::lease::STATE_DIR;
use crate::util::{read_json, write_json_atomic};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Artifact {
    WorkspaceSnapshot,
    EnvSnapshot,
    Analysis,
    FeaturePlan,
    TestReport,
    EnvVerifyReport,
    DevelopReport,
}

impl Artifact {
    pub const ALL: [Artifact; 7] = [
        Artifact::WorkspaceSnapshot,
        Artifact::EnvSnapshot,
        Artifact::Analysis,
        Artifact::FeaturePlan,
        Artifact::TestReport,
        Artifact::EnvVerifyReport,
        Artifact::DevelopReport,
    ];

    /// File name, also the key in the lease's `artifact_paths`.
    pub fn name(&self) -> &'static str {
        match self {
            Artifact::WorkspaceSnapshot => "workspace_snapshot",
            Artifact::EnvSnapshot => "env_snapshot",
            Artifact::Analysis => "phase2_analysis",
            Artifact::FeaturePlan => "feature_plan",
            Artifact::TestReport => "test_report",
            Artifact::EnvVerifyReport => "env_verify_report",
            Artifact::DevelopReport => "develop_report",
        }
    }
}

#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub fn new(slot_root: &Path) -> Self {
        Self {
            dir: slot_root.join(STATE_DIR),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, artifact: Artifact) -> PathBuf {
        self.dir.join(artifact.name())
    }

    pub fn exists(&self, artifact: Artifact) -> bool {
        self.path(artifact).exists()
    }

    /// Write an artifact and return its path for the lease.
    pub fn write<T: Serialize>(&self, artifact: Artifact, value: &T) -> Result<PathBuf> {
        let path = self.path(artifact);
        write_json_atomic(&path, value)?;
        debug!(artifact = artifact.name(), path = %path.display(), "artifact written");
        Ok(path)
    }

    pub fn read<T: DeserializeOwned>(&self, artifact: Artifact) -> Result<Option<T>> {
        let path = self.path(artifact);
        if !path.exists() {
            return Ok(None);
        }
        read_json(&path).map(Some)
    }

    /// Raw JSON of every artifact present, for engine context.
    pub fn collect(&self, artifacts: &[Artifact]) -> Result<Vec<(Artifact, serde_json::Value)>> {
        let mut found = Vec::new();
        for artifact in artifacts {
            if let Some(value) = self.read::<serde_json::Value>(*artifact)? {
                found.push((*artifact, value));
            }
        }
        Ok(found)
    }

    pub fn remove(&self, artifact: Artifact) -> Result<()> {
        let path = self.path(artifact);
        if path.exists() {
            std::fs::remove_file(&path)
                .with_context(|| format!("Failed to remove {}", path.display()))?;
        }
        Ok(())
    }

    pub fn features_dir(&self) -> PathBuf {
        self.dir.join("features")
    }

    pub fn feature_dir(&self, index: usize) -> PathBuf {
        self.features_dir().join(index.to_string())
    }

    pub fn criteria_path(&self, index: usize) -> PathBuf {
        self.feature_dir(index).join("criteria")
    }

    pub fn verification_path(&self, index: usize) -> PathBuf {
        self.feature_dir(index).join("verification")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn test_write_read_and_collect() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path());
        assert!(store.read::<serde_json::Value>(Artifact::TestReport).unwrap().is_none());

        let path = store.write(Artifact::TestReport, &json!({"passed": true})).unwrap();
        assert_eq!(path, dir.path().join(".state").join("test_report"));
        store.write(Artifact::Analysis, &json!({"complexity": "trivial"})).unwrap();

        let collected = store
            .collect(&[Artifact::EnvSnapshot, Artifact::Analysis, Artifact::TestReport])
            .unwrap();
        assert_eq!(collected.len(), 2);
        assert_eq!(collected[0].0, Artifact::Analysis);

        store.remove(Artifact::TestReport).unwrap();
        assert!(!store.exists(Artifact::TestReport));
    }

    #[test]
    fn test_feature_paths() {
        let store = StateStore::new(Path::new("/slots/env0"));
        assert_eq!(
            store.criteria_path(3),
            PathBuf::from("/slots/env0/.state/features/3/criteria")
        );
        assert_eq!(
            store.verification_path(0),
            PathBuf::from("/slots/env0/.state/features/0/verification")
        );
    }

    #[test]
    fn test_artifact_names_are_unique() {
        let mut names: Vec<_> = Artifact::ALL.iter().map(|a| a.name()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), Artifact::ALL.len());
    }
}
