//! `shipyard feature ...`: plan operations for complex tasks.

use anyhow::Context;
use chrono::Utc;
use serde_json::Value;
use shipyard::common::FeatureSpec;
use shipyard::errors::{Result, ShipyardError};
use shipyard::orchestrator::Orchestrator;
use shipyard::plan::FeatureUpdate;
use std::io::Read;
use std::path::Path;

use super::super::FeatureCommands;
use super::{Reply, data};

/// Read a plan from `file`, or stdin when absent. Accepts a bare array of
/// features or an object with a `features` array.
fn read_specs(file: Option<&Path>) -> Result<Vec<FeatureSpec>> {
    let content = match file {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read feature plan: {}", path.display()))?,
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("Failed to read feature plan from stdin")?;
            buf
        }
    };
    let value: Value = serde_json::from_str(&content)
        .map_err(|e| ShipyardError::InvalidInput(format!("feature plan is not valid JSON: {e}")))?;
    let features = match value {
        Value::Object(mut map) => map.remove("features").unwrap_or(Value::Null),
        other => other,
    };
    serde_json::from_value(features)
        .map_err(|e| ShipyardError::InvalidInput(format!("feature plan must be an array of features: {e}")))
}

fn read_spec(path: &Path) -> Result<FeatureSpec> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read feature: {}", path.display()))?;
    serde_json::from_str(&content)
        .map_err(|e| ShipyardError::InvalidInput(format!("{} is not a feature: {e}", path.display())))
}

pub async fn cmd_feature(
    orchestrator: &Orchestrator,
    slot: &str,
    owner: Option<&str>,
    command: &FeatureCommands,
) -> Result<Reply> {
    let now = Utc::now();
    match command {
        FeatureCommands::Create { file } => {
            let specs = read_specs(file.as_deref())?;
            data(&orchestrator.feature_create(slot, owner, &specs, now)?)
        }
        FeatureCommands::List => data(&orchestrator.feature_list(slot, owner, now)?),
        FeatureCommands::Next => data(&orchestrator.feature_next(slot, owner, now)?),
        FeatureCommands::Verify { index, fix } => {
            data(&orchestrator.feature_verify(slot, owner, *index, *fix, now).await?)
        }
        FeatureCommands::Done {
            index,
            branch,
            pr,
            force,
        } => data(&orchestrator.feature_done(slot, owner, *index, branch.clone(), pr.clone(), *force, now)?),
        FeatureCommands::Update {
            index,
            status,
            task,
            insert_after,
            move_to,
        } => {
            let update = match (status, task, insert_after, move_to) {
                (Some(status), None, None, None) => FeatureUpdate::Status(*status),
                (None, Some(task), None, None) => FeatureUpdate::Task(task.clone()),
                (None, None, Some(path), None) => FeatureUpdate::InsertAfter(read_spec(path)?),
                (None, None, None, Some(position)) => FeatureUpdate::MoveTo(*position),
                _ => {
                    return Err(ShipyardError::InvalidInput(
                        "feature update takes exactly one of --status, --task, --insert-after, --move-to"
                            .to_string(),
                    ));
                }
            };
            data(&orchestrator.feature_update(slot, owner, *index, update, now)?)
        }
    }
}
