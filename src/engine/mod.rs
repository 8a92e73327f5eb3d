//! Code-generation engine capability.
//!
//! An engine receives a working tree, a task, and accumulated context, and
//! answers with a summary, the files it changed, and (during analysis) a
//! complexity classification plus an optional feature decomposition.
//! Engines are selected by key from `[engines.<key>]` in `shipyard.toml`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shipyard_common::{Complexity, FeatureSpec};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::{EngineSection, ShipyardToml};
use crate::errors::{Result, ShipyardError};
use crate::util::{json_objects, tail_chars};

/// Why the engine is being called.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineTask {
    Analyze,
    Develop,
    Fix,
    Assert,
}

impl std::fmt::Display for EngineTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EngineTask::Analyze => "analyze",
            EngineTask::Develop => "develop",
            EngineTask::Fix => "fix",
            EngineTask::Assert => "assert",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct EngineRequest {
    pub purpose: EngineTask,
    pub working_dir: PathBuf,
    pub prompt: String,
}

/// Parsed engine reply. Every field is optional on the wire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineResponse {
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub changed_files: Vec<String>,
    #[serde(default)]
    pub complexity: Option<Complexity>,
    #[serde(default)]
    pub features: Vec<FeatureSpec>,
    /// Verdict for structural assertions.
    #[serde(default)]
    pub satisfied: Option<bool>,
}

impl EngineResponse {
    const KEYS: [&'static str; 5] = ["summary", "changed_files", "complexity", "features", "satisfied"];

    /// The last JSON object in the output carrying a response field wins;
    /// without one the output becomes the summary.
    pub fn parse(output: &str) -> Self {
        for json in json_objects(output).into_iter().rev() {
            let Ok(serde_json::Value::Object(map)) = serde_json::from_str::<serde_json::Value>(json) else {
                continue;
            };
            if !Self::KEYS.iter().any(|key| map.contains_key(*key)) {
                continue;
            }
            match serde_json::from_value::<EngineResponse>(serde_json::Value::Object(map)) {
                Ok(response) => return response,
                Err(e) => debug!(error = %e, "engine output JSON did not match the response shape"),
            }
        }
        Self {
            summary: tail_chars(output.trim(), 4000),
            ..Self::default()
        }
    }
}

/// Pluggable code-generation engine.
#[async_trait]
pub trait CodeEngine: Send + Sync {
    fn id(&self) -> &str;

    async fn run(&self, request: &EngineRequest) -> Result<EngineResponse>;
}

/// Engine backed by an external CLI; the prompt goes on stdin.
pub struct CliEngine {
    id: String,
    section: EngineSection,
}

impl CliEngine {
    pub fn new(id: &str, section: EngineSection) -> Self {
        Self {
            id: id.to_string(),
            section,
        }
    }

    /// Look up an engine by key, including the built-ins.
    pub fn from_config(config: &ShipyardToml, key: &str) -> Result<Self> {
        let section = config
            .engine(key)
            .ok_or_else(|| ShipyardError::not_found("engine", key))?;
        Ok(Self::new(key, section))
    }

    fn args(&self) -> Vec<String> {
        let mut args = self.section.args.clone();
        if let Some(flag) = &self.section.allow_list_flag
            && !self.section.allowed_tools.is_empty()
        {
            args.push(flag.clone());
            args.push(self.section.allowed_tools.join(","));
        }
        args
    }

    fn engine_error(&self, message: impl Into<String>) -> ShipyardError {
        ShipyardError::EngineError {
            engine: self.id.clone(),
            message: message.into(),
        }
    }
}

#[async_trait]
impl CodeEngine for CliEngine {
    fn id(&self) -> &str {
        &self.id
    }

    async fn run(&self, request: &EngineRequest) -> Result<EngineResponse> {
        let args = self.args();
        info!(
            engine = %self.id,
            purpose = %request.purpose,
            dir = %request.working_dir.display(),
            "running engine"
        );

        let mut child = Command::new(&self.section.command)
            .args(&args)
            .current_dir(&request.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| self.engine_error(format!("failed to spawn '{}': {e}", self.section.command)))?;

        if let Some(mut stdin) = child.stdin.take() {
            let written = async {
                stdin.write_all(request.prompt.as_bytes()).await?;
                stdin.shutdown().await
            }
            .await;
            if let Err(e) = written {
                // The engine may legitimately exit without reading everything.
                if e.kind() != std::io::ErrorKind::BrokenPipe {
                    return Err(self.engine_error(format!("failed to write prompt: {e}")));
                }
            }
        }

        let limit = Duration::from_secs(self.section.timeout_secs);
        let output = match timeout(limit, child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| self.engine_error(format!("failed to wait: {e}")))?,
            Err(_) => {
                warn!(engine = %self.id, seconds = self.section.timeout_secs, "engine timed out");
                return Err(ShipyardError::EngineTimeout {
                    engine: self.id.clone(),
                    seconds: self.section.timeout_secs,
                });
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let detail = if stderr.trim().is_empty() { stdout } else { stderr };
            return Err(self.engine_error(format!(
                "exit code {}: {}",
                output.status.code().unwrap_or(-1),
                tail_chars(detail.trim(), 2000)
            )));
        }

        let response = EngineResponse::parse(&stdout);
        debug!(
            engine = %self.id,
            changed_files = response.changed_files.len(),
            "engine finished"
        );
        Ok(response)
    }
}

/// Resolves an engine key to a runnable engine.
pub trait EngineFactory: Send + Sync {
    fn engine(&self, key: &str) -> Result<Arc<dyn CodeEngine>>;
}

/// Engines declared in `shipyard.toml` plus the built-ins.
pub struct ConfiguredEngines {
    config: ShipyardToml,
}

impl ConfiguredEngines {
    pub fn new(config: ShipyardToml) -> Self {
        Self { config }
    }
}

impl EngineFactory for ConfiguredEngines {
    fn engine(&self, key: &str) -> Result<Arc<dyn CodeEngine>> {
        Ok(Arc::new(CliEngine::from_config(&self.config, key)?))
    }
}
