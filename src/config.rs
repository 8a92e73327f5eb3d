//! Runtime configuration.
//!
//! Settings live in `{home}/shipyard.toml`, layered file → environment → CLI.
//! The repository/slot/environment catalog is separate (see
//! [`crate::registry`]) because it is edited through its own CRUD path.
//!
//! # Configuration File Format
//!
//! ```toml
//! [lease]
//! duration_minutes = 120
//!
//! [defaults]
//! engine = "claude"
//! max_test_fix_rounds = 2
//! max_verify_attempts = 3
//! check_timeout_secs = 1200
//!
//! [engines.claude]
//! command = "claude"
//! args = ["--print"]
//! timeout_secs = 1800
//! allowed_tools = ["Read", "Edit", "Write", "Bash"]
//! allow_list_flag = "--allowedTools"
//!
//! [logging]
//! file = true
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const CONFIG_FILE: &str = "shipyard.toml";
pub const REGISTRY_FILE: &str = "registry.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseSection {
    #[serde(default = "default_lease_minutes")]
    pub duration_minutes: i64,
}

fn default_lease_minutes() -> i64 {
    120
}

impl Default for LeaseSection {
    fn default() -> Self {
        Self {
            duration_minutes: default_lease_minutes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsSection {
    /// Engine key used when `acquire` is not given one.
    #[serde(default = "default_engine")]
    pub engine: String,
    /// Automatic fix/retest rounds after a test failure.
    #[serde(default = "default_max_test_fix_rounds")]
    pub max_test_fix_rounds: u32,
    /// Failed verifications before a feature is flagged for escalation.
    #[serde(default = "default_max_verify_attempts")]
    pub max_verify_attempts: u32,
    #[serde(default = "default_check_timeout_secs")]
    pub check_timeout_secs: u64,
    #[serde(default)]
    pub owner: Option<String>,
}

fn default_engine() -> String {
    "claude".to_string()
}

fn default_max_test_fix_rounds() -> u32 {
    2
}

fn default_max_verify_attempts() -> u32 {
    3
}

fn default_check_timeout_secs() -> u64 {
    20 * 60
}

impl Default for DefaultsSection {
    fn default() -> Self {
        Self {
            engine: default_engine(),
            max_test_fix_rounds: default_max_test_fix_rounds(),
            max_verify_attempts: default_max_verify_attempts(),
            check_timeout_secs: default_check_timeout_secs(),
            owner: None,
        }
    }
}

/// How to invoke one code-generation engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSection {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_engine_timeout_secs")]
    pub timeout_secs: u64,
    /// Tools the engine may use; passed through, never enforced here.
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    /// Flag that introduces the comma-separated allow-list.
    #[serde(default)]
    pub allow_list_flag: Option<String>,
}

fn default_engine_timeout_secs() -> u64 {
    30 * 60
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingSection {
    /// Also write a daily log file under `{home}/logs/`.
    #[serde(default)]
    pub file: bool,
}

/// Engines available without any configuration: engine A and engine B.
pub fn builtin_engines() -> BTreeMap<String, EngineSection> {
    let mut engines = BTreeMap::new();
    engines.insert(
        "claude".to_string(),
        EngineSection {
            command: "claude".to_string(),
            args: vec!["--print".to_string()],
            timeout_secs: default_engine_timeout_secs(),
            allowed_tools: ["Read", "Edit", "Write", "Glob", "Grep", "Bash"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            allow_list_flag: Some("--allowedTools".to_string()),
        },
    );
    engines.insert(
        "codex".to_string(),
        EngineSection {
            command: "codex".to_string(),
            args: vec!["exec".to_string(), "-".to_string()],
            timeout_secs: default_engine_timeout_secs(),
            allowed_tools: Vec::new(),
            allow_list_flag: None,
        },
    );
    engines
}

/// The complete `shipyard.toml` structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShipyardToml {
    #[serde(default)]
    pub lease: LeaseSection,
    #[serde(default)]
    pub defaults: DefaultsSection,
    #[serde(default)]
    pub engines: BTreeMap<String, EngineSection>,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl ShipyardToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse shipyard.toml")
    }

    /// Defaults when the file does not exist.
    pub fn load_or_default(home: &Path) -> Result<Self> {
        let path = home.join(CONFIG_FILE);
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Configured engine, falling back to the built-in definition.
    pub fn engine(&self, key: &str) -> Option<EngineSection> {
        self.engines
            .get(key)
            .cloned()
            .or_else(|| builtin_engines().remove(key))
    }

    pub fn engine_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = builtin_engines().into_keys().collect();
        for key in self.engines.keys() {
            if !keys.contains(key) {
                keys.push(key.clone());
            }
        }
        keys
    }

    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.lease.duration_minutes <= 0 {
            warnings.push(format!(
                "lease.duration_minutes must be positive, got {}",
                self.lease.duration_minutes
            ));
        }
        if self.engine(&self.defaults.engine).is_none() {
            warnings.push(format!(
                "defaults.engine '{}' is not defined under [engines]",
                self.defaults.engine
            ));
        }
        for (key, engine) in &self.engines {
            if engine.command.trim().is_empty() {
                warnings.push(format!("engines.{key}.command is empty"));
            }
            if !engine.allowed_tools.is_empty() && engine.allow_list_flag.is_none() {
                warnings.push(format!(
                    "engines.{key}.allowed_tools is set but allow_list_flag is missing; the list is not passed"
                ));
            }
        }
        warnings
    }
}

/// Resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub home: PathBuf,
    pub registry_file: PathBuf,
    pub config_file: PathBuf,
    pub log_dir: PathBuf,
    pub toml: ShipyardToml,
    pub lease_duration: chrono::Duration,
    pub default_engine: String,
    pub owner: String,
}

impl Config {
    /// `SHIPYARD_HOME`, else `~/.shipyard`.
    pub fn default_home() -> PathBuf {
        if let Ok(home) = std::env::var("SHIPYARD_HOME")
            && !home.trim().is_empty()
        {
            return PathBuf::from(home);
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".shipyard")
    }

    /// Load `shipyard.toml` from `home` and apply environment overrides.
    pub fn load(home: Option<PathBuf>) -> Result<Self> {
        let home = home.unwrap_or_else(Self::default_home);
        let toml = ShipyardToml::load_or_default(&home)?;

        let lease_minutes = match std::env::var("SHIPYARD_LEASE_MINUTES") {
            Ok(v) => v
                .parse::<i64>()
                .with_context(|| format!("SHIPYARD_LEASE_MINUTES is not a number: {v}"))?,
            Err(_) => toml.lease.duration_minutes,
        };
        if lease_minutes <= 0 {
            anyhow::bail!("Lease duration must be positive, got {} minutes", lease_minutes);
        }

        let default_engine =
            std::env::var("SHIPYARD_ENGINE").unwrap_or_else(|_| toml.defaults.engine.clone());
        let owner = std::env::var("SHIPYARD_OWNER")
            .ok()
            .or_else(|| toml.defaults.owner.clone())
            .or_else(|| std::env::var("USER").ok())
            .unwrap_or_else(|| "shipyard".to_string());

        Ok(Self {
            registry_file: home.join(REGISTRY_FILE),
            config_file: home.join(CONFIG_FILE),
            log_dir: home.join("logs"),
            home,
            toml,
            lease_duration: chrono::Duration::minutes(lease_minutes),
            default_engine,
            owner,
        })
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.home)
            .with_context(|| format!("Failed to create {}", self.home.display()))?;
        if self.toml.logging.file {
            std::fs::create_dir_all(&self.log_dir)
                .context("Failed to create log directory")?;
        }
        Ok(())
    }

    pub fn max_test_fix_rounds(&self) -> u32 {
        self.toml.defaults.max_test_fix_rounds
    }

    pub fn max_verify_attempts(&self) -> u32 {
        self.toml.defaults.max_verify_attempts
    }

    pub fn check_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.toml.defaults.check_timeout_secs)
    }
}
