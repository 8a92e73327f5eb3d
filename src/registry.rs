//! Catalog of repositories, workspace slots, and read-only environments.
//!
//! Stored as `{home}/registry.toml`. Each entry is either a scalar (minimal
//! form) or a table (extended form):
//!
//! ```toml
//! [repositories]
//! demo = "git@github.com:org/demo.git"
//!
//! [repositories.api]
//! url = "git@github.com:org/api.git"
//! default_branch = "develop"
//! test_command = "make test"
//!
//! [workspaces]
//! env0 = "/srv/shipyard/env0"
//!
//! [environments]
//! staging = "deploy@staging.internal"
//! ```
//!
//! Setting any field beyond the scalar upgrades a minimal entry to the
//! extended form. Every write goes through a temp file and a rename. The file
//! is read fresh for every command, so nothing here needs locking.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use toml::{Table, Value};
use tracing::{debug, info};

use crate::errors::{Result, ShipyardError};
use crate::util::write_atomic;

pub const DEFAULT_BRANCH: &str = "main";
pub const DEFAULT_BRANCH_PREFIX: &str = "shipyard/";

const DEFAULT_ALLOWED_COMMANDS: &[&str] = &[
    "uptime",
    "ps",
    "tail",
    "journalctl",
    "df",
    "free",
    "ls",
    "cat",
    "grep",
    "systemctl",
];

const DEFAULT_PROBE_COMMANDS: &[&str] = &["uptime", "df -h", "free -m"];

const DEFAULT_ERROR_PATTERN: &str = r"(?i)\b(error|panic|fatal|exception)\b";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Repository,
    Workspace,
    Environment,
}

impl EntryKind {
    fn table(&self) -> &'static str {
        match self {
            EntryKind::Repository => "repositories",
            EntryKind::Workspace => "workspaces",
            EntryKind::Environment => "environments",
        }
    }

    /// Key the scalar of a minimal entry becomes when upgraded.
    fn primary_key(&self) -> &'static str {
        match self {
            EntryKind::Repository => "url",
            EntryKind::Workspace => "path",
            EntryKind::Environment => "host",
        }
    }

    fn allowed_keys(&self) -> &'static [&'static str] {
        match self {
            EntryKind::Repository => &[
                "url",
                "default_branch",
                "test_command",
                "lint_command",
                "branch_prefix",
            ],
            EntryKind::Workspace => &["path"],
            EntryKind::Environment => &[
                "host",
                "port",
                "log_paths",
                "probe_commands",
                "allowed_commands",
                "error_patterns",
            ],
        }
    }

    fn is_list_key(key: &str) -> bool {
        matches!(
            key,
            "log_paths" | "probe_commands" | "allowed_commands" | "error_patterns"
        )
    }
}

impl std::fmt::Display for EntryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntryKind::Repository => write!(f, "repository"),
            EntryKind::Workspace => write!(f, "workspace"),
            EntryKind::Environment => write!(f, "environment"),
        }
    }
}

impl std::str::FromStr for EntryKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "repository" | "repositories" | "repo" => Ok(EntryKind::Repository),
            "workspace" | "workspaces" | "slot" => Ok(EntryKind::Workspace),
            "environment" | "environments" | "env" => Ok(EntryKind::Environment),
            _ => anyhow::bail!(
                "Invalid registry kind '{}'. Valid values: repository, workspace, environment",
                s
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RepositoryConfig {
    pub name: String,
    pub remote_url: String,
    pub default_branch: String,
    pub test_command: Option<String>,
    pub lint_command: Option<String>,
    pub branch_prefix: Option<String>,
}

impl RepositoryConfig {
    pub fn branch_prefix(&self) -> &str {
        self.branch_prefix.as_deref().unwrap_or(DEFAULT_BRANCH_PREFIX)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkspaceSlot {
    pub name: String,
    pub root_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnvironmentConfig {
    pub name: String,
    pub host: String,
    pub port: Option<u16>,
    pub log_paths: Vec<String>,
    pub probe_commands: Vec<String>,
    pub allowed_commands: Vec<String>,
    pub error_patterns: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RepositoryEntry {
    url: String,
    #[serde(default)]
    default_branch: Option<String>,
    #[serde(default)]
    test_command: Option<String>,
    #[serde(default)]
    lint_command: Option<String>,
    #[serde(default)]
    branch_prefix: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct WorkspaceEntry {
    path: String,
}

#[derive(Debug, Default, Deserialize)]
struct EnvironmentEntry {
    host: String,
    #[serde(default)]
    port: Option<u16>,
    #[serde(default)]
    log_paths: Vec<String>,
    #[serde(default)]
    probe_commands: Option<Vec<String>>,
    #[serde(default)]
    allowed_commands: Option<Vec<String>>,
    #[serde(default)]
    error_patterns: Option<Vec<String>>,
}

/// Everything registered, in name order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RegistryListing {
    pub repositories: Vec<RepositoryConfig>,
    pub workspaces: Vec<WorkspaceSlot>,
    pub environments: Vec<EnvironmentConfig>,
}

pub struct Registry {
    path: PathBuf,
    doc: Table,
}

impl Registry {
    /// Load the registry; a missing file is an empty registry.
    pub fn load(path: &Path) -> Result<Self> {
        let doc = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read registry: {}", path.display()))?;
            toml::from_str::<Table>(&content)
                .with_context(|| format!("Failed to parse registry: {}", path.display()))?
        } else {
            Table::new()
        };
        debug!(path = %path.display(), "registry loaded");
        Ok(Self {
            path: path.to_path_buf(),
            doc,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn save(&self) -> Result<()> {
        let content = toml::to_string_pretty(&self.doc).context("Failed to serialize registry")?;
        write_atomic(&self.path, content.as_bytes())?;
        Ok(())
    }

    fn section(&self, kind: EntryKind) -> Option<&Table> {
        self.doc.get(kind.table()).and_then(Value::as_table)
    }

    fn section_mut(&mut self, kind: EntryKind) -> Result<&mut Table> {
        let value = self
            .doc
            .entry(kind.table().to_string())
            .or_insert_with(|| Value::Table(Table::new()));
        value.as_table_mut().ok_or_else(|| {
            ShipyardError::InvalidInput(format!(
                "registry section [{}] is not a table",
                kind.table()
            ))
        })
    }

    fn entry(&self, kind: EntryKind, name: &str) -> Result<&Value> {
        self.section(kind)
            .and_then(|s| s.get(name))
            .ok_or_else(|| ShipyardError::not_found(&kind.to_string(), name))
    }

    fn names(&self, kind: EntryKind) -> Vec<String> {
        // toml::Table is ordered by key, which gives the stable scan order.
        self.section(kind)
            .map(|s| s.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn list(&self) -> Result<RegistryListing> {
        Ok(RegistryListing {
            repositories: self
                .names(EntryKind::Repository)
                .iter()
                .map(|n| self.repository(n))
                .collect::<Result<_>>()?,
            workspaces: self.workspaces()?,
            environments: self
                .names(EntryKind::Environment)
                .iter()
                .map(|n| self.environment(n))
                .collect::<Result<_>>()?,
        })
    }

    pub fn add(&mut self, kind: EntryKind, name: &str, value: &str) -> Result<()> {
        validate_name(name)?;
        if value.trim().is_empty() {
            return Err(ShipyardError::InvalidInput(format!(
                "{kind} '{name}' needs a non-empty {}",
                kind.primary_key()
            )));
        }
        let section = self.section_mut(kind)?;
        if section.contains_key(name) {
            return Err(ShipyardError::DuplicateName {
                entity: kind.to_string(),
                name: name.to_string(),
            });
        }
        section.insert(name.to_string(), Value::String(value.trim().to_string()));
        self.save()?;
        info!(%kind, name, "registry entry added");
        Ok(())
    }

    /// Set one field, upgrading a minimal entry to the extended form when
    /// the field is not the scalar itself.
    pub fn set_field(&mut self, kind: EntryKind, name: &str, key: &str, value: &str) -> Result<()> {
        if !kind.allowed_keys().contains(&key) {
            return Err(ShipyardError::InvalidInput(format!(
                "unknown {kind} field '{key}'. Valid fields: {}",
                kind.allowed_keys().join(", ")
            )));
        }
        let typed = typed_value(key, value)?;
        let primary = kind.primary_key();
        let section = self.section_mut(kind)?;
        let entry = section
            .get_mut(name)
            .ok_or_else(|| ShipyardError::not_found(&kind.to_string(), name))?;

        match entry {
            Value::String(_) if key == primary => {
                *entry = typed;
            }
            Value::String(scalar) => {
                let mut table = Table::new();
                table.insert(primary.to_string(), Value::String(scalar.clone()));
                table.insert(key.to_string(), typed);
                *entry = Value::Table(table);
                debug!(%kind, name, "registry entry upgraded to extended form");
            }
            Value::Table(table) => {
                table.insert(key.to_string(), typed);
            }
            _ => {
                return Err(ShipyardError::InvalidInput(format!(
                    "{kind} '{name}' has an unsupported representation"
                )));
            }
        }
        self.save()?;
        info!(%kind, name, key, "registry field set");
        Ok(())
    }

    pub fn remove(&mut self, kind: EntryKind, name: &str) -> Result<()> {
        let section = self.section_mut(kind)?;
        if section.remove(name).is_none() {
            return Err(ShipyardError::not_found(&kind.to_string(), name));
        }
        self.save()?;
        info!(%kind, name, "registry entry removed");
        Ok(())
    }

    pub fn repository(&self, name: &str) -> Result<RepositoryConfig> {
        let entry: RepositoryEntry = match self.entry(EntryKind::Repository, name)? {
            Value::String(url) => RepositoryEntry {
                url: url.clone(),
                ..RepositoryEntry::default()
            },
            other => decode(EntryKind::Repository, name, other)?,
        };
        Ok(RepositoryConfig {
            name: name.to_string(),
            remote_url: entry.url,
            default_branch: entry
                .default_branch
                .unwrap_or_else(|| DEFAULT_BRANCH.to_string()),
            test_command: entry.test_command,
            lint_command: entry.lint_command,
            branch_prefix: entry.branch_prefix,
        })
    }

    pub fn workspace(&self, name: &str) -> Result<WorkspaceSlot> {
        let entry: WorkspaceEntry = match self.entry(EntryKind::Workspace, name)? {
            Value::String(path) => WorkspaceEntry { path: path.clone() },
            other => decode(EntryKind::Workspace, name, other)?,
        };
        Ok(WorkspaceSlot {
            name: name.to_string(),
            root_path: expand_home(&entry.path),
        })
    }

    /// All slots in stable (name) order.
    pub fn workspaces(&self) -> Result<Vec<WorkspaceSlot>> {
        self.names(EntryKind::Workspace)
            .iter()
            .map(|n| self.workspace(n))
            .collect()
    }

    pub fn environment(&self, name: &str) -> Result<EnvironmentConfig> {
        let entry: EnvironmentEntry = match self.entry(EntryKind::Environment, name)? {
            Value::String(host) => EnvironmentEntry {
                host: host.clone(),
                ..EnvironmentEntry::default()
            },
            other => decode(EntryKind::Environment, name, other)?,
        };
        Ok(EnvironmentConfig {
            name: name.to_string(),
            host: entry.host,
            port: entry.port,
            log_paths: entry.log_paths,
            probe_commands: entry
                .probe_commands
                .unwrap_or_else(|| to_strings(DEFAULT_PROBE_COMMANDS)),
            allowed_commands: entry
                .allowed_commands
                .unwrap_or_else(|| to_strings(DEFAULT_ALLOWED_COMMANDS)),
            error_patterns: entry
                .error_patterns
                .unwrap_or_else(|| vec![DEFAULT_ERROR_PATTERN.to_string()]),
        })
    }

    /// Find the slot whose root contains `path`, if any.
    pub fn slot_for_path(&self, path: &Path) -> Result<Option<WorkspaceSlot>> {
        Ok(self
            .workspaces()?
            .into_iter()
            .find(|slot| path.starts_with(&slot.root_path)))
    }
}

fn decode<T: serde::de::DeserializeOwned>(kind: EntryKind, name: &str, value: &Value) -> Result<T> {
    value.clone().try_into::<T>().map_err(|e| {
        ShipyardError::InvalidInput(format!("{kind} '{name}' is malformed in the registry: {e}"))
    })
}

fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(ShipyardError::InvalidInput(format!(
            "invalid name '{name}': use letters, digits, '-', '_' or '.'"
        )))
    }
}

fn typed_value(key: &str, value: &str) -> Result<Value> {
    if EntryKind::is_list_key(key) {
        let items = value
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| Value::String(s.to_string()))
            .collect();
        return Ok(Value::Array(items));
    }
    if key == "port" {
        let port: u16 = value
            .trim()
            .parse()
            .map_err(|_| ShipyardError::InvalidInput(format!("port must be 1-65535, got '{value}'")))?;
        return Ok(Value::Integer(i64::from(port)));
    }
    Ok(Value::String(value.trim().to_string()))
}

fn to_strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = dirs::home_dir()
    {
        return home.join(rest);
    }
    PathBuf::from(path)
}
