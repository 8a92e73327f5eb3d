//! `shipyard registry ...`: catalog edits. None of these touch a lease.

use serde_json::json;
use shipyard::config::Config;
use shipyard::errors::Result;
use shipyard::registry::Registry;

use super::super::RegistryCommands;
use super::{Reply, data};

pub fn cmd_registry(config: &Config, command: &RegistryCommands) -> Result<Reply> {
    let mut registry = Registry::load(&config.registry_file)?;
    match command {
        RegistryCommands::List => data(&registry.list()?),
        RegistryCommands::Add { kind, name, value } => {
            registry.add(*kind, name, value)?;
            data(&json!({ "kind": kind, "name": name, "added": true }))
        }
        RegistryCommands::Set {
            kind,
            name,
            key,
            value,
        } => {
            registry.set_field(*kind, name, key, value)?;
            data(&json!({ "kind": kind, "name": name, "key": key, "value": value }))
        }
        RegistryCommands::Remove { kind, name } => {
            registry.remove(*kind, name)?;
            data(&json!({ "kind": kind, "name": name, "removed": true }))
        }
    }
}
