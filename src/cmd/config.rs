//! Configuration view and validation commands: `shipyard config`.

use serde_json::json;
use shipyard::config::Config;
use shipyard::errors::Result;

use super::super::ConfigCommands;
use super::{Reply, data};

pub fn cmd_config(config: &Config, command: Option<ConfigCommands>) -> Result<Reply> {
    match command {
        None | Some(ConfigCommands::Show) => data(&json!({
            "home": config.home,
            "config_file": config.config_file,
            "config_file_exists": config.config_file.exists(),
            "registry_file": config.registry_file,
            // Effective values, after environment overrides.
            "lease_duration_minutes": config.lease_duration.num_minutes(),
            "default_engine": config.default_engine,
            "owner": config.owner,
            "engines": config.toml.engine_keys(),
            "file": config.toml,
        })),
        Some(ConfigCommands::Validate) => {
            let mut warnings = config.toml.validate();
            if config.default_engine != config.toml.defaults.engine
                && config.toml.engine(&config.default_engine).is_none()
            {
                warnings.push(format!(
                    "SHIPYARD_ENGINE '{}' is not a known engine",
                    config.default_engine
                ));
            }
            data(&json!({
                "config_file": config.config_file,
                "valid": warnings.is_empty(),
                "warnings": warnings,
            }))
        }
    }
}
