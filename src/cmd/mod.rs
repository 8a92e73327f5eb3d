//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module      | Commands handled                                         |
//! |-------------|----------------------------------------------------------|
//! | `registry`  | `Registry`                                               |
//! | `config`    | `Config`                                                 |
//! | `workspace` | `Acquire`, `Status`, `Renew`, `Search`, `Release`        |
//! | `phase`     | `ProbeEnv`, `Analyze`, `Confirm`, `Develop`, `Test`,     |
//! |             | `Submit`, `VerifyEnv`, `Accept`                          |
//! | `feature`   | `Feature`                                                |

pub mod config;
pub mod feature;
pub mod phase;
pub mod registry;
pub mod workspace;

use anyhow::Context;
use serde::Serialize;
use serde_json::Value;
use shipyard::config::Config;
use shipyard::errors::Result;
use shipyard::orchestrator::Orchestrator;

use super::{Cli, Commands};

/// What a command hands back to `main` for printing.
pub enum Reply {
    /// Wrapped in the JSON result envelope.
    Data(Value),
    /// Printed as-is (`status --pretty`).
    Text(String),
}

pub fn data<T: Serialize>(value: &T) -> Result<Reply> {
    Ok(Reply::Data(
        serde_json::to_value(value).context("Failed to serialize command result")?,
    ))
}

/// The slot a phase command targets.
fn target_slot(orchestrator: &Orchestrator, cli: &Cli) -> Result<String> {
    let cwd = std::env::current_dir().ok();
    orchestrator.resolve_slot(cli.slot.as_deref(), cwd.as_deref())
}

pub async fn dispatch(cli: &Cli, config: Config) -> Result<Reply> {
    match &cli.command {
        Commands::Registry { command } => registry::cmd_registry(&config, command),
        Commands::Config { command } => config::cmd_config(&config, command.clone()),
        Commands::Acquire {
            repos,
            task,
            engine,
            environment,
            auto_clean,
        } => {
            let orchestrator = Orchestrator::load(config)?;
            workspace::cmd_acquire(
                &orchestrator,
                cli,
                workspace::AcquireArgs {
                    repos,
                    task,
                    engine: engine.as_deref(),
                    environment: environment.as_deref(),
                    auto_clean: *auto_clean,
                },
            )
            .await
        }
        Commands::Status { pretty } => {
            let orchestrator = Orchestrator::load(config)?;
            workspace::cmd_status(&orchestrator, cli.slot.as_deref(), *pretty)
        }
        Commands::Search {
            repository,
            pattern,
            limit,
        } => {
            let orchestrator = Orchestrator::load(config)?;
            workspace::cmd_search(&orchestrator, cli.slot.as_deref(), repository, pattern, *limit)
        }
        Commands::Renew => {
            let orchestrator = Orchestrator::load(config)?;
            let slot = target_slot(&orchestrator, cli)?;
            workspace::cmd_renew(&orchestrator, &slot, cli.owner.as_deref())
        }
        Commands::Release { cleanup } => {
            let orchestrator = Orchestrator::load(config)?;
            let slot = target_slot(&orchestrator, cli)?;
            workspace::cmd_release(&orchestrator, &slot, cli.owner.as_deref(), *cleanup).await
        }
        Commands::Feature { command } => {
            let orchestrator = Orchestrator::load(config)?;
            let slot = target_slot(&orchestrator, cli)?;
            feature::cmd_feature(&orchestrator, &slot, cli.owner.as_deref(), command).await
        }
        command => {
            let orchestrator = Orchestrator::load(config)?;
            let slot = target_slot(&orchestrator, cli)?;
            phase::cmd_phase(&orchestrator, &slot, cli.owner.as_deref(), command).await
        }
    }
}
